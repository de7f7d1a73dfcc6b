//! Catalog of host workflows and the remote commands behind them.
//!
//! Only `ollama` and `vllm` have runnable actions. Every other catalog entry
//! is listed so operators can see what exists, and fails with "not yet
//! implemented" when run.

use crate::services::ssh_service::RemoteExecutor;
use crate::utils::error::{DgxError, Result};
use crate::utils::shell::shell_quote;

pub const CATEGORY_INFERENCE: &str = "Inference & Serving";
pub const CATEGORY_FINE_TUNING: &str = "Fine-tuning & Training";
pub const CATEGORY_DEVELOPMENT: &str = "Development Tools";

/// Categories in display order
pub const CATEGORIES: [&str; 3] = [CATEGORY_INFERENCE, CATEGORY_FINE_TUNING, CATEGORY_DEVELOPMENT];

const VLLM_IMAGE: &str = "nvcr.io/nvidia/vllm:25.09-py3";
const VLLM_CONTAINER: &str = "vllm-server";

/// A catalog entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Playbook {
    pub name: &'static str,
    pub description: &'static str,
    pub category: &'static str,
    pub runnable: bool,
}

const fn entry(
    name: &'static str,
    description: &'static str,
    category: &'static str,
    runnable: bool,
) -> Playbook {
    Playbook {
        name,
        description,
        category,
        runnable,
    }
}

pub const CATALOG: &[Playbook] = &[
    entry("ollama", "Lightweight local model runner", CATEGORY_INFERENCE, true),
    entry("vllm", "Optimized LLM inference engine", CATEGORY_INFERENCE, true),
    entry("trt-llm", "TensorRT LLM for efficient inference", CATEGORY_INFERENCE, false),
    entry("nim", "NVIDIA Inference Microservices", CATEGORY_INFERENCE, false),
    entry(
        "speculative-decoding",
        "Faster inference with speculative decoding",
        CATEGORY_INFERENCE,
        false,
    ),
    entry("nvfp4", "4-bit FP quantization for Blackwell GPUs", CATEGORY_FINE_TUNING, false),
    entry("llama-factory", "LLaMA model fine-tuning toolkit", CATEGORY_FINE_TUNING, false),
    entry("unsloth", "Fast fine-tuning optimization", CATEGORY_FINE_TUNING, false),
    entry("nemo", "NVIDIA NeMo fine-tuning framework", CATEGORY_FINE_TUNING, false),
    entry("vscode", "VS Code setup for the host", CATEGORY_DEVELOPMENT, false),
    entry("jupyter", "JupyterLab environment", CATEGORY_DEVELOPMENT, false),
    entry("comfyui", "Node-based image generation UI", CATEGORY_DEVELOPMENT, false),
    entry("open-webui", "Web interface for local models", CATEGORY_DEVELOPMENT, false),
];

pub fn find(name: &str) -> Option<&'static Playbook> {
    CATALOG.iter().find(|p| p.name == name)
}

pub fn in_category(category: &str) -> impl Iterator<Item = &'static Playbook> + '_ {
    CATALOG.iter().filter(move |p| p.category == category)
}

/// One remote command of a playbook
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybookStep {
    /// Shown before the command runs
    pub summary: String,
    pub command: String,
    /// Appended to the output on success
    pub next_steps: Option<String>,
    /// Set for status checks: a failing or silent command means "not running"
    /// and this text is reported instead of an error
    pub when_idle: Option<String>,
}

impl PlaybookStep {
    fn new(summary: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            command: command.into(),
            next_steps: None,
            when_idle: None,
        }
    }

    fn next_steps(mut self, text: impl Into<String>) -> Self {
        self.next_steps = Some(text.into());
        self
    }

    fn when_idle(mut self, text: impl Into<String>) -> Self {
        self.when_idle = Some(text.into());
        self
    }
}

/// Resolve `dgx playbook run <name> <args...>` to a remote command
pub fn plan(name: &str, args: &[String]) -> Result<PlaybookStep> {
    let playbook = find(name)
        .ok_or_else(|| DgxError::Playbook(format!("playbook not found: {}", name)))?;

    match playbook.name {
        "ollama" => plan_ollama(args),
        "vllm" => plan_vllm(args),
        other => Err(DgxError::Playbook(format!(
            "playbook '{}' is not yet implemented",
            other
        ))),
    }
}

fn plan_ollama(args: &[String]) -> Result<PlaybookStep> {
    let usage = "usage: dgx playbook run ollama <install|pull|list|serve|status|run>";
    let (action, rest) = args
        .split_first()
        .ok_or_else(|| DgxError::Playbook(format!("ollama action required; {}", usage)))?;

    let step = match action.as_str() {
        "install" => PlaybookStep::new(
            "Installing Ollama",
            "curl -fsSL https://ollama.com/install.sh | sh",
        ),
        "pull" => {
            let model = required(rest.first(), "dgx playbook run ollama pull <model>")?;
            PlaybookStep::new(
                format!("Pulling model {}", model),
                format!("ollama pull {}", shell_quote(model)),
            )
        }
        "list" => PlaybookStep::new("Models on the host", "ollama list"),
        "serve" => PlaybookStep::new(
            "Starting Ollama in the background",
            "nohup ollama serve > /tmp/ollama.log 2>&1 & echo $!",
        )
        .next_steps(
            "API: run `dgx tunnel create 11434`, then open http://localhost:11434",
        ),
        "status" => PlaybookStep::new("Checking Ollama", "pgrep -f 'ollama serve'")
            .when_idle("Ollama is not running; start it with `dgx playbook run ollama serve`"),
        "run" => {
            let model = required(rest.first(), "dgx playbook run ollama run <model> <prompt>")?;
            let prompt = rest[1..].join(" ");
            if prompt.is_empty() {
                return Err(DgxError::Playbook(format!(
                    "interactive sessions need a terminal; use `dgx connect` and run `ollama run {}`",
                    model
                )));
            }
            PlaybookStep::new(
                format!("Running {}", model),
                format!("ollama run {} {}", shell_quote(model), shell_quote(&prompt)),
            )
        }
        other => {
            return Err(DgxError::Playbook(format!(
                "unknown ollama action '{}'; {}",
                other, usage
            )))
        }
    };
    Ok(step)
}

fn plan_vllm(args: &[String]) -> Result<PlaybookStep> {
    let usage = "usage: dgx playbook run vllm <pull|serve|status|stop>";
    let (action, rest) = args
        .split_first()
        .ok_or_else(|| DgxError::Playbook(format!("vllm action required; {}", usage)))?;

    let step = match action.as_str() {
        "pull" => PlaybookStep::new(
            format!("Pulling {}", VLLM_IMAGE),
            format!("docker pull {}", VLLM_IMAGE),
        ),
        "serve" => {
            let model = required(rest.first(), "dgx playbook run vllm serve <model>")?;
            PlaybookStep::new(
                format!("Starting vLLM with {}", model),
                format!(
                    "docker run -d --name {} --gpus all --shm-size=10g -p 8000:8000 {} vllm serve {} --host 0.0.0.0 --port 8000",
                    VLLM_CONTAINER,
                    VLLM_IMAGE,
                    shell_quote(model)
                ),
            )
            .next_steps(format!(
                "API: run `dgx tunnel create 8000`, then use http://localhost:8000/v1\nLogs: dgx exec docker logs -f {}",
                VLLM_CONTAINER
            ))
        }
        "status" => PlaybookStep::new(
            "Checking vLLM",
            format!(
                "docker ps --filter name={} --format '{{{{.ID}}}} {{{{.Status}}}} {{{{.Names}}}}'",
                VLLM_CONTAINER
            ),
        )
        .when_idle("vLLM is not running; start it with `dgx playbook run vllm serve <model>`"),
        "stop" => PlaybookStep::new(
            "Stopping vLLM",
            format!("docker stop {0} && docker rm {0}", VLLM_CONTAINER),
        ),
        other => {
            return Err(DgxError::Playbook(format!(
                "unknown vllm action '{}'; {}",
                other, usage
            )))
        }
    };
    Ok(step)
}

fn required<'a>(arg: Option<&'a String>, usage: &str) -> Result<&'a str> {
    arg.map(String::as_str)
        .filter(|a| !a.is_empty())
        .ok_or_else(|| DgxError::Playbook(format!("model name required; usage: {}", usage)))
}

/// Run a planned step and return the text to show
pub async fn run_step<E: RemoteExecutor + ?Sized>(
    executor: &mut E,
    step: &PlaybookStep,
) -> Result<String> {
    tracing::info!("{}: {}", step.summary, step.command);
    let result = executor.execute(&step.command).await;

    if let Some(idle) = &step.when_idle {
        match &result {
            Ok(output) if output.trim().is_empty() => return Ok(idle.clone()),
            Err(DgxError::RemoteCommand { .. }) => return Ok(idle.clone()),
            _ => {}
        }
    }

    let mut output = result?;
    if let Some(next) = &step.next_steps {
        if !output.is_empty() && !output.ends_with('\n') {
            output.push('\n');
        }
        output.push_str(next);
        output.push('\n');
    }
    Ok(output)
}
