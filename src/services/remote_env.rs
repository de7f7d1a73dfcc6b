use crate::services::ssh_service::RemoteExecutor;
use crate::utils::error::{DgxError, Result};
use crate::utils::shell::shell_quote;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

/// Credentials the CLI knows how to store on the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteVar {
    HfToken,
    WandbKey,
}

impl RemoteVar {
    pub fn name(self) -> &'static str {
        match self {
            Self::HfToken => "HF_TOKEN",
            Self::WandbKey => "WANDB_API_KEY",
        }
    }

    /// Prompt label
    pub fn label(self) -> &'static str {
        match self {
            Self::HfToken => "Hugging Face token",
            Self::WandbKey => "Weights & Biases API key",
        }
    }
}

// Rewrites ~/.config/dgx/env.sh without the old export and makes ~/.bashrc source it
const STORE_SCRIPT: &str = r#"import base64, os, pathlib, shlex
name = os.environ["ENV_NAME"]
value = base64.b64decode(os.environ["ENV_VALUE"]).decode()
env_file = pathlib.Path.home() / ".config" / "dgx" / "env.sh"
env_file.parent.mkdir(parents=True, exist_ok=True)
lines = []
if env_file.exists():
    lines = [l for l in env_file.read_text().splitlines() if not l.startswith(f"export {name}=")]
lines.append(f"export {name}={shlex.quote(value)}")
env_file.write_text("\n".join(lines) + "\n")
env_file.chmod(0o600)
bashrc = pathlib.Path.home() / ".bashrc"
source_line = "source ~/.config/dgx/env.sh"
content = bashrc.read_text() if bashrc.exists() else ""
if source_line not in content:
    with bashrc.open("a") as fh:
        if content and not content.endswith("\n"):
            fh.write("\n")
        fh.write(source_line + "\n")
print(f"Stored {name} in {env_file}")"#;

/// Build the remote command that stores `name=value`.
///
/// The value travels base64-encoded in the command's environment and never
/// appears verbatim in the command line.
pub fn store_command(name: &str, value: &str) -> Result<String> {
    validate_name(name)?;
    if value.trim().is_empty() {
        return Err(DgxError::EnvVar(format!("{} cannot be empty", name)));
    }

    let encoded = STANDARD.encode(value.trim());
    Ok(format!(
        "ENV_NAME={} ENV_VALUE={} python3 - <<'PY'\n{}\nPY",
        name,
        shell_quote(&encoded),
        STORE_SCRIPT
    ))
}

fn validate_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_uppercase() || c == '_')
        && chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(DgxError::EnvVar(format!("'{}' is not a valid variable name", name)))
    }
}

/// Store `var` on the host; returns the remote confirmation line
pub async fn store<E: RemoteExecutor + ?Sized>(
    executor: &mut E,
    var: RemoteVar,
    value: &str,
) -> Result<String> {
    let command = store_command(var.name(), value)?;
    tracing::info!("Storing {} on the host", var.name());
    let output = executor.execute(&command).await?;
    Ok(output.trim().to_string())
}
