use crate::models::{GpuInfo, GpuProcess};
use crate::services::ssh_service::RemoteExecutor;
use crate::utils::error::Result;
use std::str::FromStr;

/// Per-GPU summary, one CSV line per device
pub const GPU_QUERY: &str = "nvidia-smi --query-gpu=index,name,memory.used,memory.total,utilization.gpu,temperature.gpu --format=csv,noheader,nounits";

/// Plain `nvidia-smi` report
pub const RAW_QUERY: &str = "nvidia-smi";

/// Process names longer than this are cut with `...`
const PROCESS_NAME_WIDTH: usize = 30;
const GPU_NAME_WIDTH: usize = 24;

/// Compute processes on one GPU
pub fn process_query(index: u32) -> String {
    format!(
        "nvidia-smi --query-compute-apps=pid,process_name,used_memory --format=csv,noheader,nounits --id={}",
        index
    )
}

/// Reads GPU state from the host through a remote executor
pub struct GpuMonitor<'a, E: RemoteExecutor + ?Sized> {
    executor: &'a mut E,
}

impl<'a, E: RemoteExecutor + ?Sized> GpuMonitor<'a, E> {
    pub fn new(executor: &'a mut E) -> Self {
        Self { executor }
    }

    /// Query every GPU, then its processes.
    ///
    /// A failed process query leaves that GPU's list empty; only the summary
    /// query is fatal.
    pub async fn status(&mut self) -> Result<Vec<GpuInfo>> {
        let summary = self.executor.execute(GPU_QUERY).await?;
        let mut gpus = parse_gpu_csv(&summary);

        for gpu in &mut gpus {
            match self.executor.execute(&process_query(gpu.index)).await {
                Ok(output) => gpu.processes = parse_gpu_processes(&output),
                Err(e) => tracing::warn!("Cannot list processes on GPU {}: {}", gpu.index, e),
            }
        }
        Ok(gpus)
    }

    pub async fn raw(&mut self) -> Result<String> {
        self.executor.execute(RAW_QUERY).await
    }
}

/// Parse `index, name, memory.used, memory.total, utilization, temperature`
/// lines. Lines with fewer fields or a non-numeric index are skipped.
pub fn parse_gpu_csv(output: &str) -> Vec<GpuInfo> {
    output.lines().filter_map(parse_gpu_line).collect()
}

fn parse_gpu_line(line: &str) -> Option<GpuInfo> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() < 6 {
        return None;
    }

    Some(GpuInfo {
        index: fields[0].parse().ok()?,
        name: fields[1].to_string(),
        memory_used_mib: reading(fields[2]),
        memory_total_mib: reading(fields[3]),
        utilization_percent: reading(fields[4]),
        temperature_c: reading(fields[5]),
        processes: Vec::new(),
    })
}

/// Parse `pid, process_name, used_memory` lines. The name may contain commas.
pub fn parse_gpu_processes(output: &str) -> Vec<GpuProcess> {
    output
        .lines()
        .filter_map(|line| {
            let (pid, rest) = line.split_once(',')?;
            let (name, memory) = rest.rsplit_once(',')?;
            Some(GpuProcess {
                pid: pid.trim().parse().ok()?,
                name: name.trim().to_string(),
                used_memory_mib: reading(memory),
            })
        })
        .collect()
}

fn reading<T: FromStr>(field: &str) -> Option<T> {
    field.trim().parse().ok()
}

/// Render GPUs and their processes as an aligned text table
pub fn format_gpu_table(gpus: &[GpuInfo]) -> String {
    if gpus.is_empty() {
        return "No GPUs reported\n".to_string();
    }

    let mut out = format!(
        "{:<4} {:<name$} {:>22} {:>5} {:>6}\n",
        "GPU",
        "NAME",
        "MEMORY",
        "UTIL",
        "TEMP",
        name = GPU_NAME_WIDTH
    );
    for gpu in gpus {
        out.push_str(&format!(
            "{:<4} {:<name$} {:>22} {:>5} {:>6}\n",
            gpu.index,
            truncate(&gpu.name, GPU_NAME_WIDTH),
            gpu.memory_summary(),
            or_na(gpu.utilization_percent.map(|u| format!("{}%", u))),
            or_na(gpu.temperature_c.map(|t| format!("{}°C", t))),
            name = GPU_NAME_WIDTH
        ));
        for process in &gpu.processes {
            out.push_str(&format!(
                "     {:>8}  {:<name$} {:>10}\n",
                process.pid,
                truncate(&process.name, PROCESS_NAME_WIDTH),
                or_na(process.used_memory_mib.map(|m| format!("{} MiB", m))),
                name = PROCESS_NAME_WIDTH
            ));
        }
    }
    out
}

fn or_na(value: Option<String>) -> String {
    value.unwrap_or_else(|| "N/A".to_string())
}

fn truncate(value: &str, width: usize) -> String {
    if value.chars().count() <= width {
        return value.to_string();
    }
    let kept: String = value.chars().take(width.saturating_sub(3)).collect();
    format!("{}...", kept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::error::DgxError;
    use async_trait::async_trait;
    use std::collections::HashMap;

    const TWO_GPUS: &str = "\
0, NVIDIA A100-SXM4-80GB, 1024, 81920, 12, 45
1, NVIDIA A100-SXM4-80GB, 0, 81920, 0, 38
";

    /// Answers commands from a fixed table and records what was asked
    #[derive(Default)]
    struct ScriptedHost {
        answers: HashMap<String, Result<String>>,
        asked: Vec<String>,
    }

    impl ScriptedHost {
        fn answer(mut self, command: &str, output: &str) -> Self {
            self.answers.insert(command.to_string(), Ok(output.to_string()));
            self
        }

        fn fail(mut self, command: &str) -> Self {
            self.answers.insert(
                command.to_string(),
                Err(DgxError::RemoteCommand {
                    command: command.to_string(),
                    status: Some(6),
                    output: "No devices were found\n".to_string(),
                }),
            );
            self
        }
    }

    #[async_trait]
    impl RemoteExecutor for ScriptedHost {
        async fn execute(&mut self, command: &str) -> Result<String> {
            self.asked.push(command.to_string());
            match self.answers.remove(command) {
                Some(answer) => answer,
                None => Err(DgxError::RemoteCommand {
                    command: command.to_string(),
                    status: Some(127),
                    output: String::new(),
                }),
            }
        }
    }

    #[test]
    fn test_parse_gpu_csv() {
        let gpus = parse_gpu_csv(TWO_GPUS);
        assert_eq!(gpus.len(), 2);
        assert_eq!(gpus[0].index, 0);
        assert_eq!(gpus[0].name, "NVIDIA A100-SXM4-80GB");
        assert_eq!(gpus[0].memory_used_mib, Some(1024));
        assert_eq!(gpus[0].memory_total_mib, Some(81920));
        assert_eq!(gpus[0].utilization_percent, Some(12));
        assert_eq!(gpus[0].temperature_c, Some(45));
        assert_eq!(gpus[1].index, 1);
        assert!(gpus[1].processes.is_empty());
    }

    #[test]
    fn test_parse_gpu_csv_unavailable_readings() {
        let gpus = parse_gpu_csv("0, NVIDIA GB10, [N/A], [N/A], 3, 41\n");
        assert_eq!(gpus.len(), 1);
        assert_eq!(gpus[0].memory_used_mib, None);
        assert_eq!(gpus[0].memory_total_mib, None);
        assert_eq!(gpus[0].utilization_percent, Some(3));
        assert_eq!(gpus[0].memory_summary(), "N/A");
    }

    #[test]
    fn test_parse_gpu_csv_skips_malformed_lines() {
        let output = "\
index, name, memory.used, memory.total, utilization.gpu, temperature.gpu
0, NVIDIA A100, 10, 100
Failed to initialize NVML: Driver/library version mismatch

2, NVIDIA A100, 10, 100, 5, 30
";
        let gpus = parse_gpu_csv(output);
        assert_eq!(gpus.len(), 1);
        assert_eq!(gpus[0].index, 2);
    }

    #[test]
    fn test_parse_gpu_processes() {
        let output = "\
4242, /usr/bin/python3, 800
4300, vllm serve meta-llama/Llama-3.1-8B, --tp 1, 70000
No running processes found
";
        let processes = parse_gpu_processes(output);
        assert_eq!(processes.len(), 2);
        assert_eq!(processes[0].pid, 4242);
        assert_eq!(processes[0].name, "/usr/bin/python3");
        assert_eq!(processes[0].used_memory_mib, Some(800));
        assert_eq!(processes[1].name, "vllm serve meta-llama/Llama-3.1-8B, --tp 1");
        assert_eq!(processes[1].used_memory_mib, Some(70000));
    }

    #[test]
    fn test_format_gpu_table() {
        let mut gpus = parse_gpu_csv(TWO_GPUS);
        gpus[0].processes = parse_gpu_processes(
            "4242, /opt/conda/envs/training/bin/python3.11, 800\n",
        );

        let table = format_gpu_table(&gpus);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("GPU"));
        assert!(lines[1].contains("1024 / 81920 MiB"));
        assert!(lines[1].contains("12%"));
        assert!(lines[1].contains("45°C"));
        assert!(lines[2].contains("4242"));
        assert!(lines[2].contains("/opt/conda/envs/training/bi..."));
        assert!(lines[2].contains("800 MiB"));
        assert!(lines[3].starts_with("1 "));
    }

    #[test]
    fn test_format_gpu_table_empty() {
        assert_eq!(format_gpu_table(&[]), "No GPUs reported\n");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("python3", 30), "python3");
        assert_eq!(truncate("abcdefghij", 8), "abcde...");
        assert_eq!(truncate("abcdefgh", 8), "abcdefgh");
    }

    #[tokio::test]
    async fn test_status_collects_processes_per_gpu() {
        let mut host = ScriptedHost::default()
            .answer(GPU_QUERY, TWO_GPUS)
            .answer(&process_query(0), "4242, python3, 800\n")
            .answer(&process_query(1), "");

        let gpus = GpuMonitor::new(&mut host).status().await.unwrap();
        assert_eq!(gpus[0].processes.len(), 1);
        assert!(gpus[1].processes.is_empty());
        assert_eq!(
            host.asked,
            vec![GPU_QUERY.to_string(), process_query(0), process_query(1)]
        );
    }

    #[tokio::test]
    async fn test_status_tolerates_process_query_failure() {
        let mut host = ScriptedHost::default()
            .answer(GPU_QUERY, TWO_GPUS)
            .fail(&process_query(0))
            .answer(&process_query(1), "77, python3, 10\n");

        let gpus = GpuMonitor::new(&mut host).status().await.unwrap();
        assert_eq!(gpus.len(), 2);
        assert!(gpus[0].processes.is_empty());
        assert_eq!(gpus[1].processes[0].pid, 77);
    }

    #[tokio::test]
    async fn test_status_fails_when_summary_fails() {
        let mut host = ScriptedHost::default().fail(GPU_QUERY);

        let err = GpuMonitor::new(&mut host).status().await.unwrap_err();
        assert!(matches!(err, DgxError::RemoteCommand { status: Some(6), .. }));
        assert_eq!(host.asked.len(), 1);
    }

    #[tokio::test]
    async fn test_raw_runs_plain_nvidia_smi() {
        let mut host = ScriptedHost::default().answer(RAW_QUERY, "+----+\n");
        assert_eq!(GpuMonitor::new(&mut host).raw().await.unwrap(), "+----+\n");
    }
}
