use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// dgx - SSH sessions and port tunnels to a remote GPU host
#[derive(Parser, Debug)]
#[command(name = "dgx")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show or change the connection profile
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Open an interactive shell on the host
    #[command(alias = "ssh")]
    Connect,

    /// Run a command on the host and print its output
    Exec {
        /// Command and arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Check that the host is reachable and list active tunnels
    Status,

    /// Manage background ssh tunnels
    Tunnel {
        #[command(subcommand)]
        action: TunnelAction,
    },

    /// Forward a port in the foreground until Ctrl-C
    Forward {
        /// LOCAL[:REMOTE] ports
        ports: String,

        /// Target host as seen from the server
        #[arg(long, default_value = "localhost")]
        remote_host: String,
    },

    /// Sync files with rsync (use dgx:PATH for remote paths)
    Sync {
        source: String,
        dest: String,

        /// Delete files in dest that are absent from source
        #[arg(long)]
        delete: bool,
    },

    /// Copy files with scp (use dgx:PATH for remote paths)
    Copy { source: String, dest: String },

    /// Install the public key on the host with ssh-copy-id
    SetupKey,

    /// Show GPU usage and compute processes on the host
    Gpu {
        /// Print the plain nvidia-smi report
        #[arg(short, long, conflicts_with = "json")]
        raw: bool,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// List or run prepared workloads on the host
    Playbook {
        #[command(subcommand)]
        action: PlaybookAction,
    },

    /// Store credentials as environment variables on the host
    Env {
        #[command(subcommand)]
        action: EnvAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum PlaybookAction {
    /// List playbooks by category
    List,

    /// Run a playbook action, e.g. `ollama pull llama3.2`
    Run {
        name: String,

        /// Action and its arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum EnvAction {
    /// Set HF_TOKEN
    HfToken {
        /// Token value; prompted for when absent
        #[arg(long)]
        value: Option<String>,
    },

    /// Set WANDB_API_KEY
    Wandb {
        /// API key; prompted for when absent
        #[arg(long)]
        value: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Set connection details; missing values are prompted for
    Set {
        #[arg(short = 'H', long)]
        host: Option<String>,

        #[arg(short, long)]
        user: Option<String>,

        #[arg(short, long)]
        port: Option<u16>,

        /// SSH private key path
        #[arg(short, long)]
        identity_file: Option<PathBuf>,
    },

    /// Print the current configuration
    Show,
}

#[derive(Subcommand, Debug)]
pub enum TunnelAction {
    /// Start a background tunnel
    Create {
        /// LOCAL[:REMOTE] ports
        #[arg(required_unless_present = "preset", conflicts_with = "preset")]
        ports: Option<String>,

        /// Target host as seen from the server
        #[arg(long, default_value = "localhost")]
        remote_host: String,

        /// Use a saved preset
        #[arg(long)]
        preset: Option<String>,

        /// Move to the next free local port if LOCAL is taken
        #[arg(long)]
        auto_port: bool,
    },

    /// List tunnels to the configured host
    List {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Stop the tunnel with this PID
    Kill { pid: u32 },

    /// Stop every tunnel to the configured host
    KillAll {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// List saved presets
    Presets,

    /// Save a named preset
    SavePreset {
        name: String,

        /// LOCAL[:REMOTE] ports
        ports: String,

        #[arg(long, default_value = "localhost")]
        remote_host: String,

        #[arg(short, long)]
        description: Option<String>,
    },

    /// Delete a saved preset
    RemovePreset { name: String },
}

/// Parse `LOCAL:REMOTE`, or `PORT` for the same port on both ends
pub fn parse_port_pair(value: &str) -> Option<(u16, u16)> {
    let parse = |s: &str| s.trim().parse::<u16>().ok().filter(|p| *p > 0);
    match value.split_once(':') {
        Some((local, remote)) => Some((parse(local)?, parse(remote)?)),
        None => parse(value).map(|port| (port, port)),
    }
}
