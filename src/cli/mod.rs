pub mod commands;

pub use commands::Cli;

use anyhow::{Context, bail};
use dgx_manager::models::{ConnectionProfile, TunnelDescriptor, TunnelPreset};
use dgx_manager::services::config_service::ConfigService;
use dgx_manager::services::gpu_service::{self, GpuMonitor};
use dgx_manager::services::key_service::KeyService;
use dgx_manager::services::playbook_service;
use dgx_manager::services::process_runner::SystemProcessRunner;
use dgx_manager::services::remote_env::{self, RemoteVar};
use dgx_manager::services::ssh_service::SessionClient;
use dgx_manager::services::transfer_service::TransferService;
use dgx_manager::services::tunnel_service::TunnelManager;
use commands::{
    Commands, ConfigAction, EnvAction, PlaybookAction, TunnelAction, parse_port_pair,
};
use console::style;
use dialoguer::{Confirm, Input, Password};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Dispatch a parsed command line
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = ConfigService::new()?;

    match cli.command {
        Commands::Config { action } => run_config(&config, action),
        Commands::Connect => {
            let client = SessionClient::new(config.profile()?);
            if let Some(code) = client.interactive_shell()?.filter(|c| *c != 0) {
                std::process::exit(code);
            }
            Ok(())
        }
        Commands::Exec { command } => {
            let mut client = SessionClient::new(config.profile()?);
            let result = client.execute(&command.join(" ")).await;
            client.close().await;
            print!("{}", result?);
            Ok(())
        }
        Commands::Status => run_status(&config).await,
        Commands::Tunnel { action } => run_tunnel(&config, action),
        Commands::Forward { ports, remote_host } => {
            let (local, remote) = parse_ports(&ports)?;
            let mut client = SessionClient::new(config.profile()?);
            let mut handle = client.forward_port(local, &remote_host, remote).await?;

            println!(
                "{} localhost:{} → {}:{} (Ctrl-C to stop)",
                style("Forwarding").green().bold(),
                handle.local_port,
                handle.remote_host,
                handle.remote_port
            );
            tokio::signal::ctrl_c().await?;

            handle.stop();
            client.close().await;
            Ok(())
        }
        Commands::Sync {
            source,
            dest,
            delete,
        } => {
            let profile = config.profile()?;
            TransferService::new(&profile, &SystemProcessRunner).sync(&source, &dest, delete)?;
            Ok(())
        }
        Commands::Copy { source, dest } => {
            let profile = config.profile()?;
            TransferService::new(&profile, &SystemProcessRunner).copy(&source, &dest)?;
            Ok(())
        }
        Commands::SetupKey => {
            let profile = config.profile()?;
            if KeyService::has_loose_permissions(&profile.identity_file).unwrap_or(false) {
                println!(
                    "{} {} is readable by other users; run `chmod 600` on it",
                    style("Warning:").yellow().bold(),
                    profile.identity_file.display()
                );
            }
            let public_key = KeyService::read_public_key(&profile)?;
            println!("Installing {}", style(public_key).dim());
            KeyService::copy_id(&profile, &SystemProcessRunner)?;
            println!("{} key installed on {}", style("✓").green(), profile.display_name());
            Ok(())
        }
        Commands::Gpu { raw, json } => run_gpu(&config, raw, json).await,
        Commands::Playbook { action } => run_playbook(&config, action).await,
        Commands::Env { action } => {
            let (var, value) = match action {
                EnvAction::HfToken { value } => (RemoteVar::HfToken, value),
                EnvAction::Wandb { value } => (RemoteVar::WandbKey, value),
            };
            let value = match value {
                Some(value) => value,
                None => Password::new().with_prompt(var.label()).interact()?,
            };

            let mut client = SessionClient::new(config.profile()?);
            let result = remote_env::store(&mut client, var, &value).await;
            client.close().await;
            println!("{} {}", style("✓").green(), result?);
            Ok(())
        }
    }
}

async fn run_gpu(config: &ConfigService, raw: bool, json: bool) -> anyhow::Result<()> {
    let mut client = SessionClient::new(config.profile()?);

    if raw {
        let report = GpuMonitor::new(&mut client).raw().await;
        client.close().await;
        print!("{}", report?);
        return Ok(());
    }

    let gpus = GpuMonitor::new(&mut client).status().await;
    client.close().await;
    let gpus = gpus?;
    if json {
        println!("{}", serde_json::to_string_pretty(&gpus)?);
    } else {
        print!("{}", gpu_service::format_gpu_table(&gpus));
    }
    Ok(())
}

async fn run_playbook(config: &ConfigService, action: PlaybookAction) -> anyhow::Result<()> {
    match action {
        PlaybookAction::List => {
            for category in playbook_service::CATEGORIES {
                println!("{}", style(category).bold());
                for playbook in playbook_service::in_category(category) {
                    let note = if playbook.runnable { "" } else { "(planned)" };
                    println!(
                        "  {:<22} {} {}",
                        playbook.name,
                        playbook.description,
                        style(note).dim()
                    );
                }
            }
            Ok(())
        }
        PlaybookAction::Run { name, args } => {
            // Plan first so argument errors never open a connection
            let step = playbook_service::plan(&name, &args)?;
            println!("{}", style(&step.summary).cyan());

            let mut client = SessionClient::new(config.profile()?);
            let result = playbook_service::run_step(&mut client, &step).await;
            client.close().await;
            print!("{}", result?);
            Ok(())
        }
    }
}

fn parse_ports(value: &str) -> anyhow::Result<(u16, u16)> {
    parse_port_pair(value).with_context(|| format!("invalid ports '{}', expected LOCAL[:REMOTE]", value))
}

fn run_config(config: &ConfigService, action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Set {
            host,
            user,
            port,
            identity_file,
        } => {
            let current = config.load()?.profile;

            let host = match host {
                Some(host) => host,
                None => {
                    let mut input = Input::<String>::new().with_prompt("Host");
                    if let Some(p) = &current {
                        input = input.default(p.host.clone());
                    }
                    input.interact_text()?
                }
            };
            let user = match user {
                Some(user) => user,
                None => {
                    let mut input = Input::<String>::new().with_prompt("User");
                    if let Some(p) = &current {
                        input = input.default(p.user.clone());
                    }
                    input.interact_text()?
                }
            };
            let port = port
                .or_else(|| current.as_ref().map(|p| p.port))
                .unwrap_or(22);

            let mut profile = ConnectionProfile::new(host, user).with_port(port);
            if let Some(path) = identity_file.or_else(|| current.map(|p| p.identity_file)) {
                profile = profile.with_identity_file(path);
            }

            config.set_profile(profile.clone())?;
            println!("{} {}", style("Saved").green().bold(), profile.display_name());
            Ok(())
        }
        ConfigAction::Show => {
            let settings = config.load()?;
            println!("Config dir: {}", config.config_dir().display());
            match settings.profile {
                Some(p) => {
                    println!("Host:          {}", p.host);
                    println!("Port:          {}", p.port);
                    println!("User:          {}", p.user);
                    println!("Identity file: {}", p.identity_file.display());
                }
                None => println!("{}", style("No connection configured").yellow()),
            }
            println!("Presets:       {}", settings.presets.len());
            Ok(())
        }
    }
}

async fn run_status(config: &ConfigService) -> anyhow::Result<()> {
    let profile = config.profile()?;
    let client = SessionClient::new(profile.clone());

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::with_template("{spinner} {msg}")?);
    spinner.set_message(format!("Connecting to {}", profile.display_name()));
    spinner.enable_steady_tick(Duration::from_millis(100));
    let checked = client.check_connection().await;
    spinner.finish_and_clear();

    match checked {
        Ok(latency) => println!(
            "{} {} ({} ms)",
            style("●").green(),
            profile.display_name(),
            latency.as_millis()
        ),
        Err(e) => println!(
            "{} {}: {}",
            style("●").red(),
            profile.display_name(),
            e.user_message()
        ),
    }

    let tunnels = TunnelManager::new(profile).list()?;
    println!("Active tunnels: {}", tunnels.len());
    Ok(())
}

fn run_tunnel(config: &ConfigService, action: TunnelAction) -> anyhow::Result<()> {
    match action {
        TunnelAction::Create {
            ports,
            remote_host,
            preset,
            auto_port,
        } => {
            let manager = TunnelManager::new(config.profile()?);

            let mut tunnel = match (preset, ports) {
                (Some(name), _) => config
                    .preset(&name)?
                    .with_context(|| format!("no preset named '{}'", name))?
                    .descriptor(),
                (None, Some(ports)) => {
                    let (local, remote) = parse_ports(&ports)?;
                    TunnelDescriptor::new(local, remote).with_remote_host(remote_host)
                }
                (None, None) => bail!("give LOCAL[:REMOTE] ports or --preset"),
            };

            if auto_port {
                let requested = tunnel.local_port;
                tunnel.local_port = manager
                    .find_available_port(requested)
                    .with_context(|| format!("no free local port near {}", requested))?;
                if tunnel.local_port != requested {
                    println!(
                        "{} port {} is busy, using {}",
                        style("Note:").yellow(),
                        requested,
                        tunnel.local_port
                    );
                }
            }

            let created = manager.create(&tunnel)?;
            let pid = created
                .pid
                .map(|p| p.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            println!(
                "{} {} (pid {})",
                style("Tunnel up:").green().bold(),
                created.description(),
                pid
            );
            Ok(())
        }
        TunnelAction::List { json } => {
            let tunnels = TunnelManager::new(config.profile()?).list()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&tunnels)?);
            } else if tunnels.is_empty() {
                println!("No active tunnels");
            } else {
                for t in tunnels {
                    let pid = t.pid.map(|p| p.to_string()).unwrap_or_default();
                    println!("{:>8}  {}", style(pid).cyan(), t.description());
                }
            }
            Ok(())
        }
        TunnelAction::Kill { pid } => {
            TunnelManager::new(config.profile()?).kill(pid)?;
            println!("{} tunnel {}", style("Stopped").green(), pid);
            Ok(())
        }
        TunnelAction::KillAll { yes } => {
            if !yes
                && !Confirm::new()
                    .with_prompt("Stop all tunnels to this host?")
                    .default(false)
                    .interact()?
            {
                return Ok(());
            }

            let report = TunnelManager::new(config.profile()?).kill_all()?;
            println!("Stopped {} tunnel(s)", report.terminated.len());
            for (pid, err) in &report.failed {
                println!("{} {}: {}", style("Failed").red(), pid, err);
            }
            if !report.is_clean() {
                bail!("{} tunnel(s) could not be stopped", report.failed.len());
            }
            Ok(())
        }
        TunnelAction::Presets => {
            let presets = config.load()?.presets;
            if presets.is_empty() {
                println!("No presets saved");
            }
            for p in presets {
                println!(
                    "{:<16} {} {}",
                    style(&p.name).bold(),
                    p.descriptor().description(),
                    style(&p.description).dim()
                );
            }
            Ok(())
        }
        TunnelAction::SavePreset {
            name,
            ports,
            remote_host,
            description,
        } => {
            let (local, remote) = parse_ports(&ports)?;
            let mut preset = TunnelPreset::new(name, local, remote);
            preset.remote_host = remote_host;
            if let Some(description) = description {
                preset = preset.with_description(description);
            }
            config.add_preset(preset.clone())?;
            println!("{} preset {}", style("Saved").green(), preset.name);
            Ok(())
        }
        TunnelAction::RemovePreset { name } => {
            if !config.remove_preset(&name)? {
                bail!("no preset named '{}'", name);
            }
            println!("{} preset {}", style("Removed").green(), name);
            Ok(())
        }
    }
}
