// Services module
pub mod config_service;
pub mod gpu_service;
pub mod key_service;
pub mod known_hosts;
pub mod playbook_service;
pub mod process_inspector;
pub mod process_runner;
pub mod remote_env;
pub mod ssh_service;
pub mod transfer_service;
pub mod tunnel_service;
