mod cli;

use clap::Parser;
use cli::Cli;
use console::style;
use dgx_manager::utils::error::DgxError;
use dgx_manager::utils::logger;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        logger::init_with_level("debug");
    } else {
        logger::init();
    }

    if let Err(e) = cli::run(cli).await {
        let message = match e.downcast_ref::<DgxError>() {
            Some(err) => err.user_message(),
            None => format!("{:#}", e),
        };
        eprintln!("{} {}", style("Error:").red().bold(), message);
        std::process::exit(1);
    }
}
