use burrow::{config::Config, controller, sync};
use clap::{Parser, Subcommand};
use log::error;

#[derive(Parser, Debug)]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the controller and the tunnel-config endpoint.
    Run(Config),

    /// Keep the frpc configuration of a tunnel client in sync.
    Sync(sync::SyncArgs),
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let result = match args.command {
        Command::Run(config) => controller::run(config).await,
        Command::Sync(sync_args) => sync::run(sync_args).await,
    };
    if let Err(e) = result {
        error!("{e}");
        std::process::exit(1);
    }
}
