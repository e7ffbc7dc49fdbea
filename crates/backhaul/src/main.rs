mod backhaul;

use clap::{Parser, Subcommand};

use crate::backhaul::app::{ClientArgs, Mode, ServerArgs};

#[derive(Debug, Parser)]
#[command(
    name = "backhaul",
    version,
    about = "backhaul - expose a local HTTP service through a public relay"
)]
struct Cli {
    /// Path to the config file (.toml/.yaml/.yml). If omitted, uses BACKHAUL_CONFIG; then auto-detects backhaul.toml > backhaul.yaml > backhaul.yml from CWD; then falls back to the OS default path (Linux: /etc/backhaul/backhaul.toml; others: user config dir).
    #[arg(long, env = "BACKHAUL_CONFIG", global = true)]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the public relay.
    Server(ServerArgs),
    /// Open a tunnel to a local port.
    Client(ClientArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mode = match cli.command {
        Command::Server(args) => Mode::Server(args),
        Command::Client(args) => Mode::Client(args),
    };
    backhaul::run(cli.config, mode).await
}
