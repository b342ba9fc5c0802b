use anyhow::Result;
use clap::Parser;
use tracing::{error, info, warn};

use group_chat::{
    cli::{Cli, Command},
    client,
    server::{Server, ServerConfig},
};

fn init_tracing() {
    use std::io::IsTerminal;
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(std::io::stdout().is_terminal())
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => {
            let config = ServerConfig::from(args);
            let server = match Server::bind(&config).await {
                Ok(server) => server,
                Err(err) => {
                    error!("failed to start chat server: {err:?}");
                    return Err(err);
                }
            };
            let addr = server.local_addr()?;
            info!("chat server listening on {}", addr);
            if let Err(err) = server.run_until_ctrl_c().await {
                warn!("chat server exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}
