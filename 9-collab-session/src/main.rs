use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use collab_session::{
    chat,
    cli::{Cli, Command, ServerArgs},
    server::SessionServer,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    // Logs go to stderr; stdout carries the server banner and chat lines.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => run_server(args),
        Command::Chat(args) => chat::run(args),
    }
}

fn run_server(args: ServerArgs) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        let listener = TcpListener::bind(args.listen).await?;
        let server = SessionServer::new(listener);
        let addr = server.local_addr()?;
        println!("server listening on {addr}");
        info!(%addr, "server ready");
        if let Err(err) = server.run_until_ctrl_c().await {
            warn!("server exited with error: {err:?}");
            return Err(err);
        }
        Ok::<_, anyhow::Error>(())
    })
}
