//! Flashing station daemon entry point.

use std::path::PathBuf;

use clap::Parser;

use flashdeck::{daemon::Daemon, tracing, Config};

#[derive(Parser)]
#[command(name = "flashd", about = "Bench flashing station daemon")]
struct Args {
    /// Path to a TOML config file; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing::init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    #[cfg(target_os = "linux")]
    {
        Daemon::native(config).run().await
    }

    #[cfg(not(target_os = "linux"))]
    {
        use std::sync::Arc;
        // No native enumerator off-Linux; run against the mock transport so
        // the daemon is still exercisable in development.
        let engine = flashdeck::engine::esptool::EsptoolEngine::new(config.esptool.clone());
        Daemon::new(
            config,
            Arc::new(flashdeck::transport::mock::MockTransport::new()),
            Arc::new(engine),
        )
        .run()
        .await
    }
}
