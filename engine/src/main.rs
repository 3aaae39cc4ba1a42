use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;

use fyreflow_core::{EngineConfig, PipelineEngine};
use fyreflow_observability::{init_process_logging, ProcessKind};

#[derive(Parser, Debug)]
#[command(name = "fyreflow-engine")]
#[command(about = "Headless Fyreflow pipeline backend")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Serve {
        #[arg(long, env = "PORT")]
        port: Option<u16>,
        #[arg(long, env = "FYREFLOW_DATA_DIR")]
        data_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { port, data_dir } => {
            let mut config = EngineConfig::from_env();
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(data_dir) = data_dir {
                config.data_dir = data_dir;
            }

            let logs_dir = config.data_dir.join("logs");
            let (_guard, log_info) = init_process_logging(ProcessKind::Engine, &logs_dir, 14)?;
            info!(
                target: "fyreflow.engine",
                "logging to {} (prefix {})",
                log_info.logs_dir,
                log_info.prefix
            );

            let engine = PipelineEngine::init(config).await?;
            let handle = fyreflow_server::start(engine).await?;
            info!(target: "fyreflow.engine", "fyreflow-engine ready on http://{}", handle.addr);

            tokio::signal::ctrl_c().await?;
            info!(target: "fyreflow.engine", "shutdown signal received");
            handle.stop().await;
        }
    }

    Ok(())
}
