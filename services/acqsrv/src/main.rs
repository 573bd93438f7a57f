//! acqsrv entry point

use acqsrv::Orchestrator;
use clap::Parser;
use enviro_common::{init_logging, LogConfig, LogFormat};
use enviro_config::AppConfig;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "acqsrv", about = "EnviroDAS acquisition service", version)]
struct Args {
    /// Configuration file (YAML)
    #[arg(short, long, default_value = "config/acqsrv.yaml")]
    config: String,
}

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("acqsrv: {e}");
            e.exit_code()
        }
    };
    std::process::exit(code);
}

async fn run() -> enviro_common::Result<()> {
    let args = Args::parse();
    let config = AppConfig::from_yaml_file(&args.config)
        .map_err(|e| enviro_common::Error::config(e.to_string()))?;

    let _log_guard = init_logging(&LogConfig {
        level: config.logging.level.clone(),
        console: true,
        file: config.logging.file.clone(),
        format: if config.logging.json {
            LogFormat::Json
        } else {
            LogFormat::Compact
        },
        ansi: true,
    })?;

    let (cache, store) = Orchestrator::connect_backends(&config).await?;
    info!("backends connected");

    let orchestrator = Orchestrator::start(config, cache, store)
        .await
        .map_err(|e| enviro_common::Error::internal(e.to_string()))?;
    info!(session = orchestrator.session(), "acquisition running, Ctrl-C to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "signal handler failed");
    }

    orchestrator
        .shutdown()
        .await
        .map_err(|e| enviro_common::Error::internal(format!("shutdown: {e}")))?;
    info!("stopped");
    Ok(())
}
