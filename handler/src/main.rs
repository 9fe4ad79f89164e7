mod config;
mod error;
mod pipeline;
mod procfs;
mod resolver;
mod storage;
mod supervisor;
mod tasklog;
mod telemetry;
mod transfer;

use anyhow::{bail, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::HandlerConfig;
use crate::pipeline::Pipeline;

#[derive(Parser)]
#[command(name = "handler")]
#[command(about = "Ejecuta tareas de workflow: descarga, ejecuta y sube el log")]
struct Cli {
    /// Descriptor JSON de la tarea, lista de descriptores o puntero S3={"Bucket":..,"Key":..}
    #[arg(value_name = "SOLICITUD", allow_hyphen_values = true)]
    request: Option<String>,
}

#[tokio::main]
async fn main() {
    // RUST_LOG manda; si no está, info para el handler y warn para reqwest
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("handler=info,reqwest=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run(Cli::parse()).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let request = match cli.request {
        Some(r) if !r.trim().is_empty() => r,
        _ => bail!("falta la solicitud: se espera un descriptor JSON o un puntero al storage"),
    };

    let config = HandlerConfig::from_env()?;
    info!(
        "work dir {} · logs {} · storage {}",
        config.work_dir.display(),
        config.log_dir.display(),
        config.storage_url
    );

    let store = storage::from_url(&config.storage_url);
    let pipeline = Pipeline::new(config, store);

    let done = pipeline.run_queue(&request).await?;
    info!("{} tarea(s) completada(s)", done);
    Ok(())
}
