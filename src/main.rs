use log::error;
use tracing_subscriber::EnvFilter;

/// Installs the tracing subscriber and bridges `log` records into it.
fn init_logging() -> anyhow::Result<()> {
    tracing_log::LogTracer::init()?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = init_logging() {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    // Run the application
    if let Err(e) = mail_inlet::run().await {
        error!("Application error: {}", e);
        std::process::exit(1);
    }
}
