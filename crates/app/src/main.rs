use anyhow::Context;

use castline_infra::config::AppConfig;
use castline_observability::LogFormat;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let format = match std::env::var("CASTLINE_LOG_FORMAT") {
        Ok(raw) => raw.parse::<LogFormat>()?,
        Err(_) => LogFormat::default(),
    };
    castline_observability::init_with(format);

    let config = AppConfig::from_env().context("failed to load configuration")?;
    let runtime = castline_app::Runtime::start(config);

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutdown requested");

    runtime.shutdown().await;
    Ok(())
}
