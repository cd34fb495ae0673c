mod app;
mod config;

use anyhow::{Context, Result};
use config::Config;
use controlcenter_helpers::logging::{LogSettings, init_logging};
use controlcenter_helpers::shutdown;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let sink = init_logging(&LogSettings {
        default_filter: "controlcenter_server=info,controlcenter_pipeline=info,sqlx=warn",
        env_key: "CONTROLCENTER_LOG",
        service_name: "controlcenter-server",
    });

    let config = Config::load().context("failed to load configuration")?;
    info!("server starting: workspace={}, log_sink={}", config.workspace.display(), sink.as_str());

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown::listen_shutdown(shutdown.clone()));

    app::run(config, shutdown).await
}
