mod app;
mod config;

use tracing_subscriber::EnvFilter;

use config::RelaySettings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let path = config::config_path()?;
    let settings = RelaySettings::load_or_create(&path)?;
    tracing::info!(
        config = %path.display(),
        bind = %settings.bind,
        port = settings.port,
        "starting pairwave relay"
    );

    let server = app::build(&settings)?;
    app::run(server, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    })
    .await
}
