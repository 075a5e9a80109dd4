//! Wires the relay together and runs it until shutdown.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use pairwave_relay::{Relay, RelayServer};

use crate::config::RelaySettings;

/// How often queue statistics are logged.
const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Builds the relay from `settings`.
pub fn build(settings: &RelaySettings) -> anyhow::Result<Arc<RelayServer<Relay>>> {
    let relay = Relay::new(
        Arc::new(settings.identity_resolver()),
        Arc::new(settings.region_lookup()?),
        settings.relay_config(),
    );
    if settings.auth_tokens.is_empty() {
        warn!("no auth tokens configured, accepting any bearer token");
    }
    Ok(RelayServer::new(settings.server_config(), relay))
}

/// Runs the relay until `shutdown` resolves or the server fails.
pub async fn run(
    server: Arc<RelayServer<Relay>>,
    shutdown: impl std::future::Future<Output = ()>,
) -> anyhow::Result<()> {
    let runner = Arc::clone(&server);
    let mut serve = tokio::spawn(async move { runner.run().await });

    let stats = {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATS_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let snapshot = server.handler().queue().snapshot();
                info!(
                    connections = server.connection_count(),
                    present = server.handler().presence().len(),
                    waiting = snapshot.waiting.len(),
                    matches = snapshot.matches.len(),
                    "relay stats"
                );
            }
        })
    };

    tokio::pin!(shutdown);
    let result = tokio::select! {
        res = &mut serve => res?.map_err(anyhow::Error::from),
        () = &mut shutdown => {
            info!("shutdown requested");
            server.shutdown();
            serve.await?.map_err(anyhow::Error::from)
        }
    };
    stats.abort();
    debug!("relay stopped");
    result
}
