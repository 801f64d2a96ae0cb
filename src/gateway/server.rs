//! Server lifecycle: wiring, listening, sweepers, graceful shutdown.

use std::sync::Arc;

use axum::Router;
use tokio::sync::broadcast;
use tracing::info;

use super::router::{AppState, create_router};
use crate::Result;
use crate::config::Config;
use crate::flow::{
    AlwaysRequireConsent, ConsentOncePolicy, ConsentPolicy, FlowEngine, PendingStore, Sweep,
    TransactionStore, spawn_sweeper,
};
use crate::gate::CapabilityGate;
use crate::issue::Issuer;
use crate::prefs::InMemoryPreferenceStore;
use crate::upstream::{HttpUpstreamExchange, UpstreamExchange};

/// The assembled gateway: configuration plus every wired store.
pub struct Gateway {
    config: Config,
    state: Arc<AppState>,
    transactions: Arc<TransactionStore>,
    pending: Arc<PendingStore>,
    issuer: Arc<Issuer>,
}

impl Gateway {
    /// Wire all subsystems from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the upstream HTTP client cannot be built.
    pub fn new(config: Config) -> Result<Self> {
        let transactions = Arc::new(TransactionStore::new());
        let pending = Arc::new(PendingStore::new());
        let prefs = Arc::new(InMemoryPreferenceStore::new());
        let issuer = Arc::new(Issuer::new(config.flow.code_ttl, config.flow.session_ttl));

        let upstream: Arc<dyn UpstreamExchange> =
            Arc::new(HttpUpstreamExchange::new(&config.upstream, &config.server)?);

        let policy: Arc<dyn ConsentPolicy> = if config.flow.require_consent_every_login {
            Arc::new(AlwaysRequireConsent)
        } else {
            Arc::new(ConsentOncePolicy::new(prefs.clone()))
        };

        let engine = Arc::new(FlowEngine::new(
            &config,
            Arc::clone(&transactions),
            Arc::clone(&pending),
            prefs.clone(),
            Arc::clone(&issuer),
            upstream,
            policy,
        ));
        let gate = Arc::new(CapabilityGate::new(issuer.sessions(), prefs));

        let state = Arc::new(AppState {
            engine,
            gate,
            issuer: Arc::clone(&issuer),
        });

        Ok(Self {
            config,
            state,
            transactions,
            pending,
            issuer,
        })
    }

    /// The HTTP router over this gateway's state (also used by tests).
    #[must_use]
    pub fn router(&self) -> Router {
        create_router(Arc::clone(&self.state), &self.config.server.callback_path)
    }

    /// Bind, start the background sweepers, and serve until shutdown.
    pub async fn run(self) -> Result<()> {
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let interval = self.config.flow.sweep_interval;
        spawn_sweeper(
            "transactions",
            Arc::clone(&self.transactions) as Arc<dyn Sweep>,
            interval,
            shutdown_tx.subscribe(),
        );
        spawn_sweeper(
            "pending",
            Arc::clone(&self.pending) as Arc<dyn Sweep>,
            interval,
            shutdown_tx.subscribe(),
        );
        spawn_sweeper(
            "issuer",
            Arc::clone(&self.issuer) as Arc<dyn Sweep>,
            interval,
            shutdown_tx.subscribe(),
        );

        let router = self.router();
        let addr = format!("{}:{}", self.config.server.host, self.config.server.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;

        info!(
            addr = %addr,
            public_url = %self.config.server.public_url,
            callback = %self.config.server.callback_path,
            capabilities = self.config.capabilities.len(),
            consent_every_login = self.config.flow.require_consent_every_login,
            "Consent gateway listening"
        );

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal(shutdown_tx))
            .await?;

        info!("Server stopped");
        Ok(())
    }
}

/// Resolve on SIGINT or SIGTERM, then notify the sweepers.
async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpstreamConfig;

    #[test]
    fn gateway_wires_from_default_config() {
        // GIVEN: a config with literal credentials
        let config = Config {
            upstream: UpstreamConfig {
                client_id: "cid".to_string(),
                client_secret: "csecret".to_string(),
                ..UpstreamConfig::default()
            },
            ..Config::default()
        };

        // THEN: construction succeeds and a router can be built
        let gateway = Gateway::new(config).unwrap();
        let _router = gateway.router();
    }
}
