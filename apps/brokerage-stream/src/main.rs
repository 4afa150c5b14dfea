//! Brokerage Stream Binary
//!
//! Opens one streaming context for the configured client and logs every
//! state update until interrupted.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin brokerage-stream
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `BROKERAGE_ACCESS_TOKEN`: OAuth access token
//! - `BROKERAGE_REST_URL`: REST base URL
//! - `BROKERAGE_STREAMING_URL`: Streaming websocket base URL
//! - `BROKERAGE_CLIENT_KEY`: Client key
//!
//! ## Optional
//! - `BROKERAGE_REAUTHORIZE_URL`: Reauthorize endpoint (default: derived from the streaming URL)
//! - `BROKERAGE_CONTEXT_ID`: Fixed context id (default: random)
//! - `BROKERAGE_ACCOUNT_KEYS`: Comma-separated account keys
//! - `BROKERAGE_PRICE_INSTRUMENTS`: Comma-separated `uic:AssetType` list
//! - `STREAM_*`: Timeouts and reconnect backoff
//! - `METRICS_LISTEN_ADDR`: Serve Prometheus metrics on this address
//! - `OTEL_ENABLED`, `OTEL_EXPORTER_OTLP_ENDPOINT`, `OTEL_SERVICE_NAME`, `RUST_LOG`

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use brokerage_stream::infrastructure::telemetry;
use brokerage_stream::{
    HttpSubscriptionTransport, StreamClientConfig, StreamingContext, Subscription,
    SubscriptionEvent, init_metrics,
};
use futures::StreamExt;
use tokio::signal;
use tokio::sync::watch;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    load_dotenv();

    let _telemetry_guard = telemetry::init()?;

    tracing::info!("Starting brokerage stream client");

    let config = StreamClientConfig::from_env()?;
    log_config(&config);

    let _metrics_handle = init_metrics(config.metrics_addr)?;

    let (_credentials_tx, credentials) = watch::channel(Some(config.credentials.bearer()));
    let transport = Arc::new(
        HttpSubscriptionTransport::new(&config.transport_config(), credentials.clone())
            .context("building subscription transport")?,
    );

    let context = StreamingContext::open(
        config.context_config(),
        config.request.clone(),
        transport,
        credentials,
    )
    .await
    .context("opening streaming context")?;
    tracing::info!(context_id = context.context_id(), "Streaming context ready");

    spawn_logger("balance", context.balance_subscription());
    for account_key in &config.request.account_keys {
        if let Some(handle) = context.account_balance_subscription(account_key) {
            spawn_logger("account_balance", handle);
        }
    }
    spawn_logger("orders", context.orders_subscription());
    spawn_logger("positions", context.positions_subscription());
    spawn_logger("closed_positions", context.closed_positions_subscription());
    for instrument in &config.request.instruments {
        if let Some(handle) = context.price_subscription(instrument) {
            spawn_logger("price", handle);
        }
    }

    tokio::select! {
        () = await_shutdown() => {}
        () = context.terminated() => {
            tracing::warn!("Streaming context terminated on its own");
        }
    }

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, context.dispose()).await {
        Ok(Ok(())) => tracing::info!("Brokerage stream client stopped"),
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Streaming context failed");
            return Err(e.into());
        }
        Err(_) => tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Shutdown timed out"
        ),
    }
    Ok(())
}

/// Log every event of one subscription.
fn spawn_logger<S>(label: &'static str, subscription: &Subscription<S>)
where
    S: brokerage_stream::StreamState,
{
    let scope = subscription.scope().to_string();
    let mut events = Box::pin(subscription.stream());
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match event {
                SubscriptionEvent::Message(state) => log_state(label, &scope, state.as_ref()),
                SubscriptionEvent::Disposed(cause) => {
                    tracing::info!(subscription = label, %scope, cause = ?cause, "Subscription disposed");
                    break;
                }
            }
        }
    });
}

fn log_state(label: &str, scope: &str, state: &impl Debug) {
    tracing::info!(subscription = label, %scope, state = ?state, "State updated");
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &StreamClientConfig) {
    tracing::info!(
        client_key = %config.request.client_key,
        accounts = config.request.account_keys.len(),
        instruments = config.request.instruments.len(),
        "Configuration loaded"
    );
    tracing::debug!(
        rest_url = %config.endpoints.rest_url,
        streaming_url = %config.endpoints.streaming_url,
        reauthorize_url = %config.endpoints.reauthorize_url,
        "Brokerage endpoints"
    );
}

/// Wait for SIGINT or SIGTERM.
async fn await_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+C handler failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
