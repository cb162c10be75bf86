//! Home Assistant event monitor
//!
//! Connects with `HASS_URL` / `HASS_TOKEN`, subscribes to the event types
//! given on the command line (all events when none) and prints every event
//! as one JSON line until Ctrl-C.

use std::sync::Arc;

use anyhow::{Context, Result};
use ha_ws_client::{
    CancellationToken, ClientConfig, ConnectionParameters, EventHandler, EventType,
    TungsteniteConnector, WsClient,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let params = ConnectionParameters::from_env().context("reading connection parameters")?;
    let mut event_types: Vec<EventType> = std::env::args().skip(1).map(EventType::from).collect();
    if event_types.is_empty() {
        event_types.push(EventType::match_all());
    }

    let config = ClientConfig {
        connect_retries: Some(3),
        ..ClientConfig::default()
    };
    let client = WsClient::with_config(Arc::new(TungsteniteConnector), config);
    let cancel = CancellationToken::new();

    client
        .connect(&params, &cancel)
        .await
        .with_context(|| format!("connecting to {}", params.endpoint()))?;
    match client.ha_version() {
        Some(version) => info!(ha_version = %version, "Monitoring events"),
        None => info!("Monitoring events"),
    }

    let (handler, mut queue) = EventHandler::queue();
    for event_type in &event_types {
        client
            .add_event_handler(event_type.clone(), handler.clone(), &cancel)
            .await
            .with_context(|| format!("subscribing to {}", event_type))?;
    }
    // Only the registered clones may keep the queue open
    drop(handler);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
            next = queue.next_event() => match next {
                Ok(Some(event)) => println!("{}", serde_json::to_string(&event.event)?),
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "Event stream ended");
                    break;
                }
            },
        }
    }

    if let Err(err) = client.close(&cancel).await {
        warn!(error = %err, "Close failed");
    }
    client.dispose();
    Ok(())
}
