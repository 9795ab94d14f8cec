//! Connects to a gateway, prints its version and state, then follows
//! notifications until interrupted.
//!
//! ```text
//! GATEWAY_HOST=192.168.0.10 GATEWAY_PASSWORD=velux123 \
//!     cargo run -p proven-gateway-session --example gateway_status
//! ```

use anyhow::{Context, Result};
use futures::StreamExt;
use proven_gateway_session::{LifecycleEvent, Request, Session};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let host = std::env::var("GATEWAY_HOST").context("GATEWAY_HOST not set")?;
    let password = std::env::var("GATEWAY_PASSWORD").context("GATEWAY_PASSWORD not set")?;

    let session = Session::builder(host, password).build()?;
    let mut lifecycle = session.subscribe_lifecycle();
    tokio::spawn(async move {
        while let Ok(event) = lifecycle.recv().await {
            match event {
                LifecycleEvent::Disconnected { will_reconnect, .. } if !will_reconnect => {
                    warn!("Session closed for good");
                }
                event => info!("{:?}", event),
            }
        }
    });

    session.connect().await.context("login failed")?;

    let version = session.request(Request::by_name("GW_GET_VERSION_REQ")).await?;
    info!(
        "Software {}, hardware {}",
        version.field_str("software_version").unwrap_or("?"),
        version.field_u64("hardware_version").unwrap_or_default()
    );

    let state = session.request(Request::by_name("GW_GET_STATE_REQ")).await?;
    info!("Gateway state {:?}", state.field_u64("gateway_state"));

    session
        .request(Request::by_name("GW_HOUSE_STATUS_MONITOR_ENABLE_REQ"))
        .await?;

    let mut notifications = session.notification_stream();
    loop {
        tokio::select! {
            notification = notifications.next() => match notification {
                Some(Ok(record)) => info!("{}: {:?}", record.opcode_name.unwrap_or("unknown"), record.fields),
                Some(Err(e)) => warn!("Missed notifications: {}", e),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.end().await?;
    Ok(())
}
