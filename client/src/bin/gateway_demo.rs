use anyhow::{Context, Result};
use serde_json::json;
use std::sync::Arc;
use tb_client::{rpc_handler, GatewayMultiplexer};
use tb_shared::{load_config, AttributeUpdate};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEVICE: &str = "ImageTest";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config().context("loading configuration")?;
    info!("Connecting gateway to {}:{}", config.host, config.port);

    let gateway = GatewayMultiplexer::new(config);
    gateway.connect().await.context("connecting to platform")?;
    gateway.connect_device(DEVICE, "default").await?;

    let log_update = |label: &'static str| {
        Arc::new(move |update: &AttributeUpdate| {
            info!("[{}] {:?}: {}", label, update.device, update.data);
        })
    };

    gateway.subscribe_to_all_attributes(log_update("all")).await;
    gateway
        .subscribe_to_attribute(DEVICE, "image", log_update("image"))
        .await?;
    let device_sub = gateway
        .subscribe_to_all_device_attributes(DEVICE, log_update("device"))
        .await?;
    gateway.unsubscribe(device_sub).await;

    {
        let replier = gateway.clone();
        gateway
            .set_server_side_rpc_request_handler(rpc_handler(move |request| {
                let replier = replier.clone();
                tokio::spawn(async move {
                    let Some(device) = request.device.clone() else { return };
                    let reply = json!({ "method": request.method, "ok": true });
                    if let Err(e) = replier.send_rpc_reply(&device, request.id, reply).await {
                        tracing::warn!("RPC reply for {} failed: {}", device, e);
                    }
                });
            }))
            .await;
    }

    gateway.send_telemetry(DEVICE, json!({ "temperature": 21.5 })).await?;

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal, disconnecting");

    gateway.disconnect_device(DEVICE).await?;
    gateway.disconnect().await?;
    Ok(())
}
