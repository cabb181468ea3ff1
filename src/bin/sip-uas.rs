// sip-uas.rs - Answers calls until interrupted

use anyhow::{Context, Result};
use sip_callflow::{config::UasConfig, transport::UdpTransport, uas::Responder};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sip_callflow=debug,sip_uac=info,sip_uas=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = UasConfig::from_env()?;
    info!("Starting SIP UAS");

    let transport = UdpTransport::bind(config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind UDP socket on {}", config.bind_addr))?;
    let responder = Responder::new(config, transport);

    tokio::select! {
        result = responder.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down SIP UAS");
        }
    }

    Ok(())
}
