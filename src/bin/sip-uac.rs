// sip-uac.rs - Places one call: INVITE, ACK, BYE

use anyhow::{Context, Result};
use sip_callflow::{config::UacConfig, transport::UdpTransport, uac::SessionDriver};
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

    let config = UacConfig::from_env()?;
    info!("Starting SIP UAC, calling {}", config.server_addr);

    let transport = UdpTransport::bind(config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind UDP socket on {}", config.bind_addr))?;

    let mut driver = SessionDriver::new(config, transport);
    let report = driver.run().await.context("Call failed")?;

    info!(
        "Call {} finished (local tag {}, remote tag {})",
        report.call_id, report.local_tag, report.remote_tag
    );
    Ok(())
}
