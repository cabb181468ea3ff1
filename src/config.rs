//! Endpoint configuration.
//!
//! Addresses and timings are supplied here and passed into the session driver
//! and responder at construction; defaults match a loopback test setup and
//! can be overridden from the environment.

use anyhow::{Context, Result};
use bytes::Bytes;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;
use std::time::Duration;

pub const ENV_SERVER_ADDR: &str = "SIP_SERVER_ADDR";
pub const ENV_CLIENT_ADDR: &str = "SIP_CLIENT_ADDR";
pub const ENV_RESPONSE_TIMEOUT_MS: &str = "SIP_RESPONSE_TIMEOUT_MS";
pub const ENV_ACK_WAIT_MS: &str = "SIP_ACK_WAIT_MS";
pub const ENV_RINGING_DELAY_MS: &str = "SIP_RINGING_DELAY_MS";

const DEFAULT_SERVER_ADDR: SocketAddr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 5060));
const DEFAULT_CLIENT_ADDR: SocketAddr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 5061));

/// SDP offer carried by INVITE and BYE
pub const DEFAULT_SDP: &str = "v=0\r\n\
                               o=user1 53655765 2353687637 IN IP6 [::1]\r\n\
                               s=-\r\n\
                               c=IN IP6 ::1\r\n\
                               t=0 0\r\n\
                               m=audio 6000 RTP/AVP 0\r\n\
                               a=rtpmap:0 PCMU/8000\r\n\
                               a=sendrecv";

fn env_value<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(value) => {
            let parsed = value
                .trim()
                .parse::<T>()
                .with_context(|| format!("Invalid value for {}: {:?}", name, value))?;
            Ok(Some(parsed))
        }
        Err(_) => Ok(None),
    }
}

fn env_millis(name: &str) -> Result<Option<Duration>> {
    Ok(env_value::<u64>(name)?.map(Duration::from_millis))
}

/// Caller side configuration
#[derive(Debug, Clone)]
pub struct UacConfig {
    /// Local address the UAC binds and advertises in Via/Contact/From
    pub bind_addr: SocketAddr,

    /// Address of the UAS
    pub server_addr: SocketAddr,

    pub local_user: String,
    pub local_display: String,
    pub remote_user: String,
    pub remote_display: String,
    pub subject: String,
    pub max_forwards: u32,

    /// Deadline for each response wait (INVITE and BYE)
    pub response_timeout: Duration,

    /// Best-effort wait after ACK; expiry is not an error
    pub ack_response_wait: Duration,

    /// Body sent with INVITE and BYE
    pub sdp_body: Bytes,
}

impl Default for UacConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_CLIENT_ADDR,
            server_addr: DEFAULT_SERVER_ADDR,
            local_user: "sipp".to_string(),
            local_display: "sipp".to_string(),
            remote_user: "service".to_string(),
            remote_display: "service".to_string(),
            subject: "Performance Test".to_string(),
            max_forwards: crate::DEFAULT_MAX_FORWARDS,
            response_timeout: Duration::from_secs(5),
            ack_response_wait: Duration::from_millis(500),
            sdp_body: Bytes::from_static(DEFAULT_SDP.as_bytes()),
        }
    }
}

impl UacConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(addr) = env_value(ENV_SERVER_ADDR)? {
            config.server_addr = addr;
        }
        if let Some(addr) = env_value(ENV_CLIENT_ADDR)? {
            config.bind_addr = addr;
        }
        if let Some(timeout) = env_millis(ENV_RESPONSE_TIMEOUT_MS)? {
            config.response_timeout = timeout;
        }
        if let Some(wait) = env_millis(ENV_ACK_WAIT_MS)? {
            config.ack_response_wait = wait;
        }

        Ok(config)
    }
}

/// Callee side configuration
#[derive(Debug, Clone)]
pub struct UasConfig {
    pub bind_addr: SocketAddr,

    /// Pause between 180 Ringing and 200 OK
    pub ringing_delay: Duration,
}

impl Default for UasConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_SERVER_ADDR,
            ringing_delay: Duration::from_secs(1),
        }
    }
}

impl UasConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(addr) = env_value(ENV_SERVER_ADDR)? {
            config.bind_addr = addr;
        }
        if let Some(delay) = env_millis(ENV_RINGING_DELAY_MS)? {
            config.ringing_delay = delay;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let uac = UacConfig::default();
        assert_eq!(uac.server_addr, "127.0.0.1:5060".parse().unwrap());
        assert_eq!(uac.bind_addr, "127.0.0.1:5061".parse().unwrap());
        assert_eq!(uac.response_timeout, Duration::from_secs(5));
        assert_eq!(uac.max_forwards, 70);
        assert!(uac.sdp_body.starts_with(b"v=0\r\n"));
        assert!(uac.sdp_body.ends_with(b"a=sendrecv"));

        let uas = UasConfig::default();
        assert_eq!(uas.bind_addr, "127.0.0.1:5060".parse().unwrap());
        assert_eq!(uas.ringing_delay, Duration::from_secs(1));
    }

    // Environment is process-global, so every env case lives in one test
    #[test]
    fn test_env_overrides() {
        std::env::set_var(ENV_SERVER_ADDR, "10.0.0.2:5070");
        std::env::set_var(ENV_RESPONSE_TIMEOUT_MS, "250");
        std::env::set_var(ENV_RINGING_DELAY_MS, "10");

        let uac = UacConfig::from_env().unwrap();
        assert_eq!(uac.server_addr, "10.0.0.2:5070".parse().unwrap());
        assert_eq!(uac.response_timeout, Duration::from_millis(250));

        let uas = UasConfig::from_env().unwrap();
        assert_eq!(uas.bind_addr, "10.0.0.2:5070".parse().unwrap());
        assert_eq!(uas.ringing_delay, Duration::from_millis(10));

        std::env::set_var(ENV_ACK_WAIT_MS, "soon");
        assert!(UacConfig::from_env().is_err());

        for name in [
            ENV_SERVER_ADDR,
            ENV_RESPONSE_TIMEOUT_MS,
            ENV_RINGING_DELAY_MS,
            ENV_ACK_WAIT_MS,
        ] {
            std::env::remove_var(name);
        }
    }
}
