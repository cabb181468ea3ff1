//! Callee side responder.
//!
//! Every datagram is handled on its own using only the fields of the request
//! being answered. Nothing is kept between calls.

use crate::config::UasConfig;
use crate::dialog::{IdGenerator, RandomIdGenerator};
use crate::transport::Transport;
use crate::utils::{build_response_from_request, get_dialog_id};
use crate::{Result, SipError, SipMessage, SipMethod, SipRequest, SipResponse, SipUri};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// What the responder did with one datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// INVITE answered with 180 then 200 under this To tag
    Answered { to_tag: String },
    /// ACK received; nothing sent
    Acknowledged,
    /// BYE answered with 200
    Released,
    /// Response or unsupported method
    Ignored,
}

pub struct Responder<T: Transport> {
    config: UasConfig,
    transport: T,
    ids: Arc<dyn IdGenerator>,
}

impl<T: Transport> Responder<T> {
    pub fn new(config: UasConfig, transport: T) -> Self {
        Self::with_id_generator(config, transport, Arc::new(RandomIdGenerator))
    }

    pub fn with_id_generator(config: UasConfig, transport: T, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            config,
            transport,
            ids,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Receive loop. Malformed datagrams and failures while answering are
    /// logged and the loop carries on. A failed receive means the transport
    /// is gone and ends the loop with that error.
    pub async fn run(&self) -> Result<()> {
        info!("Responder listening on {}", self.transport.local_addr()?);

        loop {
            let (message, source) = match self.transport.recv(None).await {
                Ok(received) => received,
                Err(SipError::MalformedMessage(e)) => {
                    warn!("Dropping malformed datagram: {}", e);
                    continue;
                }
                Err(e) => {
                    error!("Receive failed, stopping responder: {}", e);
                    return Err(e);
                }
            };

            if let Err(e) = self.handle(message, source).await {
                warn!("Failed to handle datagram from {}: {}", source, e);
            }
        }
    }

    /// Receives and handles a single datagram.
    pub async fn serve_one(&self, deadline: Option<Instant>) -> Result<Disposition> {
        let (message, source) = self.transport.recv(deadline).await?;
        self.handle(message, source).await
    }

    pub async fn handle(&self, message: SipMessage, source: SocketAddr) -> Result<Disposition> {
        let request = match message {
            SipMessage::Request(request) => request,
            SipMessage::Response(response) => {
                debug!(
                    "Ignoring {} {} from {}",
                    response.status_code, response.reason_phrase, source
                );
                return Ok(Disposition::Ignored);
            }
        };

        match request.method {
            SipMethod::Invite => self.answer_invite(&request, source).await,
            SipMethod::Ack => {
                info!("ACK received for Call-ID {}", request.headers.call_id);
                Ok(Disposition::Acknowledged)
            }
            SipMethod::Bye => self.answer_bye(&request, source).await,
            ref other => {
                debug!("Ignoring {} from {}", other, source);
                Ok(Disposition::Ignored)
            }
        }
    }

    fn contact(&self) -> Result<SipUri> {
        let local = self.transport.local_addr()?;
        Ok(SipUri::from_addr(None, local).with_parameter("transport", Some("UDP")))
    }

    fn response(
        &self,
        request: &SipRequest,
        status: u16,
        reason: &str,
        to_tag: &str,
    ) -> Result<SipResponse> {
        Ok(build_response_from_request(
            request,
            status,
            reason,
            Some(to_tag),
            Some(self.contact()?),
        ))
    }

    async fn reply(&self, response: SipResponse, destination: SocketAddr) -> Result<()> {
        self.transport.send(&response.into(), destination).await
    }

    async fn answer_invite(&self, request: &SipRequest, source: SocketAddr) -> Result<Disposition> {
        if request.headers.from.tag.is_none() {
            return Err(SipError::MissingDialogField("From tag"));
        }
        info!(
            "INVITE from {} (Call-ID {})",
            source, request.headers.call_id
        );

        let to_tag = self.ids.tag();
        self.reply(self.response(request, 180, "Ringing", &to_tag)?, source)
            .await?;

        // Blocks this loop; calls are handled one at a time
        tokio::time::sleep(self.config.ringing_delay).await;

        self.reply(self.response(request, 200, "OK", &to_tag)?, source)
            .await?;

        Ok(Disposition::Answered { to_tag })
    }

    async fn answer_bye(&self, request: &SipRequest, source: SocketAddr) -> Result<Disposition> {
        let headers = &request.headers;
        if headers.from.tag.is_none() {
            return Err(SipError::MissingDialogField("From tag"));
        }
        let to_tag = headers
            .to
            .tag
            .as_deref()
            .ok_or(SipError::MissingDialogField("To tag"))?;

        info!(
            "BYE from {} for dialog {}",
            source,
            get_dialog_id(headers).unwrap_or_default()
        );
        self.reply(self.response(request, 200, "OK", to_tag)?, source)
            .await?;

        Ok(Disposition::Released)
    }
}
