//! Caller side session driver.
//!
//! Runs one INVITE, ACK, BYE sequence against a configured UAS:
//!
//! ```text
//!   UAC                     UAS
//!    | ------- INVITE -----> |
//!    | <------ 180 --------- |   (skipped)
//!    | <------ 200 --------- |
//!    | ------- ACK --------> |
//!    | ------- BYE --------> |
//!    | <------ 200 --------- |
//! ```

use crate::config::UacConfig;
use crate::dialog::{Dialog, IdGenerator, RandomIdGenerator};
use crate::transport::Transport;
use crate::utils::is_response_to;
use crate::{Result, SipError, SipMessage, SipMethod, SipRequest, SipResponse};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UacState {
    Idle,
    InviteSent,
    AckSent,
    ByeSent,
    Done,
    Error,
}

/// Outcome of a completed call.
#[derive(Debug, Clone)]
pub struct CallReport {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
    pub invite_status: u16,
    pub bye_status: u16,
    /// Requests in the order they were sent
    pub sent: Vec<SipRequest>,
}

pub struct SessionDriver<T: Transport> {
    config: UacConfig,
    transport: T,
    ids: Arc<dyn IdGenerator>,
    state: UacState,
    sent: Vec<SipRequest>,
}

impl<T: Transport> SessionDriver<T> {
    pub fn new(config: UacConfig, transport: T) -> Self {
        Self::with_id_generator(config, transport, Arc::new(RandomIdGenerator))
    }

    pub fn with_id_generator(config: UacConfig, transport: T, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            config,
            transport,
            ids,
            state: UacState::Idle,
            sent: Vec::new(),
        }
    }

    pub fn state(&self) -> UacState {
        self.state
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Runs the call to completion. Any failure leaves the driver in
    /// [`UacState::Error`].
    pub async fn run(&mut self) -> Result<CallReport> {
        if self.state != UacState::Idle {
            return Err(SipError::InvalidState("session driver already ran"));
        }

        match self.call().await {
            Ok(report) => {
                self.state = UacState::Done;
                info!(
                    "Call {} completed: INVITE {}, BYE {}",
                    report.call_id, report.invite_status, report.bye_status
                );
                Ok(report)
            }
            Err(e) => {
                self.state = UacState::Error;
                error!("Call failed: {}", e);
                Err(e)
            }
        }
    }

    async fn call(&mut self) -> Result<CallReport> {
        let server = self.config.server_addr;
        let ids = Arc::clone(&self.ids);
        let mut dialog = Dialog::new_uac(&self.config, self.transport.local_addr()?, ids.as_ref());

        let invite = dialog.initial_invite(ids.as_ref())?;
        self.send(&invite).await?;
        self.state = UacState::InviteSent;
        info!("INVITE sent to {} (Call-ID {})", server, dialog.call_id());

        let answer = self.await_final(&invite).await?;
        if !answer.is_success() {
            return Err(SipError::Rejected {
                status: answer.status_code,
                reason: answer.reason_phrase,
            });
        }
        dialog.establish(&answer)?;

        let ack = dialog.build_ack(ids.as_ref())?;
        self.send(&ack).await?;
        self.state = UacState::AckSent;

        // Nothing answers an ACK; anything that shows up is only logged
        let ack_deadline = Instant::now() + self.config.ack_response_wait;
        match self.transport.recv(Some(ack_deadline)).await {
            Ok((message, source)) => {
                debug!("Ignoring {} from {} after ACK", message.summary(), source)
            }
            Err(SipError::Timeout) => {}
            Err(SipError::MalformedMessage(e)) => {
                debug!("Ignoring malformed datagram after ACK: {}", e)
            }
            Err(e) => return Err(e),
        }

        let bye = dialog.build_next_request(ids.as_ref(), SipMethod::Bye)?;
        self.send(&bye).await?;
        self.state = UacState::ByeSent;

        let bye_answer = self.await_final(&bye).await?;
        if !bye_answer.is_success() {
            warn!(
                "BYE answered with {} {}",
                bye_answer.status_code, bye_answer.reason_phrase
            );
        }
        dialog.terminate();

        Ok(CallReport {
            call_id: dialog.call_id().to_string(),
            local_tag: dialog.local_tag().unwrap_or_default().to_string(),
            remote_tag: dialog.remote_tag().unwrap_or_default().to_string(),
            invite_status: answer.status_code,
            bye_status: bye_answer.status_code,
            sent: std::mem::take(&mut self.sent),
        })
    }

    async fn send(&mut self, request: &SipRequest) -> Result<()> {
        let message = SipMessage::Request(request.clone());
        self.transport.send(&message, self.config.server_addr).await?;
        self.sent.push(request.clone());
        Ok(())
    }

    /// Waits for the final response to `request`. Provisional responses and
    /// well-formed messages from other transactions are skipped; a datagram
    /// that does not parse ends the wait. The deadline covers the whole wait.
    async fn await_final(&self, request: &SipRequest) -> Result<SipResponse> {
        let deadline = Instant::now() + self.config.response_timeout;

        loop {
            let (message, source) = self.transport.recv(Some(deadline)).await?;

            let response = match message {
                SipMessage::Response(response) if is_response_to(request, &response) => response,
                other => {
                    warn!("Ignoring stray {} from {}", other.summary(), source);
                    continue;
                }
            };

            info!(
                "{} {} for {}",
                response.status_code, response.reason_phrase, request.method
            );
            if response.is_final() {
                return Ok(response);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialog::ScriptedIdGenerator;
    use crate::transport::MemoryTransport;
    use crate::utils::build_response_from_request;
    use std::net::SocketAddr;
    use std::time::Duration;

    fn client() -> SocketAddr {
        "127.0.0.1:5061".parse().unwrap()
    }

    fn server() -> SocketAddr {
        "127.0.0.1:5060".parse().unwrap()
    }

    fn driver(transport: MemoryTransport) -> SessionDriver<MemoryTransport> {
        let ids = ScriptedIdGenerator::new()
            .with_call_ids(["123@127.0.0.1"])
            .with_tags(["T1"]);
        SessionDriver::with_id_generator(UacConfig::default(), transport, Arc::new(ids))
    }

    async fn next_request(uas: &MemoryTransport) -> SipRequest {
        match uas.recv(None).await.unwrap().0 {
            SipMessage::Request(request) => request,
            SipMessage::Response(_) => panic!("Expected request"),
        }
    }

    async fn reply(uas: &MemoryTransport, request: &SipRequest, status: u16, reason: &str) {
        let response = build_response_from_request(request, status, reason, Some("T2"), None);
        uas.send(&response.into(), client()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_call() {
        let (uac_side, uas) = MemoryTransport::pair(client(), server());
        let mut driver = driver(uac_side);

        let peer = tokio::spawn(async move {
            let invite = next_request(&uas).await;
            reply(&uas, &invite, 180, "Ringing").await;
            reply(&uas, &invite, 200, "OK").await;

            let ack = next_request(&uas).await;
            assert_eq!(ack.method, SipMethod::Ack);

            let bye = next_request(&uas).await;
            reply(&uas, &bye, 200, "OK").await;
        });

        let report = driver.run().await.unwrap();
        peer.await.unwrap();

        assert_eq!(driver.state(), UacState::Done);
        assert_eq!(report.call_id, "123@127.0.0.1");
        assert_eq!(report.local_tag, "T1");
        assert_eq!(report.remote_tag, "T2");
        assert_eq!(report.invite_status, 200);
        assert_eq!(report.bye_status, 200);

        let methods: Vec<_> = report.sent.iter().map(|r| r.method.clone()).collect();
        assert_eq!(methods, [SipMethod::Invite, SipMethod::Ack, SipMethod::Bye]);
        assert_eq!(report.sent[2].headers.cseq.number, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invite_timeout() {
        let (uac_side, _uas) = MemoryTransport::pair(client(), server());
        let mut driver = driver(uac_side);

        assert!(matches!(driver.run().await, Err(SipError::Timeout)));
        assert_eq!(driver.state(), UacState::Error);
        assert!(matches!(driver.run().await, Err(SipError::InvalidState(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_call_sends_no_ack() {
        let (uac_side, uas) = MemoryTransport::pair(client(), server());
        let mut driver = driver(uac_side);

        let peer = tokio::spawn(async move {
            let invite = next_request(&uas).await;
            reply(&uas, &invite, 486, "Busy Here").await;

            let deadline = Instant::now() + Duration::from_secs(10);
            assert!(matches!(uas.recv(Some(deadline)).await, Err(SipError::Timeout)));
        });

        let result = driver.run().await;
        assert!(matches!(result, Err(SipError::Rejected { status: 486, .. })));
        assert_eq!(driver.state(), UacState::Error);
        peer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_untagged_answer_is_error() {
        let (uac_side, uas) = MemoryTransport::pair(client(), server());
        let mut driver = driver(uac_side);

        let peer = tokio::spawn(async move {
            let invite = next_request(&uas).await;
            let response = build_response_from_request(&invite, 200, "OK", None, None);
            uas.send(&response.into(), client()).await.unwrap();
            uas
        });

        assert!(matches!(
            driver.run().await,
            Err(SipError::MissingDialogField("To tag"))
        ));
        peer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreign_call_is_skipped() {
        let (uac_side, uas) = MemoryTransport::pair(client(), server());
        let mut driver = driver(uac_side);

        let peer = tokio::spawn(async move {
            let invite = next_request(&uas).await;

            let mut foreign = build_response_from_request(&invite, 200, "OK", Some("X"), None);
            foreign.headers.call_id = "other@host".to_string();
            uas.send(&foreign.into(), client()).await.unwrap();

            reply(&uas, &invite, 200, "OK").await;
            next_request(&uas).await;
            let bye = next_request(&uas).await;
            reply(&uas, &bye, 481, "Call/Transaction Does Not Exist").await;
        });

        let report = driver.run().await.unwrap();
        peer.await.unwrap();
        assert_eq!(report.remote_tag, "T2");
        assert_eq!(report.bye_status, 481);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_answer_aborts_call() {
        let (uac_side, uas) = MemoryTransport::pair(client(), server());
        let mut driver = driver(uac_side);

        let peer = tokio::spawn(async move {
            let invite = next_request(&uas).await;
            uas.send_bytes("garbage that is not SIP").unwrap();
            reply(&uas, &invite, 200, "OK").await;

            let deadline = Instant::now() + Duration::from_secs(10);
            assert!(matches!(uas.recv(Some(deadline)).await, Err(SipError::Timeout)));
        });

        assert!(matches!(
            driver.run().await,
            Err(SipError::MalformedMessage(_))
        ));
        assert_eq!(driver.state(), UacState::Error);
        peer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_wait_tolerates_garbage() {
        let (uac_side, uas) = MemoryTransport::pair(client(), server());
        let mut driver = driver(uac_side);

        let peer = tokio::spawn(async move {
            let invite = next_request(&uas).await;
            reply(&uas, &invite, 200, "OK").await;

            let ack = next_request(&uas).await;
            assert_eq!(ack.method, SipMethod::Ack);
            uas.send_bytes("garbage after ACK").unwrap();

            let bye = next_request(&uas).await;
            reply(&uas, &bye, 200, "OK").await;
        });

        let report = driver.run().await.unwrap();
        peer.await.unwrap();
        assert_eq!(driver.state(), UacState::Done);
        assert_eq!(report.bye_status, 200);
    }
}
