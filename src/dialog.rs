//! Dialog correlation.
//!
//! Identifier generation lives behind [`IdGenerator`] so tests can script
//! Call-IDs, tags and branches. [`Dialog`] holds the caller's view of one call
//! and builds every request the caller sends within it.

use crate::config::UacConfig;
use crate::utils;
use crate::{
    CSeq, NameAddr, Result, SipError, SipHeaders, SipMessage, SipMethod, SipRequest, SipResponse,
    SipUri, Via, BRANCH_MAGIC_COOKIE,
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Source of Call-IDs, tags and Via branches.
pub trait IdGenerator: Send + Sync {
    fn call_id(&self, host: &str) -> String;

    fn tag(&self) -> String;

    /// Must start with the `z9hG4bK` magic cookie.
    fn branch(&self) -> String;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RandomIdGenerator;

impl IdGenerator for RandomIdGenerator {
    fn call_id(&self, host: &str) -> String {
        utils::generate_call_id(host)
    }

    fn tag(&self) -> String {
        utils::generate_tag()
    }

    fn branch(&self) -> String {
        utils::generate_branch()
    }
}

/// Hands out preset identifiers in order, then numbered ones.
#[derive(Debug, Default)]
pub struct ScriptedIdGenerator {
    call_ids: Mutex<VecDeque<String>>,
    tags: Mutex<VecDeque<String>>,
    branches: Mutex<VecDeque<String>>,
    counter: AtomicU64,
}

fn queue<I, S>(values: I) -> Mutex<VecDeque<String>>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Mutex::new(values.into_iter().map(Into::into).collect())
}

impl ScriptedIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_call_ids<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.call_ids = queue(values);
        self
    }

    pub fn with_tags<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = queue(values);
        self
    }

    pub fn with_branches<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.branches = queue(values);
        self
    }

    fn next_number(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl IdGenerator for ScriptedIdGenerator {
    fn call_id(&self, host: &str) -> String {
        let scripted = self.call_ids.lock().pop_front();
        scripted.unwrap_or_else(|| format!("{}@{}", self.next_number(), host))
    }

    fn tag(&self) -> String {
        let scripted = self.tags.lock().pop_front();
        scripted.unwrap_or_else(|| format!("tag-{}", self.next_number()))
    }

    fn branch(&self) -> String {
        let scripted = self.branches.lock().pop_front();
        scripted.unwrap_or_else(|| format!("{}-{}", BRANCH_MAGIC_COOKIE, self.next_number()))
    }
}

/// To tag of a response; `None` until the UAS has assigned one.
pub fn extract_to_tag(response: &SipResponse) -> Option<&str> {
    response.headers.to.tag.as_deref()
}

pub fn extract_from_tag(message: &SipMessage) -> Option<&str> {
    message.headers().from.tag.as_deref()
}

/// Branch of the top Via
pub fn extract_branch(message: &SipMessage) -> Option<&str> {
    message
        .headers()
        .top_via()
        .map(|via| via.branch.as_str())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    /// INVITE built, no final response yet
    Calling,
    /// Final 2xx with a To tag received
    Confirmed,
    Terminated,
}

/// Caller side dialog.
///
/// Call-ID and the local tag are fixed at creation. The remote tag is fixed by
/// the first final response that establishes the dialog.
#[derive(Debug, Clone)]
pub struct Dialog {
    call_id: String,
    local: NameAddr,
    remote: NameAddr,
    request_uri: SipUri,
    contact: SipUri,
    local_addr: SocketAddr,
    local_seq: u32,
    invite_seq: u32,
    max_forwards: u32,
    subject: String,
    offer: Bytes,
    state: DialogState,
}

impl Dialog {
    pub fn new_uac(config: &UacConfig, local_addr: SocketAddr, ids: &dyn IdGenerator) -> Self {
        let local_uri = SipUri::from_addr(Some(&config.local_user), local_addr);
        let remote_uri = SipUri::from_addr(Some(&config.remote_user), config.server_addr);
        let local_tag = ids.tag();

        Self {
            call_id: ids.call_id(&utils::host_string(local_addr.ip())),
            local: NameAddr::new(Some(&config.local_display), local_uri.clone()).with_tag(&local_tag),
            remote: NameAddr::new(Some(&config.remote_display), remote_uri.clone()),
            request_uri: remote_uri,
            contact: local_uri,
            local_addr,
            local_seq: 0,
            invite_seq: 0,
            max_forwards: config.max_forwards,
            subject: config.subject.clone(),
            offer: config.sdp_body.clone(),
            state: DialogState::Calling,
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn local_tag(&self) -> Option<&str> {
        self.local.tag.as_deref()
    }

    pub fn remote_tag(&self) -> Option<&str> {
        self.remote.tag.as_deref()
    }

    pub fn local_seq(&self) -> u32 {
        self.local_seq
    }

    pub fn state(&self) -> DialogState {
        self.state
    }

    fn body_for(&self, method: &SipMethod) -> Bytes {
        match method {
            SipMethod::Invite | SipMethod::Bye => self.offer.clone(),
            _ => Bytes::new(),
        }
    }

    fn request(&self, method: SipMethod, seq: u32, ids: &dyn IdGenerator) -> SipRequest {
        let headers = SipHeaders {
            call_id: self.call_id.clone(),
            cseq: CSeq::new(seq, method.clone()),
            from: self.local.clone(),
            to: self.remote.clone(),
            via: vec![Via::udp(self.local_addr, &ids.branch())],
            contact: Some(self.contact.clone()),
            max_forwards: Some(self.max_forwards),
            subject: Some(self.subject.clone()),
            other: Vec::new(),
        };
        let body = self.body_for(&method);

        SipRequest::new(method, self.request_uri.clone(), headers).with_body(body)
    }

    /// First INVITE of the dialog: CSeq 1, no To tag.
    pub fn initial_invite(&mut self, ids: &dyn IdGenerator) -> Result<SipRequest> {
        if self.local_seq != 0 {
            return Err(SipError::InvalidState("INVITE already sent in this dialog"));
        }
        self.local_seq = 1;
        self.invite_seq = self.local_seq;
        Ok(self.request(SipMethod::Invite, self.local_seq, ids))
    }

    /// Confirms the dialog from the final 2xx to INVITE.
    pub fn establish(&mut self, response: &SipResponse) -> Result<()> {
        if response.headers.call_id != self.call_id {
            return Err(SipError::UnexpectedMessage(format!(
                "Call-ID {} does not belong to dialog {}",
                response.headers.call_id, self.call_id
            )));
        }
        if response.headers.from.tag != self.local.tag {
            return Err(SipError::UnexpectedMessage(
                "From tag changed in response".to_string(),
            ));
        }

        let to_tag = extract_to_tag(response).ok_or(SipError::MissingDialogField("To tag"))?;

        if let Some(existing) = self.remote.tag.as_deref() {
            if existing != to_tag {
                return Err(SipError::UnexpectedMessage(format!(
                    "To tag {} conflicts with established tag {}",
                    to_tag, existing
                )));
            }
        }

        self.remote.tag = Some(to_tag.to_string());
        self.state = DialogState::Confirmed;
        Ok(())
    }

    /// ACK for the 2xx: reuses the INVITE's CSeq number with a fresh branch.
    pub fn build_ack(&self, ids: &dyn IdGenerator) -> Result<SipRequest> {
        if self.remote.tag.is_none() {
            return Err(SipError::MissingDialogField("To tag"));
        }
        Ok(self.request(SipMethod::Ack, self.invite_seq, ids))
    }

    /// Next in-dialog request: CSeq incremented, tags reused, fresh branch.
    pub fn build_next_request(
        &mut self,
        ids: &dyn IdGenerator,
        method: SipMethod,
    ) -> Result<SipRequest> {
        if self.state != DialogState::Confirmed {
            return Err(SipError::InvalidState("dialog is not confirmed"));
        }
        if self.remote.tag.is_none() {
            return Err(SipError::MissingDialogField("To tag"));
        }
        if method == SipMethod::Ack {
            return Err(SipError::InvalidState("ACK is built with build_ack"));
        }

        self.local_seq += 1;
        Ok(self.request(method, self.local_seq, ids))
    }

    pub fn terminate(&mut self) {
        self.state = DialogState::Terminated;
    }
}
