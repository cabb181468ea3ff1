// lib.rs - SIP message model for a minimal UAC/UAS call pair

use bytes::Bytes;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use thiserror::Error;

pub mod codec;
pub mod config;
pub mod dialog;
pub mod parser;
pub mod transport;
pub mod uac;
pub mod uas;
pub mod utils;

pub use parser::parse_sip_message;

pub const SIP_VERSION: &str = "SIP/2.0";

// A UDP datagram can never carry more than this
pub const MAX_MESSAGE_SIZE: usize = 65535;
pub const MAX_HEADERS: usize = 256;
pub const MAX_METHOD_LENGTH: usize = 32;

/// Prefix marking a Via branch as RFC 3261 compliant
pub const BRANCH_MAGIC_COOKIE: &str = "z9hG4bK";
pub const DEFAULT_MAX_FORWARDS: u32 = 70;

#[derive(Error, Debug)]
pub enum SipParseError {
    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("Too many headers: {0} (max: {1})")]
    TooManyHeaders(usize, usize),

    #[error("Invalid start line: {0}")]
    InvalidStartLine(String),

    #[error("Invalid SIP version: {0}")]
    InvalidVersion(String),

    #[error("Invalid method: {0}")]
    InvalidMethod(String),

    #[error("Invalid status code: {0}")]
    InvalidStatusCode(String),

    #[error("Missing required header: {0}")]
    MissingRequiredHeader(&'static str),

    #[error("Malformed {0} header: {1}")]
    MalformedHeader(&'static str, String),

    #[error("Missing {param} parameter in {header} header")]
    MissingParameter {
        header: &'static str,
        param: &'static str,
    },

    #[error("Content-Length mismatch: header={declared}, actual={actual}")]
    ContentLengthMismatch { declared: usize, actual: usize },

    #[error("Parse error: {0}")]
    ParseError(String),
}

/// Errors surfaced by the call-flow components.
#[derive(Error, Debug)]
pub enum SipError {
    #[error("Transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("Timed out waiting for a message")]
    Timeout,

    #[error("Malformed message: {0}")]
    MalformedMessage(#[from] SipParseError),

    #[error("Missing dialog field: {0}")]
    MissingDialogField(&'static str),

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Call rejected: {status} {reason}")]
    Rejected { status: u16, reason: String },

    #[error("Invalid state: {0}")]
    InvalidState(&'static str),
}

pub type Result<T, E = SipError> = std::result::Result<T, E>;

/// Generic `;name[=value]` parameter list, kept in wire order.
pub type Params = Vec<(String, Option<String>)>;

pub(crate) fn find_param<'a>(params: &'a Params, name: &str) -> Option<&'a Option<String>> {
    params
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value)
}

fn write_params(f: &mut fmt::Formatter<'_>, params: &Params) -> fmt::Result {
    for (key, value) in params {
        write!(f, ";{}", key)?;
        if let Some(val) = value {
            write!(f, "={}", val)?;
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Invite,
    Ack,
    Bye,
    Cancel,
    Options,
    Register,
    Info,
    Update,
    Other(String),
}

impl FromStr for SipMethod {
    type Err = SipParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.len() > MAX_METHOD_LENGTH {
            return Err(SipParseError::InvalidMethod(s.to_string()));
        }

        if !s.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(SipParseError::InvalidMethod(s.to_string()));
        }

        // Method names are case-sensitive
        Ok(match s {
            "INVITE" => SipMethod::Invite,
            "ACK" => SipMethod::Ack,
            "BYE" => SipMethod::Bye,
            "CANCEL" => SipMethod::Cancel,
            "OPTIONS" => SipMethod::Options,
            "REGISTER" => SipMethod::Register,
            "INFO" => SipMethod::Info,
            "UPDATE" => SipMethod::Update,
            method => SipMethod::Other(method.to_string()),
        })
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SipMethod::Invite => write!(f, "INVITE"),
            SipMethod::Ack => write!(f, "ACK"),
            SipMethod::Bye => write!(f, "BYE"),
            SipMethod::Cancel => write!(f, "CANCEL"),
            SipMethod::Options => write!(f, "OPTIONS"),
            SipMethod::Register => write!(f, "REGISTER"),
            SipMethod::Info => write!(f, "INFO"),
            SipMethod::Update => write!(f, "UPDATE"),
            SipMethod::Other(s) => write!(f, "{}", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipUri {
    pub scheme: String,
    pub user: Option<String>,
    /// Host as written on the wire; IPv6 literals keep their brackets.
    pub host: String,
    pub port: Option<u16>,
    pub parameters: Params,
}

impl SipUri {
    pub fn new(scheme: &str, host: &str) -> Self {
        Self {
            scheme: scheme.to_string(),
            user: None,
            host: host.to_string(),
            port: None,
            parameters: Vec::new(),
        }
    }

    /// `sip:[user@]ip:port` for a socket address.
    pub fn from_addr(user: Option<&str>, addr: SocketAddr) -> Self {
        Self {
            scheme: "sip".to_string(),
            user: user.map(str::to_string),
            host: utils::host_string(addr.ip()),
            port: Some(addr.port()),
            parameters: Vec::new(),
        }
    }

    pub fn with_parameter(mut self, name: &str, value: Option<&str>) -> Self {
        self.parameters
            .push((name.to_string(), value.map(str::to_string)));
        self
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        find_param(&self.parameters, name).and_then(|value| value.as_deref())
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;

        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }

        write!(f, "{}", self.host)?;

        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }

        write_params(f, &self.parameters)
    }
}

/// From/To value: `display <uri>;tag=...`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAddr {
    pub display_name: Option<String>,
    pub uri: SipUri,
    pub tag: Option<String>,
    /// Header parameters other than `tag`
    pub params: Params,
}

impl NameAddr {
    pub fn new(display_name: Option<&str>, uri: SipUri) -> Self {
        Self {
            display_name: display_name.map(str::to_string),
            uri,
            tag: None,
            params: Vec::new(),
        }
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        self.tag = Some(tag.to_string());
        self
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(display) = &self.display_name {
            if !display.is_empty() && display.chars().all(utils::is_token_char) {
                write!(f, "{} ", display)?;
            } else {
                let escaped = display.replace('\\', "\\\\").replace('"', "\\\"");
                write!(f, "\"{}\" ", escaped)?;
            }
        }

        write!(f, "<{}>", self.uri)?;

        if let Some(tag) = &self.tag {
            write!(f, ";tag={}", tag)?;
        }

        write_params(f, &self.params)
    }
}

/// A single Via entry: `SIP/2.0/<protocol> host[:port];branch=...`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Via {
    pub protocol: String,
    pub host: String,
    pub port: Option<u16>,
    pub branch: String,
    /// Parameters other than `branch`
    pub params: Params,
}

impl Via {
    pub fn udp(addr: SocketAddr, branch: &str) -> Self {
        Self {
            protocol: "UDP".to_string(),
            host: utils::host_string(addr.ip()),
            port: Some(addr.port()),
            branch: branch.to_string(),
            params: Vec::new(),
        }
    }
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} {}", SIP_VERSION, self.protocol, self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        write!(f, ";branch={}", self.branch)?;
        write_params(f, &self.params)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CSeq {
    pub number: u32,
    pub method: SipMethod,
}

impl CSeq {
    pub fn new(number: u32, method: SipMethod) -> Self {
        Self { number, method }
    }
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.number, self.method)
    }
}

/// Header fields shared by requests and responses.
///
/// Content-Length is not stored: it is always derived from the body when a
/// message is serialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipHeaders {
    pub call_id: String,
    pub cseq: CSeq,
    pub from: NameAddr,
    pub to: NameAddr,
    /// Via entries in wire order; the first one is the top Via.
    pub via: Vec<Via>,
    pub contact: Option<SipUri>,
    pub max_forwards: Option<u32>,
    pub subject: Option<String>,
    /// Headers this model does not interpret, in wire order
    pub other: Vec<(String, String)>,
}

impl SipHeaders {
    pub fn top_via(&self) -> Option<&Via> {
        self.via.first()
    }

    pub fn other_header(&self, name: &str) -> Option<&str> {
        self.other
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipRequest {
    pub method: SipMethod,
    pub uri: SipUri,
    pub headers: SipHeaders,
    pub body: Bytes,
}

impl SipRequest {
    pub fn new(method: SipMethod, uri: SipUri, headers: SipHeaders) -> Self {
        Self {
            method,
            uri,
            headers,
            body: Bytes::new(),
        }
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn content_length(&self) -> usize {
        self.body.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipResponse {
    pub status_code: u16,
    pub reason_phrase: String,
    pub headers: SipHeaders,
    pub body: Bytes,
}

impl SipResponse {
    pub fn new(status_code: u16, reason_phrase: &str, headers: SipHeaders) -> Self {
        Self {
            status_code,
            reason_phrase: reason_phrase.to_string(),
            headers,
            body: Bytes::new(),
        }
    }

    pub fn content_length(&self) -> usize {
        self.body.len()
    }

    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.status_code)
    }

    pub fn is_final(&self) -> bool {
        self.status_code >= 200
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    pub fn headers(&self) -> &SipHeaders {
        match self {
            SipMessage::Request(req) => &req.headers,
            SipMessage::Response(resp) => &resp.headers,
        }
    }

    pub fn body(&self) -> &Bytes {
        match self {
            SipMessage::Request(req) => &req.body,
            SipMessage::Response(resp) => &resp.body,
        }
    }

    pub fn content_length(&self) -> usize {
        self.body().len()
    }

    pub fn call_id(&self) -> &str {
        &self.headers().call_id
    }

    pub fn cseq(&self) -> &CSeq {
        &self.headers().cseq
    }

    /// Short label for logs: the method for requests, `code reason` for responses.
    pub fn summary(&self) -> String {
        match self {
            SipMessage::Request(req) => req.method.to_string(),
            SipMessage::Response(resp) => format!("{} {}", resp.status_code, resp.reason_phrase),
        }
    }
}

impl From<SipRequest> for SipMessage {
    fn from(request: SipRequest) -> Self {
        SipMessage::Request(request)
    }
}

impl From<SipResponse> for SipMessage {
    fn from(response: SipResponse) -> Self {
        SipMessage::Response(response)
    }
}
