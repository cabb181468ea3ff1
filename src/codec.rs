// codec.rs - SIP serializer and datagram codec

use crate::{
    parse_sip_message, SipError, SipMessage, SipParseError, SipRequest, SipResponse, SipUri,
    MAX_MESSAGE_SIZE, SIP_VERSION,
};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt::Display;
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

fn put_header(buf: &mut BytesMut, name: &str, value: impl Display) {
    buf.put(format!("{}: {}\r\n", name, value).as_bytes());
}

/// Contact is written bare unless its URI has parameters, which would
/// otherwise be read back as header parameters.
fn contact_value(uri: &SipUri) -> String {
    if uri.parameters.is_empty() {
        uri.to_string()
    } else {
        format!("<{}>", uri)
    }
}

fn estimated_size(message: &SipMessage) -> usize {
    let headers = message.headers();
    // Start line plus fixed header names
    256 + headers.call_id.len()
        + headers.via.len() * 96
        + headers.other.iter().map(|(k, v)| k.len() + v.len() + 4).sum::<usize>()
        + message.content_length()
}

fn write_request(req: &SipRequest, buf: &mut BytesMut) {
    let headers = &req.headers;

    // Request line
    buf.put(format!("{} {} {}\r\n", req.method, req.uri, SIP_VERSION).as_bytes());

    put_header(buf, "Call-ID", &headers.call_id);
    if let Some(contact) = &headers.contact {
        put_header(buf, "Contact", contact_value(contact));
    }
    put_header(buf, "Content-Length", req.content_length());
    put_header(buf, "CSeq", &headers.cseq);
    put_header(buf, "From", &headers.from);
    if let Some(max_forwards) = headers.max_forwards {
        put_header(buf, "Max-Forwards", max_forwards);
    }
    if let Some(subject) = &headers.subject {
        put_header(buf, "Subject", subject);
    }
    put_header(buf, "To", &headers.to);
    for via in &headers.via {
        put_header(buf, "Via", via);
    }
    for (name, value) in &headers.other {
        put_header(buf, name, value);
    }

    // Empty line
    buf.put(&b"\r\n"[..]);

    buf.put_slice(&req.body);
}

fn write_response(resp: &SipResponse, buf: &mut BytesMut) {
    let headers = &resp.headers;

    // Status line
    buf.put(
        format!(
            "{} {} {}\r\n",
            SIP_VERSION, resp.status_code, resp.reason_phrase
        )
        .as_bytes(),
    );

    put_header(buf, "Call-ID", &headers.call_id);
    put_header(buf, "CSeq", &headers.cseq);
    put_header(buf, "From", &headers.from);
    put_header(buf, "To", &headers.to);
    for via in &headers.via {
        put_header(buf, "Via", via);
    }
    if let Some(contact) = &headers.contact {
        put_header(buf, "Contact", contact_value(contact));
    }
    if let Some(max_forwards) = headers.max_forwards {
        put_header(buf, "Max-Forwards", max_forwards);
    }
    if let Some(subject) = &headers.subject {
        put_header(buf, "Subject", subject);
    }
    for (name, value) in &headers.other {
        put_header(buf, name, value);
    }
    put_header(buf, "Content-Length", resp.content_length());

    // Empty line
    buf.put(&b"\r\n"[..]);

    buf.put_slice(&resp.body);
}

/// Renders a message in wire format. Content-Length always equals the body length.
pub fn write_message(message: &SipMessage, buf: &mut BytesMut) {
    buf.reserve(estimated_size(message));
    match message {
        SipMessage::Request(req) => write_request(req, buf),
        SipMessage::Response(resp) => write_response(resp, buf),
    }
}

impl SipMessage {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        write_message(self, &mut buf);
        buf.freeze()
    }
}

/// Datagram codec: every buffer handed to the decoder is exactly one message.
#[derive(Debug, Clone)]
pub struct SipCodec {
    max_message_size: usize,
}

impl Default for SipCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl SipCodec {
    pub fn new() -> Self {
        Self {
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }

    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self { max_message_size }
    }
}

impl Decoder for SipCodec {
    type Item = SipMessage;
    type Error = SipError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if buf.is_empty() {
            return Ok(None);
        }

        let datagram = buf.split();
        if datagram.len() > self.max_message_size {
            return Err(SipParseError::MessageTooLarge(datagram.len(), self.max_message_size).into());
        }

        match parse_sip_message(&datagram) {
            Ok(message) => Ok(Some(message)),
            Err(e) => {
                warn!("Failed to parse SIP datagram: {}", e);
                Err(e.into())
            }
        }
    }
}

impl<'a> Encoder<&'a SipMessage> for SipCodec {
    type Error = SipError;

    fn encode(&mut self, message: &'a SipMessage, buf: &mut BytesMut) -> Result<(), Self::Error> {
        let start = buf.len();
        write_message(message, buf);

        let written = buf.len() - start;
        if written > self.max_message_size {
            buf.truncate(start);
            return Err(SipParseError::MessageTooLarge(written, self.max_message_size).into());
        }

        Ok(())
    }
}

/// Decodes a single received datagram.
pub fn decode_datagram(data: &[u8]) -> Result<SipMessage, SipError> {
    let mut buf = BytesMut::from(data);
    SipCodec::new()
        .decode(&mut buf)?
        .ok_or_else(|| SipParseError::ParseError("Empty datagram".to_string()).into())
}
