// utils.rs - Helper functions and utilities

use crate::{SipHeaders, SipRequest, SipResponse, SipUri, BRANCH_MAGIC_COOKIE};
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use std::net::IpAddr;

pub fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "-.!%*_+`'~".contains(c)
}

fn random_alphanumeric(len: usize) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Generate a unique branch parameter for Via header
pub fn generate_branch() -> String {
    format!("{}{}", BRANCH_MAGIC_COOKIE, random_alphanumeric(16))
}

/// Generate a unique tag
pub fn generate_tag() -> String {
    random_alphanumeric(10)
}

/// Generate a unique Call-ID
pub fn generate_call_id(host: &str) -> String {
    format!("{}@{}", random_alphanumeric(16), host)
}

/// Host part for a URI or Via; IPv6 literals are bracketed.
pub fn host_string(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{}]", v6),
    }
}

/// Build a SIP response from a request.
///
/// Via, From, To, Call-ID and CSeq are echoed. `to_tag` is added to the To
/// header unless it already carries one or the response is 100 Trying.
pub fn build_response_from_request(
    request: &SipRequest,
    status_code: u16,
    reason_phrase: &str,
    to_tag: Option<&str>,
    contact: Option<SipUri>,
) -> SipResponse {
    let mut headers = request.headers.clone();

    if status_code != 100 && headers.to.tag.is_none() {
        headers.to.tag = to_tag.map(str::to_string);
    }

    headers.contact = contact;
    headers.max_forwards = None;
    headers.subject = None;
    headers.other.clear();

    SipResponse::new(status_code, reason_phrase, headers)
}

/// Transaction key: top Via branch plus CSeq number and method.
///
/// A response carries the same key as the request it answers.
pub fn transaction_key(headers: &SipHeaders) -> Option<String> {
    let via = headers.top_via()?;
    Some(format!("{}:{}", via.branch, headers.cseq))
}

/// Whether `response` answers `request`: same Call-ID and transaction key.
pub fn is_response_to(request: &SipRequest, response: &SipResponse) -> bool {
    if request.headers.call_id != response.headers.call_id {
        return false;
    }

    let request_key = transaction_key(&request.headers);
    request_key.is_some() && request_key == transaction_key(&response.headers)
}

/// Extract dialog ID from a message (Call-ID + from-tag + to-tag)
pub fn get_dialog_id(headers: &SipHeaders) -> Option<String> {
    let from_tag = headers.from.tag.as_deref()?;

    // For initial requests, dialog ID is not complete
    let to_tag = headers.to.tag.as_deref()?;

    Some(format!("{}-{}-{}", headers.call_id, from_tag, to_tag))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{parse_sip_message, SipMessage};

    const INVITE: &[u8] = b"INVITE sip:service@127.0.0.1:5060 SIP/2.0\r\n\
                            Via: SIP/2.0/UDP 127.0.0.1:5061;branch=z9hG4bK776asdhds\r\n\
                            From: sipp <sip:sipp@127.0.0.1:5061>;tag=1928301774\r\n\
                            To: service <sip:service@127.0.0.1:5060>\r\n\
                            Call-ID: a84b4c76e66710@127.0.0.1\r\n\
                            CSeq: 1 INVITE\r\n\
                            Max-Forwards: 70\r\n\
                            Subject: Performance Test\r\n\
                            Content-Length: 0\r\n\
                            \r\n";

    fn invite() -> SipRequest {
        match parse_sip_message(INVITE).unwrap() {
            SipMessage::Request(req) => req,
            SipMessage::Response(_) => panic!("Expected request"),
        }
    }

    #[test]
    fn test_branch_generation() {
        let branch1 = generate_branch();
        let branch2 = generate_branch();

        assert!(branch1.starts_with("z9hG4bK"));
        assert!(branch2.starts_with("z9hG4bK"));
        assert_ne!(branch1, branch2);
    }

    #[test]
    fn test_call_id_generation() {
        let call_id = generate_call_id("127.0.0.1");
        assert!(call_id.ends_with("@127.0.0.1"));
        assert_ne!(call_id, generate_call_id("127.0.0.1"));
        assert_ne!(generate_tag(), generate_tag());
    }

    #[test]
    fn test_host_string() {
        assert_eq!(host_string("10.0.0.1".parse().unwrap()), "10.0.0.1");
        assert_eq!(host_string("2001:db8::1".parse().unwrap()), "[2001:db8::1]");
    }

    #[test]
    fn test_build_response_from_request() {
        let request = invite();
        let response = build_response_from_request(&request, 180, "Ringing", Some("abc"), None);

        assert_eq!(response.status_code, 180);
        assert_eq!(response.headers.call_id, request.headers.call_id);
        assert_eq!(response.headers.cseq, request.headers.cseq);
        assert_eq!(response.headers.from, request.headers.from);
        assert_eq!(response.headers.via, request.headers.via);
        assert_eq!(response.headers.to.tag.as_deref(), Some("abc"));
        assert_eq!(response.headers.max_forwards, None);
        assert!(response.body.is_empty());
        assert!(is_response_to(&request, &response));
    }

    #[test]
    fn test_trying_gets_no_tag() {
        let request = invite();
        let response = build_response_from_request(&request, 100, "Trying", Some("abc"), None);
        assert_eq!(response.headers.to.tag, None);
    }

    #[test]
    fn test_is_response_to_checks_branch() {
        let request = invite();
        let mut response = build_response_from_request(&request, 200, "OK", Some("abc"), None);
        response.headers.via[0].branch = "z9hG4bKother".to_string();
        assert!(!is_response_to(&request, &response));
    }

    #[test]
    fn test_dialog_id() {
        let request = invite();
        assert_eq!(get_dialog_id(&request.headers), None);

        let response = build_response_from_request(&request, 200, "OK", Some("abc"), None);
        assert_eq!(
            get_dialog_id(&response.headers),
            Some("a84b4c76e66710@127.0.0.1-1928301774-abc".to_string())
        );
    }

    #[test]
    fn test_transaction_key() {
        assert_eq!(
            transaction_key(&invite().headers),
            Some("z9hG4bK776asdhds:1 INVITE".to_string())
        );
    }
}
