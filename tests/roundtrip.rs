//! Property tests for the serializer and parser.

use bytes::Bytes;
use proptest::prelude::*;
use sip_callflow::{
    parse_sip_message, CSeq, NameAddr, SipHeaders, SipMessage, SipMethod, SipParseError,
    SipRequest, SipResponse, SipUri, Via,
};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

fn addr() -> impl Strategy<Value = SocketAddr> {
    (any::<[u8; 4]>(), 1u16..).prop_map(|(ip, port)| {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(ip), port))
    })
}

fn method() -> impl Strategy<Value = SipMethod> {
    prop_oneof![
        Just(SipMethod::Invite),
        Just(SipMethod::Ack),
        Just(SipMethod::Bye),
        Just(SipMethod::Options),
    ]
}

prop_compose! {
    fn headers()(
        method in method(),
        number in 1u32..100_000,
        call_id in "[A-Za-z0-9]{1,24}@[a-z0-9.]{1,16}",
        from_addr in addr(),
        to_addr in addr(),
        from_name in "[A-Za-z]{1,10}",
        from_tag in "[A-Za-z0-9]{1,16}",
        to_tag in proptest::option::of("[A-Za-z0-9]{1,16}"),
        branch in "[A-Za-z0-9]{1,20}",
        subject in proptest::option::of("[A-Za-z][A-Za-z ]{0,20}[A-Za-z]"),
    ) -> SipHeaders {
        let mut to = NameAddr::new(None, SipUri::from_addr(Some("service"), to_addr));
        to.tag = to_tag;

        SipHeaders {
            call_id,
            cseq: CSeq::new(number, method),
            from: NameAddr::new(Some(&from_name), SipUri::from_addr(Some("sipp"), from_addr))
                .with_tag(&from_tag),
            to,
            via: vec![Via::udp(from_addr, &format!("z9hG4bK{}", branch))],
            contact: Some(SipUri::from_addr(Some("sipp"), from_addr)),
            max_forwards: Some(70),
            subject,
            other: vec![],
        }
    }
}

fn request(headers: SipHeaders, body: Vec<u8>) -> SipMessage {
    let method = headers.cseq.method.clone();
    let uri = headers.to.uri.clone();
    SipRequest::new(method, uri, headers)
        .with_body(Bytes::from(body))
        .into()
}

proptest! {
    #[test]
    fn prop_request_round_trip(
        headers in headers(),
        body in proptest::collection::vec(any::<u8>(), 0..512),
    ) {
        let original = request(headers, body);
        let parsed = parse_sip_message(&original.to_bytes()).unwrap();
        prop_assert_eq!(parsed, original);
    }

    #[test]
    fn prop_response_round_trip(
        headers in headers(),
        status in 100u16..700,
        reason in "[A-Za-z]([A-Za-z ]{0,18}[A-Za-z])?",
    ) {
        let original: SipMessage = SipResponse::new(status, &reason, headers).into();
        let parsed = parse_sip_message(&original.to_bytes()).unwrap();
        prop_assert_eq!(parsed, original);
    }

    #[test]
    fn prop_content_length_matches_body(
        headers in headers(),
        body in proptest::collection::vec(any::<u8>(), 0..512),
    ) {
        let bytes = request(headers, body.clone()).to_bytes();
        let end = bytes.windows(4).position(|w| w == b"\r\n\r\n").unwrap();
        prop_assert_eq!(&bytes[end + 4..], &body[..]);

        let head = std::str::from_utf8(&bytes[..end]).unwrap();
        let lengths: Vec<usize> = head
            .split("\r\n")
            .filter_map(|line| line.split_once(':'))
            .filter(|(name, _)| name.trim().eq_ignore_ascii_case("Content-Length"))
            .map(|(_, value)| value.trim().parse().unwrap())
            .collect();
        prop_assert_eq!(lengths, vec![body.len()]);
    }

    #[test]
    fn prop_truncated_body_rejected(
        headers in headers(),
        body in proptest::collection::vec(any::<u8>(), 1..256),
        cut in 1usize..256,
    ) {
        let bytes = request(headers, body.clone()).to_bytes();
        let cut = cut.min(body.len());
        let truncated = &bytes[..bytes.len() - cut];

        prop_assert!(
            matches!(
                parse_sip_message(truncated),
                Err(SipParseError::ContentLengthMismatch { .. })
            ),
            "expected Content-Length mismatch"
        );
    }

    #[test]
    fn prop_random_bytes_rejected(data in proptest::collection::vec(any::<u8>(), 0..200)) {
        prop_assert!(parse_sip_message(&data).is_err());
    }
}
