// parser.rs - nom based SIP parser

use crate::utils::is_token_char;
use crate::{
    find_param, CSeq, NameAddr, Params, SipHeaders, SipMessage, SipMethod, SipParseError,
    SipRequest, SipResponse, SipUri, Via, MAX_HEADERS, MAX_MESSAGE_SIZE, SIP_VERSION,
};
use bytes::Bytes;
use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_while1, take_while_m_n},
    character::complete::{char, digit1, space0, space1},
    combinator::{all_consuming, map, map_res, opt, recognize, rest},
    error::{Error as NomError, ErrorKind},
    multi::{many0, separated_list1},
    sequence::{delimited, pair, preceded, separated_pair, terminated, tuple},
    IResult,
};
use std::str::FromStr;

fn token(input: &str) -> IResult<&str, &str> {
    take_while1(is_token_char)(input)
}

fn sip_version(input: &str) -> IResult<&str, &str> {
    recognize(tuple((tag("SIP"), char('/'), digit1, char('.'), digit1)))(input)
}

fn is_user_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "-_.!~*'()&=+$,?/%".contains(c)
}

fn is_param_value_char(c: char) -> bool {
    is_token_char(c) || c == ':' || c == '[' || c == ']'
}

fn quoted_string(input: &str) -> IResult<&str, String> {
    let (body, _) = char('"')(input)?;
    let mut out = String::new();
    let mut chars = body.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return Ok((&body[i + 1..], out)),
            '\\' => match chars.next() {
                Some((_, escaped)) => out.push(escaped),
                None => break,
            },
            _ => out.push(c),
        }
    }
    Err(nom::Err::Error(NomError::new(input, ErrorKind::Char)))
}

fn host(input: &str) -> IResult<&str, &str> {
    alt((
        recognize(delimited(
            char('['),
            take_while1(|c: char| c.is_ascii_hexdigit() || c == ':' || c == '.'),
            char(']'),
        )),
        take_while1(|c: char| c.is_ascii_alphanumeric() || c == '.' || c == '-'),
    ))(input)
}

fn port(input: &str) -> IResult<&str, u16> {
    preceded(char(':'), map_res(digit1, str::parse))(input)
}

fn param(input: &str) -> IResult<&str, (String, Option<String>)> {
    map(
        preceded(
            tuple((space0, char(';'), space0)),
            pair(
                token,
                opt(preceded(
                    tuple((space0, char('='), space0)),
                    alt((
                        quoted_string,
                        map(take_while1(is_param_value_char), str::to_string),
                    )),
                )),
            ),
        ),
        |(name, value)| (name.to_string(), value),
    )(input)
}

fn params(input: &str) -> IResult<&str, Params> {
    many0(param)(input)
}

/// `scheme:[user@]host[:port]` without parameters
fn addr_spec(input: &str) -> IResult<&str, SipUri> {
    let (input, scheme) = alt((tag("sips"), tag("sip")))(input)?;
    let (input, _) = char(':')(input)?;
    let (input, user) = opt(terminated(take_while1(is_user_char), char('@')))(input)?;
    let (input, host) = host(input)?;
    let (input, port) = opt(port)(input)?;

    let mut uri = SipUri::new(scheme, host);
    uri.user = user.map(str::to_string);
    uri.port = port;
    Ok((input, uri))
}

fn uri(input: &str) -> IResult<&str, SipUri> {
    let (input, mut uri) = addr_spec(input)?;
    let (input, parameters) = params(input)?;
    uri.parameters = parameters;
    Ok((input, uri))
}

fn display_name(input: &str) -> IResult<&str, String> {
    alt((
        quoted_string,
        map(recognize(separated_list1(space1, token)), str::to_string),
    ))(input)
}

fn name_addr(input: &str) -> IResult<&str, NameAddr> {
    let (input, (display_name, uri)) = alt((
        map(
            tuple((
                opt(display_name),
                space0,
                delimited(char('<'), uri, char('>')),
            )),
            |(display, _, uri)| (display, uri),
        ),
        // Parameters after a bare URI belong to the header, not the URI
        map(addr_spec, |uri| (None, uri)),
    ))(input)?;
    let (input, mut params) = params(input)?;

    let tag = params
        .iter()
        .position(|(key, _)| key.eq_ignore_ascii_case("tag"))
        .and_then(|idx| params.remove(idx).1);

    Ok((
        input,
        NameAddr {
            display_name,
            uri,
            tag,
            params,
        },
    ))
}

fn via_entry(input: &str) -> IResult<&str, (String, String, Option<u16>, Params)> {
    let (input, _) = tuple((
        tag_no_case("SIP"),
        space0,
        char('/'),
        space0,
        tag("2.0"),
        space0,
        char('/'),
        space0,
    ))(input)?;
    let (input, protocol) = token(input)?;
    let (input, _) = space1(input)?;
    let (input, host) = host(input)?;
    let (input, port) = opt(port)(input)?;
    let (input, params) = params(input)?;

    Ok((
        input,
        (protocol.to_uppercase(), host.to_string(), port, params),
    ))
}

fn cseq(input: &str) -> IResult<&str, (u32, &str)> {
    separated_pair(map_res(digit1, str::parse), space1, token)(input)
}

fn request_line(input: &str) -> IResult<&str, (&str, SipUri, &str)> {
    let (input, method) = token(input)?;
    let (input, _) = char(' ')(input)?;
    let (input, uri) = uri(input)?;
    let (input, _) = char(' ')(input)?;
    let (input, version) = sip_version(input)?;
    Ok((input, (method, uri, version)))
}

fn status_line(input: &str) -> IResult<&str, (&str, &str, &str)> {
    let (input, version) = sip_version(input)?;
    let (input, _) = char(' ')(input)?;
    let (input, code) = take_while_m_n(3, 3, |c: char| c.is_ascii_digit())(input)?;
    let (input, reason) = opt(preceded(char(' '), rest))(input)?;
    Ok((input, (version, code, reason.unwrap_or(""))))
}

fn header_line(input: &str) -> IResult<&str, (&str, &str)> {
    separated_pair(token, tuple((space0, char(':'), space0)), rest)(input)
}

/// Runs a field parser over a whole header value.
fn field<'a, T>(
    header: &'static str,
    value: &'a str,
    parser: impl FnMut(&'a str) -> IResult<&'a str, T>,
) -> Result<T, SipParseError> {
    all_consuming(terminated(parser, space0))(value)
        .map(|(_, parsed)| parsed)
        .map_err(|_| SipParseError::MalformedHeader(header, value.to_string()))
}

enum StartLine {
    Request(SipMethod, SipUri),
    Response(u16, String),
}

fn parse_start_line(line: &str) -> Result<StartLine, SipParseError> {
    if let Ok((_, (version, code, reason))) = all_consuming(status_line)(line) {
        if version != SIP_VERSION {
            return Err(SipParseError::InvalidVersion(version.to_string()));
        }
        let status_code: u16 = code
            .parse()
            .map_err(|_| SipParseError::InvalidStatusCode(code.to_string()))?;
        if !(100..=699).contains(&status_code) {
            return Err(SipParseError::InvalidStatusCode(code.to_string()));
        }
        return Ok(StartLine::Response(status_code, reason.trim().to_string()));
    }

    if let Ok((_, (method, uri, version))) = all_consuming(request_line)(line) {
        if version != SIP_VERSION {
            return Err(SipParseError::InvalidVersion(version.to_string()));
        }
        let method = SipMethod::from_str(method)?;
        return Ok(StartLine::Request(method, uri));
    }

    Err(SipParseError::InvalidStartLine(line.to_string()))
}

/// Joins folded continuation lines onto the header they continue.
fn unfold_lines(section: &str) -> Result<Vec<String>, SipParseError> {
    let mut lines: Vec<String> = Vec::new();
    for line in section.split("\r\n") {
        if line.starts_with(' ') || line.starts_with('\t') {
            match lines.last_mut() {
                Some(previous) => {
                    previous.push(' ');
                    previous.push_str(line.trim());
                }
                None => {
                    return Err(SipParseError::ParseError(
                        "Continuation line before first header".to_string(),
                    ))
                }
            }
        } else if !line.is_empty() {
            lines.push(line.to_string());
        }
    }
    Ok(lines)
}

#[derive(Default)]
struct HeaderSet {
    call_id: Option<String>,
    cseq: Option<CSeq>,
    from: Option<NameAddr>,
    to: Option<NameAddr>,
    via: Vec<Via>,
    contact: Option<SipUri>,
    max_forwards: Option<u32>,
    subject: Option<String>,
    content_length: Option<usize>,
    other: Vec<(String, String)>,
}

fn set_once<T>(slot: &mut Option<T>, header: &'static str, value: T) -> Result<(), SipParseError> {
    if slot.is_some() {
        return Err(SipParseError::MalformedHeader(
            header,
            "duplicate header".to_string(),
        ));
    }
    *slot = Some(value);
    Ok(())
}

fn parse_via_value(value: &str, vias: &mut Vec<Via>) -> Result<(), SipParseError> {
    // Several Via entries may share one line, separated by commas
    for entry in value.split(',') {
        let (protocol, host, port, mut params) = field("Via", entry.trim(), via_entry)?;
        let branch = params
            .iter()
            .position(|(key, _)| key.eq_ignore_ascii_case("branch"))
            .and_then(|idx| params.remove(idx).1)
            .filter(|branch| !branch.is_empty())
            .ok_or(SipParseError::MissingParameter {
                header: "Via",
                param: "branch",
            })?;
        vias.push(Via {
            protocol,
            host,
            port,
            branch,
            params,
        });
    }
    Ok(())
}

impl HeaderSet {
    fn insert(&mut self, name: &str, value: &str) -> Result<(), SipParseError> {
        match name.to_ascii_lowercase().as_str() {
            "call-id" | "i" => {
                if value.is_empty() || value.contains(char::is_whitespace) {
                    return Err(SipParseError::MalformedHeader("Call-ID", value.to_string()));
                }
                set_once(&mut self.call_id, "Call-ID", value.to_string())
            }
            "cseq" => {
                let (number, method) = field("CSeq", value, cseq)?;
                let method = SipMethod::from_str(method)
                    .map_err(|_| SipParseError::MalformedHeader("CSeq", value.to_string()))?;
                set_once(&mut self.cseq, "CSeq", CSeq::new(number, method))
            }
            "from" | "f" => {
                let from = field("From", value, name_addr)?;
                set_once(&mut self.from, "From", from)
            }
            "to" | "t" => {
                let to = field("To", value, name_addr)?;
                set_once(&mut self.to, "To", to)
            }
            "via" | "v" => parse_via_value(value, &mut self.via),
            "contact" | "m" => {
                let contact = field("Contact", value, name_addr)?;
                set_once(&mut self.contact, "Contact", contact.uri)
            }
            "max-forwards" => {
                let hops = value
                    .parse::<u32>()
                    .map_err(|_| SipParseError::MalformedHeader("Max-Forwards", value.to_string()))?;
                set_once(&mut self.max_forwards, "Max-Forwards", hops)
            }
            "subject" | "s" => set_once(&mut self.subject, "Subject", value.to_string()),
            "content-length" | "l" => {
                let length = value.parse::<usize>().map_err(|_| {
                    SipParseError::MalformedHeader("Content-Length", value.to_string())
                })?;
                set_once(&mut self.content_length, "Content-Length", length)
            }
            _ => {
                self.other.push((name.to_string(), value.to_string()));
                Ok(())
            }
        }
    }

    fn into_headers(self) -> Result<SipHeaders, SipParseError> {
        if self.via.is_empty() {
            return Err(SipParseError::MissingRequiredHeader("Via"));
        }

        Ok(SipHeaders {
            call_id: self
                .call_id
                .ok_or(SipParseError::MissingRequiredHeader("Call-ID"))?,
            cseq: self.cseq.ok_or(SipParseError::MissingRequiredHeader("CSeq"))?,
            from: self.from.ok_or(SipParseError::MissingRequiredHeader("From"))?,
            to: self.to.ok_or(SipParseError::MissingRequiredHeader("To"))?,
            via: self.via,
            contact: self.contact,
            max_forwards: self.max_forwards,
            subject: self.subject,
            other: self.other,
        })
    }
}

/// Parses one SIP message from a datagram.
///
/// Header order is free, but every known field must be well formed and the
/// body must be exactly as long as a declared Content-Length. Without a
/// Content-Length the rest of the datagram is the body.
pub fn parse_sip_message(input: &[u8]) -> Result<SipMessage, SipParseError> {
    if input.len() > MAX_MESSAGE_SIZE {
        return Err(SipParseError::MessageTooLarge(input.len(), MAX_MESSAGE_SIZE));
    }

    let head_end = input
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| SipParseError::ParseError("Missing end of header section".to_string()))?;

    let head = std::str::from_utf8(&input[..head_end])
        .map_err(|_| SipParseError::ParseError("Invalid UTF-8 in header section".to_string()))?;
    let body = &input[head_end + 4..];

    let (start_line, header_section) = head.split_once("\r\n").unwrap_or((head, ""));
    let start = parse_start_line(start_line)?;

    let lines = unfold_lines(header_section)?;
    if lines.len() > MAX_HEADERS {
        return Err(SipParseError::TooManyHeaders(lines.len(), MAX_HEADERS));
    }

    let mut set = HeaderSet::default();
    for line in &lines {
        let (name, value) = all_consuming(header_line)(line.as_str())
            .map(|(_, pair)| pair)
            .map_err(|_| SipParseError::ParseError(format!("Invalid header line: {}", line)))?;
        set.insert(name, value.trim())?;
    }

    if let Some(declared) = set.content_length {
        if declared != body.len() {
            return Err(SipParseError::ContentLengthMismatch {
                declared,
                actual: body.len(),
            });
        }
    }

    let headers = set.into_headers()?;
    let body = Bytes::copy_from_slice(body);

    match start {
        StartLine::Request(method, uri) => {
            if headers.cseq.method != method {
                return Err(SipParseError::MalformedHeader(
                    "CSeq",
                    format!("method {} does not match request {}", headers.cseq.method, method),
                ));
            }
            Ok(SipMessage::Request(SipRequest {
                method,
                uri,
                headers,
                body,
            }))
        }
        StartLine::Response(status_code, reason_phrase) => Ok(SipMessage::Response(SipResponse {
            status_code,
            reason_phrase,
            headers,
            body,
        })),
    }
}

/// Looks up a parameter on the top Via, e.g. `received` or `rport`.
pub fn via_param<'a>(message: &'a SipMessage, name: &str) -> Option<&'a Option<String>> {
    message
        .headers()
        .top_via()
        .and_then(|via| find_param(&via.params, name))
}
