//! Opening stream negotiation (RFC 6120 §4.2, §4.7).
//!
//! The peer must send, in order: an XML declaration, optionally some whitespace, and a
//! `<stream:stream>` start tag. The start tag's attributes are validated and copied into
//! a `Stream`. Anything else ends the negotiation with a `StreamError`.

use std::fmt;
use std::time::Duration;

use quick_xml::escape::escape;
use serde::Serialize;
use tokio::io::AsyncBufRead;
use tracing::{debug, warn};

use super::error::{NegotiationError, StreamError, StreamErrorCondition};
use super::id::IdGenerator;
use super::token::{StartElement, Token, TokenDecoder, TokenKind};

/// Namespace that the `stream` prefix must be bound to.
pub const STREAMS_NS: &str = "http://etherx.jabber.org/streams";

/// Default content namespace for client-to-server streams.
pub const CLIENT_NS: &str = "jabber:client";

/// A negotiated XMPP stream.
///
/// Only produced by a successful negotiation; fields left empty were absent from the
/// peer's stream header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stream {
    pub to: String,
    pub from: String,
    pub language: String,
    pub id: String,
    /// `None` for pre-RFC 6120 peers that send no version attribute.
    pub version: Option<Version>,
}

impl Stream {
    /// The stream header this server sends back in response.
    ///
    /// `from` is our own domain; `to` echoes the peer's `from` when it gave one.
    pub fn response_header(&self, server_domain: &str) -> String {
        let mut header = format!(
            "<?xml version='1.0'?><stream:stream xmlns='{}' xmlns:stream='{}' id='{}' from='{}'",
            CLIENT_NS,
            STREAMS_NS,
            escape(self.id.as_str()),
            escape(server_domain)
        );
        if !self.from.is_empty() {
            header.push_str(&format!(" to='{}'", escape(self.from.as_str())));
        }
        header.push_str(" version='1.0'");
        if !self.language.is_empty() {
            header.push_str(&format!(" xml:lang='{}'", escape(self.language.as_str())));
        }
        header.push('>');
        header
    }
}

/// Protocol version advertised in the stream header.
///
/// Only the major version is ever compared, so the minor version is kept as the digits
/// the peer sent and may exceed any integer width.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Version {
    pub major: u32,
    pub minor: String,
}

impl Version {
    /// Parse `<major>.<minor>`. Any major version is accepted here; see `check_version`.
    pub fn parse(version: &str) -> Option<Self> {
        let (major, minor) = version.split_once('.')?;
        if minor.contains('.') {
            return None;
        }
        if !is_digits(major) || !is_digits(minor) {
            return None;
        }
        Some(Self {
            major: major.parse().ok()?,
            minor: minor.to_string(),
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

// u32::from_str accepts a leading '+', version components do not
fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Whether we can handle this version of XMPP (RFC 6120 §4.7.5).
///
/// The version must be `<major>.<minor>` with both parts non-negative integers and a
/// major version of 1.
pub fn check_version(version: &str) -> bool {
    match version.split_once('.') {
        Some((major, minor)) => {
            is_digits(major)
                && is_digits(minor)
                && major.trim_start_matches('0') == "1"
        }
        None => false,
    }
}

/// Run the opening negotiation on a freshly accepted connection.
///
/// Consumes tokens up to and including the `<stream:stream>` start tag. On success the
/// decoder is positioned at the first stanza. When the peer sent no `id`, one is drawn
/// from `ids`.
pub async fn negotiate<R>(
    decoder: &mut TokenDecoder<R>,
    ids: &IdGenerator,
) -> Result<Stream, NegotiationError>
where
    R: AsyncBufRead + Unpin,
{
    let header = decoder.expect_proc_inst().await?;
    if header.target != "xml" {
        return Err(StreamError::bad_format("ProcInst not directed at xml").into());
    }

    // Whitespace may separate the declaration from the stream header
    let elem = match decoder.next_token().await? {
        Token::CharData(text) => {
            if !text.trim().is_empty() {
                return Err(StreamError::bad_format("Invalid characters").into());
            }
            decoder.expect_start_element().await?
        }
        Token::StartElement(elem) => elem,
        other => {
            return Err(StreamError::bad_format(format!(
                "WrongToken: expected {} and got {}",
                TokenKind::StartElement,
                other.kind()
            ))
            .into())
        }
    };

    if !elem.name.is(Some("stream"), "stream") {
        return Err(StreamError::bad_format("Start element should be stream:stream").into());
    }

    let mut stream = validate_stream_header(&elem)?;

    if stream.id.is_empty() {
        stream.id = ids.next_id().await.map_err(|e| {
            warn!(error = %e, "No stream id available");
            StreamError::new(StreamErrorCondition::InternalServerError, "")
        })?;
    }

    debug!(to = %stream.to, from = %stream.from, id = %stream.id, "Stream negotiated");
    Ok(stream)
}

/// Same as `negotiate`, but gives up with `connection-timeout` once `deadline` elapses.
pub async fn negotiate_with_timeout<R>(
    decoder: &mut TokenDecoder<R>,
    ids: &IdGenerator,
    deadline: Duration,
) -> Result<Stream, NegotiationError>
where
    R: AsyncBufRead + Unpin,
{
    tokio::time::timeout(deadline, negotiate(decoder, ids))
        .await
        .map_err(|_| {
            StreamError::new(
                StreamErrorCondition::ConnectionTimeout,
                format!("No stream header within {:?}", deadline),
            )
        })?
}

fn validate_stream_header(elem: &StartElement) -> Result<Stream, StreamError> {
    let mut stream = Stream {
        to: String::new(),
        from: String::new(),
        language: String::new(),
        id: String::new(),
        version: None,
    };
    let mut stream_ns_declared = false;

    for attr in &elem.attributes {
        let prefix = attr.name.prefix.as_deref();
        match (prefix, attr.name.local.as_str()) {
            (None, "to") => stream.to = attr.value.clone(),
            (None, "from") => stream.from = attr.value.clone(),
            (None, "id") => stream.id = attr.value.clone(),
            (Some("xml"), "lang") => stream.language = attr.value.clone(),
            (None, "version") => {
                if !check_version(&attr.value) {
                    return Err(StreamError::new(
                        StreamErrorCondition::UnsupportedVersion,
                        attr.value.clone(),
                    ));
                }
                stream.version = Version::parse(&attr.value);
            }
            (Some("xmlns"), "stream") => {
                if attr.value != STREAMS_NS {
                    return Err(StreamError::new(
                        StreamErrorCondition::InvalidNamespace,
                        attr.value.clone(),
                    ));
                }
                stream_ns_declared = true;
            }
            _ => {}
        }
    }

    if !stream_ns_declared {
        return Err(StreamError::new(
            StreamErrorCondition::InvalidNamespace,
            "Missing xmlns:stream declaration",
        ));
    }

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER_OK: &str = r#"<?xml version="1.0"?><stream:stream xmlns:stream="http://etherx.jabber.org/streams" to="example.com" version="1.0">"#;

    async fn run(input: &'static str) -> Result<Stream, NegotiationError> {
        let ids = IdGenerator::start();
        let mut decoder = TokenDecoder::new(input.as_bytes());
        negotiate(&mut decoder, &ids).await
    }

    fn condition(result: Result<Stream, NegotiationError>) -> StreamErrorCondition {
        match result {
            Err(NegotiationError::Stream(e)) => e.condition,
            other => panic!("expected stream error, got {:?}", other),
        }
    }

    // --- check_version tests ---

    #[test]
    fn test_check_version() {
        assert!(check_version("1.0"));
        assert!(check_version("1.5"));
        assert!(!check_version("2.0"));
        assert!(!check_version("abc"));
        assert!(!check_version("1"));
        assert!(!check_version("1.0.0"));
    }

    #[test]
    fn test_check_version_rejects_signs_and_empty_parts() {
        assert!(!check_version("-1.0"));
        assert!(!check_version("+1.0"));
        assert!(!check_version("1."));
        assert!(!check_version(".0"));
        assert!(!check_version(""));
    }

    #[test]
    fn test_check_version_accepts_any_width_minor() {
        assert!(check_version("1.4294967296"));
        assert!(check_version("1.99999999999999999999999999"));
        assert!(check_version("01.0"));
        assert!(!check_version("4294967297.0"));
        assert!(!check_version("0.9"));
    }

    #[test]
    fn test_version_parse_allows_multi_digit_minor() {
        assert_eq!(Version::parse("1.12"), Some(Version { major: 1, minor: "12".to_string() }));
        assert_eq!(Version::parse("1.12").unwrap().to_string(), "1.12");
    }

    // --- negotiate tests ---

    #[tokio::test]
    async fn test_negotiate_minimal_header() {
        let stream = run(HEADER_OK).await.expect("negotiation should succeed");
        assert_eq!(stream.to, "example.com");
        assert_eq!(stream.from, "");
        assert_eq!(stream.language, "");
        assert_eq!(stream.version, Some(Version { major: 1, minor: "0".to_string() }));
        assert!(!stream.id.is_empty(), "id should be assigned by the generator");
    }

    #[tokio::test]
    async fn test_negotiate_copies_all_attributes() {
        let stream = run(
            "<?xml version='1.0'?>\n  <stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' to='example.com' from='juliet@example.com' id='abc123' xml:lang='en' version='1.0'>",
        )
        .await
        .unwrap();
        assert_eq!(stream.to, "example.com");
        assert_eq!(stream.from, "juliet@example.com");
        assert_eq!(stream.id, "abc123");
        assert_eq!(stream.language, "en");
    }

    #[tokio::test]
    async fn test_negotiate_without_version_is_accepted() {
        let stream = run(
            "<?xml version='1.0'?><stream:stream xmlns:stream='http://etherx.jabber.org/streams' to='example.com'>",
        )
        .await
        .unwrap();
        assert_eq!(stream.version, None);
    }

    #[tokio::test]
    async fn test_negotiate_unsupported_version() {
        let result = run(
            r#"<?xml version="1.0"?><stream:stream xmlns:stream="http://etherx.jabber.org/streams" to="example.com" version="2.0">"#,
        )
        .await;
        match result {
            Err(NegotiationError::Stream(e)) => {
                assert_eq!(e.condition, StreamErrorCondition::UnsupportedVersion);
                assert_eq!(e.message, "2.0");
            }
            other => panic!("expected unsupported-version, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_negotiate_wrong_stream_namespace() {
        let result = run(
            r#"<?xml version="1.0"?><stream:stream xmlns:stream="http://example.com/streams" to="example.com" version="1.0">"#,
        )
        .await;
        match result {
            Err(NegotiationError::Stream(e)) => {
                assert_eq!(e.condition, StreamErrorCondition::InvalidNamespace);
                assert_eq!(e.message, "http://example.com/streams");
            }
            other => panic!("expected invalid-namespace, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_negotiate_missing_stream_namespace() {
        let result = run(r#"<?xml version="1.0"?><stream:stream to="example.com" version="1.0">"#).await;
        assert_eq!(condition(result), StreamErrorCondition::InvalidNamespace);
    }

    #[tokio::test]
    async fn test_negotiate_text_before_stream_header() {
        let result = run(
            r#"<?xml version="1.0"?>hello<stream:stream xmlns:stream="http://etherx.jabber.org/streams" version="1.0">"#,
        )
        .await;
        assert_eq!(condition(result), StreamErrorCondition::BadFormat);
    }

    #[tokio::test]
    async fn test_negotiate_missing_declaration() {
        let result = run(
            r#"<stream:stream xmlns:stream="http://etherx.jabber.org/streams" version="1.0">"#,
        )
        .await;
        assert_eq!(condition(result), StreamErrorCondition::BadFormat);
    }

    #[tokio::test]
    async fn test_negotiate_non_xml_proc_inst() {
        let result = run(
            r#"<?php echo 1; ?><stream:stream xmlns:stream="http://etherx.jabber.org/streams">"#,
        )
        .await;
        assert_eq!(condition(result), StreamErrorCondition::BadFormat);
    }

    #[tokio::test]
    async fn test_negotiate_wrong_root_element() {
        let result = run(
            r#"<?xml version="1.0"?><stream xmlns:stream="http://etherx.jabber.org/streams">"#,
        )
        .await;
        assert_eq!(condition(result), StreamErrorCondition::BadFormat);
    }

    #[tokio::test]
    async fn test_negotiate_comment_instead_of_header() {
        let result = run(r#"<?xml version="1.0"?><!-- hi -->"#).await;
        assert_eq!(condition(result), StreamErrorCondition::BadFormat);
    }

    #[tokio::test]
    async fn test_negotiate_eof_before_header() {
        let result = run(r#"<?xml version="1.0"?>"#).await;
        assert!(matches!(result, Err(NegotiationError::Eof)));
    }

    #[tokio::test]
    async fn test_negotiate_times_out_on_silent_peer() {
        let ids = IdGenerator::start();
        let (_peer, conn) = tokio::io::duplex(64);
        let mut decoder = TokenDecoder::new(tokio::io::BufReader::new(conn));
        let result =
            negotiate_with_timeout(&mut decoder, &ids, Duration::from_millis(50)).await;
        match result {
            Err(NegotiationError::Stream(e)) => {
                assert_eq!(e.condition, StreamErrorCondition::ConnectionTimeout);
                assert_eq!(e.message, "No stream header within 50ms");
            }
            other => panic!("expected connection-timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_negotiate_accepts_large_minor_version() {
        let stream = run(
            r#"<?xml version="1.0"?><stream:stream xmlns:stream="http://etherx.jabber.org/streams" to="example.com" version="1.4294967296">"#,
        )
        .await
        .expect("negotiation should succeed");
        let version = stream.version.expect("version recorded");
        assert_eq!(version.major, 1);
        assert_eq!(version.to_string(), "1.4294967296");
    }

    #[test]
    fn test_response_header() {
        let stream = Stream {
            to: "example.com".to_string(),
            from: "juliet@example.com".to_string(),
            language: "en".to_string(),
            id: "s1".to_string(),
            version: Some(Version { major: 1, minor: "0".to_string() }),
        };
        let header = stream.response_header("example.com");
        assert!(header.starts_with("<?xml version='1.0'?><stream:stream "));
        assert!(header.contains("xmlns:stream='http://etherx.jabber.org/streams'"));
        assert!(header.contains("id='s1'"));
        assert!(header.contains("from='example.com'"));
        assert!(header.contains("to='juliet@example.com'"));
        assert!(header.contains("xml:lang='en'"));
        assert!(header.ends_with('>'));
    }
}
