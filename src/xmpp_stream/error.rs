//! Stream-level error types.
//!
//! `StreamError` carries one of the RFC 6120 §4.9.3 defined conditions and is the only
//! error that is meant to be reported back to the peer (as a `<stream:error/>` element).
//! `TokenError` and `NegotiationError` describe failures below and around it.

use std::fmt;
use std::str::FromStr;

use quick_xml::escape::escape;
use thiserror::Error;

use super::token::TokenKind;

/// Namespace of the defined stream error condition elements (RFC 6120 §4.9.3).
pub const STREAM_ERROR_NS: &str = "urn:ietf:params:xml:ns:xmpp-streams";

/// Defined stream error conditions, RFC 6120 §4.9.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamErrorCondition {
    BadFormat,
    BadNamespacePrefix,
    Conflict,
    ConnectionTimeout,
    HostGone,
    HostUnknown,
    ImproperAddressing,
    InternalServerError,
    InvalidFrom,
    InvalidNamespace,
    InvalidXml,
    NotAuthorized,
    NotWellFormed,
    PolicyViolation,
    RemoteConnectionFailed,
    Reset,
    ResourceConstraint,
    RestrictedXml,
    SeeOtherHost,
    SystemShutdown,
    UndefinedCondition,
    UnsupportedEncoding,
    UnsupportedFeature,
    UnsupportedStanzaType,
    UnsupportedVersion,
}

impl StreamErrorCondition {
    const ALL: [StreamErrorCondition; 25] = [
        Self::BadFormat,
        Self::BadNamespacePrefix,
        Self::Conflict,
        Self::ConnectionTimeout,
        Self::HostGone,
        Self::HostUnknown,
        Self::ImproperAddressing,
        Self::InternalServerError,
        Self::InvalidFrom,
        Self::InvalidNamespace,
        Self::InvalidXml,
        Self::NotAuthorized,
        Self::NotWellFormed,
        Self::PolicyViolation,
        Self::RemoteConnectionFailed,
        Self::Reset,
        Self::ResourceConstraint,
        Self::RestrictedXml,
        Self::SeeOtherHost,
        Self::SystemShutdown,
        Self::UndefinedCondition,
        Self::UnsupportedEncoding,
        Self::UnsupportedFeature,
        Self::UnsupportedStanzaType,
        Self::UnsupportedVersion,
    ];

    /// Element name of the condition as it appears on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadFormat => "bad-format",
            Self::BadNamespacePrefix => "bad-namespace-prefix",
            Self::Conflict => "conflict",
            Self::ConnectionTimeout => "connection-timeout",
            Self::HostGone => "host-gone",
            Self::HostUnknown => "host-unknown",
            Self::ImproperAddressing => "improper-addressing",
            Self::InternalServerError => "internal-server-error",
            Self::InvalidFrom => "invalid-from",
            Self::InvalidNamespace => "invalid-namespace",
            Self::InvalidXml => "invalid-xml",
            Self::NotAuthorized => "not-authorized",
            Self::NotWellFormed => "not-well-formed",
            Self::PolicyViolation => "policy-violation",
            Self::RemoteConnectionFailed => "remote-connection-failed",
            Self::Reset => "reset",
            Self::ResourceConstraint => "resource-constraint",
            Self::RestrictedXml => "restricted-xml",
            Self::SeeOtherHost => "see-other-host",
            Self::SystemShutdown => "system-shutdown",
            Self::UndefinedCondition => "undefined-condition",
            Self::UnsupportedEncoding => "unsupported-encoding",
            Self::UnsupportedFeature => "unsupported-feature",
            Self::UnsupportedStanzaType => "unsupported-stanza-type",
            Self::UnsupportedVersion => "unsupported-version",
        }
    }
}

impl fmt::Display for StreamErrorCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamErrorCondition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("Unknown stream error condition: {}", s))
    }
}

/// A protocol-level stream error. Terminal for the stream it was raised on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("stream: {condition}: {message}")]
pub struct StreamError {
    pub condition: StreamErrorCondition,
    pub message: String,
}

impl StreamError {
    pub fn new(condition: StreamErrorCondition, message: impl Into<String>) -> Self {
        Self {
            condition,
            message: message.into(),
        }
    }

    pub fn bad_format(message: impl Into<String>) -> Self {
        Self::new(StreamErrorCondition::BadFormat, message)
    }

    /// Render the `<stream:error/>` element sent to the peer before closing.
    ///
    /// The descriptive `<text/>` child is only included when there is a message.
    pub fn to_xml(&self) -> String {
        let mut xml = format!(
            "<stream:error><{} xmlns='{}'/>",
            self.condition.as_str(),
            STREAM_ERROR_NS
        );
        if !self.message.is_empty() {
            xml.push_str(&format!(
                "<text xmlns='{}'>{}</text>",
                STREAM_ERROR_NS,
                escape(self.message.as_str())
            ));
        }
        xml.push_str("</stream:error>");
        xml
    }
}

/// Failure to produce the token the caller asked for.
#[derive(Debug, Error)]
pub enum TokenError {
    /// The next token in the input was of a different kind than expected.
    #[error("WrongToken: expected {wanted} and got {got}")]
    WrongToken { wanted: TokenKind, got: TokenKind },
    /// The input is not well-formed XML.
    #[error("XML syntax error: {0}")]
    Syntax(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The input ended before a token could be read.
    #[error("unexpected end of stream")]
    Eof,
}

impl From<quick_xml::Error> for TokenError {
    fn from(e: quick_xml::Error) -> Self {
        match e {
            quick_xml::Error::Io(io) => {
                // quick-xml shares the io::Error behind an Arc
                TokenError::Io(std::io::Error::new(io.kind(), io.to_string()))
            }
            other => TokenError::Syntax(other.to_string()),
        }
    }
}

/// Why a stream negotiation did not produce a `Stream`.
#[derive(Debug, Error)]
pub enum NegotiationError {
    /// The peer violated the protocol; should be reported with `<stream:error/>`.
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("connection failed during negotiation: {0}")]
    Io(std::io::Error),
    #[error("peer closed the connection during negotiation")]
    Eof,
}

impl NegotiationError {
    /// The stream error to report to the peer, if the failure is reportable at all.
    pub fn stream_error(&self) -> Option<&StreamError> {
        match self {
            NegotiationError::Stream(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TokenError> for NegotiationError {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::WrongToken { .. } => StreamError::bad_format(e.to_string()).into(),
            TokenError::Syntax(msg) => {
                StreamError::new(StreamErrorCondition::NotWellFormed, msg).into()
            }
            TokenError::Io(io) => NegotiationError::Io(io),
            TokenError::Eof => NegotiationError::Eof,
        }
    }
}
