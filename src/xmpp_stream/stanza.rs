//! Top-level stanzas exchanged after negotiation.

use tokio::io::AsyncBufRead;

use super::error::TokenError;
use super::token::{StartElement, Token, TokenDecoder};

/// A complete top-level element (`<message/>`, `<presence/>`, `<iq/>`, ...).
///
/// The content is not interpreted; the stanza keeps its root start tag for cheap
/// inspection and the serialized element for writing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stanza {
    root: StartElement,
    xml: String,
}

impl Stanza {
    /// Build a stanza from XML text, e.g. for sending to the peer.
    ///
    /// The text must hold exactly one element, optionally surrounded by whitespace.
    pub async fn parse(xml: &str) -> Result<Self, TokenError> {
        let mut decoder = TokenDecoder::new(xml.trim().as_bytes());
        let root = decoder.expect_start_element().await?;
        let stanza = Self::read(&mut decoder, root).await?;

        loop {
            match decoder.next_token().await {
                Err(TokenError::Eof) => return Ok(stanza),
                Ok(Token::CharData(text)) if text.trim().is_empty() => continue,
                Ok(other) => {
                    return Err(TokenError::Syntax(format!(
                        "Unexpected {} after stanza",
                        other.kind()
                    )))
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Read the rest of a stanza whose root start tag has already been decoded.
    pub(crate) async fn read<R>(
        decoder: &mut TokenDecoder<R>,
        root: StartElement,
    ) -> Result<Self, TokenError>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut xml = root.to_xml();
        let mut depth: u32 = 1;

        while depth > 0 {
            let token = decoder.next_token().await?;
            match &token {
                Token::StartElement(_) => depth += 1,
                Token::EndElement(_) => depth -= 1,
                _ => {}
            }
            xml.push_str(&token.to_xml());
        }

        Ok(Self { root, xml })
    }

    pub fn root(&self) -> &StartElement {
        &self.root
    }

    /// Local name of the root element.
    pub fn name(&self) -> &str {
        &self.root.name.local
    }

    /// Attribute of the root element.
    pub fn attr(&self, qualified: &str) -> Option<&str> {
        self.root.attr(qualified)
    }

    /// The stanza as it will be written to the wire.
    pub fn as_str(&self) -> &str {
        &self.xml
    }
}
