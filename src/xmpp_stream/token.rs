//! Typed XML tokens and a decoder that reads them one at a time.
//!
//! The decoder is a thin narrowing layer over quick-xml's async reader: each call pulls
//! exactly one event from the underlying reader and turns it into an owned `Token`.
//! The `expect_*` helpers assert the kind of that token so the negotiation code can be
//! written as a straight sequence of steps.

use std::fmt;

use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tokio::io::AsyncBufRead;

use super::error::TokenError;

/// A possibly prefixed XML name, e.g. `stream:stream` or `to`.
///
/// Prefixes are kept as written; they are not resolved against namespace declarations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QName {
    pub prefix: Option<String>,
    pub local: String,
}

impl QName {
    pub fn new(prefix: Option<&str>, local: &str) -> Self {
        Self {
            prefix: prefix.map(str::to_string),
            local: local.to_string(),
        }
    }

    fn from_raw(raw: &[u8]) -> Self {
        let raw = String::from_utf8_lossy(raw);
        match raw.split_once(':') {
            Some((prefix, local)) => Self::new(Some(prefix), local),
            None => Self::new(None, &raw),
        }
    }

    pub fn is(&self, prefix: Option<&str>, local: &str) -> bool {
        self.prefix.as_deref() == prefix && self.local == local
    }
}

impl fmt::Display for QName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.prefix {
            Some(prefix) => write!(f, "{}:{}", prefix, self.local),
            None => f.write_str(&self.local),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: QName,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartElement {
    pub name: QName,
    /// Attributes in document order, namespace declarations included.
    pub attributes: Vec<Attribute>,
}

impl StartElement {
    /// Look up an attribute value by its qualified name as written (`"xml:lang"`, `"to"`).
    pub fn attr(&self, qualified: &str) -> Option<&str> {
        let wanted = QName::from_raw(qualified.as_bytes());
        self.attributes
            .iter()
            .find(|a| a.name == wanted)
            .map(|a| a.value.as_str())
    }

    pub fn to_xml(&self) -> String {
        let mut xml = format!("<{}", self.name);
        for attr in &self.attributes {
            xml.push_str(&format!(" {}='{}'", attr.name, escape(attr.value.as_str())));
        }
        xml.push('>');
        xml
    }

    fn from_event(e: &BytesStart<'_>) -> Result<Self, TokenError> {
        let mut attributes = Vec::new();
        for attr in e.attributes() {
            let attr = attr.map_err(|e| TokenError::Syntax(e.to_string()))?;
            let value = attr
                .unescape_value()
                .map_err(|e| TokenError::Syntax(e.to_string()))?;
            attributes.push(Attribute {
                name: QName::from_raw(attr.key.as_ref()),
                value: value.into_owned(),
            });
        }
        Ok(Self {
            name: QName::from_raw(e.name().as_ref()),
            attributes,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndElement {
    pub name: QName,
}

impl EndElement {
    pub fn to_xml(&self) -> String {
        format!("</{}>", self.name)
    }
}

/// A processing instruction, including the `<?xml ...?>` declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcInst {
    pub target: String,
    pub inst: String,
}

impl ProcInst {
    fn from_raw(raw: &[u8]) -> Self {
        let raw = String::from_utf8_lossy(raw);
        let raw = raw.trim();
        match raw.split_once(char::is_whitespace) {
            Some((target, inst)) => Self {
                target: target.to_string(),
                inst: inst.trim_start().to_string(),
            },
            None => Self {
                target: raw.to_string(),
                inst: String::new(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    ProcInst(ProcInst),
    /// Text content, unescaped. CDATA sections are reported here too.
    CharData(String),
    StartElement(StartElement),
    EndElement(EndElement),
    Comment(String),
    /// `<!DOCTYPE ...>` and friends, without the surrounding `<!` and `>`.
    Directive(String),
}

impl Token {
    pub fn kind(&self) -> TokenKind {
        match self {
            Token::ProcInst(_) => TokenKind::ProcInst,
            Token::CharData(_) => TokenKind::CharData,
            Token::StartElement(_) => TokenKind::StartElement,
            Token::EndElement(_) => TokenKind::EndElement,
            Token::Comment(_) => TokenKind::Comment,
            Token::Directive(_) => TokenKind::Directive,
        }
    }

    /// Serialize the token back to XML text.
    pub fn to_xml(&self) -> String {
        match self {
            Token::ProcInst(pi) if pi.inst.is_empty() => format!("<?{}?>", pi.target),
            Token::ProcInst(pi) => format!("<?{} {}?>", pi.target, pi.inst),
            Token::CharData(text) => escape(text.as_str()).into_owned(),
            Token::StartElement(e) => e.to_xml(),
            Token::EndElement(e) => e.to_xml(),
            Token::Comment(text) => format!("<!--{}-->", text),
            Token::Directive(text) => format!("<!{}>", text),
        }
    }
}

/// The kind of a `Token`, without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    ProcInst,
    CharData,
    StartElement,
    EndElement,
    Comment,
    Directive,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TokenKind::ProcInst => "ProcInst",
            TokenKind::CharData => "CharData",
            TokenKind::StartElement => "StartElement",
            TokenKind::EndElement => "EndElement",
            TokenKind::Comment => "Comment",
            TokenKind::Directive => "Directive",
        };
        f.write_str(name)
    }
}

/// Reads `Token`s from a buffered async byte stream.
pub struct TokenDecoder<R> {
    reader: Reader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> TokenDecoder<R> {
    pub fn new(inner: R) -> Self {
        let mut reader = Reader::from_reader(inner);
        let config = reader.config_mut();
        // Whitespace between the declaration and the stream header is significant here
        config.trim_text(false);
        // Self-closing stanzas come out as StartElement + EndElement
        config.expand_empty_elements = true;
        Self {
            reader,
            buf: Vec::new(),
        }
    }

    /// Read the next token, whatever its kind.
    pub async fn next_token(&mut self) -> Result<Token, TokenError> {
        self.buf.clear();
        let event = self.reader.read_event_into_async(&mut self.buf).await?;
        match event {
            Event::Decl(decl) => Ok(Token::ProcInst(ProcInst::from_raw(&decl))),
            Event::PI(pi) => Ok(Token::ProcInst(ProcInst::from_raw(&pi))),
            Event::Text(text) => Ok(Token::CharData(
                text.unescape()
                    .map_err(|e| TokenError::Syntax(e.to_string()))?
                    .into_owned(),
            )),
            Event::CData(cdata) => Ok(Token::CharData(
                String::from_utf8_lossy(&cdata).into_owned(),
            )),
            Event::Start(start) => Ok(Token::StartElement(StartElement::from_event(&start)?)),
            // Not produced while expand_empty_elements is set
            Event::Empty(start) => Ok(Token::StartElement(StartElement::from_event(&start)?)),
            Event::End(end) => Ok(Token::EndElement(EndElement {
                name: QName::from_raw(end.name().as_ref()),
            })),
            Event::Comment(text) => Ok(Token::Comment(String::from_utf8_lossy(&text).into_owned())),
            Event::DocType(text) => Ok(Token::Directive(format!(
                "DOCTYPE {}",
                String::from_utf8_lossy(&text).trim()
            ))),
            Event::Eof => Err(TokenError::Eof),
        }
    }

    /// Read the next token and check that it is of the wanted kind.
    pub async fn expect(&mut self, wanted: TokenKind) -> Result<Token, TokenError> {
        let token = self.next_token().await?;
        if token.kind() != wanted {
            return Err(TokenError::WrongToken {
                wanted,
                got: token.kind(),
            });
        }
        Ok(token)
    }

    pub async fn expect_proc_inst(&mut self) -> Result<ProcInst, TokenError> {
        match self.expect(TokenKind::ProcInst).await? {
            Token::ProcInst(pi) => Ok(pi),
            other => Err(wrong(TokenKind::ProcInst, &other)),
        }
    }

    pub async fn expect_char_data(&mut self) -> Result<String, TokenError> {
        match self.expect(TokenKind::CharData).await? {
            Token::CharData(text) => Ok(text),
            other => Err(wrong(TokenKind::CharData, &other)),
        }
    }

    pub async fn expect_start_element(&mut self) -> Result<StartElement, TokenError> {
        match self.expect(TokenKind::StartElement).await? {
            Token::StartElement(e) => Ok(e),
            other => Err(wrong(TokenKind::StartElement, &other)),
        }
    }

    pub async fn expect_end_element(&mut self) -> Result<EndElement, TokenError> {
        match self.expect(TokenKind::EndElement).await? {
            Token::EndElement(e) => Ok(e),
            other => Err(wrong(TokenKind::EndElement, &other)),
        }
    }

    pub async fn expect_comment(&mut self) -> Result<String, TokenError> {
        match self.expect(TokenKind::Comment).await? {
            Token::Comment(text) => Ok(text),
            other => Err(wrong(TokenKind::Comment, &other)),
        }
    }

    pub async fn expect_directive(&mut self) -> Result<String, TokenError> {
        match self.expect(TokenKind::Directive).await? {
            Token::Directive(text) => Ok(text),
            other => Err(wrong(TokenKind::Directive, &other)),
        }
    }
}

fn wrong(wanted: TokenKind, got: &Token) -> TokenError {
    TokenError::WrongToken {
        wanted,
        got: got.kind(),
    }
}
