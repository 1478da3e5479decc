//! Stanza framing over a byte stream.
//!
//! An XMPP stream is one long XML document. [`StanzaCodec`] cuts it into
//! frames: the `<stream:stream>` header, each complete top-level stanza, and
//! the closing `</stream:stream>`. Boundaries are found with a streaming
//! `quick-xml` pass; each stanza is then parsed into a [`minidom::Element`]
//! inside a synthetic stream root so it inherits `jabber:client` and the
//! `stream:` prefix the way it would in the real document.

use bytes::{Buf, BufMut, BytesMut};
use minidom::Element;
use quick_xml::errors::SyntaxError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::error::CodecError;
use crate::stanza::ns;

/// Largest amount of buffered input without a complete frame.
pub const DEFAULT_MAX_BUFFER: usize = 1024 * 1024;

const STREAM_CLOSE: &str = "</stream:stream>";

/// Attributes of a `<stream:stream>` header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamHeader {
    /// The 'to' attribute (target domain)
    pub to: Option<String>,
    /// The 'from' attribute (source domain)
    pub from: Option<String>,
    /// The 'id' attribute (stream ID, set by server)
    pub id: Option<String>,
    /// The 'version' attribute (should be "1.0")
    pub version: Option<String>,
    /// The 'xml:lang' attribute
    pub lang: Option<String>,
}

impl StreamHeader {
    /// Header a client sends to open a stream towards `domain`.
    pub fn client_to(domain: &str) -> Self {
        Self {
            to: Some(domain.to_string()),
            version: Some("1.0".to_string()),
            ..Self::default()
        }
    }

    fn from_start(start: &BytesStart<'_>) -> Self {
        let mut header = StreamHeader::default();
        for attr in start.attributes().flatten() {
            let value = String::from_utf8_lossy(&attr.value).into_owned();
            match attr.key.as_ref() {
                b"to" => header.to = Some(value),
                b"from" => header.from = Some(value),
                b"id" => header.id = Some(value),
                b"version" => header.version = Some(value),
                b"xml:lang" => header.lang = Some(value),
                _ => {}
            }
        }
        header
    }

    fn write_open_tag(&self, out: &mut String) {
        out.push_str("<?xml version='1.0'?><stream:stream");
        let attributes = [
            ("to", &self.to),
            ("from", &self.from),
            ("id", &self.id),
            ("version", &self.version),
            ("xml:lang", &self.lang),
        ];
        for (name, value) in attributes {
            if let Some(value) = value {
                out.push_str(&format!(" {name}='{}'", quick_xml::escape::escape(value.as_str())));
            }
        }
        out.push_str(&format!(
            " xmlns='{}' xmlns:stream='{}'>",
            ns::JABBER_CLIENT,
            ns::STREAM
        ));
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    StreamOpen(StreamHeader),
    Stanza(Element),
    StreamClose,
}

#[derive(Debug, PartialEq)]
enum Boundary {
    Open(StreamHeader),
    Stanza { start: usize },
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ParserState {
    Idle,
    InStanza,
}

fn is_stream_tag(start: &BytesStart<'_>) -> bool {
    start.name().local_name().as_ref() == b"stream"
}

fn is_incomplete(error: &quick_xml::Error) -> bool {
    matches!(
        error,
        quick_xml::Error::Syntax(
            SyntaxError::UnclosedTag
                | SyntaxError::UnclosedPIOrXmlDecl
                | SyntaxError::UnclosedComment
                | SyntaxError::UnclosedDoctype
                | SyntaxError::UnclosedCData
        )
    )
}

/// Finds the first complete frame in `buffer`.
///
/// Returns the boundary and the number of bytes it consumed, or `None` when
/// more input is needed.
fn find_boundary(buffer: &[u8]) -> Result<Option<(Boundary, usize)>, CodecError> {
    let first = buffer.iter().position(|b| !b.is_ascii_whitespace());
    if let Some(first) = first {
        if buffer[first..].starts_with(STREAM_CLOSE.as_bytes()) {
            return Ok(Some((Boundary::Close, first + STREAM_CLOSE.len())));
        }
    }

    let mut reader = Reader::from_reader(buffer);
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = false;

    let mut depth: u32 = 0;
    let mut state = ParserState::Idle;
    let mut stanza_start = 0usize;

    loop {
        let pos = reader.buffer_position() as usize;

        match reader.read_event() {
            Ok(Event::Start(start)) => {
                if state == ParserState::Idle && is_stream_tag(&start) {
                    let end = reader.buffer_position() as usize;
                    return Ok(Some((Boundary::Open(StreamHeader::from_start(&start)), end)));
                }

                depth += 1;
                if state == ParserState::Idle && depth == 1 {
                    state = ParserState::InStanza;
                    stanza_start = pos;
                }
            }
            Ok(Event::Empty(start)) => {
                if state == ParserState::Idle && is_stream_tag(&start) {
                    let end = reader.buffer_position() as usize;
                    return Ok(Some((Boundary::Open(StreamHeader::from_start(&start)), end)));
                }
                if state == ParserState::Idle && depth == 0 {
                    let end = reader.buffer_position() as usize;
                    return Ok(Some((Boundary::Stanza { start: pos }, end)));
                }
            }
            Ok(Event::End(end_tag)) => {
                if depth == 0 && end_tag.name().local_name().as_ref() == b"stream" {
                    let end = reader.buffer_position() as usize;
                    return Ok(Some((Boundary::Close, end)));
                }

                depth = depth.saturating_sub(1);
                if state == ParserState::InStanza && depth == 0 {
                    let end = reader.buffer_position() as usize;
                    return Ok(Some((Boundary::Stanza { start: stanza_start }, end)));
                }
            }
            Ok(Event::Eof) => return Ok(None),
            Ok(_) => {}
            Err(error) if is_incomplete(&error) => return Ok(None),
            Err(error) => return Err(CodecError::Malformed(error.to_string())),
        }
    }
}

/// Parses one stanza as a child of a synthetic `<stream:stream>` root.
fn parse_stanza(fragment: &[u8]) -> Result<Element, CodecError> {
    let fragment = std::str::from_utf8(fragment)
        .map_err(|e| CodecError::Malformed(format!("invalid UTF-8: {e}")))?;
    let document = format!(
        "<stream:stream xmlns='{}' xmlns:stream='{}'>{fragment}</stream:stream>",
        ns::JABBER_CLIENT,
        ns::STREAM
    );
    let root: Element = document
        .parse()
        .map_err(|e: minidom::Error| CodecError::Malformed(e.to_string()))?;
    root.children()
        .next()
        .cloned()
        .ok_or_else(|| CodecError::Malformed("empty stanza".to_string()))
}

#[derive(Debug)]
pub struct StanzaCodec {
    max_buffer: usize,
}

impl StanzaCodec {
    pub fn new() -> Self {
        Self::with_max_buffer(DEFAULT_MAX_BUFFER)
    }

    pub fn with_max_buffer(max_buffer: usize) -> Self {
        Self { max_buffer }
    }
}

impl Default for StanzaCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for StanzaCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.iter().all(u8::is_ascii_whitespace) {
            src.clear();
            return Ok(None);
        }

        let Some((boundary, consumed)) = find_boundary(&src[..])? else {
            if src.len() > self.max_buffer {
                return Err(CodecError::BufferOverflow {
                    limit: self.max_buffer,
                });
            }
            return Ok(None);
        };

        let frame = match boundary {
            Boundary::Open(header) => Frame::StreamOpen(header),
            Boundary::Close => Frame::StreamClose,
            Boundary::Stanza { start } => Frame::Stanza(parse_stanza(&src[start..consumed])?),
        };
        src.advance(consumed);
        trace!(consumed, "decoded frame");
        Ok(Some(frame))
    }
}

impl Encoder<Frame> for StanzaCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Frame::StreamOpen(header) => {
                let mut open = String::new();
                header.write_open_tag(&mut open);
                dst.extend_from_slice(open.as_bytes());
            }
            Frame::Stanza(element) => {
                let mut writer = dst.writer();
                element
                    .write_to(&mut writer)
                    .map_err(|e| CodecError::Malformed(format!("failed to serialize: {e}")))?;
            }
            Frame::StreamClose => dst.extend_from_slice(STREAM_CLOSE.as_bytes()),
        }
        Ok(())
    }
}
