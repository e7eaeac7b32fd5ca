//! XMPP TCP stream framing.
//!
//! Splits the inbound byte stream into frames (stream open, stream close,
//! complete top-level stanzas) and renders the server side of the stream
//! header and footer.

use quick_xml::errors::SyntaxError;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::element::NS_STREAMS;
use super::error::ComponentError;

pub const STREAM_FOOTER: &str = "</stream:stream>";

/// Attributes of a peer's `<stream:stream>` opening tag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamHeader {
    pub to: Option<String>,
    pub from: Option<String>,
    pub id: Option<String>,
    pub version: Option<String>,
    /// Default namespace declared by the peer (`xmlns`).
    pub default_ns: Option<String>,
    pub stream_ns: Option<String>,
    pub lang: Option<String>,
}

impl StreamHeader {
    fn from_start(start: &BytesStart) -> Result<Self, ComponentError> {
        let mut header = StreamHeader::default();
        for attr in start.attributes() {
            let attr =
                attr.map_err(|e| ComponentError::protocol(format!("bad stream attribute: {}", e)))?;
            let value = attr
                .unescape_value()
                .map_err(|e| ComponentError::protocol(format!("bad stream attribute: {}", e)))?
                .into_owned();
            match attr.key.as_ref() {
                b"to" => header.to = Some(value),
                b"from" => header.from = Some(value),
                b"id" => header.id = Some(value),
                b"version" => header.version = Some(value),
                b"xmlns" => header.default_ns = Some(value),
                b"xmlns:stream" => header.stream_ns = Some(value),
                b"xml:lang" => header.lang = Some(value),
                _ => {}
            }
        }
        Ok(header)
    }

    /// A header is acceptable when it declares no streams namespace or the right one.
    pub fn validate(&self) -> Result<(), ComponentError> {
        match self.stream_ns.as_deref() {
            None | Some(NS_STREAMS) => Ok(()),
            Some(other) => Err(ComponentError::protocol(format!(
                "unexpected stream namespace '{}'",
                other
            ))),
        }
    }
}

/// One unit of inbound stream traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    StreamOpen(StreamHeader),
    StreamClose,
    /// Raw XML of a complete top-level stanza.
    Stanza(String),
}

/// Render the server's stream header.
pub fn stream_header(component_ns: &str, stream_id: &str, from_jid: &str) -> String {
    format!(
        "<?xml version='1.0'?><stream:stream xmlns='{}' xmlns:stream='{}' id='{}' from='{}' version='1.0'>",
        escape(component_ns),
        NS_STREAMS,
        escape(stream_id),
        escape(from_jid)
    )
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ParserState {
    /// Between stanzas, or before the stream is opened.
    Idle,
    /// Inside a top-level stanza.
    InStanza,
}

fn bytes_to_string(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

const STREAM_TAG: &[u8] = b"stream:stream";

fn is_stream_tag(start: &BytesStart) -> bool {
    start.name().as_ref() == STREAM_TAG
}

/// Extract one frame from the front of `buffer`.
///
/// Returns `Ok(Some((frame, bytes_consumed)))` for a complete frame,
/// `Ok(None)` when more bytes are needed, and a protocol error for input that
/// can never become well-formed.
pub fn extract_frame(buffer: &[u8]) -> Result<Option<(Frame, usize)>, ComponentError> {
    // The closing tag shows up without a matching opening tag in the buffer.
    let first = buffer
        .iter()
        .position(|&b| !matches!(b, b' ' | b'\t' | b'\n' | b'\r'));
    if let Some(start) = first {
        if buffer[start..].starts_with(STREAM_FOOTER.as_bytes()) {
            return Ok(Some((Frame::StreamClose, start + STREAM_FOOTER.len())));
        }
    }

    let mut reader = Reader::from_reader(buffer);
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = false;

    let mut depth: u32 = 0;
    let mut state = ParserState::Idle;
    let mut stanza_start: usize = 0;

    loop {
        let pos = reader.buffer_position() as usize;

        match reader.read_event() {
            Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::Comment(_)) | Ok(Event::DocType(_)) => {
                continue;
            }
            Ok(Event::Start(e)) => {
                if state == ParserState::Idle && depth == 0 && is_stream_tag(&e) {
                    let header = StreamHeader::from_start(&e)?;
                    let tag_end = reader.buffer_position() as usize;
                    return Ok(Some((Frame::StreamOpen(header), tag_end)));
                }

                depth += 1;
                if state == ParserState::Idle && depth == 1 {
                    state = ParserState::InStanza;
                    stanza_start = pos;
                }
            }
            Ok(Event::Empty(e)) => {
                if state == ParserState::Idle && depth == 0 {
                    let tag_end = reader.buffer_position() as usize;
                    if is_stream_tag(&e) {
                        // Opened and closed at once: treat as open, the close follows.
                        let header = StreamHeader::from_start(&e)?;
                        return Ok(Some((Frame::StreamOpen(header), tag_end)));
                    }
                    return Ok(Some((
                        Frame::Stanza(bytes_to_string(&buffer[pos..tag_end])),
                        tag_end,
                    )));
                }
            }
            Ok(Event::Text(_)) | Ok(Event::CData(_)) => {}
            Ok(Event::End(e)) => {
                if depth == 0 && e.name().as_ref() == STREAM_TAG {
                    let tag_end = reader.buffer_position() as usize;
                    return Ok(Some((Frame::StreamClose, tag_end)));
                }

                depth = depth.saturating_sub(1);
                if state == ParserState::InStanza && depth == 0 {
                    let tag_end = reader.buffer_position() as usize;
                    return Ok(Some((
                        Frame::Stanza(bytes_to_string(&buffer[stanza_start..tag_end])),
                        tag_end,
                    )));
                }
            }
            Ok(Event::Eof) => return Ok(None),
            // Partial markup at the end of the buffer; the next read completes it.
            Err(quick_xml::Error::Syntax(SyntaxError::InvalidBangMarkup)) => {
                return Err(ComponentError::protocol("invalid <! markup"));
            }
            Err(quick_xml::Error::Syntax(_)) => return Ok(None),
            Err(e) => {
                return Err(ComponentError::protocol(format!("XML parsing error: {}", e)));
            }
        }
    }
}
