//! XML envelope codec for the payment gateway.
//!
//! The gateway exchanges flat key/value maps wrapped in a single root
//! element; every field is scalar, attributes carry no meaning, and text
//! fields may contain markup-significant characters, so values are
//! emitted as CDATA. The XML shape is an external wire constraint and is
//! fully contained in this module; the rest of the crate only sees
//! [`Params`](super::sign::Params).

use quick_xml::events::{BytesCData, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use thiserror::Error;

use super::sign::Params;

const ROOT: &str = "xml";

/// A malformed or unexpectedly shaped envelope. Recoverable: callers log
/// and reject the message, which makes the gateway redeliver it.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed xml: {0}")]
    Malformed(#[from] quick_xml::Error),

    #[error("unexpected envelope shape: {0}")]
    UnexpectedShape(String),

    #[error("invalid utf-8 in element {0}")]
    InvalidText(String),
}

/// Encode a parameter map as an XML envelope under a single root.
pub fn encode(params: &Params) -> Result<Vec<u8>, WireError> {
    let mut writer = Writer::new(Vec::new());
    writer.write_event(Event::Start(BytesStart::new(ROOT)))?;
    for (name, value) in params {
        writer.write_event(Event::Start(BytesStart::new(name.as_str())))?;
        // CDATA cannot represent its own terminator; fall back to entity
        // escaping for values that contain one.
        if value.contains("]]>") {
            writer.write_event(Event::Text(BytesText::new(value)))?;
        } else {
            writer.write_event(Event::CData(BytesCData::new(value.as_str())))?;
        }
        writer.write_event(Event::End(BytesEnd::new(name.as_str())))?;
    }
    writer.write_event(Event::End(BytesEnd::new(ROOT)))?;
    Ok(writer.into_inner())
}

/// Decode an XML envelope into a flat parameter map.
///
/// Only direct children of the root are read; attributes are ignored and
/// nested structures are rejected. Duplicate fields keep the last value.
pub fn decode(xml: &[u8]) -> Result<Params, WireError> {
    let mut reader = Reader::from_reader(xml);
    reader.trim_text(true);

    let mut buf = Vec::new();
    let mut params = Params::new();
    let mut depth = 0usize;
    let mut saw_root = false;
    let mut field: Option<String> = None;
    let mut value = String::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(start) => {
                depth += 1;
                match depth {
                    1 => saw_root = true,
                    2 => {
                        field = Some(element_name(&start)?);
                        value.clear();
                    }
                    _ => {
                        return Err(WireError::UnexpectedShape(format!(
                            "nested element {}",
                            element_name(&start)?
                        )))
                    }
                }
            }
            Event::Empty(start) => match depth {
                // A self-closing root is an envelope with no fields.
                0 => saw_root = true,
                1 => {
                    params.insert(element_name(&start)?, String::new());
                }
                _ => {}
            },
            Event::Text(text) if depth == 2 => {
                value.push_str(&text.unescape()?);
            }
            Event::CData(cdata) => {
                if depth == 2 {
                    let raw = cdata.into_inner();
                    let text = std::str::from_utf8(&raw)
                        .map_err(|_| WireError::InvalidText(field.clone().unwrap_or_default()))?;
                    value.push_str(text);
                }
            }
            Event::End(_) => {
                if depth == 0 {
                    return Err(WireError::UnexpectedShape(
                        "closing tag without an open element".to_string(),
                    ));
                }
                if depth == 2 {
                    if let Some(name) = field.take() {
                        params.insert(name, std::mem::take(&mut value));
                    }
                }
                depth -= 1;
            }
            Event::Eof => break,
            // Declarations, comments, PIs and top-level whitespace carry
            // no payload fields.
            _ => {}
        }
        buf.clear();
    }

    if depth != 0 {
        return Err(WireError::UnexpectedShape("truncated envelope".to_string()));
    }
    if !saw_root {
        return Err(WireError::UnexpectedShape(
            "missing root element".to_string(),
        ));
    }
    Ok(params)
}

fn element_name(start: &BytesStart<'_>) -> Result<String, WireError> {
    std::str::from_utf8(start.local_name().as_ref())
        .map(str::to_string)
        .map_err(|_| WireError::InvalidText("<element name>".to_string()))
}
