//! Thin element tree on top of `quick-xml`.
//!
//! Frames are small, so the transformer parses a whole frame into an
//! [`Element`] tree first and interprets the tree afterwards.

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::error::ProtocolError;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct Element {
    pub(crate) name: String,
    pub(crate) attributes: Vec<(String, String)>,
    pub(crate) children: Vec<Element>,
    pub(crate) text: String,
}

impl Element {
    pub(crate) fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }
}

/// Parses a document with exactly one root element.
///
/// Text is kept verbatim so parameter values survive a round trip;
/// whitespace-only text outside the root element is ignored.
pub(crate) fn parse(document: &str) -> Result<Element, ProtocolError> {
    let mut reader = Reader::from_str(document);
    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        let event = reader.read_event().map_err(|error| {
            ProtocolError::malformed(format!(
                "invalid XML at byte {}: {error}",
                reader.buffer_position()
            ))
        })?;

        match event {
            Event::Start(start) => stack.push(element_from(&start)?),
            Event::Empty(start) => {
                let element = element_from(&start)?;
                attach(&mut stack, &mut root, element)?;
            }
            Event::End(_) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| ProtocolError::malformed("unbalanced closing tag"))?;
                attach(&mut stack, &mut root, element)?;
            }
            Event::Text(text) => {
                let value = text
                    .unescape()
                    .map_err(|error| ProtocolError::malformed(error.to_string()))?;
                push_text(&mut stack, &value)?;
            }
            Event::CData(data) => {
                let value = String::from_utf8_lossy(&data).into_owned();
                push_text(&mut stack, &value)?;
            }
            Event::Eof => break,
            // Declarations, comments, processing instructions, doctypes.
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(ProtocolError::malformed("unclosed element at end of frame"));
    }
    root.ok_or_else(|| ProtocolError::malformed("frame contains no root element"))
}

fn element_from(start: &BytesStart<'_>) -> Result<Element, ProtocolError> {
    let name = utf8(start.name().as_ref())?;
    let mut attributes = Vec::new();
    for attribute in start.attributes() {
        let attribute = attribute.map_err(|error| ProtocolError::malformed(error.to_string()))?;
        let key = utf8(attribute.key.as_ref())?;
        let value = attribute
            .unescape_value()
            .map_err(|error| ProtocolError::malformed(error.to_string()))?;
        attributes.push((key, value.into_owned()));
    }

    Ok(Element {
        name,
        attributes,
        ..Element::default()
    })
}

fn attach(
    stack: &mut [Element],
    root: &mut Option<Element>,
    element: Element,
) -> Result<(), ProtocolError> {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(element);
        return Ok(());
    }
    if root.is_some() {
        return Err(ProtocolError::malformed("multiple root elements"));
    }
    *root = Some(element);
    Ok(())
}

fn push_text(stack: &mut [Element], value: &str) -> Result<(), ProtocolError> {
    match stack.last_mut() {
        Some(element) => {
            element.text.push_str(value);
            Ok(())
        }
        None if value.trim().is_empty() => Ok(()),
        None => Err(ProtocolError::malformed("text outside the root element")),
    }
}

fn utf8(bytes: &[u8]) -> Result<String, ProtocolError> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| ProtocolError::malformed("element or attribute name is not UTF-8"))
}

/// Event-level writer producing the body of one frame.
pub(crate) struct XmlWriter {
    writer: Writer<Vec<u8>>,
}

impl XmlWriter {
    pub(crate) fn new() -> Self {
        Self {
            writer: Writer::new(Vec::new()),
        }
    }

    pub(crate) fn open(
        &mut self,
        name: &str,
        attributes: &[(&str, &str)],
    ) -> Result<(), ProtocolError> {
        check_name(name)?;
        let mut start = BytesStart::new(name);
        for attribute in attributes {
            check_text(attribute.1)?;
            start.push_attribute(*attribute);
        }
        self.write(Event::Start(start))
    }

    pub(crate) fn close(&mut self, name: &str) -> Result<(), ProtocolError> {
        self.write(Event::End(BytesEnd::new(name)))
    }

    /// Writes `<name>value</name>`.
    pub(crate) fn leaf(&mut self, name: &str, value: &str) -> Result<(), ProtocolError> {
        check_text(value)?;
        self.open(name, &[])?;
        if !value.is_empty() {
            self.write(Event::Text(BytesText::new(value)))?;
        }
        self.close(name)
    }

    pub(crate) fn finish(self) -> Vec<u8> {
        self.writer.into_inner()
    }

    fn write(&mut self, event: Event<'_>) -> Result<(), ProtocolError> {
        self.writer
            .write_event(event)
            .map_err(|error| ProtocolError::Encode(error.to_string()))
    }
}

/// Parameter names become tag names, so they must be valid XML names.
fn check_name(name: &str) -> Result<(), ProtocolError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_alphabetic() || first == '_' => {
            chars.all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.'))
        }
        _ => false,
    };
    if valid && !name.to_ascii_lowercase().starts_with("xml") {
        Ok(())
    } else {
        Err(ProtocolError::Encode(format!(
            "`{name}` is not a valid element name"
        )))
    }
}

/// Escaping covers markup, but characters outside the XML 1.0 `Char`
/// production cannot appear in a document at all.
fn check_text(value: &str) -> Result<(), ProtocolError> {
    match value.chars().find(|&c| !is_xml_char(c)) {
        Some(c) => Err(ProtocolError::Encode(format!(
            "character U+{:04X} cannot be sent",
            c as u32
        ))),
        None => Ok(()),
    }
}

fn is_xml_char(c: char) -> bool {
    matches!(
        c,
        '\t' | '\n'
            | '\r'
            | '\u{20}'..='\u{D7FF}'
            | '\u{E000}'..='\u{FFFD}'
            | '\u{10000}'..='\u{10FFFF}'
    )
}
