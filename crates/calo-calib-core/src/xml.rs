//! Minimal owned XML element tree.
//!
//! The pipeline deals with three small XML dialects: the calibration
//! document, the reconstruction steering files and the Pandora settings
//! files. All of them fit comfortably in memory, so everything is parsed
//! eagerly into this tree and the quick-xml event plumbing stays confined
//! to this module.

use std::fs;
use std::path::Path;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::error::{Error, Result};

/// An owned XML element: name, attributes, optional text and children.
///
/// Mixed content is not modeled; an element carries either text or child
/// elements (whitespace-only text is dropped on parse).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    name: String,
    attributes: Vec<(String, String)>,
    text: Option<String>,
    children: Vec<Element>,
}

impl Element {
    /// Create an empty element.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            text: None,
            children: Vec::new(),
        }
    }

    /// Create a text-only element.
    pub fn with_text(name: impl Into<String>, text: impl Into<String>) -> Self {
        let mut element = Self::new(name);
        element.text = Some(text.into());
        element
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    pub fn set_text(&mut self, text: impl Into<String>) {
        self.text = Some(text.into());
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Insert or replace an attribute.
    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.attributes.iter_mut().find(|(key, _)| *key == name) {
            Some(slot) => slot.1 = value,
            None => self.attributes.push((name, value)),
        }
    }

    pub fn remove_attribute(&mut self, name: &str) {
        self.attributes.retain(|(key, _)| key != name);
    }

    pub fn children(&self) -> &[Element] {
        &self.children
    }

    pub fn children_mut(&mut self) -> &mut Vec<Element> {
        &mut self.children
    }

    pub fn into_children(self) -> Vec<Element> {
        self.children
    }

    /// Iterate over direct children with the given element name.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.children.iter().filter(move |child| child.name == name)
    }

    /// First direct child with the given name.
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|child| child.name == name)
    }

    /// First direct child with the given name, mutable.
    pub fn child_mut(&mut self, name: &str) -> Option<&mut Element> {
        self.children.iter_mut().find(|child| child.name == name)
    }

    /// First direct child with the given name and attribute value.
    pub fn child_where<'a>(&'a self, name: &'a str, attribute: &str, value: &str) -> Option<&'a Element> {
        self.children_named(name)
            .find(|child| child.attribute(attribute) == Some(value))
    }

    pub fn push_child(&mut self, child: Element) {
        self.children.push(child);
    }

    pub fn retain_children(&mut self, keep: impl FnMut(&Element) -> bool) {
        self.children.retain(keep);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Parsing
    // ─────────────────────────────────────────────────────────────────────

    /// Parse a document from a string; returns the root element.
    pub fn from_str(input: &str) -> Result<Element> {
        let mut reader = Reader::from_str(input);
        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;

        loop {
            let event = reader.read_event().map_err(xml_error)?;
            match event {
                Event::Eof => break,
                Event::Start(start) => stack.push(Self::from_start(&start)?),
                Event::Empty(start) => {
                    let element = Self::from_start(&start)?;
                    attach(element, &mut stack, &mut root)?;
                }
                Event::End(_) => {
                    let element = stack.pop().ok_or_else(|| Error::Xml {
                        detail: "unbalanced closing tag".into(),
                    })?;
                    attach(element, &mut stack, &mut root)?;
                }
                Event::Text(text) => {
                    let value = text.unescape().map_err(xml_error)?;
                    append_text(&mut stack, value.trim());
                }
                Event::CData(data) => {
                    let value = String::from_utf8_lossy(&data).into_owned();
                    append_text(&mut stack, value.trim());
                }
                // declarations, comments, processing instructions, doctypes
                _ => {}
            }
        }

        if !stack.is_empty() {
            return Err(Error::Xml {
                detail: "unclosed element at end of document".into(),
            });
        }
        root.ok_or_else(|| Error::Xml {
            detail: "document has no root element".into(),
        })
    }

    /// Parse a document from a file.
    pub fn load(path: impl AsRef<Path>) -> Result<Element> {
        let path = path.as_ref();
        let input = fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_str(&input).map_err(|error| match error {
            Error::Xml { detail } => Error::Xml {
                detail: format!("{}: {detail}", path.display()),
            },
            other => other,
        })
    }

    fn from_start(start: &BytesStart<'_>) -> Result<Element> {
        let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        let mut element = Element::new(name);
        for attribute in start.attributes() {
            let attribute = attribute.map_err(xml_error)?;
            let key = String::from_utf8_lossy(attribute.key.as_ref()).into_owned();
            let value = attribute.unescape_value().map_err(xml_error)?.into_owned();
            element.attributes.push((key, value));
        }
        Ok(element)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Serialization
    // ─────────────────────────────────────────────────────────────────────

    /// Serialize as a full document with an XML declaration, indented with
    /// two spaces. Output is deterministic: attributes and children are
    /// written in insertion order.
    pub fn to_xml_string(&self) -> Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))
            .map_err(xml_error)?;
        self.write_into(&mut writer)?;
        let mut output = String::from_utf8(writer.into_inner()).map_err(|error| Error::Xml {
            detail: error.to_string(),
        })?;
        output.push('\n');
        Ok(output)
    }

    /// Serialize to a file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let output = self.to_xml_string()?;
        fs::write(path, output).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    fn write_into(&self, writer: &mut Writer<Vec<u8>>) -> Result<()> {
        let mut start = BytesStart::new(self.name.as_str());
        for (key, value) in &self.attributes {
            start.push_attribute((key.as_str(), value.as_str()));
        }

        if self.children.is_empty() && self.text.is_none() {
            return writer.write_event(Event::Empty(start)).map_err(xml_error);
        }

        writer.write_event(Event::Start(start)).map_err(xml_error)?;
        if let Some(text) = &self.text {
            writer
                .write_event(Event::Text(BytesText::new(text)))
                .map_err(xml_error)?;
        }
        for child in &self.children {
            child.write_into(writer)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new(self.name.as_str())))
            .map_err(xml_error)
    }
}

fn attach(element: Element, stack: &mut [Element], root: &mut Option<Element>) -> Result<()> {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(element);
        return Ok(());
    }
    if root.is_some() {
        return Err(Error::Xml {
            detail: "multiple root elements".into(),
        });
    }
    *root = Some(element);
    Ok(())
}

fn append_text(stack: &mut [Element], text: &str) {
    if text.is_empty() {
        return;
    }
    if let Some(open) = stack.last_mut() {
        match &mut open.text {
            Some(existing) => {
                existing.push(' ');
                existing.push_str(text);
            }
            None => open.text = Some(text.to_string()),
        }
    }
}

fn xml_error(error: impl std::fmt::Display) -> Error {
    Error::Xml {
        detail: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_nested_document() {
        let root = Element::from_str(
            r#"<?xml version="1.0"?>
            <calibration>
              <input>
                <ecalMip>0.0001575</ecalMip>
                <parameter processor="MyEcalBarrelDigi" name="calibration_mip">0.0001575</parameter>
              </input>
              <step name="MipScale"/>
            </calibration>"#,
        )
        .unwrap();

        assert_eq!(root.name(), "calibration");
        assert_eq!(root.children().len(), 2);

        let input = root.child("input").unwrap();
        assert_eq!(input.child("ecalMip").unwrap().text(), Some("0.0001575"));

        let parameter = input.child("parameter").unwrap();
        assert_eq!(parameter.attribute("processor"), Some("MyEcalBarrelDigi"));
        assert_eq!(parameter.attribute("name"), Some("calibration_mip"));

        let step = root.child_where("step", "name", "MipScale").unwrap();
        assert!(step.children().is_empty());
    }

    #[test]
    fn whitespace_only_text_is_dropped() {
        let root = Element::from_str("<a>\n  <b>x</b>\n</a>").unwrap();
        assert_eq!(root.text(), None);
        assert_eq!(root.child("b").unwrap().text(), Some("x"));
    }

    #[test]
    fn round_trip_is_stable() {
        let mut root = Element::new("calibration");
        let mut step = Element::new("step");
        step.set_attribute("name", "EcalEnergy");
        step.push_child(Element::with_text("precision", "0.004"));
        root.push_child(step);

        let first = root.to_xml_string().unwrap();
        let reparsed = Element::from_str(&first).unwrap();
        assert_eq!(reparsed, root);
        let second = reparsed.to_xml_string().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn text_is_escaped() {
        let element = Element::with_text("note", "a < b & c");
        let xml = element.to_xml_string().unwrap();
        assert!(xml.contains("a &lt; b &amp; c"));
        let reparsed = Element::from_str(&xml).unwrap();
        assert_eq!(reparsed.text(), Some("a < b & c"));
    }

    #[test]
    fn set_attribute_replaces_existing() {
        let mut element = Element::new("parameter");
        element.set_attribute("name", "old");
        element.set_attribute("name", "new");
        assert_eq!(element.attribute("name"), Some("new"));
        element.remove_attribute("name");
        assert_eq!(element.attribute("name"), None);
    }

    #[test]
    fn rejects_malformed_documents() {
        assert!(Element::from_str("<a><b></a>").is_err());
        assert!(Element::from_str("").is_err());
    }
}
