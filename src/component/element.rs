//! Owned XML element tree for top-level stanzas.
//!
//! Stanzas are extracted from the byte stream one at a time (see `framing`)
//! and parsed here with quick-xml's namespace-aware reader. Unprefixed
//! elements without an `xmlns` declaration inherit the stream's default
//! namespace, and the `stream:` prefix resolves to the streams namespace even
//! though its declaration lives on the stream header.

use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::ResolveResult;
use quick_xml::NsReader;

use super::error::ComponentError;

pub const NS_CLIENT: &str = "jabber:client";
pub const NS_COMPONENT_ACCEPT: &str = "jabber:component:accept";
pub const NS_STREAMS: &str = "http://etherx.jabber.org/streams";
pub const NS_TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    name: String,
    ns: String,
    attrs: Vec<(String, String)>,
    children: Vec<Node>,
}

impl Element {
    pub fn new(name: impl Into<String>, ns: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ns: ns.into(),
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(key, value);
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(Node::Element(child));
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.children.push(Node::Text(text.into()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ns(&self) -> &str {
        &self.ns
    }

    pub fn set_ns(&mut self, ns: impl Into<String>) {
        self.ns = ns.into();
    }

    /// `{namespace}name`, the form handler matchers are keyed by.
    pub fn qualified_name(&self) -> String {
        format!("{{{}}}{}", self.ns, self.name)
    }

    pub fn is(&self, name: &str, ns: &str) -> bool {
        self.name == name && self.ns == ns
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.attrs.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.attrs.push((key, value)),
        }
    }

    pub fn attrs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attrs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn nodes(&self) -> &[Node] {
        &self.children
    }

    pub fn nodes_mut(&mut self) -> &mut Vec<Node> {
        &mut self.children
    }

    pub fn children(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|n| match n {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    pub fn get_child(&self, name: &str, ns: &str) -> Option<&Element> {
        self.children().find(|c| c.is(name, ns))
    }

    /// Concatenated direct text content.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|n| match n {
                Node::Text(t) => Some(t.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    /// Parse a single top-level stanza. `default_ns` is the namespace
    /// inherited from the enclosing stream header.
    pub fn parse(xml: &str, default_ns: &str) -> Result<Element, ComponentError> {
        let mut reader = NsReader::from_str(xml);
        reader.config_mut().trim_text(false);

        let mut stack: Vec<Element> = Vec::new();

        loop {
            match reader.read_resolved_event() {
                Ok((ns, Event::Start(e))) => {
                    stack.push(element_from_start(&ns, &e, default_ns)?);
                }
                Ok((ns, Event::Empty(e))) => {
                    let element = element_from_start(&ns, &e, default_ns)?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(Node::Element(element)),
                        None => return Ok(element),
                    }
                }
                Ok((_, Event::End(_))) => {
                    let element = stack
                        .pop()
                        .ok_or_else(|| ComponentError::protocol("unbalanced end tag"))?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(Node::Element(element)),
                        None => return Ok(element),
                    }
                }
                Ok((_, Event::Text(t))) => {
                    if let Some(parent) = stack.last_mut() {
                        let text = t
                            .unescape()
                            .map_err(|e| ComponentError::protocol(format!("bad text: {}", e)))?;
                        parent.children.push(Node::Text(text.into_owned()));
                    }
                }
                Ok((_, Event::CData(c))) => {
                    if let Some(parent) = stack.last_mut() {
                        let raw = c.into_inner();
                        parent
                            .children
                            .push(Node::Text(String::from_utf8_lossy(&raw).into_owned()));
                    }
                }
                Ok((_, Event::Eof)) => {
                    return Err(ComponentError::protocol("incomplete element"));
                }
                // Declarations, comments and processing instructions.
                Ok(_) => {}
                Err(e) => {
                    return Err(ComponentError::protocol(format!("malformed XML: {}", e)));
                }
            }
        }
    }

    /// Serialize as a standalone document fragment (root declares its namespace).
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_into(&mut out, None, true);
        out
    }

    /// Serialize for sending inside a stream whose default namespace is `stream_ns`.
    pub fn to_stream_xml(&self, stream_ns: &str) -> String {
        let mut out = String::new();
        self.write_into(&mut out, Some(stream_ns), false);
        out
    }

    fn write_into(&self, out: &mut String, inherited: Option<&str>, standalone: bool) {
        let streams = self.ns == NS_STREAMS;
        let tag = if streams {
            format!("stream:{}", self.name)
        } else {
            self.name.clone()
        };

        out.push('<');
        out.push_str(&tag);

        let mut default_ns = inherited;
        if streams {
            if standalone {
                out.push_str(" xmlns:stream='");
                out.push_str(NS_STREAMS);
                out.push('\'');
            }
        } else if inherited != Some(self.ns.as_str()) {
            out.push_str(" xmlns='");
            out.push_str(&escape(self.ns.as_str()));
            out.push('\'');
            default_ns = Some(self.ns.as_str());
        }

        for (k, v) in &self.attrs {
            out.push(' ');
            out.push_str(k);
            out.push_str("='");
            out.push_str(&escape(v.as_str()));
            out.push('\'');
        }

        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }

        out.push('>');
        for node in &self.children {
            match node {
                Node::Element(child) => child.write_into(out, default_ns, false),
                Node::Text(text) => out.push_str(&escape(text.as_str())),
            }
        }
        out.push_str("</");
        out.push_str(&tag);
        out.push('>');
    }
}

fn element_from_start(
    resolved: &ResolveResult,
    start: &BytesStart,
    default_ns: &str,
) -> Result<Element, ComponentError> {
    let qname = start.name();
    let name = String::from_utf8_lossy(qname.local_name().as_ref()).into_owned();

    let ns = match resolved {
        ResolveResult::Bound(ns) => String::from_utf8_lossy(ns.as_ref()).into_owned(),
        ResolveResult::Unbound => default_ns.to_string(),
        // Declared on the stream header, which is not part of the stanza buffer.
        ResolveResult::Unknown(prefix) if prefix.as_slice() == b"stream" => NS_STREAMS.to_string(),
        ResolveResult::Unknown(prefix) => {
            return Err(ComponentError::protocol(format!(
                "undeclared namespace prefix '{}' on <{}>",
                String::from_utf8_lossy(prefix),
                name
            )));
        }
    };

    let mut element = Element::new(name, ns);
    for attr in start.attributes() {
        let attr = attr.map_err(|e| ComponentError::protocol(format!("bad attribute: {}", e)))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        if key == "xmlns" || key.starts_with("xmlns:") {
            continue;
        }
        let value = attr
            .unescape_value()
            .map_err(|e| ComponentError::protocol(format!("bad attribute value: {}", e)))?;
        element.attrs.push((key, value.into_owned()));
    }
    Ok(element)
}
