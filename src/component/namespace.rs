//! Inbound namespace normalization.
//!
//! The hosting server addresses stanzas in the generic client namespace.
//! Before any handler sees a stanza, every element in `jabber:client` is
//! moved to the component's namespace so handlers only ever match one
//! namespace. Extension payloads keep their own namespaces.

use super::element::{Element, Node, NS_CLIENT};

/// Return a copy of `stanza` with every `jabber:client` element, at any
/// depth, moved to `component_ns`.
pub fn normalize(stanza: &Element, component_ns: &str) -> Element {
    let mut out = stanza.clone();
    normalize_in_place(&mut out, component_ns);
    out
}

/// In-place variant for trees the caller owns exclusively.
pub fn normalize_in_place(stanza: &mut Element, component_ns: &str) {
    if stanza.ns() == NS_CLIENT {
        stanza.set_ns(component_ns);
    }
    for node in stanza.nodes_mut() {
        if let Node::Element(child) = node {
            normalize_in_place(child, component_ns);
        }
    }
}
