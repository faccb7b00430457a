//! Debugging aids computed from the mirror: selector hints, XPaths, text
//!
//! None of these are a selector engine. Matching is always delegated to the
//! remote side; the hint is only a readable, usually-unique handle.

use crate::error::Result;
use crate::registry::NodeRegistry;
use crate::types::StableId;

/// Attributes tried, in order, for a `tag[attr="value"]` hint
const PREDICATE_ATTRIBUTES: &[&str] = &[
    "name",
    "type",
    "href",
    "src",
    "role",
    "aria-label",
    "placeholder",
    "title",
];

/// Best-effort unique selector for an element
///
/// Prefers `#id`, then `tag.class` for a class no other node in this mirror
/// uses, then `tag:nth-of-type(n)` among same-tag siblings, then
/// `tag[attr="value"]`, then the bare tag. Not guaranteed unique.
pub fn compute_selector_hint(registry: &NodeRegistry, id: StableId) -> Option<String> {
    let node = registry.by_stable_id(id)?;
    let tag = node.tag_name()?;

    if let Some(element_id) = node.attr("id").filter(|v| !v.is_empty()) {
        return Some(if is_css_identifier(element_id) {
            format!("#{}", element_id)
        } else {
            format!("[id=\"{}\"]", escape_quotes(element_id))
        });
    }

    if let Some(class) = node.attr("class").and_then(|classes| {
        classes
            .split_whitespace()
            .find(|c| is_css_identifier(c) && registry.class_usage(c) == 1)
    }) {
        return Some(format!("{}.{}", tag, class));
    }

    if let Some(parent) = registry.parent(id) {
        let same_tag: Vec<StableId> = parent
            .children
            .iter()
            .copied()
            .filter(|&c| registry.by_stable_id(c).and_then(|n| n.tag_name()) == Some(tag))
            .collect();
        if same_tag.len() > 1 {
            if let Some(pos) = same_tag.iter().position(|&c| c == id) {
                return Some(format!("{}:nth-of-type({})", tag, pos + 1));
            }
        }
    }

    for attr in PREDICATE_ATTRIBUTES {
        if let Some(value) = node.attr(attr).filter(|v| !v.is_empty()) {
            return Some(format!("{}[{}=\"{}\"]", tag, attr, escape_quotes(value)));
        }
    }

    Some(tag.to_string())
}

fn is_css_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '-' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn escape_quotes(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Absolute XPath of an element, 1-based positions among same-name siblings
///
/// Stops at the nearest document, so a node inside a frame gets a path
/// relative to its own document.
pub fn xpath(registry: &NodeRegistry, id: StableId) -> Option<String> {
    let mut parts = Vec::new();
    let mut current = registry.by_stable_id(id);

    while let Some(node) = current {
        let Some(tag) = node.tag_name() else {
            break;
        };
        let position = registry
            .parent(node.stable_id)
            .and_then(|parent| {
                parent
                    .children
                    .iter()
                    .filter(|&&c| registry.by_stable_id(c).and_then(|n| n.tag_name()) == Some(tag))
                    .position(|&c| c == node.stable_id)
            })
            .map(|p| p + 1) // XPath is 1-indexed
            .unwrap_or(1);
        parts.push(format!("{}[{}]", tag, position));
        current = registry.parent(node.stable_id);
    }

    if parts.is_empty() {
        return None;
    }
    parts.reverse();
    Some(format!("/{}", parts.join("/")))
}

/// Concatenated text of all descendant text nodes, trimmed
pub fn text_content(registry: &NodeRegistry, id: StableId) -> Result<String> {
    let mut text = String::new();

    registry.traverse_df(id, |node| {
        if node.is_text() {
            if let Some(value) = node.text_value() {
                text.push_str(value);
            }
        }
        Ok(())
    })?;

    Ok(text.trim().to_string())
}
