//! Merging channel fragments into one document.
//!
//! Fragments are parsed structurally; the merged output reuses the exact
//! source spans of the extracted nodes so entities, comments and CDATA
//! survive untouched.

use crate::types::FragmentFile;
use roxmltree::{Document, Node, ParsingOptions};
use tracing::warn;

pub const WRAPPER_TAG: &str = "channels";
pub const ITEM_TAG: &str = "channel";

const XML_DECL: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;

fn is_tag(node: &Node, tag: &str) -> bool {
    node.is_element() && node.tag_name().name().eq_ignore_ascii_case(tag)
}

/// Source text between the start and end tag of `node`.
fn inner_span<'a>(xml: &'a str, node: Node) -> &'a str {
    match (node.first_child(), node.last_child()) {
        (Some(first), Some(last)) => &xml[first.range().start..last.range().end],
        _ => "",
    }
}

/// Synthetic root for fragments holding several top-level elements.
const FRAGMENT_ROOT: &str = "__fragment";

fn parsing_options() -> ParsingOptions {
    ParsingOptions {
        allow_dtd: true,
        ..ParsingOptions::default()
    }
}

fn extract_from(doc: &Document, xml: &str) -> Option<String> {
    if let Some(wrapper) = doc.descendants().find(|n| is_tag(n, WRAPPER_TAG)) {
        return Some(inner_span(xml, wrapper).trim().to_string());
    }

    let items: Vec<&str> = doc
        .descendants()
        .filter(|n| is_tag(n, ITEM_TAG))
        .filter(|n| !n.ancestors().skip(1).any(|a| is_tag(&a, ITEM_TAG)))
        .map(|n| xml[n.range()].trim())
        .collect();

    if items.is_empty() {
        return None;
    }
    Some(items.join("\n"))
}

/// Prolog length: BOM, XML declaration and DOCTYPE, with the whitespace
/// around them. `None` when the prolog itself is cut short.
fn prolog_len(xml: &str) -> Option<usize> {
    let mut rest = xml.strip_prefix('\u{feff}').unwrap_or(xml).trim_start();

    if rest.starts_with("<?xml") {
        let end = rest.find("?>")?;
        rest = rest[end + 2..].trim_start();
    }

    if rest.starts_with("<!DOCTYPE") {
        let gt = rest.find('>')?;
        let end = match rest.find('[') {
            Some(open) if open < gt => {
                let close = open + rest[open..].find(']')?;
                close + rest[close..].find('>')?
            }
            _ => gt,
        };
        rest = rest[end + 1..].trim_start();
    }

    Some(xml.len() - rest.len())
}

/// The fragment body under one synthetic root element. Element spans are
/// the same bytes as in the original text.
fn wrap_fragment(xml: &str) -> Option<String> {
    let body = &xml[prolog_len(xml)?..];
    Some(format!("<{FRAGMENT_ROOT}>{body}</{FRAGMENT_ROOT}>"))
}

/// Body of one fragment.
///
/// The children of the first `<channels>` element, or failing that every
/// outermost `<channel>` element joined by newlines. `Ok(None)` when the
/// fragment has neither. A wrapper-less fragment may hold several
/// top-level `<channel>` elements; it is reparsed under a synthetic root.
pub fn extract_body(xml: &str) -> Result<Option<String>, roxmltree::Error> {
    let err = match Document::parse_with_options(xml, parsing_options()) {
        Ok(doc) => return Ok(extract_from(&doc, xml)),
        Err(e) => e,
    };

    let Some(wrapped) = wrap_fragment(xml) else {
        return Err(err);
    };
    match Document::parse_with_options(&wrapped, parsing_options()) {
        Ok(doc) => Ok(extract_from(&doc, &wrapped)),
        Err(_) => Err(err),
    }
}

/// Wrap the concatenated bodies in a single `<channels>` element.
pub fn render_document(bodies: &[String]) -> String {
    let mut out = String::new();
    out.push_str(XML_DECL);
    out.push('\n');
    out.push_str("<channels>\n");
    let joined = bodies
        .iter()
        .map(|b| b.trim())
        .filter(|b| !b.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    if !joined.is_empty() {
        out.push_str(&joined);
        out.push('\n');
    }
    out.push_str("</channels>\n");
    out
}

/// Read and extract every fragment, in the given order.
/// Unreadable or unrecognised fragments are logged and left out.
pub fn merge_fragments(files: &[FragmentFile]) -> String {
    let mut bodies = Vec::with_capacity(files.len());

    for f in files {
        let content = match std::fs::read_to_string(&f.path) {
            Ok(s) => s,
            Err(e) => {
                warn!(path = %f.path.display(), error = %e, "cannot read fragment, skipping");
                continue;
            }
        };

        match extract_body(&content) {
            Ok(Some(body)) => bodies.push(body),
            Ok(None) => {
                warn!(path = %f.path.display(), "no <channels> or <channel> elements in fragment, skipping");
            }
            Err(e) => {
                warn!(path = %f.path.display(), error = %e, "fragment is not well-formed XML, skipping");
            }
        }
    }

    render_document(&bodies)
}
