//! Markup simplification for the structural strategy.
//!
//! Reduces a raw document to the interactive and content-bearing tags an
//! oracle needs to author instructions, then bounds the result in size.

use lol_html::{doc_comments, element, rewrite_str, RewriteStrSettings};
use tracing::warn;

/// Upper bound on pruned markup handed to the oracle.
pub const DEFAULT_MAX_CHARS: usize = 100_000;

/// Dropped together with everything inside them.
const DROPPED_TAGS: [&str; 7] = ["script", "style", "meta", "link", "noscript", "iframe", "head"];

/// Everything else is unwrapped, keeping its content.
pub const ALLOWED_TAGS: [&str; 19] = [
    "a", "button", "input", "textarea", "select", "option", "label", "form", "table", "tr", "td",
    "th", "h1", "h2", "h3", "p", "li", "ul", "ol",
];

/// Allowed tags that carry nothing once they have no content and no attributes.
const DROP_WHEN_EMPTY: [&str; 15] = [
    "a", "label", "form", "table", "tr", "td", "th", "h1", "h2", "h3", "p", "li", "ul", "ol",
    "option",
];

pub trait MarkupPruner: Send + Sync {
    /// Returns a summary of `html` no longer than the pruner's limit.
    fn prune(&self, html: &str) -> String;
}

#[derive(Clone, Debug)]
pub struct HtmlPruner {
    pub max_chars: usize,
}

impl Default for HtmlPruner {
    fn default() -> Self {
        Self {
            max_chars: DEFAULT_MAX_CHARS,
        }
    }
}

impl MarkupPruner for HtmlPruner {
    fn prune(&self, html: &str) -> String {
        let stripped = strip_markup(html);
        let compacted = compact(&stripped);
        truncate_chars(compacted, self.max_chars)
    }
}

/// Remove non-visible nodes, unwrap non-allowed tags, drop presentation attributes.
pub fn strip_markup(html: &str) -> String {
    let rewritten = rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: vec![element!("*", |el| {
                let tag = el.tag_name().to_ascii_lowercase();
                if DROPPED_TAGS.contains(&tag.as_str()) || is_hidden(el) {
                    el.remove();
                    return Ok(());
                }
                if !ALLOWED_TAGS.contains(&tag.as_str()) {
                    el.remove_and_keep_content();
                    return Ok(());
                }
                let doomed: Vec<String> = el
                    .attributes()
                    .iter()
                    .map(|a| a.name())
                    .filter(|n| is_presentation_attr(n))
                    .collect();
                for name in doomed {
                    el.remove_attribute(&name);
                }
                Ok(())
            })],
            document_content_handlers: vec![doc_comments!(|c| {
                c.remove();
                Ok(())
            })],
            ..RewriteStrSettings::new()
        },
    );
    match rewritten {
        Ok(r) => r,
        Err(e) => {
            warn!("markup rewrite failed, pruning raw text: {}", e);
            html.to_string()
        }
    }
}

fn is_hidden(el: &lol_html::html_content::Element) -> bool {
    if el.has_attribute("hidden") {
        return true;
    }
    if let Some(v) = el.get_attribute("aria-hidden") {
        if v.trim().eq_ignore_ascii_case("true") {
            return true;
        }
    }
    if let Some(t) = el.get_attribute("type") {
        if el.tag_name().eq_ignore_ascii_case("input") && t.trim().eq_ignore_ascii_case("hidden") {
            return true;
        }
    }
    el.get_attribute("style").map_or(false, |s| style_hides(&s))
}

fn style_hides(style: &str) -> bool {
    let norm: String = style
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_lowercase();
    norm.split(';').any(|decl| {
        let decl = decl.trim_end_matches("!important");
        decl == "display:none"
            || decl == "visibility:hidden"
            || decl
                .strip_prefix("opacity:")
                .and_then(|v| v.parse::<f64>().ok())
                .map_or(false, |v| v == 0.0)
    })
}

fn is_presentation_attr(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    matches!(name.as_str(), "class" | "id" | "style")
        || name.starts_with("on")
        || name.starts_with("data-")
        || name.starts_with("aria-")
}

/// Collapse whitespace, drop empty allowed tags, put one tag per line.
pub fn compact(html: &str) -> String {
    let mut out = drop_doctype(html);
    out = collapse_whitespace(&out);
    loop {
        let before = out.len();
        for tag in DROP_WHEN_EMPTY {
            out = drop_empty(&out, tag);
        }
        if out.len() == before {
            break;
        }
    }
    break_lines(&out)
}

fn drop_doctype(html: &str) -> String {
    let lower = html.to_ascii_lowercase();
    match lower.find("<!doctype") {
        Some(start) => match html[start..].find('>') {
            Some(end) => format!("{}{}", &html[..start], &html[start + end + 1..]),
            None => html.to_string(),
        },
        None => html.to_string(),
    }
}

fn collapse_whitespace(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_ws = false;
    for c in s.chars() {
        if c.is_whitespace() {
            if !in_ws {
                out.push(' ');
            }
            in_ws = true;
        } else {
            out.push(c);
            in_ws = false;
        }
    }
    out
}

fn drop_empty(s: &str, tag: &str) -> String {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(at) = rest.find(&open) {
        let after_open = &rest[at + open.len()..];
        let trimmed = after_open.trim_start();
        if trimmed.starts_with(&close) {
            out.push_str(&rest[..at]);
            rest = &trimmed[close.len()..];
        } else {
            out.push_str(&rest[..at + open.len()]);
            rest = after_open;
        }
    }
    out.push_str(rest);
    out
}

fn break_lines(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + s.len() / 8);
    let mut last_closed_tag = false;
    for c in s.chars() {
        match c {
            '<' => {
                let kept = out.trim_end().len();
                out.truncate(kept);
                if last_closed_tag {
                    out.push('\n');
                }
                out.push(c);
                last_closed_tag = false;
            }
            '>' => {
                out.push(c);
                last_closed_tag = true;
            }
            ' ' if last_closed_tag => {}
            _ => {
                out.push(c);
                last_closed_tag = false;
            }
        }
    }
    out.trim().to_string()
}

/// Cut at a char boundary so the result is at most `max` characters.
pub fn truncate_chars(s: String, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((byte, _)) => s[..byte].to_string(),
        None => s,
    }
}
