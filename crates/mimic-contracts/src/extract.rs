use crate::chat::Content;

const FENCE_OPEN: &str = "```html";
const FENCE_CLOSE: &str = "\n```";

/// What to return when an assistant reply carries no ```html fence.
/// `RawText` hands the whole reply to the renderer (the historical
/// behavior); `Empty` yields an empty artifact instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FencedFallback {
    #[default]
    RawText,
    Empty,
}

/// Pulls the HTML artifact out of one assistant reply. Never fails:
/// part-list content and fence misses degrade to the fallback value.
pub fn extract_html(content: &Content, fallback: FencedFallback) -> String {
    let Content::Text(text) = content else {
        // Only textual replies are understood; a part-list reply has no
        // artifact regardless of the fallback policy.
        return String::new();
    };
    match fenced_block(text) {
        Some(inner) => inner.trim().to_string(),
        None => match fallback {
            FencedFallback::RawText => text.clone(),
            FencedFallback::Empty => String::new(),
        },
    }
}

/// Interior of the first ```html fence: the opener must be followed by a
/// newline, the closer is the next ``` at the start of a line.
fn fenced_block(text: &str) -> Option<&str> {
    let mut haystack = text;
    while let Some(start) = haystack.find(FENCE_OPEN) {
        let after_open = &haystack[start + FENCE_OPEN.len()..];
        if let Some(body) = after_open.strip_prefix('\n') {
            let end = body.find(FENCE_CLOSE)?;
            return Some(&body[..end]);
        }
        haystack = after_open;
    }
    None
}

#[cfg(test)]
mod tests {
    use crate::chat::ContentPart;

    use super::*;

    fn text(raw: &str) -> Content {
        Content::Text(raw.to_string())
    }

    #[test]
    fn well_formed_fence_yields_trimmed_interior() {
        let content = text("Sure thing.\n```html\n  <div>ok</div>\n```\nDone.");
        assert_eq!(
            extract_html(&content, FencedFallback::RawText),
            "<div>ok</div>"
        );
    }

    #[test]
    fn fence_can_open_and_close_mid_line() {
        let content = text("Sure! ```html\n<div>ok</div>\n``` done");
        assert_eq!(
            extract_html(&content, FencedFallback::RawText),
            "<div>ok</div>"
        );
    }

    #[test]
    fn missing_newline_after_opener_is_a_miss() {
        let content = text("```html<div/>\n```");
        assert_eq!(extract_html(&content, FencedFallback::Empty), "");
    }

    #[test]
    fn fence_miss_falls_back_to_raw_text() {
        let content = text("<div>bare reply</div>");
        assert_eq!(
            extract_html(&content, FencedFallback::RawText),
            "<div>bare reply</div>"
        );
    }

    #[test]
    fn fence_miss_falls_back_to_empty() {
        let content = text("<div>bare reply</div>");
        assert_eq!(extract_html(&content, FencedFallback::Empty), "");
    }

    #[test]
    fn part_list_content_yields_empty_under_both_policies() {
        let content = Content::Parts(vec![ContentPart::text("no artifact here")]);
        assert_eq!(extract_html(&content, FencedFallback::RawText), "");
        assert_eq!(extract_html(&content, FencedFallback::Empty), "");
    }

    #[test]
    fn only_the_first_fence_is_used() {
        let content = text("```html\n<p>one</p>\n```\n```html\n<p>two</p>\n```");
        assert_eq!(
            extract_html(&content, FencedFallback::RawText),
            "<p>one</p>"
        );
    }

    #[test]
    fn malformed_opener_does_not_mask_a_later_fence() {
        let content = text("```html inline``` then\n```html\n<main/>\n```");
        assert_eq!(extract_html(&content, FencedFallback::Empty), "<main/>");
    }

    #[test]
    fn extraction_is_idempotent() {
        let content = text("intro ```html\n<section/>\n``` outro");
        let first = extract_html(&content, FencedFallback::RawText);
        let second = extract_html(&content, FencedFallback::RawText);
        assert_eq!(first, second);
    }
}
