//! HTML handling for feed bodies: relative image rewriting, plain-text
//! extraction, first-image lookup and excerpting.

use std::borrow::Cow;

use scraper::{Html, Node, Selector};

use crate::util::{collapse_whitespace, site_origin, strip_control_chars, truncate_chars};

/// Rewrite scheme-relative (`//host/...`) and root-relative (`/path`) image
/// sources so they resolve against the feed's site.
///
/// Without a usable site URL the body is returned untouched.
pub fn fix_relative<'a>(body: &'a str, site_url: Option<&str>) -> Cow<'a, str> {
    let Some((scheme, origin)) = site_url.and_then(site_origin) else {
        return Cow::Borrowed(body);
    };
    if !body.contains("src=") {
        return Cow::Borrowed(body);
    }

    let mut fixed = body.to_owned();
    for quote in ['"', '\''] {
        // Scheme-relative first: after this they no longer start with a slash
        fixed = fixed.replace(
            &format!("src={quote}//"),
            &format!("src={quote}{scheme}://"),
        );
        fixed = fixed.replace(&format!("src={quote}/"), &format!("src={quote}{origin}/"));
    }
    Cow::Owned(fixed)
}

/// Visible text of an HTML fragment with whitespace collapsed.
///
/// Script and style contents are dropped, as are terminal control
/// sequences.
pub fn to_text(fragment: &str) -> String {
    if !fragment.contains(['<', '&']) {
        return collapse_whitespace(&strip_control_chars(fragment));
    }

    let document = Html::parse_fragment(fragment);
    let mut text = String::new();

    for node in document.root_element().descendants() {
        let Node::Text(chunk) = node.value() else {
            continue;
        };
        let hidden = node
            .ancestors()
            .filter_map(|ancestor| ancestor.value().as_element())
            .any(|element| matches!(element.name(), "script" | "style"));
        if !hidden {
            text.push_str(chunk);
        }
    }

    collapse_whitespace(&strip_control_chars(&text))
}

/// `src` of the first `<img>` in the fragment.
pub fn first_image(fragment: &str) -> Option<String> {
    if !fragment.contains("<img") && !fragment.contains("<IMG") {
        return None;
    }

    let selector = Selector::parse("img").ok()?;
    let document = Html::parse_fragment(fragment);
    document
        .select(&selector)
        .filter_map(|img| img.value().attr("src"))
        .map(str::trim)
        .find(|src| !src.is_empty())
        .map(str::to_owned)
}

/// Stored form of a post body: the first `max_chars` characters of its text,
/// with "..." when cut. Text of one character or less is treated as empty.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    if text.chars().nth(1).is_none() {
        return String::new();
    }
    truncate_chars(text, max_chars).into_owned()
}
