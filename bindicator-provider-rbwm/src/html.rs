//! Minimal tag slicing for the council's server-rendered forms.
//!
//! The pages are small and flat, so blocks are located by case-insensitive
//! substring search rather than a full DOM. Nested tags of the same name are
//! not supported.

/// Every `<tag ...>...</tag>` block in `html`, in document order.
pub(crate) fn tag_blocks<'a>(html: &'a str, tag: &str) -> Vec<&'a str> {
    let lower = html.to_ascii_lowercase();
    let open = format!("<{}", tag.to_ascii_lowercase());
    let close = format!("</{}>", tag.to_ascii_lowercase());

    let mut blocks = Vec::new();
    let mut from = 0;
    while let Some(start) = find_open_tag(&lower, &open, from) {
        let Some(end) = lower
            .get(start..)
            .and_then(|rest| rest.find(&close))
            .map(|rel| start + rel + close.len())
        else {
            break;
        };
        if let Some(block) = html.get(start..end) {
            blocks.push(block);
        }
        from = end;
    }
    blocks
}

/// Slice from the element whose `class` attribute mentions `class` up to the
/// end of the first table inside it, or to the end of the document.
pub(crate) fn class_region<'a>(html: &'a str, class: &str) -> Option<&'a str> {
    let lower = html.to_ascii_lowercase();
    let marker = lower.find(&class.to_ascii_lowercase())?;
    let start = lower.get(..marker)?.rfind('<')?;

    let end = lower
        .get(marker..)
        .and_then(|rest| rest.find("</table>"))
        .map_or(html.len(), |rel| marker + rel + "</table>".len());
    html.get(start..end)
}

/// Values of every `attr="..."` (or single-quoted) attribute in `block`.
pub(crate) fn attr_values(block: &str, attr: &str) -> Vec<String> {
    let lower = block.to_ascii_lowercase();
    let needle = format!("{}=", attr.to_ascii_lowercase());

    let mut values = Vec::new();
    let mut from = 0;
    while let Some(rel) = lower.get(from..).and_then(|rest| rest.find(&needle)) {
        let value_start = from + rel + needle.len();
        let Some(quote) = block.get(value_start..).and_then(|rest| rest.chars().next()) else {
            break;
        };
        if quote != '"' && quote != '\'' {
            from = value_start;
            continue;
        }
        let body_start = value_start + 1;
        let Some(len) = block.get(body_start..).and_then(|rest| rest.find(quote)) else {
            break;
        };
        if let Some(value) = block.get(body_start..body_start + len) {
            values.push(decode_entities(value));
        }
        from = body_start + len + 1;
    }
    values
}

/// Visible text of a fragment with tags removed, entities decoded, and
/// whitespace collapsed.
pub(crate) fn inner_text(fragment: &str) -> String {
    let mut out = String::with_capacity(fragment.len());
    let mut in_tag = false;
    for ch in fragment.chars() {
        match ch {
            '<' => {
                in_tag = true;
                out.push(' ');
            }
            '>' => in_tag = false,
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    collapse_whitespace(&decode_entities(&out))
}

fn find_open_tag(lower: &str, open: &str, from: usize) -> Option<usize> {
    let mut cursor = from;
    loop {
        let start = cursor + lower.get(cursor..)?.find(open)?;
        let next = lower.get(start + open.len()..)?.chars().next()?;
        if next == '>' || next.is_ascii_whitespace() || next == '/' {
            return Some(start);
        }
        // `<th` must not match `<thead`
        cursor = start + open.len();
    }
}

fn decode_entities(raw: &str) -> String {
    raw.replace("&nbsp;", " ")
        .replace("&#160;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn collapse_whitespace(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}
