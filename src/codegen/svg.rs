//! SVG costume normalization.
//!
//! Scratch renders stage-sized vector costumes best when their geometry
//! lives in a known coordinate box, so by default every SVG costume is
//! rescaled to a 64×64 viewBox: the root's children are wrapped in a
//! `<g transform="translate(-minX -minY) scale(64/w 64/h)">` group and the
//! root's `viewBox`/`width`/`height` are overwritten.
//!
//! The transform is pure event rewriting (quick-xml): the prolog, all
//! children, and any trailing comments pass through byte-for-byte; only the
//! root start tag is rebuilt.  When the computed transform is the identity
//! the wrapper group is omitted, which makes normalization idempotent.

use crate::error::CodegenError;
use once_cell::sync::Lazy;
use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesEnd, BytesStart, Event};
use regex::Regex;

const TARGET_SIZE: f64 = 64.0;

/// Leading numeric part of an SVG length (`"480px"` → 480).
static SVG_LENGTH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*([+-]?(?:\d+(?:\.\d*)?|\.\d+))").expect("length pattern is a valid regex")
});

/// Parse, optionally rescale, and re-serialize an SVG costume.
///
/// Returns the final bytes plus the rotation center: `(32, 32)` when the
/// costume was normalized, `(w/2, h/2)` otherwise.
pub fn prepare_svg(
    data: &[u8],
    source_name: &str,
    scale: bool,
) -> Result<(Vec<u8>, f64, f64), CodegenError> {
    let events = parse_events(data, source_name)?;
    let root_index = events
        .iter()
        .position(|e| matches!(e, Event::Start(_) | Event::Empty(_)))
        .ok_or_else(|| {
            CodegenError(format!("Invalid SVG file '{source_name}': no root element."))
        })?;

    let (root_name, attrs) = match &events[root_index] {
        Event::Start(e) | Event::Empty(e) => read_tag(e, source_name)?,
        _ => unreachable!("root_index points at Start or Empty"),
    };

    let (min_x, min_y, width, height) = read_bounds(&attrs, source_name)?;

    let mut writer = Writer::new(Vec::new());
    let write = |writer: &mut Writer<Vec<u8>>, event: Event<'_>| {
        writer.write_event(event).map_err(|e| {
            CodegenError(format!("Failed to serialize SVG '{source_name}': {e}."))
        })
    };

    // Prolog (XML declaration, comments, whitespace) passes through.
    for event in &events[..root_index] {
        write(&mut writer, event.clone())?;
    }

    if !scale {
        for event in &events[root_index..] {
            write(&mut writer, event.clone())?;
        }
        return Ok((writer.into_inner(), width / 2.0, height / 2.0));
    }

    // Root start tag rebuilt: original attributes in order, with the three
    // geometry attributes replaced at the tail.
    let mut root = BytesStart::new(root_name.clone());
    for (key, value) in &attrs {
        if matches!(key.as_str(), "viewBox" | "width" | "height") {
            continue;
        }
        root.push_attribute((key.as_str(), value.as_str()));
    }
    let size = fmt(TARGET_SIZE);
    root.push_attribute(("viewBox", format!("0 0 {size} {size}").as_str()));
    root.push_attribute(("width", size.as_str()));
    root.push_attribute(("height", size.as_str()));

    let wrapper = wrapper_transform(min_x, min_y, width, height);
    let centered = TARGET_SIZE / 2.0;

    if let Event::Empty(_) = &events[root_index] {
        // A childless root: nothing to wrap.
        write(&mut writer, Event::Empty(root))?;
        for event in &events[root_index + 1..] {
            write(&mut writer, event.clone())?;
        }
        return Ok((writer.into_inner(), centered, centered));
    }

    write(&mut writer, Event::Start(root))?;

    // Everything between the root start and its matching end.
    let close_index = find_root_close(&events, root_index);
    let group_name = group_tag(&root_name);
    if let Some(transform) = &wrapper {
        let mut group = BytesStart::new(group_name.clone());
        group.push_attribute(("transform", transform.as_str()));
        write(&mut writer, Event::Start(group))?;
    }
    for event in &events[root_index + 1..close_index] {
        write(&mut writer, event.clone())?;
    }
    if wrapper.is_some() {
        write(&mut writer, Event::End(BytesEnd::new(group_name)))?;
    }
    write(&mut writer, Event::End(BytesEnd::new(root_name)))?;
    for event in events.iter().skip(close_index + 1) {
        write(&mut writer, event.clone())?;
    }

    Ok((writer.into_inner(), centered, centered))
}

// ── Event plumbing ────────────────────────────────────────────────────────────

fn parse_events(data: &[u8], source_name: &str) -> Result<Vec<Event<'static>>, CodegenError> {
    let mut reader = Reader::from_reader(data);
    let mut buf = Vec::new();
    let mut events = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Eof) => break,
            Ok(event) => events.push(event.into_owned()),
            Err(e) => {
                return Err(CodegenError(format!("Invalid SVG file '{source_name}': {e}.")));
            }
        }
        buf.clear();
    }
    Ok(events)
}

fn read_tag(
    start: &BytesStart<'_>,
    source_name: &str,
) -> Result<(String, Vec<(String, String)>), CodegenError> {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut attrs = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| {
            CodegenError(format!("Invalid SVG file '{source_name}': {e}."))
        })?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| CodegenError(format!("Invalid SVG file '{source_name}': {e}.")))?
            .into_owned();
        attrs.push((key, value));
    }
    Ok((name, attrs))
}

/// Index of the `End` event that closes the root element.
fn find_root_close(events: &[Event<'_>], root_index: usize) -> usize {
    let mut depth = 1i32;
    for (offset, event) in events[root_index + 1..].iter().enumerate() {
        match event {
            Event::Start(_) => depth += 1,
            Event::End(_) => {
                depth -= 1;
                if depth == 0 {
                    return root_index + 1 + offset;
                }
            }
            _ => {}
        }
    }
    // Unclosed root: treat the document end as the close.
    events.len()
}

/// Namespace-aware name for the wrapper group: inherit the root's prefix so
/// the element stays in the SVG namespace.
fn group_tag(root_name: &str) -> String {
    match root_name.rfind(':') {
        Some(idx) => format!("{}:g", &root_name[..idx]),
        None => "g".to_string(),
    }
}

// ── Geometry ──────────────────────────────────────────────────────────────────

fn read_bounds(
    attrs: &[(String, String)],
    source_name: &str,
) -> Result<(f64, f64, f64, f64), CodegenError> {
    if let Some((_, view_box)) = attrs.iter().find(|(k, _)| k == "viewBox") {
        if let Some(parsed) = parse_view_box(view_box, source_name)? {
            return Ok(parsed);
        }
    }
    let width = attrs
        .iter()
        .find(|(k, _)| k == "width")
        .and_then(|(_, v)| parse_svg_length(v));
    let height = attrs
        .iter()
        .find(|(k, _)| k == "height")
        .and_then(|(_, v)| parse_svg_length(v));
    if let (Some(w), Some(h)) = (width, height) {
        return Ok((0.0, 0.0, w, h));
    }
    Ok((0.0, 0.0, TARGET_SIZE, TARGET_SIZE))
}

fn parse_view_box(
    view_box: &str,
    source_name: &str,
) -> Result<Option<(f64, f64, f64, f64)>, CodegenError> {
    let parts: Vec<&str> = view_box
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|p| !p.is_empty())
        .collect();
    if parts.len() != 4 {
        return Ok(None);
    }
    let mut values = [0.0f64; 4];
    for (slot, part) in values.iter_mut().zip(&parts) {
        *slot = part.parse().map_err(|_| {
            CodegenError(format!("Invalid SVG viewBox in '{source_name}': '{view_box}'."))
        })?;
    }
    let [min_x, min_y, width, height] = values;
    if width <= 0.0 || height <= 0.0 {
        return Err(CodegenError(format!(
            "SVG viewBox must have positive width/height in '{source_name}'."
        )));
    }
    Ok(Some((min_x, min_y, width, height)))
}

fn parse_svg_length(value: &str) -> Option<f64> {
    let number: f64 = SVG_LENGTH.captures(value)?.get(1)?.as_str().parse().ok()?;
    if number > 0.0 { Some(number) } else { None }
}

/// The `translate(…) scale(…)` transform, or `None` when it is the identity.
fn wrapper_transform(min_x: f64, min_y: f64, width: f64, height: f64) -> Option<String> {
    let scale_x = TARGET_SIZE / width;
    let scale_y = TARGET_SIZE / height;
    if min_x == 0.0 && min_y == 0.0 && scale_x == 1.0 && scale_y == 1.0 {
        return None;
    }
    Some(format!(
        "translate({} {}) scale({} {})",
        fmt(-min_x),
        fmt(-min_y),
        fmt(scale_x),
        fmt(scale_y)
    ))
}

/// Compact float formatting: no decimal point for integral values, at most
/// six fractional digits otherwise.
fn fmt(value: f64) -> String {
    if value == value.trunc() && value.is_finite() {
        format!("{}", value as i64)
    } else {
        let mut s = format!("{value:.6}");
        while s.ends_with('0') {
            s.pop();
        }
        if s.ends_with('.') {
            s.pop();
        }
        s
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const SQUARE: &[u8] =
        b"<svg xmlns=\"http://www.w3.org/2000/svg\" viewBox=\"0 0 100 100\"><rect width=\"100\" height=\"100\"/></svg>";

    fn normalize(data: &[u8]) -> (Vec<u8>, f64, f64) {
        prepare_svg(data, "test.svg", true).unwrap()
    }

    #[test]
    fn test_normalized_root_is_64x64() {
        let (out, cx, cy) = normalize(SQUARE);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("viewBox=\"0 0 64 64\""));
        assert!(text.contains("width=\"64\""));
        assert!(text.contains("height=\"64\""));
        assert_eq!((cx, cy), (32.0, 32.0));
    }

    #[test]
    fn test_children_wrapped_with_scale_transform() {
        let (out, _, _) = normalize(SQUARE);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("<g transform=\"translate(0 0) scale(0.64 0.64)\">"));
        assert!(text.contains("</g>"));
    }

    #[test]
    fn test_offset_view_box_translated() {
        let svg = b"<svg viewBox=\"10 20 50 50\"><circle r=\"5\"/></svg>";
        let (out, _, _) = normalize(svg);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("translate(-10 -20) scale(1.28 1.28)"));
    }

    #[test]
    fn test_identity_transform_omits_wrapper() {
        let svg = b"<svg viewBox=\"0 0 64 64\"><circle r=\"5\"/></svg>";
        let (out, _, _) = normalize(svg);
        let text = String::from_utf8(out).unwrap();
        assert!(!text.contains("<g "), "identity transform must not wrap: {text}");
    }

    #[test]
    fn test_normalization_is_idempotent() {
        let (once, _, _) = normalize(SQUARE);
        let (twice, _, _) = normalize(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_width_height_fallback() {
        let svg = b"<svg width=\"480px\" height=\"360px\"><rect/></svg>";
        let (out, _, _) = normalize(svg);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("scale(0.133333 0.177778)"));
    }

    #[test]
    fn test_missing_dimensions_default_to_64() {
        let svg = b"<svg><rect/></svg>";
        let (out, cx, cy) = normalize(svg);
        let text = String::from_utf8(out).unwrap();
        assert!(!text.contains("<g "), "64x64 default is already normalized");
        assert_eq!((cx, cy), (32.0, 32.0));
        assert!(text.contains("viewBox=\"0 0 64 64\""));
    }

    #[test]
    fn test_no_scale_keeps_geometry_and_centers() {
        let svg = b"<svg viewBox=\"0 0 100 50\"><rect/></svg>";
        let (out, cx, cy) = prepare_svg(svg, "test.svg", false).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("viewBox=\"0 0 100 50\""));
        assert_eq!((cx, cy), (50.0, 25.0));
    }

    #[test]
    fn test_invalid_xml_rejected() {
        let err = prepare_svg(b"<svg><unclosed", "bad.svg", true).unwrap_err();
        assert!(err.to_string().contains("Invalid SVG file 'bad.svg'"));
    }

    #[test]
    fn test_invalid_view_box_rejected() {
        let err = prepare_svg(b"<svg viewBox=\"0 0 abc 10\"><g/></svg>", "bad.svg", true)
            .unwrap_err();
        assert!(err.to_string().contains("Invalid SVG viewBox"));
    }

    #[test]
    fn test_non_positive_view_box_rejected() {
        let err =
            prepare_svg(b"<svg viewBox=\"0 0 0 10\"><g/></svg>", "bad.svg", true).unwrap_err();
        assert!(err.to_string().contains("positive width/height"));
    }

    #[test]
    fn test_prefixed_namespace_group() {
        let svg = b"<s:svg xmlns:s=\"http://www.w3.org/2000/svg\" viewBox=\"0 0 100 100\"><s:rect/></s:svg>";
        let (out, _, _) = normalize(svg);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("<s:g transform="));
        assert!(text.contains("</s:g>"));
    }

    #[test]
    fn test_xml_declaration_preserved() {
        let svg = b"<?xml version=\"1.0\"?><svg viewBox=\"0 0 100 100\"><rect/></svg>";
        let (out, _, _) = normalize(svg);
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("<?xml version=\"1.0\"?>"));
    }

    #[test]
    fn test_childless_root_rewritten_without_wrapper() {
        let svg = b"<svg viewBox=\"0 0 100 100\"/>";
        let (out, _, _) = normalize(svg);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("viewBox=\"0 0 64 64\""));
        assert!(!text.contains("<g"));
    }
}
