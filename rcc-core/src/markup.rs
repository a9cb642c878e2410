//! Markup payload inspection and stamping.
//!
//! Commands and replies are usually small XML documents whose root
//! element carries the correlation `Cookie` and the request `Culture`.
//! Anything that does not start with `<` (plain text, `[...]`, `{...}`)
//! is opaque and passes through untouched.

use quick_xml::events::{BytesStart, Event};
use quick_xml::{Reader, Writer};

use crate::error::RccError;

/// Root attribute carrying the correlation cookie.
pub const COOKIE_ATTR: &str = "Cookie";

/// Root attribute carrying the request culture.
pub const CULTURE_ATTR: &str = "Culture";

/// What the router needs to know about a markup document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkupInfo {
    /// Local name of the root element.
    pub root: String,
    /// Value of the root's `Cookie` attribute, if any.
    pub cookie: Option<String>,
}

/// Returns `true` when `text` should be treated as tagged markup.
pub fn looks_like_markup(text: &str) -> bool {
    text.trim_start().starts_with('<')
}

/// Parse the whole document and describe its root element.
///
/// Fails on mismatched or unclosed tags, multiple roots, and stray text
/// outside the root.
pub fn inspect(text: &str) -> Result<MarkupInfo, RccError> {
    let mut reader = Reader::from_str(text);
    let mut depth = 0usize;
    let mut info: Option<MarkupInfo> = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                if depth == 0 {
                    if info.is_some() {
                        return Err(RccError::Markup("multiple root elements".into()));
                    }
                    info = Some(describe(&e)?);
                }
                depth += 1;
            }
            Event::Empty(e) => {
                if depth == 0 {
                    if info.is_some() {
                        return Err(RccError::Markup("multiple root elements".into()));
                    }
                    info = Some(describe(&e)?);
                }
            }
            Event::End(_) => depth = depth.saturating_sub(1),
            Event::Text(t) if depth == 0 && !t.iter().all(u8::is_ascii_whitespace) => {
                return Err(RccError::Markup("text outside the root element".into()));
            }
            Event::CData(_) if depth == 0 => {
                return Err(RccError::Markup("CDATA outside the root element".into()));
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if depth != 0 {
        return Err(RccError::Markup("unclosed element".into()));
    }
    info.ok_or_else(|| RccError::Markup("no root element".into()))
}

/// Set `Cookie` and `Culture` on the root element.
///
/// Existing values are replaced in place; everything else in the document
/// is written back unchanged.
pub fn stamp(text: &str, cookie: &str, culture: &str) -> Result<String, RccError> {
    let mut reader = Reader::from_str(text);
    let mut writer = Writer::new(Vec::with_capacity(text.len() + 64));
    let mut stamped = false;

    loop {
        let event = match reader.read_event()? {
            Event::Eof => break,
            Event::Start(e) if !stamped => {
                stamped = true;
                Event::Start(with_attrs(&e, cookie, culture)?)
            }
            Event::Empty(e) if !stamped => {
                stamped = true;
                Event::Empty(with_attrs(&e, cookie, culture)?)
            }
            other => other,
        };
        writer
            .write_event(event)
            .map_err(|e| RccError::Markup(e.to_string()))?;
    }

    if !stamped {
        return Err(RccError::Markup("no root element".into()));
    }
    String::from_utf8(writer.into_inner()).map_err(|e| RccError::Markup(e.to_string()))
}

fn describe(e: &BytesStart<'_>) -> Result<MarkupInfo, RccError> {
    let root = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
    let mut cookie = None;
    for attr in e.attributes() {
        let attr = attr?;
        if attr.key.as_ref() == COOKIE_ATTR.as_bytes() {
            cookie = Some(attr.unescape_value()?.into_owned());
        }
    }
    Ok(MarkupInfo { root, cookie })
}

fn with_attrs(
    e: &BytesStart<'_>,
    cookie: &str,
    culture: &str,
) -> Result<BytesStart<'static>, RccError> {
    let name = std::str::from_utf8(e.name().as_ref())
        .map_err(|err| RccError::Markup(err.to_string()))?
        .to_owned();

    let mut attrs: Vec<(String, String)> = Vec::new();
    let (mut has_cookie, mut has_culture) = (false, false);
    for attr in e.attributes() {
        let attr = attr?;
        let key = std::str::from_utf8(attr.key.as_ref())
            .map_err(|err| RccError::Markup(err.to_string()))?
            .to_owned();
        let value = if key == COOKIE_ATTR {
            has_cookie = true;
            cookie.to_owned()
        } else if key == CULTURE_ATTR {
            has_culture = true;
            culture.to_owned()
        } else {
            attr.unescape_value()?.into_owned()
        };
        attrs.push((key, value));
    }
    if !has_cookie {
        attrs.push((COOKIE_ATTR.to_owned(), cookie.to_owned()));
    }
    if !has_culture {
        attrs.push((CULTURE_ATTR.to_owned(), culture.to_owned()));
    }

    let mut elem = BytesStart::new(name);
    for (key, value) in &attrs {
        elem.push_attribute((key.as_str(), value.as_str()));
    }
    Ok(elem)
}

// ── Tests ────────────────────────────────────────────────────────
