//! OPML subscription lists.
//!
//! Folders map to top-level group outlines; a source outline inside a group is
//! filed under that group. Riffle folders are one level deep, so sources in
//! nested groups are filed under their outermost group.

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use thiserror::Error;

use crate::storage::{FeedStore, ImportSummary, Source, StoreError};
use crate::util::{strip_control_chars, validate_source_url};

/// Maximum nesting depth of `<outline>` elements.
const MAX_OPML_DEPTH: usize = 50;

/// Maximum accepted document size (10 MB).
pub const MAX_OPML_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum OpmlError {
    #[error("OPML nesting depth exceeds maximum of {0} levels")]
    MaxDepthExceeded(usize),

    #[error("OPML document is {size} bytes, maximum is {max}")]
    TooLarge { size: usize, max: usize },

    #[error("XML error: {0}")]
    Xml(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A subscription read from an OPML document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpmlSource {
    /// `title`, falling back to `text`, then to the feed url
    pub title: String,
    pub xml_url: String,
    pub html_url: Option<String>,
    pub folder: Option<String>,
}

/// Folders and subscriptions of one OPML document, in document order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpmlDocument {
    pub folders: Vec<String>,
    pub sources: Vec<OpmlSource>,
}

/// One open `<outline>`: a named group, or anything else.
enum Open {
    Group(String),
    Other,
}

/// Parse an OPML document.
///
/// Outlines whose `xmlUrl` is not an absolute http(s) url are skipped with a
/// warning. quick-xml does not read `<!ENTITY>` declarations and attribute
/// values are unescaped with the five XML builtins only, so a custom entity
/// reference is a parse error rather than an expansion.
pub fn parse_opml(content: &str) -> Result<OpmlDocument, OpmlError> {
    if content.len() > MAX_OPML_BYTES {
        return Err(OpmlError::TooLarge {
            size: content.len(),
            max: MAX_OPML_BYTES,
        });
    }

    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut document = OpmlDocument::default();
    let mut open: Vec<Open> = Vec::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.name().as_ref() == b"outline" => {
                if open.len() >= MAX_OPML_DEPTH {
                    return Err(OpmlError::MaxDepthExceeded(MAX_OPML_DEPTH));
                }
                let outline = read_outline(&e, &reader)?;
                let entry = visit(&mut document, &open, outline);
                open.push(entry);
            }
            Ok(Event::Empty(e)) if e.name().as_ref() == b"outline" => {
                let outline = read_outline(&e, &reader)?;
                visit(&mut document, &open, outline);
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"outline" => {
                open.pop();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(xml_error(e)),
            _ => {}
        }
        buf.clear();
    }

    tracing::debug!(
        folders = document.folders.len(),
        sources = document.sources.len(),
        "Parsed OPML"
    );
    Ok(document)
}

#[derive(Default)]
struct Outline {
    title: Option<String>,
    text: Option<String>,
    xml_url: Option<String>,
    html_url: Option<String>,
}

fn read_outline(e: &BytesStart<'_>, reader: &Reader<&[u8]>) -> Result<Outline, OpmlError> {
    let mut outline = Outline::default();
    for attr in e.attributes() {
        let attr = match attr {
            Ok(attr) => attr,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed OPML attribute");
                continue;
            }
        };
        let slot = match attr.key.as_ref() {
            b"title" => &mut outline.title,
            b"text" => &mut outline.text,
            b"xmlUrl" => &mut outline.xml_url,
            b"htmlUrl" => &mut outline.html_url,
            _ => continue,
        };
        let value = attr
            .decode_and_unescape_value(reader.decoder())
            .map_err(xml_error)?;
        *slot = Some(value.into_owned());
    }
    Ok(outline)
}

/// Record `outline` under the groups in `open`, returning how it nests.
fn visit(document: &mut OpmlDocument, open: &[Open], outline: Outline) -> Open {
    let label = outline
        .title
        .or(outline.text)
        .map(|s| strip_control_chars(&s).trim().to_owned())
        .filter(|s| !s.is_empty());

    let Some(xml_url) = outline.xml_url else {
        return match label {
            Some(name) => {
                if open.is_empty() && !document.folders.contains(&name) {
                    document.folders.push(name.clone());
                }
                Open::Group(name)
            }
            None => Open::Other,
        };
    };

    if let Err(e) = validate_source_url(&xml_url) {
        tracing::warn!(url = %xml_url, error = %e, "Skipping invalid feed URL in OPML");
        return Open::Other;
    }
    let html_url = outline.html_url.filter(|url| match validate_source_url(url) {
        Ok(_) => true,
        Err(e) => {
            tracing::warn!(url = %url, error = %e, "Ignoring invalid htmlUrl in OPML");
            false
        }
    });
    let folder = open.iter().find_map(|entry| match entry {
        Open::Group(name) => Some(name.clone()),
        Open::Other => None,
    });

    document.sources.push(OpmlSource {
        title: label.unwrap_or_else(|| xml_url.clone()),
        xml_url,
        html_url,
        folder,
    });
    Open::Other
}

/// Render sources as an OPML 2.0 document: one group outline per folder,
/// followed by the unfiled sources.
pub fn render_opml(sources: &[Source]) -> Result<String, OpmlError> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(xml_error)?;
    let mut opml = BytesStart::new("opml");
    opml.push_attribute(("version", "2.0"));
    writer.write_event(Event::Start(opml)).map_err(xml_error)?;

    writer.write_event(Event::Start(BytesStart::new("head"))).map_err(xml_error)?;
    writer.write_event(Event::Start(BytesStart::new("title"))).map_err(xml_error)?;
    writer
        .write_event(Event::Text(BytesText::new("Riffle Subscriptions")))
        .map_err(xml_error)?;
    writer.write_event(Event::End(BytesEnd::new("title"))).map_err(xml_error)?;
    writer.write_event(Event::End(BytesEnd::new("head"))).map_err(xml_error)?;

    writer.write_event(Event::Start(BytesStart::new("body"))).map_err(xml_error)?;

    let mut folders: Vec<&str> = sources
        .iter()
        .filter_map(|s| s.folder_name.as_deref())
        .collect();
    folders.sort_unstable();
    folders.dedup();

    for folder in folders {
        let mut group = BytesStart::new("outline");
        group.push_attribute(("text", folder));
        group.push_attribute(("title", folder));
        writer.write_event(Event::Start(group)).map_err(xml_error)?;
        for source in sources
            .iter()
            .filter(|s| s.folder_name.as_deref() == Some(folder))
        {
            writer.write_event(Event::Empty(source_outline(source))).map_err(xml_error)?;
        }
        writer.write_event(Event::End(BytesEnd::new("outline"))).map_err(xml_error)?;
    }
    for source in sources.iter().filter(|s| s.folder_name.is_none()) {
        writer.write_event(Event::Empty(source_outline(source))).map_err(xml_error)?;
    }

    writer.write_event(Event::End(BytesEnd::new("body"))).map_err(xml_error)?;
    writer.write_event(Event::End(BytesEnd::new("opml"))).map_err(xml_error)?;

    String::from_utf8(writer.into_inner()).map_err(xml_error)
}

fn xml_error(e: impl std::fmt::Display) -> OpmlError {
    OpmlError::Xml(e.to_string())
}

fn source_outline(source: &Source) -> BytesStart<'_> {
    let mut outline = BytesStart::new("outline");
    outline.push_attribute(("type", "rss"));
    outline.push_attribute(("text", source.title.as_str()));
    outline.push_attribute(("title", source.title.as_str()));
    outline.push_attribute(("xmlUrl", source.url.as_str()));
    outline
}

/// Parse `content` and merge its folders and sources into `store` in one
/// transaction. Sources already stored keep their title and icon.
pub async fn import_opml(store: &FeedStore, content: &str) -> Result<ImportSummary, OpmlError> {
    let document = parse_opml(content)?;
    let sources: Vec<Source> = document
        .sources
        .into_iter()
        .map(|entry| Source {
            url: entry.xml_url,
            title: entry.title,
            icon_url: None,
            folder_name: entry.folder,
        })
        .collect();
    Ok(store.import_sources(&document.folders, &sources).await?)
}

/// Render every stored source as OPML.
pub async fn export_opml(store: &FeedStore) -> Result<String, OpmlError> {
    let sources = store.all_sources().await?;
    let rendered = render_opml(&sources)?;
    tracing::info!(sources = sources.len(), "Exported OPML");
    Ok(rendered)
}
