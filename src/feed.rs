//! Origin listing parser (RSS 2.0 and Atom).
//!
//! Produces [`ListingEntry`] values in listing order. Entries whose link is
//! not an absolute http(s) URL are dropped, since the link is the item's
//! identity in the store.

use chrono::{DateTime, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::{PipelineError, PipelineResult};

/// One candidate item from an origin listing.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingEntry {
    pub title: String,
    pub link: String,
    pub published: Option<DateTime<Utc>>,
    /// Feed-embedded body (HTML), used when the page itself yields no text.
    pub content: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Title,
    Link,
    Guid,
    Published,
    Updated,
    Summary,
    Content,
    Other,
}

impl Field {
    fn from_local_name(name: &[u8]) -> Field {
        match name {
            b"title" => Field::Title,
            b"link" => Field::Link,
            b"guid" | b"id" => Field::Guid,
            b"pubDate" | b"published" | b"date" => Field::Published,
            b"updated" => Field::Updated,
            b"description" | b"summary" => Field::Summary,
            b"encoded" | b"content" => Field::Content,
            _ => Field::Other,
        }
    }
}

#[derive(Debug, Default)]
struct Draft {
    title: Option<String>,
    link: Option<String>,
    guid: Option<String>,
    published: Option<String>,
    updated: Option<String>,
    summary: Option<String>,
    content: Option<String>,
}

impl Draft {
    fn set(&mut self, field: Field, text: String) {
        let text = text.trim().to_string();
        if text.is_empty() {
            return;
        }
        let slot = match field {
            Field::Title => &mut self.title,
            Field::Link => &mut self.link,
            Field::Guid => &mut self.guid,
            Field::Published => &mut self.published,
            Field::Updated => &mut self.updated,
            Field::Summary => &mut self.summary,
            Field::Content => &mut self.content,
            Field::Other => return,
        };
        if slot.is_none() {
            *slot = Some(text);
        }
    }

    fn finish(self) -> Option<ListingEntry> {
        let link = self
            .link
            .or(self.guid)
            .map(|l| l.trim().to_string())
            .filter(|l| l.starts_with("http://") || l.starts_with("https://"))?;

        let title = self
            .title
            .map(|t| html_escape::decode_html_entities(&t).trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| link.clone());

        let published = self
            .published
            .as_deref()
            .and_then(parse_date)
            .or_else(|| self.updated.as_deref().and_then(parse_date));

        Some(ListingEntry {
            title,
            link,
            published,
            content: self.content.or(self.summary),
        })
    }
}

/// Parse an RFC 2822 (RSS) or RFC 3339 (Atom) timestamp.
pub fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    DateTime::parse_from_rfc2822(value)
        .or_else(|_| DateTime::parse_from_rfc3339(value))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

fn alternate_href(e: &BytesStart<'_>) -> Option<String> {
    let mut href = None;
    let mut rel_ok = true;
    for attr in e.attributes().flatten() {
        match attr.key.local_name().as_ref() {
            b"href" => href = attr.unescape_value().ok().map(|v| v.into_owned()),
            b"rel" => {
                rel_ok = attr
                    .unescape_value()
                    .map(|v| v == "alternate")
                    .unwrap_or(false)
            }
            _ => {}
        }
    }
    href.filter(|_| rel_ok)
}

/// Parse an RSS or Atom document into entries, in listing order.
pub fn parse_listing(xml: &str) -> PipelineResult<Vec<ListingEntry>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut current: Option<Draft> = None;
    let mut depth = 0usize;
    let mut field = Field::Other;
    let mut text = String::new();

    loop {
        let event = match reader.read_event() {
            Ok(event) => event,
            Err(e) => {
                if entries.is_empty() {
                    return Err(PipelineError::Extraction(format!(
                        "malformed listing at byte {}: {}",
                        reader.buffer_position(),
                        e
                    )));
                }
                tracing::warn!(error = %e, parsed = entries.len(), "listing truncated by XML error");
                break;
            }
        };

        match event {
            Event::Start(e) => {
                let name = e.local_name();
                match current.as_mut() {
                    None => {
                        if matches!(name.as_ref(), b"item" | b"entry") {
                            current = Some(Draft::default());
                            depth = 0;
                        }
                    }
                    Some(draft) => {
                        depth += 1;
                        if depth == 1 {
                            field = Field::from_local_name(name.as_ref());
                            text.clear();
                            if field == Field::Link {
                                if let Some(href) = alternate_href(&e) {
                                    draft.set(Field::Link, href);
                                }
                            }
                        }
                    }
                }
            }
            Event::Empty(e) => {
                if let Some(draft) = current.as_mut() {
                    if depth == 0 && e.local_name().as_ref() == b"link" {
                        if let Some(href) = alternate_href(&e) {
                            draft.set(Field::Link, href);
                        }
                    }
                }
            }
            Event::Text(e) => {
                if current.is_some() && depth >= 1 {
                    let decoded = match e.unescape() {
                        Ok(s) => s.into_owned(),
                        // HTML entities such as &nbsp; are not valid XML
                        Err(_) => html_escape::decode_html_entities(&String::from_utf8_lossy(&e))
                            .into_owned(),
                    };
                    if !text.is_empty() {
                        text.push(' ');
                    }
                    text.push_str(&decoded);
                }
            }
            Event::CData(e) => {
                if current.is_some() && depth >= 1 {
                    text.push_str(&String::from_utf8_lossy(&e));
                }
            }
            Event::End(_) => {
                if let Some(draft) = current.as_mut() {
                    if depth == 0 {
                        if let Some(done) = current.take().and_then(Draft::finish) {
                            entries.push(done);
                        }
                    } else {
                        if depth == 1 {
                            draft.set(field, std::mem::take(&mut text));
                            field = Field::Other;
                        }
                        depth -= 1;
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(entries)
}
