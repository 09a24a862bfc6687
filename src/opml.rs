//! OPML subscription lists: reading origins and writing the failure report.

use anyhow::{Context, Result};
use chrono::Utc;
use quick_xml::events::Event;
use quick_xml::Reader;
use std::path::Path;

use crate::config::Config;
use crate::db;
use crate::ledger::FailureLedger;
use crate::models::{FailureCategory, FailureRecord, Origin};

/// Read every outline carrying an `xmlUrl`, in document order. Nested folders are flattened.
pub fn parse_opml(xml: &str) -> Result<Vec<Origin>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut origins = Vec::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() != b"outline" {
                    continue;
                }
                let mut url = None;
                let mut title = None;
                let mut text = None;
                let mut html_url = None;
                for attr in e.attributes().flatten() {
                    let value = match attr.unescape_value() {
                        Ok(v) => v.trim().to_string(),
                        Err(_) => continue,
                    };
                    match attr.key.local_name().as_ref() {
                        b"xmlUrl" => url = Some(value),
                        b"title" => title = Some(value),
                        b"text" => text = Some(value),
                        b"htmlUrl" => html_url = Some(value),
                        _ => {}
                    }
                }
                let Some(url) = url.filter(|u| !u.is_empty()) else {
                    continue;
                };
                let name = title
                    .filter(|t| !t.is_empty())
                    .or(text.filter(|t| !t.is_empty()))
                    .unwrap_or_else(|| url.clone());
                origins.push(Origin {
                    name,
                    url,
                    html_url: html_url.filter(|h| !h.is_empty()),
                });
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => anyhow::bail!(
                "malformed OPML at byte {}: {}",
                reader.buffer_position(),
                e
            ),
        }
    }
    Ok(origins)
}

pub fn load_opml(path: &Path) -> Result<Vec<Origin>> {
    let xml = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read OPML file: {}", path.display()))?;
    parse_opml(&xml).with_context(|| format!("Failed to parse OPML file: {}", path.display()))
}

/// Render failing origins as an OPML document, so they can be re-imported or pruned.
pub fn failure_report(records: &[FailureRecord]) -> String {
    use html_escape::encode_double_quoted_attribute as attr;

    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    out.push_str("<opml version=\"2.0\">\n");
    out.push_str("  <head>\n");
    out.push_str("    <title>Failed feeds</title>\n");
    out.push_str(&format!(
        "    <dateCreated>{}</dateCreated>\n",
        Utc::now().to_rfc2822()
    ));
    out.push_str("  </head>\n");
    out.push_str("  <body>\n");
    for r in records {
        let name = r.label.as_deref().unwrap_or(&r.url);
        out.push_str(&format!(
            "    <outline type=\"rss\" text=\"{}\" title=\"{}\" xmlUrl=\"{}\" error=\"{}\" retries=\"{}\" lastAttempt=\"{}\"/>\n",
            attr(name),
            attr(name),
            attr(&r.url),
            attr(&r.error),
            r.retries,
            r.last_attempt.to_rfc3339(),
        ));
    }
    out.push_str("  </body>\n");
    out.push_str("</opml>\n");
    out
}

/// CLI entry point for `fh failures`: list the ledger, optionally writing the OPML report.
pub async fn run_failures(
    config: &Config,
    category: Option<FailureCategory>,
    output: Option<&Path>,
) -> Result<()> {
    let pool = db::connect(config).await?;
    let ledger = FailureLedger::new(pool.clone(), &config.ledger);
    let records = ledger.list(category).await?;

    if let Some(path) = output {
        // The report lists origins whatever category the table shows.
        let origins = match category {
            Some(FailureCategory::OriginFetch) => records.clone(),
            _ => ledger.list(Some(FailureCategory::OriginFetch)).await?,
        };
        std::fs::write(path, failure_report(&origins))
            .with_context(|| format!("Failed to write failure report: {}", path.display()))?;
        println!("wrote {} failing origins to {}", origins.len(), path.display());
    }

    if records.is_empty() {
        println!("No failures recorded.");
    } else {
        println!(
            "{:<14} {:>7}  {:<16}  {}",
            "CATEGORY", "RETRIES", "LAST ATTEMPT", "URL"
        );
        for r in &records {
            println!(
                "{:<14} {:>7}  {:<16}  {}",
                r.category.as_str(),
                r.retries,
                r.last_attempt.format("%Y-%m-%d %H:%M"),
                r.url
            );
            println!("{:<14} {:>7}  {}", "", "", r.error);
        }
    }

    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_nested_outlines_and_skips_folders() {
        let xml = r#"<?xml version="1.0"?>
<opml version="1.0">
  <head><title>Subs</title></head>
  <body>
    <outline text="Tech">
      <outline text="Blog A" title="Blog A" type="rss" xmlUrl="https://a.example.com/feed" htmlUrl="https://a.example.com/"/>
      <outline text="B &amp; Co" xmlUrl="https://b.example.com/rss"/>
    </outline>
    <outline text="No url"/>
  </body>
</opml>"#;
        let origins = parse_opml(xml).unwrap();
        assert_eq!(origins.len(), 2);
        assert_eq!(origins[0].name, "Blog A");
        assert_eq!(origins[0].html_url.as_deref(), Some("https://a.example.com/"));
        assert_eq!(origins[1].name, "B & Co");
        assert_eq!(origins[1].url, "https://b.example.com/rss");
    }

    #[test]
    fn failure_report_round_trips_through_parser() {
        let records = vec![FailureRecord {
            category: FailureCategory::OriginFetch,
            url: "https://x.example.com/feed?a=1&b=2".to_string(),
            label: Some("X \"quoted\" <feed>".to_string()),
            error: "HTTP 404".to_string(),
            last_attempt: Utc::now(),
            retries: 3,
        }];
        let xml = failure_report(&records);
        let origins = parse_opml(&xml).unwrap();
        assert_eq!(origins.len(), 1);
        assert_eq!(origins[0].url, "https://x.example.com/feed?a=1&b=2");
        assert_eq!(origins[0].name, "X \"quoted\" <feed>");
    }

    #[tokio::test]
    async fn report_lists_origins_when_table_is_narrowed_to_items() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = Config::minimal(tmp.path().join("fh.sqlite"));
        let pool = db::connect(&config).await.unwrap();
        crate::migrate::apply(&pool).await.unwrap();

        let ledger = FailureLedger::new(pool.clone(), &config.ledger);
        ledger
            .record(
                FailureCategory::OriginFetch,
                "https://down.example.com/rss",
                Some("Down"),
                "HTTP 503",
            )
            .await
            .unwrap();
        ledger
            .record(FailureCategory::ItemFetch, "https://down.example.com/post", None, "HTTP 404")
            .await
            .unwrap();

        let path = tmp.path().join("failing.opml");
        run_failures(&config, Some(FailureCategory::ItemFetch), Some(&path))
            .await
            .unwrap();

        let origins = parse_opml(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(origins.len(), 1);
        assert_eq!(origins[0].url, "https://down.example.com/rss");
        assert_eq!(origins[0].name, "Down");
    }
}
