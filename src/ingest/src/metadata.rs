//! Structured metadata parsing
//!
//! Pulls publication date, authors, canonical URL, section and tags out of
//! JSON-LD blocks, OpenGraph/meta tags and `<link rel="canonical">`.
//! JSON-LD wins where both are present; meta tags fill the gaps.

use chrono::{DateTime, Utc};
use scraper::{Html, Selector};
use serde_json::Value;

#[derive(Debug, Clone, Default)]
pub struct StructuredMetadata {
    pub canonical_url: Option<String>,
    pub publication_date: Option<DateTime<Utc>>,
    pub authors: Vec<String>,
    pub section: Option<String>,
    pub tags: Vec<String>,
    pub og_title: Option<String>,
}

fn selector(css: &str) -> Selector {
    Selector::parse(css).unwrap_or_else(|_| Selector::parse("meta").unwrap())
}

pub fn parse_structured_metadata(document: &Html) -> StructuredMetadata {
    let mut metadata = StructuredMetadata::default();

    parse_json_ld(document, &mut metadata);
    parse_meta_tags(document, &mut metadata);
    parse_canonical_link(document, &mut metadata);

    metadata.authors.dedup();
    metadata.tags.dedup();
    metadata
}

fn parse_json_ld(document: &Html, metadata: &mut StructuredMetadata) {
    let scripts = selector("script[type=\"application/ld+json\"]");
    for script in document.select(&scripts) {
        let raw: String = script.text().collect();
        let Ok(value) = serde_json::from_str::<Value>(&raw) else {
            continue;
        };
        // JSON-LD may be a single object or an array / @graph of them.
        let candidates: Vec<&Value> = match &value {
            Value::Array(items) => items.iter().collect(),
            Value::Object(obj) => match obj.get("@graph") {
                Some(Value::Array(items)) => items.iter().collect(),
                _ => vec![&value],
            },
            _ => continue,
        };

        for item in candidates {
            let is_article = item
                .get("@type")
                .and_then(|t| t.as_str())
                .map(|t| t.contains("Article"))
                .unwrap_or(false);
            if !is_article {
                continue;
            }

            if metadata.publication_date.is_none() {
                metadata.publication_date = item
                    .get("datePublished")
                    .and_then(|d| d.as_str())
                    .and_then(parse_date);
            }
            if metadata.section.is_none() {
                metadata.section = item
                    .get("articleSection")
                    .and_then(|s| s.as_str())
                    .map(str::to_string);
            }
            if metadata.tags.is_empty() {
                metadata.tags = match item.get("keywords") {
                    Some(Value::String(keywords)) => keywords
                        .split(',')
                        .map(|k| k.trim().to_string())
                        .filter(|k| !k.is_empty())
                        .collect(),
                    Some(Value::Array(items)) => items
                        .iter()
                        .filter_map(|k| k.as_str())
                        .map(str::to_string)
                        .collect(),
                    _ => Vec::new(),
                };
            }
            collect_authors(item.get("author"), &mut metadata.authors);
        }
    }
}

fn collect_authors(value: Option<&Value>, authors: &mut Vec<String>) {
    match value {
        Some(Value::String(name)) => authors.push(name.clone()),
        Some(Value::Object(obj)) => {
            if let Some(name) = obj.get("name").and_then(|n| n.as_str()) {
                authors.push(name.to_string());
            }
        }
        Some(Value::Array(items)) => {
            for item in items {
                collect_authors(Some(item), authors);
            }
        }
        _ => {}
    }
}

fn parse_meta_tags(document: &Html, metadata: &mut StructuredMetadata) {
    let metas = selector("meta");
    for meta in document.select(&metas) {
        let value = meta.value().attr("content").unwrap_or("");
        if value.is_empty() {
            continue;
        }
        let key = meta
            .value()
            .attr("property")
            .or_else(|| meta.value().attr("name"))
            .unwrap_or("");

        match key {
            "og:title" if metadata.og_title.is_none() => {
                metadata.og_title = Some(value.to_string());
            }
            "article:published_time" if metadata.publication_date.is_none() => {
                metadata.publication_date = parse_date(value);
            }
            "article:section" if metadata.section.is_none() => {
                metadata.section = Some(value.to_string());
            }
            "article:tag" => metadata.tags.push(value.to_string()),
            "author" if metadata.authors.is_empty() => {
                metadata.authors.push(value.to_string());
            }
            _ => {}
        }
    }
}

fn parse_canonical_link(document: &Html, metadata: &mut StructuredMetadata) {
    let links = selector("link[rel=\"canonical\"]");
    if let Some(link) = document.select(&links).next() {
        if let Some(href) = link.value().attr("href") {
            if !href.is_empty() {
                metadata.canonical_url = Some(href.to_string());
            }
        }
    }
}

fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            // Date-only values are common in JSON-LD.
            chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|d| DateTime::from_naive_utc_and_offset(d, Utc))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_ld_article() {
        let html = r#"<html><head>
            <script type="application/ld+json">
            {"@type": "NewsArticle",
             "datePublished": "2026-07-14T08:30:00Z",
             "articleSection": "Energy",
             "keywords": "grid, policy",
             "author": [{"name": "A. Reporter"}, {"name": "B. Editor"}]}
            </script>
            </head><body></body></html>"#;
        let document = Html::parse_document(html);
        let metadata = parse_structured_metadata(&document);

        assert_eq!(metadata.section.as_deref(), Some("Energy"));
        assert_eq!(metadata.tags, vec!["grid", "policy"]);
        assert_eq!(metadata.authors, vec!["A. Reporter", "B. Editor"]);
        assert_eq!(
            metadata.publication_date.unwrap().to_rfc3339(),
            "2026-07-14T08:30:00+00:00"
        );
    }

    #[test]
    fn test_meta_tags_fill_gaps() {
        let html = r#"<html><head>
            <meta property="og:title" content="The headline">
            <meta property="article:published_time" content="2026-07-14T08:30:00Z">
            <meta name="author" content="C. Writer">
            <link rel="canonical" href="https://example.com/story">
            </head><body></body></html>"#;
        let document = Html::parse_document(html);
        let metadata = parse_structured_metadata(&document);

        assert_eq!(metadata.og_title.as_deref(), Some("The headline"));
        assert_eq!(metadata.authors, vec!["C. Writer"]);
        assert_eq!(
            metadata.canonical_url.as_deref(),
            Some("https://example.com/story")
        );
    }

    #[test]
    fn test_date_only_json_ld() {
        assert!(parse_date("2026-07-14").is_some());
        assert!(parse_date("not a date").is_none());
    }
}
