//! Quality heuristics
//!
//! Failure on any heuristic marks the article `needs_review` with a reason
//! string; the article is still persisted. The reason vocabulary is stable
//! because editorial tooling filters on it.

use crate::extract::ExtractedDocument;
use crate::types::IngestConfig;

pub const REASON_EMPTY_BODY: &str = "empty_body";
pub const REASON_BODY_TOO_SHORT: &str = "body_too_short";
pub const REASON_LOW_TEXT_RATIO: &str = "low_text_html_ratio";
pub const REASON_MISSING_TITLE: &str = "missing_title";
pub const REASON_LANGUAGE_UNKNOWN: &str = "language_unknown";

/// Evaluate a document; an empty vec means all heuristics passed.
pub fn review_reasons(document: &ExtractedDocument, config: &IngestConfig) -> Vec<String> {
    let mut reasons = Vec::new();
    let words = document.extraction.body.split_whitespace().count();

    if words == 0 {
        reasons.push(REASON_EMPTY_BODY.to_string());
    } else if words < config.min_words {
        reasons.push(REASON_BODY_TOO_SHORT.to_string());
    }

    if words > 0 && document.text_html_ratio < config.min_text_html_ratio {
        reasons.push(REASON_LOW_TEXT_RATIO.to_string());
    }

    let has_title = document
        .extraction
        .title
        .as_deref()
        .or(document.metadata.og_title.as_deref())
        .map(|t| !t.trim().is_empty())
        .unwrap_or(false);
    if !has_title {
        reasons.push(REASON_MISSING_TITLE.to_string());
    }

    if document.language.is_none() {
        reasons.push(REASON_LANGUAGE_UNKNOWN.to_string());
    }

    reasons
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::Extraction;
    use crate::metadata::StructuredMetadata;

    fn document(body: &str, title: Option<&str>, ratio: f32) -> ExtractedDocument {
        ExtractedDocument {
            extraction: Extraction {
                extractor: "trafilatura",
                title: title.map(str::to_string),
                body: body.to_string(),
                confidence: 0.8,
            },
            metadata: StructuredMetadata::default(),
            language: if body.split_whitespace().count() >= 5 {
                Some("eng".to_string())
            } else {
                None
            },
            text_html_ratio: ratio,
        }
    }

    fn config() -> IngestConfig {
        IngestConfig {
            min_words: 10,
            min_text_html_ratio: 0.25,
            ..IngestConfig::default()
        }
    }

    #[test]
    fn test_clean_article_passes() {
        let body = "one two three four five six seven eight nine ten eleven twelve";
        let doc = document(body, Some("Headline"), 0.5);
        assert!(review_reasons(&doc, &config()).is_empty());
    }

    #[test]
    fn test_empty_body_reason() {
        let doc = document("", Some("Headline"), 0.5);
        let reasons = review_reasons(&doc, &config());
        assert!(reasons.contains(&REASON_EMPTY_BODY.to_string()));
        // Empty body does not additionally count as too short or thin.
        assert!(!reasons.contains(&REASON_BODY_TOO_SHORT.to_string()));
        assert!(!reasons.contains(&REASON_LOW_TEXT_RATIO.to_string()));
    }

    #[test]
    fn test_short_body_reason() {
        let doc = document("only five words right here", Some("Headline"), 0.5);
        let reasons = review_reasons(&doc, &config());
        assert!(reasons.contains(&REASON_BODY_TOO_SHORT.to_string()));
    }

    #[test]
    fn test_missing_title_reason() {
        let body = "one two three four five six seven eight nine ten eleven twelve";
        let doc = document(body, None, 0.5);
        let reasons = review_reasons(&doc, &config());
        assert_eq!(reasons, vec![REASON_MISSING_TITLE.to_string()]);
    }

    #[test]
    fn test_og_title_counts_as_title() {
        let body = "one two three four five six seven eight nine ten eleven twelve";
        let mut doc = document(body, None, 0.5);
        doc.metadata.og_title = Some("From OpenGraph".to_string());
        assert!(review_reasons(&doc, &config()).is_empty());
    }
}
