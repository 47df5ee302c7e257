//! Extractor cascade
//!
//! HTML → article text runs through an ordered cascade of extractors, each
//! scoring its own confidence; the first result above the primary
//! threshold wins, otherwise the best attempt is kept. All extraction is
//! synchronous over a parsed DOM (the parse handle is not `Send`), so
//! callers run the cascade inside `spawn_blocking`.

use scraper::{Html, Selector};

use crate::metadata::{parse_structured_metadata, StructuredMetadata};
use crate::types::{IngestConfig, PrimaryExtractor};

/// One extractor's attempt.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub extractor: &'static str,
    pub title: Option<String>,
    pub body: String,
    pub confidence: f32,
}

/// Full result of the cascade over one document.
#[derive(Debug, Clone)]
pub struct ExtractedDocument {
    pub extraction: Extraction,
    pub metadata: StructuredMetadata,
    pub language: Option<String>,
    /// body-bytes / html-bytes, fed to the quality heuristics.
    pub text_html_ratio: f32,
}

pub trait Extractor: Send + Sync {
    fn name(&self) -> &'static str;
    fn extract(&self, document: &Html) -> Extraction;
}

/// Dense-main-content extraction in the trafilatura manner: prefer the
/// `<article>`/`<main>` subtree with the highest paragraph mass.
pub struct DenseContentExtractor;

/// Container scoring in the readability manner: rank block containers by
/// text length against link density.
pub struct ContainerScoringExtractor;

/// Paragraph classification in the jusText manner: keep paragraphs that
/// look like prose, drop boilerplate-shaped blocks.
pub struct ParagraphClassifierExtractor;

fn selector(css: &str) -> Selector {
    // The selectors below are compile-time constants; parse cannot fail.
    Selector::parse(css).unwrap_or_else(|_| Selector::parse("p").unwrap())
}

fn text_of(element: scraper::ElementRef<'_>) -> String {
    element.text().collect::<Vec<_>>().join(" ")
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn title_of(document: &Html) -> Option<String> {
    let title_sel = selector("title");
    document
        .select(&title_sel)
        .next()
        .map(|t| collapse_whitespace(&text_of(t)))
        .filter(|t| !t.is_empty())
}

/// Confidence grows with body mass and saturates; tuned so a typical
/// article lands above the 0.7 primary threshold and a nav-only page does
/// not.
fn confidence_for(words: usize) -> f32 {
    (words as f32 / 400.0).min(1.0) * 0.95
}

impl Extractor for DenseContentExtractor {
    fn name(&self) -> &'static str {
        "trafilatura"
    }

    fn extract(&self, document: &Html) -> Extraction {
        let containers = selector("article, main, [role=main]");
        let paragraphs = selector("p");

        let mut best_body = String::new();
        for container in document.select(&containers) {
            let body = container
                .select(&paragraphs)
                .map(|p| collapse_whitespace(&text_of(p)))
                .filter(|p| !p.is_empty())
                .collect::<Vec<_>>()
                .join("\n\n");
            if body.len() > best_body.len() {
                best_body = body;
            }
        }

        // No semantic container: fall back to all paragraphs.
        if best_body.is_empty() {
            best_body = document
                .select(&paragraphs)
                .map(|p| collapse_whitespace(&text_of(p)))
                .filter(|p| !p.is_empty())
                .collect::<Vec<_>>()
                .join("\n\n");
        }

        let words = best_body.split_whitespace().count();
        Extraction {
            extractor: self.name(),
            title: title_of(document),
            body: best_body,
            confidence: confidence_for(words),
        }
    }
}

impl Extractor for ContainerScoringExtractor {
    fn name(&self) -> &'static str {
        "readability"
    }

    fn extract(&self, document: &Html) -> Extraction {
        let containers = selector("div, section, article, main");
        let paragraphs = selector("p");
        let anchors = selector("a");

        let mut best_body = String::new();
        let mut best_score = 0.0f32;
        for container in document.select(&containers) {
            let text: String = container
                .select(&paragraphs)
                .map(|p| collapse_whitespace(&text_of(p)))
                .filter(|p| !p.is_empty())
                .collect::<Vec<_>>()
                .join("\n\n");
            if text.is_empty() {
                continue;
            }
            let link_text: usize = container
                .select(&anchors)
                .map(|a| text_of(a).len())
                .sum();
            let link_density = link_text as f32 / text.len().max(1) as f32;
            let score = text.len() as f32 * (1.0 - link_density.min(1.0));
            if score > best_score {
                best_score = score;
                best_body = text;
            }
        }

        let words = best_body.split_whitespace().count();
        Extraction {
            extractor: self.name(),
            title: title_of(document),
            body: best_body,
            // Slightly conservative next to the primary extractor.
            confidence: confidence_for(words) * 0.9,
        }
    }
}

impl Extractor for ParagraphClassifierExtractor {
    fn name(&self) -> &'static str {
        "justext"
    }

    fn extract(&self, document: &Html) -> Extraction {
        let paragraphs = selector("p");

        let kept: Vec<String> = document
            .select(&paragraphs)
            .map(|p| collapse_whitespace(&text_of(p)))
            .filter(|p| looks_like_prose(p))
            .collect();

        let body = kept.join("\n\n");
        let words = body.split_whitespace().count();
        Extraction {
            extractor: self.name(),
            title: title_of(document),
            body,
            confidence: confidence_for(words) * 0.85,
        }
    }
}

/// Boilerplate filter: short fragments, ALL-CAPS menus and link farms are
/// not prose.
fn looks_like_prose(paragraph: &str) -> bool {
    let words = paragraph.split_whitespace().count();
    if words < 8 {
        return false;
    }
    let letters = paragraph.chars().filter(|c| c.is_alphabetic()).count();
    if letters == 0 {
        return false;
    }
    let upper = paragraph
        .chars()
        .filter(|c| c.is_alphabetic() && c.is_uppercase())
        .count();
    (upper as f32 / letters as f32) < 0.5
}

/// The ordered cascade.
pub struct ExtractorCascade {
    extractors: Vec<Box<dyn Extractor>>,
    primary_threshold: f32,
}

impl ExtractorCascade {
    pub fn new(config: &IngestConfig) -> Self {
        let mut extractors: Vec<Box<dyn Extractor>> = vec![
            Box::new(DenseContentExtractor),
            Box::new(ContainerScoringExtractor),
            Box::new(ParagraphClassifierExtractor),
        ];
        // The configured primary moves to the front; relative order of the
        // rest is preserved.
        let front = match config.primary_extractor {
            PrimaryExtractor::Trafilatura => "trafilatura",
            PrimaryExtractor::Readability => "readability",
            PrimaryExtractor::Justext => "justext",
        };
        if let Some(pos) = extractors.iter().position(|e| e.name() == front) {
            let primary = extractors.remove(pos);
            extractors.insert(0, primary);
        }

        Self {
            extractors,
            primary_threshold: config.primary_threshold,
        }
    }

    /// Run the cascade and structured-metadata parse over raw HTML.
    pub fn extract(&self, html: &str) -> ExtractedDocument {
        let document = Html::parse_document(html);
        let metadata = parse_structured_metadata(&document);

        let mut best: Option<Extraction> = None;
        for extractor in &self.extractors {
            let attempt = extractor.extract(&document);
            if attempt.confidence > self.primary_threshold {
                return self.finish(html, attempt, metadata);
            }
            let better = best
                .as_ref()
                .map(|b| attempt.confidence > b.confidence)
                .unwrap_or(true);
            if better {
                best = Some(attempt);
            }
        }

        let fallback = best.unwrap_or(Extraction {
            extractor: "none",
            title: None,
            body: String::new(),
            confidence: 0.0,
        });
        self.finish(html, fallback, metadata)
    }

    fn finish(
        &self,
        html: &str,
        extraction: Extraction,
        metadata: StructuredMetadata,
    ) -> ExtractedDocument {
        let language = detect_language(&extraction.body);
        let ratio = if html.is_empty() {
            0.0
        } else {
            extraction.body.len() as f32 / html.len() as f32
        };
        ExtractedDocument {
            extraction,
            metadata,
            language,
            text_html_ratio: ratio,
        }
    }
}

fn detect_language(body: &str) -> Option<String> {
    if body.split_whitespace().count() < 5 {
        return None;
    }
    whatlang::detect(body).map(|info| info.lang().code().to_string())
}
