//! URL normalization and hashing
//!
//! Normalization is idempotent and stable across processes: lowercase
//! host, fragment dropped, tracking parameters stripped (strict mode), and
//! a `<link rel="canonical">` target honored when the page provides one.
//! The dedupe hash is computed over the normalized URL with a configurable
//! algorithm.

use url::Url;

use crate::types::{IngestError, IngestResult};

/// Query parameters that never affect content identity.
const TRACKING_PARAMS: &[&str] = &["gclid", "fbclid", "msclkid", "mc_cid", "mc_eid", "igshid"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizationMode {
    /// Lowercase host, drop fragment, strip tracking params, honor
    /// canonical.
    Strict,
    /// Lowercase host and drop fragment only.
    Lenient,
}

impl NormalizationMode {
    pub fn from_env_value(value: &str) -> Self {
        match value {
            "lenient" => NormalizationMode::Lenient,
            _ => NormalizationMode::Strict,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgo {
    Sha256,
    Sha1,
    Blake2b,
}

impl HashAlgo {
    pub fn from_env_value(value: &str) -> Self {
        match value {
            "sha1" => HashAlgo::Sha1,
            "blake2b" => HashAlgo::Blake2b,
            _ => HashAlgo::Sha256,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgo::Sha256 => "sha256",
            HashAlgo::Sha1 => "sha1",
            HashAlgo::Blake2b => "blake2b",
        }
    }
}

/// Normalize `raw`, preferring the page-declared canonical URL when given.
///
/// The canonical target is resolved against the fetched URL so relative
/// canonicals work, then normalized by the same rules (without further
/// canonical indirection).
pub fn normalize_url(
    raw: &str,
    mode: NormalizationMode,
    canonical: Option<&str>,
) -> IngestResult<String> {
    let base = parse(raw)?;

    if mode == NormalizationMode::Strict {
        if let Some(canonical) = canonical {
            if let Ok(joined) = base.join(canonical) {
                return Ok(apply_rules(joined, mode));
            }
        }
    }

    Ok(apply_rules(base, mode))
}

fn parse(raw: &str) -> IngestResult<Url> {
    Url::parse(raw).map_err(|err| IngestError::InvalidUrl {
        url: raw.to_string(),
        detail: err.to_string(),
    })
}

fn apply_rules(mut url: Url, mode: NormalizationMode) -> String {
    // Url::parse already lowercases the host; the fragment never survives.
    url.set_fragment(None);

    if mode == NormalizationMode::Strict {
        let kept: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(key, _)| !is_tracking_param(key))
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        if kept.is_empty() {
            url.set_query(None);
        } else {
            let query = kept
                .iter()
                .map(|(k, v)| {
                    if v.is_empty() {
                        k.clone()
                    } else {
                        format!("{k}={v}")
                    }
                })
                .collect::<Vec<_>>()
                .join("&");
            url.set_query(Some(&query));
        }
    }

    url.to_string()
}

fn is_tracking_param(key: &str) -> bool {
    key.starts_with("utm_") || TRACKING_PARAMS.contains(&key)
}

/// Hash a normalized URL to lowercase hex with the configured algorithm.
pub fn url_hash(normalized: &str, algo: HashAlgo) -> String {
    match algo {
        HashAlgo::Sha256 => {
            use sha2::{Digest, Sha256};
            hex::encode(Sha256::digest(normalized.as_bytes()))
        }
        HashAlgo::Sha1 => {
            use sha1::{Digest, Sha1};
            hex::encode(Sha1::digest(normalized.as_bytes()))
        }
        HashAlgo::Blake2b => {
            use blake2::{Blake2b512, Digest};
            hex::encode(Blake2b512::digest(normalized.as_bytes()))
        }
    }
}

/// Registrable domain portion of a normalized URL, used to key `sources`.
pub fn domain_of(normalized: &str) -> IngestResult<String> {
    let url = parse(normalized)?;
    url.host_str()
        .map(|host| host.trim_start_matches("www.").to_string())
        .ok_or_else(|| IngestError::InvalidUrl {
            url: normalized.to_string(),
            detail: "no host".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strict_normalization_strips_tracking_and_fragment() {
        let normalized = normalize_url(
            "https://Example.com/Article?utm_source=x#frag",
            NormalizationMode::Strict,
            None,
        )
        .unwrap();
        assert_eq!(normalized, "https://example.com/Article");
    }

    #[test]
    fn test_strict_keeps_content_params() {
        let normalized = normalize_url(
            "https://example.com/story?id=42&utm_campaign=y&fbclid=z",
            NormalizationMode::Strict,
            None,
        )
        .unwrap();
        assert_eq!(normalized, "https://example.com/story?id=42");
    }

    #[test]
    fn test_lenient_keeps_query() {
        let normalized = normalize_url(
            "https://Example.com/story?utm_source=x#frag",
            NormalizationMode::Lenient,
            None,
        )
        .unwrap();
        assert_eq!(normalized, "https://example.com/story?utm_source=x");
    }

    #[test]
    fn test_normalization_is_idempotent() {
        let urls = [
            "https://Example.com/Article?utm_source=x#frag",
            "https://example.com/story?id=42&utm_campaign=y",
            "https://news.example.org/a/b/c",
            "https://example.com/?gclid=abc",
        ];
        for raw in urls {
            let once = normalize_url(raw, NormalizationMode::Strict, None).unwrap();
            let twice = normalize_url(&once, NormalizationMode::Strict, None).unwrap();
            assert_eq!(once, twice, "normalize not idempotent for {raw}");
        }
    }

    #[test]
    fn test_canonical_is_honored() {
        let normalized = normalize_url(
            "https://example.com/article/?utm_campaign=y",
            NormalizationMode::Strict,
            Some("https://example.com/Article"),
        )
        .unwrap();
        assert_eq!(normalized, "https://example.com/Article");
    }

    #[test]
    fn test_relative_canonical_resolves_against_base() {
        let normalized = normalize_url(
            "https://example.com/amp/story-42",
            NormalizationMode::Strict,
            Some("/story-42"),
        )
        .unwrap();
        assert_eq!(normalized, "https://example.com/story-42");
    }

    #[test]
    fn test_url_hash_is_stable() {
        // Known vectors; these must never change across platforms.
        assert_eq!(
            url_hash("https://example.com/Article", HashAlgo::Sha256),
            "ce8e2398388addd1506688f43109b326f3d6d206620e2020704b6b6c2b09deb7"
        );
        assert_eq!(
            url_hash("https://example.com/Article", HashAlgo::Sha1),
            "f0053935f438d0bdd28dcf8a9de9979f5724f7f7"
        );
        assert_eq!(url_hash("x", HashAlgo::Blake2b).len(), 128);
    }

    #[test]
    fn test_domain_of_strips_www() {
        assert_eq!(
            domain_of("https://www.example.com/a").unwrap(),
            "example.com"
        );
        assert_eq!(domain_of("https://example.com/a").unwrap(), "example.com");
    }
}
