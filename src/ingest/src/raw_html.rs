//! Raw HTML archive
//!
//! Every fetched page is kept verbatim under the configured directory with
//! a deterministic filename derived from the URL hash and collection
//! timestamp, so re-extraction and audits can replay exactly what was
//! ingested. Writes go through a temp file and rename.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::types::{IngestError, IngestResult};

pub struct RawHtmlArchive {
    root: PathBuf,
}

impl RawHtmlArchive {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Deterministic relative locator for one capture.
    pub fn locator(url_hash: &str, collected_at: DateTime<Utc>) -> String {
        format!("{}-{}.html", url_hash, collected_at.timestamp())
    }

    /// Persist the page; returns the locator stored on the article row.
    pub async fn persist(
        &self,
        url_hash: &str,
        collected_at: DateTime<Utc>,
        html: &str,
    ) -> IngestResult<String> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|err| IngestError::Archive(err.to_string()))?;

        let locator = Self::locator(url_hash, collected_at);
        let path = self.root.join(&locator);
        let tmp = self.root.join(format!(".{locator}.tmp"));

        tokio::fs::write(&tmp, html)
            .await
            .map_err(|err| IngestError::Archive(err.to_string()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|err| IngestError::Archive(err.to_string()))?;

        debug!(?path, bytes = html.len(), "raw HTML archived");
        Ok(locator)
    }

    pub async fn read(&self, locator: &str) -> IngestResult<String> {
        tokio::fs::read_to_string(self.root.join(locator))
            .await
            .map_err(|err| IngestError::Archive(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_persist_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let archive = RawHtmlArchive::new(dir.path());
        let now = Utc::now();

        let locator = archive.persist("abc123", now, "<html>x</html>").await.unwrap();
        assert_eq!(locator, format!("abc123-{}.html", now.timestamp()));
        assert_eq!(archive.read(&locator).await.unwrap(), "<html>x</html>");
    }

    #[test]
    fn test_locator_is_deterministic() {
        let at = DateTime::parse_from_rfc3339("2026-07-14T08:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            RawHtmlArchive::locator("deadbeef", at),
            RawHtmlArchive::locator("deadbeef", at)
        );
    }
}
