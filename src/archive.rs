//! Transparency archive
//!
//! Append-only JSON artifacts for published facts, clusters and evidence
//! bundles. Artifacts are written once and never overwritten; each kind
//! keeps a `manifest.jsonl` with one line per artifact (path, sha256,
//! timestamp) so external auditors can verify the archive without the
//! platform's help.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use walkdir::WalkDir;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("archive io failure: {0}")]
    Io(String),
    #[error("artifact already exists at {0}")]
    AlreadyExists(String),
    #[error("manifest entry corrupt: {0}")]
    CorruptManifest(String),
}

pub type ArchiveResult<T> = Result<T, ArchiveError>;

/// One manifest line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: String,
    pub sha256: String,
    pub written_at: DateTime<Utc>,
}

/// Outcome of a verification sweep over one kind.
#[derive(Debug, Clone, Default, Serialize)]
pub struct VerifyReport {
    pub verified: u64,
    pub missing: Vec<String>,
    pub mismatched: Vec<String>,
    /// Files on disk that no manifest line covers.
    pub unindexed: Vec<String>,
}

pub struct ArchiveWriter {
    root: PathBuf,
}

impl ArchiveWriter {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Append one artifact of `kind` (e.g. `facts`, `clusters`,
    /// `evidence`). Returns the relative artifact path. Re-appending
    /// identical content on the same day is a no-op returning the
    /// existing path.
    pub async fn append(
        &self,
        kind: &str,
        payload: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> ArchiveResult<String> {
        let body = serde_json::to_string_pretty(payload)
            .map_err(|err| ArchiveError::Io(err.to_string()))?;
        let digest = hex::encode(Sha256::digest(body.as_bytes()));

        let day = now.format("%Y-%m-%d").to_string();
        let dir = self.root.join(kind).join(&day);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|err| ArchiveError::Io(err.to_string()))?;

        let file_name = format!("{}-{}.json", now.timestamp_nanos_opt().unwrap_or(0), &digest[..12]);
        let relative = format!("{kind}/{day}/{file_name}");
        let path = self.root.join(&relative);

        // Same content twice in one day: point at the existing artifact.
        if let Some(existing) = self.find_by_digest(kind, &day, &digest).await? {
            info!(kind, artifact = %existing, "artifact already archived");
            return Ok(existing);
        }
        if path.exists() {
            return Err(ArchiveError::AlreadyExists(relative));
        }

        let tmp = dir.join(format!(".{file_name}.tmp"));
        tokio::fs::write(&tmp, &body)
            .await
            .map_err(|err| ArchiveError::Io(err.to_string()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|err| ArchiveError::Io(err.to_string()))?;

        self.append_manifest(
            kind,
            &ManifestEntry {
                path: relative.clone(),
                sha256: digest,
                written_at: now,
            },
        )
        .await?;

        info!(kind, artifact = %relative, "artifact archived");
        Ok(relative)
    }

    async fn find_by_digest(
        &self,
        kind: &str,
        day: &str,
        digest: &str,
    ) -> ArchiveResult<Option<String>> {
        let entries = self.manifest(kind).await?;
        Ok(entries
            .into_iter()
            .find(|entry| entry.sha256 == digest && entry.path.contains(day))
            .map(|entry| entry.path))
    }

    async fn append_manifest(&self, kind: &str, entry: &ManifestEntry) -> ArchiveResult<()> {
        let manifest_path = self.root.join(kind).join("manifest.jsonl");
        let line = serde_json::to_string(entry)
            .map_err(|err| ArchiveError::Io(err.to_string()))?
            + "\n";

        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&manifest_path)
            .await
            .map_err(|err| ArchiveError::Io(err.to_string()))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|err| ArchiveError::Io(err.to_string()))?;
        file.flush()
            .await
            .map_err(|err| ArchiveError::Io(err.to_string()))
    }

    /// All manifest entries for one kind, oldest first.
    pub async fn manifest(&self, kind: &str) -> ArchiveResult<Vec<ManifestEntry>> {
        let manifest_path = self.root.join(kind).join("manifest.jsonl");
        let raw = match tokio::fs::read_to_string(&manifest_path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(ArchiveError::Io(err.to_string())),
        };

        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line)
                    .map_err(|err| ArchiveError::CorruptManifest(err.to_string()))
            })
            .collect()
    }

    /// Verify every manifest entry against disk and report files the
    /// manifest does not cover.
    pub async fn verify(&self, kind: &str) -> ArchiveResult<VerifyReport> {
        let mut report = VerifyReport::default();
        let entries = self.manifest(kind).await?;
        let mut indexed = std::collections::HashSet::new();

        for entry in &entries {
            indexed.insert(entry.path.clone());
            let path = self.root.join(&entry.path);
            match tokio::fs::read(&path).await {
                Ok(body) => {
                    let digest = hex::encode(Sha256::digest(&body));
                    if digest == entry.sha256 {
                        report.verified += 1;
                    } else {
                        warn!(artifact = %entry.path, "artifact digest mismatch");
                        report.mismatched.push(entry.path.clone());
                    }
                }
                Err(_) => report.missing.push(entry.path.clone()),
            }
        }

        let kind_root = self.root.join(kind);
        for file in WalkDir::new(&kind_root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let name = file.file_name().to_string_lossy();
            if name == "manifest.jsonl" || name.ends_with(".tmp") {
                continue;
            }
            if let Ok(relative) = file.path().strip_prefix(&self.root) {
                let relative = relative.to_string_lossy().to_string();
                if !indexed.contains(&relative) {
                    report.unindexed.push(relative);
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_append_and_verify() {
        let dir = tempfile::tempdir().unwrap();
        let archive = ArchiveWriter::new(dir.path());
        let now = Utc::now();

        let path = archive
            .append("facts", &json!({"claim": "x", "score": 0.93}), now)
            .await
            .unwrap();
        assert!(dir.path().join(&path).exists());

        let manifest = archive.manifest("facts").await.unwrap();
        assert_eq!(manifest.len(), 1);
        assert_eq!(manifest[0].path, path);

        let report = archive.verify("facts").await.unwrap();
        assert_eq!(report.verified, 1);
        assert!(report.missing.is_empty());
        assert!(report.mismatched.is_empty());
        assert!(report.unindexed.is_empty());
    }

    #[tokio::test]
    async fn test_identical_payload_is_not_duplicated() {
        let dir = tempfile::tempdir().unwrap();
        let archive = ArchiveWriter::new(dir.path());
        let now = Utc::now();
        let payload = json!({"cluster": [1, 2, 3]});

        let first = archive.append("clusters", &payload, now).await.unwrap();
        let second = archive.append("clusters", &payload, now).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(archive.manifest("clusters").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_tampering_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let archive = ArchiveWriter::new(dir.path());
        let now = Utc::now();

        let path = archive
            .append("evidence", &json!({"doc": "original"}), now)
            .await
            .unwrap();
        std::fs::write(dir.path().join(&path), "{\"doc\": \"tampered\"}").unwrap();

        let report = archive.verify("evidence").await.unwrap();
        assert_eq!(report.verified, 0);
        assert_eq!(report.mismatched, vec![path]);
    }
}
