//! Schedule and profile loading
//!
//! The schedule is a single TOML file; profiles live one-per-file in the
//! profiles directory. Both are read at startup and on demand, never
//! mutated by the scheduler.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use tracing::info;

use crate::types::{CrawlProfile, SchedResult, ScheduleEntry, SchedulerError};

#[derive(Debug, Deserialize)]
struct ScheduleFile {
    #[serde(default)]
    domains: Vec<ScheduleEntry>,
}

pub fn load_schedule(path: &Path) -> SchedResult<Vec<ScheduleEntry>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|err| SchedulerError::Validation(format!("{}: {err}", path.display())))?;
    let file: ScheduleFile = toml::from_str(&raw)
        .map_err(|err| SchedulerError::Validation(format!("{}: {err}", path.display())))?;

    for entry in &file.domains {
        if entry.cadence_seconds == 0 {
            return Err(SchedulerError::Validation(format!(
                "domain {} has zero cadence",
                entry.domain
            )));
        }
    }

    info!(path = %path.display(), domains = file.domains.len(), "schedule loaded");
    Ok(file.domains)
}

pub fn load_profiles(dir: &Path) -> SchedResult<HashMap<String, CrawlProfile>> {
    let mut profiles = HashMap::new();
    let entries = std::fs::read_dir(dir)
        .map_err(|err| SchedulerError::Validation(format!("{}: {err}", dir.display())))?;

    for entry in entries {
        let entry = entry.map_err(|err| SchedulerError::Transient(err.to_string()))?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("toml") {
            continue;
        }
        let raw = std::fs::read_to_string(&path)
            .map_err(|err| SchedulerError::Validation(format!("{}: {err}", path.display())))?;
        let profile: CrawlProfile = toml::from_str(&raw)
            .map_err(|err| SchedulerError::Validation(format!("{}: {err}", path.display())))?;
        profiles.insert(profile.name.clone(), profile);
    }

    info!(dir = %dir.display(), profiles = profiles.len(), "crawl profiles loaded");
    Ok(profiles)
}

/// Every schedule entry must reference a known profile.
pub fn validate(
    schedule: &[ScheduleEntry],
    profiles: &HashMap<String, CrawlProfile>,
) -> SchedResult<()> {
    for entry in schedule {
        if !profiles.contains_key(&entry.profile) {
            return Err(SchedulerError::UnknownProfile(entry.profile.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_schedule_and_profiles() {
        let dir = tempfile::tempdir().unwrap();

        let schedule_path = dir.path().join("schedule.toml");
        std::fs::write(
            &schedule_path,
            r#"
[[domains]]
domain = "example.com"
profile = "default"
cadence_seconds = 3600
max_articles = 50
"#,
        )
        .unwrap();

        let profiles_dir = dir.path().join("profiles");
        std::fs::create_dir(&profiles_dir).unwrap();
        let mut f = std::fs::File::create(profiles_dir.join("default.toml")).unwrap();
        writeln!(f, "name = \"default\"\nmax_links = 80").unwrap();

        let schedule = load_schedule(&schedule_path).unwrap();
        let profiles = load_profiles(&profiles_dir).unwrap();
        assert_eq!(schedule.len(), 1);
        assert_eq!(profiles["default"].max_links, 80);
        assert!(validate(&schedule, &profiles).is_ok());
    }

    #[test]
    fn test_unknown_profile_rejected() {
        let schedule = vec![ScheduleEntry {
            domain: "example.com".into(),
            profile: "missing".into(),
            cadence_seconds: 3600,
            max_articles: 10,
            last_run: None,
        }];
        let err = validate(&schedule, &HashMap::new()).unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn test_zero_cadence_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schedule.toml");
        std::fs::write(
            &path,
            r#"
[[domains]]
domain = "example.com"
profile = "default"
cadence_seconds = 0
max_articles = 10
"#,
        )
        .unwrap();
        assert!(load_schedule(&path).is_err());
    }
}
