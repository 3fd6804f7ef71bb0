use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{FixedOffset, Offset, Utc};
use jobsync_core::TabSpec;
use jobsync_storage::LINE_NOTIFY_URL;
use serde::Deserialize;
use tracing::warn;

/// Asia/Bangkok, where the portal's users read the sheet.
pub const DEFAULT_UTC_OFFSET_MINUTES: i32 = 7 * 60;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub capture_dir: PathBuf,
    pub store_path: PathBuf,
    pub log_path: PathBuf,
    pub utc_offset_minutes: i32,
    pub line_notify_token: String,
    pub line_notify_url: String,
    pub sheet_url: Option<String>,
}

impl SyncConfig {
    /// Defaults relative to a workspace root, without reading the environment.
    pub fn for_workspace(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            capture_dir: root.join("captures"),
            store_path: root.join("data").join("master_data.json"),
            log_path: root.join("data").join("sync_logs.json"),
            utc_offset_minutes: DEFAULT_UTC_OFFSET_MINUTES,
            line_notify_token: String::new(),
            line_notify_url: LINE_NOTIFY_URL.to_string(),
            sheet_url: None,
            workspace_root: root,
        }
    }

    pub fn from_env() -> Self {
        let root = std::env::var("JOBSYNC_WORKSPACE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        let defaults = Self::for_workspace(root);
        Self {
            capture_dir: std::env::var("JOBSYNC_CAPTURE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.capture_dir),
            store_path: std::env::var("JOBSYNC_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.store_path),
            log_path: std::env::var("JOBSYNC_LOG_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.log_path),
            utc_offset_minutes: std::env::var("JOBSYNC_UTC_OFFSET_MINUTES")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(DEFAULT_UTC_OFFSET_MINUTES),
            line_notify_token: std::env::var("LINE_NOTIFY_TOKEN")
                .map(|v| v.trim().to_string())
                .unwrap_or_default(),
            line_notify_url: std::env::var("LINE_NOTIFY_URL")
                .unwrap_or(defaults.line_notify_url),
            sheet_url: std::env::var("JOBSYNC_SHEET_URL")
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
            workspace_root: defaults.workspace_root,
        }
    }

    pub fn offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).unwrap_or_else(|| {
            warn!(minutes = self.utc_offset_minutes, "invalid UTC offset; using UTC");
            Utc.fix()
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TabRegistry {
    pub tabs: Vec<TabConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TabConfig {
    pub tag: u32,
    pub display_name: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl TabRegistry {
    pub fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join("tabs.yaml");
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text)?;
        registry.validate()?;
        Ok(registry)
    }

    fn validate(&self) -> Result<()> {
        let mut tags = HashSet::new();
        let mut names = HashSet::new();
        for tab in &self.tabs {
            if tab.display_name.trim().is_empty() {
                bail!("tab {} has an empty display_name", tab.tag);
            }
            if !tags.insert(tab.tag) {
                bail!("tab {} is listed twice", tab.tag);
            }
            if !names.insert(tab.display_name.trim()) {
                bail!("display_name {:?} is used by more than one tab", tab.display_name);
            }
        }
        Ok(())
    }

    /// Enabled tabs in priority order (the order they are listed in).
    pub fn enabled_tabs(&self) -> Vec<TabSpec> {
        self.tabs
            .iter()
            .filter(|t| t.enabled)
            .map(|t| TabSpec {
                tag: t.tag,
                display_name: t.display_name.trim().to_string(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_keeps_listed_order_and_skips_disabled_tabs() {
        let registry = TabRegistry::from_yaml(
            r#"
tabs:
  - tag: 13
    display_name: New_Jobs_Other_Centers
  - tag: 8
    display_name: New_Jobs_In_House
    enabled: false
  - tag: 7
    display_name: In_Progress_In_House
"#,
        )
        .unwrap();
        let tags: Vec<u32> = registry.enabled_tabs().iter().map(|t| t.tag).collect();
        assert_eq!(tags, vec![13, 7]);
    }

    #[test]
    fn duplicate_tags_are_rejected() {
        let err = TabRegistry::from_yaml(
            "tabs:\n  - tag: 1\n    display_name: A\n  - tag: 1\n    display_name: B\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("listed twice"));
    }

    #[test]
    fn workspace_defaults_point_inside_the_root() {
        let config = SyncConfig::for_workspace("/srv/jobsync");
        assert_eq!(config.store_path, PathBuf::from("/srv/jobsync/data/master_data.json"));
        assert_eq!(config.offset(), FixedOffset::east_opt(7 * 3600).unwrap());
    }
}
