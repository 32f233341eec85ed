//! Engine configuration with JSON-file persistence.
//!
//! Timing values are ranges, not points: every delay is drawn from its
//! range by the timing policy, so changing a setting takes effect on the
//! next draw without restarting an engine.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf, sync::RwLock};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectorSettings {
    /// Poll ticker that nudges the notification page to reveal more
    /// content.
    pub poll_interval_secs: u64,
    /// Wait after a page load before (re)injecting the collector script,
    /// so client-side rendering can finish.
    pub settle_delay_ms: u64,
    /// Periodically reload the notifications page so the virtualized
    /// feed keeps producing fresh entries.
    pub auto_refresh: bool,
    pub refresh_min_secs: u64,
    pub refresh_max_secs: u64,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 15,
            settle_delay_ms: 2000,
            auto_refresh: true,
            refresh_min_secs: 60,
            refresh_max_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowsingSettings {
    /// Interval between scroll gestures while browsing.
    pub scroll_min_secs: u64,
    pub scroll_max_secs: u64,
    /// Wait after a like is dispatched before browsing resumes.
    pub like_wait_min_secs: u64,
    pub like_wait_max_secs: u64,
    /// Active-browsing phase duration.
    pub browse_min_mins: u64,
    pub browse_max_mins: u64,
    /// Rest phase duration.
    pub rest_min_mins: u64,
    pub rest_max_mins: u64,
    /// Interval between "show new posts" nudges.
    pub reveal_min_mins: u64,
    pub reveal_max_mins: u64,
    /// Chance that a scroll gesture is followed by a target scan.
    pub scan_probability: f64,
    /// Wait after the home timeline loads before browsing begins.
    pub settle_delay_ms: u64,
}

impl Default for BrowsingSettings {
    fn default() -> Self {
        Self {
            scroll_min_secs: 5,
            scroll_max_secs: 15,
            like_wait_min_secs: 60,
            like_wait_max_secs: 180,
            browse_min_mins: 10,
            browse_max_mins: 30,
            rest_min_mins: 15,
            rest_max_mins: 45,
            reveal_min_mins: 3,
            reveal_max_mins: 6,
            scan_probability: 0.6,
            settle_delay_ms: 4000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct UserSettings {
    collector: CollectorSettings,
    browsing: BrowsingSettings,
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<UserSettings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_default()
        } else {
            UserSettings::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn collector(&self) -> CollectorSettings {
        self.data.read().unwrap().collector.clone()
    }

    pub fn browsing(&self) -> BrowsingSettings {
        self.data.read().unwrap().browsing.clone()
    }

    pub fn update_collector(&self, settings: CollectorSettings) -> Result<()> {
        let mut guard = self.data.write().unwrap();
        guard.collector = settings;
        self.persist(&guard)
    }

    pub fn update_browsing(&self, settings: BrowsingSettings) -> Result<()> {
        let mut guard = self.data.write().unwrap();
        guard.browsing = settings;
        self.persist(&guard)
    }

    fn persist(&self, data: &UserSettings) -> Result<()> {
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }
}
