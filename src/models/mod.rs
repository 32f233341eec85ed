//! Ledger data model: one row per observed like/reply directed at the
//! controlled account.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum characters kept from a post preview.
pub const SNIPPET_MAX_CHARS: usize = 120;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum InteractionKind {
    Like,
    Reply,
}

impl InteractionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionKind::Like => "like",
            InteractionKind::Reply => "reply",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "like" => Some(InteractionKind::Like),
            "reply" => Some(InteractionKind::Reply),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interaction {
    /// Deterministic composite key, see [`Interaction::make_id`].
    pub id: String,
    /// Lowercase unique identifier of the acting account.
    pub user_handle: String,
    /// Display name; may be empty.
    pub user_name: String,
    pub kind: InteractionKind,
    /// ISO-8601 timestamp as reported by the source page. Never locally
    /// generated: it anchors the dedup key across restarts.
    pub timestamp: String,
    pub post_snippet: String,
    pub status_link: String,
    pub reciprocated: bool,
    /// Local receipt time, bookkeeping only.
    pub collected_at: DateTime<Utc>,
}

impl Interaction {
    /// Composite key: two sightings that agree on handle, kind and page
    /// timestamp are the same record.
    pub fn make_id(handle: &str, kind: InteractionKind, timestamp: &str) -> String {
        format!("{}_{}_{}", handle.to_lowercase(), kind.as_str(), timestamp)
    }

    pub fn new(
        handle: &str,
        name: &str,
        kind: InteractionKind,
        timestamp: &str,
        status_link: &str,
        snippet: &str,
    ) -> Self {
        let user_handle = handle.to_lowercase();
        Self {
            id: Self::make_id(&user_handle, kind, timestamp),
            user_handle,
            user_name: name.to_string(),
            kind,
            timestamp: timestamp.to_string(),
            post_snippet: truncate_snippet(snippet),
            status_link: status_link.to_string(),
            reciprocated: false,
            collected_at: Utc::now(),
        }
    }

    /// Name to show in event payloads: display name when present,
    /// otherwise the handle.
    pub fn display_name(&self) -> &str {
        if self.user_name.is_empty() {
            &self.user_handle
        } else {
            &self.user_name
        }
    }
}

/// Truncates a post preview to [`SNIPPET_MAX_CHARS`] characters and
/// flattens newlines.
pub fn truncate_snippet(text: &str) -> String {
    text.chars()
        .take(SNIPPET_MAX_CHARS)
        .map(|c| if c == '\n' { ' ' } else { c })
        .collect()
}
