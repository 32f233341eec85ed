//! Page-to-host signal protocol.
//!
//! The in-page scripts emit either tagged console lines
//! (`[LIKE_FOUND]<json>`, `[SELF_HANDLE]<handle>`, ...) or bare JSON web
//! messages with a `type` discriminator. Both arrive on the same channel
//! as opaque strings. Malformed payloads parse to `None` and are dropped
//! by the caller; they are never surfaced as errors.

use serde::Deserialize;
use serde_json::Value;

const ENABLE_LOGS: bool = true;
use crate::log_warn;

/// JSON schema of a found interaction, as emitted by the collector script.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FoundInteraction {
    pub handle: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub status_link: String,
    #[serde(default)]
    pub snippet: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageSignal {
    /// The page layer confirmed the controlling account's own handle.
    SelfHandle(String),
    LikeFound(FoundInteraction),
    ReplyFound(FoundInteraction),
    /// Rollup of the current scan pass; may be dropped if stale.
    CollectProgress { found: u32, total: u32 },
    /// A visible post's author matched the remaining target set.
    ReciprocateTarget { handle: String, index: u32 },
    /// The like button was clicked in the page.
    LikeClicked,
    /// Profile-visit scan found a likeable post at this article index.
    ScanHit { index: u32 },
    /// Profile-visit scan saw this many articles, none likeable yet.
    ScanMiss { count: u32 },
    /// Like click was attempted but no button was found.
    LikeMissing,
}

const TAG_SELF_HANDLE: &str = "[SELF_HANDLE]";
const TAG_LIKE_FOUND: &str = "[LIKE_FOUND]";
const TAG_REPLY_FOUND: &str = "[REPLY_FOUND]";
const TAG_COLLECT_PROGRESS: &str = "[COLLECT_PROGRESS]";
const TAG_DEBUG: &str = "[DEBUG]";

/// Parses one raw page message. Returns `None` for debug lines, unknown
/// tags and malformed payloads.
pub fn parse_page_message(raw: &str) -> Option<PageSignal> {
    let msg = raw.trim();
    if msg.is_empty() {
        return None;
    }

    if let Some(handle) = msg.strip_prefix(TAG_SELF_HANDLE) {
        let handle = handle.trim().to_lowercase();
        if handle.is_empty() {
            return None;
        }
        return Some(PageSignal::SelfHandle(handle));
    }

    if let Some(json) = msg.strip_prefix(TAG_LIKE_FOUND) {
        return parse_found(json).map(PageSignal::LikeFound);
    }

    if let Some(json) = msg.strip_prefix(TAG_REPLY_FOUND) {
        return parse_found(json).map(PageSignal::ReplyFound);
    }

    if let Some(json) = msg.strip_prefix(TAG_COLLECT_PROGRESS) {
        let value: Value = match serde_json::from_str(json) {
            Ok(value) => value,
            Err(err) => {
                log_warn!("dropping malformed progress payload: {err}");
                return None;
            }
        };
        let found = value.get("found")?.as_u64()? as u32;
        let total = value.get("total")?.as_u64()? as u32;
        return Some(PageSignal::CollectProgress { found, total });
    }

    if msg.starts_with(TAG_DEBUG) {
        log::debug!("page: {msg}");
        return None;
    }

    // Not a tagged line; try a JSON web message with a discriminator.
    if msg.starts_with('{') {
        return parse_web_message(msg);
    }

    None
}

fn parse_found(json: &str) -> Option<FoundInteraction> {
    match serde_json::from_str::<FoundInteraction>(json) {
        Ok(found) if !found.handle.is_empty() => Some(found),
        Ok(_) => None,
        Err(err) => {
            log_warn!("dropping malformed interaction payload: {err}");
            None
        }
    }
}

fn parse_web_message(msg: &str) -> Option<PageSignal> {
    let value: Value = serde_json::from_str(msg).ok()?;
    match value.get("type")?.as_str()? {
        "reciprocate_target" => {
            let handle = value.get("handle")?.as_str()?.to_lowercase();
            if handle.is_empty() {
                return None;
            }
            let index = value.get("index").and_then(Value::as_u64).unwrap_or(0) as u32;
            Some(PageSignal::ReciprocateTarget { handle, index })
        }
        "like_clicked" => Some(PageSignal::LikeClicked),
        "scan_hit" => {
            let index = value.get("index")?.as_u64()? as u32;
            Some(PageSignal::ScanHit { index })
        }
        "scan_miss" => {
            let count = value.get("count").and_then(Value::as_u64).unwrap_or(0) as u32;
            Some(PageSignal::ScanMiss { count })
        }
        "like_missing" => Some(PageSignal::LikeMissing),
        other => {
            log_warn!("dropping web message with unknown type '{other}'");
            None
        }
    }
}
