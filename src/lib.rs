//! Discovery and reciprocation engine for an embedded-browser social
//! client.
//!
//! The host application owns the browser surfaces and forwards their
//! page events; this crate owns everything behind them: collecting
//! like/reply notifications into a deduplicated ledger, and returning
//! likes through humanized timeline browsing or direct profile visits.

pub mod browser;
pub mod collector;
pub mod db;
pub mod events;
pub mod models;
pub mod reciprocator;
pub mod settings;
pub mod timing;
mod utils;

pub use browser::{BrowserSurface, PageEvent};
pub use collector::NotificationCollector;
pub use db::Database;
pub use events::{AppEvent, BrowseActivity, EventBus};
pub use models::{Interaction, InteractionKind};
pub use reciprocator::{profile::ProfileVisitor, Reciprocator};
pub use settings::{BrowsingSettings, CollectorSettings, SettingsStore};
pub use utils::init_logging;
