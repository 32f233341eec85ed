//! Discovery engine: harvests like/reply notifications from the
//! notification page into ledger records.
//!
//! The collector owns its browser surface exclusively. It injects the
//! extraction script once per page load, nudges the page to reveal more
//! content on a poll ticker, and treats every inbound page message as
//! untrusted: malformed payloads are dropped, and a record without a
//! page timestamp is discarded because the timestamp anchors the dedup
//! key.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::browser::{protocol, scripts, BrowserSurface, PageEvent, NOTIFICATIONS_URL};
use crate::db::Database;
use crate::events::{AppEvent, EventBus};
use crate::models::{Interaction, InteractionKind};
use crate::settings::CollectorSettings;
use crate::timing::sample_secs;

const ENABLE_LOGS: bool = true;
use crate::{log_info, log_warn};

struct CollectorState {
    collecting: bool,
    script_injected: bool,
    self_handle: Option<String>,
    cancel: Option<CancellationToken>,
}

impl CollectorState {
    fn new() -> Self {
        Self {
            collecting: false,
            script_injected: false,
            self_handle: None,
            cancel: None,
        }
    }
}

#[derive(Clone)]
pub struct NotificationCollector {
    surface: Arc<dyn BrowserSurface>,
    db: Database,
    events: EventBus,
    settings: Arc<RwLock<CollectorSettings>>,
    state: Arc<Mutex<CollectorState>>,
}

impl NotificationCollector {
    pub fn new(
        surface: Arc<dyn BrowserSurface>,
        db: Database,
        events: EventBus,
        settings: CollectorSettings,
    ) -> Self {
        Self {
            surface,
            db,
            events,
            settings: Arc::new(RwLock::new(settings)),
            state: Arc::new(Mutex::new(CollectorState::new())),
        }
    }

    pub fn update_settings(&self, settings: CollectorSettings) {
        *self.settings.write().unwrap() = settings;
    }

    pub async fn is_collecting(&self) -> bool {
        self.state.lock().await.collecting
    }

    /// Idempotent start: a second call while running is a no-op.
    pub async fn start(&self) -> Result<()> {
        // Pick up a previously confirmed self handle before going live so
        // exclusion works from the first message.
        let stored_self = self.db.self_handle().await.unwrap_or(None);

        {
            let mut state = self.state.lock().await;
            if state.collecting {
                return Ok(());
            }
            state.collecting = true;
            if state.self_handle.is_none() {
                state.self_handle = stored_self;
            }

            let cancel = CancellationToken::new();
            state.cancel = Some(cancel.clone());

            self.spawn_poll_loop(cancel.clone());
            if self.settings.read().unwrap().auto_refresh {
                self.spawn_refresh_loop(cancel);
            }

            self.inject_locked(&mut state);
        }

        self.events.emit(AppEvent::CollectingStateChanged(true));
        self.events.status("Collection started");
        Ok(())
    }

    /// Idempotent stop: cancels the poll ticker and marks the extractor
    /// for reinjection on the next start.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock().await;
            if !state.collecting {
                return;
            }
            state.collecting = false;
            state.script_injected = false;
            if let Some(cancel) = state.cancel.take() {
                cancel.cancel();
            }
        }

        self.events.emit(AppEvent::CollectingStateChanged(false));
        self.events.status("Collection stopped");
    }

    /// Entry point for all events from the discovery surface, processed
    /// in arrival order.
    pub async fn handle_page_event(&self, event: PageEvent) {
        match event {
            PageEvent::LoadFinished(success) => self.on_page_loaded(success).await,
            PageEvent::Message(raw) => {
                let Some(signal) = protocol::parse_page_message(&raw) else {
                    return;
                };
                self.on_signal(signal).await;
            }
        }
    }

    async fn on_page_loaded(&self, success: bool) {
        let (cancel, settle) = {
            let mut state = self.state.lock().await;
            if !state.collecting || !success {
                return;
            }
            // Navigation wiped the page context; reinject after the page
            // settles.
            state.script_injected = false;
            let Some(cancel) = state.cancel.clone() else {
                return;
            };
            let settle = Duration::from_millis(self.settings.read().unwrap().settle_delay_ms);
            (cancel, settle)
        };

        let this = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(settle) => {}
                _ = cancel.cancelled() => return,
            }
            let mut state = this.state.lock().await;
            if state.collecting {
                this.inject_locked(&mut state);
            }
        });
    }

    async fn on_signal(&self, signal: protocol::PageSignal) {
        match signal {
            protocol::PageSignal::SelfHandle(handle) => self.on_self_handle(handle).await,
            protocol::PageSignal::LikeFound(found) => {
                self.on_found(InteractionKind::Like, found).await
            }
            protocol::PageSignal::ReplyFound(found) => {
                self.on_found(InteractionKind::Reply, found).await
            }
            protocol::PageSignal::CollectProgress { found, total } => {
                self.events.status(format!(
                    "Collecting... {found} new this pass, {total} total"
                ));
            }
            // Reciprocation signals belong to the other surface.
            _ => {}
        }
    }

    async fn on_self_handle(&self, handle: String) {
        {
            let mut state = self.state.lock().await;
            if state.self_handle.as_deref() == Some(handle.as_str()) {
                return;
            }
            state.self_handle = Some(handle.clone());
        }

        if let Err(err) = self.db.set_self_handle(&handle).await {
            log_warn!("failed to persist self handle: {err:#}");
        }

        // Inference can be confirmed late, so purging already-stored
        // misattributed records is mandatory, not an optimization.
        match self.db.remove_by_handle(&handle).await {
            Ok(removed) if removed > 0 => {
                self.events.emit(AppEvent::SelfRecordsCleaned(removed));
                self.events
                    .status(format!("Cleaned {removed} self records (@{handle})"));
            }
            Ok(_) => {}
            Err(err) => log_warn!("self-record purge failed for @{handle}: {err:#}"),
        }
    }

    async fn on_found(&self, kind: InteractionKind, found: protocol::FoundInteraction) {
        // Timestamp absence is the validity gate: without it the dedup
        // key is meaningless.
        if found.timestamp.is_empty() {
            log_warn!("dropping {} from @{} without timestamp", kind.as_str(), found.handle);
            return;
        }

        let handle = found.handle.to_lowercase();
        {
            let state = self.state.lock().await;
            if state.self_handle.as_deref() == Some(handle.as_str()) {
                return;
            }
        }

        let record = Interaction::new(
            &handle,
            &found.name,
            kind,
            &found.timestamp,
            &found.status_link,
            &found.snippet,
        );

        let inserted = match self.db.insert_interaction(&record).await {
            Ok(inserted) => inserted,
            Err(err) => {
                log_warn!("ledger insert failed for {}: {err:#}", record.id);
                return;
            }
        };

        if !inserted {
            return;
        }

        log_info!(
            "new {} from @{} at {}",
            kind.as_str(),
            record.user_handle,
            record.timestamp
        );
        let name = record.display_name().to_string();
        let timestamp = record.timestamp.clone();
        self.events.emit(match kind {
            InteractionKind::Like => AppEvent::NewLikeCollected { name, timestamp },
            InteractionKind::Reply => AppEvent::NewReplyCollected { name, timestamp },
        });
    }

    fn inject_locked(&self, state: &mut CollectorState) {
        if state.script_injected {
            return;
        }
        self.surface.execute_script(&scripts::collector_script());
        state.script_injected = true;
        self.events.status("Collector script injected");
    }

    fn spawn_poll_loop(&self, cancel: CancellationToken) {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let interval = Duration::from_secs(
                    this.settings.read().unwrap().poll_interval_secs.max(1),
                );
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = cancel.cancelled() => break,
                }

                let state = this.state.lock().await;
                if !state.collecting {
                    break;
                }
                this.surface.execute_script(&scripts::collector_scroll_script());
            }
        });
    }

    fn spawn_refresh_loop(&self, cancel: CancellationToken) {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let (min, max) = {
                    let settings = this.settings.read().unwrap();
                    (settings.refresh_min_secs.max(1), settings.refresh_max_secs)
                };
                let wait = sample_secs(min, max);
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = cancel.cancelled() => break,
                }

                let state = this.state.lock().await;
                if !state.collecting {
                    break;
                }
                this.surface.navigate(NOTIFICATIONS_URL);
                this.events.status("Refreshing notifications page");
            }
        });
    }
}
