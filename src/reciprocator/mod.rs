//! Reciprocation engine: browses the home timeline like a person would
//! and returns likes to the accounts that engaged first.
//!
//! A batch runs as one session. The engine navigates home, then cycles
//! between browsing (scroll gestures, occasional target scans) and
//! resting. When the page reports that a target's post is visible, the
//! engine pauses, waits a reading delay, dispatches the like and holds
//! browsing for the post-like wait before resuming. The session ends
//! when every target has been claimed or on an explicit stop.

pub mod profile;
pub mod state;

use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::browser::{protocol, scripts, BrowserSurface, PageEvent, HOME_URL};
use crate::db::Database;
use crate::events::{AppEvent, BrowseActivity, EventBus};
use crate::models::InteractionKind;
use crate::settings::BrowsingSettings;
use crate::timing::{
    roll_probability, sample_range, sample_scroll_gesture, sample_secs, ScrollGesture,
};

use state::{BrowsePhase, BrowseSession};

const ENABLE_LOGS: bool = true;
use crate::{log_info, log_warn};

/// Reading delay between a target sighting and the like click.
const READ_DELAY_MS: (u64, u64) = (1500, 4000);

/// Floor for loop sleeps so a zeroed setting cannot busy-spin.
const MIN_LOOP_SLEEP: Duration = Duration::from_millis(200);

struct EngineState {
    session: Option<BrowseSession>,
    cancel: Option<CancellationToken>,
}

#[derive(Clone)]
pub struct Reciprocator {
    surface: Arc<dyn BrowserSurface>,
    db: Database,
    events: EventBus,
    settings: Arc<RwLock<BrowsingSettings>>,
    state: Arc<Mutex<EngineState>>,
}

impl Reciprocator {
    pub fn new(
        surface: Arc<dyn BrowserSurface>,
        db: Database,
        events: EventBus,
        settings: BrowsingSettings,
    ) -> Self {
        Self {
            surface,
            db,
            events,
            settings: Arc::new(RwLock::new(settings)),
            state: Arc::new(Mutex::new(EngineState {
                session: None,
                cancel: None,
            })),
        }
    }

    pub fn update_settings(&self, settings: BrowsingSettings) {
        *self.settings.write().unwrap() = settings;
    }

    pub async fn activity(&self) -> BrowseActivity {
        let state = self.state.lock().await;
        match &state.session {
            None => BrowseActivity::Idle,
            Some(session) if session.phase == BrowsePhase::Resting => BrowseActivity::Resting,
            Some(_) => BrowseActivity::Browsing,
        }
    }

    pub async fn is_active(&self) -> bool {
        self.state.lock().await.session.is_some()
    }

    /// Starts a browsing session for `(handle, action_id)` pairs.
    /// Returns `false` without touching the current session when a batch
    /// is already running or the target list is empty.
    pub async fn start_browsing(&self, targets: Vec<(String, String)>) -> bool {
        if targets.is_empty() {
            self.events.status("No reciprocation targets pending");
            return false;
        }

        let count = targets.len();
        {
            let mut state = self.state.lock().await;
            if state.session.is_some() {
                self.events
                    .status("A browsing session is already running");
                return false;
            }
            state.session = Some(BrowseSession::new(targets));
            state.cancel = Some(CancellationToken::new());
        }

        self.surface.navigate(HOME_URL);
        self.events
            .status(format!("Opening home timeline ({count} targets)"));
        true
    }

    /// Convenience start from the ledger's pending records.
    pub async fn start_pending(&self, kind: InteractionKind, limit: usize) -> Result<bool> {
        let pending = self.db.pending(kind).await?;
        let targets = pending
            .into_iter()
            .take(limit)
            .map(|record| (record.user_handle, record.id))
            .collect();
        Ok(self.start_browsing(targets).await)
    }

    /// Ends the session. Pending likes that have been dispatched but not
    /// yet confirmed are abandoned unmarked.
    pub async fn stop_browsing(&self) {
        let had_session = {
            let mut state = self.state.lock().await;
            if let Some(cancel) = state.cancel.take() {
                cancel.cancel();
            }
            state.session.take().is_some()
        };

        if had_session {
            self.events
                .emit(AppEvent::BrowsingStateChanged(BrowseActivity::Idle));
            self.events.status("Browsing stopped");
        }
    }

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

    async fn on_signal(&self, signal: protocol::PageSignal) {
        match signal {
            protocol::PageSignal::ReciprocateTarget { handle, index } => {
                self.on_target_sighted(handle, index).await;
            }
            protocol::PageSignal::LikeClicked => {
                log_info!("like click confirmed by page");
            }
            protocol::PageSignal::LikeMissing => {
                // The target was already claimed; the session moves on.
                self.events
                    .status("Like button not found where expected; continuing");
            }
            // Collector and profile-visit signals are not ours.
            _ => {}
        }
    }

    async fn on_page_loaded(&self, success: bool) {
        let (session_id, cancel) = {
            let mut state = self.state.lock().await;
            let Some(session) = state.session.as_ref() else {
                return;
            };
            if session.phase != BrowsePhase::NavigatingHome {
                return;
            }

            if !success {
                if let Some(cancel) = state.cancel.take() {
                    cancel.cancel();
                }
                state.session = None;
                drop(state);
                self.events
                    .emit(AppEvent::BrowsingStateChanged(BrowseActivity::Idle));
                self.events.status("Home timeline failed to load");
                return;
            }

            let Some(cancel) = state.cancel.clone() else {
                return;
            };
            (session.id, cancel)
        };

        let settle =
            Duration::from_millis(self.settings.read().unwrap().settle_delay_ms.max(1));
        let this = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(settle) => {}
                _ = cancel.cancelled() => return,
            }
            this.begin_browsing(session_id).await;
        });
    }

    async fn begin_browsing(&self, session_id: Uuid) {
        let cancel = {
            let mut state = self.state.lock().await;
            let Some(session) = state.session.as_mut() else {
                return;
            };
            if session.id != session_id || session.phase != BrowsePhase::NavigatingHome {
                return;
            }
            session.phase = BrowsePhase::Browsing;
            let (min, max) = {
                let settings = self.settings.read().unwrap();
                (settings.browse_min_mins, settings.browse_max_mins)
            };
            session.countdown_secs = sample_secs(min * 60, max * 60).as_secs() as i64;
            let Some(cancel) = state.cancel.clone() else {
                return;
            };
            cancel
        };

        self.events
            .emit(AppEvent::BrowsingStateChanged(BrowseActivity::Browsing));
        self.events.status("Browsing timeline");

        self.spawn_scroll_loop(session_id, cancel.clone());
        self.spawn_reveal_loop(session_id, cancel.clone());
        self.spawn_countdown(session_id, cancel);
    }

    async fn on_target_sighted(&self, handle: String, index: u32) {
        let (session_id, action_id, cancel) = {
            let mut state = self.state.lock().await;
            let Some(session) = state.session.as_mut() else {
                return;
            };
            if session.phase != BrowsePhase::Browsing {
                return;
            }
            // Claim before dispatch so a repeated sighting is a no-op.
            let Some(action_id) = session.claim(&handle) else {
                return;
            };
            session.phase = BrowsePhase::LikePause;
            let session_id = session.id;
            let Some(cancel) = state.cancel.clone() else {
                return;
            };
            (session_id, action_id, cancel)
        };

        log_info!("target @{handle} sighted at index {index}");
        let this = self.clone();
        tokio::spawn(async move {
            this.run_like(session_id, handle, action_id, index, cancel)
                .await;
        });
    }

    /// True while the given session is still running its like pause. The
    /// token alone cannot intercept a timer whose sleep and cancellation
    /// become ready in the same poll, so every wakeup in [`Self::run_like`]
    /// re-checks this before acting.
    async fn like_pause_still_current(&self, session_id: Uuid) -> bool {
        let state = self.state.lock().await;
        state
            .session
            .as_ref()
            .map(|session| session.id == session_id && session.phase == BrowsePhase::LikePause)
            .unwrap_or(false)
    }

    async fn run_like(
        &self,
        session_id: Uuid,
        handle: String,
        action_id: String,
        index: u32,
        cancel: CancellationToken,
    ) {
        let read_delay = sample_range(
            Duration::from_millis(READ_DELAY_MS.0),
            Duration::from_millis(READ_DELAY_MS.1),
        );
        tokio::select! {
            _ = tokio::time::sleep(read_delay) => {}
            _ = cancel.cancelled() => return,
        }
        if cancel.is_cancelled() || !self.like_pause_still_current(session_id).await {
            return;
        }

        self.surface
            .execute_script(&scripts::like_by_index_script(index));
        self.events.status(format!("Liking post by @{handle}"));

        let wait = {
            let settings = self.settings.read().unwrap();
            sample_secs(settings.like_wait_min_secs, settings.like_wait_max_secs)
        };
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = cancel.cancelled() => return,
        }
        if cancel.is_cancelled() || !self.like_pause_still_current(session_id).await {
            return;
        }

        if let Err(err) = self.db.set_reciprocated(&action_id, true).await {
            log_warn!("failed to mark {action_id} reciprocated: {err:#}");
        }
        self.events.emit(AppEvent::LikedUser {
            handle: handle.clone(),
            action_id,
        });

        let finished = {
            let mut state = self.state.lock().await;
            let Some(session) = state.session.as_mut() else {
                return;
            };
            if session.phase != BrowsePhase::LikePause {
                return;
            }
            if session.is_complete() {
                if let Some(cancel) = state.cancel.take() {
                    cancel.cancel();
                }
                state.session = None;
                true
            } else {
                session.phase = BrowsePhase::Browsing;
                false
            }
        };

        if finished {
            self.events
                .emit(AppEvent::BrowsingStateChanged(BrowseActivity::Idle));
            self.events.emit(AppEvent::BatchFinished);
            self.events.status("All targets reciprocated");
        }
    }

    fn spawn_scroll_loop(&self, session_id: Uuid, cancel: CancellationToken) {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let wait = {
                    let settings = this.settings.read().unwrap();
                    sample_secs(settings.scroll_min_secs, settings.scroll_max_secs)
                }
                .max(MIN_LOOP_SLEEP);
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = cancel.cancelled() => break,
                }

                let scan_targets = {
                    let state = this.state.lock().await;
                    let Some(session) = state.session.as_ref() else {
                        break;
                    };
                    if session.id != session_id {
                        break;
                    }
                    if session.phase != BrowsePhase::Browsing {
                        continue;
                    }

                    match sample_scroll_gesture() {
                        ScrollGesture::Dwell(pause) => {
                            drop(state);
                            tokio::select! {
                                _ = tokio::time::sleep(pause) => {}
                                _ = cancel.cancelled() => break,
                            }
                            continue;
                        }
                        gesture => {
                            if let Some(delta) = gesture.delta() {
                                this.surface.execute_script(&scripts::scroll_by_script(delta));
                            }
                        }
                    }

                    let scan_probability = this.settings.read().unwrap().scan_probability;
                    if roll_probability(scan_probability) {
                        Some(session.remaining_handles())
                    } else {
                        None
                    }
                };

                if let Some(targets) = scan_targets {
                    if !targets.is_empty() {
                        this.surface
                            .execute_script(&scripts::timeline_scan_script(&targets));
                    }
                }
            }
        });
    }

    fn spawn_reveal_loop(&self, session_id: Uuid, cancel: CancellationToken) {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let wait = {
                    let settings = this.settings.read().unwrap();
                    sample_secs(settings.reveal_min_mins * 60, settings.reveal_max_mins * 60)
                }
                .max(MIN_LOOP_SLEEP);
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = cancel.cancelled() => break,
                }

                let state = this.state.lock().await;
                let Some(session) = state.session.as_ref() else {
                    break;
                };
                if session.id != session_id {
                    break;
                }
                if session.phase == BrowsePhase::Browsing {
                    this.surface.execute_script(&scripts::show_more_script());
                }
            }
        });
    }

    /// One-second ticker that drives the browse/rest cycle. The countdown
    /// freezes during `LikePause` so a long post-like wait never eats the
    /// browsing budget.
    fn spawn_countdown(&self, session_id: Uuid, cancel: CancellationToken) {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    _ = cancel.cancelled() => break,
                }

                let transition = {
                    let mut state = this.state.lock().await;
                    let Some(session) = state.session.as_mut() else {
                        break;
                    };
                    if session.id != session_id {
                        break;
                    }
                    if !matches!(
                        session.phase,
                        BrowsePhase::Browsing | BrowsePhase::Resting
                    ) {
                        continue;
                    }

                    session.countdown_secs -= 1;
                    this.events
                        .emit(AppEvent::SessionCountdown(session.countdown_secs));
                    if session.countdown_secs > 0 {
                        continue;
                    }

                    let settings = this.settings.read().unwrap();
                    if session.phase == BrowsePhase::Browsing {
                        session.phase = BrowsePhase::Resting;
                        session.countdown_secs = sample_secs(
                            settings.rest_min_mins * 60,
                            settings.rest_max_mins * 60,
                        )
                        .as_secs() as i64;
                        BrowseActivity::Resting
                    } else {
                        session.phase = BrowsePhase::Browsing;
                        session.countdown_secs = sample_secs(
                            settings.browse_min_mins * 60,
                            settings.browse_max_mins * 60,
                        )
                        .as_secs() as i64;
                        BrowseActivity::Browsing
                    }
                };

                this.events.emit(AppEvent::BrowsingStateChanged(transition));
                this.events.status(match transition {
                    BrowseActivity::Resting => "Taking a break",
                    _ => "Back to browsing",
                });
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::mock::MockSurface;
    use tempfile::TempDir;
    use tokio::sync::broadcast::error::TryRecvError;

    fn fast_settings() -> BrowsingSettings {
        BrowsingSettings {
            scroll_min_secs: 3600,
            scroll_max_secs: 3600,
            like_wait_min_secs: 0,
            like_wait_max_secs: 0,
            browse_min_mins: 60,
            browse_max_mins: 60,
            rest_min_mins: 60,
            rest_max_mins: 60,
            reveal_min_mins: 60,
            reveal_max_mins: 60,
            scan_probability: 1.0,
            settle_delay_ms: 10,
        }
    }

    fn fixture(settings: BrowsingSettings) -> (TempDir, Arc<MockSurface>, Database, EventBus, Reciprocator) {
        let dir = TempDir::new().unwrap();
        let db = Database::new(dir.path().join("ledger.sqlite3")).unwrap();
        let surface = Arc::new(MockSurface::new());
        let events = EventBus::new();
        let engine = Reciprocator::new(surface.clone(), db.clone(), events.clone(), settings);
        (dir, surface, db, events, engine)
    }

    fn drain(rx: &mut tokio::sync::broadcast::Receiver<AppEvent>) -> Vec<AppEvent> {
        let mut out = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(event) => out.push(event),
                Err(TryRecvError::Empty) => break,
                Err(_) => break,
            }
        }
        out
    }

    async fn wait_for_activity(engine: &Reciprocator, want: BrowseActivity) {
        for _ in 0..200 {
            if engine.activity().await == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("engine never reached {want:?}");
    }

    #[tokio::test]
    async fn empty_targets_are_rejected() {
        let (_dir, surface, _db, _events, engine) = fixture(fast_settings());
        assert!(!engine.start_browsing(vec![]).await);
        assert_eq!(surface.navigation_count(), 0);
        assert!(!engine.is_active().await);
    }

    #[tokio::test]
    async fn second_start_is_rejected_while_active() {
        let (_dir, surface, _db, events, engine) = fixture(fast_settings());
        let mut rx = events.subscribe();

        assert!(engine.start_browsing(vec![("a".into(), "id1".into())]).await);
        drain(&mut rx);
        assert!(!engine.start_browsing(vec![("b".into(), "id2".into())]).await);

        assert_eq!(surface.navigation_count(), 1);
        let emitted = drain(&mut rx);
        assert!(emitted
            .iter()
            .any(|e| matches!(e, AppEvent::StatusMessage(_))));
    }

    #[tokio::test]
    async fn failed_home_load_aborts_session() {
        let (_dir, _surface, _db, events, engine) = fixture(fast_settings());
        let mut rx = events.subscribe();

        engine.start_browsing(vec![("a".into(), "id1".into())]).await;
        drain(&mut rx);
        engine.handle_page_event(PageEvent::LoadFinished(false)).await;

        assert!(!engine.is_active().await);
        let emitted = drain(&mut rx);
        assert!(emitted.contains(&AppEvent::BrowsingStateChanged(BrowseActivity::Idle)));
    }

    #[tokio::test(start_paused = true)]
    async fn target_sighting_likes_and_finishes_batch() {
        let (_dir, surface, db, events, engine) = fixture(fast_settings());
        let mut rx = events.subscribe();

        let record = crate::models::Interaction::new(
            "alice",
            "Alice",
            InteractionKind::Like,
            "2024-01-01T00:00:00Z",
            "",
            "",
        );
        db.insert_interaction(&record).await.unwrap();

        assert!(engine.start_pending(InteractionKind::Like, 10).await.unwrap());
        engine.handle_page_event(PageEvent::LoadFinished(true)).await;
        wait_for_activity(&engine, BrowseActivity::Browsing).await;

        let raw = r#"{"type":"reciprocate_target","handle":"alice","index":2}"#;
        engine.handle_page_event(PageEvent::Message(raw.into())).await;

        for _ in 0..1000 {
            if !engine.is_active().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!engine.is_active().await, "batch should finish after last like");

        assert!(db.pending(InteractionKind::Like).await.unwrap().is_empty());
        let last = surface.last_script().unwrap_or_default();
        assert!(surface.script_count() >= 1);
        let emitted = drain(&mut rx);
        assert!(
            emitted
                .iter()
                .any(|e| matches!(e, AppEvent::LikedUser { handle, .. } if handle == "alice")),
            "{emitted:?} (last script: {last})"
        );
        assert!(emitted.contains(&AppEvent::BatchFinished));
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_sighting_dispatches_once() {
        let (_dir, _surface, db, events, engine) = fixture(fast_settings());
        let mut rx = events.subscribe();

        let mut targets = Vec::new();
        for handle in ["alice", "bob"] {
            let record = crate::models::Interaction::new(
                handle,
                "",
                InteractionKind::Like,
                "2024-01-01T00:00:00Z",
                "",
                "",
            );
            db.insert_interaction(&record).await.unwrap();
            targets.push((handle.to_string(), record.id));
        }
        engine.start_browsing(targets).await;
        engine.handle_page_event(PageEvent::LoadFinished(true)).await;
        wait_for_activity(&engine, BrowseActivity::Browsing).await;

        let raw = r#"{"type":"reciprocate_target","handle":"alice","index":0}"#;
        engine.handle_page_event(PageEvent::Message(raw.into())).await;
        engine.handle_page_event(PageEvent::Message(raw.into())).await;

        for _ in 0..1000 {
            if db.count_pending(InteractionKind::Like).await.unwrap() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let emitted = drain(&mut rx);
        let likes: Vec<_> = emitted
            .iter()
            .filter(|e| matches!(e, AppEvent::LikedUser { handle, .. } if handle == "alice"))
            .collect();
        assert_eq!(likes.len(), 1, "{emitted:?}");
        // Bob is untouched and the session is still running.
        assert!(engine.is_active().await);
    }

    #[tokio::test]
    async fn stop_during_like_pause_abandons_the_like() {
        let mut settings = fast_settings();
        settings.like_wait_min_secs = 3600;
        settings.like_wait_max_secs = 3600;
        let (_dir, _surface, db, events, engine) = fixture(settings);

        let record = crate::models::Interaction::new(
            "alice",
            "Alice",
            InteractionKind::Like,
            "2024-01-01T00:00:00Z",
            "",
            "",
        );
        db.insert_interaction(&record).await.unwrap();

        engine
            .start_browsing(vec![("alice".into(), record.id.clone())])
            .await;
        engine.handle_page_event(PageEvent::LoadFinished(true)).await;
        wait_for_activity(&engine, BrowseActivity::Browsing).await;

        let mut rx = events.subscribe();
        let raw = r#"{"type":"reciprocate_target","handle":"alice","index":0}"#;
        engine.handle_page_event(PageEvent::Message(raw.into())).await;
        engine.stop_browsing().await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!engine.is_active().await);
        assert_eq!(db.count_pending(InteractionKind::Like).await.unwrap(), 1);
        let emitted = drain(&mut rx);
        assert!(!emitted
            .iter()
            .any(|e| matches!(e, AppEvent::LikedUser { .. })));
        assert!(emitted.contains(&AppEvent::BrowsingStateChanged(BrowseActivity::Idle)));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_after_like_dispatch_blocks_the_ledger_write() {
        let mut settings = fast_settings();
        settings.like_wait_min_secs = 600;
        settings.like_wait_max_secs = 600;
        let (_dir, surface, db, events, engine) = fixture(settings);

        let record = crate::models::Interaction::new(
            "alice",
            "Alice",
            InteractionKind::Like,
            "2024-01-01T00:00:00Z",
            "",
            "",
        );
        db.insert_interaction(&record).await.unwrap();

        engine
            .start_browsing(vec![("alice".into(), record.id.clone())])
            .await;
        engine.handle_page_event(PageEvent::LoadFinished(true)).await;
        wait_for_activity(&engine, BrowseActivity::Browsing).await;

        let mut rx = events.subscribe();
        let raw = r#"{"type":"reciprocate_target","handle":"alice","index":3}"#;
        engine.handle_page_event(PageEvent::Message(raw.into())).await;

        // Let the read delay elapse so the like click is dispatched and
        // the post-like timer is already queued.
        for _ in 0..1000 {
            if surface
                .last_script()
                .map(|s| s.contains("articles[3]"))
                .unwrap_or(false)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(surface.last_script().unwrap_or_default().contains("articles[3]"));

        engine.stop_browsing().await;

        // Run well past the queued post-like wait; the fired timer must
        // not mark the ledger or emit after stop returned.
        tokio::time::sleep(Duration::from_secs(700)).await;
        assert!(!engine.is_active().await);
        assert_eq!(db.count_pending(InteractionKind::Like).await.unwrap(), 1);
        let emitted = drain(&mut rx);
        assert!(
            !emitted.iter().any(|e| matches!(e, AppEvent::LikedUser { .. })),
            "{emitted:?}"
        );
    }

    #[tokio::test]
    async fn stop_when_idle_is_a_quiet_no_op() {
        let (_dir, _surface, _db, events, engine) = fixture(fast_settings());
        let mut rx = events.subscribe();
        engine.stop_browsing().await;
        assert!(drain(&mut rx).is_empty());
    }
}
