//! Profile-visit reciprocation: open a target's profile, hunt down a
//! likeable post and like it, then move to the next target.
//!
//! This is the direct alternative to timeline browsing. It is faster and
//! deterministic per target, at the cost of a more mechanical footprint,
//! so every phase transition still goes through the sampled delays.

use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::browser::{profile_url, protocol, scripts, BrowserSurface, PageEvent};
use crate::db::Database;
use crate::events::{AppEvent, EventBus};
use crate::settings::BrowsingSettings;
use crate::timing::{sample_centered, sample_range, sample_secs};

const ENABLE_LOGS: bool = true;
use crate::{log_info, log_warn};

/// Scroll-and-rescan passes before a profile is declared unlikeable.
const MAX_SCROLL_ATTEMPTS: u32 = 15;

/// Reading delay between a scan hit and the like click.
const READ_DELAY_MS: (u64, u64) = (1500, 4000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VisitPhase {
    NavigatingToProfile,
    WaitingForTimeline,
    ScanningPosts,
    ScrollingDown,
    ClickingLike,
    WaitingAfterLike,
}

struct VisitJob {
    id: Uuid,
    handle: String,
    action_id: String,
    phase: VisitPhase,
    scroll_attempts: u32,
}

struct VisitorState {
    job: Option<VisitJob>,
    queue: VecDeque<(String, String)>,
    cancel: Option<CancellationToken>,
}

#[derive(Clone)]
pub struct ProfileVisitor {
    surface: Arc<dyn BrowserSurface>,
    db: Database,
    events: EventBus,
    settings: Arc<RwLock<BrowsingSettings>>,
    state: Arc<Mutex<VisitorState>>,
}

impl ProfileVisitor {
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
            state: Arc::new(Mutex::new(VisitorState {
                job: None,
                queue: VecDeque::new(),
                cancel: None,
            })),
        }
    }

    pub fn update_settings(&self, settings: BrowsingSettings) {
        *self.settings.write().unwrap() = settings;
    }

    pub async fn is_active(&self) -> bool {
        self.state.lock().await.job.is_some()
    }

    /// Visits each `(handle, action_id)` target in turn. Returns `false`
    /// when a queue is already being worked or `targets` is empty.
    pub async fn run_queue(&self, targets: Vec<(String, String)>) -> bool {
        if targets.is_empty() {
            self.events.status("No reciprocation targets pending");
            return false;
        }

        let mut state = self.state.lock().await;
        if state.job.is_some() {
            self.events.status("Profile visits already running");
            return false;
        }

        state.cancel = Some(CancellationToken::new());
        state.queue = targets
            .into_iter()
            .map(|(handle, action_id)| (handle.to_lowercase(), action_id))
            .collect();
        self.start_next_locked(&mut state);
        true
    }

    /// Convenience start from the ledger's pending records.
    pub async fn run_pending(
        &self,
        kind: crate::models::InteractionKind,
        limit: usize,
    ) -> anyhow::Result<bool> {
        let pending = self.db.pending(kind).await?;
        let targets = pending
            .into_iter()
            .take(limit)
            .map(|record| (record.user_handle, record.id))
            .collect();
        Ok(self.run_queue(targets).await)
    }

    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if let Some(cancel) = state.cancel.take() {
            cancel.cancel();
        }
        let was_active = state.job.take().is_some();
        state.queue.clear();
        drop(state);
        if was_active {
            self.events.status("Profile visits stopped");
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
            protocol::PageSignal::ScanHit { index } => self.on_scan_hit(index).await,
            protocol::PageSignal::ScanMiss { count } => self.on_scan_miss(count).await,
            protocol::PageSignal::LikeClicked => self.on_like_clicked().await,
            protocol::PageSignal::LikeMissing => {
                self.fail_current("like button disappeared before the click")
                    .await;
            }
            _ => {}
        }
    }

    async fn on_page_loaded(&self, success: bool) {
        let (job_id, cancel) = {
            let mut state = self.state.lock().await;
            let Some(job) = state.job.as_mut() else {
                return;
            };
            if job.phase != VisitPhase::NavigatingToProfile {
                return;
            }
            if !success {
                drop(state);
                self.fail_current("profile failed to load").await;
                return;
            }
            job.phase = VisitPhase::WaitingForTimeline;
            let Some(cancel) = state.cancel.clone() else {
                return;
            };
            (job.id, cancel)
        };

        let settle =
            Duration::from_millis(self.settings.read().unwrap().settle_delay_ms.max(1));
        let this = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(settle) => {}
                _ = cancel.cancelled() => return,
            }
            let mut state = this.state.lock().await;
            let Some(job) = state.job.as_mut() else {
                return;
            };
            if job.id != job_id || job.phase != VisitPhase::WaitingForTimeline {
                return;
            }
            job.phase = VisitPhase::ScanningPosts;
            this.surface.execute_script(&scripts::profile_scan_script());
        });
    }

    async fn on_scan_hit(&self, index: u32) {
        let cancel = {
            let mut state = self.state.lock().await;
            let Some(job) = state.job.as_mut() else {
                return;
            };
            if job.phase != VisitPhase::ScanningPosts {
                return;
            }
            log_info!("likeable post at index {index} on @{}", job.handle);
            job.phase = VisitPhase::ClickingLike;
            let Some(cancel) = state.cancel.clone() else {
                return;
            };
            cancel
        };

        let this = self.clone();
        tokio::spawn(async move {
            let read_delay = sample_range(
                Duration::from_millis(READ_DELAY_MS.0),
                Duration::from_millis(READ_DELAY_MS.1),
            );
            tokio::select! {
                _ = tokio::time::sleep(read_delay) => {}
                _ = cancel.cancelled() => return,
            }
            if cancel.is_cancelled() {
                return;
            }
            let state = this.state.lock().await;
            let Some(job) = state.job.as_ref() else {
                return;
            };
            if job.phase != VisitPhase::ClickingLike {
                return;
            }
            this.surface.execute_script(&scripts::profile_like_script());
        });
    }

    async fn on_scan_miss(&self, seen: u32) {
        let (job_id, cancel) = {
            let mut state = self.state.lock().await;
            let Some(job) = state.job.as_mut() else {
                return;
            };
            if job.phase != VisitPhase::ScanningPosts {
                return;
            }
            if job.scroll_attempts >= MAX_SCROLL_ATTEMPTS {
                drop(state);
                self.fail_current("no likeable post found").await;
                return;
            }
            job.scroll_attempts += 1;
            job.phase = VisitPhase::ScrollingDown;
            log_info!(
                "no likeable post among {seen} on @{}, scrolling (attempt {})",
                job.handle,
                job.scroll_attempts
            );
            let Some(cancel) = state.cancel.clone() else {
                return;
            };
            (job.id, cancel)
        };

        let wait = {
            let settings = self.settings.read().unwrap();
            sample_secs(settings.scroll_min_secs, settings.scroll_max_secs)
        };
        let this = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => return,
            }
            this.surface.execute_script(&scripts::profile_scroll_script());

            // Give the feed a beat to render newly revealed posts.
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(800)) => {}
                _ = cancel.cancelled() => return,
            }
            let mut state = this.state.lock().await;
            let Some(job) = state.job.as_mut() else {
                return;
            };
            if job.id != job_id || job.phase != VisitPhase::ScrollingDown {
                return;
            }
            job.phase = VisitPhase::ScanningPosts;
            this.surface.execute_script(&scripts::profile_scan_script());
        });
    }

    async fn on_like_clicked(&self) {
        let (job_id, handle, action_id, cancel) = {
            let mut state = self.state.lock().await;
            let Some(job) = state.job.as_mut() else {
                return;
            };
            if job.phase != VisitPhase::ClickingLike {
                return;
            }
            job.phase = VisitPhase::WaitingAfterLike;
            let Some(cancel) = state.cancel.clone() else {
                return;
            };
            (job.id, job.handle.clone(), job.action_id.clone(), cancel)
        };

        self.events.status(format!("Liked a post by @{handle}"));
        let wait = {
            let settings = self.settings.read().unwrap();
            sample_secs(settings.like_wait_min_secs, settings.like_wait_max_secs)
        };
        let this = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => return,
            }
            // The sleep and the cancellation can be ready in the same
            // poll; re-check the live job before touching the ledger.
            let still_waiting = {
                let state = this.state.lock().await;
                state
                    .job
                    .as_ref()
                    .map(|job| job.id == job_id && job.phase == VisitPhase::WaitingAfterLike)
                    .unwrap_or(false)
            };
            if cancel.is_cancelled() || !still_waiting {
                return;
            }

            if let Err(err) = this.db.set_reciprocated(&action_id, true).await {
                log_warn!("failed to mark {action_id} reciprocated: {err:#}");
            }
            this.events.emit(AppEvent::LikedUser {
                handle,
                action_id,
            });

            // Center-weighted pause between profile visits.
            let pause = {
                let settings = this.settings.read().unwrap();
                sample_centered(
                    Duration::from_secs(settings.scroll_min_secs),
                    Duration::from_secs(settings.scroll_max_secs),
                )
            };
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = cancel.cancelled() => return,
            }

            let mut state = this.state.lock().await;
            let same_job = state.job.as_ref().map(|job| job.id) == Some(job_id);
            if !same_job {
                return;
            }
            state.job = None;
            this.start_next_locked(&mut state);
        });
    }

    /// Marks the current visit failed and moves on after a short pause.
    async fn fail_current(&self, reason: &str) {
        let cancel = {
            let mut state = self.state.lock().await;
            let Some(job) = state.job.take() else {
                return;
            };
            log_warn!("giving up on @{}: {reason}", job.handle);
            self.events.emit(AppEvent::ReciprocateFailed {
                handle: job.handle,
                reason: reason.to_string(),
            });
            let Some(cancel) = state.cancel.clone() else {
                return;
            };
            cancel
        };

        let pause = {
            let settings = self.settings.read().unwrap();
            sample_centered(
                Duration::from_secs(settings.scroll_min_secs),
                Duration::from_secs(settings.scroll_max_secs),
            )
        };
        let this = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = cancel.cancelled() => return,
            }
            let mut state = this.state.lock().await;
            if state.job.is_some() {
                return;
            }
            this.start_next_locked(&mut state);
        });
    }

    fn start_next_locked(&self, state: &mut VisitorState) {
        let Some((handle, action_id)) = state.queue.pop_front() else {
            if let Some(cancel) = state.cancel.take() {
                cancel.cancel();
            }
            self.events.emit(AppEvent::BatchFinished);
            self.events.status("Profile visits finished");
            return;
        };

        self.surface.navigate(&profile_url(&handle));
        self.events.status(format!("Visiting @{handle}"));
        state.job = Some(VisitJob {
            id: Uuid::new_v4(),
            handle,
            action_id,
            phase: VisitPhase::NavigatingToProfile,
            scroll_attempts: 0,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::mock::MockSurface;
    use crate::models::{Interaction, InteractionKind};
    use tempfile::TempDir;
    use tokio::sync::broadcast::error::TryRecvError;

    fn fast_settings() -> BrowsingSettings {
        BrowsingSettings {
            scroll_min_secs: 0,
            scroll_max_secs: 0,
            like_wait_min_secs: 0,
            like_wait_max_secs: 0,
            settle_delay_ms: 10,
            ..BrowsingSettings::default()
        }
    }

    fn fixture() -> (TempDir, Arc<MockSurface>, Database, EventBus, ProfileVisitor) {
        let dir = TempDir::new().unwrap();
        let db = Database::new(dir.path().join("ledger.sqlite3")).unwrap();
        let surface = Arc::new(MockSurface::new());
        let events = EventBus::new();
        let visitor =
            ProfileVisitor::new(surface.clone(), db.clone(), events.clone(), fast_settings());
        (dir, surface, db, events, visitor)
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

    async fn wait_for_script(surface: &MockSurface, needle: &str) {
        for _ in 0..1000 {
            if surface
                .last_script()
                .map(|s| s.contains(needle))
                .unwrap_or(false)
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no script containing {needle:?} was executed");
    }

    #[tokio::test]
    async fn empty_and_busy_queues_are_rejected() {
        let (_dir, surface, _db, _events, visitor) = fixture();
        assert!(!visitor.run_queue(vec![]).await);
        assert!(visitor.run_queue(vec![("a".into(), "id1".into())]).await);
        assert!(!visitor.run_queue(vec![("b".into(), "id2".into())]).await);
        assert_eq!(surface.navigation_count(), 1);
    }

    #[tokio::test]
    async fn queue_navigates_to_profile_url() {
        let (_dir, surface, _db, _events, visitor) = fixture();
        visitor.run_queue(vec![("Alice".into(), "id1".into())]).await;
        assert_eq!(surface.navigation_count(), 1);
        assert!(visitor.is_active().await);
    }

    #[tokio::test(start_paused = true)]
    async fn full_visit_likes_and_marks_the_ledger() {
        let (_dir, surface, db, events, visitor) = fixture();
        let mut rx = events.subscribe();

        let record = Interaction::new(
            "alice",
            "Alice",
            InteractionKind::Like,
            "2024-01-01T00:00:00Z",
            "",
            "",
        );
        db.insert_interaction(&record).await.unwrap();

        visitor
            .run_queue(vec![("alice".into(), record.id.clone())])
            .await;
        visitor.handle_page_event(PageEvent::LoadFinished(true)).await;
        wait_for_script(&surface, "scan_hit").await;

        visitor
            .handle_page_event(PageEvent::Message(r#"{"type":"scan_hit","index":0}"#.into()))
            .await;
        wait_for_script(&surface, "like_clicked").await;

        visitor
            .handle_page_event(PageEvent::Message(r#"{"type":"like_clicked"}"#.into()))
            .await;
        for _ in 0..300 {
            if !visitor.is_active().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(!visitor.is_active().await);
        assert!(db.pending(InteractionKind::Like).await.unwrap().is_empty());
        let emitted = drain(&mut rx);
        assert!(emitted
            .iter()
            .any(|e| matches!(e, AppEvent::LikedUser { handle, .. } if handle == "alice")));
        assert!(emitted.contains(&AppEvent::BatchFinished));
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_misses_give_up_on_the_profile() {
        let (_dir, surface, db, events, visitor) = fixture();
        let mut rx = events.subscribe();

        let record = Interaction::new(
            "bob",
            "Bob",
            InteractionKind::Like,
            "2024-01-01T00:00:00Z",
            "",
            "",
        );
        db.insert_interaction(&record).await.unwrap();

        visitor
            .run_queue(vec![("bob".into(), record.id.clone())])
            .await;
        visitor.handle_page_event(PageEvent::LoadFinished(true)).await;
        wait_for_script(&surface, "scan_hit").await;

        for _ in 0..=MAX_SCROLL_ATTEMPTS {
            let before = surface.script_count();
            visitor
                .handle_page_event(PageEvent::Message(
                    r#"{"type":"scan_miss","count":4}"#.into(),
                ))
                .await;
            // Each miss triggers a scroll plus a rescan; the final one
            // fails without either.
            for _ in 0..300 {
                if surface.script_count() >= before + 2 || !visitor.is_active().await {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            if !visitor.is_active().await {
                break;
            }
        }

        for _ in 0..300 {
            if !visitor.is_active().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!visitor.is_active().await);
        assert_eq!(db.count_pending(InteractionKind::Like).await.unwrap(), 1);
        let emitted = drain(&mut rx);
        assert!(emitted
            .iter()
            .any(|e| matches!(e, AppEvent::ReciprocateFailed { handle, .. } if handle == "bob")));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_load_moves_to_next_target() {
        let (_dir, surface, _db, events, visitor) = fixture();
        let mut rx = events.subscribe();

        visitor
            .run_queue(vec![
                ("alice".into(), "a1".into()),
                ("bob".into(), "b1".into()),
            ])
            .await;
        visitor.handle_page_event(PageEvent::LoadFinished(false)).await;

        for _ in 0..300 {
            if surface.navigation_count() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(surface.navigation_count(), 2);
        assert!(visitor.is_active().await);
        let emitted = drain(&mut rx);
        assert!(emitted
            .iter()
            .any(|e| matches!(e, AppEvent::ReciprocateFailed { handle, .. } if handle == "alice")));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_post_like_wait_abandons_the_mark() {
        let mut settings = fast_settings();
        settings.like_wait_min_secs = 600;
        settings.like_wait_max_secs = 600;
        let dir = TempDir::new().unwrap();
        let db = Database::new(dir.path().join("ledger.sqlite3")).unwrap();
        let surface = Arc::new(MockSurface::new());
        let events = EventBus::new();
        let visitor = ProfileVisitor::new(surface.clone(), db.clone(), events.clone(), settings);
        let mut rx = events.subscribe();

        let record = Interaction::new(
            "alice",
            "Alice",
            InteractionKind::Like,
            "2024-01-01T00:00:00Z",
            "",
            "",
        );
        db.insert_interaction(&record).await.unwrap();

        visitor
            .run_queue(vec![("alice".into(), record.id.clone())])
            .await;
        visitor.handle_page_event(PageEvent::LoadFinished(true)).await;
        wait_for_script(&surface, "scan_hit").await;
        visitor
            .handle_page_event(PageEvent::Message(r#"{"type":"scan_hit","index":0}"#.into()))
            .await;
        wait_for_script(&surface, "like_clicked").await;
        visitor
            .handle_page_event(PageEvent::Message(r#"{"type":"like_clicked"}"#.into()))
            .await;

        // The post-like timer is queued; stopping now must win over it.
        visitor.stop().await;
        tokio::time::sleep(Duration::from_secs(700)).await;

        assert!(!visitor.is_active().await);
        assert_eq!(db.count_pending(InteractionKind::Like).await.unwrap(), 1);
        let emitted = drain(&mut rx);
        assert!(
            !emitted.iter().any(|e| matches!(e, AppEvent::LikedUser { .. })),
            "{emitted:?}"
        );
    }

    #[tokio::test]
    async fn stop_clears_the_queue() {
        let (_dir, _surface, _db, _events, visitor) = fixture();
        visitor
            .run_queue(vec![
                ("alice".into(), "a1".into()),
                ("bob".into(), "b1".into()),
            ])
            .await;
        visitor.stop().await;
        assert!(!visitor.is_active().await);
        visitor.stop().await;
    }
}
