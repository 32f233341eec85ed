//! Host-side boundary to the embedded browser.
//!
//! A surface is one independent page instance: the collector owns one,
//! the reciprocator owns a second, so the two pipelines never contend for
//! the same page. Script execution is fire-and-forget; results flow back
//! asynchronously as [`PageEvent`]s.

pub mod protocol;
pub mod scripts;

/// Commands the engines issue against their page instance.
pub trait BrowserSurface: Send + Sync {
    fn navigate(&self, url: &str);
    fn execute_script(&self, code: &str);
}

/// Events delivered from the page layer to the owning engine, in arrival
/// order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageEvent {
    /// Navigation finished; `true` on success.
    LoadFinished(bool),
    /// Raw payload from the in-page script (console bridge or web
    /// message). Parsed by [`protocol::parse_page_message`].
    Message(String),
}

pub const NOTIFICATIONS_URL: &str = "https://x.com/notifications";
pub const HOME_URL: &str = "https://x.com";

pub fn profile_url(handle: &str) -> String {
    format!("https://x.com/{handle}")
}

#[cfg(test)]
pub mod mock {
    use super::BrowserSurface;
    use std::sync::Mutex;

    /// Records every command for assertions; used wherever a live page
    /// would be.
    #[derive(Default)]
    pub struct MockSurface {
        pub navigations: Mutex<Vec<String>>,
        pub scripts: Mutex<Vec<String>>,
    }

    impl MockSurface {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn navigation_count(&self) -> usize {
            self.navigations.lock().unwrap().len()
        }

        pub fn script_count(&self) -> usize {
            self.scripts.lock().unwrap().len()
        }

        pub fn last_script(&self) -> Option<String> {
            self.scripts.lock().unwrap().last().cloned()
        }
    }

    impl BrowserSurface for MockSurface {
        fn navigate(&self, url: &str) {
            self.navigations.lock().unwrap().push(url.to_string());
        }

        fn execute_script(&self, code: &str) {
            self.scripts.lock().unwrap().push(code.to_string());
        }
    }
}
