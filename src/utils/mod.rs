pub mod logging;

/// Initialize the global logger (reads RUST_LOG env var).
pub fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();
}
