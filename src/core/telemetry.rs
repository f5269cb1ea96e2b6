use tracing::Level;

/// Installs a `tracing-subscriber` fmt subscriber at `level`.
///
/// Returns `false` when a global subscriber was already set, which makes it
/// safe to call from every test.
pub fn init_tracing(level: Level) -> bool {
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true)
        .try_init()
        .is_ok()
}
