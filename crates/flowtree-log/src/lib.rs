//! Text logging for the flowtree crates.
//!
//! * `trace`: spammy things, emitted for every propagated event.
//! * `debug`: step construction, subscription wiring.
//! * `info`: pipeline lifecycle (creation, disposal).
//! * `warn`: best-effort skips (a `removed`/`modified` that targets a row that
//!   isn't in the materialized tree).
//! * `error`: contract violations that could not be turned into a panic at
//!   the call site.
//!
//! The `warn_once` etc. macros de-duplicate repeated identical messages, which
//! matters here since a misbehaving step graph can otherwise flood the log
//! with the same "Path references unknown item" warning on every event.

pub use log::{debug, error, info, trace, warn};
pub use log::{Level, LevelFilter};
pub use log_once::{debug_once, error_once, info_once, trace_once, warn_once};

/// Installs a simple stderr logger driven by `RUST_LOG`, defaulting to `info`.
///
/// Idempotent: safe to call multiple times (e.g. once per `#[test]`).
#[cfg(feature = "setup")]
pub fn setup_native_logging() {
    use std::sync::Once;
    static START: Once = Once::new();
    START.call_once(|| {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .is_test(cfg!(test))
            .try_init()
            .ok();
    });
}
