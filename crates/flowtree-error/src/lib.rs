//! Helpers for error handling.

/// Format an error, including its chain of sources.
///
/// Always use this when displaying an error that might be wrapping another
/// one (e.g. anything coming out of a [`thiserror`]-derived enum) — the
/// default `Display` impl only shows the outermost message.
pub fn format(error: &dyn std::error::Error) -> String {
    let mut string = error.to_string();
    for source in std::iter::successors(error.source(), |error| error.source()) {
        string.push_str(" -> ");
        string.push_str(&source.to_string());
    }
    string
}
