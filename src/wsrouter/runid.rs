//! Run-ID format, derivation, and pattern extraction.
//!
//! A run identifier embeds its routing key — the thread identifier — so
//! that any agent output can be routed to the right connection even when
//! the [`registry`](crate::wsrouter::registry) is cold. See
//! [`generate`] and [`extract_thread_id`].
//!
//! # Canonical form
//!
//! ```text
//! thread_<threadId>_run_<timestampMillis>_<randHex8>
//! ```
//!
//! # Example
//!
//! ```
//! use wsrouter::runid;
//!
//! let rid = runid::generate("user_42_session_9", Some("agent_execution"));
//! assert_eq!(runid::extract_thread_id(&rid).as_deref(), Some("user_42_session_9"));
//! assert!(!runid::is_legacy(&rid));
//! assert!(runid::validate(&rid, Some("user_42_session_9")));
//! ```

use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Prefix every canonical run id starts with.
pub const RUN_ID_PREFIX: &str = "thread_";
/// Reserved separator between the embedded thread id and the rest of the run id.
pub const RUN_ID_SEPARATOR: &str = "_run_";
/// Length, in hex characters, of the random suffix.
pub const UNIQUE_ID_LENGTH: usize = 8;

/// Error returned by [`generate`] when `thread_id` cannot be embedded safely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunIdError {
    /// `thread_id` was empty.
    Empty,
    /// `thread_id` contained the reserved separator `_run_`.
    ReservedSequence,
}

impl std::fmt::Display for RunIdError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunIdError::Empty => write!(f, "thread_id cannot be empty"),
            RunIdError::ReservedSequence => {
                write!(f, "thread_id cannot contain reserved sequence '{}'", RUN_ID_SEPARATOR)
            }
        }
    }
}

impl std::error::Error for RunIdError {}

/// Generate a canonical run id embedding `thread_id`.
///
/// `context` is used only for the debug log line (mirrors the original
/// SSOT generator's audit trail) and never appears in the returned string.
///
/// # Errors
///
/// Returns [`RunIdError`] if `thread_id` is empty or contains the reserved
/// `_run_` sequence. Callers that want a plain boolean-failure style can
/// match on `Err` without inspecting the variant.
///
/// # Panics
///
/// Never panics; this function is infallible for valid input.
pub fn try_generate(thread_id: &str, context: Option<&str>) -> Result<String, RunIdError> {
    if thread_id.is_empty() {
        return Err(RunIdError::Empty);
    }
    if thread_id.contains(RUN_ID_SEPARATOR) {
        return Err(RunIdError::ReservedSequence);
    }

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);

    // Entropy carries uniqueness within a millisecond; a fresh v4 UUID's
    // first 8 hex chars are as good a source as any other in this process.
    let suffix = &Uuid::new_v4().simple().to_string()[..UNIQUE_ID_LENGTH];

    let run_id = format!(
        "{}{}{}{}_{}",
        RUN_ID_PREFIX, thread_id, RUN_ID_SEPARATOR, timestamp, suffix
    );

    if log::log_enabled!(log::Level::Debug) {
        let ctx = context.map(|c| format!(" (context: {c})")).unwrap_or_default();
        log::debug!("generated run_id={run_id} for thread_id={thread_id}{ctx}");
    }

    Ok(run_id)
}

/// Panicking convenience wrapper over [`try_generate`].
///
/// Agents almost always call this with a thread id they just created, so a
/// validation failure here is a caller bug rather than a recoverable
/// runtime condition — unlike every other operation in this crate, which
/// never panics or raises to its caller.
pub fn generate(thread_id: &str, context: Option<&str>) -> String {
    try_generate(thread_id, context).expect("invalid thread_id passed to runid::generate")
}

/// Extract the embedded thread id from a run id, if the shape is canonical.
///
/// Returns `None` without panicking for any non-canonical input, including
/// legacy formats and garbage strings.
pub fn extract_thread_id(run_id: &str) -> Option<String> {
    let rest = run_id.strip_prefix(RUN_ID_PREFIX)?;
    let sep_index = rest.find(RUN_ID_SEPARATOR)?;
    let thread_id = &rest[..sep_index];
    if thread_id.is_empty() {
        return None;
    }
    Some(thread_id.to_string())
}

/// True iff `run_id` parses to a canonical form, and — if `expected_thread_id`
/// is supplied — the embedded thread id matches it exactly.
pub fn validate(run_id: &str, expected_thread_id: Option<&str>) -> bool {
    match extract_thread_id(run_id) {
        Some(extracted) => match expected_thread_id {
            Some(expected) => extracted == expected,
            None => true,
        },
        None => false,
    }
}

/// True for any run id that does not parse to the canonical form.
pub fn is_legacy(run_id: &str) -> bool {
    extract_thread_id(run_id).is_none()
}

/// Port of the original SSOT generator's migration helper: wrap a legacy
/// run id's identity into a freshly generated canonical one for the same
/// thread. Intended only for call sites migrating off a legacy scheme —
/// new code should call [`generate`] directly.
pub fn migrate_legacy_run_id(legacy_run_id: &str, thread_id: &str) -> String {
    log::warn!("migrating legacy run_id '{legacy_run_id}' to standard format with thread_id '{thread_id}'");
    generate(thread_id, Some(&format!("migration_from_{legacy_run_id}")))
}
