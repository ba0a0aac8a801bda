//! Fatal-error handling (7): usage errors, assertion failures, transport
//! errors, termination hangs, deserialization failures, and allocation
//! failures all funnel through one `vt_abort` entry point. No error
//! crosses a rank boundary — a rank that hits any of these stops.

use std::sync::atomic::{AtomicBool, Ordering};

static NO_ASSERT_FAIL: AtomicBool = AtomicBool::new(false);
static THROW_ON_ABORT: AtomicBool = AtomicBool::new(false);

/// Wires `vt_no_assert_fail` (6): when set, `vt_assert` logs instead of
/// aborting.
pub fn set_no_assert_fail(value: bool) {
    NO_ASSERT_FAIL.store(value, Ordering::SeqCst);
}

/// Wires `vt_throw_on_abort` (6): when set, usage/assertion failures
/// return a `VtError` through `vt_abort_or_throw` instead of aborting
/// the process.
pub fn set_throw_on_abort(value: bool) {
    THROW_ON_ABORT.store(value, Ordering::SeqCst);
}

#[derive(Debug, Clone)]
pub struct VtError(pub String);

impl std::fmt::Display for VtError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for VtError {}

/// The one fatal-error entry point (7). Prints the message and
/// terminates the process; there is no recovery path from here.
pub fn vt_abort(msg: &str) -> ! {
    eprintln!("vt: fatal: {}", msg);
    std::process::abort();
}

/// Same fatal condition as `vt_abort`, but for usage/assertion failures
/// specifically: honors `vt_throw_on_abort` by returning a `VtError`
/// instead of aborting when it's set (6).
pub fn vt_abort_or_throw(msg: &str) -> Result<(), VtError> {
    if THROW_ON_ABORT.load(Ordering::SeqCst) {
        return Err(VtError(msg.to_string()));
    }
    vt_abort(msg);
}

/// An assertion that downgrades to a logged warning under
/// `vt_no_assert_fail` (6) instead of aborting.
pub fn vt_assert(cond: bool, msg: &str) {
    if cond {
        return;
    }
    if NO_ASSERT_FAIL.load(Ordering::SeqCst) {
        eprintln!("vt: warning: assertion failed: {}", msg);
        return;
    }
    vt_abort(msg);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assert_is_a_noop_when_condition_holds() {
        vt_assert(true, "unreachable");
    }

    #[test]
    fn throw_on_abort_returns_an_error_instead_of_aborting() {
        set_throw_on_abort(true);
        let result = vt_abort_or_throw("usage error");
        set_throw_on_abort(false);
        assert!(result.is_err());
    }
}
