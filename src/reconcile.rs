//! Read-side drift correction.
//!
//! There is no daemon watching apps, so a supervisor killed from outside the
//! tool (or lost to a reboot) leaves its record at `running`. Every read
//! passes through [`reconcile`] to catch that.

use crate::app::{App, AppStatus};
use crate::probe::ProcessProbe;

/// Correct a stale `running` record whose PID is gone.
///
/// Returns `true` when the record was changed and should be persisted. A
/// recorded exit code of 0 means the app had already succeeded.
pub fn reconcile(app: &mut App, probe: &dyn ProcessProbe) -> bool {
    if app.status != AppStatus::Running || probe.pid_exists(app.pid) {
        return false;
    }

    app.status = if app.exit_code == Some(0) {
        AppStatus::Success
    } else {
        AppStatus::Failed
    };
    tracing::debug!(
        name = %app.name,
        pid = app.pid,
        status = %app.status,
        "corrected stale running record"
    );
    true
}
