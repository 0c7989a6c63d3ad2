//! Controllers for hypertune CRDs
//!
//! Each controller follows the observe-diff-act loop: read the resource and
//! its children, compute the desired state, write only what changed.

pub mod experiment;
pub mod suggestion;
pub mod trial;

use std::time::Duration;

use kube::runtime::controller::Action;

use crate::Error;

/// Requeue delay after a failed reconcile
///
/// Conflicts retry almost immediately, external-dependency failures back
/// off, and terminal errors wait for a spec change or a slow resync.
pub(crate) fn requeue_for(error: &Error) -> Action {
    if error.is_conflict() {
        Action::requeue(Duration::from_secs(1))
    } else if error.is_retryable() {
        Action::requeue(Duration::from_secs(15))
    } else {
        Action::requeue(Duration::from_secs(300))
    }
}
