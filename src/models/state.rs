// Application state (in-memory)
//
// NOTE: This is NOT persisted. It only tracks which pipelines are currently running so
// that a second trigger of the same kind is rejected instead of queued.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::InstallError;
use crate::progress::JobKind;

/// Non-blocking single-flight guard with one independent slot per [`JobKind`].
///
/// Cloning shares the slots.
#[derive(Debug, Clone, Default)]
pub struct InstallGuard {
    slots: Arc<Slots>,
}

#[derive(Debug, Default)]
struct Slots {
    init: AtomicBool,
    download: AtomicBool,
}

impl Slots {
    fn slot(&self, kind: JobKind) -> &AtomicBool {
        match kind {
            JobKind::Init => &self.init,
            JobKind::Download => &self.download,
        }
    }
}

impl InstallGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot for `kind`, failing immediately if it is already held.
    pub fn try_enter(&self, kind: JobKind) -> Result<GuardTicket, InstallError> {
        self.slots
            .slot(kind)
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| InstallError::AlreadyInProgress(kind))?;

        log::debug!(
            "[PHASE: guard] [STEP: enter] slot acquired (kind={:?})",
            kind
        );
        Ok(GuardTicket {
            slots: Arc::clone(&self.slots),
            kind,
        })
    }

    pub fn is_in_progress(&self, kind: JobKind) -> bool {
        self.slots.slot(kind).load(Ordering::SeqCst)
    }

    pub fn any_in_progress(&self) -> Option<JobKind> {
        JobKind::ALL
            .into_iter()
            .find(|kind| self.is_in_progress(*kind))
    }
}

/// Proof of holding a guard slot. Dropping it frees the slot, whatever the exit path.
#[derive(Debug)]
#[must_use = "the slot is released as soon as the ticket is dropped"]
pub struct GuardTicket {
    slots: Arc<Slots>,
    kind: JobKind,
}

impl Drop for GuardTicket {
    fn drop(&mut self) {
        self.slots.slot(self.kind).store(false, Ordering::SeqCst);
        log::debug!(
            "[PHASE: guard] [STEP: exit] slot released (kind={:?})",
            self.kind
        );
    }
}
