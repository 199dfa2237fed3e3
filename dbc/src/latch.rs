//! One-shot latches that let local build phases wait on the remote attempt.

use tokio::sync::watch;

/// A gate that opens once and stays open.
#[derive(Debug, Clone)]
pub struct Latch {
    tx: watch::Sender<bool>,
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

impl Latch {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Open the latch. Idempotent.
    pub fn release(&self) {
        self.tx.send_if_modified(|open| {
            let changed = !*open;
            *open = true;
            changed
        });
    }

    pub fn is_released(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the latch is open.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|open| *open).await;
    }
}

/// Latches released when the remote attempt reaches a terminal state.
#[derive(Debug, Clone, Default)]
pub struct BuildPhaseLatches {
    /// Opened once the remote attempt has finished its cleanup.
    pub remote_build_finished: Latch,
    /// Opened once the racing phase may stop waiting on the remote build.
    pub racing_phase_done: Latch,
    /// Opened once the synchronized phase may proceed to its final stage.
    pub synchronized_phase_ready: Latch,
}

impl BuildPhaseLatches {
    pub fn new() -> Self {
        Self::default()
    }

    /// Release every latch so whichever phase is waiting can proceed.
    pub fn release_all(&self) {
        self.remote_build_finished.release();
        self.racing_phase_done.release();
        self.synchronized_phase_ready.release();
    }
}
