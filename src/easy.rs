//! One transfer attempt as seen by the engine.
//!
//! An [`EasyHandle`] keeps the configuration of the attempt it is about to
//! start, which directions are paused, and the idle timer. It is reused for
//! every attempt of a task; each redirect or authentication retry configures
//! it again.

use std::time::{Duration, Instant};

use crate::{
    engine::{HandleId, PauseState, TransferConfig},
    multi::MultiHandle,
};

pub(crate) struct EasyHandle {
    id: HandleId,
    config: Option<TransferConfig>,
    pause: PauseState,
    timeout: Duration,
    deadline: Option<Instant>,
    added: bool,
}

// ===== impl EasyHandle =====

impl EasyHandle {
    pub(crate) fn new(id: HandleId) -> EasyHandle {
        EasyHandle {
            id,
            config: None,
            pause: PauseState::default(),
            timeout: Duration::ZERO,
            deadline: None,
            added: false,
        }
    }

    #[inline]
    pub(crate) fn id(&self) -> HandleId {
        self.id
    }

    /// Sets everything the next attempt needs.
    ///
    /// # Panics
    ///
    /// Panics while the previous attempt is still added to the multi handle.
    pub(crate) fn configure(&mut self, config: TransferConfig, timeout: Duration) {
        assert!(!self.added, "easy handle configured while its transfer runs");
        self.config = Some(config);
        self.pause = PauseState::default();
        self.timeout = timeout;
    }

    /// Hands the configuration to the multi handle when it adds the attempt.
    pub(crate) fn take_config(&mut self) -> Option<TransferConfig> {
        self.config.take()
    }

    #[inline]
    pub(crate) fn is_added(&self) -> bool {
        self.added
    }

    pub(crate) fn set_added(&mut self, added: bool) {
        self.added = added;
    }

    #[inline]
    pub(crate) fn pause(&self) -> PauseState {
        self.pause
    }

    /// Notes a pause the engine applied itself after a callback refused data.
    pub(crate) fn record_pause(&mut self, pause: PauseState) {
        self.pause = pause;
    }

    /// Pauses or unpauses directions, telling the engine when the attempt runs.
    pub(crate) fn set_pause(&mut self, pause: PauseState, multi: &mut MultiHandle) {
        if self.pause == pause {
            return;
        }
        log::trace!("{:?} pause {:?} -> {:?}", self.id, self.pause, pause);
        self.pause = pause;
        if self.added {
            multi.set_pause(self.id, pause);
        }
    }

    /// Restarts the idle timer. Called on every callback that moved data.
    pub(crate) fn arm_timeout(&mut self) {
        self.deadline = Some(Instant::now() + self.timeout);
    }

    pub(crate) fn disarm_timeout(&mut self) {
        self.deadline = None;
    }

    #[inline]
    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub(crate) fn is_timed_out(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= now)
    }
}

impl std::fmt::Debug for EasyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("EasyHandle")
            .field("id", &self.id)
            .field("pause", &self.pause)
            .field("timeout", &self.timeout)
            .field("added", &self.added)
            .finish()
    }
}
