//! Bridge lifecycle state shared between the orchestrator and the health reporter.
//!
//! Only the orchestrator writes. Readers (health checks) may run on any
//! thread, so everything is atomic.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Lifecycle phase of a bridge run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BridgePhase {
    /// Process and transport being initialized
    #[default]
    Starting,
    /// Process spawned and transport bound; relaying messages
    Ready,
    /// Tearing down transport and process
    ShuttingDown,
    /// Run finished, exit status decided
    Terminated,
}

impl BridgePhase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Starting,
            1 => Self::Ready,
            2 => Self::ShuttingDown,
            _ => Self::Terminated,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Starting => 0,
            Self::Ready => 1,
            Self::ShuttingDown => 2,
            Self::Terminated => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::ShuttingDown => "shutting_down",
            Self::Terminated => "terminated",
        }
    }
}

impl std::fmt::Display for BridgePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default)]
pub struct BridgeState {
    phase: AtomicU8,
    process_alive: AtomicBool,
}

/// Point-in-time view of bridge state for health checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSnapshot {
    pub phase: BridgePhase,
    pub process_alive: bool,
}

impl HealthSnapshot {
    pub fn is_ready(&self) -> bool {
        self.phase == BridgePhase::Ready
    }
}

impl BridgeState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> BridgePhase {
        BridgePhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn is_ready(&self) -> bool {
        self.phase() == BridgePhase::Ready
    }

    pub fn is_process_alive(&self) -> bool {
        self.process_alive.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            phase: self.phase(),
            process_alive: self.is_process_alive(),
        }
    }

    pub(crate) fn mark_process_started(&self) {
        self.process_alive.store(true, Ordering::Release);
    }

    /// Child exited or was killed.
    pub(crate) fn mark_process_gone(&self) {
        self.process_alive.store(false, Ordering::Release);
    }

    /// STARTING → READY. Returns false if shutdown already began.
    pub(crate) fn mark_ready(&self) -> bool {
        self.phase
            .compare_exchange(
                BridgePhase::Starting.as_u8(),
                BridgePhase::Ready.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Enter SHUTTING_DOWN. Only the first caller gets `true` and owns teardown.
    pub(crate) fn begin_shutdown(&self) -> bool {
        let mut current = self.phase.load(Ordering::Acquire);
        loop {
            match BridgePhase::from_u8(current) {
                BridgePhase::ShuttingDown | BridgePhase::Terminated => return false,
                BridgePhase::Starting | BridgePhase::Ready => {}
            }
            match self.phase.compare_exchange_weak(
                current,
                BridgePhase::ShuttingDown.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn mark_terminated(&self) {
        self.phase
            .store(BridgePhase::Terminated.as_u8(), Ordering::Release);
    }
}
