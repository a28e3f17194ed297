//! # Session orchestration
//!
//! ```text
//!                 initialize_loopback ──► Loopback ─┐
//!  Uninitialized ─ initialize_as_server / _host ──► Server ───┼─ stop() ──► Stopped
//!                 initialize_as_client / _guest ─► Client ───┘
//! ```
//!
//! A [`SessionOrchestrator`] owns every collaborator of one session, picks
//! the mode loop in [`run`](SessionOrchestrator::run) and tears everything
//! down in [`stop`](SessionOrchestrator::stop).
//!
//! | Module         | Purpose                                         |
//! |----------------|-------------------------------------------------|
//! | `config`       | `SessionConfig`, `CodecKind`                    |
//! | `factory`      | `CollaboratorFactory`, `SyntheticCollaborators` |
//! | `orchestrator` | State machine and mode loops                    |
//! | `stats`        | `SessionStats`, EWMA helper                     |

pub mod config;
pub mod factory;
pub mod orchestrator;
pub mod stats;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;

use crate::pipeline::InputEvent;

pub use config::{CodecKind, SessionConfig};
pub use factory::{CollaboratorFactory, SyntheticCollaborators};
pub use orchestrator::SessionOrchestrator;
pub use stats::{Ewma, SessionStats, StageTimings};

// ── SessionState ─────────────────────────────────────────────────

/// Lifecycle of a session. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Uninitialized,
    Loopback,
    Server,
    Client,
    Stopped,
}

impl SessionState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Loopback => "loopback",
            Self::Server => "server",
            Self::Client => "client",
            Self::Stopped => "stopped",
        }
    }

    /// `true` for the three states `run` accepts.
    pub fn is_runnable(self) -> bool {
        matches!(self, Self::Loopback | Self::Server | Self::Client)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── StopHandle ───────────────────────────────────────────────────

/// Asks a running session to return from `run`. Cheap to clone and safe to
/// trigger from any thread, e.g. a Ctrl-C handler.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

// ── InputHandle ──────────────────────────────────────────────────

/// Queues input events for a client session to forward to its server.
#[derive(Debug, Clone)]
pub struct InputHandle(Sender<InputEvent>);

impl InputHandle {
    pub(crate) fn new(tx: Sender<InputEvent>) -> Self {
        Self(tx)
    }

    /// `false` once the session is gone.
    pub fn send(&self, event: InputEvent) -> bool {
        self.0.send(event).is_ok()
    }
}
