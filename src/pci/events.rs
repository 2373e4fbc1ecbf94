//! Commands into the engine, events out of it, and completion plumbing.
//!
//! Commands travel over the engine inbox channel together with a completer;
//! the engine resolves every completer exactly once. Events are delivered on
//! a channel the bridge drains; handlers must not block the engine.

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use crate::protocol::Sal;

/// Terminal outcome of a confirmed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    /// The PCI confirmed the command.
    Success,
    /// Every transmission attempt went unconfirmed.
    Abandoned,
    /// The connection dropped while the command was pending.
    ConnectionLost,
}

/// Outcome of a status request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusOutcome {
    /// The matching level report arrived.
    Report { block_start: u8, levels: Vec<u8> },
    Abandoned,
    ConnectionLost,
}

/// Outcome of an identify request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentifyOutcome {
    Reply { attribute: u8, value: Vec<u8> },
    Abandoned,
    ConnectionLost,
}

/// Outcomes that degrade to a connection-lost arm when the engine is gone.
pub trait TerminalOutcome {
    fn connection_lost() -> Self;
}

impl TerminalOutcome for CommandOutcome {
    fn connection_lost() -> Self {
        CommandOutcome::ConnectionLost
    }
}

impl TerminalOutcome for StatusOutcome {
    fn connection_lost() -> Self {
        StatusOutcome::ConnectionLost
    }
}

impl TerminalOutcome for IdentifyOutcome {
    fn connection_lost() -> Self {
        IdentifyOutcome::ConnectionLost
    }
}

/// Handle for awaiting a command's terminal outcome.
///
/// If the engine goes away before resolving, the outcome degrades to the
/// connection-lost arm rather than hanging the caller.
#[derive(Debug)]
pub struct Completion<T> {
    rx: Receiver<T>,
}

impl<T: TerminalOutcome> Completion<T> {
    pub(crate) fn new() -> (Sender<T>, Self) {
        let (tx, rx) = crossbeam::channel::bounded(1);
        (tx, Completion { rx })
    }

    /// Block until the outcome is known.
    pub fn wait(self) -> T {
        self.rx.recv().unwrap_or_else(|_| T::connection_lost())
    }

    /// Block for at most `timeout`; `None` means still pending.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(T::connection_lost()),
        }
    }

    /// Non-blocking poll.
    pub fn try_wait(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

/// Which operation a confirmed frame belonged to, for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    LightingOn,
    LightingOff,
    LightingRamp,
    LightingTerminateRamp,
    StatusRequest,
    Identify,
    ClockBroadcast,
}

/// Why the engine left the connected state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `close()` was called.
    Closed,
    /// The transport reported end-of-stream or an I/O error.
    TransportClosed { detail: Option<String> },
    /// The PCI never echoed the reset sequence.
    ResetTimeout,
    /// The PCI rejected traffic repeatedly without any good packet between.
    PciErrorFlood,
}

/// Events delivered to the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The PCI answered the reset sequence; the engine is ready.
    Connected,
    Disconnected {
        reason: DisconnectReason,
    },
    LightingOn {
        source_address: u8,
        application: u8,
        group: u8,
    },
    LightingOff {
        source_address: u8,
        application: u8,
        group: u8,
    },
    LightingRamp {
        source_address: u8,
        application: u8,
        group: u8,
        level: u8,
        duration: u16,
    },
    LightingTerminateRamp {
        source_address: u8,
        application: u8,
        group: u8,
    },
    /// A time or date broadcast from another unit.
    ClockUpdate {
        source_address: u8,
        update: Sal,
    },
    /// A unit asked the network for the time.
    ClockRequest {
        source_address: u8,
    },
    Temperature {
        source_address: u8,
        group: u8,
        degrees: u8,
    },
    /// Bulk level report; `changed[i]` is set when group
    /// `block_start + i` now differs from the cached level.
    LevelReport {
        application: u8,
        block_start: u8,
        levels: Vec<u8>,
        changed: Vec<bool>,
    },
    /// A confirmed command ran out of attempts.
    CommandAbandoned {
        op: OperationKind,
    },
}

/// Engine inbox messages.
#[derive(Debug)]
pub(crate) enum Command {
    LightingOn {
        application: u8,
        group: u8,
        respond: Sender<CommandOutcome>,
    },
    LightingOff {
        application: u8,
        group: u8,
        respond: Sender<CommandOutcome>,
    },
    LightingRamp {
        application: u8,
        group: u8,
        level: u8,
        duration_code: u8,
        respond: Sender<CommandOutcome>,
    },
    LightingTerminateRamp {
        application: u8,
        group: u8,
        respond: Sender<CommandOutcome>,
    },
    RequestStatus {
        application: u8,
        block_start: u8,
        respond: Sender<StatusOutcome>,
    },
    Identify {
        unit_address: u8,
        attribute: u8,
        respond: Sender<IdentifyOutcome>,
    },
    PublishTime,
    Close {
        respond: Sender<()>,
    },
}
