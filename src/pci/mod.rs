//! PCI protocol engine.
//!
//! [`Engine`] owns the connection to the PC Interface and runs the whole
//! command/confirmation discipline on a single thread; the bridge drives it
//! through a [`PciHandle`] and observes it through the [`Event`] channel and
//! the shared [`GroupDb`].

pub mod clock;
pub mod confirm;
pub mod engine;
pub mod events;
pub mod groupdb;
pub mod link;
pub mod outbound;
pub mod resync;

pub use engine::{Engine, EngineExit, EngineOptions, HandleError, PciHandle};
pub use events::{
    CommandOutcome, Completion, DisconnectReason, Event, IdentifyOutcome, OperationKind,
    StatusOutcome,
};
pub use groupdb::GroupDb;
pub use link::{Connector, Link, LinkEvent, TcpConnector};
pub use outbound::NackPolicy;

#[cfg(feature = "serial")]
pub use link::SerialConnector;
