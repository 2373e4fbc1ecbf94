#![forbid(unsafe_code)]

//! Clipsal C-Bus PCI protocol engine.
//!
//! Talks to a C-Bus PC Interface over TCP or serial, decodes broadcast
//! traffic into events, and drives lighting groups with the PCI's
//! confirmation/retry discipline. The `cbusd` binary hosts the engine as a
//! daemon; a home-automation bridge consumes the [`pci::PciHandle`] command
//! surface, the [`pci::Event`] stream and the shared [`pci::GroupDb`].

pub mod config;
pub mod error;
pub mod pci;
pub mod protocol;
pub mod telemetry;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

pub use pci::{
    CommandOutcome, Completion, Connector, DisconnectReason, Engine, EngineExit, EngineOptions,
    Event, GroupDb, HandleError, IdentifyOutcome, Link, LinkEvent, NackPolicy, OperationKind,
    PciHandle, StatusOutcome, TcpConnector,
};
pub use protocol::{Cal, FrameScanner, Packet, Sal, StatusKind};
