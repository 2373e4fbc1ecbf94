use thiserror::Error;

use crate::config::ConfigError;
use crate::pci::HandleError;

/// Crate-level convenience error.
///
/// A thin wrapper over the module errors a caller actually meets at the
/// surface; codec errors stay inside the engine, which logs and drops.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Handle(#[from] HandleError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
