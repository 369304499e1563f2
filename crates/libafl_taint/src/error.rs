//! Errors of the taint engine.

use thiserror::Error;

use crate::{
    addr::{Address, RegionId},
    hypercall::DecodeError,
    instrument::verify::VerifyError,
    GuestVirtAddr,
};

/// Errors reported by the host while servicing a request of the engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("Guest virtual address {0:#x} is not mapped")]
    Unmapped(GuestVirtAddr),
    #[error("Could not read {len:#x} bytes of guest memory at {addr:#x}")]
    Read { addr: GuestVirtAddr, len: usize },
    #[error("Could not read register: {0}")]
    Reg(String),
}

/// The main error of `libafl_taint`.
#[derive(Error, Debug)]
pub enum Error {
    /// You're holding it wrong
    #[error("Illegal state: {0}")]
    IllegalState(String),
    /// The argument passed to this method or function is not valid
    #[error("Illegal argument: {0}")]
    IllegalArgument(String),
    /// A byte range does not fit the shadow region it targets
    #[error("{len:#x} bytes at {addr:?} do not fit the {region} shadow region")]
    OutOfBounds {
        addr: Address,
        region: RegionId,
        len: u64,
    },
    /// The installed instrumentation is structurally broken
    #[error(transparent)]
    Verify(#[from] VerifyError),
    /// A guest request could not be decoded
    #[error(transparent)]
    Decode(#[from] DecodeError),
    /// The host could not service a request
    #[error(transparent)]
    Host(#[from] HostError),
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialize(String),
    /// File related error
    #[error("File error: {0}")]
    File(#[from] std::io::Error),
}

impl Error {
    /// You're holding it wrong
    #[must_use]
    pub fn illegal_state<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::IllegalState(arg.into())
    }

    /// The argument passed to this method or function is not valid
    #[must_use]
    pub fn illegal_argument<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::IllegalArgument(arg.into())
    }

    /// Serialization error
    #[must_use]
    pub fn serialize<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::Serialize(arg.into())
    }

    #[must_use]
    pub fn out_of_bounds(addr: Address, len: u64) -> Self {
        Error::OutOfBounds {
            addr,
            region: addr.region(),
            len,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialize(format!("{err:?}"))
    }
}
