//! # libafl_taint
//!
//! `libafl_taint` is a dynamic taint tracking engine meant to run inside an
//! emulator. It follows, byte by byte, how data derived from inputs the
//! analyst labeled flows through guest memory, guest registers and the
//! intermediate values of translated code, and lets other analyses query or
//! observe that flow.
//!
//! The crate is split into the following components:
//!
//! - `addr` - One [`addr::Address`] type for the five places taint can live.
//! - `shadow` - The [`shadow::ShadowState`] holding the labels of every
//!   tainted byte, and the observers told about every change.
//! - `instrument` - Derives a taint program for every translated code unit,
//!   verifies it and executes it after the unit ran.
//! - `engine` - The [`engine::TaintEngine`] context object and its
//!   enable/disable lifecycle. The emulator calls into it at fixed extension
//!   points and serves its requests through the [`host::TaintHost`] trait.
//! - `hypercall` - The protocol the guest uses to label buffers, query their
//!   taint and report attack points.
//! - `records` - What guest queries and attack points produce.
//!
//! The crate only emits [`log`] records and never installs a logger.

extern crate alloc;

pub mod addr;

pub mod api;

pub mod config;

pub mod engine;

pub mod error;

pub mod host;

pub mod hypercall;

pub mod instrument;

pub mod ir;

pub mod labels;

pub mod memlog;

pub mod records;

pub mod shadow;

pub use config::TaintConfig;
pub use engine::{TaintEngine, TaintState};
pub use error::Error;

pub type GuestAddr = u64;

pub type GuestPhysAddr = u64;

pub type GuestVirtAddr = u64;

pub type GuestReg = u64;

/// The result type of this crate.
pub type Result<T> = core::result::Result<T, Error>;
