#![cfg_attr(not(test), warn(unused_crate_dependencies))]

//! Shared building blocks for the probekit measurement engine: the
//! single-threaded reactor, the chunked byte buffer, per-operation
//! settings, the failure taxonomy that measurement reports rely on, and
//! small time/sequencing helpers.

pub mod buffer;
pub mod failure;
pub mod reactor;
pub mod sequence;
pub mod settings;
pub mod util;

pub use buffer::Buffer;
pub use failure::{Failure, FailureKind};
pub use reactor::Reactor;
pub use sequence::run_sequence;
pub use settings::Settings;
