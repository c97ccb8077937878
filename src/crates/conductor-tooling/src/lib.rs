//! Safety primitives shared by conductor executors.
//!
//! Every side-effecting node executor routes its I/O through this crate:
//!
//! - [`Sandbox`] confines filesystem paths to a base directory
//! - [`CommandGuard`] screens and runs shell commands with timeouts and
//!   output caps
//! - [`validate_url`] rejects requests to internal/private networks (SSRF)
//!
//! The checks here are deliberately conservative: a rejected operation is
//! reported back to the calling node as an error value, never a panic, so a
//! blocked path or command degrades a single node instead of the run.

pub mod command;
pub mod error;
pub mod paths;
pub mod urlcheck;

pub use command::{CommandGuard, CommandOutput};
pub use error::{Result, ToolingError};
pub use paths::Sandbox;
pub use urlcheck::validate_url;
