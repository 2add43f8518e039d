//! Common infrastructure for the LLDP mirror tools.
//!
//! This crate provides the pieces every component that talks to the
//! kernel traffic-control subsystem needs:
//!
//! - [`shell`]: External command execution with proper quoting and a
//!   uniform success/failure classification
//! - [`CommandRunner`]: The seam through which all `ip`/`tc` commands
//!   are issued, so tests can substitute an in-memory kernel
//! - [`error`]: Error types for mirror operations
//!
//! # Example
//!
//! ```ignore
//! use lldp_mirror_common::{
//!     shell::{self, IP_CMD, shellquote},
//!     error::MirrorResult,
//! };
//!
//! async fn link_up(dev: &str) -> MirrorResult<()> {
//!     let cmd = format!("{} link set dev {} up", IP_CMD, shellquote(dev));
//!     shell::exec(&cmd).await?.into_result(&cmd)?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod shell;

pub use error::{MirrorError, MirrorResult};
pub use shell::{CommandRunner, ExecResult, ShellRunner};
