//! LLDP mirroring between guest NICs and physical interfaces
//!
//! Keeps a pair of `tc` mirred filters per configured guest NIC so that
//! LLDP frames seen on the physical port reach the guest and frames the
//! guest sends leave through the physical port.
//!
//! - [`desired`]: Parses the guest's mirror file into the wanted state
//! - [`probe`]: Reads the mirrors currently installed, from JSON or text
//!   `tc` output
//! - [`engine`]: Creates and removes mirror pairs, with rollback and
//!   bounded polling for kernel state to settle
//! - [`state_store`]: Per-guest record of the rule handles this tool owns
//! - [`hook`]: One invocation from guest lifecycle hook to report

pub mod cli;
pub mod commands;
pub mod config_file;
pub mod desired;
pub mod engine;
pub mod guest;
pub mod hook;
pub mod probe;
pub mod retry;
pub mod state_store;
pub mod types;

pub use commands::TcCommands;
pub use config_file::MirrorConfig;
pub use engine::{check_environment, MirrorEngine, ReconcileReport};
pub use hook::HookRequest;
pub use probe::{OutputFormat, Prober};
pub use state_store::{PersistedState, StateStore};
pub use types::{
    Direction, Guest, GuestKind, MirrorSpec, Phase, RuleHandle, RunningState, StateKey,
    WantedState,
};
