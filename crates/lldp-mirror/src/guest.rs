//! Guest lookup
//!
//! A guest is a VM when `<qemu_config_dir>/<id>.conf` exists and a
//! container when `<lxc_config_dir>/<id>.conf` exists. VM wins if both do.

use std::path::PathBuf;

use lldp_mirror_common::{MirrorError, MirrorResult};
use tracing::debug;

use crate::config_file::PathsConfig;
use crate::types::{Guest, GuestKind};

/// Resolves the kind of `guest_id` from the hypervisor configuration
/// directories
pub fn detect_kind(paths: &PathsConfig, guest_id: u32) -> MirrorResult<GuestKind> {
    let file = format!("{}.conf", guest_id);
    let candidates = [
        (GuestKind::Vm, paths.qemu_config_dir.join(&file)),
        (GuestKind::Container, paths.lxc_config_dir.join(&file)),
    ];

    for (kind, path) in candidates {
        if path.is_file() {
            debug!(guest = guest_id, kind = %kind, path = %path.display(), "Guest config found");
            return Ok(kind);
        }
    }
    Err(MirrorError::GuestNotFound { guest_id })
}

/// Resolves the guest, preferring an explicit kind over detection
pub fn resolve(
    paths: &PathsConfig,
    guest_id: u32,
    kind: Option<GuestKind>,
) -> MirrorResult<Guest> {
    let kind = match kind {
        Some(kind) => kind,
        None => detect_kind(paths, guest_id)?,
    };
    Ok(Guest::new(guest_id, kind))
}

/// Location of the guest's mirror file
pub fn mirror_file(paths: &PathsConfig, guest_id: u32) -> PathBuf {
    paths.mirror_dir.join(format!("{}.conf", guest_id))
}
