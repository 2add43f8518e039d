//! Desired-state file parsing
//!
//! The mirror file is line oriented:
//!
//! ```text
//! # mirror LLDP between net0 and the uplink bond
//! lldp_mirror_net0=bond0
//! lldp_mirror_net2 = eno1   # inline comments are allowed
//! ```
//!
//! Bad lines are logged and skipped; they never fail the whole parse.

use std::fs;
use std::io;
use std::path::Path;

use lldp_mirror_common::{MirrorError, MirrorResult};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use crate::types::{Guest, MirrorSpec, WantedState, MAX_IFNAME_LEN};

static MIRROR_KEY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^lldp_mirror_net(\d+)$").expect("Invalid regex pattern"));

static IFNAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.\-]+$").expect("Invalid regex pattern"));

/// Returns true if `name` is usable as a network interface name
pub fn is_valid_ifname(name: &str) -> bool {
    !name.is_empty() && name.len() <= MAX_IFNAME_LEN && IFNAME_RE.is_match(name)
}

/// Parses mirror file content into the wanted state for `guest`
pub fn parse_mirror_config(content: &str, guest: &Guest) -> WantedState {
    let mut wanted = WantedState::new();

    for (idx, raw) in content.lines().enumerate() {
        let lineno = idx + 1;
        let line = raw.trim_end_matches('\r').trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            warn!(line = lineno, content = %line, "Skipping line without '='");
            continue;
        };

        let key = key.trim();
        let Some(slot) = MIRROR_KEY_RE
            .captures(key)
            .and_then(|caps| caps[1].parse::<u32>().ok())
        else {
            warn!(line = lineno, key = %key, "Skipping unrecognized mirror key");
            continue;
        };

        let value = value.split('#').next().unwrap_or_default();
        let physical: String = value.chars().filter(|c| !c.is_whitespace()).collect();
        if physical.is_empty() {
            warn!(line = lineno, key = %key, "Skipping mirror key with empty value");
            continue;
        }
        if !is_valid_ifname(&physical) {
            warn!(
                line = lineno,
                key = %key,
                value = %physical,
                "Skipping invalid physical interface name"
            );
            continue;
        }

        let guest_interface = guest.interface_name(slot);
        if !is_valid_ifname(&guest_interface) {
            warn!(
                line = lineno,
                key = %key,
                interface = %guest_interface,
                "Skipping mirror whose guest interface name exceeds the kernel limit"
            );
            continue;
        }
        let spec = MirrorSpec::new(guest_interface.clone(), physical, slot);
        debug!(line = lineno, mirror = %spec, "Parsed mirror entry");
        if wanted.insert(guest_interface, spec).is_some() {
            warn!(line = lineno, slot, "Duplicate mirror slot, last entry wins");
        }
    }

    wanted
}

/// Loads the wanted state from `path`
///
/// Returns `Ok(None)` when the file does not exist or holds no valid
/// entries: there is nothing to reconcile.
pub fn load_wanted_state(path: &Path, guest: &Guest) -> MirrorResult<Option<WantedState>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "No mirror file");
            return Ok(None);
        }
        Err(e) => {
            return Err(MirrorError::invalid_config(
                "mirror_file",
                format!("Failed to read {}: {}", path.display(), e),
            ))
        }
    };

    let wanted = parse_mirror_config(&content, guest);
    if wanted.is_empty() {
        debug!(path = %path.display(), "Mirror file has no valid entries");
        return Ok(None);
    }
    Ok(Some(wanted))
}
