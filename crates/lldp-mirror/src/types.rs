//! Mirror type definitions and constants

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use lldp_mirror_common::{MirrorError, MirrorResult};

/// Maximum kernel interface name length (IFNAMSIZ - 1)
pub const MAX_IFNAME_LEN: usize = 15;

/// Guest network endpoint kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuestKind {
    /// QEMU virtual machine, host side is a tap device
    Vm,
    /// LXC container, host side is a veth peer
    Container,
}

impl GuestKind {
    /// Host-side interface name prefix for this guest kind
    pub fn interface_prefix(&self) -> &'static str {
        match self {
            GuestKind::Vm => "tap",
            GuestKind::Container => "veth",
        }
    }
}

impl fmt::Display for GuestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuestKind::Vm => write!(f, "vm"),
            GuestKind::Container => write!(f, "ct"),
        }
    }
}

/// A guest whose interfaces are being reconciled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Guest {
    pub id: u32,
    pub kind: GuestKind,
}

impl Guest {
    pub fn new(id: u32, kind: GuestKind) -> Self {
        Self { id, kind }
    }

    /// Host-side interface name of network slot `slot`, e.g. `tap100i0`
    pub fn interface_name(&self, slot: u32) -> String {
        format!("{}{}i{}", self.kind.interface_prefix(), self.id, slot)
    }
}

/// One desired mirror pairing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorSpec {
    pub guest_interface: String,
    pub physical_interface: String,
    pub slot: u32,
}

impl MirrorSpec {
    pub fn new(
        guest_interface: impl Into<String>,
        physical_interface: impl Into<String>,
        slot: u32,
    ) -> Self {
        Self {
            guest_interface: guest_interface.into(),
            physical_interface: physical_interface.into(),
            slot,
        }
    }

    /// Filter priority used for both directions of this slot
    pub fn priority(&self, base: u16) -> MirrorResult<u16> {
        u32::from(base)
            .checked_add(self.slot)
            .and_then(|p| u16::try_from(p).ok())
            .ok_or_else(|| {
                MirrorError::invalid_config(
                    "slot",
                    format!("slot {} overflows priority base {}", self.slot, base),
                )
            })
    }

    /// Returns (filter device, mirror target) for `direction`
    pub fn endpoints(&self, direction: Direction) -> (&str, &str) {
        match direction {
            Direction::PhysToGuest => (&self.physical_interface, &self.guest_interface),
            Direction::GuestToPhys => (&self.guest_interface, &self.physical_interface),
        }
    }
}

impl fmt::Display for MirrorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} <-> {} (net{})",
            self.guest_interface, self.physical_interface, self.slot
        )
    }
}

/// Desired pairings keyed by guest interface
pub type WantedState = BTreeMap<String, MirrorSpec>;

/// Observed mirror destinations per interface
///
/// A point-in-time snapshot; the kernel may change right after it is taken.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunningState {
    mirrors: HashMap<String, BTreeSet<String>>,
}

impl RunningState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `interface` exists and mirrors to each of `destinations`
    pub fn insert<I, S>(&mut self, interface: impl Into<String>, destinations: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.mirrors
            .entry(interface.into())
            .or_default()
            .extend(destinations.into_iter().map(Into::into));
    }

    pub fn destinations(&self, interface: &str) -> Option<&BTreeSet<String>> {
        self.mirrors.get(interface)
    }

    pub fn has_mirror(&self, from: &str, to: &str) -> bool {
        self.mirrors
            .get(from)
            .map(|dests| dests.contains(to))
            .unwrap_or(false)
    }

    /// True if `direction` of `spec` is currently mirrored
    pub fn has_direction(&self, spec: &MirrorSpec, direction: Direction) -> bool {
        let (from, to) = spec.endpoints(direction);
        self.has_mirror(from, to)
    }

    pub fn has_both(&self, spec: &MirrorSpec) -> bool {
        Direction::ALL.iter().all(|d| self.has_direction(spec, *d))
    }

    pub fn has_either(&self, spec: &MirrorSpec) -> bool {
        Direction::ALL.iter().any(|d| self.has_direction(spec, *d))
    }

    pub fn len(&self) -> usize {
        self.mirrors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mirrors.is_empty()
    }
}

/// Which way a mirror rule copies frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    /// Ingress on the physical interface, mirrored to the guest
    PhysToGuest,
    /// Ingress on the guest interface, mirrored to the physical side
    GuestToPhys,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::PhysToGuest, Direction::GuestToPhys];

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::PhysToGuest => "phys2guest",
            Direction::GuestToPhys => "guest2phys",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key of one owned rule in the persisted state, e.g. `phys2guest_net3`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateKey {
    pub direction: Direction,
    pub slot: u32,
}

impl StateKey {
    pub fn new(direction: Direction, slot: u32) -> Self {
        Self { direction, slot }
    }

    /// Both keys of a slot
    pub fn pair(slot: u32) -> [StateKey; 2] {
        Direction::ALL.map(|d| StateKey::new(d, slot))
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_net{}", self.direction, self.slot)
    }
}

impl FromStr for StateKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (dir, slot) = s
            .split_once("_net")
            .ok_or_else(|| format!("Invalid state key: {}", s))?;
        let direction = match dir {
            "phys2guest" => Direction::PhysToGuest,
            "guest2phys" => Direction::GuestToPhys,
            _ => return Err(format!("Invalid direction in state key: {}", s)),
        };
        let slot = slot
            .parse()
            .map_err(|_| format!("Invalid slot in state key: {}", s))?;
        Ok(Self { direction, slot })
    }
}

/// Identifies exactly one tc filter created by us
///
/// Persisted as `<device>/<priority>/<handle>`, e.g. `bond0/20003/800::800`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuleHandle {
    pub device: String,
    pub priority: u16,
    pub handle: String,
}

impl RuleHandle {
    pub fn new(device: impl Into<String>, priority: u16, handle: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            priority,
            handle: handle.into(),
        }
    }
}

impl fmt::Display for RuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.device, self.priority, self.handle)
    }
}

impl FromStr for RuleHandle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(device), Some(prio), Some(handle))
                if !device.is_empty() && !handle.is_empty() =>
            {
                let priority = prio
                    .parse()
                    .map_err(|_| format!("Invalid priority in handle: {}", s))?;
                Ok(Self::new(device, priority, handle))
            }
            _ => Err(format!("Invalid rule handle: {}", s)),
        }
    }
}

/// Lifecycle phase the tool was invoked for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Activate,
    Deactivate,
    /// Any other token; accepted and ignored
    Other(String),
}

impl Phase {
    /// Maps a phase token; hook-script names `post-start` and `pre-stop`
    /// are aliases for activate and deactivate.
    pub fn parse(token: &str) -> Self {
        match token {
            "activate" | "post-start" => Phase::Activate,
            "deactivate" | "pre-stop" => Phase::Deactivate,
            other => Phase::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Activate => write!(f, "activate"),
            Phase::Deactivate => write!(f, "deactivate"),
            Phase::Other(s) => write!(f, "{}", s),
        }
    }
}
