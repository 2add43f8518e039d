//! Per-guest record of the tc filters this tool created
//!
//! One file per guest, `<state_dir>/<guest>.state`, with lines such as
//!
//! ```text
//! phys2guest_net0=bond0/20000/800::800
//! guest2phys_net0=tap100i0/20000/800::800
//! ```
//!
//! Every change is a read-modify-write under an exclusive `flock` on
//! `<state_dir>/<guest>.lock`, written through a temporary file and an
//! atomic rename. The lock is only held for that short window, never
//! while waiting on the kernel. A missing file means nothing is owned;
//! the file is removed again when its last entry goes.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use lldp_mirror_common::{MirrorError, MirrorResult};
use nix::fcntl::{Flock, FlockArg};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::types::{RuleHandle, StateKey};

/// Owned rule handles of one guest
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistedState {
    entries: BTreeMap<StateKey, RuleHandle>,
}

impl PersistedState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses file content; malformed lines are dropped with a warning
    pub fn parse(content: &str) -> Self {
        let mut entries = BTreeMap::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let parsed = line.split_once('=').and_then(|(k, v)| {
                let key = k.trim().parse::<StateKey>().ok()?;
                let handle = v.trim().parse::<RuleHandle>().ok()?;
                Some((key, handle))
            });
            match parsed {
                Some((key, handle)) => {
                    entries.insert(key, handle);
                }
                None => warn!(line = %line, "Ignoring malformed state entry"),
            }
        }
        Self { entries }
    }

    pub fn render(&self) -> String {
        self.entries
            .iter()
            .map(|(key, handle)| format!("{}={}\n", key, handle))
            .collect()
    }

    pub fn get(&self, key: &StateKey) -> Option<&RuleHandle> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: StateKey, handle: RuleHandle) -> Option<RuleHandle> {
        self.entries.insert(key, handle)
    }

    pub fn remove(&mut self, key: &StateKey) -> Option<RuleHandle> {
        self.entries.remove(key)
    }

    /// Slots with at least one owned rule
    pub fn slots(&self) -> BTreeSet<u32> {
        self.entries.keys().map(|k| k.slot).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&StateKey, &RuleHandle)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Directory of per-guest state files
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state_path(&self, guest_id: u32) -> PathBuf {
        self.dir.join(format!("{}.state", guest_id))
    }

    pub fn lock_path(&self, guest_id: u32) -> PathBuf {
        self.dir.join(format!("{}.lock", guest_id))
    }

    /// Current record of `guest_id`; empty if there is none
    pub fn load(&self, guest_id: u32) -> MirrorResult<PersistedState> {
        let path = self.state_path(guest_id);
        match fs::read_to_string(&path) {
            Ok(content) => Ok(PersistedState::parse(&content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(PersistedState::new()),
            Err(e) => Err(MirrorError::state_store(path, e)),
        }
    }

    /// Records one owned handle
    pub fn record(&self, guest_id: u32, key: StateKey, handle: &RuleHandle) -> MirrorResult<()> {
        debug!(guest = guest_id, key = %key, handle = %handle, "Recording owned rule");
        self.update(guest_id, |state| {
            state.insert(key, handle.clone());
        })?;
        Ok(())
    }

    /// Drops the given keys from the record
    pub fn forget(&self, guest_id: u32, keys: &[StateKey]) -> MirrorResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        debug!(guest = guest_id, ?keys, "Forgetting owned rules");
        self.update(guest_id, |state| {
            for key in keys {
                state.remove(key);
            }
        })?;
        Ok(())
    }

    /// Locked read-modify-write of the guest's record
    pub fn update<F>(&self, guest_id: u32, f: F) -> MirrorResult<PersistedState>
    where
        F: FnOnce(&mut PersistedState),
    {
        let _lock = self.lock(guest_id)?;
        let mut state = self.load(guest_id)?;
        f(&mut state);
        self.write(guest_id, &state)?;
        Ok(state)
    }

    fn lock(&self, guest_id: u32) -> MirrorResult<Flock<File>> {
        fs::create_dir_all(&self.dir).map_err(|e| MirrorError::state_store(&self.dir, e))?;

        let path = self.lock_path(guest_id);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| MirrorError::state_store(&path, e))?;

        Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| MirrorError::state_store(&path, io::Error::from(errno)))
    }

    fn write(&self, guest_id: u32, state: &PersistedState) -> MirrorResult<()> {
        let path = self.state_path(guest_id);

        if state.is_empty() {
            return match fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(MirrorError::state_store(path, e)),
            };
        }

        let mut tmp =
            NamedTempFile::new_in(&self.dir).map_err(|e| MirrorError::state_store(&self.dir, e))?;
        tmp.write_all(state.render().as_bytes())
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| MirrorError::state_store(tmp.path(), e))?;
        tmp.persist(&path)
            .map_err(|e| MirrorError::state_store(&path, e.error))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Direction;
    use std::sync::Arc;
    use std::thread;

    fn handle(dev: &str, prio: u16) -> RuleHandle {
        RuleHandle::new(dev, prio, "800::800")
    }

    #[test]
    fn test_load_absent_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        assert!(store.load(100).unwrap().is_empty());
    }

    #[test]
    fn test_record_and_forget() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state"));
        let key = StateKey::new(Direction::PhysToGuest, 0);

        store.record(100, key, &handle("bond0", 20000)).unwrap();
        let state = store.load(100).unwrap();
        assert_eq!(state.get(&key), Some(&handle("bond0", 20000)));

        let content = fs::read_to_string(store.state_path(100)).unwrap();
        assert_eq!(content, "phys2guest_net0=bond0/20000/800::800\n");

        store.forget(100, &[key]).unwrap();
        assert!(store.load(100).unwrap().is_empty());
        assert!(!store.state_path(100).exists());
    }

    #[test]
    fn test_guests_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let key = StateKey::new(Direction::GuestToPhys, 1);

        store.record(100, key, &handle("tap100i1", 20001)).unwrap();
        store.record(101, key, &handle("tap101i1", 20001)).unwrap();
        store.forget(100, &[key]).unwrap();

        assert!(store.load(100).unwrap().is_empty());
        assert_eq!(store.load(101).unwrap().len(), 1);
    }

    #[test]
    fn test_parse_skips_malformed_lines() {
        let state = PersistedState::parse(
            "phys2guest_net3=bond0/20003/800::801\nnonsense\nguest2phys_net3=tap1i3\n\n",
        );
        assert_eq!(state.len(), 1);
        assert_eq!(state.slots(), BTreeSet::from([3]));
    }

    #[test]
    fn test_render_roundtrip_is_stable() {
        let mut state = PersistedState::new();
        state.insert(
            StateKey::new(Direction::GuestToPhys, 2),
            handle("tap100i2", 20002),
        );
        state.insert(
            StateKey::new(Direction::PhysToGuest, 2),
            handle("bond0", 20002),
        );
        assert_eq!(PersistedState::parse(&state.render()), state);
    }

    #[test]
    fn test_concurrent_updates_do_not_lose_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::new(dir.path()));

        let workers: Vec<_> = (0..8u32)
            .map(|slot| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for direction in Direction::ALL {
                        let key = StateKey::new(direction, slot);
                        let prio = 20000 + slot as u16;
                        store.record(100, key, &handle("bond0", prio)).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let content = fs::read_to_string(store.state_path(100)).unwrap();
        let state = PersistedState::parse(&content);
        assert_eq!(state.len(), 16);
        assert_eq!(content.lines().count(), 16);
    }
}
