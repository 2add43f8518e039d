//! Test fixtures: mirror files and throwaway host directories
//!
//! [`TestHost`] lays out the directories the tool reads and writes (guest
//! configs, mirror files, state) inside a temporary directory.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

/// Builder for a guest mirror file
#[derive(Debug, Clone, Default)]
pub struct MirrorFile {
    lines: Vec<String>,
}

impl MirrorFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `lldp_mirror_net<slot>=<physical>`
    pub fn mirror(mut self, slot: u32, physical: &str) -> Self {
        self.lines.push(format!("lldp_mirror_net{}={}", slot, physical));
        self
    }

    pub fn comment(mut self, text: &str) -> Self {
        self.lines.push(format!("# {}", text));
        self
    }

    /// Adds a line verbatim
    pub fn raw(mut self, line: &str) -> Self {
        self.lines.push(line.to_string());
        self
    }

    pub fn render(&self) -> String {
        self.lines.iter().fold(String::new(), |mut out, line| {
            let _ = writeln!(out, "{}", line);
            out
        })
    }
}

/// Common mirror file shapes
pub mod mirror_fixtures {
    use super::MirrorFile;

    /// Slot 0 mirrored to `physical`
    pub fn single(physical: &str) -> MirrorFile {
        MirrorFile::new()
            .comment("LLDP towards the top-of-rack switch")
            .mirror(0, physical)
    }

    /// Slots 0 and 1 mirrored to two uplinks
    pub fn dual_uplink(first: &str, second: &str) -> MirrorFile {
        MirrorFile::new().mirror(0, first).mirror(1, second)
    }

    /// Valid entries mixed with lines the parser must skip
    pub fn noisy(physical: &str) -> MirrorFile {
        MirrorFile::new()
            .raw("")
            .comment("managed by hand")
            .raw("lldp_mirror_netX=eth0")
            .raw(&format!("  lldp_mirror_net2 = {}   # uplink", physical))
            .raw("lldp_mirror_net3=")
            .raw("lldp_mirror_net4=this-name-is-far-too-long")
            .raw("unrelated_key=1")
    }
}

/// Temporary host layout
pub struct TestHost {
    dir: TempDir,
}

impl TestHost {
    pub fn new() -> std::io::Result<Self> {
        let host = Self {
            dir: tempfile::tempdir()?,
        };
        for sub in ["qemu-server", "lxc", "mirrors", "state"] {
            fs::create_dir_all(host.root().join(sub))?;
        }
        Ok(host)
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn qemu_config_dir(&self) -> PathBuf {
        self.root().join("qemu-server")
    }

    pub fn lxc_config_dir(&self) -> PathBuf {
        self.root().join("lxc")
    }

    pub fn mirror_dir(&self) -> PathBuf {
        self.root().join("mirrors")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root().join("state")
    }

    pub fn state_file(&self, guest_id: u32) -> PathBuf {
        self.state_dir().join(format!("{}.state", guest_id))
    }

    /// Registers a VM
    pub fn add_vm(&self, guest_id: u32) -> std::io::Result<()> {
        fs::write(
            self.qemu_config_dir().join(format!("{}.conf", guest_id)),
            "memory: 2048\nnet0: virtio=02:00:00:00:00:01,bridge=vmbr0\n",
        )
    }

    /// Registers a container
    pub fn add_container(&self, guest_id: u32) -> std::io::Result<()> {
        fs::write(
            self.lxc_config_dir().join(format!("{}.conf", guest_id)),
            "arch: amd64\nnet0: name=eth0,bridge=vmbr0,type=veth\n",
        )
    }

    pub fn write_mirror_file(&self, guest_id: u32, file: &MirrorFile) -> std::io::Result<PathBuf> {
        let path = self.mirror_dir().join(format!("{}.conf", guest_id));
        fs::write(&path, file.render())?;
        Ok(path)
    }

    pub fn remove_mirror_file(&self, guest_id: u32) -> std::io::Result<()> {
        fs::remove_file(self.mirror_dir().join(format!("{}.conf", guest_id)))
    }
}
