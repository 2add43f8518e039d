//! Verification helpers for kernel and state-store expectations

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::fake_kernel::FakeKernel;

/// Verification error types
#[derive(Error, Debug)]
pub enum VerificationError {
    #[error("Expected '{from}' to mirror to '{to}', found {actual:?}")]
    MirrorMissing {
        from: String,
        to: String,
        actual: Vec<String>,
    },

    #[error("Expected no mirror from '{from}' to '{to}'")]
    UnexpectedMirror { from: String, to: String },

    #[error("Expected {expected} filters in the kernel, found {actual}")]
    FilterCountMismatch { expected: usize, actual: usize },

    #[error("Expected state file {path} to be absent")]
    StateFilePresent { path: PathBuf },

    #[error("Expected {expected} entries in {path}, found {actual}")]
    StateEntryMismatch {
        path: PathBuf,
        expected: usize,
        actual: usize,
    },

    #[error("Expected no mutating commands, saw {0:?}")]
    UnexpectedMutation(Vec<String>),
}

/// Result type for verification operations
pub type VerifyResult<T> = Result<T, VerificationError>;

/// Kernel-side assertions against a [`FakeKernel`]
pub struct KernelVerifier<'a> {
    kernel: &'a FakeKernel,
}

impl<'a> KernelVerifier<'a> {
    pub fn new(kernel: &'a FakeKernel) -> Self {
        Self { kernel }
    }

    /// Both directions of a guest/physical pair are installed
    pub fn assert_pair(&self, guest: &str, physical: &str) -> VerifyResult<()> {
        self.assert_mirror(physical, guest)?;
        self.assert_mirror(guest, physical)
    }

    /// Neither direction of the pair is installed
    pub fn assert_no_pair(&self, guest: &str, physical: &str) -> VerifyResult<()> {
        self.assert_no_mirror(physical, guest)?;
        self.assert_no_mirror(guest, physical)
    }

    pub fn assert_mirror(&self, from: &str, to: &str) -> VerifyResult<()> {
        let actual = self.kernel.mirrors(from);
        if !actual.iter().any(|d| d == to) {
            return Err(VerificationError::MirrorMissing {
                from: from.to_string(),
                to: to.to_string(),
                actual,
            });
        }
        Ok(())
    }

    pub fn assert_no_mirror(&self, from: &str, to: &str) -> VerifyResult<()> {
        if self.kernel.mirrors(from).iter().any(|d| d == to) {
            return Err(VerificationError::UnexpectedMirror {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        Ok(())
    }

    pub fn assert_filter_count(&self, expected: usize) -> VerifyResult<()> {
        let actual = self.kernel.filter_count();
        if actual != expected {
            return Err(VerificationError::FilterCountMismatch { expected, actual });
        }
        Ok(())
    }

    pub fn assert_no_mutations(&self) -> VerifyResult<()> {
        let mutations = self.kernel.mutating_commands();
        if !mutations.is_empty() {
            return Err(VerificationError::UnexpectedMutation(mutations));
        }
        Ok(())
    }
}

/// State file assertions
pub struct StateVerifier {
    path: PathBuf,
}

impl StateVerifier {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn assert_absent(&self) -> VerifyResult<()> {
        if self.path.exists() {
            return Err(VerificationError::StateFilePresent {
                path: self.path.clone(),
            });
        }
        Ok(())
    }

    /// Number of non-empty lines in the state file
    pub fn assert_entries(&self, expected: usize) -> VerifyResult<()> {
        let actual = fs::read_to_string(&self.path)
            .map(|c| c.lines().filter(|l| !l.trim().is_empty()).count())
            .unwrap_or(0);
        if actual != expected {
            return Err(VerificationError::StateEntryMismatch {
                path: self.path.clone(),
                expected,
                actual,
            });
        }
        Ok(())
    }
}
