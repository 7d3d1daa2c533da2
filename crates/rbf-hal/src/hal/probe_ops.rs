//! Filesystem and `PATH` probing.

use std::path::{Path, PathBuf};

/// Lookup result for a required host binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BinaryStatus {
    Found(PathBuf),
    NotExecutable(PathBuf),
    Missing,
}

pub trait ProbeOps {
    fn locate_binary(&self, name: &str) -> BinaryStatus;

    fn path_exists(&self, path: &Path) -> bool;

    fn is_file(&self, path: &Path) -> bool;
}
