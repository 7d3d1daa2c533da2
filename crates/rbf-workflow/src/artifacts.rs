//! Files a run leaves behind for inspection and bug reports.
//!
//! Every artifact is truncated when the run starts, so a failed run never leaves a previous
//! run's script lying next to its log.

use rbf_error::{RbfError, RbfResult};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub const MAIN_SCRIPT: &str = "rbf.sh";
pub const BOOT_SCRIPT: &str = "initramfs.sh";
pub const CLEANUP_SCRIPT: &str = "cleanup.sh";
pub const PLAN_JSON: &str = "rbf-plan.json";
pub const LOG_FILE: &str = "rbf.log";

/// An open, truncated artifact. Buffered output is flushed when it is dropped.
#[derive(Debug)]
pub struct ArtifactFile {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl ArtifactFile {
    pub fn create(path: impl Into<PathBuf>) -> RbfResult<Self> {
        let path = path.into();
        let file = File::create(&path).map_err(|source| RbfError::Artifact {
            path: path.clone(),
            source,
        })?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_str(&mut self, content: &str) -> RbfResult<()> {
        self.writer
            .write_all(content.as_bytes())
            .map_err(|source| RbfError::Artifact {
                path: self.path.clone(),
                source,
            })
    }

    /// Flush and close, returning the path.
    pub fn close(mut self) -> RbfResult<PathBuf> {
        self.writer.flush().map_err(|source| RbfError::Artifact {
            path: self.path.clone(),
            source,
        })?;
        Ok(self.path)
    }
}

/// The run's artifacts, opened (and emptied) together.
#[derive(Debug)]
pub struct ArtifactSet {
    pub main_script: ArtifactFile,
    pub boot_script: ArtifactFile,
    pub cleanup_script: ArtifactFile,
    pub plan_json: ArtifactFile,
}

/// Where the closed artifacts ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub main_script: PathBuf,
    pub boot_script: PathBuf,
    pub cleanup_script: PathBuf,
    pub plan_json: PathBuf,
}

impl ArtifactSet {
    pub fn create(output_dir: &Path) -> RbfResult<Self> {
        fs::create_dir_all(output_dir).map_err(|source| RbfError::Artifact {
            path: output_dir.to_path_buf(),
            source,
        })?;
        Ok(Self {
            main_script: ArtifactFile::create(output_dir.join(MAIN_SCRIPT))?,
            boot_script: ArtifactFile::create(output_dir.join(BOOT_SCRIPT))?,
            cleanup_script: ArtifactFile::create(output_dir.join(CLEANUP_SCRIPT))?,
            plan_json: ArtifactFile::create(output_dir.join(PLAN_JSON))?,
        })
    }

    /// Flush everything; scripts must be closed before a shell can run them.
    pub fn close(self) -> RbfResult<ArtifactPaths> {
        Ok(ArtifactPaths {
            main_script: self.main_script.close()?,
            boot_script: self.boot_script.close()?,
            cleanup_script: self.cleanup_script.close()?,
            plan_json: self.plan_json.close()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn previous_run_is_truncated_even_if_nothing_is_written() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(MAIN_SCRIPT), "old script").unwrap();
        fs::write(dir.path().join(CLEANUP_SCRIPT), "old cleanup").unwrap();

        let set = ArtifactSet::create(dir.path()).unwrap();
        drop(set);

        assert_eq!(fs::read_to_string(dir.path().join(MAIN_SCRIPT)).unwrap(), "");
        assert_eq!(fs::read_to_string(dir.path().join(CLEANUP_SCRIPT)).unwrap(), "");
    }

    #[test]
    fn dropped_artifact_flushes_its_buffer() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.sh");
        {
            let mut file = ArtifactFile::create(&path).unwrap();
            file.write_str("echo hi\n").unwrap();
        }
        assert_eq!(fs::read_to_string(&path).unwrap(), "echo hi\n");
    }

    #[test]
    fn output_dir_is_created() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("out/nested");
        let paths = ArtifactSet::create(&out).unwrap().close().unwrap();
        assert_eq!(paths.main_script, out.join(MAIN_SCRIPT));
        assert!(paths.plan_json.exists());
    }

    #[test]
    fn unwritable_output_dir_is_reported() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, "").unwrap();
        let err = ArtifactSet::create(&blocker).unwrap_err();
        assert_eq!(err.code(), 121);
    }
}
