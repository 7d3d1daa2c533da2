//! Linux HAL implementation using real processes and system calls.

use super::{BinaryStatus, HostInfoOps, LoopOps, ProbeOps, ProcessOps};
use crate::{HalError, HalResult};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

/// Real HAL implementation for Linux systems.
#[derive(Debug, Clone, Default)]
pub struct LinuxHal;

impl LinuxHal {
    pub fn new() -> Self {
        Self
    }
}

fn map_command_err(program: &str, err: std::io::Error) -> HalError {
    if err.kind() == std::io::ErrorKind::NotFound {
        return HalError::CommandNotFound(program.to_string());
    }
    HalError::Io(err)
}

fn output_failed(program: &str, output: &Output) -> HalError {
    HalError::CommandFailed {
        program: program.to_string(),
        code: output.status.code(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    }
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|md| md.is_file() && md.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

fn find_in_paths(binary: &str, paths: &[PathBuf]) -> Option<PathBuf> {
    paths
        .iter()
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.exists())
}

impl ProcessOps for LinuxHal {
    fn command_output(&self, program: &str, args: &[&str]) -> HalResult<Output> {
        log::debug!("exec: {} {}", program, args.join(" "));
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| map_command_err(program, e))?;
        if !output.status.success() {
            return Err(output_failed(program, &output));
        }
        Ok(output)
    }

    fn run_script(&self, shell: &Path, script: &Path, cwd: Option<&Path>) -> HalResult<i32> {
        let program = shell.display().to_string();
        let mut cmd = Command::new(shell);
        cmd.arg(script);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        // stdio is inherited so soft guards can prompt the operator.
        let status = cmd.status().map_err(|e| map_command_err(&program, e))?;
        Ok(status.code().unwrap_or(-1))
    }
}

impl LoopOps for LinuxHal {
    fn find_free_loop(&self) -> HalResult<String> {
        let output = self.command_output("losetup", &["-f"])?;
        let device = String::from_utf8(output.stdout)?.trim().to_string();
        if device.is_empty() {
            return Err(HalError::Parse("losetup -f returned no device".to_string()));
        }
        Ok(device)
    }
}

impl HostInfoOps for LinuxHal {
    fn is_root(&self) -> bool {
        nix::unistd::geteuid().is_root()
    }

    fn machine(&self) -> HalResult<String> {
        let uts = nix::sys::utsname::uname()?;
        Ok(uts.machine().to_string_lossy().into_owned())
    }
}

impl ProbeOps for LinuxHal {
    fn locate_binary(&self, name: &str) -> BinaryStatus {
        let path = env::var_os("PATH").unwrap_or_default();
        let entries = env::split_paths(&path).collect::<Vec<_>>();
        match find_in_paths(name, &entries) {
            Some(found) if is_executable(&found) => BinaryStatus::Found(found),
            Some(found) => BinaryStatus::NotExecutable(found),
            None => BinaryStatus::Missing,
        }
    }

    fn path_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_file(&self, path: &Path) -> bool {
        path.is_file()
    }
}
