//! Fake HAL implementation for testing.
//!
//! This implementation records all operations without executing them,
//! allowing for CI-safe testing without root privileges or loop devices.

use super::{BinaryStatus, HostInfoOps, LoopOps, ProbeOps, ProcessOps};
use crate::{HalError, HalResult};
use std::collections::{HashMap, HashSet};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::{Arc, Mutex};

/// Operation records for testing and verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Command { program: String, args: Vec<String> },
    RunScript { script: PathBuf },
    FindFreeLoop,
}

#[derive(Debug, Clone)]
struct FakeHalState {
    operations: Vec<Operation>,
    /// Exit status per script file name; unknown scripts exit 0.
    script_status: HashMap<String, i32>,
    /// Scripts whose shell cannot be started.
    failing_scripts: HashSet<String>,
    loop_device: String,
    root: bool,
    machine: String,
    missing_binaries: HashSet<String>,
    non_executable: HashSet<String>,
    existing_paths: HashSet<PathBuf>,
}

impl Default for FakeHalState {
    fn default() -> Self {
        Self {
            operations: Vec::new(),
            script_status: HashMap::new(),
            failing_scripts: HashSet::new(),
            loop_device: "/dev/loop0".to_string(),
            root: true,
            machine: "armv7l".to_string(),
            missing_binaries: HashSet::new(),
            non_executable: HashSet::new(),
            existing_paths: HashSet::new(),
        }
    }
}

/// Fake HAL implementation that records operations without executing them.
///
/// Every binary is reported as present unless marked otherwise, and only paths registered
/// with [`FakeHal::add_path`] exist.
#[derive(Debug, Clone, Default)]
pub struct FakeHal {
    state: Arc<Mutex<FakeHalState>>,
}

impl FakeHal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all recorded operations.
    pub fn operations(&self) -> Vec<Operation> {
        self.state.lock().unwrap().operations.clone()
    }

    /// Scripts that were run, in order.
    pub fn scripts_run(&self) -> Vec<PathBuf> {
        self.operations()
            .into_iter()
            .filter_map(|op| match op {
                Operation::RunScript { script } => Some(script),
                _ => None,
            })
            .collect()
    }

    pub fn set_script_status(&self, script_name: &str, status: i32) {
        self.state
            .lock()
            .unwrap()
            .script_status
            .insert(script_name.to_string(), status);
    }

    pub fn fail_script(&self, script_name: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_scripts
            .insert(script_name.to_string());
    }

    pub fn set_loop_device(&self, device: &str) {
        self.state.lock().unwrap().loop_device = device.to_string();
    }

    pub fn set_root(&self, root: bool) {
        self.state.lock().unwrap().root = root;
    }

    pub fn set_machine(&self, machine: &str) {
        self.state.lock().unwrap().machine = machine.to_string();
    }

    pub fn mark_missing(&self, binary: &str) {
        self.state
            .lock()
            .unwrap()
            .missing_binaries
            .insert(binary.to_string());
    }

    pub fn mark_not_executable(&self, binary: &str) {
        self.state
            .lock()
            .unwrap()
            .non_executable
            .insert(binary.to_string());
    }

    pub fn add_path(&self, path: impl Into<PathBuf>) {
        self.state
            .lock()
            .unwrap()
            .existing_paths
            .insert(path.into());
    }

    fn record_operation(&self, op: Operation) {
        self.state.lock().unwrap().operations.push(op);
    }
}

impl ProcessOps for FakeHal {
    fn command_output(&self, program: &str, args: &[&str]) -> HalResult<Output> {
        self.record_operation(Operation::Command {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        });
        Ok(Output {
            status: std::process::ExitStatus::from_raw(0),
            stdout: Vec::new(),
            stderr: Vec::new(),
        })
    }

    fn run_script(&self, shell: &Path, script: &Path, _cwd: Option<&Path>) -> HalResult<i32> {
        log::info!("FAKE HAL: run {}", script.display());
        self.record_operation(Operation::RunScript {
            script: script.to_path_buf(),
        });
        let name = script
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let state = self.state.lock().unwrap();
        if state.failing_scripts.contains(&name) {
            return Err(HalError::CommandNotFound(shell.display().to_string()));
        }
        Ok(state.script_status.get(&name).copied().unwrap_or(0))
    }
}

impl LoopOps for FakeHal {
    fn find_free_loop(&self) -> HalResult<String> {
        self.record_operation(Operation::FindFreeLoop);
        Ok(self.state.lock().unwrap().loop_device.clone())
    }
}

impl HostInfoOps for FakeHal {
    fn is_root(&self) -> bool {
        self.state.lock().unwrap().root
    }

    fn machine(&self) -> HalResult<String> {
        Ok(self.state.lock().unwrap().machine.clone())
    }
}

impl ProbeOps for FakeHal {
    fn locate_binary(&self, name: &str) -> BinaryStatus {
        let state = self.state.lock().unwrap();
        let path = PathBuf::from("/usr/bin").join(name);
        if state.missing_binaries.contains(name) {
            BinaryStatus::Missing
        } else if state.non_executable.contains(name) {
            BinaryStatus::NotExecutable(path)
        } else {
            BinaryStatus::Found(path)
        }
    }

    fn path_exists(&self, path: &Path) -> bool {
        self.state.lock().unwrap().existing_paths.contains(path)
    }

    fn is_file(&self, path: &Path) -> bool {
        self.path_exists(path)
    }
}
