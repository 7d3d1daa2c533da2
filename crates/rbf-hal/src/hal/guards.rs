use crate::{HalResult, ProcessOps};
use std::path::PathBuf;

/// RAII guard that runs the teardown script when dropped.
///
/// The device binding acquired by the main script must never outlive the run, so every
/// exit path (early `?` returns included) goes through the cleanup script.
#[derive(Debug)]
pub struct CleanupGuard<'a, H: ProcessOps + ?Sized> {
    hal: &'a H,
    shell: PathBuf,
    script: PathBuf,
    cwd: Option<PathBuf>,
    active: bool,
}

impl<'a, H: ProcessOps + ?Sized> CleanupGuard<'a, H> {
    pub fn new(
        hal: &'a H,
        shell: impl Into<PathBuf>,
        script: impl Into<PathBuf>,
        cwd: Option<PathBuf>,
    ) -> Self {
        Self {
            hal,
            shell: shell.into(),
            script: script.into(),
            cwd,
            active: true,
        }
    }

    /// Run the cleanup script now and return its exit status.
    pub fn finish(mut self) -> HalResult<i32> {
        self.active = false;
        self.run()
    }

    fn run(&self) -> HalResult<i32> {
        self.hal
            .run_script(&self.shell, &self.script, self.cwd.as_deref())
    }
}

impl<'a, H: ProcessOps + ?Sized> Drop for CleanupGuard<'a, H> {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        match self.run() {
            Ok(0) => {}
            Ok(code) => log::warn!(
                "cleanup guard: {} exited with {}",
                self.script.display(),
                code
            ),
            Err(err) => log::warn!(
                "cleanup guard failed to run {}: {}",
                self.script.display(),
                err
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FakeHal;

    #[test]
    fn cleanup_runs_on_drop() {
        let hal = FakeHal::new();
        {
            let _guard = CleanupGuard::new(&hal, "/usr/bin/bash", "/out/cleanup.sh", None);
        }
        assert_eq!(hal.scripts_run(), vec![PathBuf::from("/out/cleanup.sh")]);
    }

    #[test]
    fn finish_runs_exactly_once() {
        let hal = FakeHal::new();
        hal.set_script_status("cleanup.sh", 219);
        let guard = CleanupGuard::new(&hal, "/usr/bin/bash", "/out/cleanup.sh", None);
        assert_eq!(guard.finish().unwrap(), 219);
        assert_eq!(hal.scripts_run().len(), 1);
    }
}
