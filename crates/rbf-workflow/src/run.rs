use crate::artifacts::{ArtifactPaths, ArtifactSet, LOG_FILE};
use log::{error, info, warn};
use rbf_core::emit::{render_script, ScriptOptions, DEFAULT_SHELL};
use rbf_core::partitioning::{compute_layout, LayoutEntry};
use rbf_core::preflight::{self, PreflightConfig};
use rbf_core::provisioning::{build_plan, HostBinding, ProvisioningPlan, BOOT_STAGES};
use rbf_core::{build_cleanup, Template};
use rbf_error::{ProvisionCode, RbfError, RbfResult};
use rbf_hal::{BuildHal, CleanupGuard};
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};

pub const DEFAULT_BOARDS_DIR: &str = "boards.d";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Validate, plan and write the scripts without executing them.
    Parse,
    /// Everything `Parse` does, then run the main script and the cleanup script.
    Build,
}

impl Mode {
    pub fn is_build(self) -> bool {
        self == Mode::Build
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Parse => "parse",
            Mode::Build => "build",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub mode: Mode,
    pub template: PathBuf,
    pub output_dir: PathBuf,
    /// Run log the generated scripts append to; defaults to `<output_dir>/rbf.log`.
    pub log_file: Option<PathBuf>,
    /// Skip `losetup -f` and use this device.
    pub loop_device: Option<String>,
    pub boards_dir: PathBuf,
    pub shell: PathBuf,
}

impl RunOptions {
    pub fn new(mode: Mode, template: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            mode,
            template: template.into(),
            output_dir: output_dir.into(),
            log_file: None,
            loop_device: None,
            boards_dir: PathBuf::from(DEFAULT_BOARDS_DIR),
            shell: PathBuf::from(DEFAULT_SHELL),
        }
    }

    pub fn log_path(&self) -> PathBuf {
        self.log_file
            .clone()
            .unwrap_or_else(|| self.output_dir.join(LOG_FILE))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub mode: Mode,
    pub board: String,
    pub loop_device: String,
    pub stages: Vec<&'static str>,
    pub artifacts: ArtifactPaths,
}

/// Machine-readable copy of everything the scripts were generated from.
#[derive(Serialize)]
struct PlanDocument<'a> {
    board: &'a str,
    mode: Mode,
    loop_device: &'a str,
    layout: &'a [LayoutEntry],
    plan: &'a ProvisioningPlan,
    cleanup: &'a ProvisioningPlan,
}

/// Validate the template, write the artifacts and, in build mode, execute them.
///
/// Once the main script has been started the cleanup script runs on every path out of this
/// function.
pub fn run<H: BuildHal + ?Sized>(hal: &H, opts: &RunOptions) -> RbfResult<RunReport> {
    let mut artifacts = ArtifactSet::create(&opts.output_dir)?;

    info!("Loading template {}", opts.template.display());
    let template = Template::load(&opts.template)?;
    let layout = compute_layout(template.image.size, &template.partitions)?;
    info!("Planned {} partitions for {}", layout.len(), template.board);

    let checks = PreflightConfig::for_template(&template, &layout, opts.mode.is_build());
    preflight::run(hal, &checks)?;

    let loop_device = match &opts.loop_device {
        Some(device) => device.clone(),
        None => hal.find_free_loop()?,
    };
    info!("Using loop device {}", loop_device);

    let mut host = HostBinding::new(loop_device.clone());
    if let Some(hook) = board_hook(hal, &opts.boards_dir, &template.board) {
        info!("Board hook {}", hook.display());
        host = host.with_board_hook(hook);
    }

    let plan = build_plan(&template, &layout, &host);
    let cleanup = build_cleanup(&template, &layout, &host);

    let log_path = opts.log_path();
    let script_opts = ScriptOptions {
        shell: opts.shell.display().to_string(),
        ..ScriptOptions::new(log_path.display().to_string())
    };
    artifacts
        .main_script
        .write_str(&render_script(&plan, &script_opts))?;
    artifacts
        .boot_script
        .write_str(&render_script(&plan.subset(&BOOT_STAGES), &script_opts))?;
    artifacts
        .cleanup_script
        .write_str(&render_script(&cleanup, &script_opts.clone().non_interactive()))?;

    let document = PlanDocument {
        board: &template.board,
        mode: opts.mode,
        loop_device: &loop_device,
        layout: &layout,
        plan: &plan,
        cleanup: &cleanup,
    };
    let json = serde_json::to_string_pretty(&document).map_err(|err| RbfError::Artifact {
        path: artifacts.plan_json.path().to_path_buf(),
        source: io::Error::from(err),
    })?;
    artifacts.plan_json.write_str(&json)?;
    let artifacts = artifacts.close()?;

    let report = RunReport {
        mode: opts.mode,
        board: template.board.clone(),
        loop_device,
        stages: plan.stage_names(),
        artifacts,
    };

    match opts.mode {
        Mode::Parse => {
            for line in plan.summary_lines() {
                info!("{}", line);
            }
            info!("Template parsed. Scripts written to {}", opts.output_dir.display());
        }
        Mode::Build => execute(hal, opts, &plan, &report.artifacts)?,
    }
    Ok(report)
}

/// `<boards_dir>/<board>.sh`, when it exists.
fn board_hook<H: BuildHal + ?Sized>(hal: &H, boards_dir: &Path, board: &str) -> Option<PathBuf> {
    let hook = boards_dir.join(format!("{board}.sh"));
    hal.is_file(&hook).then_some(hook)
}

fn execute<H: BuildHal + ?Sized>(
    hal: &H,
    opts: &RunOptions,
    plan: &ProvisioningPlan,
    artifacts: &ArtifactPaths,
) -> RbfResult<()> {
    let guard = CleanupGuard::new(hal, &opts.shell, &artifacts.cleanup_script, None);

    info!("Running {}", artifacts.main_script.display());
    let outcome = hal
        .run_script(&opts.shell, &artifacts.main_script, None)
        .map_err(|err| RbfError::Script {
            script: artifacts.main_script.clone(),
            reason: err.to_string(),
        })
        .and_then(|status| script_outcome(plan, &artifacts.main_script, status));

    info!("Running {}", artifacts.cleanup_script.display());
    let cleanup = match guard.finish() {
        Ok(0) => Ok(()),
        Ok(status) => Err(RbfError::Cleanup(format!(
            "{} exited with {}",
            artifacts.cleanup_script.display(),
            status
        ))),
        Err(err) => Err(RbfError::Cleanup(err.to_string())),
    };

    match (outcome, cleanup) {
        (Err(err), Err(cleanup_err)) => {
            warn!("{}", cleanup_err);
            Err(err)
        }
        (Err(err), Ok(())) => Err(err),
        (Ok(()), Err(cleanup_err)) => Err(cleanup_err),
        (Ok(()), Ok(())) => {
            info!("Image build complete");
            Ok(())
        }
    }
}

/// Map the main script's exit status back to the stage that stopped it.
fn script_outcome(plan: &ProvisioningPlan, script: &Path, status: i32) -> RbfResult<()> {
    if status == 0 {
        return Ok(());
    }
    match ProvisionCode::from_code(status) {
        Some(code) => {
            let stage = plan
                .stage_for_code(code)
                .map(|s| s.name.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            error!("Stage {} failed: {}", stage, code);
            Err(RbfError::Provisioning { code, stage })
        }
        None if status < 0 => Err(RbfError::Script {
            script: script.to_path_buf(),
            reason: "killed by a signal".to_string(),
        }),
        None => Err(RbfError::Script {
            script: script.to_path_buf(),
            reason: format!("exited with {status}, which no stage uses"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::{CLEANUP_SCRIPT, MAIN_SCRIPT, PLAN_JSON};
    use rbf_hal::{FakeHal, Operation};
    use std::fs;
    use tempfile::{tempdir, TempDir};

    const TEMPLATE: &str = r#"
board = "bananapi"
workdir = "/tmp/rbf-bananapi"
distro = "Fedora"
hostname = "bananapi"
etc_overlay = "etc"
finalize_script = "./finalize.sh"

[image]
size = "2048M"
type = "raw"
path = "bananapi.img"

[[partitions]]
index = 1
size = "500M"
type = "primary"
fs = "ext4"
mountpoint = "/"

[[repos]]
name = "fedora"
path = "http://dl.fedoraproject.org/pub/fedora/linux/releases/23/Everything/armhfp/os/"

[packages]
groups = "core"
packages = "vim-minimal"

[kernel]
type = "stock"
"#;

    struct Fixture {
        dir: TempDir,
        hal: FakeHal,
    }

    impl Fixture {
        fn new(content: &str) -> Self {
            let dir = tempdir().unwrap();
            fs::write(dir.path().join("bananapi.toml"), content).unwrap();
            let hal = FakeHal::new();
            hal.add_path("etc");
            Self { dir, hal }
        }

        fn options(&self, mode: Mode) -> RunOptions {
            RunOptions::new(
                mode,
                self.dir.path().join("bananapi.toml"),
                self.dir.path().join("out"),
            )
        }

        fn artifact(&self, name: &str) -> String {
            fs::read_to_string(self.dir.path().join("out").join(name)).unwrap()
        }
    }

    #[test]
    fn parse_writes_scripts_without_running_them() {
        let fx = Fixture::new(TEMPLATE);
        fx.hal.set_root(false);
        let report = run(&fx.hal, &fx.options(Mode::Parse)).unwrap();

        assert_eq!(report.loop_device, "/dev/loop0");
        assert!(fx.hal.scripts_run().is_empty());
        assert!(fx.artifact(MAIN_SCRIPT).starts_with("#!/usr/bin/bash"));
        assert!(fx.artifact(CLEANUP_SCRIPT).contains("losetup -d /dev/loop0"));
        let json: serde_json::Value = serde_json::from_str(&fx.artifact(PLAN_JSON)).unwrap();
        assert_eq!(json["board"], "bananapi");
        assert_eq!(json["mode"], "parse");
    }

    #[test]
    fn loop_override_skips_discovery() {
        let fx = Fixture::new(TEMPLATE);
        let opts = RunOptions {
            loop_device: Some("/dev/loop7".to_string()),
            ..fx.options(Mode::Parse)
        };
        let report = run(&fx.hal, &opts).unwrap();
        assert_eq!(report.loop_device, "/dev/loop7");
        assert!(!fx.hal.operations().contains(&Operation::FindFreeLoop));
        assert!(fx.artifact(MAIN_SCRIPT).contains("losetup /dev/loop7 bananapi.img"));
    }

    #[test]
    fn build_runs_main_then_cleanup() {
        let fx = Fixture::new(TEMPLATE);
        let opts = fx.options(Mode::Build);
        run(&fx.hal, &opts).unwrap();
        let out = opts.output_dir;
        assert_eq!(
            fx.hal.scripts_run(),
            vec![out.join(MAIN_SCRIPT), out.join(CLEANUP_SCRIPT)]
        );
    }

    #[test]
    fn build_requires_root() {
        let fx = Fixture::new(TEMPLATE);
        fx.hal.set_root(false);
        let err = run(&fx.hal, &fx.options(Mode::Build)).unwrap_err();
        assert_eq!(err.code(), 114);
        assert!(fx.hal.scripts_run().is_empty());
    }

    #[test]
    fn failed_stage_reports_its_code_and_still_cleans_up() {
        let fx = Fixture::new(TEMPLATE);
        fx.hal.set_script_status(MAIN_SCRIPT, 205);
        let err = run(&fx.hal, &fx.options(Mode::Build)).unwrap_err();
        match &err {
            RbfError::Provisioning { code, stage } => {
                assert_eq!(*code, ProvisionCode::Mounting);
                assert_eq!(stage, "mount-partitions");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(err.code(), 205);
        assert_eq!(fx.hal.scripts_run().len(), 2);
    }

    #[test]
    fn cleanup_failure_is_reported_only_after_success() {
        let fx = Fixture::new(TEMPLATE);
        fx.hal.set_script_status(CLEANUP_SCRIPT, 219);
        let err = run(&fx.hal, &fx.options(Mode::Build)).unwrap_err();
        assert_eq!(err.code(), 113);

        let fx = Fixture::new(TEMPLATE);
        fx.hal.set_script_status(MAIN_SCRIPT, 202);
        fx.hal.set_script_status(CLEANUP_SCRIPT, 219);
        let err = run(&fx.hal, &fx.options(Mode::Build)).unwrap_err();
        assert_eq!(err.code(), 202);
    }

    #[test]
    fn unknown_exit_status_is_a_script_failure() {
        let fx = Fixture::new(TEMPLATE);
        fx.hal.set_script_status(MAIN_SCRIPT, 1);
        let err = run(&fx.hal, &fx.options(Mode::Build)).unwrap_err();
        assert!(matches!(err, RbfError::Script { .. }));
        assert_eq!(err.code(), 224);

        let fx = Fixture::new(TEMPLATE);
        fx.hal.set_script_status(MAIN_SCRIPT, -1);
        let err = run(&fx.hal, &fx.options(Mode::Build)).unwrap_err();
        assert_eq!(err.code(), 224);
        assert_eq!(fx.hal.scripts_run().len(), 2);
    }

    #[test]
    fn unrunnable_main_script_is_not_a_loop_device_error() {
        let fx = Fixture::new(TEMPLATE);
        fx.hal.fail_script(MAIN_SCRIPT);
        let err = run(&fx.hal, &fx.options(Mode::Build)).unwrap_err();
        assert!(matches!(err, RbfError::Script { .. }));
        assert_ne!(err.code(), ProvisionCode::LoopDeviceCreate.code());
        assert_eq!(fx.hal.scripts_run().len(), 2);
    }

    #[test]
    fn board_hook_is_picked_up_when_present() {
        let fx = Fixture::new(TEMPLATE);
        fx.hal.add_path("boards.d/bananapi.sh");
        run(&fx.hal, &fx.options(Mode::Parse)).unwrap();
        assert!(fx.artifact(MAIN_SCRIPT).contains("boards.d/bananapi.sh"));
    }

    #[test]
    fn stale_artifacts_are_emptied_when_the_template_is_missing() {
        let fx = Fixture::new(TEMPLATE);
        let out = fx.dir.path().join("out");
        fs::create_dir_all(&out).unwrap();
        fs::write(out.join(MAIN_SCRIPT), "stale").unwrap();

        let opts = RunOptions {
            template: fx.dir.path().join("missing.toml"),
            ..fx.options(Mode::Parse)
        };
        let err = run(&fx.hal, &opts).unwrap_err();
        assert_eq!(err.code(), 118);
        assert_eq!(fx.artifact(MAIN_SCRIPT), "");
    }

    #[test]
    fn layout_errors_stop_before_loop_discovery() {
        let fx = Fixture::new(&TEMPLATE.replace("size = \"500M\"", "size = \"3000M\""));
        let err = run(&fx.hal, &fx.options(Mode::Parse)).unwrap_err();
        assert_eq!(err.code(), 111);
        assert!(fx.hal.operations().is_empty());
    }
}
