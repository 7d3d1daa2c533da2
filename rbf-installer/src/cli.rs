//! CLI argument parsing for rbf.

use clap::{Parser, ValueEnum};
use rbf_workflow::{Mode, RunOptions, DEFAULT_BOARDS_DIR};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Action {
    /// Validate the template and write the scripts without running them
    Parse,
    /// Write the scripts and build the image (requires root)
    Build,
}

impl From<Action> for Mode {
    fn from(action: Action) -> Self {
        match action {
            Action::Parse => Mode::Parse,
            Action::Build => Mode::Build,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "rbf", version)]
#[command(about = "rbf - RootFS Build Factory")]
#[command(long_about = "rbf - RootFS Build Factory\n\n\
    Builds a bootable disk image for an ARM board from a TOML template.\n\
    `parse` only validates and writes the scripts; `build` also runs them.")]
pub struct Cli {
    #[arg(value_enum)]
    pub action: Action,

    /// Board template (TOML)
    pub template: PathBuf,

    /// Directory for rbf.sh, initramfs.sh, cleanup.sh, rbf-plan.json and rbf.log
    #[arg(long, default_value = ".")]
    pub output_dir: PathBuf,

    /// Use this loop device instead of asking `losetup -f`
    #[arg(long)]
    pub loop_device: Option<String>,

    /// Directory holding per-board hooks (<board>.sh)
    #[arg(long, default_value = DEFAULT_BOARDS_DIR)]
    pub boards_dir: PathBuf,
}

impl Cli {
    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            loop_device: self.loop_device.clone(),
            boards_dir: self.boards_dir.clone(),
            ..RunOptions::new(self.action.into(), &self.template, &self.output_dir)
        }
    }
}
