//! Typed provisioning directives.
//!
//! A directive is one host action with its parameters. Directives carry no shell syntax; the
//! emitter is the only place that turns them into text.

use crate::template::{FsKind, PartitionKind, SizeMb};
use serde::Serialize;
use std::path::PathBuf;

/// Placeholder expanded to the kernel version inside a [`Directive::ForEachKernel`] body.
pub const KERNEL_VERSION: &str = "$kver";

/// One `mkpart` clause of the partitioning directive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartedEntry {
    pub kind: PartitionKind,
    /// Filesystem in parted's vocabulary; absent for extended containers.
    pub fs: Option<&'static str>,
    pub begin: SizeMb,
    pub end: SizeMb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum YumAction {
    GroupInstall,
    Install,
}

impl YumAction {
    pub fn as_str(self) -> &'static str {
        match self {
            YumAction::GroupInstall => "groupinstall",
            YumAction::Install => "install",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Directive {
    /// Detach `device` if something is bound to it; a no-op otherwise.
    DetachLoop { device: String },
    /// Give the kernel time to settle device nodes.
    Settle { seconds: u32 },
    Fallocate { path: PathBuf, size: SizeMb },
    Parted {
        image: PathBuf,
        entries: Vec<PartedEntry>,
    },
    AttachLoop { device: String, image: PathBuf },
    Partprobe { device: String },
    /// Abort with `PartitionDoesNotExist` unless `device` is a block device.
    RequireBlockDevice { device: String },
    Mkfs {
        fs: FsKind,
        device: String,
        identifier: String,
    },
    MakeDir { path: PathBuf },
    Mount { device: String, target: PathBuf },
    MountPseudo {
        fstype: &'static str,
        target: PathBuf,
    },
    Unmount { target: PathBuf },
    RemoveTree { path: PathBuf },
    WriteFile {
        path: PathBuf,
        contents: String,
        append: bool,
    },
    RpmInitDb { root: PathBuf },
    Yum {
        repos: Vec<String>,
        root: PathBuf,
        action: YumAction,
        items: Vec<String>,
    },
    Copy {
        sources: Vec<PathBuf>,
        dest: PathBuf,
        preserve: bool,
    },
    Sed { expression: String, file: PathBuf },
    RunHook { program: PathBuf, args: Vec<String> },
    Chroot {
        root: PathBuf,
        program: String,
        args: Vec<String>,
    },
    /// Repeat `body` once per directory under `modules_dir`, binding [`KERNEL_VERSION`].
    ForEachKernel {
        modules_dir: PathBuf,
        body: Vec<Directive>,
    },
}

impl Directive {
    /// Whether the emitter follows this directive with the stage's failure guard.
    ///
    /// `RequireBlockDevice` carries its own exit, `Settle` cannot fail and a loop guards
    /// each directive of its body instead.
    pub fn is_guarded(&self) -> bool {
        !matches!(
            self,
            Directive::RequireBlockDevice { .. }
                | Directive::Settle { .. }
                | Directive::ForEachKernel { .. }
        )
    }

    /// Mount target, for directives that mount something.
    pub fn mount_target(&self) -> Option<&PathBuf> {
        match self {
            Directive::Mount { target, .. } | Directive::MountPseudo { target, .. } => {
                Some(target)
            }
            _ => None,
        }
    }

    pub fn unmount_target(&self) -> Option<&PathBuf> {
        match self {
            Directive::Unmount { target } => Some(target),
            _ => None,
        }
    }
}
