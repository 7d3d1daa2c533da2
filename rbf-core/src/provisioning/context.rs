use crate::partitioning::LayoutEntry;
use crate::template::Template;
use rbf_hal::path::partition_path;
use std::path::{Path, PathBuf};

/// Host-side facts the plan depends on that are not part of the template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostBinding {
    /// Loop device the image gets attached to (e.g. `/dev/loop0`).
    pub loop_device: String,
    /// `boards.d/<board>.sh`, when the board ships one.
    pub board_hook: Option<PathBuf>,
}

impl HostBinding {
    pub fn new(loop_device: impl Into<String>) -> Self {
        Self {
            loop_device: loop_device.into(),
            board_hook: None,
        }
    }

    pub fn with_board_hook(mut self, hook: impl Into<PathBuf>) -> Self {
        self.board_hook = Some(hook.into());
        self
    }
}

/// Everything the stage functions read, threaded from stage to stage.
///
/// Stages never mutate it; a stage that adds packages returns a new context instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildContext {
    pub workdir: PathBuf,
    pub loop_device: String,
    pub board_hook: Option<PathBuf>,
    pub layout: Vec<LayoutEntry>,
    pub repo_names: Vec<String>,
    pub groups: Vec<String>,
    pub packages: Vec<String>,
}

impl BuildContext {
    pub fn new(template: &Template, layout: &[LayoutEntry], host: &HostBinding) -> Self {
        Self {
            workdir: template.workdir.clone(),
            loop_device: host.loop_device.clone(),
            board_hook: host.board_hook.clone(),
            layout: layout.to_vec(),
            repo_names: template.repos.iter().map(|r| r.name.clone()).collect(),
            groups: template.packages.groups.clone(),
            packages: template.packages.packages.clone(),
        }
    }

    /// A copy of this context with `extra` appended to the package list (no duplicates).
    pub fn with_packages(&self, extra: &[&str]) -> Self {
        let mut packages = self.packages.clone();
        for pkg in extra {
            if !packages.iter().any(|p| p == pkg) {
                packages.push((*pkg).to_string());
            }
        }
        Self {
            packages,
            ..self.clone()
        }
    }

    /// Device node of a planned partition once the image is attached.
    pub fn partition_device(&self, entry: &LayoutEntry) -> String {
        partition_path(&self.loop_device, entry.index)
    }

    /// Host path of a path inside the image root.
    pub fn in_root(&self, path: &str) -> PathBuf {
        let relative = path.trim_start_matches('/');
        if relative.is_empty() {
            self.workdir.clone()
        } else {
            self.workdir.join(relative)
        }
    }

    pub fn root_path(&self) -> &Path {
        &self.workdir
    }

    /// Entries that get mounted: root first, then by nesting depth, ties in declaration order.
    pub fn mount_order(&self) -> Vec<&LayoutEntry> {
        let mut entries: Vec<&LayoutEntry> = self
            .layout
            .iter()
            .filter(|e| !e.is_extended() && !e.is_swap() && e.mountpoint.is_some())
            .collect();
        entries.sort_by_key(|e| {
            (
                !e.is_root(),
                e.mountpoint.as_ref().map(|m| m.depth()).unwrap_or_default(),
            )
        });
        entries
    }
}
