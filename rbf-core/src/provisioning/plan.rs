use super::directive::Directive;
use rbf_error::ProvisionCode;
use serde::{Serialize, Serializer};
use std::fmt;
use std::path::PathBuf;

/// What a failing stage does to the rest of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Exit with the stage code; the cleanup plan runs afterwards.
    Abort,
    /// Report the stage code and keep going.
    Warn,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisioningStage {
    pub name: &'static str,
    pub description: String,
    pub directives: Vec<Directive>,
    #[serde(serialize_with = "serialize_code")]
    pub code: ProvisionCode,
    pub policy: FailurePolicy,
    /// The cleanup plan has to undo what this stage acquires.
    pub teardown: bool,
}

fn serialize_code<S: Serializer>(code: &ProvisionCode, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(code.name())
}

impl ProvisioningStage {
    pub fn new(
        name: &'static str,
        description: impl Into<String>,
        code: ProvisionCode,
        policy: FailurePolicy,
    ) -> Self {
        Self {
            name,
            description: description.into(),
            directives: Vec::new(),
            code,
            policy,
            teardown: false,
        }
    }

    pub fn abort(name: &'static str, description: impl Into<String>, code: ProvisionCode) -> Self {
        Self::new(name, description, code, FailurePolicy::Abort)
    }

    pub fn warn(name: &'static str, description: impl Into<String>, code: ProvisionCode) -> Self {
        Self::new(name, description, code, FailurePolicy::Warn)
    }

    pub fn with(mut self, directive: Directive) -> Self {
        self.directives.push(directive);
        self
    }

    pub fn with_all(mut self, directives: impl IntoIterator<Item = Directive>) -> Self {
        self.directives.extend(directives);
        self
    }

    pub fn with_teardown(mut self) -> Self {
        self.teardown = true;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.directives.is_empty()
    }
}

/// Frozen, ordered stage list. Only [`PlanBuilder::finish`] creates one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisioningPlan {
    stages: Vec<ProvisioningStage>,
}

impl ProvisioningPlan {
    pub fn stages(&self) -> &[ProvisioningStage] {
        &self.stages
    }

    pub fn stage(&self, name: &str) -> Option<&ProvisioningStage> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// First stage that can exit with `code`, either through its own guard or through a
    /// block-device assertion inside it.
    pub fn stage_for_code(&self, code: ProvisionCode) -> Option<&ProvisioningStage> {
        self.stages.iter().find(|s| {
            s.code == code
                || (code == ProvisionCode::PartitionDoesNotExist
                    && s.directives
                        .iter()
                        .any(|d| matches!(d, Directive::RequireBlockDevice { .. })))
        })
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// A new plan holding only the named stages, in their original order.
    pub fn subset(&self, names: &[&str]) -> ProvisioningPlan {
        ProvisioningPlan {
            stages: self
                .stages
                .iter()
                .filter(|s| names.contains(&s.name))
                .cloned()
                .collect(),
        }
    }

    /// Every mount target, in the order the plan mounts them.
    pub fn mount_sequence(&self) -> Vec<&PathBuf> {
        self.all_directives()
            .filter_map(Directive::mount_target)
            .collect()
    }

    pub fn unmount_sequence(&self) -> Vec<&PathBuf> {
        self.all_directives()
            .filter_map(Directive::unmount_target)
            .collect()
    }

    fn all_directives(&self) -> impl Iterator<Item = &Directive> {
        self.stages.iter().flat_map(|s| s.directives.iter())
    }

    pub fn summary_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        lines.push("Provisioning plan:".to_string());
        for (idx, stage) in self.stages.iter().enumerate() {
            let policy = match stage.policy {
                FailurePolicy::Abort => "abort",
                FailurePolicy::Warn => "warn",
            };
            lines.push(format!(
                "{:02}. {} [{} {}] {}",
                idx + 1,
                stage.name,
                policy,
                stage.code.code(),
                stage.description
            ));
        }
        lines
    }
}

impl fmt::Display for ProvisioningPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in self.summary_lines() {
            writeln!(f, "{}", line)?;
        }
        Ok(())
    }
}

/// Append-only plan assembly.
#[derive(Debug, Default)]
pub struct PlanBuilder {
    stages: Vec<ProvisioningStage>,
}

impl PlanBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage. Stages without directives are dropped; order is never changed.
    pub fn push(&mut self, stage: ProvisioningStage) -> &mut Self {
        if stage.is_empty() {
            log::debug!("Skipping empty stage {}", stage.name);
        } else {
            self.stages.push(stage);
        }
        self
    }

    pub fn push_all(&mut self, stages: impl IntoIterator<Item = ProvisioningStage>) -> &mut Self {
        for stage in stages {
            self.push(stage);
        }
        self
    }

    pub fn finish(self) -> ProvisioningPlan {
        ProvisioningPlan {
            stages: self.stages,
        }
    }
}
