use herald_common::ArtifactKey;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepKind {
    Authenticate,
    Upload,
    Commit,
    Confirm,
    Custom(String),
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Authenticate => f.write_str("authenticate"),
            Self::Upload => f.write_str("upload"),
            Self::Commit => f.write_str("commit"),
            Self::Confirm => f.write_str("confirm"),
            Self::Custom(name) => f.write_str(name),
        }
    }
}

const fn default_weight() -> f32 {
    1.0
}

/// One step of a channel's delivery plan
///
/// A step that names an `artifact` is skipped when the message already holds
/// that artifact. A step marked `commits` is the point of no return: once it
/// succeeds the remote side holds the message and the attempt can no longer be
/// cancelled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDescriptor {
    pub kind: StepKind,

    #[serde(default)]
    pub artifact: Option<ArtifactKey>,

    #[serde(default)]
    pub commits: bool,

    /// Share of the overall progress this step accounts for
    #[serde(default = "default_weight")]
    pub weight: f32,
}

impl StepDescriptor {
    #[must_use]
    pub const fn new(kind: StepKind) -> Self {
        Self {
            kind,
            artifact: None,
            commits: false,
            weight: default_weight(),
        }
    }

    #[must_use]
    pub fn produces(mut self, artifact: impl Into<ArtifactKey>) -> Self {
        self.artifact = Some(artifact.into());
        self
    }

    #[must_use]
    pub const fn committing(mut self) -> Self {
        self.commits = true;
        self
    }

    #[must_use]
    pub const fn weighted(mut self, weight: f32) -> Self {
        self.weight = weight;
        self
    }
}

/// Authenticate, upload the recording, commit the message, confirm receipt
#[must_use]
pub fn standard_plan() -> Vec<StepDescriptor> {
    vec![
        StepDescriptor::new(StepKind::Authenticate).weighted(0.5),
        StepDescriptor::new(StepKind::Upload)
            .produces("uploaded_url")
            .weighted(3.0),
        StepDescriptor::new(StepKind::Commit)
            .produces("canonical_url")
            .committing(),
        StepDescriptor::new(StepKind::Confirm).weighted(0.5),
    ]
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_step_from_ron_uses_defaults() {
        let step: StepDescriptor = ron::from_str("(kind: Upload, artifact: Some(\"uploaded_url\"))").unwrap();
        assert_eq!(
            step,
            StepDescriptor::new(StepKind::Upload).produces("uploaded_url")
        );
    }

    #[test]
    fn test_standard_plan_has_single_commit() {
        let plan = standard_plan();
        assert_eq!(plan.iter().filter(|step| step.commits).count(), 1);
        assert_eq!(plan[2].kind, StepKind::Commit);
    }

    #[test]
    fn test_custom_step_display() {
        assert_eq!(StepKind::Custom("transcode".into()).to_string(), "transcode");
        assert_eq!(StepKind::Upload.to_string(), "upload");
    }
}
