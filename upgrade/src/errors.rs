use std::path::PathBuf;

use thiserror::Error;

/// Errors ending an upgrade.
#[derive(Debug, Error)]
pub enum UpgradeError {
    /// The running binary was replaced. The process must exit so the
    /// supervisor starts the new one.
    #[error("restart needed")]
    RestartNeeded,

    #[error("failed to fetch {package}: {source}")]
    Fetch {
        package: String,
        #[source]
        source: zos_flist::Error,
    },

    #[error("failed to install {}: {source}", path.display())]
    Copy {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("failed to resolve {package}: {source}")]
    Resolve {
        package: String,
        #[source]
        source: zos_flist::Error,
    },
}

impl UpgradeError {
    pub(crate) fn copy(
        path: impl Into<PathBuf>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        UpgradeError::Copy {
            path: path.into(),
            source: source.into(),
        }
    }
}

/// How a single upgrade step went.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum StepOutcome {
    #[default]
    Ok,
    Skipped,
    /// The step went through, but some parts of it failed.
    Degraded(Vec<String>),
}

impl StepOutcome {
    pub(crate) fn from_failures(failures: Vec<String>) -> Self {
        if failures.is_empty() {
            StepOutcome::Ok
        } else {
            StepOutcome::Degraded(failures)
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, StepOutcome::Degraded(_))
    }
}

/// Outcome of each step of [crate::Upgrader::upgrade].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UpgradeReport {
    pub self_upgrade: StepOutcome,
    pub uninstall: StepOutcome,
    pub install: StepOutcome,
    pub restart: StepOutcome,
}

impl UpgradeReport {
    pub fn is_degraded(&self) -> bool {
        [
            &self.self_upgrade,
            &self.uninstall,
            &self.install,
            &self.restart,
        ]
        .iter()
        .any(|s| s.is_degraded())
    }
}
