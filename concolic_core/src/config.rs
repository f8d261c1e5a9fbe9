use crate::handler::{BranchHandler, BreakOnEveryBranch, BreakOnIds, NeverBreak};
use crate::trace::TraceRecorder;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;

/// How the dispatcher treats the branch handler's verdict.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BranchMode {
    /// A `true` verdict fires the breakpoint trigger.
    #[default]
    Verdict,
    /// Legacy notification-only mode: the branch handler is still called,
    /// but its verdict is ignored and the trigger never fires.
    NotifyOnly,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct BreakpointSettings {
    #[serde(default)]
    pub ids: Vec<u64>,
    #[serde(default)]
    pub on_every_branch: bool,
}

impl BreakpointSettings {
    /// Builds the branch policy described by this section.
    ///
    /// `on-every-branch` takes precedence over `ids`; with neither set the
    /// policy never requests intervention.
    pub fn build_handler(&self) -> Arc<dyn BranchHandler> {
        if self.on_every_branch {
            Arc::new(BreakOnEveryBranch)
        } else if self.ids.is_empty() {
            Arc::new(NeverBreak)
        } else {
            Arc::new(BreakOnIds::new(self.ids.iter().copied()))
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TraceSettings {
    #[serde(default)]
    pub max_entries: Option<usize>,
    #[serde(default = "default_record_branches")]
    pub record_branches: bool,
}

fn default_record_branches() -> bool {
    true
}

impl Default for TraceSettings {
    fn default() -> Self {
        Self {
            max_entries: None,
            record_branches: default_record_branches(),
        }
    }
}

impl TraceSettings {
    pub fn build_recorder(&self, verdict: Arc<dyn BranchHandler>) -> TraceRecorder {
        let recorder = TraceRecorder::new()
            .with_verdict(verdict)
            .record_branches(self.record_branches);
        match self.max_entries {
            Some(max) => recorder.with_max_entries(max),
            None => recorder,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct BridgeConfig {
    #[serde(default)]
    pub branch_mode: BranchMode,
    #[serde(default)]
    pub breakpoints: BreakpointSettings,
    #[serde(default)]
    pub trace: TraceSettings,
}

impl BridgeConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;
        Self::from_toml_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e))
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}
