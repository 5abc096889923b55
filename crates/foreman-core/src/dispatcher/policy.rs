//! What happens when a stage fails.

use serde::{Deserialize, Serialize};

use foreman_db::models::Stage;

/// Failure handling knobs.
///
/// A failed stage always records a finding against its last run. The
/// finding is blocking when the stage is in `blocking_stages` or the run
/// timed out; a blocking finding parks the item as `blocked` and, when
/// `spawn_remediation` is set and the item sits fewer than
/// `max_remediation_depth` levels below its root, spawns a remediation
/// child task. Non-blocking failures mark the item `failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailurePolicy {
    pub blocking_stages: Vec<Stage>,
    pub spawn_remediation: bool,
    pub max_remediation_depth: usize,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            blocking_stages: vec![Stage::Execute, Stage::Test],
            spawn_remediation: true,
            max_remediation_depth: 2,
        }
    }
}

impl FailurePolicy {
    pub fn is_blocking(&self, stage: Stage, timed_out: bool) -> bool {
        timed_out || self.blocking_stages.contains(&stage)
    }

    /// Whether an item at `depth` (0 = root) may spawn a remediation child.
    pub fn may_remediate(&self, depth: usize) -> bool {
        self.spawn_remediation && depth < self.max_remediation_depth
    }
}
