//! Workflow definitions: an ordered plan of stages, possibly with
//! parallel blocks, that a task executes from start to completion.

use serde::{Deserialize, Serialize};

/// One stage within a workflow: names the agent invoked and may belong
/// to a parallel group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    pub agent: String,
    pub parallel_group: Option<String>,
}

/// An immutable, named workflow: an ordered list of stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,
    pub stages: Vec<Stage>,
}

impl Workflow {
    pub fn new(name: impl Into<String>, stages: Vec<Stage>) -> Self {
        Self {
            name: name.into(),
            stages,
        }
    }

    /// Group the flat stage list into blocks: consecutive stages sharing
    /// a parallel group tag collapse into one `StageBlock::Parallel`;
    /// everything else is `StageBlock::Single`. Members of a block must
    /// all complete before the plan advances to the next block.
    pub fn blocks(&self) -> Vec<StageBlock> {
        let mut blocks = Vec::new();
        let mut i = 0;
        while i < self.stages.len() {
            let stage = &self.stages[i];
            match &stage.parallel_group {
                None => {
                    blocks.push(StageBlock::Single(stage.clone()));
                    i += 1;
                }
                Some(group) => {
                    let mut members = vec![stage.clone()];
                    let mut j = i + 1;
                    while j < self.stages.len()
                        && self.stages[j].parallel_group.as_deref() == Some(group.as_str())
                    {
                        members.push(self.stages[j].clone());
                        j += 1;
                    }
                    blocks.push(StageBlock::Parallel {
                        group: group.clone(),
                        members,
                    });
                    i = j;
                }
            }
        }
        blocks
    }
}

/// A unit the Scheduler advances the workflow cursor by.
#[derive(Debug, Clone)]
pub enum StageBlock {
    Single(Stage),
    Parallel { group: String, members: Vec<Stage> },
}
