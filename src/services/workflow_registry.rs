//! Resolves a workflow name to its stage plan. Immutable once built;
//! grounded in the teacher's `Config::resolve_workflow` built-in
//! fallback list, generalized into a small registry type.

use std::collections::HashMap;

use thiserror::Error;

use crate::domain::models::{Stage, StageBlock, Workflow};

#[derive(Debug, Error)]
#[error("unknown workflow: {0}")]
pub struct UnknownWorkflowError(pub String);

pub struct WorkflowRegistry {
    workflows: HashMap<String, Workflow>,
}

impl WorkflowRegistry {
    /// Start from the compiled-in built-ins, then layer `extra` on top
    /// (a config-supplied workflow with the same name replaces a
    /// built-in of that name).
    pub fn new(extra: Vec<Workflow>) -> Self {
        let mut workflows = HashMap::new();
        for wf in built_in_workflows() {
            workflows.insert(wf.name.clone(), wf);
        }
        for wf in extra {
            workflows.insert(wf.name.clone(), wf);
        }
        Self { workflows }
    }

    pub fn resolve(&self, name: &str) -> Result<&Workflow, UnknownWorkflowError> {
        self.workflows
            .get(name)
            .ok_or_else(|| UnknownWorkflowError(name.to_string()))
    }

    pub fn blocks(&self, workflow: &Workflow) -> Vec<StageBlock> {
        workflow.blocks()
    }
}

fn built_in_workflows() -> Vec<Workflow> {
    vec![
        Workflow::new(
            "code",
            vec![
                Stage { name: "research".into(), agent: "researcher".into(), parallel_group: None },
                Stage { name: "plan".into(), agent: "architect".into(), parallel_group: None },
                Stage { name: "implement".into(), agent: "engineer".into(), parallel_group: None },
                Stage { name: "lint".into(), agent: "linter".into(), parallel_group: Some("qa".into()) },
                Stage { name: "test".into(), agent: "tester".into(), parallel_group: Some("qa".into()) },
                Stage { name: "review".into(), agent: "reviewer".into(), parallel_group: None },
            ],
        ),
        Workflow::new(
            "review-only",
            vec![
                Stage { name: "review".into(), agent: "reviewer".into(), parallel_group: None },
            ],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_built_in_workflow_by_name() {
        let registry = WorkflowRegistry::new(vec![]);
        let wf = registry.resolve("code").unwrap();
        assert_eq!(wf.stages.len(), 6);
    }

    #[test]
    fn unknown_workflow_name_errors() {
        let registry = WorkflowRegistry::new(vec![]);
        assert!(registry.resolve("does-not-exist").is_err());
    }

    #[test]
    fn extra_workflow_with_built_in_name_overrides_it() {
        let custom = Workflow::new(
            "code",
            vec![Stage { name: "solo".into(), agent: "generalist".into(), parallel_group: None }],
        );
        let registry = WorkflowRegistry::new(vec![custom]);
        let wf = registry.resolve("code").unwrap();
        assert_eq!(wf.stages.len(), 1);
    }

    #[test]
    fn blocks_groups_parallel_stages() {
        let registry = WorkflowRegistry::new(vec![]);
        let wf = registry.resolve("code").unwrap();
        let blocks = registry.blocks(wf);
        assert_eq!(blocks.len(), 5);
    }
}
