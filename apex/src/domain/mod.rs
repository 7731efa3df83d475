//! Workflow/stage definitions and the before/after snapshots the interaction
//! manager diffs against.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use apex_store::{Task, Usage};

/// One unit of agent execution within a [`Workflow`], checkpointed at its
/// boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    pub agent_kind: String,
}

/// A named, ordered list of stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,
    pub stages: Vec<Stage>,
}

impl Workflow {
    pub fn stage_index(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name == name)
    }

    pub fn first_stage(&self) -> Option<&Stage> {
        self.stages.first()
    }
}

/// Lookup table from workflow name to its stage list.
///
/// Workflows are a fixed set known to the daemon binary, with no
/// user-authoring surface; `with_defaults` seeds the one workflow every
/// task implicitly uses unless a caller registers more.
#[derive(Debug, Clone)]
pub struct WorkflowRegistry {
    workflows: HashMap<String, Workflow>,
}

impl WorkflowRegistry {
    pub fn with_defaults() -> Self {
        let mut workflows = HashMap::new();
        workflows.insert(
            "default".to_string(),
            Workflow {
                name: "default".to_string(),
                stages: vec![
                    Stage {
                        name: "plan".to_string(),
                        agent_kind: "planner".to_string(),
                    },
                    Stage {
                        name: "implement".to_string(),
                        agent_kind: "coder".to_string(),
                    },
                    Stage {
                        name: "validate".to_string(),
                        agent_kind: "validator".to_string(),
                    },
                ],
            },
        );
        Self { workflows }
    }

    pub fn register(&mut self, workflow: Workflow) {
        self.workflows.insert(workflow.name.clone(), workflow);
    }

    pub fn get(&self, name: &str) -> Option<&Workflow> {
        self.workflows.get(name)
    }
}

impl Default for WorkflowRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Files touched, split by whether they existed before the snapshot window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSet {
    pub created: Vec<String>,
    pub modified: Vec<String>,
}

/// Point-in-time capture of a task used to compute iteration diffs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub timestamp: DateTime<Utc>,
    pub stage: Option<String>,
    pub status: String,
    pub files: FileSet,
    pub usage: Usage,
    pub artifact_count: usize,
}

impl Snapshot {
    /// Capture the task's current observable state. `files` reflects the
    /// artifact paths recorded so far; the interaction manager diffs two of
    /// these snapshots rather than hashing the working tree directly.
    pub fn capture(task: &Task) -> Self {
        let modified = task.artifacts.iter().filter_map(|a| a.path.clone()).collect();
        Self {
            timestamp: Utc::now(),
            stage: task.stage.clone(),
            status: task.status.to_string(),
            files: FileSet {
                created: Vec::new(),
                modified,
            },
            usage: task.usage,
            artifact_count: task.artifacts.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_has_default_workflow_with_three_stages() {
        let registry = WorkflowRegistry::with_defaults();
        let workflow = registry.get("default").unwrap();
        assert_eq!(workflow.stages.len(), 3);
        assert_eq!(workflow.stage_index("implement"), Some(1));
    }

    #[test]
    fn unknown_workflow_name_returns_none() {
        let registry = WorkflowRegistry::with_defaults();
        assert!(registry.get("nonexistent").is_none());
    }

    #[test]
    fn snapshot_captures_artifact_paths_as_modified_files() {
        let mut task = Task::new("/proj", "default", "do the thing");
        task.artifacts.push(apex_store::Artifact {
            task_id: task.id.clone(),
            name: "diff".to_string(),
            artifact_type: "diff".to_string(),
            path: Some("src/lib.rs".to_string()),
            content: None,
            created_at: "2026-01-01T00:00:00Z".to_string(),
        });

        let snapshot = Snapshot::capture(&task);
        assert_eq!(snapshot.files.modified, vec!["src/lib.rs".to_string()]);
        assert_eq!(snapshot.artifact_count, 1);
    }
}
