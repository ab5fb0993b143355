//! `taskrun.dev/v1` API group.

use serde::{Deserialize, Serialize};

use crate::define_resource;
use crate::meta::ObjectMeta;
use crate::scheme::Scheme;

/// API group served by the taskrun custom resource definition.
pub const GROUP: &str = "taskrun.dev";

/// A declared unit of work. The controller runs one child pod per
/// reconcile pass and flips `status.succeeded` once the pod is submitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    #[serde(default)]
    pub metadata: ObjectMeta,

    #[serde(default)]
    pub spec: TaskSpec,

    #[serde(default)]
    pub status: TaskStatus,
}

define_resource!(Task, group = "taskrun.dev", version = "v1", kind = "Task", plural = "tasks");

/// Desired effect of a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Text echoed by the child pod.
    #[serde(default)]
    pub message: String,
}

/// Observed state of a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    #[serde(default)]
    pub succeeded: bool,
}

impl Task {
    pub fn new(namespace: &str, name: &str, message: &str) -> Self {
        Self {
            metadata: ObjectMeta {
                name: name.to_string(),
                namespace: namespace.to_string(),
                ..Default::default()
            },
            spec: TaskSpec {
                message: message.to_string(),
            },
            status: TaskStatus::default(),
        }
    }
}

/// Registers this group's types.
pub fn add_to_scheme(scheme: &mut Scheme) {
    scheme.add_known_type::<Task>();
}
