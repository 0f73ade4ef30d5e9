//! Process and task declarations.

use serde::{Deserialize, Serialize};

/// A process specification: an executable plus its invocation context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Human-readable name used in logs.
    pub name: String,

    /// Path to the executable.
    pub path: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Working directory for the process. Defaults to the broker's own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<String>,
}

impl Resource {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            args: Vec::new(),
            work_dir: None,
        }
    }

    pub fn with_args(mut self, args: &[&str]) -> Self {
        self.args = args.iter().map(|a| a.to_string()).collect();
        self
    }

    /// A resource is runnable when it names an executable.
    pub fn is_runnable(&self) -> bool {
        !self.path.is_empty()
    }
}

/// An ordered triple of processes: everything before the main process, the
/// main (long-running) process itself, and everything after it.
///
/// The position of a resource in the group is what drives its handling;
/// `pre_main[i]` completes before `pre_main[i + 1]` starts, all of `pre_main`
/// completes before `main`, and `main` must be ready before `post_main[0]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessGroup {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre_main: Vec<Resource>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main: Option<Resource>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_main: Vec<Resource>,
}

impl ProcessGroup {
    pub fn is_empty(&self) -> bool {
        self.pre_main.is_empty() && self.main.is_none() && self.post_main.is_empty()
    }

    /// All resources in execution order.
    pub fn ordered(&self) -> Vec<&Resource> {
        let mut out: Vec<&Resource> = self.pre_main.iter().collect();
        if let Some(main) = &self.main {
            out.push(main);
        }
        out.extend(self.post_main.iter());
        out
    }
}

/// A non-process action declared in the descriptor. Arguments may reference
/// process environment variables with `${VAR}` syntax.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

/// Task hooks around the process groups.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tasks {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre_start: Vec<TaskSpec>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_stop: Vec<TaskSpec>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordered_runs_pre_main_post() {
        let group = ProcessGroup {
            pre_main: vec![Resource::new("a", "/bin/a"), Resource::new("b", "/bin/b")],
            main: Some(Resource::new("m", "/bin/m")),
            post_main: vec![Resource::new("c", "/bin/c")],
        };
        let names: Vec<&str> = group.ordered().iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["a", "b", "m", "c"]);
    }

    #[test]
    fn empty_group_is_empty() {
        assert!(ProcessGroup::default().is_empty());
    }
}
