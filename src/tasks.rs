//! Task execution.
//!
//! Tasks are non-process hooks declared in the descriptor, split into
//! pre-start and post-stop phases. They run sequentially; a failing task is
//! logged and the sequence continues. `${VAR}` references in the command and
//! its arguments are expanded against the process environment before spawn.

use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::schema::{TaskSpec, Tasks};

fn var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap())
}

/// Expands `${VAR}` references against `env`. Unknown variables are left
/// intact so the spawned command sees what the schema declared.
pub fn expand_vars(input: &str, env: &HashMap<String, String>) -> String {
    var_pattern()
        .replace_all(input, |caps: &regex::Captures<'_>| {
            match env.get(&caps[1]) {
                Some(value) => value.clone(),
                None => {
                    tracing::debug!("Unresolved variable reference: {}", &caps[0]);
                    caps[0].to_string()
                }
            }
        })
        .into_owned()
}

/// Runs the descriptor's task hooks.
#[derive(Debug, Default)]
pub struct TaskHandler {
    pre_start: Vec<TaskSpec>,
    post_stop: Vec<TaskSpec>,
    env: HashMap<String, String>,
}

impl TaskHandler {
    pub fn new(tasks: Option<&Tasks>, env: HashMap<String, String>) -> Self {
        match tasks {
            Some(tasks) => Self {
                pre_start: tasks.pre_start.clone(),
                post_stop: tasks.post_stop.clone(),
                env,
            },
            None => Self {
                env,
                ..Self::default()
            },
        }
    }

    pub async fn exec_pre_start_tasks(&self) {
        for task in &self.pre_start {
            self.exec_task(task).await;
        }
    }

    pub async fn exec_post_stop_tasks(&self) {
        for task in &self.post_stop {
            self.exec_task(task).await;
        }
    }

    async fn exec_task(&self, task: &TaskSpec) {
        let command = expand_vars(&task.command, &self.env);
        let args: Vec<String> = task
            .args
            .iter()
            .map(|a| expand_vars(a, &self.env))
            .collect();
        tracing::info!(task = %task.name, %command, "Executing task");

        let result = tokio::process::Command::new(&command)
            .args(&args)
            .envs(&self.env)
            .status()
            .await;
        match result {
            Ok(status) if status.success() => {
                tracing::info!(task = %task.name, "Task completed");
            }
            Ok(status) => {
                tracing::warn!(task = %task.name, %status, "Task failed; continuing");
            }
            Err(e) => {
                tracing::warn!(task = %task.name, error = %e, "Task could not be spawned; continuing");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn expands_known_variables() {
        let env = env(&[("DB_HOST", "10.0.0.2"), ("DB_PORT", "5432")]);
        assert_eq!(
            expand_vars("postgres://${DB_HOST}:${DB_PORT}/app", &env),
            "postgres://10.0.0.2:5432/app"
        );
    }

    #[test]
    fn leaves_unknown_variables_intact() {
        let env = env(&[]);
        assert_eq!(expand_vars("${MISSING}/x", &env), "${MISSING}/x");
    }

    #[test]
    fn ignores_malformed_references() {
        let env = env(&[("A", "1")]);
        assert_eq!(expand_vars("$A ${ } ${1BAD}", &env), "$A ${ } ${1BAD}");
    }

    #[tokio::test]
    async fn failing_task_does_not_abort_sequence() {
        let tasks = Tasks {
            pre_start: vec![
                TaskSpec {
                    name: "fails".to_string(),
                    command: "/bin/false".to_string(),
                    args: vec![],
                },
                TaskSpec {
                    name: "succeeds".to_string(),
                    command: "/bin/true".to_string(),
                    args: vec![],
                },
            ],
            post_stop: vec![],
        };
        // Completes despite the first task failing.
        TaskHandler::new(Some(&tasks), HashMap::new())
            .exec_pre_start_tasks()
            .await;
    }
}
