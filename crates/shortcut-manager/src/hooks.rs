//! Pre/post hook actions run around a shortcut launch.
//!
//! Hooks are static configuration: each hook id maps to a list of `pre`
//! commands, run before the shortcut starts, and `post` commands, run once it
//! has stopped. A shortcut lists the hooks it wants; actions run in that order,
//! for both phases.

use crate::process::DEFAULT_SHELL;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// The actions configured for one hook id
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HookDefinition {
    /// Human-readable description
    pub description: String,
    /// Commands run before launch
    pub pre: Vec<String>,
    /// Commands run after the shortcut stops
    pub post: Vec<String>,
}

/// One resolved command, tagged with the hook it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookAction {
    pub hook: String,
    pub cmd: String,
}

/// Ordered actions for a single launch
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HookPlan {
    pub pre: Vec<HookAction>,
    pub post: Vec<HookAction>,
}

impl HookPlan {
    /// True when there is nothing to run in either phase
    pub fn is_empty(&self) -> bool {
        self.pre.is_empty() && self.post.is_empty()
    }
}

/// Resolves hook ids and executes their actions
#[derive(Debug, Clone)]
pub struct HookEngine {
    hooks: BTreeMap<String, HookDefinition>,
    shell: PathBuf,
    timeout: Option<Duration>,
}

impl Default for HookEngine {
    fn default() -> Self {
        Self::new(BTreeMap::new())
    }
}

impl HookEngine {
    /// Create an engine over the given hook table
    pub fn new(hooks: BTreeMap<String, HookDefinition>) -> Self {
        Self {
            hooks,
            shell: PathBuf::from(DEFAULT_SHELL),
            timeout: None,
        }
    }

    /// Set the shell used to run actions
    pub fn with_shell(mut self, shell: impl Into<PathBuf>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Bound each action; an action still running after `timeout` is killed and fails
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Configured hook ids and their definitions
    pub fn definitions(&self) -> &BTreeMap<String, HookDefinition> {
        &self.hooks
    }

    /// Turn a shortcut's hook ids into ordered actions.
    ///
    /// Actions follow the order of `hook_ids`, then each hook's own order.
    pub fn resolve(&self, hook_ids: &[String]) -> Result<HookPlan> {
        let mut plan = HookPlan::default();
        for id in hook_ids {
            let def = self
                .hooks
                .get(id)
                .ok_or_else(|| Error::Hook(format!("Unknown hook '{id}'")))?;
            plan.pre.extend(def.pre.iter().map(|cmd| HookAction {
                hook: id.clone(),
                cmd: cmd.clone(),
            }));
            plan.post.extend(def.post.iter().map(|cmd| HookAction {
                hook: id.clone(),
                cmd: cmd.clone(),
            }));
        }
        Ok(plan)
    }

    /// Run pre actions in order, stopping at the first failure
    pub async fn run_pre(&self, plan: &HookPlan, env: &[(String, String)]) -> Result<()> {
        for action in &plan.pre {
            self.run_action(action, env).await?;
        }
        Ok(())
    }

    /// Run every post action in order. Failures are logged and skipped.
    ///
    /// Returns the number of actions that failed.
    pub async fn run_post(&self, plan: &HookPlan, env: &[(String, String)]) -> usize {
        let mut failed = 0;
        for action in &plan.post {
            if let Err(e) = self.run_action(action, env).await {
                warn!("Post hook failed: {}", e);
                failed += 1;
            }
        }
        failed
    }

    #[tracing::instrument(skip(self, env), fields(hook = %action.hook, cmd = %action.cmd))]
    async fn run_action(&self, action: &HookAction, env: &[(String, String)]) -> Result<()> {
        debug!("Running hook action");

        let mut command = Command::new(&self.shell);
        command
            .arg("-c")
            .arg(&action.cmd)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env("SHORTCUT_HOOK", &action.hook)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = command.output();
        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, output).await.map_err(|_| {
                Error::Hook(format!(
                    "Hook '{}' action '{}' timed out after {:?}",
                    action.hook, action.cmd, limit
                ))
            })?,
            None => output.await,
        }
        .map_err(|e| {
            Error::Hook(format!(
                "Hook '{}' action '{}' failed to start: {e}",
                action.hook, action.cmd
            ))
        })?;

        if output.status.success() {
            info!("Hook action finished");
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(Error::Hook(format!(
                "Hook '{}' action '{}' failed ({}): {}",
                action.hook,
                action.cmd,
                output.status,
                stderr.trim()
            )))
        }
    }
}
