// Operation values yielded by programs

pub mod callbacks;
pub mod program;

pub use program::*;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::executor::Context;

/// Method intent: which Response fields an operation surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    /// Read-only; surfaces `value`
    #[default]
    Get,
    /// Mutating; surfaces `changed`
    Put,
    /// Mutating; surfaces only success or error
    Post,
}

impl std::str::FromStr for Intent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "get" => Ok(Intent::Get),
            "put" => Ok(Intent::Put),
            "post" => Ok(Intent::Post),
            other => Err(format!("unknown intent '{}' (expected get, put or post)", other)),
        }
    }
}

/// Identity a remote command runs under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Escalation {
    #[default]
    None,
    Sudo,
    Su,
}

/// A user callback. Receives the per-yield Context; its return value becomes
/// the Response `value`. Return an `OperationError` to pick the error kind,
/// any other error is reported as `CallbackError`.
#[async_trait]
pub trait Callback: Send + Sync {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn call(&self, ctx: &mut Context) -> anyhow::Result<Value>;
}

/// Adapter turning a synchronous closure into a [`Callback`]
pub struct FnCallback<F> {
    name: String,
    func: F,
}

impl<F> FnCallback<F>
where
    F: Fn(&mut Context) -> anyhow::Result<Value> + Send + Sync,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        FnCallback {
            name: name.into(),
            func,
        }
    }
}

#[async_trait]
impl<F> Callback for FnCallback<F>
where
    F: Fn(&mut Context) -> anyhow::Result<Value> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, ctx: &mut Context) -> anyhow::Result<Value> {
        (self.func)(ctx)
    }
}

/// Wrap a closure as a shareable callback
pub fn callback<F>(name: impl Into<String>, func: F) -> Arc<dyn Callback>
where
    F: Fn(&mut Context) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    Arc::new(FnCallback::new(name, func))
}

/// Run a shell command on the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    pub command: String,
    pub escalation: Escalation,
    pub group: Option<String>,
    pub intent: Intent,
    pub label: Option<String>,
}

impl RemoteCommand {
    pub fn new(command: impl Into<String>) -> Self {
        RemoteCommand {
            command: command.into(),
            escalation: Escalation::None,
            group: None,
            intent: Intent::Get,
            label: None,
        }
    }

    pub fn sudo(mut self) -> Self {
        self.escalation = Escalation::Sudo;
        self
    }

    pub fn su(mut self) -> Self {
        self.escalation = Escalation::Su;
        self
    }

    pub fn escalation(mut self, escalation: Escalation) -> Self {
        self.escalation = escalation;
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn intent(mut self, intent: Intent) -> Self {
        self.intent = intent;
        self
    }

    pub fn put(self) -> Self {
        self.intent(Intent::Put)
    }

    pub fn post(self) -> Self {
        self.intent(Intent::Post)
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Run a callback that talks to the host over SSH/SFTP
#[derive(Clone)]
pub struct RemoteCallback {
    pub callback: Arc<dyn Callback>,
    pub params: Value,
    pub escalation: Escalation,
    pub group: Option<String>,
    pub intent: Intent,
    pub label: Option<String>,
}

impl RemoteCallback {
    pub fn new(callback: Arc<dyn Callback>, params: Value) -> Self {
        RemoteCallback {
            callback,
            params,
            escalation: Escalation::None,
            group: None,
            intent: Intent::Get,
            label: None,
        }
    }

    pub fn escalation(mut self, escalation: Escalation) -> Self {
        self.escalation = escalation;
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn intent(mut self, intent: Intent) -> Self {
        self.intent = intent;
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

impl fmt::Debug for RemoteCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteCallback")
            .field("callback", &self.callback.name())
            .field("params", &self.params)
            .field("escalation", &self.escalation)
            .field("group", &self.group)
            .field("intent", &self.intent)
            .field("label", &self.label)
            .finish()
    }
}

/// Produce a Response without touching the host
#[derive(Clone, Default)]
pub struct Passthrough {
    pub value: Option<Value>,
    pub changed: Option<bool>,
    pub callback: Option<Arc<dyn Callback>>,
    pub params: Value,
    pub group: Option<String>,
    pub intent: Intent,
    pub label: Option<String>,
}

impl Passthrough {
    /// Get-intent passthrough carrying `value`
    pub fn value(value: Value) -> Self {
        Passthrough {
            value: Some(value),
            intent: Intent::Get,
            ..Passthrough::default()
        }
    }

    /// Put-intent passthrough reporting `changed`
    pub fn changed(changed: bool) -> Self {
        Passthrough {
            changed: Some(changed),
            intent: Intent::Put,
            ..Passthrough::default()
        }
    }

    /// Post-intent passthrough: success with no payload
    pub fn post() -> Self {
        Passthrough {
            intent: Intent::Post,
            ..Passthrough::default()
        }
    }

    /// Passthrough whose outcome comes from a callback run without a session
    pub fn callback(callback: Arc<dyn Callback>, params: Value) -> Self {
        Passthrough {
            callback: Some(callback),
            params,
            ..Passthrough::default()
        }
    }

    pub fn intent(mut self, intent: Intent) -> Self {
        self.intent = intent;
        self
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_changed(mut self, changed: bool) -> Self {
        self.changed = Some(changed);
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

impl fmt::Debug for Passthrough {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Passthrough")
            .field("value", &self.value)
            .field("changed", &self.changed)
            .field("callback", &self.callback.as_ref().map(|c| c.name()))
            .field("group", &self.group)
            .field("intent", &self.intent)
            .field("label", &self.label)
            .finish()
    }
}

/// One unit of work yielded by a program
pub enum Operation {
    RemoteCommand(RemoteCommand),
    RemoteCallback(RemoteCallback),
    Passthrough(Passthrough),
    /// A nested program, run to completion before the parent resumes
    Composite(Box<dyn Program>),
}

impl Operation {
    /// Shorthand for a plain Get-intent command
    pub fn command(command: impl Into<String>) -> Self {
        Operation::RemoteCommand(RemoteCommand::new(command))
    }

    pub fn nested(program: impl Program + 'static) -> Self {
        Operation::Composite(Box::new(program))
    }

    /// Group filter, if any. Composites have none.
    pub fn group(&self) -> Option<&str> {
        match self {
            Operation::RemoteCommand(op) => op.group.as_deref(),
            Operation::RemoteCallback(op) => op.group.as_deref(),
            Operation::Passthrough(op) => op.group.as_deref(),
            Operation::Composite(_) => None,
        }
    }

    pub fn intent(&self) -> Option<Intent> {
        match self {
            Operation::RemoteCommand(op) => Some(op.intent),
            Operation::RemoteCallback(op) => Some(op.intent),
            Operation::Passthrough(op) => Some(op.intent),
            Operation::Composite(_) => None,
        }
    }

    pub fn label(&self) -> Option<&str> {
        match self {
            Operation::RemoteCommand(op) => op.label.as_deref(),
            Operation::RemoteCallback(op) => op.label.as_deref(),
            Operation::Passthrough(op) => op.label.as_deref(),
            Operation::Composite(_) => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Operation::RemoteCommand(_) => "RemoteCommand",
            Operation::RemoteCallback(_) => "RemoteCallback",
            Operation::Passthrough(_) => "Passthrough",
            Operation::Composite(_) => "Composite",
        }
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::RemoteCommand(op) => fmt::Debug::fmt(op, f),
            Operation::RemoteCallback(op) => fmt::Debug::fmt(op, f),
            Operation::Passthrough(op) => fmt::Debug::fmt(op, f),
            Operation::Composite(_) => f.write_str("Composite(..)"),
        }
    }
}

impl From<RemoteCommand> for Operation {
    fn from(op: RemoteCommand) -> Self {
        Operation::RemoteCommand(op)
    }
}

impl From<RemoteCallback> for Operation {
    fn from(op: RemoteCallback) -> Self {
        Operation::RemoteCallback(op)
    }
}

impl From<Passthrough> for Operation {
    fn from(op: Passthrough) -> Self {
        Operation::Passthrough(op)
    }
}

impl From<Box<dyn Program>> for Operation {
    fn from(program: Box<dyn Program>) -> Self {
        Operation::Composite(program)
    }
}

impl From<&str> for Operation {
    fn from(command: &str) -> Self {
        Operation::command(command)
    }
}

impl From<String> for Operation {
    fn from(command: String) -> Self {
        Operation::command(command)
    }
}
