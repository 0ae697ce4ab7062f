// Per-host, per-operation results

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::{ErrorKind, OperationError};

/// Outcome of one yielded operation on one host.
///
/// `value` and `changed` are present or absent according to the operation's
/// method intent: Get carries `value`, Put carries `changed`, Post neither.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub host: String,
    pub error: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changed: Option<bool>,

    /// Failure classification, when `error` is set
    #[serde(skip)]
    pub kind: Option<ErrorKind>,
    /// Position of the operation in this host's yield sequence
    #[serde(skip)]
    pub index: usize,
    #[serde(skip)]
    pub label: Option<String>,
}

impl Response {
    pub fn ok(host: impl Into<String>) -> Self {
        Response {
            host: host.into(),
            error: false,
            message: String::new(),
            value: None,
            changed: None,
            kind: None,
            index: 0,
            label: None,
        }
    }

    pub fn failed(host: impl Into<String>, err: &OperationError) -> Self {
        Response {
            error: true,
            message: err.to_string(),
            kind: Some(err.kind),
            ..Response::ok(host)
        }
    }

    /// What a parent program sees when a nested program ran out without
    /// returning anything: a Post-shaped, unchanged success.
    pub fn neutral(host: impl Into<String>) -> Self {
        Response::ok(host).with_changed(false)
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_changed(mut self, changed: bool) -> Self {
        self.changed = Some(changed);
        self
    }

    pub fn with_index(mut self, index: usize) -> Self {
        self.index = index;
        self
    }

    pub fn with_label(mut self, label: Option<String>) -> Self {
        self.label = label;
        self
    }

    pub fn is_ok(&self) -> bool {
        !self.error
    }

    /// The completed-process record, when this Response came from a
    /// Get-intent remote command.
    pub fn completed_process(&self) -> Option<CompletedProcess> {
        self.value
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn stdout(&self) -> Option<String> {
        self.completed_process().map(|p| p.stdout)
    }
}

/// Signal details of a killed process: name, core dumped, message, language.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitSignal(pub String, pub bool, pub String, pub String);

impl ExitSignal {
    pub fn named(name: impl Into<String>) -> Self {
        ExitSignal(name.into(), false, String::new(), String::new())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

/// The `value` of a successful Get-intent remote command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedProcess {
    /// The command as the program wrote it, before escalation wrapping
    pub command: String,
    pub exit_status: i32,
    pub exit_signal: Option<ExitSignal>,
    pub returncode: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CompletedProcess {
    pub fn new(
        command: impl Into<String>,
        exit_status: i32,
        exit_signal: Option<ExitSignal>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) -> Self {
        let returncode = match &exit_signal {
            Some(signal) => signal_number(signal.name()).map(|n| -n).unwrap_or(-1),
            None => exit_status,
        };
        CompletedProcess {
            command: command.into(),
            exit_status: if exit_signal.is_some() { -1 } else { exit_status },
            exit_signal,
            returncode,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_signal.is_none() && self.exit_status == 0
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

const SIGNALS: &[(&str, i32)] = &[
    ("HUP", 1),
    ("INT", 2),
    ("QUIT", 3),
    ("ILL", 4),
    ("TRAP", 5),
    ("ABRT", 6),
    ("BUS", 7),
    ("FPE", 8),
    ("KILL", 9),
    ("USR1", 10),
    ("SEGV", 11),
    ("USR2", 12),
    ("PIPE", 13),
    ("ALRM", 14),
    ("TERM", 15),
];

/// Signal number for a name as reported by SSH (`TERM`, `KILL`, ...).
pub fn signal_number(name: &str) -> Option<i32> {
    let name = name.strip_prefix("SIG").unwrap_or(name);
    SIGNALS.iter().find(|(n, _)| *n == name).map(|(_, num)| *num)
}

/// Signal name for a number, as the local transport reports it.
pub fn signal_name(number: i32) -> String {
    SIGNALS
        .iter()
        .find(|(_, num)| *num == number)
        .map(|(n, _)| n.to_string())
        .unwrap_or_else(|| format!("SIG{}", number))
}
