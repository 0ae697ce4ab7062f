// Privilege escalation: sudo and su wrappers around remote commands

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use super::{shell_escape, Connection, ProcessRequest, PtySize, RawOutput};
use crate::inventory::Host;
use crate::operation::Escalation;
use crate::output::errors::{ErrorKind, OperationError};

/// Replacement for any credential found in output
pub const REDACTED: &str = "********";

static SUDO_PROMPT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[sudo\] password for [^:\r\n]*: ?(\r?\n)?").expect("static regex")
});

/// Verdict on one attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assessment {
    Complete,
    RetryWithPty,
    Fail(OperationError),
}

/// One way of running a command under a (possibly) different identity
pub trait EscalationStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Process request for the given attempt (0-based)
    fn request(&self, command: &str, attempt: u32, pty: PtySize) -> ProcessRequest;

    /// Classify the output of an attempt
    fn assess(&self, output: &RawOutput, attempt: u32) -> Assessment;

    /// Credentials that must never appear in output
    fn secrets(&self) -> Vec<&str>;
}

/// No escalation
pub struct Direct;

impl EscalationStrategy for Direct {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn request(&self, command: &str, _attempt: u32, _pty: PtySize) -> ProcessRequest {
        ProcessRequest::new(command)
    }

    fn assess(&self, _output: &RawOutput, _attempt: u32) -> Assessment {
        Assessment::Complete
    }

    fn secrets(&self) -> Vec<&str> {
        Vec::new()
    }
}

/// `sudo -S`: password on stdin, PTY only when sudo insists on one
pub struct Sudo {
    user: String,
    password: Option<Zeroizing<String>>,
}

impl Sudo {
    pub fn new(user: impl Into<String>, password: Option<&str>) -> Self {
        Sudo {
            user: user.into(),
            password: password.map(|p| Zeroizing::new(p.to_string())),
        }
    }

    pub fn for_host(host: &Host) -> Self {
        let auth = &host.authentication;
        Sudo::new(
            auth.sudo_user.as_deref().unwrap_or("root"),
            auth.sudo_password.as_ref().map(|s| s.expose()),
        )
    }
}

impl EscalationStrategy for Sudo {
    fn name(&self) -> &'static str {
        "sudo"
    }

    fn request(&self, command: &str, attempt: u32, pty: PtySize) -> ProcessRequest {
        let request = match &self.password {
            Some(password) => ProcessRequest::new(format!(
                "sudo -S -u {} -- sh -c {}",
                shell_escape(&self.user),
                shell_escape(command)
            ))
            .with_feed(password, None),
            None => ProcessRequest::new(format!(
                "sudo -n -u {} -- sh -c {}",
                shell_escape(&self.user),
                shell_escape(command)
            )),
        };

        if attempt > 0 {
            request.with_pty(pty)
        } else {
            request
        }
    }

    fn assess(&self, output: &RawOutput, attempt: u32) -> Assessment {
        if output.success() {
            return Assessment::Complete;
        }

        let text = format!("{}\n{}", output.stderr, output.stdout);
        if text.contains("no tty present") || text.contains("a terminal is required") {
            if attempt == 0 {
                return Assessment::RetryWithPty;
            }
            return Assessment::Fail(OperationError::new(
                ErrorKind::EscalationRequiresTTY,
                format!("sudo as {} requires a terminal", self.user),
            ));
        }

        if text.contains("Sorry, try again")
            || text.contains("password required")
            || text.contains("password is required")
            || text.contains("incorrect password")
        {
            return Assessment::Fail(OperationError::auth(format!(
                "sudo authentication failed for {}",
                self.user
            )));
        }

        Assessment::Complete
    }

    fn secrets(&self) -> Vec<&str> {
        self.password.iter().map(|p| p.as_str()).collect()
    }
}

/// `su <user> -c`: always under a PTY, password written once `Password:`
/// shows up
pub struct Su {
    user: String,
    password: Option<Zeroizing<String>>,
}

impl Su {
    pub const PROMPT: &'static str = "Password: ";

    pub fn new(user: impl Into<String>, password: Option<&str>) -> Self {
        Su {
            user: user.into(),
            password: password.map(|p| Zeroizing::new(p.to_string())),
        }
    }

    pub fn for_host(host: &Host) -> Self {
        let auth = &host.authentication;
        Su::new(
            auth.su_user.as_deref().unwrap_or("root"),
            auth.su_password.as_ref().map(|s| s.expose()),
        )
    }
}

impl EscalationStrategy for Su {
    fn name(&self) -> &'static str {
        "su"
    }

    fn request(&self, command: &str, _attempt: u32, pty: PtySize) -> ProcessRequest {
        let request = ProcessRequest::new(format!(
            "su {} -c {}",
            shell_escape(&self.user),
            shell_escape(command)
        ))
        .with_pty(pty);
        match &self.password {
            Some(password) => request.with_feed(password, Some(Self::PROMPT)),
            None => request,
        }
    }

    fn assess(&self, output: &RawOutput, _attempt: u32) -> Assessment {
        if output.success() {
            return Assessment::Complete;
        }

        let text = format!("{}\n{}", output.stderr, output.stdout);
        if text.contains("Authentication failure") || text.contains("incorrect password") {
            return Assessment::Fail(OperationError::auth(format!(
                "su authentication failed for {}",
                self.user
            )));
        }

        Assessment::Complete
    }

    fn secrets(&self) -> Vec<&str> {
        self.password.iter().map(|p| p.as_str()).collect()
    }
}

/// Strategy for an operation's escalation mode on a host
pub fn strategy_for(escalation: Escalation, host: &Host) -> Box<dyn EscalationStrategy> {
    match escalation {
        Escalation::None => Box::new(Direct),
        Escalation::Sudo => Box::new(Sudo::for_host(host)),
        Escalation::Su => Box::new(Su::for_host(host)),
    }
}

/// Run `command` through `strategy`, retrying under a PTY when it asks to.
/// Output comes back with prompts removed and credentials redacted.
pub async fn run_escalated(
    conn: &dyn Connection,
    strategy: &dyn EscalationStrategy,
    command: &str,
    pty: PtySize,
) -> Result<RawOutput, OperationError> {
    let mut attempt = 0;
    loop {
        let request = strategy.request(command, attempt, pty);
        let uses_pty = request.pty.is_some();
        let after_prompt = request
            .feed
            .as_ref()
            .is_some_and(|feed| feed.wait_for.is_some());
        debug!(
            host = conn.host_name(),
            strategy = strategy.name(),
            attempt,
            pty = uses_pty,
            "running command"
        );

        let mut output = conn.run(request).await?;
        if uses_pty {
            normalize_pty(&mut output, after_prompt);
        }
        strip_sudo_prompts(&mut output);
        redact_output(&mut output, &strategy.secrets());

        match strategy.assess(&output, attempt) {
            Assessment::Complete => return Ok(output),
            Assessment::RetryWithPty => {
                warn!(
                    host = conn.host_name(),
                    strategy = strategy.name(),
                    "no tty present, retrying with a pseudo-terminal"
                );
                attempt += 1;
            }
            Assessment::Fail(err) => return Err(err),
        }
    }
}

/// PTY output uses CRLF. When the transport consumed a prompt and typed the
/// password, the terminal echoes the newline that ended it; only that one
/// newline is dropped.
fn normalize_pty(output: &mut RawOutput, after_prompt: bool) {
    output.stdout = output.stdout.replace("\r\n", "\n");
    output.stderr = output.stderr.replace("\r\n", "\n");
    if after_prompt {
        if let Some(rest) = output.stdout.strip_prefix('\n') {
            output.stdout = rest.to_string();
        }
    }
}

fn strip_sudo_prompts(output: &mut RawOutput) {
    output.stdout = SUDO_PROMPT.replace_all(&output.stdout, "").into_owned();
    output.stderr = SUDO_PROMPT.replace_all(&output.stderr, "").into_owned();
}

fn redact_output(output: &mut RawOutput, secrets: &[&str]) {
    output.stdout = redact(&output.stdout, secrets);
    output.stderr = redact(&output.stderr, secrets);
}

/// Replace every occurrence of every secret
pub fn redact(text: &str, secrets: &[&str]) -> String {
    let mut text = text.to_string();
    for secret in secrets.iter().filter(|s| !s.is_empty()) {
        if text.contains(secret) {
            text = text.replace(secret, REDACTED);
        }
    }
    text
}

/// Redact every string inside a JSON value
pub fn redact_value(value: &mut Value, secrets: &[&str]) {
    match value {
        Value::String(s) => {
            if secrets.iter().any(|secret| !secret.is_empty() && s.contains(secret)) {
                *s = redact(s, secrets);
            }
        }
        Value::Array(items) => items.iter_mut().for_each(|v| redact_value(v, secrets)),
        Value::Object(map) => map.values_mut().for_each(|v| redact_value(v, secrets)),
        _ => {}
    }
}
