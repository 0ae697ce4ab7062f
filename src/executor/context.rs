// Per-operation context handed to the dispatcher and to callbacks

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::escalation::{run_escalated, strategy_for};
use super::session::HostSession;
use super::{Connection, FileStat, PtySize, RawOutput};
use crate::inventory::Host;
use crate::operation::{Escalation, Intent};
use crate::output::errors::{ErrorKind, OperationError};
use crate::output::response::CompletedProcess;

/// What one operation sees of its host, and what it reports back.
///
/// A callback reads its parameters and the bound host from here, reaches
/// the host through [`Context::run`] and the file helpers, and may set
/// `value`/`changed` directly or flag a failure with [`Context::fail`].
pub struct Context {
    host: Arc<Host>,
    session: Option<Arc<HostSession>>,
    pty: PtySize,
    pub intent: Intent,
    pub label: Option<String>,
    pub params: Value,
    pub escalation: Escalation,
    pub value: Option<Value>,
    pub changed: Option<bool>,
    pub error: bool,
    pub message: String,
    pub(crate) kind: Option<ErrorKind>,
}

impl Context {
    /// A context bound to `host`. Without a session (Passthrough) every
    /// transport call is refused.
    pub fn new(host: Arc<Host>, session: Option<Arc<HostSession>>, pty: PtySize) -> Self {
        Context {
            host,
            session,
            pty,
            intent: Intent::Get,
            label: None,
            params: Value::Null,
            escalation: Escalation::None,
            value: None,
            changed: None,
            error: false,
            message: String::new(),
            kind: None,
        }
    }

    pub fn with_intent(mut self, intent: Intent) -> Self {
        self.intent = intent;
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_escalation(mut self, escalation: Escalation) -> Self {
        self.escalation = escalation;
        self
    }

    pub fn with_label(mut self, label: Option<String>) -> Self {
        self.label = label;
        self
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.param(key).and_then(Value::as_str)
    }

    /// Deserialize the whole parameter object
    pub fn params_as<T: DeserializeOwned>(&self) -> Result<T, OperationError> {
        serde_json::from_value(self.params.clone()).map_err(|e| {
            OperationError::new(ErrorKind::CallbackError, format!("invalid parameters: {}", e))
        })
    }

    /// Open or reuse the host's connection
    pub async fn connection(&self) -> Result<Arc<dyn Connection>, OperationError> {
        match &self.session {
            Some(session) => session.connection().await,
            None => Err(OperationError::misuse(
                "a Passthrough operation cannot open a session",
            )),
        }
    }

    /// Run `command` with this context's escalation, bounded by the host's
    /// command timeout.
    pub async fn run_raw(&self, command: &str) -> Result<RawOutput, OperationError> {
        let conn = self.connection().await?;
        let timeout = self
            .session
            .as_ref()
            .map(|s| s.options().command_timeout)
            .unwrap_or_default();
        let strategy = strategy_for(self.escalation, &self.host);

        match tokio::time::timeout(
            timeout,
            run_escalated(conn.as_ref(), strategy.as_ref(), command, self.pty),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(OperationError::unreachable(format!(
                "command timed out after {}s",
                timeout.as_secs()
            ))),
        }
    }

    /// Run `command` and return its completed-process record. A non-zero
    /// exit is not an error here; inspect the record.
    pub async fn run(&self, command: &str) -> Result<CompletedProcess, OperationError> {
        let output = self.run_raw(command).await?;
        Ok(CompletedProcess::new(
            command,
            output.exit_status,
            output.exit_signal,
            output.stdout,
            output.stderr,
        ))
    }

    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>, OperationError> {
        self.connection().await?.read_file(path).await
    }

    pub async fn write_file(
        &self,
        path: &str,
        content: &[u8],
        mode: i32,
    ) -> Result<(), OperationError> {
        self.connection().await?.write_file(path, content, mode).await
    }

    pub async fn stat(&self, path: &str) -> Result<Option<FileStat>, OperationError> {
        self.connection().await?.stat(path).await
    }

    pub async fn mkdir(&self, path: &str, mode: i32) -> Result<(), OperationError> {
        self.connection().await?.mkdir(path, mode).await
    }

    pub fn set_value(&mut self, value: Value) {
        self.value = Some(value);
    }

    pub fn set_changed(&mut self, changed: bool) {
        self.changed = Some(changed);
    }

    /// Report failure without returning an error
    pub fn fail(&mut self, message: impl Into<String>) {
        self.record_error(&OperationError::new(ErrorKind::CallbackError, message));
    }

    pub(crate) fn record_error(&mut self, err: &OperationError) {
        self.error = true;
        self.kind = Some(err.kind);
        self.message = err.to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::testing::{MockConnector, MockHost};
    use crate::executor::TransportOptions;
    use serde::Deserialize;
    use serde_json::json;
    use std::time::Duration;

    fn session(host: &Arc<Host>, mock: MockHost, command_timeout: Duration) -> Arc<HostSession> {
        Arc::new(HostSession::new(
            host.clone(),
            Arc::new(MockConnector::new(vec![mock])),
            TransportOptions {
                connect_timeout: Duration::from_secs(5),
                command_timeout,
            },
        ))
    }

    #[tokio::test]
    async fn test_passthrough_context_refuses_transport() {
        let ctx = Context::new(Arc::new(Host::new("h1")), None, PtySize::default());
        let err = ctx.run("uptime").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ProtocolMisuse);
        assert_eq!(ctx.stat("/etc").await.unwrap_err().kind, ErrorKind::ProtocolMisuse);
    }

    #[tokio::test]
    async fn test_run_with_sudo() {
        let host = Arc::new(Host::new("h1").with_sudo(None, Some("pw")));
        let mock = MockHost::new("h1").sudo_password("pw");
        let ctx = Context::new(
            host.clone(),
            Some(session(&host, mock, Duration::from_secs(5))),
            PtySize::default(),
        )
        .with_escalation(Escalation::Sudo);

        let process = ctx.run("whoami").await.unwrap();
        assert!(process.success());
        assert_eq!(process.stdout, "root\n");
    }

    #[tokio::test]
    async fn test_run_times_out() {
        let host = Arc::new(Host::new("h1"));
        let ctx = Context::new(
            host.clone(),
            Some(session(&host, MockHost::new("h1"), Duration::from_millis(50))),
            PtySize::default(),
        );

        let err = ctx.run("sleep 5").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unreachable);
        assert!(err.message.contains("timed out"));
    }

    #[test]
    fn test_params() {
        #[derive(Deserialize)]
        struct Params {
            path: String,
            mode: Option<i32>,
        }

        let ctx = Context::new(Arc::new(Host::new("h1")), None, PtySize::default())
            .with_params(json!({"path": "/etc/motd"}));
        assert_eq!(ctx.param_str("path"), Some("/etc/motd"));

        let params: Params = ctx.params_as().unwrap();
        assert_eq!(params.path, "/etc/motd");
        assert_eq!(params.mode, None);

        let bad = ctx.with_params(json!({"mode": 1}));
        assert_eq!(
            bad.params_as::<Params>().err().unwrap().kind,
            ErrorKind::CallbackError
        );
    }

    #[test]
    fn test_fail_marks_error() {
        let mut ctx = Context::new(Arc::new(Host::new("h1")), None, PtySize::default());
        ctx.fail("disk full");
        assert!(ctx.error);
        assert_eq!(ctx.message, "CallbackError: disk full");
    }
}
