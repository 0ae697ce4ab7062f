// Executor module - transports, sessions and the fan-out engine

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use zeroize::Zeroizing;

use crate::inventory::Host;
use crate::output::errors::OperationError;
use crate::output::response::ExitSignal;

pub mod context;
pub mod dispatch;
pub mod escalation;
pub mod host;
pub mod local;
pub mod prompt;
pub mod scheduler;
pub mod session;
pub mod ssh;

#[cfg(test)]
pub(crate) mod testing;

pub use context::Context;
pub use escalation::{Direct, EscalationStrategy, Su, Sudo};
pub use host::HostExecutor;
pub use local::LocalConnection;
pub use scheduler::{Engine, ErrorPolicy, Scheduler, SchedulerConfig};
pub use session::{HostSession, SessionPool};
pub use ssh::SshConnection;

/// Pseudo-terminal dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtySize {
    pub cols: u32,
    pub rows: u32,
}

impl Default for PtySize {
    fn default() -> Self {
        PtySize { cols: 80, rows: 24 }
    }
}

/// A password written to the process's stdin
#[derive(Clone)]
pub struct Feed {
    pub secret: Zeroizing<String>,
    /// Wait for this substring on stdout before writing; the prompt and
    /// everything before it are dropped from the output.
    pub wait_for: Option<String>,
}

impl std::fmt::Debug for Feed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Feed")
            .field("secret", &"********")
            .field("wait_for", &self.wait_for)
            .finish()
    }
}

/// One remote process: the command line, whether it needs a terminal, and
/// an optional password to feed it.
#[derive(Debug, Clone)]
pub struct ProcessRequest {
    pub command: String,
    pub pty: Option<PtySize>,
    pub feed: Option<Feed>,
}

impl ProcessRequest {
    pub fn new(command: impl Into<String>) -> Self {
        ProcessRequest {
            command: command.into(),
            pty: None,
            feed: None,
        }
    }

    pub fn with_pty(mut self, size: PtySize) -> Self {
        self.pty = Some(size);
        self
    }

    pub fn with_feed(mut self, secret: &str, wait_for: Option<&str>) -> Self {
        self.feed = Some(Feed {
            secret: Zeroizing::new(secret.to_string()),
            wait_for: wait_for.map(str::to_string),
        });
        self
    }
}

/// What came back from a process, before classification
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: i32,
    pub exit_signal: Option<ExitSignal>,
}

impl RawOutput {
    pub fn success(&self) -> bool {
        self.exit_signal.is_none() && self.exit_status == 0
    }
}

/// Remote file metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    pub mode: Option<u32>,
    pub is_dir: bool,
}

/// Resolved per-host transport settings
#[derive(Debug, Clone, Copy)]
pub struct TransportOptions {
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
}

/// Common trait for all connection types (SSH, local, etc.)
#[async_trait]
pub trait Connection: Send + Sync {
    /// Run one process to completion
    async fn run(&self, request: ProcessRequest) -> Result<RawOutput, OperationError>;

    /// Read a file from the target
    async fn read_file(&self, path: &str) -> Result<Vec<u8>, OperationError>;

    /// Write content to a file on the target
    async fn write_file(&self, path: &str, content: &[u8], mode: i32)
        -> Result<(), OperationError>;

    /// Metadata for `path`, `None` when it does not exist
    async fn stat(&self, path: &str) -> Result<Option<FileStat>, OperationError>;

    async fn mkdir(&self, path: &str, mode: i32) -> Result<(), OperationError>;

    /// Release the file-transfer channel, then the connection itself
    async fn close(&self);

    /// Get the host name for this connection
    fn host_name(&self) -> &str;
}

/// Opens connections; swapped out in tests
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        host: &Host,
        options: TransportOptions,
    ) -> Result<Arc<dyn Connection>, OperationError>;
}

/// Local hosts get a `LocalConnection`, everything else SSH
pub struct DefaultConnector;

#[async_trait]
impl Connector for DefaultConnector {
    async fn connect(
        &self,
        host: &Host,
        options: TransportOptions,
    ) -> Result<Arc<dyn Connection>, OperationError> {
        if host.is_local() {
            return Ok(Arc::new(LocalConnection::new(host.address())));
        }

        let conn = SshConnection::connect(host.clone(), options).await?;
        Ok(Arc::new(conn))
    }
}

/// Quote a string for POSIX `sh`
pub fn shell_escape(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\"'\"'"))
}
