// Session pool: at most one connection attempt per host per run

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::{Connection, Connector, TransportOptions};
use crate::inventory::Host;
use crate::output::errors::OperationError;

type Connected = Result<Arc<dyn Connection>, OperationError>;

/// A host's connection, opened on first use. The outcome is cached, so a
/// host that failed to connect reports the same error for every later
/// operation without another attempt.
pub struct HostSession {
    host: Arc<Host>,
    connector: Arc<dyn Connector>,
    options: TransportOptions,
    cell: OnceCell<Connected>,
    closed: AtomicBool,
}

impl HostSession {
    pub fn new(host: Arc<Host>, connector: Arc<dyn Connector>, options: TransportOptions) -> Self {
        HostSession {
            host,
            connector,
            options,
            cell: OnceCell::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn options(&self) -> TransportOptions {
        self.options
    }

    /// Open or reuse the connection
    pub async fn connection(&self) -> Connected {
        self.cell
            .get_or_init(|| async {
                let address = self.host.address();
                debug!(host = address, "opening session");

                let attempt = self.connector.connect(&self.host, self.options);
                let result = match tokio::time::timeout(self.options.connect_timeout, attempt).await
                {
                    Ok(result) => result,
                    Err(_) => Err(OperationError::unreachable(format!(
                        "connection to {} timed out after {}s",
                        address,
                        self.options.connect_timeout.as_secs()
                    ))),
                };

                match &result {
                    Ok(_) => info!(host = address, "session opened"),
                    Err(e) => warn!(host = address, error = %e, "connection failed"),
                }
                result
            })
            .await
            .clone()
    }

    pub fn is_open(&self) -> bool {
        matches!(self.cell.get(), Some(Ok(_))) && !self.closed.load(Ordering::SeqCst)
    }

    /// Close the file-transfer channel and the connection, once
    pub async fn close(&self) {
        if let Some(Ok(conn)) = self.cell.get() {
            if !self.closed.swap(true, Ordering::SeqCst) {
                conn.close().await;
                debug!(host = self.host.address(), "session closed");
            }
        }
    }
}

/// Per-run session cache keyed by host address
pub struct SessionPool {
    sessions: DashMap<String, Arc<HostSession>>,
    connector: Arc<dyn Connector>,
    defaults: TransportOptions,
}

impl SessionPool {
    pub fn new(connector: Arc<dyn Connector>, defaults: TransportOptions) -> Self {
        SessionPool {
            sessions: DashMap::new(),
            connector,
            defaults,
        }
    }

    /// The host's session entry; nothing is opened until `connection()`
    pub fn session(&self, host: &Arc<Host>) -> Arc<HostSession> {
        self.sessions
            .entry(host.address().to_string())
            .or_insert_with(|| {
                Arc::new(HostSession::new(
                    host.clone(),
                    self.connector.clone(),
                    resolve_options(host, self.defaults),
                ))
            })
            .value()
            .clone()
    }

    /// Number of sessions with a live connection
    pub fn opened(&self) -> usize {
        self.sessions.iter().filter(|s| s.value().is_open()).count()
    }

    /// Close every opened session. Safe to call more than once.
    pub async fn close_all(&self) {
        let sessions: Vec<Arc<HostSession>> =
            self.sessions.iter().map(|s| s.value().clone()).collect();
        let open = sessions.iter().filter(|s| s.is_open()).count();

        futures::future::join_all(sessions.iter().map(|s| s.close())).await;
        if open > 0 {
            info!(sessions = open, "sessions closed");
        }
    }
}

/// Host session options override the run-wide timeouts
fn resolve_options(host: &Host, defaults: TransportOptions) -> TransportOptions {
    TransportOptions {
        connect_timeout: host
            .session
            .connect_timeout()
            .unwrap_or(defaults.connect_timeout),
        command_timeout: host
            .session
            .command_timeout()
            .unwrap_or(defaults.command_timeout),
    }
}
