// SSH transport: one authenticated session per host, SFTP derived lazily

use async_trait::async_trait;
use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use ssh2::{ErrorCode, KeyboardInteractivePrompt, OpenFlags, OpenType, Session, Sftp};
use tracing::{debug, info, warn};

use super::prompt::{PromptWatcher, Watch};
use super::{Connection, FileStat, ProcessRequest, RawOutput, TransportOptions};
use crate::inventory::Host;
use crate::output::errors::OperationError;
use crate::output::response::ExitSignal;

/// SFTP status code for a missing path
const SFTP_NO_SUCH_FILE: i32 = 2;

struct SshInner {
    session: Mutex<Session>,
    sftp: Mutex<Option<Sftp>>,
    host_name: String,
}

/// An authenticated SSH connection to one host
pub struct SshConnection {
    inner: Arc<SshInner>,
    host_name: String,
}

impl SshConnection {
    /// Resolve, connect, handshake and authenticate
    pub async fn connect(host: Host, options: TransportOptions) -> Result<Self, OperationError> {
        let host_name = host.address().to_string();
        let session = tokio::task::spawn_blocking(move || open_session(&host, options))
            .await
            .map_err(|e| OperationError::unreachable(format!("connect task failed: {}", e)))??;

        Ok(SshConnection {
            inner: Arc::new(SshInner {
                session: Mutex::new(session),
                sftp: Mutex::new(None),
                host_name: host_name.clone(),
            }),
            host_name,
        })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, OperationError>
    where
        F: FnOnce(&SshInner) -> Result<T, OperationError> + Send + 'static,
        T: Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| OperationError::unreachable(format!("transport task failed: {}", e)))?
    }
}

fn open_session(host: &Host, options: TransportOptions) -> Result<Session, OperationError> {
    let address = host.address();
    let port = host.port();

    let addrs: Vec<IpAddr> = dns_lookup::lookup_host(address)
        .map_err(|e| OperationError::unreachable(format!("failed to resolve {}: {}", address, e)))?
        .into_iter()
        .collect();
    if addrs.is_empty() {
        return Err(OperationError::unreachable(format!(
            "{} resolved to no addresses",
            address
        )));
    }

    // TCP connection with timeout, first address that answers wins
    let mut last_error = None;
    let mut tcp = None;
    for ip in addrs {
        match TcpStream::connect_timeout(&SocketAddr::new(ip, port), options.connect_timeout) {
            Ok(stream) => {
                tcp = Some(stream);
                break;
            }
            Err(e) => last_error = Some(e),
        }
    }
    let tcp = match (tcp, last_error) {
        (Some(tcp), _) => tcp,
        (None, Some(e)) => {
            return Err(OperationError::unreachable(format!(
                "connection to {}:{} failed: {}{}",
                address,
                port,
                e,
                ssh_connection_suggestion(&e)
                    .map(|s| format!(" ({})", s))
                    .unwrap_or_default()
            )))
        }
        (None, None) => {
            return Err(OperationError::unreachable(format!(
                "connection to {}:{} failed",
                address, port
            )))
        }
    };

    // SSH session
    let mut session = Session::new()
        .map_err(|e| OperationError::unreachable(format!("failed to create SSH session: {}", e)))?;

    session.set_tcp_stream(tcp);
    session.set_timeout(options.connect_timeout.as_millis() as u32);
    session.set_compress(host.session.compress);

    session
        .handshake()
        .map_err(|e| OperationError::unreachable(format!("SSH handshake failed: {}", e)))?;

    if let Some(interval) = host.session.keepalive_interval {
        session.set_keepalive(true, interval);
    }
    for key in host.session.extra.keys() {
        debug!(host = address, option = %key, "ignoring unknown session option");
    }

    let user = host.username();
    authenticate(&session, host, &user)?;

    session.set_timeout(options.command_timeout.as_millis() as u32);
    info!(host = address, user = %user, "SSH connected");
    Ok(session)
}

/// Explicit key, then password (with keyboard-interactive fallback), then
/// the agent and default key files.
fn authenticate(session: &Session, host: &Host, user: &str) -> Result<(), OperationError> {
    if let Some(key) = &host.connection.private_key {
        let passphrase = host.connection.password.as_ref().map(|p| p.expose());
        let result = if key.contains("PRIVATE KEY-----") {
            session.userauth_pubkey_memory(user, None, key, passphrase)
        } else {
            session.userauth_pubkey_file(user, None, Path::new(key), passphrase)
        };
        if let Err(e) = result {
            debug!(host = host.address(), "private key rejected: {}", e);
        }
    }

    if !session.authenticated() {
        if let Some(password) = &host.connection.password {
            // First try standard password auth
            if session.userauth_password(user, password.expose()).is_err() {
                // Fall back to keyboard-interactive auth (used by some PAM configurations)
                let mut prompter = PasswordPrompter(password.expose().to_string());
                session.userauth_keyboard_interactive(user, &mut prompter).ok();
            }
        }
    }

    if !session.authenticated() {
        if let Ok(mut agent) = session.agent() {
            if agent.connect().is_ok() {
                agent.list_identities().ok();
                for identity in agent.identities().unwrap_or_default() {
                    if agent.userauth(user, &identity).is_ok() {
                        break;
                    }
                }
            }
        }
    }

    if !session.authenticated() {
        let home = std::env::var("HOME").unwrap_or_default();
        for name in ["id_ed25519", "id_rsa"] {
            let path = Path::new(&home).join(".ssh").join(name);
            if path.exists() && session.userauth_pubkey_file(user, None, &path, None).is_ok() {
                break;
            }
        }
    }

    if session.authenticated() {
        Ok(())
    } else {
        warn!(host = host.address(), user, "SSH authentication failed");
        Err(OperationError::auth(format!(
            "authentication failed for {}",
            host.ssh_target()
        )))
    }
}

impl SshInner {
    fn exec(&self, request: ProcessRequest) -> Result<RawOutput, OperationError> {
        let session = self.session.lock();
        let mut channel = session
            .channel_session()
            .map_err(|e| OperationError::unreachable(format!("failed to open channel: {}", e)))?;

        if let Some(size) = request.pty {
            channel
                .request_pty("xterm", None, Some((size.cols, size.rows, 0, 0)))
                .map_err(|e| OperationError::unreachable(format!("failed to request pty: {}", e)))?;
        }

        channel
            .exec(&request.command)
            .map_err(|e| OperationError::unreachable(format!("failed to execute command: {}", e)))?;

        let mut stdout = Vec::new();
        match &request.feed {
            Some(feed) if feed.wait_for.is_some() => {
                let prompt = feed.wait_for.as_deref().unwrap_or_default();
                let mut watcher = PromptWatcher::new(prompt);
                let mut chunk = [0u8; 4096];
                loop {
                    let n = channel.read(&mut chunk).map_err(read_error)?;
                    if n == 0 {
                        break;
                    }
                    match watcher.feed(&chunk[..n]) {
                        Watch::Waiting => {}
                        Watch::Prompted(rest) => {
                            channel
                                .write_all(format!("{}\n", feed.secret.as_str()).as_bytes())
                                .ok();
                            channel.flush().ok();
                            stdout.extend(rest);
                        }
                        Watch::Output(bytes) => stdout.extend(bytes),
                    }
                }
                stdout.extend(watcher.finish());
            }
            Some(feed) => {
                channel
                    .write_all(format!("{}\n", feed.secret.as_str()).as_bytes())
                    .ok();
                channel.flush().ok();
                channel.send_eof().ok();
                channel.read_to_end(&mut stdout).map_err(read_error)?;
            }
            None => {
                channel.send_eof().ok();
                channel.read_to_end(&mut stdout).map_err(read_error)?;
            }
        }

        let mut stderr = Vec::new();
        channel.stderr().read_to_end(&mut stderr).map_err(read_error)?;

        channel.wait_close().ok();
        let exit_status = channel.exit_status().unwrap_or(-1);
        let exit_signal = channel.exit_signal().ok().and_then(|s| {
            s.exit_signal.map(|name| {
                ExitSignal(
                    name,
                    false,
                    s.error_message.unwrap_or_default(),
                    s.lang_tag.unwrap_or_default(),
                )
            })
        });

        Ok(RawOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_status: if exit_signal.is_some() { -1 } else { exit_status },
            exit_signal,
        })
    }

    /// Run `f` against the SFTP channel, opening it on first use
    fn with_sftp<T>(
        &self,
        f: impl FnOnce(&Sftp) -> Result<T, OperationError>,
    ) -> Result<T, OperationError> {
        let mut slot = self.sftp.lock();
        if slot.is_none() {
            let session = self.session.lock();
            let sftp = session
                .sftp()
                .map_err(|e| OperationError::sftp(format!("failed to open SFTP: {}", e)))?;
            debug!(host = %self.host_name, "SFTP channel opened");
            *slot = Some(sftp);
        }
        let sftp = slot
            .as_ref()
            .ok_or_else(|| OperationError::sftp("SFTP channel unavailable"))?;
        f(sftp)
    }

    fn close(&self) {
        if self.sftp.lock().take().is_some() {
            debug!(host = %self.host_name, "SFTP channel closed");
        }
        let session = self.session.lock();
        session
            .disconnect(None, "fanout run complete", None)
            .ok();
        debug!(host = %self.host_name, "SSH session closed");
    }
}

fn read_error(e: std::io::Error) -> OperationError {
    if e.kind() == std::io::ErrorKind::TimedOut {
        OperationError::unreachable("command timed out")
    } else {
        OperationError::unreachable(format!("failed to read command output: {}", e))
    }
}

fn sftp_error(action: &str, path: &str, e: impl std::fmt::Display) -> OperationError {
    OperationError::sftp(format!("failed to {} {}: {}", action, path, e))
}

#[async_trait]
impl Connection for SshConnection {
    async fn run(&self, request: ProcessRequest) -> Result<RawOutput, OperationError> {
        // SSH operations are blocking, so we run them in a blocking task
        self.blocking(move |inner| inner.exec(request)).await
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, OperationError> {
        let path = path.to_string();
        self.blocking(move |inner| {
            inner.with_sftp(|sftp| {
                let mut file = sftp
                    .open(Path::new(&path))
                    .map_err(|e| sftp_error("open", &path, e))?;
                let mut content = Vec::new();
                file.read_to_end(&mut content)
                    .map_err(|e| sftp_error("read", &path, e))?;
                Ok(content)
            })
        })
        .await
    }

    async fn write_file(&self, path: &str, content: &[u8], mode: i32) -> Result<(), OperationError> {
        let path = path.to_string();
        let content = content.to_vec();
        self.blocking(move |inner| {
            inner.with_sftp(|sftp| {
                let mut file = sftp
                    .open_mode(
                        Path::new(&path),
                        OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
                        mode,
                        OpenType::File,
                    )
                    .map_err(|e| sftp_error("create", &path, e))?;
                file.write_all(&content)
                    .map_err(|e| sftp_error("write", &path, e))?;
                Ok(())
            })
        })
        .await
    }

    async fn stat(&self, path: &str) -> Result<Option<FileStat>, OperationError> {
        let path = path.to_string();
        self.blocking(move |inner| {
            inner.with_sftp(|sftp| match sftp.stat(Path::new(&path)) {
                Ok(stat) => Ok(Some(FileStat {
                    size: stat.size.unwrap_or(0),
                    mode: stat.perm.map(|p| p & 0o7777),
                    is_dir: stat.is_dir(),
                })),
                Err(e) if e.code() == ErrorCode::SFTP(SFTP_NO_SUCH_FILE) => Ok(None),
                Err(e) => Err(sftp_error("stat", &path, e)),
            })
        })
        .await
    }

    async fn mkdir(&self, path: &str, mode: i32) -> Result<(), OperationError> {
        let path = path.to_string();
        self.blocking(move |inner| {
            inner.with_sftp(|sftp| {
                sftp.mkdir(Path::new(&path), mode)
                    .map_err(|e| sftp_error("create directory", &path, e))
            })
        })
        .await
    }

    async fn close(&self) {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || inner.close()).await.ok();
    }

    fn host_name(&self) -> &str {
        &self.host_name
    }
}

fn ssh_connection_suggestion(e: &std::io::Error) -> Option<&'static str> {
    match e.kind() {
        std::io::ErrorKind::ConnectionRefused => {
            Some("ensure SSH service is running on the target host")
        }
        std::io::ErrorKind::TimedOut => Some("check network connectivity and firewall rules"),
        _ => None,
    }
}

/// Helper for keyboard-interactive authentication
struct PasswordPrompter(String);

impl KeyboardInteractivePrompt for PasswordPrompter {
    fn prompt<'a>(
        &mut self,
        _username: &str,
        _instructions: &str,
        prompts: &[ssh2::Prompt<'a>],
    ) -> Vec<String> {
        // Return the password for each prompt (typically just one "Password:" prompt)
        prompts.iter().map(|_| self.0.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::errors::ErrorKind;
    use std::time::Duration;

    fn options() -> TransportOptions {
        TransportOptions {
            connect_timeout: Duration::from_millis(500),
            command_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_unresolvable_host_is_unreachable() {
        let host = Host::new("no-such-host.invalid");
        let err = SshConnection::connect(host, options()).await.err().unwrap();
        assert_eq!(err.kind, ErrorKind::Unreachable);
    }

    #[tokio::test]
    async fn test_refused_connection_is_unreachable() {
        // Bind then drop to find a port nobody listens on
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let host = Host::new("127.0.0.1").with_port(port);
        let err = SshConnection::connect(host, options()).await.err().unwrap();
        assert_eq!(err.kind, ErrorKind::Unreachable);
    }

    #[test]
    fn test_read_error_classification() {
        let err = read_error(std::io::Error::new(std::io::ErrorKind::TimedOut, "slow"));
        assert_eq!(err.kind, ErrorKind::Unreachable);
        assert!(err.message.contains("timed out"));
    }
}
