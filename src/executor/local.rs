// Local command execution without SSH

use async_trait::async_trait;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tracing::debug;

use super::prompt::{PromptWatcher, Watch};
use super::{Connection, FileStat, ProcessRequest, RawOutput};
use crate::output::errors::OperationError;
use crate::output::response::{signal_name, ExitSignal};

/// Local connection for executing commands on localhost
pub struct LocalConnection {
    host_name: String,
}

impl LocalConnection {
    /// Create a new local connection
    pub fn new(host_name: impl Into<String>) -> Self {
        LocalConnection {
            host_name: host_name.into(),
        }
    }

    /// Check if a host should use local connection
    pub fn should_use_local(host_name: &str) -> bool {
        host_name == "localhost" || host_name == "127.0.0.1" || host_name == "::1"
    }
}

#[async_trait]
impl Connection for LocalConnection {
    async fn run(&self, request: ProcessRequest) -> Result<RawOutput, OperationError> {
        if request.pty.is_some() {
            debug!(host = %self.host_name, "pseudo-terminal not available locally, using pipes");
        }

        // Execute command using sh -c
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&request.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                OperationError::unreachable(format!("failed to spawn local command: {}", e))
            })?;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| OperationError::unreachable("failed to capture stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| OperationError::unreachable("failed to capture stderr"))?;

        let stderr_task = tokio::spawn(read_all(stderr));

        let stdout_bytes = match request.feed {
            Some(feed) => match feed.wait_for {
                Some(prompt) => {
                    read_after_prompt(stdout, stdin, &prompt, feed.secret.as_str()).await
                }
                None => {
                    if let Some(mut stdin) = stdin {
                        // The process may exit without reading; a broken pipe is fine
                        stdin
                            .write_all(format!("{}\n", feed.secret.as_str()).as_bytes())
                            .await
                            .ok();
                    }
                    read_all(stdout).await
                }
            },
            None => {
                drop(stdin);
                read_all(stdout).await
            }
        };

        // Wait for command to complete
        let status = child.wait().await.map_err(|e| {
            OperationError::unreachable(format!("failed to wait for command: {}", e))
        })?;
        let stderr_bytes = stderr_task.await.unwrap_or_default();

        Ok(RawOutput {
            stdout: String::from_utf8_lossy(&stdout_bytes).into_owned(),
            stderr: String::from_utf8_lossy(&stderr_bytes).into_owned(),
            exit_status: status.code().unwrap_or(-1),
            exit_signal: exit_signal(&status),
        })
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, OperationError> {
        tokio::fs::read(path)
            .await
            .map_err(|e| OperationError::sftp(format!("failed to read {}: {}", path, e)))
    }

    async fn write_file(&self, path: &str, content: &[u8], mode: i32) -> Result<(), OperationError> {
        tokio::fs::write(path, content)
            .await
            .map_err(|e| OperationError::sftp(format!("failed to write {}: {}", path, e)))?;
        set_mode(path, mode).await
    }

    async fn stat(&self, path: &str) -> Result<Option<FileStat>, OperationError> {
        match tokio::fs::metadata(path).await {
            Ok(meta) => Ok(Some(FileStat {
                size: meta.len(),
                mode: file_mode(&meta),
                is_dir: meta.is_dir(),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(OperationError::sftp(format!("failed to stat {}: {}", path, e))),
        }
    }

    async fn mkdir(&self, path: &str, mode: i32) -> Result<(), OperationError> {
        tokio::fs::create_dir(path)
            .await
            .map_err(|e| OperationError::sftp(format!("failed to create {}: {}", path, e)))?;
        set_mode(path, mode).await
    }

    async fn close(&self) {}

    fn host_name(&self) -> &str {
        &self.host_name
    }
}

async fn read_all<R: AsyncRead + Unpin>(mut reader: R) -> Vec<u8> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await.ok();
    buf
}

/// Read stdout until `prompt` appears, answer it, then read to EOF. The
/// prompt never reaches the returned output.
async fn read_after_prompt<R: AsyncRead + Unpin>(
    mut stdout: R,
    stdin: Option<ChildStdin>,
    prompt: &str,
    secret: &str,
) -> Vec<u8> {
    let mut watcher = PromptWatcher::new(prompt);
    let mut stdin = stdin;
    let mut out = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        let n = match stdout.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };

        match watcher.feed(&chunk[..n]) {
            Watch::Waiting => {}
            Watch::Prompted(rest) => {
                if let Some(mut pipe) = stdin.take() {
                    pipe.write_all(format!("{}\n", secret).as_bytes()).await.ok();
                }
                out.extend(rest);
            }
            Watch::Output(bytes) => out.extend(bytes),
        }
    }

    out.extend(watcher.finish());
    out
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<ExitSignal> {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map(|n| {
        ExitSignal(
            signal_name(n),
            status.core_dumped(),
            String::new(),
            String::new(),
        )
    })
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<ExitSignal> {
    None
}

#[cfg(unix)]
fn file_mode(meta: &std::fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(meta.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn file_mode(_meta: &std::fs::Metadata) -> Option<u32> {
    None
}

#[cfg(unix)]
async fn set_mode(path: &str, mode: i32) -> Result<(), OperationError> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode as u32))
        .await
        .map_err(|e| OperationError::sftp(format!("failed to chmod {}: {}", path, e)))
}

#[cfg(not(unix))]
async fn set_mode(_path: &str, _mode: i32) -> Result<(), OperationError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_exec() {
        let conn = LocalConnection::new("localhost");
        let result = conn
            .run(ProcessRequest::new("echo 'hello world'"))
            .await
            .unwrap();

        assert!(result.success());
        assert_eq!(result.stdout, "hello world\n");
    }

    #[tokio::test]
    async fn test_local_exec_failure() {
        let conn = LocalConnection::new("localhost");
        let result = conn.run(ProcessRequest::new("exit 3")).await.unwrap();

        assert!(!result.success());
        assert_eq!(result.exit_status, 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_local_exec_signalled() {
        let conn = LocalConnection::new("localhost");
        let result = conn.run(ProcessRequest::new("kill -TERM $$")).await.unwrap();

        assert_eq!(result.exit_status, -1);
        assert_eq!(result.exit_signal.as_ref().map(|s| s.name()), Some("TERM"));
    }

    #[tokio::test]
    async fn test_stdin_feed() {
        let conn = LocalConnection::new("localhost");
        let result = conn
            .run(ProcessRequest::new("read pw; echo \"got $pw\"").with_feed("s3cret", None))
            .await
            .unwrap();
        assert_eq!(result.stdout, "got s3cret\n");
    }

    #[tokio::test]
    async fn test_prompt_is_consumed() {
        let conn = LocalConnection::new("localhost");
        let request = ProcessRequest::new("printf 'Password:'; read pw; echo \"ok $pw\"")
            .with_feed("letmein", Some("Password:"));
        let result = conn.run(request).await.unwrap();

        assert!(!result.stdout.contains("Password:"));
        assert_eq!(result.stdout, "ok letmein\n");
    }

    #[test]
    fn test_should_use_local() {
        assert!(LocalConnection::should_use_local("localhost"));
        assert!(LocalConnection::should_use_local("127.0.0.1"));
        assert!(LocalConnection::should_use_local("::1"));
        assert!(!LocalConnection::should_use_local("example.com"));
        assert!(!LocalConnection::should_use_local("192.168.1.1"));
    }

    #[tokio::test]
    async fn test_file_operations() {
        let conn = LocalConnection::new("localhost");
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("conf.d");
        let sub = sub.to_str().unwrap();

        assert_eq!(conn.stat(sub).await.unwrap(), None);
        conn.mkdir(sub, 0o750).await.unwrap();
        assert!(conn.stat(sub).await.unwrap().unwrap().is_dir);

        let file = format!("{}/app.conf", sub);
        conn.write_file(&file, b"test content", 0o600).await.unwrap();
        assert_eq!(conn.read_file(&file).await.unwrap(), b"test content");

        let stat = conn.stat(&file).await.unwrap().unwrap();
        assert_eq!(stat.size, 12);
        #[cfg(unix)]
        assert_eq!(stat.mode, Some(0o600));

        let missing = conn.read_file("/nonexistent/fanout").await.unwrap_err();
        assert_eq!(missing.kind, crate::output::errors::ErrorKind::SftpError);
    }
}
