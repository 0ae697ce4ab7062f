// Scripted in-memory transport for tests

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use dashmap::DashMap;
use parking_lot::Mutex;

use super::prompt::{PromptWatcher, Watch};
use super::{Connection, Connector, FileStat, ProcessRequest, RawOutput, TransportOptions};
use crate::inventory::Host;
use crate::output::errors::OperationError;
use crate::output::response::ExitSignal;

#[derive(Debug, Clone)]
pub(crate) enum MockEntry {
    File { content: Vec<u8>, mode: i32 },
    Dir { mode: i32 },
}

/// How a simulated machine behaves
#[derive(Debug, Clone)]
pub(crate) struct MockHost {
    pub address: String,
    pub login: String,
    pub sudo_password: Option<String>,
    pub su_password: Option<String>,
    pub requires_tty: bool,
    pub unreachable: bool,
    pub auth_fails: bool,
    pub latency: Duration,
    pub files: Arc<Mutex<HashMap<String, MockEntry>>>,
    /// Paths only root may read or replace
    pub private: Arc<Mutex<HashSet<String>>>,
}

impl MockHost {
    pub fn new(address: &str) -> Self {
        MockHost {
            address: address.to_string(),
            login: "deploy".to_string(),
            sudo_password: None,
            su_password: None,
            requires_tty: false,
            unreachable: false,
            auth_fails: false,
            latency: Duration::ZERO,
            files: Arc::new(Mutex::new(HashMap::new())),
            private: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn sudo_password(mut self, password: &str) -> Self {
        self.sudo_password = Some(password.to_string());
        self
    }

    pub fn su_password(mut self, password: &str) -> Self {
        self.su_password = Some(password.to_string());
        self
    }

    pub fn requires_tty(mut self) -> Self {
        self.requires_tty = true;
        self
    }

    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    pub fn auth_fails(mut self) -> Self {
        self.auth_fails = true;
        self
    }

    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn file(self, path: &str, content: &[u8]) -> Self {
        self.files.lock().insert(
            path.to_string(),
            MockEntry::File {
                content: content.to_vec(),
                mode: 0o644,
            },
        );
        self
    }

    /// A root-owned 0600 file the login user cannot open
    pub fn private_file(self, path: &str, content: &[u8]) -> Self {
        self.files.lock().insert(
            path.to_string(),
            MockEntry::File {
                content: content.to_vec(),
                mode: 0o600,
            },
        );
        self.private.lock().insert(path.to_string());
        self
    }
}

pub(crate) struct MockConnection {
    host: MockHost,
    runs: AtomicUsize,
    commands: Mutex<Vec<String>>,
    closes: Arc<AtomicUsize>,
}

impl MockConnection {
    pub fn new(host: MockHost) -> Self {
        MockConnection {
            host,
            runs: AtomicUsize::new(0),
            commands: Mutex::new(Vec::new()),
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    async fn sudo(&self, args: &str, request: &ProcessRequest) -> RawOutput {
        let Some((mode, user, inner)) = parse_sudo(args) else {
            return failure(1, "sudo: usage error\n");
        };

        if self.host.requires_tty && request.pty.is_none() {
            return failure(1, "sudo: no tty present and no askpass program specified\n");
        }

        let prompt = format!("[sudo] password for {}: ", self.host.login);
        if let Some(expected) = &self.host.sudo_password {
            if mode == "-n" {
                return failure(1, "sudo: a password is required\n");
            }
            let given = request.feed.as_ref().map(|f| f.secret.as_str());
            if given != Some(expected.as_str()) {
                return self.with_prompt(
                    request,
                    &prompt,
                    failure(
                        1,
                        "Sorry, try again.\nsudo: 1 incorrect password attempt\n",
                    ),
                );
            }
            let output = self.shell(&inner, &user).await;
            return self.with_prompt(request, &prompt, output);
        }

        self.shell(&inner, &user).await
    }

    /// Put the sudo prompt where sudo writes it: stderr, or the terminal
    fn with_prompt(&self, request: &ProcessRequest, prompt: &str, mut output: RawOutput) -> RawOutput {
        if request.pty.is_some() {
            let merged = format!("{}{}", output.stderr, output.stdout);
            output.stdout = format!("{}\r\n{}", prompt, merged.replace('\n', "\r\n"));
            output.stderr.clear();
        } else {
            output.stderr = format!("{}{}", prompt, output.stderr);
        }
        output
    }

    async fn su(&self, args: &str, request: &ProcessRequest) -> RawOutput {
        let Some((user, inner)) = args.split_once(" -c ") else {
            return failure(1, "su: usage error\n");
        };
        if request.pty.is_none() {
            return failure(1, "su: must be run from a terminal\n");
        }

        // The terminal shows the prompt first; the transport consumes it
        let mut watcher = request
            .feed
            .as_ref()
            .and_then(|f| f.wait_for.as_deref())
            .map(PromptWatcher::new);
        let mut stdout = Vec::new();
        let mut prompted = false;
        match watcher.as_mut().map(|w| w.feed(b"Password: ")) {
            Some(Watch::Prompted(rest)) => {
                prompted = true;
                stdout.extend(rest);
            }
            Some(_) => {}
            None => stdout.extend_from_slice(b"Password: "),
        }

        let given = if prompted {
            request.feed.as_ref().map(|f| f.secret.as_str())
        } else {
            None
        };
        let body = if given.is_some() && given == self.host.su_password.as_deref() {
            self.shell(&unescape(inner), &unescape(user)).await
        } else {
            failure(1, "su: Authentication failure\n")
        };

        let merged = format!("{}{}", body.stdout, body.stderr);
        stdout.extend_from_slice(format!("\r\n{}", merged.replace('\n', "\r\n")).as_bytes());
        RawOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::new(),
            exit_status: body.exit_status,
            exit_signal: body.exit_signal,
        }
    }

    fn denied(&self, path: &str, user: &str) -> bool {
        user != "root" && self.host.private.lock().contains(path)
    }

    async fn shell(&self, command: &str, user: &str) -> RawOutput {
        match self.file_command(command.trim(), user) {
            Some(output) => output,
            None => simulate(command, user).await,
        }
    }

    /// The file commands escalated uploads send, backed by the file store
    fn file_command(&self, command: &str, user: &str) -> Option<RawOutput> {
        if let Some(arg) = command.strip_prefix("stat -c '%F %a' ") {
            let path = unescape(arg);
            return Some(match self.host.files.lock().get(&path) {
                Some(MockEntry::File { mode, .. }) => output(format!("regular file {:o}\n", mode)),
                Some(MockEntry::Dir { mode }) => output(format!("directory {:o}\n", mode)),
                None => failure(
                    1,
                    &format!("stat: cannot statx '{}': No such file or directory\n", path),
                ),
            });
        }

        if let Some(arg) = command.strip_prefix("base64 -w0 ") {
            let path = unescape(arg);
            if self.denied(&path, user) {
                return Some(failure(1, &format!("base64: {}: Permission denied\n", path)));
            }
            return Some(match self.host.files.lock().get(&path) {
                Some(MockEntry::File { content, .. }) => output(BASE64.encode(content)),
                Some(MockEntry::Dir { .. }) => failure(1, "base64: read error: Is a directory\n"),
                None => failure(1, &format!("base64: {}: No such file or directory\n", path)),
            });
        }

        if let Some(arg) = command.strip_prefix("rm -f ") {
            self.host.files.lock().remove(&unescape(arg));
            return Some(RawOutput::default());
        }

        // echo <b64> | base64 -d > <tmp> && chmod <mode> <tmp> && mv <tmp> <path>
        let (data, rest) = command.strip_prefix("echo ")?.split_once(" | base64 -d > ")?;
        let mut steps = rest.split(" && ");
        let temp = steps.next()?;
        let mode = steps.next()?.strip_prefix("chmod ")?.strip_suffix(temp)?.trim();
        let target = steps.next()?.strip_prefix("mv ")?.strip_prefix(temp)?.trim();

        let path = unescape(target);
        if self.denied(&path, user) {
            return Some(failure(
                1,
                &format!("mv: cannot move '{}': Permission denied\n", unescape(temp)),
            ));
        }
        let content = BASE64.decode(data).ok()?;
        let mode = i32::from_str_radix(mode, 8).ok()?;
        self.host
            .files
            .lock()
            .insert(path, MockEntry::File { content, mode });
        Some(RawOutput::default())
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn run(&self, request: ProcessRequest) -> Result<RawOutput, OperationError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.commands.lock().push(request.command.clone());
        if !self.host.latency.is_zero() {
            tokio::time::sleep(self.host.latency).await;
        }

        if let Some(args) = request.command.strip_prefix("sudo ") {
            return Ok(self.sudo(args, &request).await);
        }
        if let Some(args) = request.command.strip_prefix("su ") {
            return Ok(self.su(args, &request).await);
        }
        Ok(self.shell(&request.command, &self.host.login).await)
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, OperationError> {
        if self.denied(path, &self.host.login) {
            return Err(OperationError::sftp(format!("{}: permission denied", path)));
        }
        match self.host.files.lock().get(path) {
            Some(MockEntry::File { content, .. }) => Ok(content.clone()),
            Some(MockEntry::Dir { .. }) => Err(OperationError::sftp(format!("{}: is a directory", path))),
            None => Err(OperationError::sftp(format!("{}: no such file", path))),
        }
    }

    async fn write_file(&self, path: &str, content: &[u8], mode: i32) -> Result<(), OperationError> {
        if self.denied(path, &self.host.login) {
            return Err(OperationError::sftp(format!("{}: permission denied", path)));
        }
        let mut files = self.host.files.lock();
        if let Some(MockEntry::Dir { .. }) = files.get(path) {
            return Err(OperationError::sftp(format!("{}: is a directory", path)));
        }
        files.insert(
            path.to_string(),
            MockEntry::File {
                content: content.to_vec(),
                mode,
            },
        );
        Ok(())
    }

    async fn stat(&self, path: &str) -> Result<Option<FileStat>, OperationError> {
        Ok(self.host.files.lock().get(path).map(|entry| match entry {
            MockEntry::File { content, mode } => FileStat {
                size: content.len() as u64,
                mode: Some(*mode as u32),
                is_dir: false,
            },
            MockEntry::Dir { mode } => FileStat {
                size: 0,
                mode: Some(*mode as u32),
                is_dir: true,
            },
        }))
    }

    async fn mkdir(&self, path: &str, mode: i32) -> Result<(), OperationError> {
        let mut files = self.host.files.lock();
        if files.contains_key(path) {
            return Err(OperationError::sftp(format!("{}: already exists", path)));
        }
        files.insert(path.to_string(), MockEntry::Dir { mode });
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn host_name(&self) -> &str {
        &self.host.address
    }
}

/// Connector handing out [`MockConnection`]s and counting connects/closes
#[derive(Default)]
pub(crate) struct MockConnector {
    hosts: HashMap<String, MockHost>,
    connects: DashMap<String, usize>,
    closes: Arc<AtomicUsize>,
}

impl MockConnector {
    pub fn new(hosts: Vec<MockHost>) -> Self {
        MockConnector {
            hosts: hosts.into_iter().map(|h| (h.address.clone(), h)).collect(),
            ..MockConnector::default()
        }
    }

    pub fn connects(&self, address: &str) -> usize {
        self.connects.get(address).map(|c| *c).unwrap_or(0)
    }

    pub fn total_connects(&self) -> usize {
        self.connects.iter().map(|c| *c.value()).sum()
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn file(&self, address: &str, path: &str) -> Option<MockEntry> {
        self.hosts
            .get(address)
            .and_then(|h| h.files.lock().get(path).cloned())
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        host: &Host,
        _options: TransportOptions,
    ) -> Result<Arc<dyn Connection>, OperationError> {
        *self.connects.entry(host.address().to_string()).or_insert(0) += 1;

        let mock = self
            .hosts
            .get(host.address())
            .cloned()
            .unwrap_or_else(|| MockHost::new(host.address()));

        if mock.unreachable {
            return Err(OperationError::unreachable(format!(
                "failed to resolve {}",
                host.address()
            )));
        }
        if mock.auth_fails {
            return Err(OperationError::auth(format!(
                "authentication failed for {}",
                host.ssh_target()
            )));
        }

        let mut conn = MockConnection::new(mock);
        conn.closes = self.closes.clone();
        Ok(Arc::new(conn))
    }
}

fn failure(code: i32, stderr: &str) -> RawOutput {
    RawOutput {
        stdout: String::new(),
        stderr: stderr.to_string(),
        exit_status: code,
        exit_signal: None,
    }
}

fn output(stdout: String) -> RawOutput {
    RawOutput {
        stdout,
        ..RawOutput::default()
    }
}

fn parse_sudo(args: &str) -> Option<(String, String, String)> {
    let (mode, rest) = args.split_once(' ')?;
    let rest = rest.strip_prefix("-u ")?;
    let (user, rest) = rest.split_once(' ')?;
    let inner = rest.strip_prefix("-- sh -c ")?;
    Some((mode.to_string(), unescape(user), unescape(inner)))
}

fn unescape(quoted: &str) -> String {
    let inner = quoted
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .unwrap_or(quoted);
    inner.replace("'\"'\"'", "'")
}

/// A tiny shell: echo, whoami, true/false, exit N, kill -SIG, sleep S
async fn simulate(command: &str, user: &str) -> RawOutput {
    let command = command.trim();
    let (program, args) = command.split_once(' ').unwrap_or((command, ""));

    match program {
        "echo" => RawOutput {
            stdout: format!("{}\n", args.trim_matches(|c| c == '\'' || c == '"')),
            ..RawOutput::default()
        },
        "whoami" => RawOutput {
            stdout: format!("{}\n", user),
            ..RawOutput::default()
        },
        "true" => RawOutput::default(),
        "false" => failure(1, ""),
        "exit" => failure(args.trim().parse().unwrap_or(1), ""),
        "kill" => RawOutput {
            exit_status: -1,
            exit_signal: Some(ExitSignal::named(args.trim().trim_start_matches('-'))),
            ..RawOutput::default()
        },
        "sleep" => {
            let secs: f64 = args.trim().parse().unwrap_or(0.0);
            tokio::time::sleep(Duration::from_secs_f64(secs)).await;
            RawOutput::default()
        }
        _ => failure(127, &format!("sh: 1: {}: not found\n", program)),
    }
}
