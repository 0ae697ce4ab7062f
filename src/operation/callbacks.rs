// Ready-made file callbacks over the host's SFTP channel

use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{Callback, Escalation, Intent, RemoteCallback};
use crate::executor::{shell_escape, Context};
use crate::output::errors::{ErrorKind, OperationError};

const DEFAULT_FILE_MODE: i32 = 0o644;
const DEFAULT_DIR_MODE: i32 = 0o755;

/// Write a file. `changed` when the content or mode differs from what is
/// on the host.
///
/// Params: `path`, `content`, `encoding` (`utf8` default, or `base64`),
/// `mode` (integer or octal string).
pub struct Upload;

/// Read a file. Value: `{path, content, encoding, size}` where `encoding`
/// is `utf8` when the bytes are valid UTF-8 and `base64` otherwise.
pub struct Download;

/// Create a directory when missing. `changed` when it was created.
///
/// Params: `path`, `mode`.
pub struct EnsureDirectory;

#[derive(Debug, Deserialize)]
struct UploadParams {
    path: String,
    content: String,
    #[serde(default)]
    encoding: Option<String>,
    #[serde(default)]
    mode: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct PathParams {
    path: String,
    #[serde(default)]
    mode: Option<Value>,
}

#[async_trait]
impl Callback for Upload {
    fn name(&self) -> &str {
        "upload"
    }

    async fn call(&self, ctx: &mut Context) -> anyhow::Result<Value> {
        let params: UploadParams = ctx.params_as()?;
        let content = match params.encoding.as_deref() {
            Some("base64") => BASE64.decode(params.content.as_bytes()).map_err(|e| {
                OperationError::new(ErrorKind::CallbackError, format!("invalid base64: {}", e))
            })?,
            _ => params.content.into_bytes(),
        };
        let mode = parse_mode(params.mode.as_ref(), DEFAULT_FILE_MODE)?;
        let path = params.path;

        // SFTP runs as the login user, so escalated reads and writes go
        // through the shell
        let escalated = ctx.escalation != Escalation::None;
        let current = if escalated {
            current_escalated(ctx, &path).await?
        } else {
            current_sftp(ctx, &path).await?
        };
        let changed = match current {
            Some((bytes, current_mode)) => {
                bytes != content || current_mode.is_some_and(|m| m != mode as u32)
            }
            None => true,
        };

        if changed {
            if escalated {
                write_escalated(ctx, &path, &content, mode).await?;
            } else {
                ctx.write_file(&path, &content, mode).await?;
            }
        }

        ctx.set_changed(changed);
        Ok(json!({ "path": path, "size": content.len() }))
    }
}

/// Content and permission bits of `path`, `None` when it does not exist
async fn current_sftp(
    ctx: &Context,
    path: &str,
) -> Result<Option<(Vec<u8>, Option<u32>)>, OperationError> {
    match ctx.stat(path).await? {
        Some(stat) if stat.is_dir => Err(OperationError::sftp(format!("{} is a directory", path))),
        Some(stat) => Ok(Some((ctx.read_file(path).await?, stat.mode))),
        None => Ok(None),
    }
}

async fn current_escalated(
    ctx: &Context,
    path: &str,
) -> Result<Option<(Vec<u8>, Option<u32>)>, OperationError> {
    let stat = ctx
        .run(&format!("stat -c '%F %a' {}", shell_escape(path)))
        .await?;
    if !stat.success() {
        if stat.stderr.contains("No such file") {
            return Ok(None);
        }
        return Err(OperationError::sftp(format!(
            "failed to stat {}: {}",
            path,
            stat.stderr.trim_end()
        )));
    }

    let line = stat.stdout.trim();
    if line.starts_with("directory") {
        return Err(OperationError::sftp(format!("{} is a directory", path)));
    }
    let mode = line
        .rsplit(' ')
        .next()
        .and_then(|bits| u32::from_str_radix(bits, 8).ok());

    let read = ctx.run(&format!("base64 -w0 {}", shell_escape(path))).await?;
    if !read.success() {
        return Err(OperationError::sftp(format!(
            "failed to read {}: {}",
            path,
            read.stderr.trim_end()
        )));
    }
    let bytes = BASE64
        .decode(read.stdout.trim())
        .map_err(|e| OperationError::sftp(format!("unreadable content of {}: {}", path, e)))?;
    Ok(Some((bytes, mode)))
}

async fn write_escalated(
    ctx: &Context,
    path: &str,
    content: &[u8],
    mode: i32,
) -> Result<(), OperationError> {
    let temp_path = format!("{}.fanout-tmp-{}", path, std::process::id());
    let command = format!(
        "echo {} | base64 -d > {} && chmod {:o} {} && mv {} {}",
        BASE64.encode(content),
        shell_escape(&temp_path),
        mode,
        shell_escape(&temp_path),
        shell_escape(&temp_path),
        shell_escape(path)
    );

    let process = ctx.run(&command).await?;
    if process.success() {
        return Ok(());
    }

    // Clean up temp file on failure
    ctx.run(&format!("rm -f {}", shell_escape(&temp_path))).await.ok();
    Err(OperationError::sftp(format!(
        "failed to write {}: {}",
        path,
        process.stderr.trim_end()
    )))
}

#[async_trait]
impl Callback for Download {
    fn name(&self) -> &str {
        "download"
    }

    async fn call(&self, ctx: &mut Context) -> anyhow::Result<Value> {
        let params: PathParams = ctx.params_as()?;
        let bytes = ctx.read_file(&params.path).await?;
        let size = bytes.len();

        let (content, encoding) = match String::from_utf8(bytes) {
            Ok(text) => (text, "utf8"),
            Err(e) => (BASE64.encode(e.into_bytes()), "base64"),
        };

        Ok(json!({
            "path": params.path,
            "content": content,
            "encoding": encoding,
            "size": size,
        }))
    }
}

#[async_trait]
impl Callback for EnsureDirectory {
    fn name(&self) -> &str {
        "ensure_directory"
    }

    async fn call(&self, ctx: &mut Context) -> anyhow::Result<Value> {
        let params: PathParams = ctx.params_as()?;
        let mode = parse_mode(params.mode.as_ref(), DEFAULT_DIR_MODE)?;

        let created = match ctx.stat(&params.path).await? {
            Some(stat) if stat.is_dir => false,
            Some(_) => {
                return Err(OperationError::sftp(format!(
                    "{} exists and is not a directory",
                    params.path
                ))
                .into());
            }
            None => {
                ctx.mkdir(&params.path, mode).await?;
                true
            }
        };

        ctx.set_changed(created);
        Ok(json!({ "path": params.path }))
    }
}

/// Modes come as integers or as octal strings (`"0644"`, `"0o644"`)
fn parse_mode(mode: Option<&Value>, default: i32) -> Result<i32, OperationError> {
    let invalid =
        |m: &Value| OperationError::new(ErrorKind::CallbackError, format!("invalid mode: {}", m));
    match mode {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Number(n)) => n
            .as_i64()
            .and_then(|n| i32::try_from(n).ok())
            .ok_or_else(|| invalid(&Value::Number(n.clone()))),
        Some(Value::String(s)) => {
            let digits = s.trim_start_matches("0o");
            i32::from_str_radix(digits, 8).map_err(|_| invalid(&Value::String(s.clone())))
        }
        Some(other) => Err(invalid(other)),
    }
}

/// Put-intent upload of `content` to `path`
pub fn upload(path: impl Into<String>, content: &[u8], mode: i32) -> RemoteCallback {
    RemoteCallback::new(
        Arc::new(Upload),
        json!({
            "path": path.into(),
            "content": BASE64.encode(content),
            "encoding": "base64",
            "mode": mode,
        }),
    )
    .intent(Intent::Put)
}

/// Get-intent download of `path`
pub fn download(path: impl Into<String>) -> RemoteCallback {
    RemoteCallback::new(Arc::new(Download), json!({ "path": path.into() })).intent(Intent::Get)
}

/// Put-intent directory creation
pub fn ensure_directory(path: impl Into<String>, mode: i32) -> RemoteCallback {
    RemoteCallback::new(
        Arc::new(EnsureDirectory),
        json!({ "path": path.into(), "mode": mode }),
    )
    .intent(Intent::Put)
}
