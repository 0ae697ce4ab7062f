// Dispatch: turn one leaf operation into a Response

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, warn};

use super::context::Context;
use super::escalation::{redact, redact_value};
use super::scheduler::panic_message;
use super::session::SessionPool;
use super::PtySize;
use crate::inventory::Host;
use crate::operation::{Callback, Intent, Operation, Passthrough, RemoteCallback, RemoteCommand};
use crate::output::errors::{ErrorKind, OperationError};
use crate::output::response::Response;

/// Run `op` against `host`. Never fails: every problem ends up in the
/// Response as `error = true`.
pub async fn dispatch(
    op: Operation,
    host: &Arc<Host>,
    pool: &SessionPool,
    pty: PtySize,
) -> Response {
    debug!(
        host = host.address(),
        kind = op.kind_name(),
        intent = ?op.intent(),
        label = op.label(),
        "dispatching"
    );

    let ctx = match op {
        Operation::RemoteCommand(cmd) => {
            let session = pool.session(host);
            let ctx = Context::new(host.clone(), Some(session), pty)
                .with_intent(cmd.intent)
                .with_escalation(cmd.escalation)
                .with_label(cmd.label.clone());
            run_command(&cmd, ctx).await
        }
        Operation::RemoteCallback(op) => {
            let session = pool.session(host);
            let RemoteCallback {
                callback,
                params,
                escalation,
                intent,
                label,
                ..
            } = op;
            let ctx = Context::new(host.clone(), Some(session), pty)
                .with_intent(intent)
                .with_params(params)
                .with_escalation(escalation)
                .with_label(label);
            run_callback(&callback, ctx).await
        }
        Operation::Passthrough(pt) => run_passthrough(pt, host, pty).await,
        Operation::Composite(_) => {
            let mut ctx = Context::new(host.clone(), None, pty);
            ctx.record_error(&OperationError::misuse(
                "nested programs are run by the host executor, not dispatched",
            ));
            ctx
        }
    };

    let response = into_response(ctx);
    debug!(
        host = %response.host,
        error = response.error,
        changed = ?response.changed,
        "dispatched"
    );
    response
}

async fn run_command(cmd: &RemoteCommand, mut ctx: Context) -> Context {
    let process = match ctx.run(&cmd.command).await {
        Ok(process) => process,
        Err(e) => {
            ctx.record_error(&e);
            return ctx;
        }
    };

    if let Some(signal) = &process.exit_signal {
        ctx.record_error(&OperationError::new(
            ErrorKind::ProcessSignalled,
            format!("command killed by signal {}", signal.name()),
        ));
    } else if process.exit_status != 0 {
        let err = OperationError::new(
            ErrorKind::ReturnCodeNotZero,
            format!("command exited with status {}", process.exit_status),
        );
        ctx.record_error(&err);
        // Mutating intents report what the command said
        if ctx.intent != Intent::Get && !process.stderr.trim().is_empty() {
            ctx.message = process.stderr.trim_end().to_string();
        }
    }

    ctx.changed = Some(!ctx.error);
    ctx.value = Some(process.to_value());
    ctx
}

async fn run_callback(callback: &Arc<dyn Callback>, mut ctx: Context) -> Context {
    invoke(callback, &mut ctx).await;
    if ctx.changed.is_none() {
        ctx.changed = Some(!ctx.error);
    }
    ctx
}

async fn run_passthrough(pt: Passthrough, host: &Arc<Host>, pty: PtySize) -> Context {
    let Passthrough {
        value,
        changed,
        callback,
        params,
        intent,
        label,
        ..
    } = pt;
    let mut ctx = Context::new(host.clone(), None, pty)
        .with_intent(intent)
        .with_params(params)
        .with_label(label);

    let misuse = passthrough_misuse(
        intent,
        value.is_some(),
        changed.is_some(),
        callback.is_some(),
    );
    if let Some(problem) = misuse {
        ctx.record_error(&OperationError::misuse(problem));
        return ctx;
    }

    ctx.value = value;
    ctx.changed = changed;
    if let Some(callback) = callback {
        invoke(&callback, &mut ctx).await;
    }
    ctx
}

fn passthrough_misuse(
    intent: Intent,
    has_value: bool,
    has_changed: bool,
    has_callback: bool,
) -> Option<&'static str> {
    match intent {
        Intent::Get if has_changed => Some("a Get passthrough cannot report changed"),
        Intent::Put if has_value => Some("a Put passthrough cannot carry a value"),
        Intent::Post if has_value || has_changed => {
            Some("a Post passthrough carries neither value nor changed")
        }
        _ if has_value && has_callback => {
            Some("a passthrough takes a value or a callback, not both")
        }
        _ => None,
    }
}

async fn invoke(callback: &Arc<dyn Callback>, ctx: &mut Context) {
    debug!(host = ctx.host().address(), callback = callback.name(), "invoking callback");
    let outcome = AssertUnwindSafe(callback.call(ctx)).catch_unwind().await;
    let result = match outcome {
        Ok(result) => result,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            warn!(
                host = ctx.host().address(),
                callback = callback.name(),
                "callback panicked: {}",
                message
            );
            ctx.record_error(&OperationError::new(
                ErrorKind::CallbackError,
                format!("{} panicked: {}", callback.name(), message),
            ));
            return;
        }
    };

    match result {
        Ok(value) => {
            if !value.is_null() || ctx.value.is_none() {
                ctx.value = Some(value);
            }
        }
        Err(e) => {
            let err = match e.downcast::<OperationError>() {
                Ok(err) => err,
                Err(e) => OperationError::new(
                    ErrorKind::CallbackError,
                    format!("{}: {:#}", callback.name(), e),
                ),
            };
            ctx.record_error(&err);
        }
    }
}

/// Apply the intent's field rules and scrub credentials
fn into_response(mut ctx: Context) -> Response {
    let host = ctx.host().clone();
    let secrets = host.secrets();

    let mut response = Response::ok(host.address()).with_label(ctx.label.take());
    response.error = ctx.error;
    response.kind = ctx.kind;
    response.message = redact(&ctx.message, &secrets);

    match ctx.intent {
        Intent::Get => {
            let mut value = ctx.value.take().unwrap_or(Value::Null);
            redact_value(&mut value, &secrets);
            response.value = Some(value);
        }
        Intent::Put => response.changed = Some(ctx.changed.unwrap_or(false)),
        Intent::Post => {}
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::testing::{MockConnector, MockHost};
    use crate::executor::TransportOptions;
    use crate::operation::callback;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    fn pool(hosts: Vec<MockHost>) -> (Arc<MockConnector>, SessionPool) {
        let connector = Arc::new(MockConnector::new(hosts));
        let pool = SessionPool::new(
            connector.clone(),
            TransportOptions {
                connect_timeout: Duration::from_secs(5),
                command_timeout: Duration::from_secs(5),
            },
        );
        (connector, pool)
    }

    async fn run(op: impl Into<Operation>, host: Host, mocks: Vec<MockHost>) -> Response {
        let (_, pool) = pool(mocks);
        dispatch(op.into(), &Arc::new(host), &pool, PtySize::default()).await
    }

    #[tokio::test]
    async fn test_get_command_carries_completed_process() {
        let r = run("echo hello", Host::new("h1"), vec![]).await;
        assert!(!r.error);
        assert_eq!(r.changed, None);
        let process = r.completed_process().unwrap();
        assert_eq!(process.stdout, "hello\n");
        assert_eq!(process.returncode, 0);
        assert_eq!(process.command, "echo hello");
    }

    #[tokio::test]
    async fn test_get_nonzero_exit() {
        let r = run("exit 3", Host::new("h1"), vec![]).await;
        assert!(r.error);
        assert_eq!(r.kind, Some(ErrorKind::ReturnCodeNotZero));
        assert_eq!(r.message, "ReturnCodeNotZero: command exited with status 3");
        assert_eq!(r.completed_process().unwrap().returncode, 3);
    }

    #[tokio::test]
    async fn test_put_nonzero_exit_reports_stderr() {
        let r = run(RemoteCommand::new("frobnicate").put(), Host::new("h1"), vec![]).await;
        assert!(r.error);
        assert_eq!(r.value, None);
        assert_eq!(r.changed, Some(false));
        assert_eq!(r.message, "sh: 1: frobnicate: not found");

        let ok = run(RemoteCommand::new("true").put(), Host::new("h1"), vec![]).await;
        assert_eq!(ok.changed, Some(true));
        assert_eq!(ok.value, None);
    }

    #[tokio::test]
    async fn test_post_command_has_no_fields() {
        let r = run(RemoteCommand::new("true").post(), Host::new("h1"), vec![]).await;
        assert!(!r.error);
        assert_eq!((r.value, r.changed), (None, None));
    }

    #[tokio::test]
    async fn test_signalled_command() {
        let r = run("kill -KILL", Host::new("h1"), vec![]).await;
        assert_eq!(r.kind, Some(ErrorKind::ProcessSignalled));
        let process = r.completed_process().unwrap();
        assert_eq!(process.exit_status, -1);
        assert_eq!(process.returncode, -9);
    }

    #[tokio::test]
    async fn test_unreachable_host() {
        let r = run("uptime", Host::new("gone"), vec![MockHost::new("gone").unreachable()]).await;
        assert!(r.error);
        assert_eq!(r.kind, Some(ErrorKind::Unreachable));
        assert_eq!(r.value, Some(Value::Null));
    }

    #[tokio::test]
    async fn test_sudo_wrong_password_is_auth_error() {
        let host = Host::new("h1").with_sudo(None, Some("wrong"));
        let r = run(
            RemoteCommand::new("whoami").sudo(),
            host,
            vec![MockHost::new("h1").sudo_password("right")],
        )
        .await;
        assert_eq!(r.kind, Some(ErrorKind::AuthError));
        assert!(!r.message.contains("wrong"));
    }

    #[tokio::test]
    async fn test_secrets_are_redacted() {
        let host = Host::new("h1").with_password("hunter2");
        let r = run("echo token=hunter2", host, vec![]).await;
        assert_eq!(r.completed_process().unwrap().stdout, "token=********\n");
    }

    #[tokio::test]
    async fn test_callback_error_kinds() {
        let plain = callback("explode", |_ctx| anyhow::bail!("boom"));
        let r = run(RemoteCallback::new(plain, Value::Null), Host::new("h1"), vec![]).await;
        assert_eq!(r.kind, Some(ErrorKind::CallbackError));
        assert_eq!(r.message, "CallbackError: explode: boom");

        let typed = callback("sftp", |_ctx| Err(OperationError::sftp("permission denied").into()));
        let r = run(RemoteCallback::new(typed, Value::Null), Host::new("h1"), vec![]).await;
        assert_eq!(r.kind, Some(ErrorKind::SftpError));
    }

    #[tokio::test]
    async fn test_callback_panic_becomes_callback_error() {
        let cb = callback("index", |ctx| {
            let items: Vec<Value> = Vec::new();
            Ok(items[ctx.params["at"].as_u64().unwrap_or(0) as usize].clone())
        });
        let r = run(RemoteCallback::new(cb, json!({"at": 3})), Host::new("h1"), vec![]).await;
        assert!(r.error);
        assert_eq!(r.kind, Some(ErrorKind::CallbackError));
        assert!(r.message.starts_with("CallbackError: index panicked: index out of bounds"));
    }

    #[tokio::test]
    async fn test_callback_value_and_changed() {
        let cb = callback("echo_params", |ctx| Ok(ctx.params.clone()));
        let r = run(RemoteCallback::new(cb.clone(), json!({"a": 1})), Host::new("h1"), vec![]).await;
        assert_eq!(r.value, Some(json!({"a": 1})));

        let put = RemoteCallback::new(cb, json!({})).intent(Intent::Put);
        let r = run(put, Host::new("h1"), vec![]).await;
        assert_eq!(r.changed, Some(true));
        assert_eq!(r.value, None);
    }

    #[tokio::test]
    async fn test_passthrough_never_connects() {
        let (connector, pool) = pool(vec![]);
        let host = Arc::new(Host::new("h1"));

        let r = dispatch(Passthrough::value(json!(42)).into(), &host, &pool, PtySize::default()).await;
        assert_eq!(r.value, Some(json!(42)));

        let probe = callback("probe", |ctx| Ok(json!(ctx.host().address())));
        let r = dispatch(
            Passthrough::callback(probe, Value::Null).into(),
            &host,
            &pool,
            PtySize::default(),
        )
        .await;
        assert_eq!(r.value, Some(json!("h1")));
        assert_eq!(connector.total_connects(), 0);
    }

    #[tokio::test]
    async fn test_passthrough_misuse() {
        let host = || Host::new("h1");
        let get_changed = Passthrough::value(json!(1)).with_changed(true);
        let r = run(get_changed, host(), vec![]).await;
        assert_eq!(r.kind, Some(ErrorKind::ProtocolMisuse));

        let put_value = Passthrough::changed(true).with_value(json!(1));
        assert_eq!(run(put_value, host(), vec![]).await.kind, Some(ErrorKind::ProtocolMisuse));

        let post_changed = Passthrough::post().with_changed(false);
        assert_eq!(run(post_changed, host(), vec![]).await.kind, Some(ErrorKind::ProtocolMisuse));

        let empty_get = run(Passthrough::default(), host(), vec![]).await;
        assert!(!empty_get.error);
        assert_eq!(empty_get.value, Some(Value::Null));
    }

    #[tokio::test]
    async fn test_label_is_carried() {
        let r = run(RemoteCommand::new("true").label("noop"), Host::new("h1"), vec![]).await;
        assert_eq!(r.label.as_deref(), Some("noop"));
    }
}
