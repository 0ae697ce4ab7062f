// Per-host executor: drives one program instance against one host

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::dispatch::dispatch;
use super::scheduler::ErrorPolicy;
use super::session::SessionPool;
use super::PtySize;
use crate::inventory::{host_matches_group, Host};
use crate::operation::{Operation, Program, Resume, Step};
use crate::output::json_output::JsonOutput;
use crate::output::response::Response;

/// Runs a program tree for one host.
///
/// Nested programs live on an explicit stack. A leaf operation is dispatched
/// (or skipped when its group filter excludes the host) and the outcome is
/// injected into the program on top of the stack at its next resume. Every
/// dispatched Response is appended to the shared result list.
pub struct HostExecutor {
    host: Arc<Host>,
    pool: Arc<SessionPool>,
    results: Arc<Mutex<Vec<Response>>>,
    pty: PtySize,
    policy: ErrorPolicy,
    run_log: Option<Arc<JsonOutput>>,
}

impl HostExecutor {
    pub fn new(
        host: Arc<Host>,
        pool: Arc<SessionPool>,
        results: Arc<Mutex<Vec<Response>>>,
    ) -> Self {
        HostExecutor {
            host,
            pool,
            results,
            pty: PtySize::default(),
            policy: ErrorPolicy::default(),
            run_log: None,
        }
    }

    pub fn with_pty(mut self, pty: PtySize) -> Self {
        self.pty = pty;
        self
    }

    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_run_log(mut self, run_log: Option<Arc<JsonOutput>>) -> Self {
        self.run_log = run_log;
        self
    }

    /// Run `program` to completion; returns the number of recorded Responses
    pub async fn run(self, program: Box<dyn Program>) -> usize {
        let mut stack: Vec<Box<dyn Program>> = vec![program];
        let mut pending = Resume::Start;
        let mut index = 0;
        let mut recorded = 0;

        while let Some(top) = stack.last_mut() {
            let input = std::mem::replace(&mut pending, Resume::Start);

            match top.resume(input) {
                Step::Done => {
                    stack.pop();
                    pending = Resume::Response(Response::neutral(self.host.address()));
                }
                Step::Return(result) => {
                    // The return value is recorded wherever the program ran
                    let response = self
                        .dispatch(Operation::Passthrough(result), &mut index)
                        .await;
                    recorded += 1;
                    stack.pop();
                    let stop = self.should_stop(&response);
                    pending = Resume::Response(response);
                    if stop {
                        break;
                    }
                }
                Step::Yield(Operation::Composite(nested)) => {
                    debug!(
                        host = self.host.address(),
                        depth = stack.len(),
                        "entering nested program"
                    );
                    stack.push(nested);
                }
                Step::Yield(op) => {
                    if let Some(group) = op.group() {
                        if !host_matches_group(&self.host, group) {
                            debug!(
                                host = self.host.address(),
                                group,
                                index,
                                "skipped by group filter"
                            );
                            index += 1;
                            pending = Resume::Skipped;
                            continue;
                        }
                    }

                    let response = self.dispatch(op, &mut index).await;
                    recorded += 1;
                    let stop = self.should_stop(&response);
                    pending = Resume::Response(response);
                    if stop {
                        break;
                    }
                }
            }
        }

        debug!(host = self.host.address(), recorded, "host finished");
        recorded
    }

    async fn dispatch(&self, op: Operation, index: &mut usize) -> Response {
        let response = dispatch(op, &self.host, &self.pool, self.pty)
            .await
            .with_index(*index);
        *index += 1;

        self.results.lock().push(response.clone());
        if let Some(log) = &self.run_log {
            log.print_response(&response);
        }
        response
    }

    fn should_stop(&self, response: &Response) -> bool {
        if response.error && self.policy == ErrorPolicy::StopHost {
            debug!(host = self.host.address(), "stopping host after error");
            return true;
        }
        false
    }
}
