// Program protocol: how user programs produce operations and consume results
//
// A program is a resumable state machine. The per-host executor calls
// `resume` with the outcome of the previous step and gets back the next
// step. Nesting is done by yielding `Operation::Composite`.

use std::collections::VecDeque;

use serde_json::Value;

use super::{Intent, Operation, Passthrough};
use crate::output::response::Response;

/// Value injected into a program when it is resumed
#[derive(Debug, Clone, PartialEq)]
pub enum Resume {
    /// First resume of a (nested) program
    Start,
    /// Outcome of the previous yield, or of a completed nested program
    Response(Response),
    /// The previous operation's group filter excluded this host
    Skipped,
}

impl Resume {
    pub fn response(&self) -> Option<&Response> {
        match self {
            Resume::Response(r) => Some(r),
            _ => None,
        }
    }

    pub fn into_response(self) -> Option<Response> {
        match self {
            Resume::Response(r) => Some(r),
            _ => None,
        }
    }
}

/// What a program does next
#[derive(Debug)]
pub enum Step {
    /// Dispatch an operation (or push a nested program) and resume with its outcome
    Yield(Operation),
    /// Dispatch this passthrough and finish; its Response is the program's result
    Return(Passthrough),
    /// Finished without an explicit result
    Done,
}

impl Step {
    pub fn op(op: impl Into<Operation>) -> Self {
        Step::Yield(op.into())
    }
}

/// A user program. One instance runs per host.
pub trait Program: Send {
    fn resume(&mut self, input: Resume) -> Step;
}

impl<P: Program + ?Sized> Program for Box<P> {
    fn resume(&mut self, input: Resume) -> Step {
        (**self).resume(input)
    }
}

/// A program written as a closure over its own state
pub struct ProgramFn<F>(F);

impl<F> Program for ProgramFn<F>
where
    F: FnMut(Resume) -> Step + Send,
{
    fn resume(&mut self, input: Resume) -> Step {
        (self.0)(input)
    }
}

/// Build a program from a `FnMut(Resume) -> Step` state machine
pub fn program_fn<F>(f: F) -> ProgramFn<F>
where
    F: FnMut(Resume) -> Step + Send,
{
    ProgramFn(f)
}

/// Outcomes seen so far by a [`Script`], one slot per yielded operation.
/// `None` marks a step skipped by its group filter.
pub type History = [Option<Response>];

type Deferred = Box<dyn FnOnce(&History) -> Option<Operation> + Send>;
type Finisher = Box<dyn FnOnce(Vec<Option<Response>>) -> Passthrough + Send>;

enum Entry {
    Op(Operation),
    Then(Deferred),
}

/// Builder-style program: a queue of operations, some decided late from the
/// outcomes of earlier ones, with an optional explicit result.
///
/// ```ignore
/// let program = Script::new()
///     .step("echo A")
///     .then(|history| {
///         let first = history[0].as_ref()?;
///         first.is_ok().then(|| "echo B".into())
///     })
///     .collect_responses();
/// ```
#[derive(Default)]
pub struct Script {
    entries: VecDeque<Entry>,
    history: Vec<Option<Response>>,
    finish: Option<Finisher>,
}

impl Script {
    pub fn new() -> Self {
        Script::default()
    }

    /// Yield a fixed operation
    pub fn step(mut self, op: impl Into<Operation>) -> Self {
        self.entries.push_back(Entry::Op(op.into()));
        self
    }

    /// Decide the next operation from the outcomes so far; `None` yields
    /// nothing for this entry.
    pub fn then<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&History) -> Option<Operation> + Send + 'static,
    {
        self.entries.push_back(Entry::Then(Box::new(f)));
        self
    }

    /// Finish with an explicit result built from the history
    pub fn returning<F>(mut self, f: F) -> Self
    where
        F: FnOnce(Vec<Option<Response>>) -> Passthrough + Send + 'static,
    {
        self.finish = Some(Box::new(f));
        self
    }

    /// Finish with a Get passthrough whose value is the list of Responses
    /// received (skipped steps are left out).
    pub fn collect_responses(self) -> Self {
        self.returning(|history| {
            let responses: Vec<Value> = history
                .into_iter()
                .flatten()
                .map(|r| serde_json::to_value(&r).unwrap_or(Value::Null))
                .collect();
            Passthrough::value(Value::Array(responses)).intent(Intent::Get)
        })
    }

    pub fn history(&self) -> &History {
        &self.history
    }
}

impl Program for Script {
    fn resume(&mut self, input: Resume) -> Step {
        match input {
            Resume::Start => {}
            Resume::Response(r) => self.history.push(Some(r)),
            Resume::Skipped => self.history.push(None),
        }

        while let Some(entry) = self.entries.pop_front() {
            match entry {
                Entry::Op(op) => return Step::Yield(op),
                Entry::Then(f) => {
                    if let Some(op) = f(&self.history) {
                        return Step::Yield(op);
                    }
                }
            }
        }

        match self.finish.take() {
            Some(f) => Step::Return(f(std::mem::take(&mut self.history))),
            None => Step::Done,
        }
    }
}

/// Creates one program instance per host
pub trait ProgramFactory: Send + Sync {
    fn create(&self) -> anyhow::Result<Box<dyn Program>>;
}

impl<F, P> ProgramFactory for F
where
    F: Fn() -> P + Send + Sync,
    P: Program + 'static,
{
    fn create(&self) -> anyhow::Result<Box<dyn Program>> {
        Ok(Box::new(self()))
    }
}

/// Factory whose construction can fail; a failure aborts the run before
/// any host is contacted.
pub struct TryFactory<F>(pub F);

impl<F, P> ProgramFactory for TryFactory<F>
where
    F: Fn() -> anyhow::Result<P> + Send + Sync,
    P: Program + 'static,
{
    fn create(&self) -> anyhow::Result<Box<dyn Program>> {
        Ok(Box::new((self.0)()?))
    }
}
