// fanout - run programs of remote operations on many hosts at once
//
// A program yields operations one at a time; the engine runs one program
// instance per host, concurrently, over SSH with optional sudo/su, and
// feeds each result back before the next operation.

pub mod executor;
pub mod inventory;
pub mod operation;
pub mod output;

pub use executor::{Context, Engine, ErrorPolicy, Scheduler, SchedulerConfig};
pub use inventory::{Host, Inventory};
pub use operation::{
    Intent, Operation, Passthrough, Program, ProgramFactory, RemoteCallback, RemoteCommand,
    Resume, Script, Step,
};
pub use output::{ErrorKind, FanoutError, OperationError, Response, RunRecap};

/// Version of the fanout tool
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::executor::{Context, Engine, Scheduler, SchedulerConfig};
    pub use crate::inventory::{Host, Inventory};
    pub use crate::operation::callbacks::{download, ensure_directory, upload};
    pub use crate::operation::{
        callback, program_fn, Escalation, Intent, Operation, Passthrough, Program,
        RemoteCallback, RemoteCommand, Resume, Script, Step, TryFactory,
    };
    pub use crate::output::{FanoutError, Response, RunRecap};
}
