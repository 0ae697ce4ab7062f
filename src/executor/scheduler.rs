// Fan-out scheduler: one executor per host, all running concurrently

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{error, info};

use super::host::HostExecutor;
use super::session::SessionPool;
use super::{Connector, DefaultConnector, PtySize, TransportOptions};
use crate::inventory::{HostFilter, Inventory};
use crate::operation::{Program, ProgramFactory};
use crate::output::errors::FanoutError;
use crate::output::json_output::JsonOutput;
use crate::output::response::Response;
use crate::output::terminal::RunRecap;

/// What a host's executor does after an error Response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// Inject the error into the program and keep going
    #[default]
    Inject,
    /// Stop this host; other hosts are unaffected
    StopHost,
}

/// Configuration for the scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Per-command timeout
    pub command_timeout: Duration,
    /// Pseudo-terminal size for escalated commands that need one
    pub pty_size: PtySize,
    /// Error handling inside a host's program
    pub error_policy: ErrorPolicy,
    /// Only run on hosts matching one of these addresses or groups
    pub limit: Option<Vec<String>>,
    /// Append an NDJSON run log here
    pub logfile: Option<PathBuf>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            connect_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(300),
            pty_size: PtySize::default(),
            error_policy: ErrorPolicy::Inject,
            limit: None,
            logfile: None,
        }
    }
}

/// Runs a program on every selected host of an inventory
pub struct Scheduler {
    config: SchedulerConfig,
    connector: Arc<dyn Connector>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self::with_connector(config, Arc::new(DefaultConnector))
    }

    pub fn with_connector(config: SchedulerConfig, connector: Arc<dyn Connector>) -> Self {
        Scheduler { config, connector }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run one program instance per host and return every Response.
    ///
    /// Per-host order is the program's yield order; the interleaving across
    /// hosts is unspecified. Dispatch failures are Responses, not errors:
    /// `Err` means the run itself could not happen or a program panicked.
    pub async fn execute<F>(
        &self,
        factory: &F,
        inventory: &Inventory,
    ) -> Result<Vec<Response>, FanoutError>
    where
        F: ProgramFactory + ?Sized,
    {
        self.execute_logged(factory, inventory, self.config.logfile.as_deref())
            .await
    }

    /// [`execute`](Self::execute) with an explicit run log path
    pub async fn execute_logged<F>(
        &self,
        factory: &F,
        inventory: &Inventory,
        logfile: Option<&Path>,
    ) -> Result<Vec<Response>, FanoutError>
    where
        F: ProgramFactory + ?Sized,
    {
        let start = Instant::now();

        let mut filter = HostFilter::new();
        if let Some(limit) = &self.config.limit {
            filter = filter.with_limit(limit.clone());
        }
        let hosts = filter.apply(inventory.hosts());

        // Every program exists before anything touches a host
        let mut programs: Vec<Box<dyn Program>> = Vec::with_capacity(hosts.len());
        for _ in &hosts {
            let program = factory
                .create()
                .map_err(|e| FanoutError::ProgramFactory {
                    message: format!("{:#}", e),
                })?;
            programs.push(program);
        }

        let run_log = match logfile {
            Some(path) => Some(Arc::new(JsonOutput::to_file(path)?)),
            None => None,
        };
        let addresses: Vec<String> = hosts.iter().map(|h| h.address().to_string()).collect();
        if let Some(log) = &run_log {
            log.print_run_header("run", &addresses);
        }
        info!(hosts = hosts.len(), "starting run");

        let pool = Arc::new(SessionPool::new(
            self.connector.clone(),
            TransportOptions {
                connect_timeout: self.config.connect_timeout,
                command_timeout: self.config.command_timeout,
            },
        ));
        let results = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = JoinSet::new();
        for (host, program) in hosts.into_iter().zip(programs) {
            let address = host.address().to_string();
            let executor =
                HostExecutor::new(Arc::new(host.clone()), pool.clone(), results.clone())
                    .with_pty(self.config.pty_size)
                    .with_error_policy(self.config.error_policy)
                    .with_run_log(run_log.clone());

            tasks.spawn(async move {
                let outcome = AssertUnwindSafe(executor.run(program)).catch_unwind().await;
                (address, outcome)
            });
        }

        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(_))) => {}
                Ok((host, Err(panic))) => {
                    let message = panic_message(panic.as_ref());
                    error!(host = %host, "program panicked: {}", message);
                    if failure.is_none() {
                        failure = Some(FanoutError::Executor { host, message });
                        tasks.abort_all();
                    }
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    error!("host task failed: {}", e);
                    if failure.is_none() {
                        failure = Some(FanoutError::Executor {
                            host: "unknown".to_string(),
                            message: e.to_string(),
                        });
                        tasks.abort_all();
                    }
                }
            }
        }

        // Teardown runs on every exit path
        pool.close_all().await;

        let responses = std::mem::take(&mut *results.lock());
        let recap = RunRecap::from_responses(&responses, start.elapsed());
        if let Some(log) = &run_log {
            log.print_recap(&recap);
        }
        info!(
            responses = responses.len(),
            failed = recap.total_failed(),
            changed = recap.total_changed(),
            duration_ms = start.elapsed().as_millis() as u64,
            "run complete"
        );

        match failure {
            Some(err) => Err(err),
            None => Ok(responses),
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "program panicked".to_string()
    }
}

/// A scheduler plus the process-wide default inventory used by
/// [`Engine::endpoint_execute`]. Set the inventory once at startup.
pub struct Engine {
    scheduler: Scheduler,
    default_inventory: RwLock<Option<Arc<Inventory>>>,
}

impl Engine {
    pub fn new(scheduler: Scheduler) -> Self {
        Engine {
            scheduler,
            default_inventory: RwLock::new(None),
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn set_default_inventory(&self, inventory: Inventory) {
        *self.default_inventory.write() = Some(Arc::new(inventory));
    }

    pub fn default_inventory(&self) -> Option<Arc<Inventory>> {
        self.default_inventory.read().clone()
    }

    pub fn clear_default_inventory(&self) {
        *self.default_inventory.write() = None;
    }

    pub async fn execute<F>(
        &self,
        factory: &F,
        inventory: &Inventory,
    ) -> Result<Vec<Response>, FanoutError>
    where
        F: ProgramFactory + ?Sized,
    {
        self.scheduler.execute(factory, inventory).await
    }

    /// Run against the default inventory
    pub async fn endpoint_execute<F>(&self, factory: &F) -> Result<Vec<Response>, FanoutError>
    where
        F: ProgramFactory + ?Sized,
    {
        let inventory = self.default_inventory().ok_or(FanoutError::InventoryMissing)?;
        self.scheduler.execute(factory, &inventory).await
    }
}
