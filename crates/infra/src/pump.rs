//! Command pump: feeds pending commands from the command log to the router.
//!
//! Commands are claimed in log order (`pending → consumed`), scheduled, and
//! marked `processed` or `failed`. A command whose aggregate step failed is
//! marked `failed`; so is one the router could not place. When nothing is
//! pending the pump waits on the log's insert notification, bounded by the
//! poll interval.
//!
//! Up to `max_in_flight` commands are routed at once. Commands that share an
//! ordering key (the context they target) never overlap, so each context still
//! sees its commands in log order.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use strata_core::MessageId;
use strata_events::{Command, CommandOutcome, CommandStatus};

use crate::command_log::{CommandLog, CommandLogError};
use crate::router::{RouteError, RouteReport, Router};

#[derive(Debug, Clone)]
pub struct PumpConfig {
    /// Longest wait for new commands before polling again.
    pub poll_interval: Duration,
    /// Commands routed concurrently, across distinct contexts.
    pub max_in_flight: usize,
    /// Name for logging
    pub name: String,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            max_in_flight: 16,
            name: "command-pump".to_string(),
        }
    }
}

impl PumpConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PumpStats {
    pub claimed: u64,
    pub processed: u64,
    pub failed: u64,
    pub unroutable: u64,
}

impl PumpStats {
    fn record(&mut self, pumped: &Pumped) {
        match pumped.status {
            CommandStatus::Processed => self.processed += 1,
            _ => self.failed += 1,
        }
        if matches!(pumped.route, Err(RouteError::NoRoute(_))) {
            self.unroutable += 1;
        }
    }
}

/// One command taken through the router.
#[derive(Debug)]
pub struct Pumped {
    pub command_id: MessageId,
    pub status: CommandStatus,
    pub route: Result<RouteReport, RouteError>,
}

/// Handle to a running pump. Dropping it stops the pump too.
#[derive(Debug)]
pub struct PumpHandle {
    shutdown: oneshot::Sender<()>,
    join: JoinHandle<()>,
    stats: Arc<Mutex<PumpStats>>,
}

impl PumpHandle {
    /// Stop claiming, finish the commands in flight and wait for the task to end.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        let _ = self.join.await;
    }

    pub fn stats(&self) -> PumpStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[derive(Clone)]
pub struct CommandPump {
    log: Arc<dyn CommandLog>,
    router: Router,
}

impl CommandPump {
    pub fn new(log: Arc<dyn CommandLog>, router: Router) -> Self {
        Self { log, router }
    }

    /// Claim and route the oldest pending command, if any.
    pub async fn run_once(&self) -> Result<Option<Pumped>, CommandLogError> {
        let Some(command) = self.log.claim_next().await? else {
            return Ok(None);
        };
        self.process(command).await.map(Some)
    }

    /// Route a claimed command and record its final status.
    async fn process(&self, command: Command) -> Result<Pumped, CommandLogError> {
        debug!(command_id = %command.id, command_type = %command.command_type, "routing command");

        let route = self.router.schedule(&command).await;
        let status = match &route {
            Ok(report) => match &report.outcome {
                Some(CommandOutcome::Fail { error, retriable }) => {
                    info!(
                        command_id = %command.id,
                        command_type = %command.command_type,
                        error,
                        retriable,
                        "command failed"
                    );
                    CommandStatus::Failed
                }
                _ => CommandStatus::Processed,
            },
            Err(e) => {
                warn!(
                    command_id = %command.id,
                    command_type = %command.command_type,
                    error = %e,
                    "command could not be routed"
                );
                CommandStatus::Failed
            }
        };
        self.log.mark(&command.id, status).await?;

        Ok(Pumped {
            command_id: command.id,
            status,
            route,
        })
    }

    /// Route commands in the background until shut down.
    pub fn spawn(self, config: PumpConfig) -> PumpHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let stats = Arc::new(Mutex::new(PumpStats::default()));
        let join = tokio::spawn(pump_loop(self, config, shutdown_rx, stats.clone()));
        PumpHandle {
            shutdown: shutdown_tx,
            join,
            stats,
        }
    }
}

type Busy = Arc<Mutex<HashSet<String>>>;

/// Releases an ordering key when its command task ends, panics included.
struct KeyGuard {
    busy: Busy,
    key: String,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        if let Ok(mut busy) = self.busy.lock() {
            busy.remove(&self.key);
        }
    }
}

fn is_busy(busy: &Busy, key: &str) -> bool {
    busy.lock().map(|b| b.contains(key)).unwrap_or(false)
}

type TaskResult = Result<Result<Pumped, CommandLogError>, JoinError>;

fn record(name: &str, stats: &Mutex<PumpStats>, result: TaskResult) {
    match result {
        Ok(Ok(pumped)) => {
            if let Ok(mut s) = stats.lock() {
                s.record(&pumped);
            }
        }
        Ok(Err(e)) => error!(pump = %name, error = %e, "cannot record command status"),
        Err(e) => error!(pump = %name, error = %e, "command task ended abnormally"),
    }
}

async fn pump_loop(
    pump: CommandPump,
    config: PumpConfig,
    mut shutdown: oneshot::Receiver<()>,
    stats: Arc<Mutex<PumpStats>>,
) {
    info!(pump = %config.name, max_in_flight = config.max_in_flight, "command pump started");
    let max_in_flight = config.max_in_flight.max(1);
    let busy: Busy = Arc::new(Mutex::new(HashSet::new()));
    let mut in_flight = JoinSet::new();

    loop {
        if !matches!(shutdown.try_recv(), Err(oneshot::error::TryRecvError::Empty)) {
            break;
        }

        while in_flight.len() >= max_in_flight {
            if let Some(result) = in_flight.join_next().await {
                record(&config.name, &stats, result);
            }
        }

        match pump.log.claim_next().await {
            Ok(Some(command)) => {
                if let Ok(mut s) = stats.lock() {
                    s.claimed += 1;
                }
                let key = pump.router.ordering_key(&command);
                while is_busy(&busy, &key) {
                    match in_flight.join_next().await {
                        Some(result) => record(&config.name, &stats, result),
                        None => break,
                    }
                }
                if let Ok(mut b) = busy.lock() {
                    b.insert(key.clone());
                }

                let guard = KeyGuard {
                    busy: busy.clone(),
                    key,
                };
                let pump = pump.clone();
                in_flight.spawn(async move {
                    let _guard = guard;
                    pump.process(command).await
                });
            }
            Ok(None) => {
                tokio::select! {
                    _ = &mut shutdown => break,
                    Some(result) = in_flight.join_next(), if !in_flight.is_empty() => {
                        record(&config.name, &stats, result);
                    }
                    _ = pump.log.wait_for_pending(config.poll_interval) => {}
                }
            }
            Err(e) => {
                error!(pump = %config.name, error = %e, "command log error");
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = tokio::time::sleep(config.poll_interval) => {}
                }
            }
        }
    }

    while let Some(result) = in_flight.join_next().await {
        record(&config.name, &stats, result);
    }
    info!(pump = %config.name, "command pump stopped");
}
