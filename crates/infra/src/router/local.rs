//! In-process substrate on tokio.
//!
//! Each context is a task that owns its [`Workflow`] and drains an unbounded
//! mailbox in FIFO order. A context retires after `ttl` without signals; a
//! later signal starts a fresh one.
//!
//! - **Dedup**: a signal whose id equals the previously processed one is
//!   answered with the cached result and not handled again.
//! - **Retry**: a signal that fails with a retriable error is retried up to
//!   `max_attempts` times with a fixed backoff, resetting the workflow between
//!   attempts. A permanent error is not retried. A signal that still fails is
//!   answered with `SubstrateError::Failed`; the context stays up.
//! - **Retirement** re-checks the mailbox while holding the context table
//!   lock, and signals are only enqueued under that lock, so no signal is
//!   ever left in a retired mailbox.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{Instrument, debug, info, info_span, warn};

use strata_core::MessageId;

use crate::config::{DEFAULT_CONTEXT_TTL, RetryPolicy, RuntimeConfig};

use super::substrate::{
    ContextHandle, Signal, SignalResult, StartArgs, Substrate, SubstrateError, Workflow,
    WorkflowFactory,
};

type Reply = oneshot::Sender<Result<SignalResult, SubstrateError>>;

struct Envelope {
    signal: Signal,
    reply: Reply,
}

struct ContextEntry {
    sender: mpsc::UnboundedSender<Envelope>,
    generation: u64,
}

type ContextTable = Arc<Mutex<HashMap<String, ContextEntry>>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSubstrateConfig {
    /// Idle time after which a context retires.
    pub ttl: Duration,
    pub retry: RetryPolicy,
}

impl Default for LocalSubstrateConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_CONTEXT_TTL,
            retry: RetryPolicy::default(),
        }
    }
}

impl LocalSubstrateConfig {
    pub fn from_runtime(config: &RuntimeConfig) -> Self {
        Self {
            ttl: config.context_ttl,
            retry: config.retry,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

pub struct LocalSubstrate {
    factory: Arc<dyn WorkflowFactory>,
    config: LocalSubstrateConfig,
    contexts: ContextTable,
    generations: AtomicU64,
}

impl LocalSubstrate {
    pub fn new(factory: Arc<dyn WorkflowFactory>, config: LocalSubstrateConfig) -> Self {
        Self {
            factory,
            config,
            contexts: Arc::new(Mutex::new(HashMap::new())),
            generations: AtomicU64::new(0),
        }
    }

    /// Ids of the contexts currently running.
    pub fn active_contexts(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.contexts)
            .map(|table| table.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn is_active(&self, context_id: &str) -> bool {
        lock(&self.contexts)
            .map(|table| table.contains_key(context_id))
            .unwrap_or(false)
    }

    /// Number of contexts started so far.
    pub fn started(&self) -> u64 {
        self.generations.load(Ordering::SeqCst)
    }
}

fn lock(table: &ContextTable) -> Result<MutexGuard<'_, HashMap<String, ContextEntry>>, SubstrateError> {
    table
        .lock()
        .map_err(|_| SubstrateError::ContextGone("context table lock poisoned".to_string()))
}

#[async_trait]
impl Substrate for LocalSubstrate {
    async fn signal_or_start(
        &self,
        context_id: &str,
        task_queue: &str,
        start: StartArgs,
        signal: Signal,
    ) -> Result<ContextHandle, SubstrateError> {
        let (reply, rx) = oneshot::channel();
        let mut envelope = Envelope { signal, reply };

        let mut table = lock(&self.contexts)?;
        if let Some(entry) = table.get(context_id) {
            match entry.sender.send(envelope) {
                Ok(()) => {
                    debug!(context_id, "signaled running context");
                    return Ok(ContextHandle::new(context_id, rx));
                }
                Err(mpsc::error::SendError(returned)) => {
                    // The task ended without retiring (panic); start over.
                    table.remove(context_id);
                    envelope = returned;
                }
            }
        }

        let workflow = self.factory.create(context_id, &start)?;
        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let (sender, mailbox) = mpsc::unbounded_channel();
        if sender.send(envelope).is_err() {
            return Err(SubstrateError::ContextGone(context_id.to_string()));
        }
        table.insert(
            context_id.to_string(),
            ContextEntry { sender, generation },
        );
        drop(table);

        info!(context_id, task_queue, generation, "context started");
        let span = info_span!("context", context_id, task_queue);
        tokio::spawn(
            run_context(
                context_id.to_string(),
                generation,
                workflow,
                mailbox,
                self.contexts.clone(),
                self.config.clone(),
            )
            .instrument(span),
        );
        Ok(ContextHandle::new(context_id, rx))
    }
}

async fn run_context(
    context_id: String,
    generation: u64,
    mut workflow: Box<dyn Workflow>,
    mut mailbox: mpsc::UnboundedReceiver<Envelope>,
    contexts: ContextTable,
    config: LocalSubstrateConfig,
) {
    let mut last: Option<(MessageId, Result<SignalResult, SubstrateError>)> = None;

    loop {
        let envelope = match tokio::time::timeout(config.ttl, mailbox.recv()).await {
            Ok(Some(envelope)) => envelope,
            Ok(None) => break,
            Err(_elapsed) => match retire(&context_id, generation, &mut mailbox, &contexts) {
                Some(envelope) => envelope,
                None => {
                    info!(context_id = %context_id, "context idle, retiring");
                    return;
                }
            },
        };

        let Envelope { signal, reply } = envelope;
        if let Some((id, result)) = &last {
            if id == signal.id() {
                debug!(
                    context_id = %context_id,
                    message_id = %id,
                    "duplicate signal; replaying previous result"
                );
                let _ = reply.send(result.clone());
                continue;
            }
        }

        let result = handle_with_retry(&context_id, workflow.as_mut(), &signal, config.retry).await;
        last = Some((signal.id().clone(), result.clone()));
        // The caller may have stopped waiting.
        let _ = reply.send(result);
    }

    if let Ok(mut table) = lock(&contexts) {
        if table.get(&context_id).is_some_and(|e| e.generation == generation) {
            table.remove(&context_id);
        }
    }
}

/// Remove the context from the table unless a signal slipped in.
fn retire(
    context_id: &str,
    generation: u64,
    mailbox: &mut mpsc::UnboundedReceiver<Envelope>,
    contexts: &ContextTable,
) -> Option<Envelope> {
    let mut table = match lock(contexts) {
        Ok(table) => table,
        Err(e) => {
            warn!(context_id, error = %e, "cannot retire context cleanly");
            mailbox.close();
            return None;
        }
    };
    if let Ok(envelope) = mailbox.try_recv() {
        return Some(envelope);
    }
    if table.get(context_id).is_some_and(|e| e.generation == generation) {
        table.remove(context_id);
    }
    mailbox.close();
    None
}

async fn handle_with_retry(
    context_id: &str,
    workflow: &mut dyn Workflow,
    signal: &Signal,
    retry: RetryPolicy,
) -> Result<SignalResult, SubstrateError> {
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match workflow.handle(signal).await {
            Ok(result) => return Ok(result),
            Err(e) if attempt < max_attempts && e.is_retriable() => {
                warn!(
                    context_id,
                    message_id = %signal.id(),
                    message_type = signal.message_type(),
                    attempt,
                    error = %e,
                    "signal failed; retrying"
                );
                workflow.reset();
                tokio::time::sleep(retry.backoff).await;
                attempt += 1;
            }
            Err(e) => {
                warn!(
                    context_id,
                    message_id = %signal.id(),
                    message_type = signal.message_type(),
                    attempts = attempt,
                    error = %e,
                    "signal failed; giving up"
                );
                workflow.reset();
                return Err(SubstrateError::Failed {
                    context_id: context_id.to_string(),
                    attempts: attempt,
                    message: e.to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_dispatcher::PipelineError;
    use crate::event_store::EventStoreError;
    use crate::router::substrate::WorkflowError;
    use std::sync::atomic::AtomicUsize;
    use strata_events::CommandOutcome;
    use strata_systest::test_command;

    /// Counts handled signals; fails the first `fail_first` attempts.
    struct Counting {
        handled: Arc<AtomicUsize>,
        resets: Arc<AtomicUsize>,
        fail_first: usize,
        permanent: bool,
    }

    #[async_trait]
    impl Workflow for Counting {
        async fn handle(&mut self, _signal: &Signal) -> Result<SignalResult, WorkflowError> {
            let n = self.handled.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                if self.permanent {
                    return Err(PipelineError::UnknownAggregate("ledger".into()).into());
                }
                return Err(PipelineError::Store(EventStoreError::Unavailable("down".into())).into());
            }
            Ok(SignalResult::Outcome(CommandOutcome::Success { events: vec![] }))
        }

        fn reset(&mut self) {
            self.resets.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct Factory {
        handled: Arc<AtomicUsize>,
        resets: Arc<AtomicUsize>,
        created: AtomicUsize,
        fail_first: usize,
        permanent: bool,
    }

    impl WorkflowFactory for Factory {
        fn create(&self, _context_id: &str, _start: &StartArgs) -> Result<Box<dyn Workflow>, SubstrateError> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(Counting {
                handled: self.handled.clone(),
                resets: self.resets.clone(),
                fail_first: self.fail_first,
                permanent: self.permanent,
            }))
        }
    }

    fn start() -> StartArgs {
        StartArgs::Saga {
            saga: "s".into(),
            tenant_id: "t1".into(),
        }
    }

    fn substrate(factory: Arc<Factory>, ttl: Duration) -> LocalSubstrate {
        let retry = RetryPolicy {
            max_attempts: 3,
            backoff: Duration::from_millis(1),
        };
        LocalSubstrate::new(factory, LocalSubstrateConfig::default().with_ttl(ttl).with_retry(retry))
    }

    async fn send(substrate: &LocalSubstrate, signal: Signal) -> Result<SignalResult, SubstrateError> {
        substrate
            .signal_or_start("ctx-1", "q", start(), signal)
            .await
            .unwrap()
            .result()
            .await
    }

    #[tokio::test]
    async fn signals_reuse_the_running_context() {
        let factory = Arc::new(Factory::default());
        let substrate = substrate(factory.clone(), Duration::from_secs(5));

        send(&substrate, Signal::Command(test_command("createTest", "a1"))).await.unwrap();
        send(&substrate, Signal::Command(test_command("executeTest", "a1"))).await.unwrap();

        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        assert_eq!(factory.handled.load(Ordering::SeqCst), 2);
        assert_eq!(substrate.active_contexts(), vec!["ctx-1".to_string()]);
    }

    #[tokio::test]
    async fn duplicate_signal_is_not_handled_twice() {
        let factory = Arc::new(Factory::default());
        let substrate = substrate(factory.clone(), Duration::from_secs(5));
        let command = test_command("createTest", "a1");

        let first = send(&substrate, Signal::Command(command.clone())).await.unwrap();
        let second = send(&substrate, Signal::Command(command)).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(factory.handled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn idle_contexts_retire_and_restart() {
        let factory = Arc::new(Factory::default());
        let substrate = substrate(factory.clone(), Duration::from_millis(30));

        send(&substrate, Signal::Command(test_command("createTest", "a1"))).await.unwrap();
        assert!(substrate.is_active("ctx-1"));

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!substrate.is_active("ctx-1"));

        send(&substrate, Signal::Command(test_command("executeTest", "a1"))).await.unwrap();
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
        assert_eq!(substrate.started(), 2);
    }

    #[tokio::test]
    async fn failures_are_retried_with_reset() {
        let factory = Arc::new(Factory {
            fail_first: 2,
            ..Factory::default()
        });
        let substrate = substrate(factory.clone(), Duration::from_secs(5));

        send(&substrate, Signal::Command(test_command("createTest", "a1"))).await.unwrap();
        assert_eq!(factory.handled.load(Ordering::SeqCst), 3);
        assert_eq!(factory.resets.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_signal_only() {
        let factory = Arc::new(Factory {
            fail_first: 3,
            ..Factory::default()
        });
        let substrate = substrate(factory.clone(), Duration::from_secs(5));

        let err = send(&substrate, Signal::Command(test_command("createTest", "a1")))
            .await
            .unwrap_err();
        assert!(matches!(err, SubstrateError::Failed { attempts: 3, .. }));

        // The context is still up and handles the next signal.
        send(&substrate, Signal::Command(test_command("executeTest", "a1"))).await.unwrap();
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let factory = Arc::new(Factory {
            fail_first: 1,
            permanent: true,
            ..Factory::default()
        });
        let retry = RetryPolicy {
            max_attempts: 3,
            backoff: Duration::from_secs(5),
        };
        let substrate = LocalSubstrate::new(
            factory.clone(),
            LocalSubstrateConfig::default().with_retry(retry),
        );

        let started = tokio::time::Instant::now();
        let err = send(&substrate, Signal::Command(test_command("createTest", "a1")))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SubstrateError::Failed { attempts: 1, ref message, .. } if message.contains("'ledger'")
        ));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(factory.handled.load(Ordering::SeqCst), 1);
        assert_eq!(factory.resets.load(Ordering::SeqCst), 1);
    }
}
