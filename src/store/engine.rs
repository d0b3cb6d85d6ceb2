//! The Store: single-writer event loop, batching, subscriber fan-out
//! (spec.md §4.3, §5).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Notify, RwLock, RwLockReadGuard};
use tokio::task::JoinHandle;

use crate::store::actions::{Action, ChangeSummary};
use crate::store::reducer::reduce;
use crate::store::state::EngineState;
use crate::store::subscriber::{Subscriber, SubscriberId};

/// Why the Store loop exited (spec.md §4.3's termination contract; mirrors
/// the teacher's split of transient-vs-fatal error kinds).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("context cancelled")]
    ContextCancelled,
    #[error("user exited")]
    UserExited,
    #[error("subscriber panicked: {0}")]
    Panicked(String),
    #[error("fatal error: {0}")]
    FatalNonHud(String),
    #[error("exit signal received")]
    ExitSignal,
}

/// Shared read/dispatch access to a running Store, handed to every
/// subscriber. Reads take a shared lock; dispatch is a non-blocking send.
#[derive(Clone)]
pub struct StoreHandle {
    state: Arc<RwLock<EngineState>>,
    action_tx: mpsc::UnboundedSender<Action>,
}

impl StoreHandle {
    pub async fn read(&self) -> RwLockReadGuard<'_, EngineState> {
        self.state.read().await
    }

    /// Non-blocking: queues `action` for the next batch.
    pub fn dispatch(&self, action: Action) {
        let _ = self.action_tx.send(action);
    }
}

struct SubscriberEntry {
    id: SubscriberId,
    subscriber: Arc<dyn Subscriber>,
    notify: Arc<Notify>,
    pending: Arc<Mutex<Option<ChangeSummary>>>,
    worker: JoinHandle<()>,
}

pub struct Store {
    handle: StoreHandle,
    subscribers: Arc<RwLock<Vec<SubscriberEntry>>>,
    next_subscriber_id: AtomicU64,
    loop_handle: Mutex<Option<JoinHandle<Result<(), EngineError>>>>,
}

impl Store {
    pub fn new(initial_state: EngineState, batch_window: Duration) -> Self {
        let state = Arc::new(RwLock::new(initial_state));
        let (action_tx, action_rx) = mpsc::unbounded_channel();
        let handle = StoreHandle {
            state: state.clone(),
            action_tx,
        };
        let subscribers: Arc<RwLock<Vec<SubscriberEntry>>> = Arc::new(RwLock::new(Vec::new()));

        let loop_handle = tokio::spawn(run_loop(state, action_rx, subscribers.clone(), batch_window));

        Self {
            handle,
            subscribers,
            next_subscriber_id: AtomicU64::new(1),
            loop_handle: Mutex::new(Some(loop_handle)),
        }
    }

    pub fn handle(&self) -> StoreHandle {
        self.handle.clone()
    }

    pub fn dispatch(&self, action: Action) {
        self.handle.dispatch(action);
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, EngineState> {
        self.handle.read().await
    }

    /// Registers a subscriber, calling `set_up` once before it can receive
    /// notifications, and spawns its single-flight coalescing worker.
    pub async fn register_subscriber(&self, subscriber: Arc<dyn Subscriber>) -> SubscriberId {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        subscriber.set_up(&self.handle).await;

        let notify = Arc::new(Notify::new());
        let pending: Arc<Mutex<Option<ChangeSummary>>> = Arc::new(Mutex::new(None));
        let worker = tokio::spawn(subscriber_worker(
            subscriber.clone(),
            self.handle.clone(),
            notify.clone(),
            pending.clone(),
        ));

        self.subscribers.write().await.push(SubscriberEntry {
            id,
            subscriber,
            notify,
            pending,
            worker,
        });
        id
    }

    /// Tears down one subscriber's coalescing worker and drops it from the
    /// fan-out list. No-op if `id` isn't registered.
    pub async fn deregister_subscriber(&self, id: SubscriberId) {
        let mut subscribers = self.subscribers.write().await;
        if let Some(pos) = subscribers.iter().position(|s| s.id == id) {
            let entry = subscribers.remove(pos);
            entry.worker.abort();
        }
    }

    /// Blocks until the Store loop terminates, tearing down subscribers in
    /// reverse registration order.
    pub async fn join(&self) -> Result<(), EngineError> {
        let result = {
            let mut guard = self.loop_handle.lock().await;
            match guard.take() {
                Some(handle) => handle.await.unwrap_or_else(|e| Err(EngineError::Panicked(e.to_string()))),
                None => Ok(()),
            }
        };

        let mut subs = self.subscribers.write().await;
        while let Some(entry) = subs.pop() {
            entry.subscriber.tear_down(&self.handle).await;
            entry.worker.abort();
        }
        result
    }
}

/// Runs one subscriber's `on_change` under a panic boundary, turning a panic
/// into `Action::Panic` and an `Err` return into `Action::Error` rather than
/// letting either take down the worker task or the rest of the fan-out
/// (spec.md §4.3, §8's panic-exit scenario). The call runs on its own task so
/// a panic inside `on_change` surfaces as a `JoinError` instead of unwinding
/// this worker.
async fn subscriber_worker(
    subscriber: Arc<dyn Subscriber>,
    handle: StoreHandle,
    notify: Arc<Notify>,
    pending: Arc<Mutex<Option<ChangeSummary>>>,
) {
    loop {
        notify.notified().await;
        let summary = pending.lock().await.take();
        let Some(summary) = summary else { continue };

        let call_handle = handle.clone();
        let call_subscriber = subscriber.clone();
        let join = tokio::spawn(async move { call_subscriber.on_change(&call_handle, &summary).await });

        match join.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => handle.dispatch(Action::Error { message: e.to_string() }),
            Err(join_error) => handle.dispatch(Action::Panic {
                message: join_error.to_string(),
            }),
        }
    }
}

async fn run_loop(
    state: Arc<RwLock<EngineState>>,
    mut action_rx: mpsc::UnboundedReceiver<Action>,
    subscribers: Arc<RwLock<Vec<SubscriberEntry>>>,
    batch_window: Duration,
) -> Result<(), EngineError> {
    loop {
        let first = match action_rx.recv().await {
            Some(a) => a,
            None => return Ok(()),
        };
        let mut batch = vec![first];

        if !batch_window.is_zero() {
            tokio::time::sleep(batch_window).await;
        }
        while let Ok(a) = action_rx.try_recv() {
            batch.push(a);
        }

        let mut summary = ChangeSummary::default();
        {
            let mut guard = state.write().await;
            for action in batch {
                let s = reduce(&mut guard, action);
                summary.merge(s);
            }
        }

        for entry in subscribers.read().await.iter() {
            let mut pending = entry.pending.lock().await;
            match pending.as_mut() {
                Some(existing) => existing.merge(summary.clone()),
                None => *pending = Some(summary.clone()),
            }
            entry.notify.notify_one();
        }

        let (terminate, reason) = {
            let guard = state.read().await;
            let reason = if guard.exit_signal {
                Some(EngineError::ExitSignal)
            } else if guard.user_exited {
                Some(EngineError::UserExited)
            } else if let Some(p) = &guard.panic_exited {
                Some(EngineError::Panicked(p.clone()))
            } else if guard.fatal_error.is_some() && guard.terminal_mode != crate::store::state::TerminalMode::Hud {
                Some(EngineError::FatalNonHud(guard.fatal_error.clone().unwrap()))
            } else {
                None
            };
            (guard.should_terminate(), reason)
        };

        if terminate {
            return match reason {
                Some(e) => Err(e),
                None => Ok(()),
            };
        }
    }
}
