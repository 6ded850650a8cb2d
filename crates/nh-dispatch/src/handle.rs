//! Async request handles and receipt assembly.
//!
//! A [`Handle`] tracks one in-flight message: per-target results
//! accumulate under its lock, and the terminal transition (sticky,
//! monotonic) wakes every waiter and fires registered callbacks exactly
//! once on a dedicated task. Workers and timers reference handle state
//! through `Weak` pointers; the dispatcher holds the only engine-side
//! owning reference and releases it at the terminal transition, so a
//! request dies once the caller lets go and its jobs have reported.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use nh_common::{
    AggregateError, BatchReceipt, HandleState, NotifyError, Progress, Receipt, SendResult, Target,
};
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tracing::warn;

type CompleteCallback = Box<dyn FnOnce(&Receipt) + Send>;
type ErrorCallback = Box<dyn FnOnce(&AggregateError) + Send>;

pub(crate) struct HandleCore {
    id: String,
    message_id: String,
    /// Targets in request order; slot `i` of the results belongs to
    /// `targets[i]`. Kept here so cancellation can resolve pending
    /// slots without waiting for their jobs to surface.
    targets: Vec<Target>,
    started: Instant,
    inner: Mutex<HandleInner>,
    notify: Notify,
    cancel_tx: watch::Sender<bool>,
}

struct HandleInner {
    state: HandleState,
    results: Vec<Option<SendResult>>,
    resolved: usize,
    failed: usize,
    receipt: Option<Receipt>,
    on_complete: Vec<CompleteCallback>,
    on_error: Vec<ErrorCallback>,
    cancel_requested: bool,
}

impl HandleCore {
    pub(crate) fn new(message_id: String, targets: Vec<Target>) -> Arc<Self> {
        let (cancel_tx, _) = watch::channel(false);
        let total = targets.len();
        Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            message_id,
            targets,
            started: Instant::now(),
            inner: Mutex::new(HandleInner {
                state: HandleState::Pending,
                results: (0..total).map(|_| None).collect(),
                resolved: 0,
                failed: 0,
                receipt: None,
                on_complete: Vec::new(),
                on_error: Vec::new(),
                cancel_requested: false,
            }),
            notify: Notify::new(),
            cancel_tx,
        })
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    fn total(&self) -> usize {
        self.targets.len()
    }

    pub(crate) fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Move forward through the non-terminal part of the lattice.
    /// Terminal states are only ever reached through result completion.
    pub(crate) fn advance(&self, state: HandleState) {
        {
            let mut inner = self.inner.lock();
            if state.is_terminal()
                || inner.state.is_terminal()
                || state.rank() <= inner.state.rank()
            {
                return;
            }
            inner.state = state;
        }
        self.notify.notify_waiters();
    }

    /// Record the final outcome for one target slot. Slots are sticky:
    /// the first writer wins, later attempts for an already-resolved
    /// target are dropped.
    pub(crate) fn record_result(&self, index: usize, result: SendResult) {
        let finished = {
            let mut inner = self.inner.lock();
            if inner.receipt.is_some() {
                return;
            }
            match inner.results.get(index) {
                Some(None) => {}
                _ => return,
            }
            if !result.success {
                inner.failed += 1;
            }
            inner.results[index] = Some(result);
            inner.resolved += 1;
            if inner.resolved < self.total() {
                None
            } else {
                Some(self.finalize_locked(&mut inner))
            }
        };

        if let Some((receipt, on_complete, on_error, errors)) = finished {
            self.notify.notify_waiters();
            dispatch_callbacks(receipt, on_complete, on_error, errors);
        }
    }

    fn finalize_locked(
        &self,
        inner: &mut HandleInner,
    ) -> (Receipt, Vec<CompleteCallback>, Vec<ErrorCallback>, AggregateError) {
        let results: Vec<SendResult> = inner.results.iter().flatten().cloned().collect();
        inner.state = if inner.cancel_requested {
            HandleState::Cancelled
        } else if inner.failed == self.total() {
            HandleState::Failed
        } else {
            HandleState::Succeeded
        };
        let receipt =
            Receipt::from_results(self.message_id.clone(), results, self.started.elapsed());
        inner.receipt = Some(receipt.clone());

        let errors = collect_errors(&receipt);
        (
            receipt,
            std::mem::take(&mut inner.on_complete),
            std::mem::take(&mut inner.on_error),
            errors,
        )
    }

    /// Request cancellation. Returns true iff the handle was still
    /// non-terminal at call time.
    ///
    /// Every unresolved target resolves to `Cancelled` right here, so
    /// waiters return promptly; the cancel signal then stops queued
    /// jobs from running and drops in-flight adapter futures, whose
    /// late reports land on already-resolved slots and are ignored.
    pub(crate) fn cancel(&self) -> bool {
        let finished = {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                return false;
            }
            inner.cancel_requested = true;
            for (index, slot) in inner.results.iter_mut().enumerate() {
                if slot.is_none() {
                    *slot = Some(SendResult::failed(
                        self.targets[index].clone(),
                        NotifyError::cancelled(),
                        std::time::Duration::ZERO,
                    ));
                }
            }
            inner.failed = inner.results.iter().flatten().filter(|r| !r.success).count();
            inner.resolved = self.total();
            self.finalize_locked(&mut inner)
        };
        let _ = self.cancel_tx.send(true);
        self.notify.notify_waiters();
        let (receipt, on_complete, on_error, errors) = finished;
        dispatch_callbacks(receipt, on_complete, on_error, errors);
        true
    }

    pub(crate) fn is_cancel_requested(&self) -> bool {
        self.inner.lock().cancel_requested
    }

    pub(crate) fn cancel_receiver(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    pub(crate) fn state(&self) -> HandleState {
        self.inner.lock().state
    }

    pub(crate) fn progress(&self) -> Progress {
        let inner = self.inner.lock();
        Progress {
            done: inner.resolved,
            total: self.total(),
            failed: inner.failed,
        }
    }

    fn receipt(&self) -> Option<Receipt> {
        self.inner.lock().receipt.clone()
    }

    pub(crate) async fn wait(&self) -> Receipt {
        loop {
            let notified = self.notify.notified();
            if let Some(receipt) = self.receipt() {
                return receipt;
            }
            notified.await;
        }
    }

    pub(crate) fn on_complete(&self, cb: impl FnOnce(&Receipt) + Send + 'static) {
        let mut inner = self.inner.lock();
        if let Some(receipt) = inner.receipt.clone() {
            drop(inner);
            // Terminal already: fire on the registering thread.
            invoke_complete(Box::new(cb), &receipt);
        } else {
            inner.on_complete.push(Box::new(cb));
        }
    }

    pub(crate) fn on_error(&self, cb: impl FnOnce(&AggregateError) + Send + 'static) {
        let mut inner = self.inner.lock();
        if let Some(receipt) = inner.receipt.clone() {
            drop(inner);
            let errors = collect_errors(&receipt);
            if !errors.is_empty() {
                invoke_error(Box::new(cb), &errors);
            }
        } else {
            inner.on_error.push(Box::new(cb));
        }
    }
}

fn collect_errors(receipt: &Receipt) -> AggregateError {
    let mut errors = AggregateError::new();
    for result in &receipt.results {
        if let Some(error) = &result.error {
            errors.push(error.clone());
        }
    }
    errors
}

/// Fire callbacks off the worker that completed the last job, each in
/// isolation: a panicking callback is logged and the next one still
/// runs.
fn dispatch_callbacks(
    receipt: Receipt,
    on_complete: Vec<CompleteCallback>,
    on_error: Vec<ErrorCallback>,
    errors: AggregateError,
) {
    if on_complete.is_empty() && (on_error.is_empty() || errors.is_empty()) {
        return;
    }
    let run = move || {
        for cb in on_complete {
            invoke_complete(cb, &receipt);
        }
        if !errors.is_empty() {
            for cb in on_error {
                invoke_error(cb, &errors);
            }
        }
    };
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move { run() });
        }
        // cancel() from outside a runtime still has to fire callbacks.
        Err(_) => run(),
    }
}

fn invoke_complete(cb: CompleteCallback, receipt: &Receipt) {
    if std::panic::catch_unwind(AssertUnwindSafe(|| cb(receipt))).is_err() {
        warn!(message_id = %receipt.message_id, "completion callback panicked");
    }
}

fn invoke_error(cb: ErrorCallback, errors: &AggregateError) {
    if std::panic::catch_unwind(AssertUnwindSafe(|| cb(errors))).is_err() {
        warn!("error callback panicked");
    }
}

/// The async-result object for one submitted message.
///
/// Clones share the same underlying request. Waiters all observe the
/// same receipt; callbacks registered after the terminal transition fire
/// immediately on the registering thread.
#[derive(Clone)]
pub struct Handle {
    core: Arc<HandleCore>,
}

impl Handle {
    pub(crate) fn from_core(core: Arc<HandleCore>) -> Self {
        Self { core }
    }

    /// Stable identifier for this request.
    pub fn id(&self) -> &str {
        self.core.id()
    }

    pub fn message_id(&self) -> &str {
        self.core.message_id()
    }

    pub fn state(&self) -> HandleState {
        self.core.state()
    }

    /// Block until the request is terminal. Impose a deadline with
    /// `tokio::time::timeout` if needed; dropping the future does not
    /// affect the request.
    pub async fn wait(&self) -> Receipt {
        self.core.wait().await
    }

    /// Cooperative cancellation: queued work is discarded, in-flight
    /// adapter calls are abandoned, undelivered targets resolve with a
    /// `Cancelled` error. Returns true iff the handle was non-terminal.
    pub fn cancel(&self) -> bool {
        self.core.cancel()
    }

    pub fn on_complete(&self, cb: impl FnOnce(&Receipt) + Send + 'static) {
        self.core.on_complete(cb)
    }

    /// Registered callback fires iff at least one target failed (a
    /// cancelled target counts as failed).
    pub fn on_error(&self, cb: impl FnOnce(&AggregateError) + Send + 'static) {
        self.core.on_error(cb)
    }

    pub fn progress(&self) -> Progress {
        self.core.progress()
    }
}

/// Aggregates the handles of one batch submit.
pub struct BatchHandle {
    id: String,
    handles: Vec<Handle>,
    started: Instant,
}

impl BatchHandle {
    pub(crate) fn new(handles: Vec<Handle>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            handles,
            started: Instant::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn handles(&self) -> &[Handle] {
        &self.handles
    }

    /// Completes once every child handle is terminal.
    pub async fn wait(&self) -> BatchReceipt {
        let mut receipts = Vec::with_capacity(self.handles.len());
        for handle in &self.handles {
            receipts.push(handle.wait().await);
        }
        BatchReceipt::from_receipts(receipts, self.started.elapsed())
    }

    /// Cancel every non-terminal child; returns how many were still
    /// cancellable.
    pub fn cancel(&self) -> usize {
        self.handles.iter().filter(|h| h.cancel()).count()
    }

    pub fn progress(&self) -> Progress {
        let mut progress = Progress {
            done: 0,
            total: 0,
            failed: 0,
        };
        for handle in &self.handles {
            let p = handle.progress();
            progress.done += p.done;
            progress.total += p.total;
            progress.failed += p.failed;
        }
        progress
    }
}

// Convenience used by the dispatcher when a whole group fails before a
// job exists (routing errors, capability mismatches).
pub(crate) fn failed_result(
    target: nh_common::Target,
    error: NotifyError,
    attempts: u32,
) -> SendResult {
    let mut result = SendResult::failed(target, error, std::time::Duration::ZERO);
    result.attempts = attempts.max(1);
    result
}
