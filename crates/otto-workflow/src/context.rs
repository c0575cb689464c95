// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::future::LocalBoxFuture;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::activity::ActivityOptions;
use crate::error::{ActivityError, ClientError, UpdateRejection, WorkflowError};
use crate::event::EventRecord;
use crate::instance::{HandlerRegistry, SignalQueue, WorkflowHandle};
use crate::worker::WorkerShared;

/// How a workflow run ends: a final result, or a restart with a fresh
/// event history carrying the serialized state snapshot forward.
#[derive(Debug, Clone)]
pub enum WorkflowExit {
    Completed(Value),
    ContinueAsNew(Value),
}

pub type WorkflowResult = Result<WorkflowExit, WorkflowError>;
pub type WorkflowFuture = LocalBoxFuture<'static, WorkflowResult>;
/// A registered workflow function.  The closure is `Send` so registrations
/// can move to the workflow thread; the future it returns is not.
pub type WorkflowFn = Arc<dyn Fn(WfContext, Value) -> WorkflowFuture + Send + Sync>;

pub(crate) struct ContextInner {
    pub(crate) workflow_id: String,
    pub(crate) run_id: String,
    pub(crate) registry: Rc<HandlerRegistry>,
    pub(crate) worker: Arc<WorkerShared>,
    pub(crate) notify: Rc<Notify>,
    next_event_id: Cell<u64>,
    run_tasks: RefCell<Vec<JoinHandle<()>>>,
}

/// Handle workflow code uses to reach the runtime.
///
/// Cheap to clone, and `!Send` on purpose: everything it touches lives on
/// the workflow thread.
#[derive(Clone)]
pub struct WfContext {
    inner: Rc<ContextInner>,
}

impl WfContext {
    pub(crate) fn new(
        worker: Arc<WorkerShared>,
        registry: Rc<HandlerRegistry>,
        notify: Rc<Notify>,
        workflow_id: String,
        run_id: String,
    ) -> Self {
        Self {
            inner: Rc::new(ContextInner {
                workflow_id,
                run_id,
                registry,
                worker,
                notify,
                next_event_id: Cell::new(0),
                run_tasks: RefCell::new(Vec::new()),
            }),
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.inner.workflow_id
    }

    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    /// Version string of the hosting worker, surfaced in status queries.
    pub fn worker_version(&self) -> String {
        self.inner.worker.version.clone()
    }

    fn next_event_id(&self) -> u64 {
        let id = self.inner.next_event_id.get() + 1;
        self.inner.next_event_id.set(id);
        id
    }

    pub(crate) fn record(&self, event: EventRecord) {
        self.inner
            .worker
            .sink
            .append(&self.inner.workflow_id, &self.inner.run_id, &event);
    }

    // ── Coordination ──────────────────────────────────────────────────────────

    /// Wake every waiter parked in [`Self::await_condition`].  Handlers call
    /// this after any observable mutation.
    pub fn state_changed(&self) {
        self.inner.notify.notify_waiters();
    }

    /// Suspend until `cond` holds.  The condition is re-evaluated after every
    /// state-changed notification; state observed before the suspension may
    /// have changed by the time it returns.
    pub async fn await_condition(&self, cond: impl Fn() -> bool) {
        loop {
            let notified = self.inner.notify.notified();
            if cond() {
                return;
            }
            notified.await;
        }
    }

    /// Like [`Self::await_condition`] with an upper bound.  Returns whether
    /// the condition held (false means the timer fired first).
    pub async fn await_condition_timeout(
        &self,
        cond: impl Fn() -> bool,
        timeout: Duration,
    ) -> bool {
        let sleep = tokio::time::sleep(timeout);
        tokio::pin!(sleep);
        loop {
            let notified = self.inner.notify.notified();
            if cond() {
                return true;
            }
            tokio::select! {
                _ = &mut sleep => return cond(),
                _ = notified => {}
            }
        }
    }

    /// Durable timer.
    pub async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
        let event_id = self.next_event_id();
        self.record(EventRecord::TimerFired {
            event_id,
            millis: duration.as_millis() as u64,
        });
    }

    // ── Non-determinism escape hatches ───────────────────────────────────────

    /// Run a non-deterministic closure once and record its value so replay
    /// returns the same answer.
    pub fn side_effect<T: Serialize>(&self, f: impl FnOnce() -> T) -> T {
        let value = f();
        let event_id = self.next_event_id();
        let recorded = serde_json::to_value(&value).unwrap_or(Value::Null);
        self.record(EventRecord::SideEffect {
            event_id,
            value: recorded,
        });
        value
    }

    /// Workflow-safe wall clock read, in nanoseconds since the epoch.
    /// Used for deterministic id generation (`agent-<nanos>`, `turn-<nanos>`).
    pub fn clock_nanos(&self) -> u64 {
        self.side_effect(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0)
        })
    }

    /// Workflow-safe UUID.
    pub fn new_uuid(&self) -> String {
        self.side_effect(|| uuid::Uuid::new_v4().to_string())
    }

    // ── Activities ────────────────────────────────────────────────────────────

    /// Invoke an activity and wait for its (retried) result.
    pub async fn execute_activity(
        &self,
        name: &str,
        input: Value,
        options: ActivityOptions,
    ) -> Result<Value, ActivityError> {
        let event_id = self.next_event_id();
        self.record(EventRecord::ActivityScheduled {
            event_id,
            name: name.to_string(),
            input: input.clone(),
        });
        let result = run_attempts(self.inner.worker.clone(), name, input, options).await;
        self.record_activity_result(event_id, name, &result);
        result
    }

    /// Start an activity without waiting.  The returned handle aborts the
    /// in-flight call when dropped, so abandoning a turn cancels its work.
    pub fn start_activity(
        &self,
        name: &str,
        input: Value,
        options: ActivityOptions,
    ) -> ActivityHandle {
        let event_id = self.next_event_id();
        self.record(EventRecord::ActivityScheduled {
            event_id,
            name: name.to_string(),
            input: input.clone(),
        });
        let ctx = self.clone();
        let name = name.to_string();
        let worker = self.inner.worker.clone();
        let task = tokio::task::spawn_local(async move {
            let result = run_attempts(worker, &name, input, options).await;
            ctx.record_activity_result(event_id, &name, &result);
            result
        });
        ActivityHandle { task: Some(task) }
    }

    fn record_activity_result(
        &self,
        event_id: u64,
        name: &str,
        result: &Result<Value, ActivityError>,
    ) {
        match result {
            Ok(value) => self.record(EventRecord::ActivityCompleted {
                event_id,
                name: name.to_string(),
                result: value.clone(),
            }),
            Err(e) => self.record(EventRecord::ActivityFailed {
                event_id,
                name: name.to_string(),
                kind: e.kind.clone(),
                message: e.message.clone(),
            }),
        }
    }

    // ── Handlers ─────────────────────────────────────────────────────────────

    /// Register an update handler: a pure validator that may reject, and an
    /// async handler run once the update is durably accepted.
    pub fn register_update<V, H>(&self, name: &str, validator: V, handler: H)
    where
        V: Fn(&Value) -> Result<(), UpdateRejection> + 'static,
        H: Fn(Value) -> LocalBoxFuture<'static, Result<Value, UpdateRejection>> + 'static,
    {
        self.inner
            .registry
            .register_update(name, Rc::new(validator), Rc::new(handler));
    }

    /// Register a read-only query.
    pub fn register_query(&self, name: &str, f: impl Fn() -> Value + 'static) {
        self.inner.registry.register_query(name, Rc::new(f));
    }

    /// FIFO receiver for a named signal channel.  Signals sent before the
    /// channel is first taken are buffered.
    pub fn signal_channel(&self, name: &str) -> SignalReceiver {
        SignalReceiver {
            queue: self.inner.registry.signal_queue(name),
        }
    }

    /// Wait until no update handler is in flight.  Pair with a draining
    /// flag so parked long-polls return instead of blocking this forever.
    pub async fn await_handlers_drained(&self) {
        self.inner.registry.wait_drained().await;
    }

    // ── Children & coroutines ────────────────────────────────────────────────

    /// Start a child workflow and return its client handle.
    pub async fn start_child(
        &self,
        workflow_type: &str,
        workflow_id: &str,
        input: Value,
    ) -> Result<WorkflowHandle, ClientError> {
        self.record(EventRecord::ChildWorkflowStarted {
            workflow_id: workflow_id.to_string(),
            workflow_type: workflow_type.to_string(),
        });
        self.inner
            .worker
            .start(workflow_type, workflow_id, input)
            .await
    }

    /// Look up a workflow instance hosted by this worker (used to re-attach
    /// to children after continue-as-new).
    pub fn find_workflow(&self, workflow_id: &str) -> Option<WorkflowHandle> {
        self.inner.worker.get_handle(workflow_id)
    }

    /// Launch a coroutine within this run's scheduling unit.  Aborted
    /// automatically when the run ends (completion or continue-as-new).
    pub fn spawn(&self, fut: impl Future<Output = ()> + 'static) {
        let handle = tokio::task::spawn_local(fut);
        self.inner.run_tasks.borrow_mut().push(handle);
    }

    pub(crate) fn abort_run_tasks(&self) {
        for task in self.inner.run_tasks.borrow_mut().drain(..) {
            task.abort();
        }
    }
}

/// Kernel-side retry loop around activity attempts.
async fn run_attempts(
    worker: Arc<WorkerShared>,
    name: &str,
    input: Value,
    options: ActivityOptions,
) -> Result<Value, ActivityError> {
    let max_attempts = options.retry.max_attempts.max(1);
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match worker
            .dispatch_activity(
                options.task_queue.as_deref(),
                name,
                input.clone(),
                options.start_to_close,
            )
            .await
        {
            Ok(value) => return Ok(value),
            Err(e) if e.retryable && attempt < max_attempts => {
                warn!(
                    activity = name,
                    attempt,
                    error = %e,
                    "activity attempt failed; retrying"
                );
                tokio::time::sleep(options.retry.delay_for(attempt)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// In-flight activity started with [`WfContext::start_activity`].
/// Dropping it aborts the underlying call.
pub struct ActivityHandle {
    task: Option<JoinHandle<Result<Value, ActivityError>>>,
}

impl ActivityHandle {
    pub async fn result(mut self) -> Result<Value, ActivityError> {
        match self.task.take() {
            Some(task) => match task.await {
                Ok(result) => result,
                Err(e) => Err(ActivityError::non_retryable(
                    crate::error_kinds::CANCELED,
                    format!("activity task ended early: {e}"),
                )),
            },
            None => Err(ActivityError::canceled()),
        }
    }

    pub fn abort(&self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

impl Drop for ActivityHandle {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

/// Receiving half of a named signal channel.
pub struct SignalReceiver {
    queue: Rc<SignalQueue>,
}

impl SignalReceiver {
    /// Wait for the next signal payload.
    pub async fn recv(&self) -> Value {
        self.queue.recv().await
    }

    /// Non-blocking pop.
    pub fn try_recv(&self) -> Option<Value> {
        self.queue.try_recv()
    }
}
