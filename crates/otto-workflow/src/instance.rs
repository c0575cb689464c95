// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::sync::Arc;

use futures::future::LocalBoxFuture;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tracing::{debug, warn};

use crate::context::{WfContext, WorkflowExit, WorkflowFn};
use crate::error::{ClientError, UpdateRejection};
use crate::event::{EventRecord, HistorySink};
use crate::worker::WorkerShared;

pub(crate) type Validator = Rc<dyn Fn(&Value) -> Result<(), UpdateRejection>>;
pub(crate) type UpdateHandler =
    Rc<dyn Fn(Value) -> LocalBoxFuture<'static, Result<Value, UpdateRejection>>>;
pub(crate) type QueryHandler = Rc<dyn Fn() -> Value>;

/// Commands a client handle sends into the instance.
pub(crate) enum ClientCommand {
    Update {
        name: String,
        input: Value,
        reply: oneshot::Sender<Result<Value, ClientError>>,
    },
    Query {
        name: String,
        reply: oneshot::Sender<Result<Value, ClientError>>,
    },
    Signal {
        name: String,
        input: Value,
    },
}

/// Terminal/nonterminal state of a workflow instance.
#[derive(Debug, Clone)]
pub enum RunStatus {
    Running,
    Completed(Value),
    Failed(String),
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    pub fn label(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed(_) => "completed",
            RunStatus::Failed(_) => "errored",
        }
    }
}

/// Client-side handle to a workflow instance.  Clonable, `Send`, and valid
/// across the instance's continue-as-new restarts.
#[derive(Clone, Debug)]
pub struct WorkflowHandle {
    workflow_id: String,
    tx: mpsc::UnboundedSender<ClientCommand>,
    status_rx: watch::Receiver<RunStatus>,
}

impl WorkflowHandle {
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Send an update and wait for the validator + handler result.
    pub async fn update(&self, name: &str, input: Value) -> Result<Value, ClientError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ClientCommand::Update {
                name: name.to_string(),
                input,
                reply: reply_tx,
            })
            .map_err(|_| ClientError::Closed)?;
        reply_rx.await.map_err(|_| ClientError::Closed)?
    }

    /// Run a read-only query against current in-memory state.
    pub async fn query(&self, name: &str) -> Result<Value, ClientError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ClientCommand::Query {
                name: name.to_string(),
                reply: reply_tx,
            })
            .map_err(|_| ClientError::Closed)?;
        reply_rx.await.map_err(|_| ClientError::Closed)?
    }

    /// Fire-and-forget signal onto a named channel.
    pub fn signal(&self, name: &str, input: Value) -> Result<(), ClientError> {
        self.tx
            .send(ClientCommand::Signal {
                name: name.to_string(),
                input,
            })
            .map_err(|_| ClientError::Closed)
    }

    pub fn status(&self) -> RunStatus {
        self.status_rx.borrow().clone()
    }

    /// Wait for the instance to reach a terminal state.
    pub async fn join(&self) -> RunStatus {
        let mut rx = self.status_rx.clone();
        loop {
            let current = rx.borrow_and_update().clone();
            if current.is_terminal() {
                return current;
            }
            if rx.changed().await.is_err() {
                let last = rx.borrow().clone();
                return if last.is_terminal() {
                    last
                } else {
                    RunStatus::Failed("worker stopped".into())
                };
            }
        }
    }
}

/// FIFO queue behind one named signal channel.  Survives continue-as-new.
pub(crate) struct SignalQueue {
    items: RefCell<VecDeque<Value>>,
    notify: Notify,
}

impl SignalQueue {
    fn new() -> Self {
        Self {
            items: RefCell::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    fn push(&self, value: Value) {
        self.items.borrow_mut().push_back(value);
        self.notify.notify_waiters();
    }

    pub(crate) fn try_recv(&self) -> Option<Value> {
        self.items.borrow_mut().pop_front()
    }

    pub(crate) async fn recv(&self) -> Value {
        loop {
            let notified = self.notify.notified();
            if let Some(value) = self.try_recv() {
                return value;
            }
            notified.await;
        }
    }
}

/// Per-instance registries shared by the command pump and the context.
/// Update/query registrations are run-scoped (cleared on continue-as-new);
/// signal queues persist for the instance lifetime.
pub(crate) struct HandlerRegistry {
    updates: RefCell<HashMap<String, (Validator, UpdateHandler)>>,
    queries: RefCell<HashMap<String, QueryHandler>>,
    signals: RefCell<HashMap<String, Rc<SignalQueue>>>,
    inflight: Cell<usize>,
    drained: Notify,
}

impl HandlerRegistry {
    pub(crate) fn new() -> Self {
        Self {
            updates: RefCell::new(HashMap::new()),
            queries: RefCell::new(HashMap::new()),
            signals: RefCell::new(HashMap::new()),
            inflight: Cell::new(0),
            drained: Notify::new(),
        }
    }

    pub(crate) fn register_update(
        &self,
        name: &str,
        validator: Validator,
        handler: UpdateHandler,
    ) {
        self.updates
            .borrow_mut()
            .insert(name.to_string(), (validator, handler));
    }

    pub(crate) fn register_query(&self, name: &str, handler: QueryHandler) {
        self.queries.borrow_mut().insert(name.to_string(), handler);
    }

    pub(crate) fn signal_queue(&self, name: &str) -> Rc<SignalQueue> {
        self.signals
            .borrow_mut()
            .entry(name.to_string())
            .or_insert_with(|| Rc::new(SignalQueue::new()))
            .clone()
    }

    fn update_entry(&self, name: &str) -> Option<(Validator, UpdateHandler)> {
        self.updates.borrow().get(name).cloned()
    }

    fn query_entry(&self, name: &str) -> Option<QueryHandler> {
        self.queries.borrow().get(name).cloned()
    }

    pub(crate) fn clear_run_scoped(&self) {
        self.updates.borrow_mut().clear();
        self.queries.borrow_mut().clear();
    }

    fn handler_started(&self) {
        self.inflight.set(self.inflight.get() + 1);
    }

    fn handler_finished(&self) {
        let n = self.inflight.get().saturating_sub(1);
        self.inflight.set(n);
        if n == 0 {
            self.drained.notify_waiters();
        }
    }

    pub(crate) async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            if self.inflight.get() == 0 {
                return;
            }
            notified.await;
        }
    }
}

struct Recorder {
    sink: Arc<dyn HistorySink>,
    workflow_id: String,
    run_id: Rc<RefCell<String>>,
}

impl Recorder {
    fn record(&self, event: EventRecord) {
        self.sink
            .append(&self.workflow_id, &self.run_id.borrow(), &event);
    }
}

/// Drains client commands for one instance: validates + launches update
/// handlers, runs queries inline, buffers signals.
async fn command_pump(
    mut rx: mpsc::UnboundedReceiver<ClientCommand>,
    registry: Rc<HandlerRegistry>,
    recorder: Recorder,
) {
    while let Some(command) = rx.recv().await {
        match command {
            ClientCommand::Update { name, input, reply } => {
                let entry = registry.update_entry(&name);
                match entry {
                    None => {
                        let _ = reply.send(Err(ClientError::HandlerMissing(name)));
                    }
                    Some((validator, handler)) => match validator(&input) {
                        Err(rejection) => {
                            debug!(update = %name, reason = %rejection, "update rejected");
                            let _ = reply.send(Err(ClientError::Rejected(rejection)));
                        }
                        Ok(()) => {
                            recorder.record(EventRecord::UpdateAccepted {
                                name: name.clone(),
                                input: input.clone(),
                            });
                            registry.handler_started();
                            let fut = handler(input);
                            let registry = registry.clone();
                            tokio::task::spawn_local(async move {
                                let outcome = fut.await;
                                registry.handler_finished();
                                let _ = reply.send(outcome.map_err(ClientError::Rejected));
                            });
                        }
                    },
                }
            }
            ClientCommand::Query { name, reply } => {
                let result = match registry.query_entry(&name) {
                    None => Err(ClientError::HandlerMissing(name)),
                    Some(handler) => Ok(handler()),
                };
                let _ = reply.send(result);
            }
            ClientCommand::Signal { name, input } => {
                recorder.record(EventRecord::SignalReceived {
                    name: name.clone(),
                    input: input.clone(),
                });
                registry.signal_queue(&name).push(input);
            }
        }
    }
}

/// Drives one workflow instance through its continue-as-new lifecycle.
pub(crate) async fn run_instance(
    worker: Arc<WorkerShared>,
    workflow_type: String,
    workflow_id: String,
    wf_fn: WorkflowFn,
    mut input: Value,
    cmd_rx: mpsc::UnboundedReceiver<ClientCommand>,
    status_tx: watch::Sender<RunStatus>,
) {
    let registry = Rc::new(HandlerRegistry::new());
    let notify = Rc::new(Notify::new());
    let run_id_cell = Rc::new(RefCell::new(String::new()));
    let pump = tokio::task::spawn_local(command_pump(
        cmd_rx,
        registry.clone(),
        Recorder {
            sink: worker.sink.clone(),
            workflow_id: workflow_id.clone(),
            run_id: run_id_cell.clone(),
        },
    ));

    let mut run_seq: u64 = 0;
    loop {
        run_seq += 1;
        let run_id = format!("{workflow_id}#{run_seq}");
        *run_id_cell.borrow_mut() = run_id.clone();
        let ctx = WfContext::new(
            worker.clone(),
            registry.clone(),
            notify.clone(),
            workflow_id.clone(),
            run_id,
        );
        ctx.record(EventRecord::WorkflowStarted {
            workflow_type: workflow_type.clone(),
            input: input.clone(),
        });
        debug!(workflow_id = %workflow_id, run = run_seq, "workflow run starting");
        let result = (wf_fn)(ctx.clone(), input.clone()).await;
        ctx.abort_run_tasks();
        registry.clear_run_scoped();
        match result {
            Ok(WorkflowExit::Completed(value)) => {
                ctx.record(EventRecord::WorkflowCompleted {
                    result: value.clone(),
                });
                let _ = status_tx.send(RunStatus::Completed(value));
                break;
            }
            Ok(WorkflowExit::ContinueAsNew(snapshot)) => {
                ctx.record(EventRecord::ContinuedAsNew {
                    snapshot: snapshot.clone(),
                });
                debug!(workflow_id = %workflow_id, run = run_seq, "continuing as new");
                input = snapshot;
            }
            Err(e) => {
                warn!(workflow_id = %workflow_id, error = %e, "workflow failed");
                ctx.record(EventRecord::WorkflowFailed {
                    message: e.to_string(),
                });
                let _ = status_tx.send(RunStatus::Failed(e.to_string()));
                break;
            }
        }
    }
    pump.abort();
}

pub(crate) fn new_handle(
    workflow_id: String,
) -> (
    WorkflowHandle,
    mpsc::UnboundedReceiver<ClientCommand>,
    watch::Sender<RunStatus>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(RunStatus::Running);
    (
        WorkflowHandle {
            workflow_id,
            tx,
            status_rx,
        },
        rx,
        status_tx,
    )
}
