// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::activity::Activity;
use crate::context::WorkflowFn;
use crate::error::{ActivityError, ClientError};
use crate::event::{HistorySink, InMemoryHistory};
use crate::instance::{new_handle, run_instance, RunStatus, WorkflowHandle};

/// Activities registered without an explicit queue land here; queue-routed
/// dispatch falls back to this queue when the pool lacks the activity.
const DEFAULT_QUEUE: &str = "default";

struct StartRequest {
    workflow_type: String,
    workflow_id: String,
    input: Value,
    reply: oneshot::Sender<Result<WorkflowHandle, ClientError>>,
}

pub(crate) struct WorkerShared {
    workflows: HashMap<String, WorkflowFn>,
    activities: HashMap<String, HashMap<String, Arc<dyn Activity>>>,
    activity_handle: tokio::runtime::Handle,
    pub(crate) sink: Arc<dyn HistorySink>,
    instances: Mutex<HashMap<String, WorkflowHandle>>,
    start_tx: mpsc::UnboundedSender<StartRequest>,
    pub(crate) version: String,
}

impl WorkerShared {
    pub(crate) async fn start(
        &self,
        workflow_type: &str,
        workflow_id: &str,
        input: Value,
    ) -> Result<WorkflowHandle, ClientError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.start_tx
            .send(StartRequest {
                workflow_type: workflow_type.to_string(),
                workflow_id: workflow_id.to_string(),
                input,
                reply: reply_tx,
            })
            .map_err(|_| ClientError::Closed)?;
        reply_rx.await.map_err(|_| ClientError::Closed)?
    }

    pub(crate) fn get_handle(&self, workflow_id: &str) -> Option<WorkflowHandle> {
        self.instances
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(workflow_id)
            .cloned()
    }

    fn lookup_activity(&self, queue: Option<&str>, name: &str) -> Option<Arc<dyn Activity>> {
        if let Some(queue) = queue {
            if let Some(found) = self.activities.get(queue).and_then(|m| m.get(name)) {
                return Some(found.clone());
            }
        }
        self.activities
            .get(DEFAULT_QUEUE)
            .and_then(|m| m.get(name))
            .cloned()
    }

    /// One activity attempt with a start-to-close timeout, on the activity
    /// runtime.  The spawned task is aborted if the attempt times out or
    /// the awaiting workflow is dropped.
    pub(crate) async fn dispatch_activity(
        &self,
        queue: Option<&str>,
        name: &str,
        input: Value,
        start_to_close: Duration,
    ) -> Result<Value, ActivityError> {
        let activity = self.lookup_activity(queue, name).ok_or_else(|| {
            ActivityError::non_retryable(
                crate::error_kinds::UNKNOWN,
                format!("activity not registered: {name}"),
            )
        })?;
        let mut guard = AbortOnDrop(
            self.activity_handle
                .spawn(async move { activity.execute(input).await }),
        );
        match tokio::time::timeout(start_to_close, &mut guard.0).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(ActivityError::non_retryable(
                crate::error_kinds::UNKNOWN,
                format!("activity panicked: {join_error}"),
            )),
            Err(_) => Err(ActivityError::timeout()),
        }
    }
}

struct AbortOnDrop(tokio::task::JoinHandle<Result<Value, ActivityError>>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn host_loop(
    shared: Arc<WorkerShared>,
    mut start_rx: mpsc::UnboundedReceiver<StartRequest>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            request = start_rx.recv() => match request {
                None => break,
                Some(request) => {
                    let reply = request.reply;
                    let result = launch_instance(
                        &shared,
                        request.workflow_type,
                        request.workflow_id,
                        request.input,
                    );
                    let _ = reply.send(result);
                }
            }
        }
    }
    debug!("workflow host loop stopped");
}

fn launch_instance(
    shared: &Arc<WorkerShared>,
    workflow_type: String,
    workflow_id: String,
    input: Value,
) -> Result<WorkflowHandle, ClientError> {
    let wf_fn = shared
        .workflows
        .get(&workflow_type)
        .cloned()
        .ok_or_else(|| ClientError::UnknownWorkflowType(workflow_type.clone()))?;
    {
        let instances = shared
            .instances
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(existing) = instances.get(&workflow_id) {
            if !existing.status().is_terminal() {
                return Err(ClientError::AlreadyRunning(workflow_id));
            }
        }
    }
    let (handle, cmd_rx, status_tx) = new_handle(workflow_id.clone());
    shared
        .instances
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .insert(workflow_id.clone(), handle.clone());
    info!(workflow_id = %workflow_id, workflow_type = %workflow_type, "workflow started");
    tokio::task::spawn_local(run_instance(
        shared.clone(),
        workflow_type,
        workflow_id,
        wf_fn,
        input,
        cmd_rx,
        status_tx,
    ));
    Ok(handle)
}

/// Builder for a [`Worker`]: register workflow types and activities, then
/// start the hosting thread.
pub struct WorkerBuilder {
    workflows: HashMap<String, WorkflowFn>,
    activities: HashMap<String, HashMap<String, Arc<dyn Activity>>>,
    sink: Arc<dyn HistorySink>,
    version: String,
}

impl Default for WorkerBuilder {
    fn default() -> Self {
        Self {
            workflows: HashMap::new(),
            activities: HashMap::new(),
            sink: Arc::new(InMemoryHistory::new()),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl WorkerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_workflow(
        mut self,
        workflow_type: &str,
        f: impl Fn(crate::WfContext, Value) -> crate::WorkflowFuture + Send + Sync + 'static,
    ) -> Self {
        self.workflows.insert(workflow_type.to_string(), Arc::new(f));
        self
    }

    pub fn register_activity(self, activity: Arc<dyn Activity>) -> Self {
        self.register_activity_on_queue(DEFAULT_QUEUE, activity)
    }

    pub fn register_activity_on_queue(
        mut self,
        queue: &str,
        activity: Arc<dyn Activity>,
    ) -> Self {
        self.activities
            .entry(queue.to_string())
            .or_default()
            .insert(activity.name().to_string(), activity);
        self
    }

    pub fn history_sink(mut self, sink: Arc<dyn HistorySink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Spin up the activity runtime and the workflow thread.
    pub fn start(self) -> anyhow::Result<Worker> {
        let activity_rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("otto-activity")
            .build()
            .context("failed to build activity runtime")?;
        let (start_tx, start_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let shared = Arc::new(WorkerShared {
            workflows: self.workflows,
            activities: self.activities,
            activity_handle: activity_rt.handle().clone(),
            sink: self.sink,
            instances: Mutex::new(HashMap::new()),
            start_tx,
            version: self.version,
        });
        let thread_shared = shared.clone();
        let thread = std::thread::Builder::new()
            .name("otto-workflow".to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        warn!(error = %e, "failed to build workflow runtime");
                        return;
                    }
                };
                let local = tokio::task::LocalSet::new();
                rt.block_on(local.run_until(host_loop(thread_shared, start_rx, shutdown_rx)));
            })
            .context("failed to spawn workflow thread")?;
        Ok(Worker {
            shared,
            shutdown_tx: Some(shutdown_tx),
            activity_rt: Some(activity_rt),
            _thread: thread,
        })
    }
}

/// A running worker: hosts workflow instances and executes activities.
pub struct Worker {
    shared: Arc<WorkerShared>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    activity_rt: Option<tokio::runtime::Runtime>,
    _thread: std::thread::JoinHandle<()>,
}

impl Worker {
    pub fn builder() -> WorkerBuilder {
        WorkerBuilder::new()
    }

    pub async fn start_workflow(
        &self,
        workflow_type: &str,
        workflow_id: &str,
        input: Value,
    ) -> Result<WorkflowHandle, ClientError> {
        self.shared.start(workflow_type, workflow_id, input).await
    }

    pub fn get_handle(&self, workflow_id: &str) -> Option<WorkflowHandle> {
        self.shared.get_handle(workflow_id)
    }

    pub fn version(&self) -> &str {
        &self.shared.version
    }

    /// Status of a hosted instance, when it exists.
    pub fn workflow_status(&self, workflow_id: &str) -> Option<RunStatus> {
        self.get_handle(workflow_id).map(|h| h.status())
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(rt) = self.activity_rt.take() {
            // shutdown_background is safe inside an async context.
            rt.shutdown_background();
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityOptions;
    use crate::error::UpdateRejection;
    use crate::retry::RetryPolicy;
    use crate::{ActivityError, WorkflowExit};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct EchoActivity;

    #[async_trait]
    impl Activity for EchoActivity {
        fn name(&self) -> &str {
            "echo"
        }
        async fn execute(&self, input: Value) -> Result<Value, ActivityError> {
            Ok(json!({ "echo": input }))
        }
    }

    struct FlakyActivity {
        failures: AtomicU32,
    }

    #[async_trait]
    impl Activity for FlakyActivity {
        fn name(&self) -> &str {
            "flaky"
        }
        async fn execute(&self, _input: Value) -> Result<Value, ActivityError> {
            if self.failures.fetch_sub(1, Ordering::SeqCst) > 0 {
                Err(ActivityError::unknown("transient blip"))
            } else {
                Ok(json!("ok"))
            }
        }
    }

    fn echo_worker() -> Worker {
        Worker::builder()
            .register_workflow("echo_wf", |ctx, input| {
                Box::pin(async move {
                    let result = ctx
                        .execute_activity("echo", input, ActivityOptions::default())
                        .await
                        .map_err(|e| crate::WorkflowError::Internal(e.to_string()))?;
                    Ok(WorkflowExit::Completed(result))
                })
            })
            .register_activity(Arc::new(EchoActivity))
            .start()
            .expect("worker starts")
    }

    #[tokio::test]
    async fn workflow_completes_with_activity_result() {
        let worker = echo_worker();
        let handle = worker
            .start_workflow("echo_wf", "wf-echo", json!({"x": 1}))
            .await
            .unwrap();
        match handle.join().await {
            RunStatus::Completed(v) => assert_eq!(v["echo"]["x"], 1),
            other => panic!("unexpected status: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_workflow_type_is_rejected() {
        let worker = echo_worker();
        let err = worker
            .start_workflow("nope", "wf-1", json!(null))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::UnknownWorkflowType(_)));
    }

    #[tokio::test]
    async fn duplicate_running_workflow_is_rejected() {
        let worker = Worker::builder()
            .register_workflow("forever", |ctx, _input| {
                Box::pin(async move {
                    ctx.await_condition(|| false).await;
                    Ok(WorkflowExit::Completed(Value::Null))
                })
            })
            .start()
            .expect("worker starts");
        let _h = worker
            .start_workflow("forever", "wf-dup", json!(null))
            .await
            .unwrap();
        let err = worker
            .start_workflow("forever", "wf-dup", json!(null))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::AlreadyRunning(_)));
    }

    #[tokio::test]
    async fn activity_retries_until_success() {
        let worker = Worker::builder()
            .register_workflow("retry_wf", |ctx, _input| {
                Box::pin(async move {
                    let opts = ActivityOptions::default().with_retry(RetryPolicy::new(
                        std::time::Duration::from_millis(5),
                        2.0,
                        std::time::Duration::from_millis(20),
                        5,
                    ));
                    let result = ctx
                        .execute_activity("flaky", Value::Null, opts)
                        .await
                        .map_err(|e| crate::WorkflowError::Internal(e.to_string()))?;
                    Ok(WorkflowExit::Completed(result))
                })
            })
            .register_activity(Arc::new(FlakyActivity {
                failures: AtomicU32::new(2),
            }))
            .start()
            .expect("worker starts");
        let handle = worker
            .start_workflow("retry_wf", "wf-retry", json!(null))
            .await
            .unwrap();
        assert!(matches!(handle.join().await, RunStatus::Completed(_)));
    }

    #[tokio::test]
    async fn updates_run_validator_then_handler() {
        let worker = Worker::builder()
            .register_workflow("counting", |ctx, _input| {
                Box::pin(async move {
                    let count = std::rc::Rc::new(std::cell::Cell::new(0u32));
                    let done = std::rc::Rc::new(std::cell::Cell::new(false));
                    {
                        let count = count.clone();
                        let ctx2 = ctx.clone();
                        ctx.register_update(
                            "add",
                            |input: &Value| {
                                if input.get("n").and_then(Value::as_u64).is_some() {
                                    Ok(())
                                } else {
                                    Err(UpdateRejection::new("n required"))
                                }
                            },
                            move |input: Value| {
                                let count = count.clone();
                                let ctx = ctx2.clone();
                                Box::pin(async move {
                                    let n = input["n"].as_u64().unwrap_or(0) as u32;
                                    count.set(count.get() + n);
                                    ctx.state_changed();
                                    Ok(json!({ "total": count.get() }))
                                })
                            },
                        );
                    }
                    {
                        let done = done.clone();
                        let ctx2 = ctx.clone();
                        ctx.register_update(
                            "finish",
                            |_| Ok(()),
                            move |_input: Value| {
                                let done = done.clone();
                                let ctx = ctx2.clone();
                                Box::pin(async move {
                                    done.set(true);
                                    ctx.state_changed();
                                    Ok(Value::Null)
                                })
                            },
                        );
                    }
                    let done2 = done.clone();
                    ctx.await_condition(move || done2.get()).await;
                    Ok(WorkflowExit::Completed(json!(count.get())))
                })
            })
            .start()
            .expect("worker starts");
        let handle = worker
            .start_workflow("counting", "wf-count", json!(null))
            .await
            .unwrap();
        let first = handle.update("add", json!({"n": 2})).await.unwrap();
        assert_eq!(first["total"], 2);
        let rejected = handle.update("add", json!({})).await.unwrap_err();
        assert!(matches!(rejected, ClientError::Rejected(_)));
        let _ = handle.update("add", json!({"n": 3})).await.unwrap();
        let _ = handle.update("finish", json!(null)).await.unwrap();
        match handle.join().await {
            RunStatus::Completed(v) => assert_eq!(v, json!(5)),
            other => panic!("unexpected status: {other:?}"),
        }
    }

    #[tokio::test]
    async fn continue_as_new_carries_snapshot() {
        let worker = Worker::builder()
            .register_workflow("canew", |_ctx, input| {
                Box::pin(async move {
                    let generation = input.as_u64().unwrap_or(0);
                    if generation < 3 {
                        Ok(WorkflowExit::ContinueAsNew(json!(generation + 1)))
                    } else {
                        Ok(WorkflowExit::Completed(json!(generation)))
                    }
                })
            })
            .start()
            .expect("worker starts");
        let handle = worker
            .start_workflow("canew", "wf-canew", json!(0))
            .await
            .unwrap();
        match handle.join().await {
            RunStatus::Completed(v) => assert_eq!(v, json!(3)),
            other => panic!("unexpected status: {other:?}"),
        }
    }

    #[tokio::test]
    async fn signals_are_buffered_fifo() {
        let worker = Worker::builder()
            .register_workflow("sig", |ctx, _input| {
                Box::pin(async move {
                    let rx = ctx.signal_channel("numbers");
                    let a = rx.recv().await;
                    let b = rx.recv().await;
                    Ok(WorkflowExit::Completed(json!([a, b])))
                })
            })
            .start()
            .expect("worker starts");
        let handle = worker
            .start_workflow("sig", "wf-sig", json!(null))
            .await
            .unwrap();
        handle.signal("numbers", json!(1)).unwrap();
        handle.signal("numbers", json!(2)).unwrap();
        match handle.join().await {
            RunStatus::Completed(v) => assert_eq!(v, json!([1, 2])),
            other => panic!("unexpected status: {other:?}"),
        }
    }

    #[tokio::test]
    async fn child_workflow_result_is_visible_to_parent() {
        let worker = Worker::builder()
            .register_workflow("child", |_ctx, input| {
                Box::pin(async move { Ok(WorkflowExit::Completed(json!({"from_child": input}))) })
            })
            .register_workflow("parent", |ctx, _input| {
                Box::pin(async move {
                    let child = ctx
                        .start_child("child", "wf-parent/child-1", json!(7))
                        .await
                        .map_err(|e| crate::WorkflowError::Internal(e.to_string()))?;
                    match child.join().await {
                        RunStatus::Completed(v) => Ok(WorkflowExit::Completed(v)),
                        other => Err(crate::WorkflowError::Internal(format!(
                            "child did not complete: {other:?}"
                        ))),
                    }
                })
            })
            .start()
            .expect("worker starts");
        let handle = worker
            .start_workflow("parent", "wf-parent", json!(null))
            .await
            .unwrap();
        match handle.join().await {
            RunStatus::Completed(v) => assert_eq!(v["from_child"], 7),
            other => panic!("unexpected status: {other:?}"),
        }
    }
}
