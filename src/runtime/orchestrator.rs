/// Run/deploy/test-mode orchestration
///
/// Owns every piece of per-flow background work: continuous scan loops,
/// schedule-trigger cron jobs, and test-mode auto-exit timers. Each of those
/// is individually cancellable and torn down on any state transition that
/// invalidates it (redeploy, undeploy, flow removal, explicit stop), so no
/// background task outlives the state that spawned it.

use crate::error::EngineError;
use crate::flow::registry::{CompiledFlow, FlowRegistry};
use crate::flow::types::{ExecutionMode, ExecutionOrderEntry, RunResult};
use crate::flow::validation;
use crate::runtime::context::ExecutionContext;
use crate::runtime::engine::FlowEngine;
use crate::runtime::triggers::TriggerCoordinator;
use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

/// Options for entering test mode
#[derive(Debug, Clone, Copy)]
pub struct TestModeOptions {
    /// Drop tag writes at the host boundary while nodes still execute
    pub suppress_writes: bool,
    /// Arm the auto-exit countdown
    pub auto_exit: bool,
    /// Countdown length when `auto_exit` is set
    pub duration_seconds: u64,
}

/// Externally visible state of one flow instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FlowStatus {
    pub deployed: bool,
    pub test_mode: bool,
    pub suppress_writes: bool,
}

#[derive(Debug)]
struct TestState {
    suppress_writes: bool,
    auto_exit: Option<JoinHandle<()>>,
}

#[derive(Debug, Default)]
struct FlowRuntime {
    deployed: bool,
    test: Option<TestState>,
    scan_task: Option<JoinHandle<()>>,
}

type RuntimeMap = Arc<RwLock<HashMap<String, FlowRuntime>>>;

/// One mutex per flow serializing execution passes across every entry point
/// (manual run, trigger fire, scan tick, cron job).
type PassLocks = Arc<RwLock<HashMap<String, Arc<Mutex<()>>>>>;

/// Composes the engine, registry, and trigger coordinator into the
/// deploy/undeploy/test-mode state machine
pub struct Orchestrator {
    engine: Arc<FlowEngine>,
    registry: Arc<FlowRegistry>,
    triggers: Arc<TriggerCoordinator>,
    runtimes: RuntimeMap,
    passes: PassLocks,
    cron: RwLock<JobScheduler>,
    job_uuid_map: RwLock<HashMap<String, Uuid>>,
    min_scan_interval_ms: u64,
}

impl Orchestrator {
    pub async fn new(
        engine: Arc<FlowEngine>,
        registry: Arc<FlowRegistry>,
        triggers: Arc<TriggerCoordinator>,
        min_scan_interval_ms: u64,
    ) -> Result<Self> {
        let cron = JobScheduler::new().await?;
        Ok(Self {
            engine,
            registry,
            triggers,
            runtimes: Arc::new(RwLock::new(HashMap::new())),
            passes: Arc::new(RwLock::new(HashMap::new())),
            cron: RwLock::new(cron),
            job_uuid_map: RwLock::new(HashMap::new()),
            min_scan_interval_ms,
        })
    }

    /// Start the shared cron scheduler backing schedule-trigger nodes.
    pub async fn start(&self) -> Result<()> {
        tracing::info!("⏰ Starting schedule-trigger scheduler");
        self.cron.read().await.start().await?;
        Ok(())
    }

    /// Stop every background task and shut the cron scheduler down.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("⏹️ Shutting down orchestrator");
        {
            let mut runtimes = self.runtimes.write().await;
            for (_, runtime) in runtimes.drain() {
                if let Some(task) = runtime.scan_task {
                    task.abort();
                }
                if let Some(test) = runtime.test {
                    if let Some(timer) = test.auto_exit {
                        timer.abort();
                    }
                }
            }
        }
        self.job_uuid_map.write().await.clear();
        self.cron.write().await.shutdown().await?;
        Ok(())
    }

    pub fn engine(&self) -> &Arc<FlowEngine> {
        &self.engine
    }

    pub fn registry(&self) -> &Arc<FlowRegistry> {
        &self.registry
    }

    /// One manual/test pass over a registered flow.
    pub async fn run_once(
        &self,
        flow_id: &str,
        parameters: HashMap<String, Value>,
    ) -> Result<RunResult, EngineError> {
        let compiled = self
            .registry
            .get(flow_id)
            .ok_or_else(|| EngineError::FlowNotFound(flow_id.to_string()))?;

        let pass = pass_lock_in(&self.passes, flow_id).await;
        let _running = pass.lock().await;

        let ctx = ExecutionContext::new(flow_id)
            .with_parameters(parameters)
            .with_suppressed_writes(self.suppressing(flow_id).await);
        Ok(self.engine.execute_compiled(&compiled, ctx).await)
    }

    /// "Show execution order" diagnostic for a registered flow.
    pub fn calculate_execution_order(
        &self,
        flow_id: &str,
    ) -> Result<Vec<ExecutionOrderEntry>, EngineError> {
        let compiled = self
            .registry
            .get(flow_id)
            .ok_or_else(|| EngineError::FlowNotFound(flow_id.to_string()))?;
        self.engine.calculate_execution_order(&compiled.flow)
    }

    /// Register a pending manual-trigger intent.
    ///
    /// Continuous mode: the intent waits for the next scan tick. Manual mode:
    /// the fire that creates the intent claims it and runs an immediate
    /// single pass; fires that coalesce into a pending or claimed intent
    /// return None, so a burst of concurrent fires yields exactly one
    /// execution per trigger.
    pub async fn fire_trigger(
        &self,
        flow_id: &str,
        node_id: &str,
    ) -> Result<Option<RunResult>, EngineError> {
        let compiled = self
            .registry
            .get(flow_id)
            .ok_or_else(|| EngineError::FlowNotFound(flow_id.to_string()))?;
        if !compiled.manual_trigger_ids.iter().any(|id| id == node_id) {
            return Err(EngineError::NotATrigger {
                flow_id: flow_id.to_string(),
                node_id: node_id.to_string(),
            });
        }

        let newly_pending = self.triggers.fire(flow_id, node_id);

        if compiled.flow.mode == ExecutionMode::Continuous {
            return Ok(None);
        }

        if !newly_pending {
            return Ok(None);
        }

        // Claim this firing for the whole pass: concurrent fires for the same
        // trigger coalesce into it, while fires for other triggers stay
        // pending for their own pass instead of being consumed twice.
        self.triggers.claim(flow_id, node_id);

        let pass = pass_lock_in(&self.passes, flow_id).await;
        let _running = pass.lock().await;

        let ctx = ExecutionContext::new(flow_id)
            .with_trigger("manual", vec![node_id.to_string()])
            .with_suppressed_writes(self.suppressing(flow_id).await);
        let result = self.engine.execute_compiled(&compiled, ctx).await;
        self.triggers.release(flow_id, node_id);
        Ok(Some(result))
    }

    /// Deploy a registered flow: validate, then start its background work.
    ///
    /// Rejected outright on validation failure; redeploying tears down the
    /// previous deployment's tasks first.
    pub async fn deploy(&self, flow_id: &str) -> Result<(), EngineError> {
        let compiled = self
            .registry
            .get(flow_id)
            .ok_or_else(|| EngineError::FlowNotFound(flow_id.to_string()))?;
        validation::validate(&compiled.flow, self.engine.executors())?;

        self.remove_cron_jobs(flow_id).await;

        {
            let mut runtimes = self.runtimes.write().await;
            let runtime = runtimes.entry(flow_id.to_string()).or_default();
            if let Some(task) = runtime.scan_task.take() {
                task.abort();
            }
            runtime.deployed = true;
            if compiled.flow.mode == ExecutionMode::Continuous {
                runtime.scan_task = Some(self.spawn_scan_loop(compiled.clone()));
            }
        }

        for (node_id, expression) in &compiled.schedule_triggers {
            self.add_cron_job(flow_id, node_id, expression).await?;
        }

        tracing::info!("🚢 Deployed flow: {}", flow_id);
        Ok(())
    }

    /// Undeploy a flow, stopping its scan loop and cron jobs.
    pub async fn undeploy(&self, flow_id: &str) -> Result<(), EngineError> {
        {
            let mut runtimes = self.runtimes.write().await;
            let runtime = runtimes
                .get_mut(flow_id)
                .filter(|r| r.deployed)
                .ok_or_else(|| EngineError::NotDeployed(flow_id.to_string()))?;
            runtime.deployed = false;
            // The scan loop survives only while test mode still needs it.
            if runtime.test.is_none() {
                if let Some(task) = runtime.scan_task.take() {
                    task.abort();
                }
            }
        }

        self.remove_cron_jobs(flow_id).await;
        self.triggers.clear_flow(flow_id);
        tracing::info!("⚓ Undeployed flow: {}", flow_id);
        Ok(())
    }

    /// Enter test mode for a flow, without requiring deployment.
    ///
    /// Restarting test mode replaces any previous countdown; the old timer is
    /// cancelled before the new one is armed.
    pub async fn start_test_mode(
        &self,
        flow_id: &str,
        options: TestModeOptions,
    ) -> Result<(), EngineError> {
        let compiled = self
            .registry
            .get(flow_id)
            .ok_or_else(|| EngineError::FlowNotFound(flow_id.to_string()))?;
        validation::validate(&compiled.flow, self.engine.executors())?;

        let auto_exit = if options.auto_exit {
            Some(self.spawn_auto_exit(flow_id, Duration::from_secs(options.duration_seconds)))
        } else {
            None
        };

        let mut runtimes = self.runtimes.write().await;
        let runtime = runtimes.entry(flow_id.to_string()).or_default();

        if let Some(previous) = runtime.test.take() {
            if let Some(timer) = previous.auto_exit {
                timer.abort();
            }
        }
        runtime.test = Some(TestState {
            suppress_writes: options.suppress_writes,
            auto_exit,
        });

        if compiled.flow.mode == ExecutionMode::Continuous && runtime.scan_task.is_none() {
            runtime.scan_task = Some(self.spawn_scan_loop(compiled.clone()));
        }

        tracing::info!(
            "🧪 Test mode on for flow {} (suppress_writes: {})",
            flow_id,
            options.suppress_writes
        );
        Ok(())
    }

    /// Leave test mode, cancelling its auto-exit countdown.
    pub async fn stop_test_mode(&self, flow_id: &str) -> Result<(), EngineError> {
        let mut runtimes = self.runtimes.write().await;
        let runtime = runtimes
            .get_mut(flow_id)
            .filter(|r| r.test.is_some())
            .ok_or_else(|| EngineError::TestModeNotActive(flow_id.to_string()))?;

        if let Some(test) = runtime.test.take() {
            if let Some(timer) = test.auto_exit {
                timer.abort();
            }
        }
        if !runtime.deployed {
            if let Some(task) = runtime.scan_task.take() {
                task.abort();
            }
        }
        tracing::info!("🧪 Test mode off for flow {}", flow_id);
        Ok(())
    }

    /// Current deployment/test status of a flow.
    pub async fn status(&self, flow_id: &str) -> FlowStatus {
        let runtimes = self.runtimes.read().await;
        match runtimes.get(flow_id) {
            Some(runtime) => FlowStatus {
                deployed: runtime.deployed,
                test_mode: runtime.test.is_some(),
                suppress_writes: runtime
                    .test
                    .as_ref()
                    .map(|t| t.suppress_writes)
                    .unwrap_or(false),
            },
            None => FlowStatus {
                deployed: false,
                test_mode: false,
                suppress_writes: false,
            },
        }
    }

    /// Tear down everything belonging to a flow that is being removed.
    pub async fn remove_flow(&self, flow_id: &str) {
        {
            let mut runtimes = self.runtimes.write().await;
            if let Some(runtime) = runtimes.remove(flow_id) {
                if let Some(task) = runtime.scan_task {
                    task.abort();
                }
                if let Some(test) = runtime.test {
                    if let Some(timer) = test.auto_exit {
                        timer.abort();
                    }
                }
            }
        }
        self.remove_cron_jobs(flow_id).await;
        self.triggers.clear_flow(flow_id);
        self.passes.write().await.remove(flow_id);
    }

    async fn suppressing(&self, flow_id: &str) -> bool {
        suppressing_in(&self.runtimes, flow_id).await
    }

    /// Continuous scan loop: one full topological pass per tick. Missed ticks
    /// are skipped, never stacked; an overrun is logged. A tick that lands
    /// while another pass for the flow holds the pass lock (a manual run or a
    /// cron job) is skipped rather than queued behind it.
    fn spawn_scan_loop(&self, compiled: CompiledFlow) -> JoinHandle<()> {
        let engine = Arc::clone(&self.engine);
        let triggers = Arc::clone(&self.triggers);
        let runtimes = Arc::clone(&self.runtimes);
        let passes = Arc::clone(&self.passes);
        let period =
            Duration::from_millis(compiled.flow.scan_interval_ms.max(self.min_scan_interval_ms));

        tokio::spawn(async move {
            let flow_id = compiled.flow.id.clone();
            tracing::info!("🔄 Scan loop started for flow {} ({:?})", flow_id, period);
            let pass = pass_lock_in(&passes, &flow_id).await;
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let tick_start = Instant::now();

                let Ok(_running) = pass.try_lock() else {
                    tracing::warn!(
                        "⏭️ Scan tick skipped for flow {}: another pass is running",
                        flow_id
                    );
                    continue;
                };

                let fired = triggers.take_pending(&flow_id);
                let mut ctx = ExecutionContext::new(&flow_id)
                    .with_suppressed_writes(suppressing_in(&runtimes, &flow_id).await);
                if !fired.is_empty() {
                    ctx = ctx.with_trigger("manual", fired);
                }

                let result = engine.execute_compiled(&compiled, ctx).await;
                if !result.success {
                    tracing::debug!(
                        "⚠️ Scan tick for flow {} completed with failures",
                        flow_id
                    );
                }

                let elapsed = tick_start.elapsed();
                if elapsed > period {
                    tracing::warn!(
                        "⏱️ Scan tick overran for flow {}: {:?} > {:?}",
                        flow_id,
                        elapsed,
                        period
                    );
                }
            }
        })
    }

    /// Auto-exit countdown: disables test mode when it expires, unless an
    /// explicit stop aborted it first.
    fn spawn_auto_exit(&self, flow_id: &str, duration: Duration) -> JoinHandle<()> {
        let runtimes = Arc::clone(&self.runtimes);
        let flow_id = flow_id.to_string();

        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            tracing::info!("⏲️ Test mode auto-exit expired for flow {}", flow_id);

            let mut map = runtimes.write().await;
            if let Some(runtime) = map.get_mut(&flow_id) {
                // Drop the test state; this handle is the timer itself, so
                // there is nothing left to abort.
                runtime.test = None;
                if !runtime.deployed {
                    if let Some(task) = runtime.scan_task.take() {
                        task.abort();
                    }
                }
            }
        })
    }

    async fn add_cron_job(
        &self,
        flow_id: &str,
        node_id: &str,
        expression: &str,
    ) -> Result<(), EngineError> {
        let job_key = format!("{}:{}", flow_id, node_id);

        let registry = Arc::clone(&self.registry);
        let engine = Arc::clone(&self.engine);
        let runtimes = Arc::clone(&self.runtimes);
        let passes = Arc::clone(&self.passes);
        let owned_flow_id = flow_id.to_string();
        let owned_node_id = node_id.to_string();

        let job = Job::new_async(expression, move |_uuid, _lock| {
            let flow_id = owned_flow_id.clone();
            let node_id = owned_node_id.clone();
            let registry = Arc::clone(&registry);
            let engine = Arc::clone(&engine);
            let runtimes = Arc::clone(&runtimes);
            let passes = Arc::clone(&passes);

            Box::pin(async move {
                tracing::debug!("🔔 Schedule trigger fired: {}/{}", flow_id, node_id);
                // The flow may have been removed since the job was armed.
                let Some(compiled) = registry.get(&flow_id) else {
                    tracing::debug!("⏭️ Skipping schedule trigger for removed flow {}", flow_id);
                    return;
                };
                let pass = pass_lock_in(&passes, &flow_id).await;
                let Ok(_running) = pass.try_lock() else {
                    tracing::warn!(
                        "⏭️ Schedule trigger skipped for flow {}: another pass is running",
                        flow_id
                    );
                    return;
                };
                let ctx = ExecutionContext::new(&flow_id)
                    .with_trigger("schedule", vec![node_id])
                    .with_suppressed_writes(suppressing_in(&runtimes, &flow_id).await);
                let result = engine.execute_compiled(&compiled, ctx).await;
                tracing::info!(
                    "✅ Schedule-triggered pass finished for flow {} (success: {})",
                    flow_id,
                    result.success
                );
            })
        })
        .map_err(|e| EngineError::InvalidSchedule {
            node_id: node_id.to_string(),
            expression: expression.to_string(),
            reason: e.to_string(),
        })?;

        let job_uuid = {
            let cron = self.cron.write().await;
            cron.add(job)
                .await
                .map_err(|e| EngineError::Scheduler(e.to_string()))?
        };
        self.job_uuid_map.write().await.insert(job_key, job_uuid);
        Ok(())
    }

    async fn remove_cron_jobs(&self, flow_id: &str) {
        let prefix = format!("{}:", flow_id);
        let mut job_uuid_map = self.job_uuid_map.write().await;
        let stale: Vec<String> = job_uuid_map
            .keys()
            .filter(|key| key.starts_with(&prefix))
            .cloned()
            .collect();

        for key in stale {
            if let Some(job_uuid) = job_uuid_map.remove(&key) {
                let cron = self.cron.read().await;
                if let Err(e) = cron.remove(&job_uuid).await {
                    tracing::warn!("⚠️ Failed to remove cron job {}: {}", key, e);
                }
            }
        }
    }
}

/// Fetch (or create) the pass lock for one flow.
///
/// Callers hold the returned mutex for the duration of an execution pass;
/// background tasks use `try_lock` and skip when it is already held.
async fn pass_lock_in(locks: &PassLocks, flow_id: &str) -> Arc<Mutex<()>> {
    if let Some(lock) = locks.read().await.get(flow_id) {
        return Arc::clone(lock);
    }
    let mut map = locks.write().await;
    Arc::clone(map.entry(flow_id.to_string()).or_default())
}

async fn suppressing_in(runtimes: &RuntimeMap, flow_id: &str) -> bool {
    runtimes
        .read()
        .await
        .get(flow_id)
        .and_then(|r| r.test.as_ref())
        .map(|t| t.suppress_writes)
        .unwrap_or(false)
}
