//! 恢复编排器：主控状态机
//!
//! 每次 execute_step：取得 task id 独占锁 → 打检查点 → 调用 Actor → Critic 评估 →
//! （Diagnoser → Healer | Replanner）→ 终态。每个外部调用都带超时并可被取消；
//! 每次阶段转移输出一条结构化审计日志（JSON）。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::core::{
    FaultKind, Phase, RecoveryError, TaskGuard, TaskScheduler, TaskState, TaskStore,
    TaskSupervisor, TraceEntry, TraceLog, Variables,
};
use crate::recovery::{
    Critic, Diagnoser, HealOutcome, Healer, LearningRecord, LearningSink, RecoveryOutcome,
    RecoveryPath, Replanner, Route,
};
use crate::services::{Actor, ActorContext};

/// 入站请求：在某个任务上执行一步
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepRequest {
    pub task_id: String,
    /// Actor 类型（不区分大小写）
    pub agent_type: String,
    pub prompt: String,
    /// 首次引用该任务时作为 variables
    #[serde(default)]
    pub context: Variables,
    /// 首次引用该任务时作为 plan
    #[serde(default)]
    pub steps: Vec<String>,
}

/// 调用方可见的步骤状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Success,
    Recovered,
    Failed,
}

/// 步骤结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub task_id: String,
    pub status: StepStatus,
    pub output: String,
    pub actor_name: String,
    /// 诊断叙述；FAILED（已回滚）时供人工处理
    pub diagnosis_report: Option<String>,
    /// 本次尝试依次观察到的故障类别
    pub faults: Vec<FaultKind>,
    pub rolled_back: bool,
    pub cancelled: bool,
    /// 步骤结束时的任务状态（未取得任务锁时为 None）
    pub final_state: Option<TaskState>,
}

impl StepResult {
    fn new(task_id: &str, status: StepStatus, output: String, actor_name: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            status,
            output,
            actor_name: actor_name.to_string(),
            diagnosis_report: None,
            faults: Vec::new(),
            rolled_back: false,
            cancelled: false,
            final_state: None,
        }
    }

    fn cancelled(task_id: &str, actor_name: &str, final_state: Option<TaskState>) -> Self {
        Self {
            cancelled: true,
            final_state,
            ..Self::new(
                task_id,
                StepStatus::Failed,
                RecoveryError::Cancelled.to_string(),
                actor_name,
            )
        }
    }
}

/// Actor 注册表：按类型名（小写）查找
#[derive(Default)]
pub struct ActorRegistry {
    actors: HashMap<String, Arc<dyn Actor>>,
}

impl ActorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, agent_type: &str, actor: Arc<dyn Actor>) {
        self.actors.insert(agent_type.to_lowercase(), actor);
    }

    pub fn get(&self, agent_type: &str) -> Option<Arc<dyn Actor>> {
        self.actors.get(&agent_type.to_lowercase()).cloned()
    }

    pub fn agent_types(&self) -> Vec<String> {
        let mut names: Vec<_> = self.actors.keys().cloned().collect();
        names.sort();
        names
    }
}

/// 阶段跟踪：校验转移并输出审计日志
struct PhaseTracker<'a> {
    task_id: &'a str,
    phase: Phase,
    entered: Instant,
}

impl<'a> PhaseTracker<'a> {
    fn new(task_id: &'a str) -> Self {
        Self {
            task_id,
            phase: Phase::Init,
            entered: Instant::now(),
        }
    }

    fn advance(&mut self, next: Phase) {
        debug_assert!(
            self.phase.can_transition_to(next),
            "illegal transition {:?} -> {:?}",
            self.phase,
            next
        );
        let audit = serde_json::json!({
            "event": "phase_audit",
            "task_id": self.task_id,
            "from": self.phase.as_str(),
            "phase": next.as_str(),
            "duration_ms": self.entered.elapsed().as_millis() as u64,
        });
        tracing::info!(audit = %audit.to_string(), "phase");
        self.phase = next;
        self.entered = Instant::now();
    }
}

/// 一次尝试的终态
enum Attempt {
    Success,
    Recovered { path: RecoveryPath },
    RolledBack { cause: RecoveryError, report: Option<String> },
    Cancelled,
}

/// 恢复编排器
pub struct RecoveryOrchestrator {
    pub(crate) actors: ActorRegistry,
    pub(crate) store: Arc<TaskStore>,
    pub(crate) trace_log: Arc<dyn TraceLog>,
    pub(crate) critic: Critic,
    pub(crate) diagnoser: Diagnoser,
    pub(crate) healer: Healer,
    pub(crate) replanner: Replanner,
    pub(crate) learning: LearningSink,
    pub(crate) supervisor: TaskSupervisor,
    pub(crate) scheduler: TaskScheduler,
    pub(crate) actor_timeout: Duration,
}

impl RecoveryOrchestrator {
    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    pub fn trace_log(&self) -> &Arc<dyn TraceLog> {
        &self.trace_log
    }

    pub fn actors(&self) -> &ActorRegistry {
        &self.actors
    }

    pub async fn learning_records(&self) -> Result<Vec<LearningRecord>, RecoveryError> {
        self.learning.store().records().await
    }

    /// 取消某任务的在途编排
    pub async fn cancel(&self, task_id: &str) -> bool {
        self.supervisor.cancel(task_id).await
    }

    pub fn cancel_all(&self) {
        self.supervisor.cancel_all();
    }

    /// 并发执行多个步骤；同一 task id 的请求仍按锁顺序串行
    pub async fn execute_many(&self, requests: Vec<StepRequest>) -> Vec<StepResult> {
        join_all(requests.into_iter().map(|r| self.execute_step(r))).await
    }

    pub async fn execute_step(&self, request: StepRequest) -> StepResult {
        let task_id = request.task_id.clone();
        let Some(actor) = self.actors.get(&request.agent_type) else {
            let agent_type = request.agent_type.to_lowercase();
            tracing::warn!(task_id = %task_id, agent_type = %agent_type, "unknown agent type");
            return StepResult::new(
                &task_id,
                StepStatus::Failed,
                RecoveryError::UnknownActor(agent_type).to_string(),
                "orchestrator",
            );
        };

        let ticket = self.supervisor.register(&task_id).await;
        let result = self.run_step(actor, &request, ticket.token()).await;
        self.supervisor.release(&task_id, &ticket).await;
        result
    }

    /// 先取任务锁再取并发许可：排队等同一 task id 的调用不占用许可
    async fn run_step(
        &self,
        actor: Arc<dyn Actor>,
        request: &StepRequest,
        token: &CancellationToken,
    ) -> StepResult {
        let task_id = request.task_id.as_str();
        let actor_name = actor.name().to_string();

        let init = || TaskState::new(request.steps.clone(), request.context.clone());
        let mut guard = tokio::select! {
            biased;
            _ = token.cancelled() => return StepResult::cancelled(task_id, &actor_name, None),
            g = self.store.acquire(task_id, init) => g,
        };
        if guard.created() {
            tracing::info!(task_id, "task state created");
        }

        let _permit = match self.scheduler.acquire(token).await {
            Ok(p) => p,
            Err(_) => {
                return StepResult::cancelled(task_id, &actor_name, Some(guard.state().clone()))
            }
        };

        let mut faults = Vec::new();
        let attempt = self
            .run_attempt(&mut guard, actor.as_ref(), request, token, &mut faults)
            .await;
        self.finalize(guard, attempt, &actor_name, faults).await
    }

    async fn run_attempt(
        &self,
        guard: &mut TaskGuard,
        actor: &dyn Actor,
        request: &StepRequest,
        token: &CancellationToken,
        faults: &mut Vec<FaultKind>,
    ) -> Attempt {
        let task_id = request.task_id.as_str();
        let mut tracker = PhaseTracker::new(task_id);
        let state = guard.state_mut();

        if token.is_cancelled() {
            return Attempt::Cancelled;
        }
        let checkpoint = state.checkpoint();

        // EXECUTING
        tracker.advance(Phase::Executing);
        let ctx = ActorContext {
            task_id: task_id.to_string(),
            prompt: request.prompt.clone(),
            step: state.current_step().map(String::from),
            plan: state.plan.clone(),
            variables: state.variables.clone(),
        };
        let action = ctx
            .step
            .clone()
            .unwrap_or_else(|| format!("actor:{}", actor.name()));
        let executed = tokio::select! {
            biased;
            _ = token.cancelled() => return Attempt::Cancelled,
            r = timeout(self.actor_timeout, actor.execute(&ctx)) => r,
        };
        let entry = match executed {
            Ok(Ok(output)) => {
                state.fault_context = None;
                state.current_output = Some(output.clone());
                TraceEntry::new(action, output)
            }
            Ok(Err(fault)) => {
                tracing::warn!(task_id, fault = %fault, "actor raised a hard fault");
                state.fault_context = Some(fault.to_string());
                state.current_output = None;
                TraceEntry::new(action, format!("FAULT {fault}"))
            }
            Err(_) => {
                let fault = format!(
                    "ActorTimeout: {} exceeded {}ms",
                    actor.name(),
                    self.actor_timeout.as_millis()
                );
                tracing::warn!(task_id, "{}", fault);
                state.fault_context = Some(fault.clone());
                state.current_output = None;
                TraceEntry::new(action, format!("FAULT {fault}"))
            }
        };
        state.push_trace(entry.clone());
        self.trace_log.append(task_id, entry).await;

        // ASSESSING
        tracker.advance(Phase::Assessing);
        let verdict = tokio::select! {
            biased;
            _ = token.cancelled() => return Attempt::Cancelled,
            v = self.critic.route(state) => v,
        };
        if verdict.route == Route::Success {
            tracker.advance(Phase::FinalizeSuccess);
            return Attempt::Success;
        }
        faults.push(if state.fault_context.is_some() {
            FaultKind::HardState
        } else {
            FaultKind::SoftQuality
        });

        // DIAGNOSING
        tracker.advance(Phase::Diagnosing);
        let failure = verdict.failure_signal(state);
        let path = tokio::select! {
            biased;
            _ = token.cancelled() => return Attempt::Cancelled,
            p = self.diagnoser.classify(state, &failure) => p,
        };
        faults.push(path.fault_kind());
        let report = state.diagnosis_report.clone();

        match path {
            RecoveryPath::Heal => {
                tracker.advance(Phase::Healing);
                match self.healer.apply_repair(state, &checkpoint, token).await {
                    Ok(HealOutcome::Resume(summary)) => {
                        let entry = TraceEntry::new("heal", summary.applied.join(","));
                        state.push_trace(entry.clone());
                        self.trace_log.append(task_id, entry).await;
                        tracker.advance(Phase::FinalizeRecovered);
                        Attempt::Recovered { path }
                    }
                    Ok(HealOutcome::Fallback(cause)) => {
                        if matches!(cause, RecoveryError::RepairExecution(_)) {
                            faults.push(FaultKind::RepairExecution);
                        }
                        tracker.advance(Phase::FinalizeRolledBack);
                        Attempt::RolledBack { cause, report }
                    }
                    Err(_) => Attempt::Cancelled,
                }
            }
            RecoveryPath::Replan => {
                tracker.advance(Phase::Replanning);
                match self.replanner.replan(state, token).await {
                    Ok(()) => {
                        let entry = TraceEntry::new("replan", state.plan.join(" | "));
                        state.push_trace(entry.clone());
                        self.trace_log.append(task_id, entry).await;
                        tracker.advance(Phase::FinalizeRecovered);
                        Attempt::Recovered { path }
                    }
                    Err(RecoveryError::Cancelled) => Attempt::Cancelled,
                    Err(cause) => {
                        tracing::error!(
                            task_id,
                            "replan failed: {}. rolling back to checkpoint",
                            cause
                        );
                        state.restore(&checkpoint);
                        tracker.advance(Phase::FinalizeRolledBack);
                        Attempt::RolledBack { cause, report }
                    }
                }
            }
        }
    }

    async fn finalize(
        &self,
        mut guard: TaskGuard,
        attempt: Attempt,
        actor_name: &str,
        faults: Vec<FaultKind>,
    ) -> StepResult {
        let task_id = guard.task_id().to_string();
        match attempt {
            Attempt::Success => {
                let state = guard.state().clone();
                let mut result = StepResult::new(
                    &task_id,
                    StepStatus::Success,
                    state.current_output.clone().unwrap_or_default(),
                    actor_name,
                );
                result.final_state = Some(state);
                self.retire(guard).await;
                result
            }
            Attempt::Recovered { path } => {
                let state = guard.state_mut();
                state.fault_context = None;
                if let Err(e) = self
                    .learning
                    .record(&task_id, state, RecoveryOutcome::Resume)
                    .await
                {
                    tracing::warn!(task_id = %task_id, "failed to persist learning record: {}", e);
                }
                tracing::info!(task_id = %task_id, path = ?path, "step recovered");
                let mut result = StepResult::new(
                    &task_id,
                    StepStatus::Recovered,
                    state.current_output.clone().unwrap_or_default(),
                    actor_name,
                );
                result.diagnosis_report = state.diagnosis_report.clone();
                result.faults = faults;
                result.final_state = Some(state.clone());
                result
            }
            Attempt::RolledBack { cause, report } => {
                tracing::error!(task_id = %task_id, "step failed after rollback: {}", cause);
                let mut result =
                    StepResult::new(&task_id, StepStatus::Failed, cause.to_string(), actor_name);
                result.diagnosis_report = report;
                result.faults = faults;
                result.rolled_back = true;
                result.final_state = Some(guard.state().clone());
                self.retire(guard).await;
                result
            }
            Attempt::Cancelled => {
                tracing::warn!(task_id = %task_id, "orchestration cancelled");
                let mut result =
                    StepResult::cancelled(&task_id, actor_name, Some(guard.state().clone()));
                result.faults = faults;
                result
            }
        }
    }

    /// 终态：删除 TaskState
    async fn retire(&self, guard: TaskGuard) {
        self.store.discard(guard).await;
    }
}
