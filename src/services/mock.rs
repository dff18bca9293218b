//! 脚本化 Mock 服务与 Actor（用于测试与演示，无需外部后端）
//!
//! 每个 Mock 返回预设结果，可选延迟（模拟超时），并记录调用次数与最近一次请求。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::core::{TaskState, TraceEntry, Variables};
use crate::recovery::RepairProgram;
use crate::services::{
    Actor, ActorContext, ActorFault, Diagnosis, DiagnosisService, FailureSignal, FaultTag,
    JudgmentService, RepairService, ReplanService, ServiceError,
};

async fn maybe_delay(delay: Option<Duration>) {
    if let Some(d) = delay {
        tokio::time::sleep(d).await;
    }
}

fn unavailable() -> ServiceError {
    ServiceError::Unavailable("scripted outage".to_string())
}

/// 返回固定分数的评分服务
#[derive(Debug, Default)]
pub struct ScriptedJudge {
    score: Option<f64>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedJudge {
    pub fn score(score: f64) -> Self {
        Self {
            score: Some(score),
            ..Self::default()
        }
    }

    pub fn unavailable() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JudgmentService for ScriptedJudge {
    async fn evaluate(&self, _state: &TaskState) -> Result<f64, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        maybe_delay(self.delay).await;
        self.score.ok_or_else(unavailable)
    }
}

/// 返回固定诊断的诊断服务
#[derive(Debug, Default)]
pub struct ScriptedDiagnosis {
    diagnosis: Option<Diagnosis>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    last: Mutex<Option<(FailureSignal, Vec<TraceEntry>)>>,
}

impl ScriptedDiagnosis {
    pub fn state_fault(narrative: impl Into<String>) -> Self {
        Self {
            diagnosis: Some(Diagnosis {
                narrative: narrative.into(),
                tag: FaultTag::StateFault,
            }),
            ..Self::default()
        }
    }

    pub fn external_fault(narrative: impl Into<String>) -> Self {
        Self {
            diagnosis: Some(Diagnosis {
                narrative: narrative.into(),
                tag: FaultTag::ExternalFault,
            }),
            ..Self::default()
        }
    }

    pub fn unavailable() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<(FailureSignal, Vec<TraceEntry>)> {
        self.last.lock().ok().and_then(|l| l.clone())
    }
}

#[async_trait]
impl DiagnosisService for ScriptedDiagnosis {
    async fn diagnose(
        &self,
        failure: &FailureSignal,
        trace: &[TraceEntry],
    ) -> Result<Diagnosis, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.last.lock() {
            *last = Some((failure.clone(), trace.to_vec()));
        }
        maybe_delay(self.delay).await;
        self.diagnosis.clone().ok_or_else(unavailable)
    }
}

/// 返回固定修复程序的修复服务
#[derive(Debug, Default)]
pub struct ScriptedRepair {
    program: Option<RepairProgram>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedRepair {
    pub fn program(program: RepairProgram) -> Self {
        Self {
            program: Some(program),
            ..Self::default()
        }
    }

    pub fn unavailable() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RepairService for ScriptedRepair {
    async fn propose_repair(
        &self,
        _diagnosis_report: &str,
        _variables: &Variables,
    ) -> Result<RepairProgram, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        maybe_delay(self.delay).await;
        self.program.clone().ok_or_else(unavailable)
    }
}

/// 返回固定新计划的重规划服务
#[derive(Debug, Default)]
pub struct ScriptedReplan {
    plan: Option<Vec<String>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    last: Mutex<Option<(String, Vec<String>)>>,
}

impl ScriptedReplan {
    pub fn plan(plan: Vec<String>) -> Self {
        Self {
            plan: Some(plan),
            ..Self::default()
        }
    }

    pub fn unavailable() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<(String, Vec<String>)> {
        self.last.lock().ok().and_then(|l| l.clone())
    }
}

#[async_trait]
impl ReplanService for ScriptedReplan {
    async fn propose_replan(
        &self,
        diagnosis_report: &str,
        remaining_plan: &[String],
    ) -> Result<Vec<String>, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.last.lock() {
            *last = Some((diagnosis_report.to_string(), remaining_plan.to_vec()));
        }
        maybe_delay(self.delay).await;
        self.plan.clone().ok_or_else(unavailable)
    }
}

/// 回显 prompt 与当前步骤的 Actor
#[derive(Debug, Default)]
pub struct EchoActor;

#[async_trait]
impl Actor for EchoActor {
    fn name(&self) -> &str {
        "echo"
    }

    async fn execute(&self, ctx: &ActorContext) -> Result<String, ActorFault> {
        Ok(format!(
            "Echo [{}]: {}",
            ctx.step.as_deref().unwrap_or("(no step)"),
            ctx.prompt
        ))
    }
}

/// 总是抛出硬故障的 Actor
#[derive(Debug)]
pub struct FailingActor {
    fault: ActorFault,
}

impl FailingActor {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            fault: ActorFault::new(kind, message),
        }
    }
}

#[async_trait]
impl Actor for FailingActor {
    fn name(&self) -> &str {
        "failing"
    }

    async fn execute(&self, _ctx: &ActorContext) -> Result<String, ActorFault> {
        Err(self.fault.clone())
    }
}

/// 延迟一段时间后返回的 Actor（用于取消 / 超时 / 串行化测试）
#[derive(Debug)]
pub struct SlowActor {
    delay: Duration,
    calls: AtomicUsize,
}

impl SlowActor {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Actor for SlowActor {
    fn name(&self) -> &str {
        "slow"
    }

    async fn execute(&self, ctx: &ActorContext) -> Result<String, ActorFault> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(format!("slow result for {}", ctx.task_id))
    }
}
