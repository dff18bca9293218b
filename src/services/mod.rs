//! 外部能力边界：Actor、评分、诊断、修复、重规划
//!
//! 编排核心只通过这些 trait 消费外部能力；具体实现可以是 LLM（见 `llm` 子模块）或测试用的脚本化 Mock。

pub mod llm;
pub mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{TaskState, TraceEntry, Variables};
use crate::recovery::RepairProgram;

pub use llm::{LlmDiagnostician, LlmJudge, LlmRepairer, LlmReplanner};
pub use mock::{
    EchoActor, FailingActor, ScriptedDiagnosis, ScriptedJudge, ScriptedRepair, ScriptedReplan,
    SlowActor,
};

/// 外部服务调用失败
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ServiceError {
    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Actor 抛出的硬故障
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind}: {message}")]
pub struct ActorFault {
    pub kind: String,
    pub message: String,
}

impl ActorFault {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// 传给 Actor 的执行上下文
#[derive(Debug, Clone)]
pub struct ActorContext {
    pub task_id: String,
    pub prompt: String,
    /// 当前步骤（plan[0]），计划为空时为 None
    pub step: Option<String>,
    pub plan: Vec<String>,
    pub variables: Variables,
}

/// 执行领域工作的 Actor
#[async_trait]
pub trait Actor: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, ctx: &ActorContext) -> Result<String, ActorFault>;
}

/// 质量评分：返回 1.0–5.0 的分数
#[async_trait]
pub trait JudgmentService: Send + Sync {
    async fn evaluate(&self, state: &TaskState) -> Result<f64, ServiceError>;
}

/// 诊断请求中的失败描述
#[derive(Debug, Clone, PartialEq)]
pub enum FailureSignal {
    /// Actor 抛出的硬故障
    Fault(String),
    /// 分数低于阈值；None 表示评分未知（超时或无效分数）
    LowScore(Option<f64>),
}

impl FailureSignal {
    pub fn describe(&self) -> String {
        match self {
            FailureSignal::Fault(f) => f.clone(),
            FailureSignal::LowScore(Some(score)) => {
                format!("soft failure: score below threshold ({score:.2})")
            }
            FailureSignal::LowScore(None) => {
                "soft failure: score below threshold (quality unknown)".to_string()
            }
        }
    }
}

/// 诊断标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FaultTag {
    /// 本地/程序性原因，可就地修复
    StateFault,
    /// 外部/环境原因，需要重规划
    ExternalFault,
}

/// 诊断结果：根因叙述 + 标签
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnosis {
    pub narrative: String,
    pub tag: FaultTag,
}

#[async_trait]
pub trait DiagnosisService: Send + Sync {
    async fn diagnose(
        &self,
        failure: &FailureSignal,
        trace: &[TraceEntry],
    ) -> Result<Diagnosis, ServiceError>;
}

/// 修复服务：返回受限操作列表，不是可执行代码
#[async_trait]
pub trait RepairService: Send + Sync {
    async fn propose_repair(
        &self,
        diagnosis_report: &str,
        variables: &Variables,
    ) -> Result<RepairProgram, ServiceError>;
}

#[async_trait]
pub trait ReplanService: Send + Sync {
    async fn propose_replan(
        &self,
        diagnosis_report: &str,
        remaining_plan: &[String],
    ) -> Result<Vec<String>, ServiceError>;
}
