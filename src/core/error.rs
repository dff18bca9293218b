//! 编排错误类型与故障分类
//!
//! RecoveryError 描述编排过程中的失败（外部服务超时/不可用、修复执行失败、取消等）；
//! FaultKind 描述一次尝试中观察到的故障类别，随 StepResult 返回给调用方。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::recovery::RepairOpError;

/// 编排运行过程中可能出现的错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecoveryError {
    #[error("{service} timed out after {timeout_ms}ms")]
    ServiceTimeout { service: &'static str, timeout_ms: u64 },

    #[error("{service} failed: {message}")]
    ServiceFailed {
        service: &'static str,
        message: String,
    },

    #[error("Repair execution failed: {0}")]
    RepairExecution(#[from] RepairOpError),

    #[error("Orchestration cancelled")]
    Cancelled,

    #[error("Unknown agent type: {0}")]
    UnknownActor(String),

    #[error("Store error: {0}")]
    Store(String),
}

impl RecoveryError {
    /// 外部服务层面的失败（超时或不可用），用于决定走 REPLAN / FALLBACK
    pub fn is_service_failure(&self) -> bool {
        matches!(
            self,
            RecoveryError::ServiceTimeout { .. } | RecoveryError::ServiceFailed { .. }
        )
    }
}

/// 故障分类：硬故障 / 软质量故障 / 可就地修复 / 外部故障 / 修复执行失败
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// Actor 抛出异常，记录为 fault_context
    HardState,
    /// Actor 有输出但评分低于阈值（或评分未知）
    SoftQuality,
    /// 诊断为 STATE_FAULT，交给 Healer
    StateRepairable,
    /// 诊断为 EXTERNAL_FAULT 或诊断服务不可达，交给 Replanner
    External,
    /// 修复程序在沙箱内执行失败，已回滚
    RepairExecution,
}
