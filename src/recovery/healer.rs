//! Healer：就地修复 TaskState
//!
//! 用 diagnosis_report 与当前变量请求修复程序，在 RepairSandbox 内执行。
//! 执行成功 → RESUME；修复服务失败/超时或执行出错 → 用检查点整体覆盖 state，返回 FALLBACK。

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::core::{Checkpoint, RecoveryError, TaskState};
use crate::recovery::{RepairSandbox, RepairSummary};
use crate::services::RepairService;

/// 修复结果
#[derive(Debug, Clone, PartialEq)]
pub enum HealOutcome {
    Resume(RepairSummary),
    /// 已回滚到检查点
    Fallback(RecoveryError),
}

pub struct Healer {
    service: Arc<dyn RepairService>,
    sandbox: RepairSandbox,
    timeout: Duration,
}

impl Healer {
    pub fn new(service: Arc<dyn RepairService>, sandbox: RepairSandbox, timeout: Duration) -> Self {
        Self {
            service,
            sandbox,
            timeout,
        }
    }

    /// 应用修复；仅在边界执行开始前被取消时返回 Err(Cancelled)，此时 state 未被修改
    pub async fn apply_repair(
        &self,
        state: &mut TaskState,
        checkpoint: &Checkpoint,
        cancel: &CancellationToken,
    ) -> Result<HealOutcome, RecoveryError> {
        let report = state.diagnosis_report.clone().unwrap_or_default();

        let proposal = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RecoveryError::Cancelled),
            r = timeout(self.timeout, self.service.propose_repair(&report, &state.variables)) => r,
        };

        let program = match proposal {
            Ok(Ok(program)) => program,
            Ok(Err(e)) => {
                return Ok(self.rollback(
                    state,
                    checkpoint,
                    RecoveryError::ServiceFailed {
                        service: "repair",
                        message: e.to_string(),
                    },
                ))
            }
            Err(_) => {
                return Ok(self.rollback(
                    state,
                    checkpoint,
                    RecoveryError::ServiceTimeout {
                        service: "repair",
                        timeout_ms: self.timeout.as_millis() as u64,
                    },
                ))
            }
        };

        if cancel.is_cancelled() {
            return Err(RecoveryError::Cancelled);
        }

        // 边界执行一旦开始就完整执行，不响应取消
        tracing::info!(ops = program.ops.len(), "applying repair program");
        match self.sandbox.execute(&program, state).await {
            Ok(summary) => {
                tracing::info!(applied = ?summary.applied, "state successfully repaired");
                Ok(HealOutcome::Resume(summary))
            }
            Err(e) => Ok(self.rollback(state, checkpoint, RecoveryError::RepairExecution(e))),
        }
    }

    fn rollback(
        &self,
        state: &mut TaskState,
        checkpoint: &Checkpoint,
        cause: RecoveryError,
    ) -> HealOutcome {
        tracing::error!("repair failed: {}. rolling back to checkpoint", cause);
        state.restore(checkpoint);
        HealOutcome::Fallback(cause)
    }
}
