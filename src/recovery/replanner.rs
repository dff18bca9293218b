//! Replanner：替换剩余计划
//!
//! 请求时总是传 plan[1:]（去掉失败步骤），得到的新计划整体替换 state.plan。
//! 空计划合法，表示任务在下一轮评估时即视为完成。

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::core::{RecoveryError, TaskState};
use crate::services::ReplanService;

pub struct Replanner {
    service: Arc<dyn ReplanService>,
    timeout: Duration,
}

impl Replanner {
    pub fn new(service: Arc<dyn ReplanService>, timeout: Duration) -> Self {
        Self { service, timeout }
    }

    /// 成功即 RESUME；服务失败/超时或被取消时返回错误且不修改 state
    pub async fn replan(
        &self,
        state: &mut TaskState,
        cancel: &CancellationToken,
    ) -> Result<(), RecoveryError> {
        let report = state.diagnosis_report.clone().unwrap_or_default();
        let remaining = state.remaining_plan().to_vec();

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RecoveryError::Cancelled),
            r = timeout(self.timeout, self.service.propose_replan(&report, &remaining)) => r,
        };

        let new_plan = match result {
            Ok(Ok(plan)) => plan,
            Ok(Err(e)) => {
                return Err(RecoveryError::ServiceFailed {
                    service: "replan",
                    message: e.to_string(),
                })
            }
            Err(_) => {
                return Err(RecoveryError::ServiceTimeout {
                    service: "replan",
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
        };

        tracing::info!(steps = new_plan.len(), "adopted revised plan");
        state.plan = new_plan;
        Ok(())
    }
}
