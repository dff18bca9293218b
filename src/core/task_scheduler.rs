//! 任务调度：限制在途编排数量
//!
//! 每个在途编排占用一个 Semaphore 许可；不同 task id 在许可范围内并行。

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::core::RecoveryError;

/// 任务调度器
#[derive(Debug, Clone)]
pub struct TaskScheduler {
    /// 编排并发限制（默认 8）
    permits: Arc<Semaphore>,
}

impl TaskScheduler {
    pub fn new(max_concurrent_tasks: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent_tasks.max(1))),
        }
    }

    /// 获取编排许可；等待期间被取消则返回 Cancelled
    pub async fn acquire(
        &self,
        token: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit, RecoveryError> {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(RecoveryError::Cancelled),
            permit = self.permits.clone().acquire_owned() => {
                permit.map_err(|_| RecoveryError::Store("scheduler closed".to_string()))
            }
        }
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(8)
    }
}
