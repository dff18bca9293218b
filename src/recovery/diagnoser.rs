//! Diagnoser：故障分类
//!
//! 用失败描述与最近几条轨迹请求诊断服务，把叙述写入 diagnosis_report；
//! 标签为 STATE_FAULT → HEAL，否则 → REPLAN。诊断服务不可达或超时时默认 REPLAN，
//! 避免 Healer 在没有信息的情况下修改状态。

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use crate::core::{FaultKind, TaskState};
use crate::services::{DiagnosisService, FailureSignal, FaultTag};

/// 恢复路径
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPath {
    Heal,
    Replan,
}

impl RecoveryPath {
    pub fn fault_kind(self) -> FaultKind {
        match self {
            RecoveryPath::Heal => FaultKind::StateRepairable,
            RecoveryPath::Replan => FaultKind::External,
        }
    }
}

pub const DEFAULT_TRACE_WINDOW: usize = 3;

pub struct Diagnoser {
    service: Arc<dyn DiagnosisService>,
    trace_window: usize,
    timeout: Duration,
}

impl Diagnoser {
    pub fn new(service: Arc<dyn DiagnosisService>, timeout: Duration) -> Self {
        Self {
            service,
            trace_window: DEFAULT_TRACE_WINDOW,
            timeout,
        }
    }

    pub fn with_trace_window(mut self, n: usize) -> Self {
        self.trace_window = n;
        self
    }

    /// 分类并设置 state.diagnosis_report
    pub async fn classify(&self, state: &mut TaskState, failure: &FailureSignal) -> RecoveryPath {
        let recent = state.recent_trace(self.trace_window).to_vec();
        let result = timeout(self.timeout, self.service.diagnose(failure, &recent)).await;

        let (report, path) = match result {
            Ok(Ok(diagnosis)) => {
                let path = match diagnosis.tag {
                    FaultTag::StateFault => RecoveryPath::Heal,
                    FaultTag::ExternalFault => RecoveryPath::Replan,
                };
                (diagnosis.narrative, path)
            }
            Ok(Err(e)) => {
                tracing::warn!("diagnosis service failed ({}), defaulting to replan", e);
                (
                    format!(
                        "diagnosis unavailable ({e}); treating as external fault: {}",
                        failure.describe()
                    ),
                    RecoveryPath::Replan,
                )
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.timeout.as_millis() as u64,
                    "diagnosis timed out, defaulting to replan"
                );
                (
                    format!(
                        "diagnosis timed out; treating as external fault: {}",
                        failure.describe()
                    ),
                    RecoveryPath::Replan,
                )
            }
        };

        tracing::info!(path = ?path, "diagnosis classified");
        state.diagnosis_report = Some(report);
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TraceEntry;
    use crate::services::ScriptedDiagnosis;

    fn state_with_trace(n: usize) -> TaskState {
        let mut s = TaskState::default();
        for i in 0..n {
            s.push_trace(TraceEntry::new(format!("step{i}"), "out"));
        }
        s
    }

    #[tokio::test]
    async fn test_state_fault_heals() {
        let service = Arc::new(ScriptedDiagnosis::state_fault("stale handle"));
        let diagnoser = Diagnoser::new(service, Duration::from_millis(100));
        let mut s = state_with_trace(1);
        let path = diagnoser
            .classify(&mut s, &FailureSignal::Fault("ConnectionError".into()))
            .await;
        assert_eq!(path, RecoveryPath::Heal);
        assert_eq!(s.diagnosis_report.as_deref(), Some("stale handle"));
    }

    #[tokio::test]
    async fn test_external_fault_replans() {
        let service = Arc::new(ScriptedDiagnosis::external_fault("api down"));
        let diagnoser = Diagnoser::new(service, Duration::from_millis(100));
        let mut s = TaskState::default();
        let path = diagnoser.classify(&mut s, &FailureSignal::LowScore(Some(2.0))).await;
        assert_eq!(path, RecoveryPath::Replan);
    }

    #[tokio::test]
    async fn test_unreachable_defaults_to_replan() {
        let service = Arc::new(ScriptedDiagnosis::unavailable());
        let diagnoser = Diagnoser::new(service, Duration::from_millis(100));
        let mut s = TaskState::default();
        let path = diagnoser.classify(&mut s, &FailureSignal::Fault("boom".into())).await;
        assert_eq!(path, RecoveryPath::Replan);
        assert!(s.diagnosis_report.unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn test_timeout_defaults_to_replan() {
        let service = Arc::new(
            ScriptedDiagnosis::state_fault("late").with_delay(Duration::from_secs(5)),
        );
        let diagnoser = Diagnoser::new(service, Duration::from_millis(20));
        let mut s = TaskState::default();
        let path = diagnoser.classify(&mut s, &FailureSignal::LowScore(None)).await;
        assert_eq!(path, RecoveryPath::Replan);
        assert!(s.diagnosis_report.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_only_recent_trace_is_sent() {
        let service = Arc::new(ScriptedDiagnosis::state_fault("x"));
        let diagnoser = Diagnoser::new(service.clone(), Duration::from_millis(100));
        let mut s = state_with_trace(6);
        diagnoser.classify(&mut s, &FailureSignal::Fault("f".into())).await;

        let (failure, trace) = service.last_request().unwrap();
        assert_eq!(failure, FailureSignal::Fault("f".into()));
        assert_eq!(trace.len(), 3);
        assert_eq!(trace[0].action, "step3");
    }
}
