//! Critic：结果评估与路由
//!
//! 硬故障（fault_context 已设置）直接走 DIAGNOSE，不调用评分服务；
//! 否则在超时内请求评分，分数 < 阈值（默认 3.0）走 DIAGNOSE，>= 阈值为 SUCCESS。
//! 评分超时、失败或分数无效都视为「质量未知」，走 DIAGNOSE。

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use crate::core::TaskState;
use crate::services::{FailureSignal, JudgmentService};

pub const MIN_SCORE: f64 = 1.0;
pub const MAX_SCORE: f64 = 5.0;
pub const DEFAULT_QUALITY_THRESHOLD: f64 = 3.0;

/// 路由结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Success,
    Diagnose,
}

/// Critic 评估结果：路由 + 评分（硬故障或评分未知时为 None）
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub route: Route,
    pub score: Option<f64>,
}

impl Verdict {
    /// 交给 Diagnoser 的失败描述
    pub fn failure_signal(&self, state: &TaskState) -> FailureSignal {
        match &state.fault_context {
            Some(fault) => FailureSignal::Fault(fault.clone()),
            None => FailureSignal::LowScore(self.score),
        }
    }
}

/// Critic：持有评分服务、阈值与超时
pub struct Critic {
    judge: Arc<dyn JudgmentService>,
    threshold: f64,
    timeout: Duration,
}

impl Critic {
    pub fn new(judge: Arc<dyn JudgmentService>, timeout: Duration) -> Self {
        Self {
            judge,
            threshold: DEFAULT_QUALITY_THRESHOLD,
            timeout,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub async fn route(&self, state: &TaskState) -> Verdict {
        if let Some(fault) = &state.fault_context {
            tracing::warn!(fault = %fault, "hard fault captured, skipping quality scoring");
            return Verdict {
                route: Route::Diagnose,
                score: None,
            };
        }

        let score = match timeout(self.timeout, self.judge.evaluate(state)).await {
            Ok(Ok(score)) if (MIN_SCORE..=MAX_SCORE).contains(&score) => Some(score),
            Ok(Ok(score)) => {
                tracing::warn!(score, "judgment score out of range, treating as unknown");
                None
            }
            Ok(Err(e)) => {
                tracing::warn!("judgment failed ({}), treating quality as unknown", e);
                None
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.timeout.as_millis() as u64,
                    "judgment timed out, treating quality as unknown"
                );
                None
            }
        };

        let route = match score {
            Some(s) if s >= self.threshold => Route::Success,
            Some(s) => {
                tracing::warn!(score = s, threshold = self.threshold, "soft quality degradation");
                Route::Diagnose
            }
            None => Route::Diagnose,
        };
        tracing::info!(score = ?score, route = ?route, "critic verdict");
        Verdict { route, score }
    }
}
