//! 修复程序与受限执行边界
//!
//! 修复服务只能返回一组封闭、可枚举的操作（RepairOp），由 RepairSandbox 解释执行：
//! 只能修改 variables 与 plan，不做任意 I/O，不启动进程。执行在工作副本上进行，
//! 全部操作成功后才一次性提交，任何一步失败都不会留下部分修改。

use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{TaskState, Variables};

/// 单个修复操作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RepairOp {
    /// 设置（或覆盖）变量
    SetVariable { key: String, value: serde_json::Value },
    /// 删除变量；变量不存在时报错
    ClearVariable { key: String },
    /// 将对象合并进已有对象变量（浅合并）；变量不存在时等同 set
    MergeVariable { key: String, value: serde_json::Value },
    /// 在计划末尾追加步骤
    AppendStep { step: String },
    /// 替换计划中第 index 个步骤
    ReplaceStep { index: usize, step: String },
    /// 等待一段时间后恢复（例如等待外部句柄重建）
    RetryWithBackoff { delay_ms: u64 },
}

impl RepairOp {
    pub fn name(&self) -> &'static str {
        match self {
            RepairOp::SetVariable { .. } => "set_variable",
            RepairOp::ClearVariable { .. } => "clear_variable",
            RepairOp::MergeVariable { .. } => "merge_variable",
            RepairOp::AppendStep { .. } => "append_step",
            RepairOp::ReplaceStep { .. } => "replace_step",
            RepairOp::RetryWithBackoff { .. } => "retry_with_backoff",
        }
    }
}

/// 修复程序：按顺序执行的操作列表
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RepairProgram {
    pub ops: Vec<RepairOp>,
}

impl RepairProgram {
    pub fn new(ops: Vec<RepairOp>) -> Self {
        Self { ops }
    }

    /// 修复程序的 JSON Schema（嵌入修复 prompt）
    pub fn schema_json() -> String {
        let schema = schemars::schema_for!(RepairProgram);
        serde_json::to_string_pretty(&schema).unwrap_or_default()
    }
}

/// 修复程序在边界内执行失败
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RepairOpError {
    #[error("program has {count} ops, limit is {limit}")]
    TooManyOps { count: usize, limit: usize },

    #[error("invalid variable key {0:?}")]
    InvalidKey(String),

    #[error("variable {0:?} does not exist")]
    UnknownVariable(String),

    #[error("cannot merge into {key:?}: {reason}")]
    MergeConflict { key: String, reason: String },

    #[error("plan index {index} out of range (len {len})")]
    StepOutOfRange { index: usize, len: usize },

    #[error("empty plan step")]
    EmptyStep,

    #[error("backoff {requested_ms}ms exceeds limit {limit_ms}ms")]
    BackoffTooLong { requested_ms: u64, limit_ms: u64 },
}

/// 修复成功后的变更摘要
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RepairSummary {
    pub applied: Vec<&'static str>,
    pub waited: Duration,
}

/// 受限执行边界
#[derive(Debug, Clone)]
pub struct RepairSandbox {
    max_ops: usize,
    max_backoff: Duration,
}

const MAX_KEY_LEN: usize = 128;

impl RepairSandbox {
    pub fn new(max_ops: usize, max_backoff: Duration) -> Self {
        Self {
            max_ops,
            max_backoff,
        }
    }

    /// 在工作副本上执行修复程序；全部成功才写回 state
    pub async fn execute(
        &self,
        program: &RepairProgram,
        state: &mut TaskState,
    ) -> Result<RepairSummary, RepairOpError> {
        if program.ops.len() > self.max_ops {
            return Err(RepairOpError::TooManyOps {
                count: program.ops.len(),
                limit: self.max_ops,
            });
        }

        let mut variables = state.variables.clone();
        let mut plan = state.plan.clone();
        let mut summary = RepairSummary::default();

        for op in &program.ops {
            match op {
                RepairOp::SetVariable { key, value } => {
                    check_key(key)?;
                    variables.insert(key.clone(), value.clone());
                }
                RepairOp::ClearVariable { key } => {
                    check_key(key)?;
                    variables
                        .remove(key)
                        .ok_or_else(|| RepairOpError::UnknownVariable(key.clone()))?;
                }
                RepairOp::MergeVariable { key, value } => {
                    check_key(key)?;
                    merge_variable(&mut variables, key, value)?;
                }
                RepairOp::AppendStep { step } => {
                    if step.trim().is_empty() {
                        return Err(RepairOpError::EmptyStep);
                    }
                    plan.push(step.clone());
                }
                RepairOp::ReplaceStep { index, step } => {
                    if step.trim().is_empty() {
                        return Err(RepairOpError::EmptyStep);
                    }
                    let len = plan.len();
                    let slot = plan.get_mut(*index).ok_or(RepairOpError::StepOutOfRange {
                        index: *index,
                        len,
                    })?;
                    *slot = step.clone();
                }
                RepairOp::RetryWithBackoff { delay_ms } => {
                    let delay = Duration::from_millis(*delay_ms);
                    if delay > self.max_backoff {
                        return Err(RepairOpError::BackoffTooLong {
                            requested_ms: *delay_ms,
                            limit_ms: self.max_backoff.as_millis() as u64,
                        });
                    }
                    tokio::time::sleep(delay).await;
                    summary.waited += delay;
                }
            }
            summary.applied.push(op.name());
        }

        state.variables = variables;
        state.plan = plan;
        Ok(summary)
    }
}

impl Default for RepairSandbox {
    fn default() -> Self {
        Self::new(32, Duration::from_secs(5))
    }
}

fn check_key(key: &str) -> Result<(), RepairOpError> {
    let valid = !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(RepairOpError::InvalidKey(key.to_string()))
    }
}

fn merge_variable(
    variables: &mut Variables,
    key: &str,
    value: &serde_json::Value,
) -> Result<(), RepairOpError> {
    let incoming = value.as_object().ok_or_else(|| RepairOpError::MergeConflict {
        key: key.to_string(),
        reason: "merge value is not an object".to_string(),
    })?;
    match variables.get_mut(key) {
        None => {
            variables.insert(key.to_string(), value.clone());
        }
        Some(serde_json::Value::Object(existing)) => {
            for (k, v) in incoming {
                existing.insert(k.clone(), v.clone());
            }
        }
        Some(_) => {
            return Err(RepairOpError::MergeConflict {
                key: key.to_string(),
                reason: "existing value is not an object".to_string(),
            })
        }
    }
    Ok(())
}
