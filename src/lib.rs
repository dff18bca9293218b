//! Rebound - Rust 任务执行监管器
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 任务状态与检查点、按 task id 串行的存储、取消与并发调度、主控状态机
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）
//! - **observability**: 日志初始化
//! - **recovery**: Critic、Diagnoser、Healer（受限修复边界）、Replanner、学习信号采集
//! - **services**: Actor 与外部服务接口、LLM 适配器、脚本化 Mock

pub mod config;
pub mod core;
pub mod llm;
pub mod observability;
pub mod recovery;
pub mod services;

pub use crate::core::{
    OrchestratorBuilder, RecoveryOrchestrator, StepRequest, StepResult, StepStatus,
};
