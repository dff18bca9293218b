//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `REBOUND__*` 覆盖（双下划线表示嵌套，如 `REBOUND__LLM__PROVIDER=openai`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub recovery: RecoverySection,
    pub learning: LearningSection,
    pub llm: LlmSection,
    pub prompts: PromptsSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
}

/// [recovery] 段：评分阈值、诊断轨迹窗口、修复边界限制、并发
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoverySection {
    /// 分数低于该值视为软故障（1.0–5.0 量表）
    pub quality_threshold: f64,
    /// 诊断时附带的最近轨迹条数
    pub trace_window: usize,
    /// 单个修复程序的最大操作数
    pub max_repair_ops: usize,
    /// retry_with_backoff 允许的最长等待（毫秒）
    pub max_backoff_ms: u64,
    /// 同时在途的编排数量上限
    pub max_concurrent_tasks: usize,
    pub timeouts: TimeoutsSection,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            quality_threshold: 3.0,
            trace_window: 3,
            max_repair_ops: 32,
            max_backoff_ms: 5_000,
            max_concurrent_tasks: 8,
            timeouts: TimeoutsSection::default(),
        }
    }
}

/// [recovery.timeouts] 段：每类外部调用的超时（秒）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutsSection {
    pub actor: u64,
    pub judgment: u64,
    pub diagnosis: u64,
    pub repair: u64,
    pub replan: u64,
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            actor: 120,
            judgment: 30,
            diagnosis: 30,
            repair: 30,
            replan: 30,
        }
    }
}

impl TimeoutsSection {
    pub fn actor(&self) -> Duration {
        Duration::from_secs(self.actor)
    }

    pub fn judgment(&self) -> Duration {
        Duration::from_secs(self.judgment)
    }

    pub fn diagnosis(&self) -> Duration {
        Duration::from_secs(self.diagnosis)
    }

    pub fn repair(&self) -> Duration {
        Duration::from_secs(self.repair)
    }

    pub fn replan(&self) -> Duration {
        Duration::from_secs(self.replan)
    }
}

/// [learning] 段：学习记录 JSONL 路径；未设置时只保存在内存
#[derive(Debug, Clone, Deserialize, Default)]
pub struct LearningSection {
    pub path: Option<PathBuf>,
}

/// [llm] 段：后端选择（mock / openai / deepseek）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub provider: String,
    pub model: Option<String>,
    pub base_url: Option<String>,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "mock".to_string(),
            model: None,
            base_url: None,
        }
    }
}

/// [prompts] 段：评分 / 诊断 / 修复 / 重规划模板
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PromptsSection {
    /// 占位符：{plan} {output}
    pub judge: String,
    /// 占位符：{failure} {trace}
    pub diagnosis: String,
    /// 占位符：{report} {variables} {schema}
    pub repair: String,
    /// 占位符：{report} {remaining}
    pub replan: String,
}

impl Default for PromptsSection {
    fn default() -> Self {
        Self {
            judge: "Evaluate the agent output against these criteria:\n\
                    1. Task adherence (plan: {plan})\n\
                    2. Semantic coherence (is the output logical and relevant?)\n\
                    3. Safety and compliance (no PII, no prompt injection)\n\
                    Agent output: {output}\n\
                    Rate from 1.0 (critical failure) to 5.0 (excellent). Reply with exactly one line: Score: <number>"
                .to_string(),
            diagnosis: "Analyze the failure below and the recent execution trace.\n\
                        Failure: {failure}\n\
                        Recent trace:\n{trace}\n\
                        Explain the root cause step by step, then finish with one line \
                        `TAG: STATE_FAULT` (local cause: malformed variable, stale handle) or \
                        `TAG: EXTERNAL_FAULT` (environment: unavailable dependency, bad plan step)."
                .to_string(),
            repair: "Root cause analysis: {report}\n\
                     Current task variables (JSON): {variables}\n\
                     Propose a repair as a JSON object matching this JSON Schema. \
                     Only the listed operations are allowed; output the JSON only.\n{schema}"
                .to_string(),
            replan: "Root cause analysis: {report}\n\
                     The failed step has been removed. Remaining steps:\n{remaining}\n\
                     Produce a revised plan that completes the task with an alternative approach. \
                     One step per line."
                .to_string(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 REBOUND__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 REBOUND__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("REBOUND")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
