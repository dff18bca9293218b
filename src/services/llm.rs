//! 基于 LLM 的外部服务适配器
//!
//! 每个适配器持有 LlmClient 与 prompt 模板（`{placeholder}` 替换），并把回复解析为强类型结果：
//! - LlmJudge：`Score: <n>` → f64
//! - LlmDiagnostician：叙述 + `STATE_FAULT` / `EXTERNAL_FAULT` 标签
//! - LlmRepairer：回复中的 JSON → RepairProgram（只接受封闭的操作集合，绝不执行文本）
//! - LlmReplanner：逐行步骤 → Vec<String>

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;

use crate::config::PromptsSection;
use crate::core::{TaskState, TraceEntry, Variables};
use crate::llm::{LlmClient, Message};
use crate::recovery::RepairProgram;
use crate::services::{
    Diagnosis, DiagnosisService, FailureSignal, FaultTag, JudgmentService, RepairService,
    ReplanService, ServiceError,
};

async fn ask(llm: &Arc<dyn LlmClient>, prompt: String) -> Result<String, ServiceError> {
    llm.complete(&[Message::user(prompt)])
        .await
        .map_err(ServiceError::Unavailable)
}

fn render_trace(trace: &[TraceEntry]) -> String {
    if trace.is_empty() {
        return "(empty)".to_string();
    }
    trace
        .iter()
        .map(|e| format!("- {} => {}", e.action, e.output))
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_plan(plan: &[String]) -> String {
    if plan.is_empty() {
        return "(none)".to_string();
    }
    plan.iter()
        .enumerate()
        .map(|(i, s)| format!("{}. {}", i + 1, s))
        .collect::<Vec<_>>()
        .join("\n")
}

/// 从回复中提取 `Score: <n>`
pub fn parse_score(reply: &str) -> Result<f64, ServiceError> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"(?i)score\s*[:=]\s*([0-9]+(?:\.[0-9]+)?)").expect("valid score regex")
    });
    re.captures(reply)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .ok_or_else(|| ServiceError::Malformed(format!("no score in reply: {}", reply.trim())))
}

/// 标签判定：显式 EXTERNAL_FAULT 优先，其次 STATE_FAULT，都没有时视为外部故障
pub fn parse_diagnosis(reply: &str) -> Diagnosis {
    let upper = reply.to_uppercase();
    let tag = if upper.contains("EXTERNAL_FAULT") {
        FaultTag::ExternalFault
    } else if upper.contains("STATE_FAULT") {
        FaultTag::StateFault
    } else {
        FaultTag::ExternalFault
    };
    Diagnosis {
        narrative: reply.trim().to_string(),
        tag,
    }
}

/// 从回复中提取 JSON（```json 块或首个 `{` 到最后一个 `}`）并解析为 RepairProgram
pub fn parse_repair_program(reply: &str) -> Result<RepairProgram, ServiceError> {
    let trimmed = reply.trim();
    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim())
    } else {
        match (trimmed.find('{'), trimmed.rfind('}')) {
            (Some(start), Some(end)) if start < end => &trimmed[start..=end],
            _ => return Err(ServiceError::Malformed("no JSON repair program".to_string())),
        }
    };
    serde_json::from_str(json_str).map_err(|e| ServiceError::Malformed(format!("{e}: {json_str}")))
}

/// 逐行解析计划，去掉编号与列表符号
pub fn parse_plan(reply: &str) -> Vec<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let marker =
        RE.get_or_init(|| Regex::new(r"^\s*(?:[-*]|\d+[.)])\s*").expect("valid list regex"));
    reply
        .lines()
        .map(|l| marker.replace(l, "").trim().to_string())
        .filter(|l| !l.is_empty())
        .collect()
}

pub struct LlmJudge {
    llm: Arc<dyn LlmClient>,
    template: String,
}

impl LlmJudge {
    pub fn new(llm: Arc<dyn LlmClient>, template: impl Into<String>) -> Self {
        Self {
            llm,
            template: template.into(),
        }
    }
}

#[async_trait]
impl JudgmentService for LlmJudge {
    async fn evaluate(&self, state: &TaskState) -> Result<f64, ServiceError> {
        let prompt = self
            .template
            .replace("{plan}", &render_plan(&state.plan))
            .replace("{output}", state.current_output.as_deref().unwrap_or("(none)"));
        parse_score(&ask(&self.llm, prompt).await?)
    }
}

pub struct LlmDiagnostician {
    llm: Arc<dyn LlmClient>,
    template: String,
}

impl LlmDiagnostician {
    pub fn new(llm: Arc<dyn LlmClient>, template: impl Into<String>) -> Self {
        Self {
            llm,
            template: template.into(),
        }
    }
}

#[async_trait]
impl DiagnosisService for LlmDiagnostician {
    async fn diagnose(
        &self,
        failure: &FailureSignal,
        trace: &[TraceEntry],
    ) -> Result<Diagnosis, ServiceError> {
        let prompt = self
            .template
            .replace("{failure}", &failure.describe())
            .replace("{trace}", &render_trace(trace));
        let reply = ask(&self.llm, prompt).await?;
        if reply.trim().is_empty() {
            return Err(ServiceError::Malformed("empty diagnosis".to_string()));
        }
        Ok(parse_diagnosis(&reply))
    }
}

pub struct LlmRepairer {
    llm: Arc<dyn LlmClient>,
    template: String,
}

impl LlmRepairer {
    pub fn new(llm: Arc<dyn LlmClient>, template: impl Into<String>) -> Self {
        Self {
            llm,
            template: template.into(),
        }
    }
}

#[async_trait]
impl RepairService for LlmRepairer {
    async fn propose_repair(
        &self,
        diagnosis_report: &str,
        variables: &Variables,
    ) -> Result<RepairProgram, ServiceError> {
        let vars = serde_json::to_string(variables)
            .map_err(|e| ServiceError::Malformed(e.to_string()))?;
        let prompt = self
            .template
            .replace("{report}", diagnosis_report)
            .replace("{variables}", &vars)
            .replace("{schema}", &RepairProgram::schema_json());
        parse_repair_program(&ask(&self.llm, prompt).await?)
    }
}

pub struct LlmReplanner {
    llm: Arc<dyn LlmClient>,
    template: String,
}

impl LlmReplanner {
    pub fn new(llm: Arc<dyn LlmClient>, template: impl Into<String>) -> Self {
        Self {
            llm,
            template: template.into(),
        }
    }
}

#[async_trait]
impl ReplanService for LlmReplanner {
    async fn propose_replan(
        &self,
        diagnosis_report: &str,
        remaining_plan: &[String],
    ) -> Result<Vec<String>, ServiceError> {
        let prompt = self
            .template
            .replace("{report}", diagnosis_report)
            .replace("{remaining}", &render_plan(remaining_plan));
        Ok(parse_plan(&ask(&self.llm, prompt).await?))
    }
}

/// 用同一个 LLM 与配置模板构造四个适配器
pub fn llm_services(
    llm: Arc<dyn LlmClient>,
    prompts: &PromptsSection,
) -> (LlmJudge, LlmDiagnostician, LlmRepairer, LlmReplanner) {
    (
        LlmJudge::new(llm.clone(), prompts.judge.clone()),
        LlmDiagnostician::new(llm.clone(), prompts.diagnosis.clone()),
        LlmRepairer::new(llm.clone(), prompts.repair.clone()),
        LlmReplanner::new(llm, prompts.replan.clone()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use crate::recovery::RepairOp;

    #[test]
    fn test_parse_score() {
        assert_eq!(parse_score("Score: 4.5").unwrap(), 4.5);
        assert_eq!(parse_score("coherent output.\nscore=2").unwrap(), 2.0);
        assert!(parse_score("looks fine").is_err());
    }

    #[test]
    fn test_parse_diagnosis_tags() {
        assert_eq!(
            parse_diagnosis("variable `conn` holds a closed handle. TAG: STATE_FAULT").tag,
            FaultTag::StateFault
        );
        assert_eq!(
            parse_diagnosis("upstream API returned 503. TAG: EXTERNAL_FAULT").tag,
            FaultTag::ExternalFault
        );
        assert_eq!(parse_diagnosis("no idea").tag, FaultTag::ExternalFault);
    }

    #[test]
    fn test_parse_repair_program_from_fenced_block() {
        let reply = "Here is the fix:\n```json\n{\"ops\": [{\"op\": \"clear_variable\", \"key\": \"conn\"}]}\n```";
        let program = parse_repair_program(reply).unwrap();
        assert_eq!(program.ops, vec![RepairOp::ClearVariable { key: "conn".into() }]);
        assert!(parse_repair_program("state.conn = None").is_err());
    }

    #[test]
    fn test_parse_plan_strips_markers() {
        let plan = parse_plan("1. use cached data\n2) summarize\n- publish\n\n");
        assert_eq!(plan, vec!["use cached data", "summarize", "publish"]);
    }

    #[tokio::test]
    async fn test_default_prompts_with_mock_llm() {
        let llm: Arc<dyn LlmClient> = Arc::new(MockLlmClient);
        let (judge, diag, repair, replan) = llm_services(llm, &PromptsSection::default());

        let score = judge.evaluate(&TaskState::default()).await.unwrap();
        assert_eq!(score, 4.0);

        let d = diag.diagnose(&FailureSignal::Fault("boom".into()), &[]).await.unwrap();
        assert_eq!(d.tag, FaultTag::ExternalFault);

        let program = repair.propose_repair("x", &Variables::new()).await.unwrap();
        assert!(program.ops.is_empty());

        let plan = replan.propose_replan("x", &["a".to_string()]).await.unwrap();
        assert_eq!(plan.len(), 1);
    }
}
