//! Mock LLM 客户端（用于演示，无需 API）
//!
//! 根据最后一条 User 消息的内容返回对应角色的固定回答：评分、诊断、修复程序或新计划。

use async_trait::async_trait;

use crate::llm::{LlmClient, Message, Role};

/// Mock 客户端：按 prompt 类型给出固定回答
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");

        let reply = if last_user.contains("JSON Schema") {
            r#"{"ops": []}"#.to_string()
        } else if last_user.contains("Score:") {
            "Score: 4.0".to_string()
        } else if last_user.contains("STATE_FAULT") {
            "Root cause could not be isolated from the trace.\nTAG: EXTERNAL_FAULT".to_string()
        } else {
            "retry the remaining work with an alternative approach".to_string()
        };
        Ok(reply)
    }
}
