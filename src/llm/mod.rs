//! LLM 层：客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）

pub mod deepseek;
pub mod message;
pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;

use crate::config::LlmSection;

pub use deepseek::{create_deepseek_client, DEEPSEEK_CHAT};
pub use message::{Message, Role};
pub use mock::MockLlmClient;
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::LlmClient;

/// 根据配置与环境变量选择 LLM 后端（DeepSeek / OpenAI 兼容 / Mock）
pub fn create_llm_from_config(cfg: &LlmSection) -> Arc<dyn LlmClient> {
    match cfg.provider.to_lowercase().as_str() {
        "deepseek" if std::env::var("DEEPSEEK_API_KEY").is_ok() => {
            let model = cfg.model.as_deref().unwrap_or(DEEPSEEK_CHAT);
            tracing::info!("Using DeepSeek LLM ({})", model);
            Arc::new(create_deepseek_client(Some(model)))
        }
        "openai" if std::env::var("OPENAI_API_KEY").is_ok() => {
            let model = cfg.model.as_deref().unwrap_or("gpt-4o-mini");
            tracing::info!("Using OpenAI LLM ({})", model);
            Arc::new(OpenAiClient::new(cfg.base_url.as_deref(), model, None))
        }
        "mock" => Arc::new(MockLlmClient),
        other => {
            tracing::warn!("No API key set for provider '{}', using Mock LLM", other);
            Arc::new(MockLlmClient)
        }
    }
}
