//! DeepSeek 后端（OpenAI 兼容格式，base URL https://api.deepseek.com）

use crate::llm::OpenAiClient;

pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const DEEPSEEK_CHAT: &str = "deepseek-chat";

/// 使用 `DEEPSEEK_API_KEY` 创建客户端
pub fn create_deepseek_client(model: Option<&str>) -> OpenAiClient {
    let key = std::env::var("DEEPSEEK_API_KEY").ok();
    OpenAiClient::new(
        Some(DEEPSEEK_BASE_URL),
        model.unwrap_or(DEEPSEEK_CHAT),
        key.as_deref(),
    )
}
