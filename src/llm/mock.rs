//! Mock LLM 客户端（无需 API）
//!
//! 回显最后一条 User 消息的纯文本，不产生任何结构化输出：
//! 策略请求因此解析失败，引擎退回顺序执行；可确定映射的步骤照常执行，未知步骤记为失败。

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError, Message, Role};

/// Mock 客户端：回显用户最后一条消息
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");

        Ok(format!("Echo from Mock: {}", last_user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echoes_last_user_message() {
        let out = MockLlmClient
            .complete(&[Message::system("sys"), Message::user("a"), Message::user("b")])
            .await
            .unwrap();
        assert_eq!(out, "Echo from Mock: b");
    }
}
