//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / execute），由 ToolRegistry 按名注册与查找，
//! ToolExecutor 在调用时加超时并输出审计日志。参数统一为字符串键值表。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、异步执行
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（即动作名，如 write_file）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认无参数
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 执行工具；失败返回错误文本
    async fn execute(&self, args: &BTreeMap<String, String>) -> Result<String, String>;
}

/// 从参数表取必填字符串
pub fn required_arg<'a>(args: &'a BTreeMap<String, String>, key: &str) -> Result<&'a str, String> {
    args.get(key)
        .map(String::as_str)
        .ok_or_else(|| format!("Missing required parameter: {key}"))
}

/// 工具注册表：按名称存储 Arc<dyn Tool>
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub async fn execute(&self, name: &str, args: &BTreeMap<String, String>) -> Result<String, String> {
        let tool = self.get(name).ok_or_else(|| format!("Unknown tool: {name}"))?;
        tool.execute(args).await
    }

    /// 按名称排序，保证 prompt 稳定
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// 动态生成工具 schema JSON（名称、描述、参数），拼入解释未知步骤的 prompt
    pub fn to_schema_json(&self) -> String {
        let tools: Vec<Value> = self
            .tool_names()
            .iter()
            .filter_map(|name| self.tools.get(name).map(|tool| (name, tool)))
            .map(|(name, tool)| {
                serde_json::json!({
                    "name": name,
                    "description": tool.description(),
                    "parameters": tool.parameters_schema()
                })
            })
            .collect();
        serde_json::to_string_pretty(&tools).unwrap_or_else(|_| "[]".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Upper;

    #[async_trait]
    impl Tool for Upper {
        fn name(&self) -> &str {
            "upper"
        }

        fn description(&self) -> &str {
            "Uppercase text"
        }

        async fn execute(&self, args: &BTreeMap<String, String>) -> Result<String, String> {
            Ok(required_arg(args, "text")?.to_uppercase())
        }
    }

    #[tokio::test]
    async fn executes_registered_tool() {
        let mut registry = ToolRegistry::new();
        registry.register(Upper);
        let mut args = BTreeMap::new();
        args.insert("text".to_string(), "hi".to_string());
        assert_eq!(registry.execute("upper", &args).await.unwrap(), "HI");
        assert_eq!(
            registry.execute("upper", &BTreeMap::new()).await.unwrap_err(),
            "Missing required parameter: text"
        );
    }

    #[tokio::test]
    async fn unknown_tool_is_error() {
        let registry = ToolRegistry::new();
        let err = registry.execute("nope", &BTreeMap::new()).await.unwrap_err();
        assert!(err.contains("Unknown tool"));
    }

    #[test]
    fn schema_lists_tools() {
        let mut registry = ToolRegistry::new();
        registry.register(Upper);
        let schema = registry.to_schema_json();
        assert!(schema.contains("\"upper\""));
        assert!(schema.contains("Uppercase text"));
    }
}
