//! 动作请求 JSON Schema 生成（schemars）
//!
//! 解释 Unknown 步骤时把「合法动作请求」的 JSON 结构拼入 system prompt，减少后端输出格式错误。

use schemars::{schema_for, JsonSchema};
use std::collections::BTreeMap;

/// 动作请求格式：与 `{"tool": "...", "args": {...}}` 一致（仅用于 Schema 生成）
#[allow(dead_code)]
#[derive(JsonSchema)]
#[schemars(deny_unknown_fields)]
struct ActionRequestFormat {
    /// 动作名：create_directory、write_file、list_files、read_file、run_command 之一
    pub tool: String,
    /// 动作参数，值一律为字符串（path、content、command）
    pub args: BTreeMap<String, String>,
}

/// 返回动作请求的 JSON Schema 字符串，可拼入 system prompt
pub fn action_request_schema_json() -> String {
    let schema = schema_for!(ActionRequestFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_else(|_| String::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_names_both_fields() {
        let schema = action_request_schema_json();
        assert!(schema.contains("\"tool\""));
        assert!(schema.contains("\"args\""));
        assert!(schema.contains("additionalProperties"));
    }
}
