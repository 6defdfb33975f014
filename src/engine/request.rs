//! 结构化后端回复的严格解析
//!
//! 每类请求只接受一种 JSON 形状。解析前只做两件事：去掉首尾空白、去掉最外层的一对 Markdown 代码围栏；
//! 剩余文本必须整体反序列化成功，否则返回 None。不会在自由文本里搜索花括号，也不会修补残缺 JSON。

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::engine::types::Strategy;

/// 工具调用服务能执行的动作（封闭集合）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionRequest {
    CreateDirectory { path: String },
    WriteFile { path: String, content: String },
    ListFiles { path: String },
    ReadFile { path: String },
    RunCommand { command: String },
}

impl ActionRequest {
    pub const NAMES: [&'static str; 5] = [
        "create_directory",
        "write_file",
        "list_files",
        "read_file",
        "run_command",
    ];

    pub fn action_name(&self) -> &'static str {
        match self {
            ActionRequest::CreateDirectory { .. } => "create_directory",
            ActionRequest::WriteFile { .. } => "write_file",
            ActionRequest::ListFiles { .. } => "list_files",
            ActionRequest::ReadFile { .. } => "read_file",
            ActionRequest::RunCommand { .. } => "run_command",
        }
    }

    pub fn args(&self) -> BTreeMap<String, String> {
        let mut args = BTreeMap::new();
        match self {
            ActionRequest::CreateDirectory { path }
            | ActionRequest::ListFiles { path }
            | ActionRequest::ReadFile { path } => {
                args.insert("path".to_string(), path.clone());
            }
            ActionRequest::WriteFile { path, content } => {
                args.insert("path".to_string(), path.clone());
                args.insert("content".to_string(), content.clone());
            }
            ActionRequest::RunCommand { command } => {
                args.insert("command".to_string(), command.clone());
            }
        }
        args
    }

    /// 由动作名与参数表构造；参数键必须与该动作要求的键集合完全一致
    pub fn from_parts(tool: &str, mut args: BTreeMap<String, String>) -> Option<Self> {
        let expected: &[&str] = match tool {
            "create_directory" | "list_files" | "read_file" => &["path"],
            "write_file" => &["content", "path"],
            "run_command" => &["command"],
            _ => return None,
        };
        if args.len() != expected.len() || !expected.iter().all(|k| args.contains_key(*k)) {
            return None;
        }
        let mut take = |key: &str| args.remove(key).unwrap_or_default();
        let request = match tool {
            "create_directory" => ActionRequest::CreateDirectory { path: take("path") },
            "list_files" => ActionRequest::ListFiles { path: take("path") },
            "read_file" => ActionRequest::ReadFile { path: take("path") },
            "write_file" => ActionRequest::WriteFile {
                path: take("path"),
                content: take("content"),
            },
            _ => ActionRequest::RunCommand { command: take("command") },
        };
        let required_non_empty = match &request {
            ActionRequest::CreateDirectory { path }
            | ActionRequest::ListFiles { path }
            | ActionRequest::ReadFile { path }
            | ActionRequest::WriteFile { path, .. } => path,
            ActionRequest::RunCommand { command } => command,
        };
        if required_non_empty.trim().is_empty() {
            return None;
        }
        Some(request)
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawActionRequest {
    tool: String,
    args: BTreeMap<String, String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStrategy {
    goal: String,
    estimated_total_steps: usize,
    approach: String,
    #[serde(default)]
    checkpoints: Vec<usize>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawChunk {
    steps: Vec<String>,
    #[serde(default)]
    complete: bool,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRecovery {
    diagnosis: String,
    steps: Vec<String>,
}

/// 规划器提出的下一批步骤文本
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkProposal {
    pub steps: Vec<String>,
    /// 规划器判断目标已完成
    pub complete: bool,
}

/// 恢复分析的诊断与补救步骤文本
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryPlan {
    pub diagnosis: String,
    pub steps: Vec<String>,
}

/// 去掉最外层的一对 ``` 围栏（可带语言标记），其他情况原样返回
fn strip_fence(raw: &str) -> &str {
    let t = raw.trim();
    let Some(rest) = t.strip_prefix("```") else {
        return t;
    };
    let Some(newline) = rest.find('\n') else {
        return t;
    };
    match rest[newline + 1..].trim_end().strip_suffix("```") {
        Some(body) => body.trim(),
        None => t,
    }
}

fn parse_exact<'a, T: Deserialize<'a>>(raw: &'a str) -> Option<T> {
    match serde_json::from_str(strip_fence(raw)) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::debug!(error = %e, "structured response rejected");
            None
        }
    }
}

pub fn parse_action_request(raw: &str) -> Option<ActionRequest> {
    let parsed: RawActionRequest = parse_exact(raw)?;
    ActionRequest::from_parts(&parsed.tool, parsed.args)
}

pub fn parse_strategy(raw: &str) -> Option<Strategy> {
    let parsed: RawStrategy = parse_exact(raw)?;
    if parsed.goal.trim().is_empty() || parsed.estimated_total_steps == 0 {
        return None;
    }
    let mut checkpoints = parsed.checkpoints;
    checkpoints.sort_unstable();
    checkpoints.dedup();
    Some(Strategy {
        goal_description: parsed.goal.trim().to_string(),
        estimated_total_steps: parsed.estimated_total_steps,
        approach_summary: parsed.approach.trim().to_string(),
        critical_checkpoints: checkpoints,
    })
}

/// 超过 max_steps 的部分被丢弃
pub fn parse_chunk(raw: &str, max_steps: usize) -> Option<ChunkProposal> {
    let parsed: RawChunk = parse_exact(raw)?;
    let mut steps: Vec<String> = parsed
        .steps
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if steps.len() > max_steps {
        tracing::warn!(proposed = steps.len(), max_steps, "chunk larger than allowed, truncating");
        steps.truncate(max_steps);
    }
    Some(ChunkProposal {
        steps,
        complete: parsed.complete,
    })
}

/// 超过 max_steps 的补救步骤被丢弃
pub fn parse_recovery(raw: &str, max_steps: usize) -> Option<RecoveryPlan> {
    let parsed: RawRecovery = parse_exact(raw)?;
    let mut steps: Vec<String> = parsed
        .steps
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    steps.truncate(max_steps);
    Some(RecoveryPlan {
        diagnosis: parsed.diagnosis.trim().to_string(),
        steps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_request_exact_shape() {
        let req = parse_action_request(r#"{"tool": "write_file", "args": {"path": "a.txt", "content": "x"}}"#)
            .unwrap();
        assert_eq!(
            req,
            ActionRequest::WriteFile {
                path: "a.txt".into(),
                content: "x".into()
            }
        );
        assert_eq!(req.action_name(), "write_file");
        assert_eq!(req.args().len(), 2);
    }

    #[test]
    fn action_request_inside_code_fence() {
        let raw = "```json\n{\"tool\": \"run_command\", \"args\": {\"command\": \"ls\"}}\n```";
        assert_eq!(
            parse_action_request(raw),
            Some(ActionRequest::RunCommand { command: "ls".into() })
        );
    }

    #[test]
    fn action_request_fails_closed() {
        let rejected = [
            // 前后夹杂说明文字
            r#"Sure! {"tool": "list_files", "args": {"path": "."}}"#,
            // 残缺括号
            r#"{"tool": "list_files", "args": {"path": "."}"#,
            // 未知工具
            r#"{"tool": "delete_everything", "args": {"path": "/"}}"#,
            // 缺参数
            r#"{"tool": "write_file", "args": {"path": "a"}}"#,
            // 多余参数
            r#"{"tool": "read_file", "args": {"path": "a", "mode": "r"}}"#,
            // 多余顶层字段
            r#"{"tool": "read_file", "args": {"path": "a"}, "why": "x"}"#,
            // 非字符串参数
            r#"{"tool": "read_file", "args": {"path": 3}}"#,
            // 空路径
            r#"{"tool": "read_file", "args": {"path": "  "}}"#,
            "",
        ];
        for raw in rejected {
            assert!(parse_action_request(raw).is_none(), "{raw}");
        }
    }

    #[test]
    fn strategy_parses_and_orders_checkpoints() {
        let raw = r#"{"goal": "Build site", "estimated_total_steps": 42, "approach": "scaffold then fill", "checkpoints": [30, 10, 10]}"#;
        let strategy = parse_strategy(raw).unwrap();
        assert_eq!(strategy.goal_description, "Build site");
        assert_eq!(strategy.estimated_total_steps, 42);
        assert_eq!(strategy.critical_checkpoints, vec![10, 30]);
    }

    #[test]
    fn strategy_rejects_bad_shapes() {
        assert!(parse_strategy("I think we should start by creating folders.").is_none());
        assert!(parse_strategy(r#"{"goal": "x", "estimated_total_steps": 0, "approach": "y"}"#).is_none());
        assert!(parse_strategy(r#"{"goal": "", "estimated_total_steps": 3, "approach": "y"}"#).is_none());
        assert!(parse_strategy(r#"{"goal": "x", "estimated_total_steps": "ten", "approach": "y"}"#).is_none());
    }

    #[test]
    fn chunk_truncates_to_max() {
        let steps: Vec<String> = (0..14).map(|i| format!("\"Create directory d{i}\"")).collect();
        let raw = format!(r#"{{"steps": [{}], "complete": false}}"#, steps.join(","));
        let chunk = parse_chunk(&raw, 10).unwrap();
        assert_eq!(chunk.steps.len(), 10);
        assert!(!chunk.complete);
    }

    #[test]
    fn chunk_complete_flag_defaults_false() {
        let chunk = parse_chunk(r#"{"steps": ["List files", "  "]}"#, 10).unwrap();
        assert_eq!(chunk.steps, vec!["List files".to_string()]);
        assert!(!chunk.complete);
        assert!(parse_chunk(r#"{"steps": "List files"}"#, 10).is_none());
    }

    #[test]
    fn recovery_plan_is_bounded() {
        let raw = r#"{"diagnosis": "parent dirs missing", "steps": ["Create directory a", "Create directory b", "Create directory c"]}"#;
        let plan = parse_recovery(raw, 2).unwrap();
        assert_eq!(plan.diagnosis, "parent dirs missing");
        assert_eq!(plan.steps.len(), 2);
        assert!(parse_recovery(r#"{"steps": []}"#, 5).is_none());
    }
}
