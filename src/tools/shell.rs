//! Shell 执行器：白名单命令，禁止危险操作
//!
//! 管道与 `&&` / `||` / `;` 连接的每一段，首词都必须在白名单内；禁止 rm -rf、wget、chmod 777 等子串。
//! 执行通过 sh -c，工作目录固定为工作区根目录，带超时与 tracing 审计。

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use crate::tools::registry::required_arg;
use crate::tools::Tool;

/// 禁止的命令/子串（即使白名单中有同名，也不允许带这些参数）
const FORBIDDEN_SUBSTR: &[&str] = &[
    "rm -rf",
    "rm -fr",
    "rm -r",
    "wget ",
    "curl | sh",
    "chmod 777",
    "chmod +s",
    "mkfs",
    "dd if=",
    "> /dev/sd",
    ":(){ :|:& };:", // fork bomb
];

/// 默认白名单（配置未给出时使用）；步骤分类器也据此判断片段是否是一条命令
pub const DEFAULT_ALLOWED_COMMANDS: &[&str] = &[
    "ls", "cat", "head", "tail", "wc", "find", "grep", "echo", "printf", "pwd", "mkdir", "touch",
    "cp", "mv", "sort", "uniq", "diff", "sed", "awk", "du", "df", "tar", "zip", "unzip", "python",
    "python3", "node", "npm", "npx", "cargo", "rustc", "git", "bash", "sh", "chmod", "test", "true",
];

pub fn default_allowed_commands() -> Vec<String> {
    DEFAULT_ALLOWED_COMMANDS.iter().map(|s| s.to_string()).collect()
}

/// Shell 工具：仅允许白名单内命令
pub struct ShellTool {
    allowed_commands: HashSet<String>,
    timeout_secs: u64,
    working_dir: PathBuf,
}

impl ShellTool {
    pub fn new(allowed_commands: Vec<String>, timeout_secs: u64, working_dir: impl Into<PathBuf>) -> Self {
        let allowed_commands = allowed_commands
            .into_iter()
            .map(|s| s.to_lowercase())
            .collect();
        Self {
            allowed_commands,
            timeout_secs,
            working_dir: working_dir.into(),
        }
    }

    /// 按 `|`、`&&`、`||`、`;`、`&` 与换行切分出各段命令；引号内的分隔符与 `2>&1`、`&>` 之类的重定向不切
    fn segments(raw: &str) -> Vec<&str> {
        let bytes = raw.as_bytes();
        let mut out = Vec::new();
        let mut quote: Option<u8> = None;
        let mut start = 0;
        for (i, &b) in bytes.iter().enumerate() {
            if let Some(q) = quote {
                if b == q {
                    quote = None;
                }
                continue;
            }
            let boundary = match b {
                b'\'' | b'"' => {
                    quote = Some(b);
                    false
                }
                b'|' | b';' | b'\n' => true,
                b'&' => {
                    let prev = i.checked_sub(1).map(|j| bytes[j]);
                    !matches!(prev, Some(b'>' | b'<')) && bytes.get(i + 1) != Some(&b'>')
                }
                _ => false,
            };
            if boundary {
                out.push(raw[start..i].trim());
                start = i + 1;
            }
        }
        out.push(raw[start..].trim());
        out.retain(|s| !s.is_empty());
        out
    }

    /// 段首的命令名；跳过 `VAR=value` 形式的环境变量前缀
    fn command_name(segment: &str) -> &str {
        segment
            .split_whitespace()
            .find(|tok| !tok.contains('='))
            .unwrap_or("")
    }

    fn is_allowed(&self, raw: &str) -> Result<(), String> {
        let raw_lower = raw.to_lowercase();
        for forbidden in FORBIDDEN_SUBSTR {
            if raw_lower.contains(forbidden) {
                return Err(format!("Forbidden pattern: {}", forbidden));
            }
        }
        if raw_lower.contains("$(") || raw_lower.contains('`') {
            return Err("Command substitution is not allowed".to_string());
        }
        let segments = Self::segments(&raw_lower);
        if segments.is_empty() {
            return Err("Empty command".to_string());
        }
        for segment in segments {
            let name = Self::command_name(segment);
            // `wc -l < file` 之类的重定向段
            let name = name.trim_start_matches(['<', '>']);
            if name.is_empty() {
                continue;
            }
            if !self.allowed_commands.contains(name) {
                return Err(format!("Command '{}' not in allowlist", name));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "run_command"
    }

    fn description(&self) -> &str {
        "Run a whitelisted shell command in the workspace directory. Pipes and && are allowed when every command is whitelisted."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute (must be in allowlist)"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, args: &BTreeMap<String, String>) -> Result<String, String> {
        let command = required_arg(args, "command")?.trim();
        self.is_allowed(command)?;

        tracing::info!(command = %command, "shell tool execute");

        let mut cmd = Command::new("sh");
        cmd.args(["-c", command]).current_dir(&self.working_dir);
        cmd.kill_on_drop(true);

        let output = tokio::time::timeout(
            std::time::Duration::from_secs(self.timeout_secs),
            cmd.output(),
        )
        .await
        .map_err(|_| format!("Command timed out after {}s", self.timeout_secs))?
        .map_err(|e| format!("Execution failed: {}", e))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if !output.status.success() {
            return Err(format!("Exit {:?}\nstderr: {}", output.status.code(), stderr.trim()));
        }
        Ok(if stderr.is_empty() {
            stdout
        } else {
            format!("{}\nstderr: {}", stdout.trim(), stderr.trim())
        })
    }
}
