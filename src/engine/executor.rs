//! 步骤执行器
//!
//! 已识别的步骤直接确定性地映射成动作请求；Unknown 步骤在选定档位上请后端给出一个结构化动作请求，
//! 严格解析后原样转交工具调用服务。每次尝试都记录一条 ExecutionOutcome，失败后按档位选择器升级并重试，
//! 达到尝试上限后以数据形式返回失败，不会抛错中断整个运行。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::core::{EngineError, FailureRecord, ProgressState};
use crate::engine::request::{parse_action_request, ActionRequest};
use crate::engine::selector::StrategySelector;
use crate::engine::types::{ActionType, ExecutionOutcome, Step, StepRun};
use crate::llm::{CompletionBackend, Tier};
use crate::tools::{action_request_schema_json, ToolInvoker};

/// 一批步骤的执行汇总
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    pub attempted: usize,
    pub succeeded: usize,
    /// 本批次内最终失败的步骤
    pub failures: Vec<FailureRecord>,
    pub cancelled: bool,
}

impl BatchResult {
    /// succeeded / attempted；空批次视为 1.0
    pub fn success_rate(&self) -> f64 {
        if self.attempted == 0 {
            1.0
        } else {
            self.succeeded as f64 / self.attempted as f64
        }
    }
}

pub struct StepExecutor {
    backend: Arc<dyn CompletionBackend>,
    tools: Arc<dyn ToolInvoker>,
    selector: StrategySelector,
    max_attempts: u32,
    step_delay: Duration,
}

impl StepExecutor {
    pub fn new(
        backend: Arc<dyn CompletionBackend>,
        tools: Arc<dyn ToolInvoker>,
        selector: StrategySelector,
        max_attempts: u32,
        step_delay: Duration,
    ) -> Self {
        Self {
            backend,
            tools,
            selector,
            max_attempts: max_attempts.max(1),
            step_delay,
        }
    }

    /// 执行一个步骤（含重试）；永不返回错误，失败体现在 StepRun 的最后一条结果里
    pub async fn execute(&self, step: &Step, progress: &ProgressState) -> StepRun {
        let mut attempts: Vec<ExecutionOutcome> = Vec::new();
        let known = render_known(step);
        tracing::debug!(
            ordinal = step.ordinal,
            path = ?self.selector.escalation_path(step.action, self.max_attempts),
            "tier escalation path"
        );

        for attempt in 1..=self.max_attempts {
            let tier = self.selector.select(step.action, attempt - 1);
            tracing::info!(ordinal = step.ordinal, attempt, tier = %tier, action = %step.action, "executing step");

            let result = match &known {
                Some(requests) => self.invoke_all(requests).await,
                None => {
                    let previous_error = attempts.last().and_then(|o| o.error_text.as_deref());
                    self.interpret_and_invoke(step, tier, progress, previous_error).await
                }
            };

            let (succeeded, output, error_text) = match result {
                Ok(output) => (true, Some(output), None),
                Err(e) => {
                    tracing::warn!(ordinal = step.ordinal, attempt, tier = %tier, error = %e, "step attempt failed");
                    (false, None, Some(e))
                }
            };
            attempts.push(ExecutionOutcome {
                step_ordinal: step.ordinal,
                attempt,
                tier,
                succeeded,
                error_text,
                output,
                timestamp: Utc::now(),
            });
            if succeeded {
                break;
            }
        }

        let run = StepRun {
            step: step.clone(),
            attempts,
        };
        if !run.succeeded() {
            let err = EngineError::CeilingExceeded {
                ordinal: step.ordinal,
                attempts: self.max_attempts,
            };
            tracing::warn!(error = %err, last_error = run.last_error().unwrap_or(""), "step permanently failed");
        }
        run
    }

    /// 依次执行一批步骤并写入进度；每步之前检查取消，相邻步骤之间等待 step_delay
    pub async fn run_batch(
        &self,
        steps: &[Step],
        progress: &mut ProgressState,
        cancel: &CancellationToken,
    ) -> BatchResult {
        let mut result = BatchResult::default();
        for (i, step) in steps.iter().enumerate() {
            if cancel.is_cancelled() {
                result.cancelled = true;
                break;
            }
            if i > 0 && !self.step_delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        result.cancelled = true;
                        break;
                    }
                    _ = tokio::time::sleep(self.step_delay) => {}
                }
            }

            let run = self.execute(step, progress).await;
            result.attempted += 1;
            match progress.record(&run) {
                None => result.succeeded += 1,
                Some(failure) => result.failures.push(failure),
            }
        }
        if result.cancelled {
            tracing::warn!(executed = result.attempted, total = steps.len(), "run cancelled between steps");
        }
        result
    }

    async fn invoke_all(&self, requests: &[ActionRequest]) -> Result<String, String> {
        let mut output = String::new();
        for request in requests {
            output = self
                .tools
                .invoke(request.action_name(), &request.args())
                .await?;
        }
        Ok(output)
    }

    /// 请后端把原文翻译成一个动作请求，解析成功后交给工具调用服务
    async fn interpret_and_invoke(
        &self,
        step: &Step,
        tier: Tier,
        progress: &ProgressState,
        previous_error: Option<&str>,
    ) -> Result<String, String> {
        let system = interpret_system_prompt(&self.tools.describe());
        let mut user = format!("Overall goal: {}\nStep: {}", progress.goal(), step.raw_text);
        if let Some(err) = previous_error {
            user.push_str(&format!("\nThe previous attempt failed with: {}", err));
        }

        let raw = self
            .backend
            .complete(tier, &system, &user)
            .await
            .map_err(|e| {
                tracing::warn!(tier = %tier, transient = e.is_transient(), "backend request failed");
                EngineError::from(e).to_string()
            })?;
        tracing::debug!(ordinal = step.ordinal, tier = %tier, response = %raw, "interpretation response");

        let request = parse_action_request(&raw)
            .ok_or_else(|| EngineError::BackendParseFailure(preview(&raw)).to_string())?;
        tracing::info!(ordinal = step.ordinal, action = request.action_name(), "interpreted unknown step");
        self.invoke_all(std::slice::from_ref(&request)).await
    }
}

/// 已识别步骤的确定性映射；缺少必需字段时返回 None，退回后端解释
pub fn render_known(step: &Step) -> Option<Vec<ActionRequest>> {
    let target = step.target.as_deref().map(str::trim).filter(|t| !t.is_empty());
    let content = step.content.as_deref();
    let requests = match step.action {
        ActionType::CreateDirectory => vec![ActionRequest::CreateDirectory {
            path: target?.to_string(),
        }],
        ActionType::CreateFile => {
            let path = target?;
            let mut requests = Vec::new();
            if let Some(parent) = parent_dir(path) {
                requests.push(ActionRequest::CreateDirectory {
                    path: parent.to_string(),
                });
            }
            requests.push(ActionRequest::WriteFile {
                path: path.to_string(),
                content: content.unwrap_or_default().to_string(),
            });
            requests
        }
        ActionType::ListFiles => vec![ActionRequest::ListFiles {
            path: target.unwrap_or(".").to_string(),
        }],
        ActionType::ReadFile => vec![ActionRequest::ReadFile {
            path: target?.to_string(),
        }],
        ActionType::RunCommand | ActionType::CountFiles => {
            let command = content.map(str::trim).filter(|c| !c.is_empty())?;
            vec![ActionRequest::RunCommand {
                command: command.to_string(),
            }]
        }
        ActionType::Unknown => return None,
    };
    Some(requests)
}

/// 含路径分隔符时的父目录部分
fn parent_dir(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    let idx = trimmed.rfind('/')?;
    let parent = trimmed[..idx].trim_end_matches('/');
    if parent.is_empty() || parent == "." {
        None
    } else {
        Some(parent)
    }
}

fn interpret_system_prompt(tool_details: &str) -> String {
    let mut prompt = format!(
        "You turn one task step into exactly one action request for a sandboxed workspace.\n\
         Available actions: {}.\n\
         Arguments: create_directory/list_files/read_file take \"path\"; write_file takes \"path\" and \"content\"; run_command takes \"command\".\n\
         Respond with a single JSON object and nothing else, matching this schema:\n{}",
        ActionRequest::NAMES.join(", "),
        action_request_schema_json()
    );
    if !tool_details.trim().is_empty() {
        prompt.push_str("\n\nTool details:\n");
        prompt.push_str(tool_details);
    }
    prompt
}

fn preview(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.chars().count() > 120 {
        format!("{}...", trimmed.chars().take(120).collect::<String>())
    } else {
        trimmed.to_string()
    }
}
