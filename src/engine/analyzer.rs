//! 恢复分析器
//!
//! 分块成功率过低时，把本分块的失败记录（序号、原文、错误文本）交给最高档位诊断，
//! 取回一小批补救步骤。回复解析失败或没有步骤时返回 None，调用方不做补救直接继续。

use std::sync::Arc;

use crate::core::{FailureRecord, ProgressState};
use crate::engine::classifier::classify_fragment;
use crate::engine::request::parse_recovery;
use crate::engine::types::Step;
use crate::llm::{CompletionBackend, Tier};

const RECOVERY_SYSTEM_PROMPT: &str = "Some steps of a batch failed while working in a sandboxed workspace. \
Diagnose the common cause and propose a few concrete remediation steps, each a short imperative sentence \
(for example \"Create directory app/static\" or \"Run `pip install -r requirements.txt`\").\n\
Respond with a single JSON object and nothing else:\n\
{\"diagnosis\": string, \"steps\": [string]}";

/// 失败文本在 prompt 中的最大长度
const MAX_ERROR_CHARS: usize = 300;

pub struct RecoveryAnalyzer {
    backend: Arc<dyn CompletionBackend>,
    tier: Tier,
    max_steps: usize,
}

impl RecoveryAnalyzer {
    pub fn new(backend: Arc<dyn CompletionBackend>, tier: Tier, max_steps: usize) -> Self {
        Self {
            backend,
            tier,
            max_steps,
        }
    }

    /// 返回补救步骤（序号从进度状态分配）；无法得到可用结果时返回 None
    pub async fn analyze(&self, failures: &[FailureRecord], progress: &mut ProgressState) -> Option<Vec<Step>> {
        if failures.is_empty() || self.max_steps == 0 {
            return None;
        }

        let mut user = format!("Goal: {}\n\nFailed steps:\n", progress.goal());
        for f in failures {
            user.push_str(&format!(
                "- step {}: {}\n  error: {}\n",
                f.step_ordinal,
                f.raw_text,
                truncate(&f.error_text, MAX_ERROR_CHARS)
            ));
        }

        let raw = match self.backend.complete(self.tier, RECOVERY_SYSTEM_PROMPT, &user).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(error = %e, "recovery request failed, continuing without remediation");
                return None;
            }
        };
        tracing::debug!(response = %raw, "recovery response");

        let Some(plan) = parse_recovery(&raw, self.max_steps) else {
            tracing::warn!("recovery response unparseable, continuing without remediation");
            return None;
        };
        if plan.steps.is_empty() {
            return None;
        }
        tracing::info!(diagnosis = %plan.diagnosis, steps = plan.steps.len(), "recovery plan received");

        Some(
            plan.steps
                .iter()
                .map(|text| classify_fragment(progress.allocate_ordinal(), text))
                .collect(),
        )
    }
}

fn truncate(text: &str, max: usize) -> String {
    let flat = text.replace('\n', " ");
    if flat.chars().count() > max {
        format!("{}...", flat.chars().take(max).collect::<String>())
    } else {
        flat
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::engine::types::ActionType;
    use crate::llm::LlmError;

    struct Fixed {
        reply: &'static str,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CompletionBackend for Fixed {
        async fn complete(&self, _tier: Tier, _system: &str, user: &str) -> Result<String, LlmError> {
            self.prompts.lock().unwrap().push(user.to_string());
            Ok(self.reply.to_string())
        }
    }

    fn fixed(reply: &'static str) -> Arc<Fixed> {
        Arc::new(Fixed {
            reply,
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn failure(ordinal: usize) -> FailureRecord {
        FailureRecord {
            step_ordinal: ordinal,
            raw_text: format!("Create file app/f{ordinal}.txt with \"x\""),
            error_text: "Parent directory does not exist".into(),
        }
    }

    #[tokio::test]
    async fn remediation_steps_are_classified() {
        let backend = fixed(r#"{"diagnosis": "app missing", "steps": ["Create directory app"]}"#);
        let analyzer = RecoveryAnalyzer::new(backend.clone(), Tier::Heavyweight, 5);
        let mut progress = ProgressState::new("g");
        progress.reserve_ordinals(10);

        let steps = analyzer.analyze(&[failure(3), failure(4)], &mut progress).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].action, ActionType::CreateDirectory);
        assert_eq!(steps[0].ordinal, 11);

        let prompt = &backend.prompts.lock().unwrap()[0];
        assert!(prompt.contains("step 3"));
        assert!(prompt.contains("Parent directory does not exist"));
    }

    #[tokio::test]
    async fn unparseable_reply_yields_nothing() {
        let analyzer = RecoveryAnalyzer::new(fixed("Try creating the directory first."), Tier::Heavyweight, 5);
        let mut progress = ProgressState::new("g");
        assert!(analyzer.analyze(&[failure(1)], &mut progress).await.is_none());
    }

    #[tokio::test]
    async fn empty_failures_skip_backend() {
        let backend = fixed("{}");
        let analyzer = RecoveryAnalyzer::new(backend.clone(), Tier::Heavyweight, 5);
        let mut progress = ProgressState::new("g");
        assert!(analyzer.analyze(&[], &mut progress).await.is_none());
        assert!(backend.prompts.lock().unwrap().is_empty());
    }
}
