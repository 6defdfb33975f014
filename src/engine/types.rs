use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::llm::Tier;

/// 步骤动作类型（封闭集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ActionType {
    CreateDirectory,
    CreateFile,
    ListFiles,
    ReadFile,
    RunCommand,
    CountFiles,
    /// 规则未命中，执行时再交给后端解释 raw_text
    Unknown,
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActionType::CreateDirectory => "CreateDirectory",
            ActionType::CreateFile => "CreateFile",
            ActionType::ListFiles => "ListFiles",
            ActionType::ReadFile => "ReadFile",
            ActionType::RunCommand => "RunCommand",
            ActionType::CountFiles => "CountFiles",
            ActionType::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

/// 一个工作单元；由分类器创建后不可变
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Step {
    /// 1 起始，在一次运行内单调且不复用
    pub ordinal: usize,
    pub raw_text: String,
    pub action: ActionType,
    pub target: Option<String>,
    /// 要写入的内容，或命令文本
    pub content: Option<String>,
}

impl Step {
    pub fn unknown(ordinal: usize, raw_text: impl Into<String>) -> Self {
        Self {
            ordinal,
            raw_text: raw_text.into(),
            action: ActionType::Unknown,
            target: None,
            content: None,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}. {}", self.ordinal, self.action)?;
        match (&self.target, &self.content) {
            (Some(t), Some(c)) => write!(f, "({}, {:?})", t, c),
            (Some(t), None) => write!(f, "({})", t),
            (None, Some(c)) => write!(f, "({:?})", c),
            (None, None) => write!(f, "({:?})", self.raw_text),
        }
    }
}

/// 单次尝试的结果；每次尝试（含重试）都会产生一条，只追加不修改
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub step_ordinal: usize,
    /// 从 1 开始
    pub attempt: u32,
    pub tier: Tier,
    pub succeeded: bool,
    pub error_text: Option<String>,
    /// 工具成功时返回的确认文本
    pub output: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// 一个步骤的全部尝试，最后一条即最终结果
#[derive(Debug, Clone)]
pub struct StepRun {
    pub step: Step,
    pub attempts: Vec<ExecutionOutcome>,
}

impl StepRun {
    pub fn succeeded(&self) -> bool {
        self.attempts.last().map(|o| o.succeeded).unwrap_or(false)
    }

    pub fn last_error(&self) -> Option<&str> {
        self.attempts
            .iter()
            .rev()
            .find_map(|o| o.error_text.as_deref())
    }
}

/// 大任务的一次性总体规划（最高档位生成，之后只读）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Strategy {
    pub goal_description: String,
    pub estimated_total_steps: usize,
    pub approach_summary: String,
    pub critical_checkpoints: Vec<usize>,
}

/// 规划器在运行中提出的一批步骤；执行后即丢弃，结果留在日志里
#[derive(Debug, Clone)]
pub struct Chunk {
    pub chunk_id: u64,
    pub steps: Vec<Step>,
}

/// 本次运行走的执行路径
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// 没有可执行的步骤
    Empty,
    Sequential,
    Adaptive,
    /// 策略生成失败，退回顺序执行
    FallbackSequential,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunMode::Empty => "empty",
            RunMode::Sequential => "sequential",
            RunMode::Adaptive => "adaptive",
            RunMode::FallbackSequential => "fallback-sequential",
        };
        f.write_str(name)
    }
}

/// 最终完成报告（用户只会看到计数，不会看到原始异常）
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub goal: String,
    pub mode: RunMode,
    pub completed: usize,
    pub failed: usize,
    pub adaptation_count: usize,
    pub chunk_cycles: usize,
    pub cancelled: bool,
    pub backend_calls: Vec<(Tier, usize)>,
    pub token_usage: (u64, u64, u64),
}

impl RunReport {
    pub fn nothing_to_execute(&self) -> bool {
        self.mode == RunMode::Empty
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.nothing_to_execute() {
            return writeln!(f, "Nothing to execute: no numbered steps found in the instruction.");
        }
        writeln!(f, "Run {} ({})", self.run_id, self.mode)?;
        writeln!(f, "  Goal:        {}", self.goal)?;
        writeln!(f, "  Completed:   {}", self.completed)?;
        writeln!(f, "  Failed:      {}", self.failed)?;
        writeln!(f, "  Adaptations: {}", self.adaptation_count)?;
        if self.mode == RunMode::Adaptive {
            writeln!(f, "  Chunks:      {}", self.chunk_cycles)?;
        }
        let calls: Vec<String> = self
            .backend_calls
            .iter()
            .map(|(tier, n)| format!("{}={}", tier, n))
            .collect();
        writeln!(f, "  Backend:     {}", calls.join(" "))?;
        let (prompt, completion, total) = self.token_usage;
        if total > 0 {
            writeln!(f, "  Tokens:      {} (prompt {}, completion {})", total, prompt, completion)?;
        }
        if self.cancelled {
            writeln!(f, "  Cancelled before all steps ran.")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(ok: bool, err: Option<&str>) -> ExecutionOutcome {
        ExecutionOutcome {
            step_ordinal: 1,
            attempt: 1,
            tier: Tier::Fast,
            succeeded: ok,
            error_text: err.map(String::from),
            output: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn step_run_reports_last_attempt() {
        let run = StepRun {
            step: Step::unknown(1, "do it"),
            attempts: vec![outcome(false, Some("boom")), outcome(true, None)],
        };
        assert!(run.succeeded());
        assert_eq!(run.last_error(), Some("boom"));
    }

    #[test]
    fn empty_step_run_is_failure() {
        let run = StepRun {
            step: Step::unknown(1, "x"),
            attempts: vec![],
        };
        assert!(!run.succeeded());
    }

    #[test]
    fn empty_report_says_nothing_to_execute() {
        let report = RunReport {
            run_id: "r".into(),
            goal: String::new(),
            mode: RunMode::Empty,
            completed: 0,
            failed: 0,
            adaptation_count: 0,
            chunk_cycles: 0,
            cancelled: false,
            backend_calls: vec![],
            token_usage: (0, 0, 0),
        };
        assert!(report.to_string().starts_with("Nothing to execute"));
    }

    #[test]
    fn step_display_shows_target_and_content() {
        let step = Step {
            ordinal: 2,
            raw_text: "Create file a.txt with \"hi\"".into(),
            action: ActionType::CreateFile,
            target: Some("a.txt".into()),
            content: Some("hi".into()),
        };
        assert_eq!(step.to_string(), "2. CreateFile(a.txt, \"hi\")");
    }
}
