//! 运行进度状态
//!
//! 每条顶层指令一个 ProgressState，由编排器 / 自适应循环独占写入；执行器与档位选择只读。
//! 完成数、适配次数只增不减；每条成功的尝试恰好对应一次完成计数。

use crate::engine::types::{ExecutionOutcome, StepRun, Strategy};

/// 一个最终失败的步骤（交给恢复分析）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    pub step_ordinal: usize,
    /// 步骤原文 / 请求的动作
    pub raw_text: String,
    pub error_text: String,
}

/// 单次运行的可变进度记录
#[derive(Debug, Clone)]
pub struct ProgressState {
    goal: String,
    strategy: Option<Strategy>,
    completed: usize,
    failures: Vec<FailureRecord>,
    adaptation_count: usize,
    outcome_log: Vec<ExecutionOutcome>,
    next_ordinal: usize,
}

impl ProgressState {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            strategy: None,
            completed: 0,
            failures: Vec::new(),
            adaptation_count: 0,
            outcome_log: Vec::new(),
            next_ordinal: 1,
        }
    }

    pub fn goal(&self) -> &str {
        &self.goal
    }

    pub fn strategy(&self) -> Option<&Strategy> {
        self.strategy.as_ref()
    }

    pub fn set_strategy(&mut self, strategy: Strategy) {
        self.goal = strategy.goal_description.clone();
        self.strategy = Some(strategy);
    }

    pub fn completed(&self) -> usize {
        self.completed
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    pub fn adaptation_count(&self) -> usize {
        self.adaptation_count
    }

    pub fn outcome_log(&self) -> &[ExecutionOutcome] {
        &self.outcome_log
    }

    /// 已分类步骤占用的序号之后继续编号
    pub fn reserve_ordinals(&mut self, used_up_to: usize) {
        self.next_ordinal = self.next_ordinal.max(used_up_to + 1);
    }

    /// 为分块 / 补救步骤分配新序号（单调，不复用）
    pub fn allocate_ordinal(&mut self) -> usize {
        let ordinal = self.next_ordinal;
        self.next_ordinal += 1;
        ordinal
    }

    /// 记录一个步骤的全部尝试；成功则完成数 +1，否则追加失败记录。返回新增的失败记录
    pub fn record(&mut self, run: &StepRun) -> Option<FailureRecord> {
        self.outcome_log.extend(run.attempts.iter().cloned());
        if run.succeeded() {
            self.completed += 1;
            None
        } else {
            let record = FailureRecord {
                step_ordinal: run.step.ordinal,
                raw_text: run.step.raw_text.clone(),
                error_text: run
                    .last_error()
                    .unwrap_or("step was not attempted")
                    .to_string(),
            };
            self.failures.push(record.clone());
            Some(record)
        }
    }

    pub fn record_adaptation(&mut self) {
        self.adaptation_count += 1;
    }

    /// 完成数从 since 增长到当前值的过程中越过的策略检查点
    pub fn checkpoints_crossed(&self, since: usize) -> Vec<usize> {
        self.strategy
            .as_ref()
            .map(|s| {
                s.critical_checkpoints
                    .iter()
                    .copied()
                    .filter(|&c| c > since && c <= self.completed)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 给后端规划请求用的进度摘要（只给计数，不回放完整历史）
    pub fn summary(&self) -> String {
        let mut out = format!(
            "Goal: {}\nCompleted steps: {}\nFailed steps: {}\nAdaptations so far: {}",
            self.goal,
            self.completed,
            self.failures.len(),
            self.adaptation_count
        );
        if let Some(strategy) = &self.strategy {
            out.push_str(&format!(
                "\nEstimated total steps: {}\nApproach: {}",
                strategy.estimated_total_steps, strategy.approach_summary
            ));
            let upcoming: Vec<String> = strategy
                .critical_checkpoints
                .iter()
                .filter(|&&c| c > self.completed)
                .map(|c| c.to_string())
                .collect();
            if !upcoming.is_empty() {
                out.push_str(&format!("\nUpcoming checkpoints (completed steps): {}", upcoming.join(", ")));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::Step;
    use crate::llm::Tier;
    use chrono::Utc;

    fn run(ordinal: usize, results: &[bool]) -> StepRun {
        StepRun {
            step: Step::unknown(ordinal, format!("step {ordinal}")),
            attempts: results
                .iter()
                .enumerate()
                .map(|(i, ok)| ExecutionOutcome {
                    step_ordinal: ordinal,
                    attempt: i as u32 + 1,
                    tier: Tier::General,
                    succeeded: *ok,
                    error_text: (!ok).then(|| "nope".to_string()),
                    output: None,
                    timestamp: Utc::now(),
                })
                .collect(),
        }
    }

    #[test]
    fn success_increments_completed_once() {
        let mut state = ProgressState::new("g");
        assert!(state.record(&run(1, &[false, true])).is_none());
        assert_eq!(state.completed(), 1);
        assert_eq!(state.outcome_log().len(), 2);
        let successes = state.outcome_log().iter().filter(|o| o.succeeded).count();
        assert_eq!(successes, state.completed());
    }

    #[test]
    fn failure_is_recorded_with_last_error() {
        let mut state = ProgressState::new("g");
        let record = state.record(&run(4, &[false, false, false])).unwrap();
        assert_eq!(record.step_ordinal, 4);
        assert_eq!(record.error_text, "nope");
        assert_eq!(state.failed(), 1);
        assert_eq!(state.completed(), 0);
    }

    #[test]
    fn ordinals_continue_after_reserved_range() {
        let mut state = ProgressState::new("g");
        state.reserve_ordinals(3);
        assert_eq!(state.allocate_ordinal(), 4);
        assert_eq!(state.allocate_ordinal(), 5);
        state.reserve_ordinals(2);
        assert_eq!(state.allocate_ordinal(), 6);
    }

    #[test]
    fn checkpoints_are_reported_once_when_crossed() {
        let mut state = ProgressState::new("g");
        state.set_strategy(Strategy {
            goal_description: "g".into(),
            estimated_total_steps: 10,
            approach_summary: "a".into(),
            critical_checkpoints: vec![1, 3],
        });
        assert!(state.summary().contains("Upcoming checkpoints (completed steps): 1, 3"));

        state.record(&run(1, &[true]));
        assert_eq!(state.checkpoints_crossed(0), vec![1]);
        state.record(&run(2, &[true]));
        state.record(&run(3, &[true]));
        assert_eq!(state.checkpoints_crossed(1), vec![3]);
        assert!(state.checkpoints_crossed(3).is_empty());
        assert!(!state.summary().contains("Upcoming checkpoints"));
    }

    #[test]
    fn summary_mentions_counts() {
        let mut state = ProgressState::new("build it");
        state.record_adaptation();
        let summary = state.summary();
        assert!(summary.contains("build it"));
        assert!(summary.contains("Adaptations so far: 1"));
    }
}
