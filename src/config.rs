//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `STEPWISE__*` 覆盖（双下划线表示嵌套，如 `STEPWISE__ENGINE__MODE=adaptive`）。
//! 各组件只接收自己那一段（如 EngineConfig），不读取全局配置。

use std::path::PathBuf;

use serde::Deserialize;

use crate::llm::{BackendChain, Tier};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub engine: EngineConfig,
    pub tools: ToolsSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    /// 沙箱根目录，未设置时用 ./workspace
    pub workspace_root: Option<PathBuf>,
}

/// [llm] 段：后端选择、超时，以及每个提供方各自的升级链
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// openai / deepseek / mock；最终还取决于环境中有哪个 API Key
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub openai: ProviderSection,
    #[serde(default)]
    pub deepseek: ProviderSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            request_timeout_secs: default_request_timeout_secs(),
            openai: ProviderSection::default(),
            deepseek: ProviderSection::default(),
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

/// 实际使用的远程提供方
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenAi,
    DeepSeek,
}

impl Provider {
    /// 配置未给出 tiers 时的升级链
    pub fn default_chain(self) -> BackendChain {
        match self {
            Provider::OpenAi => BackendChain::standard(),
            Provider::DeepSeek => BackendChain::new(vec![
                (Tier::Fast, "deepseek-chat".to_string(), true),
                (Tier::General, "deepseek-chat".to_string(), true),
                (Tier::Heavyweight, "deepseek-reasoner".to_string(), false),
            ])
            .unwrap_or_default(),
        }
    }
}

/// [llm.openai] / [llm.deepseek]：该提供方的地址与升级链
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ProviderSection {
    pub base_url: Option<String>,
    /// [[llm.<provider>.tiers]]，按档位从低到高
    pub tiers: Vec<TierSection>,
}

/// 一个档位使用的模型
#[derive(Debug, Clone, Deserialize)]
pub struct TierSection {
    pub tier: Tier,
    pub model: String,
    /// 是否接受 temperature = 0
    #[serde(default = "default_true")]
    pub deterministic: bool,
}

fn default_true() -> bool {
    true
}

impl LlmSection {
    pub fn provider_section(&self, provider: Provider) -> &ProviderSection {
        match provider {
            Provider::OpenAi => &self.openai,
            Provider::DeepSeek => &self.deepseek,
        }
    }

    /// 该提供方的升级链；未配置时用它自己的默认链
    pub fn chain(&self, provider: Provider) -> BackendChain {
        let entries = self
            .provider_section(provider)
            .tiers
            .iter()
            .map(|t| (t.tier, t.model.clone(), t.deterministic))
            .collect();
        BackendChain::new(entries).unwrap_or_else(|| provider.default_chain())
    }
}

/// 执行路径选择
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// 步骤数达到 adaptive_min_steps 时走自适应路径
    #[default]
    Auto,
    Sequential,
    Adaptive,
}

/// [engine] 段：重试上限、阈值、分块大小等常量
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 单步骤最多尝试次数
    pub max_attempts: u32,
    /// 分块成功率低于该值时触发恢复分析
    pub success_threshold: f64,
    pub chunk_min_steps: usize,
    pub chunk_max_steps: usize,
    /// 完成数达到 estimated_total_steps * completion_ratio 即结束
    pub completion_ratio: f64,
    /// 最大分块轮数 = ceil(estimated_total_steps / cycle_divisor)
    pub cycle_divisor: usize,
    pub adaptive_min_steps: usize,
    pub mode: ExecutionMode,
    /// 相邻步骤之间的间隔（毫秒）
    pub step_delay_ms: u64,
    pub max_remediation_steps: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            success_threshold: 0.8,
            chunk_min_steps: 5,
            chunk_max_steps: 10,
            completion_ratio: 0.9,
            cycle_divisor: 7,
            adaptive_min_steps: 20,
            mode: ExecutionMode::Auto,
            step_delay_ms: 500,
            max_remediation_steps: 5,
        }
    }
}

impl EngineConfig {
    /// 把明显无效的值拉回可用范围
    pub fn normalized(mut self) -> Self {
        self.max_attempts = self.max_attempts.max(1);
        self.chunk_max_steps = self.chunk_max_steps.max(1);
        self.chunk_min_steps = self.chunk_min_steps.clamp(1, self.chunk_max_steps);
        self.cycle_divisor = self.cycle_divisor.max(1);
        self.success_threshold = self.success_threshold.clamp(0.0, 1.0);
        self
    }

    /// 自适应循环的最大分块轮数，至少 1
    pub fn max_chunk_cycles(&self, estimated_total_steps: usize) -> usize {
        estimated_total_steps.div_ceil(self.cycle_divisor.max(1)).max(1)
    }
}

/// [tools] 段：工具超时、Shell 白名单
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    #[serde(default)]
    pub shell: ShellSection,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: default_tool_timeout_secs(),
            shell: ShellSection::default(),
        }
    }
}

fn default_tool_timeout_secs() -> u64 {
    30
}

/// [tools.shell] 段：允许执行的命令名（每段命令的首词）
#[derive(Debug, Clone, Deserialize)]
pub struct ShellSection {
    #[serde(default = "crate::tools::default_allowed_commands")]
    pub allowed_commands: Vec<String>,
}

impl Default for ShellSection {
    fn default() -> Self {
        Self {
            allowed_commands: crate::tools::default_allowed_commands(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 STEPWISE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path，则追加该文件（必须存在，可覆盖前面的键）
/// 3. 最后叠加环境变量 STEPWISE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(path) = config_path {
        builder = builder.add_source(config::File::from(path).required(true));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("STEPWISE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    let mut cfg: AppConfig = c.try_deserialize()?;
    cfg.engine = cfg.engine.normalized();
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_engine_constants() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.engine.max_attempts, 3);
        assert_eq!(cfg.engine.success_threshold, 0.8);
        assert_eq!(cfg.engine.mode, ExecutionMode::Auto);
        assert_eq!(cfg.llm.chain(Provider::OpenAi), BackendChain::standard());
        assert_eq!(cfg.llm.chain(Provider::DeepSeek).highest().model, "deepseek-reasoner");
        assert!(cfg.tools.shell.allowed_commands.contains(&"ls".to_string()));
    }

    #[test]
    fn explicit_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[engine]
mode = "adaptive"
chunk_max_steps = 8

[[llm.openai.tiers]]
tier = "heavyweight"
model = "big"
deterministic = false

[[llm.openai.tiers]]
tier = "general"
model = "small"

[[llm.deepseek.tiers]]
tier = "heavyweight"
model = "big"
deterministic = false
"#
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.engine.mode, ExecutionMode::Adaptive);
        assert_eq!(cfg.engine.chunk_max_steps, 8);
        assert_eq!(cfg.engine.max_attempts, 3);
        let chain = cfg.llm.chain(Provider::OpenAi);
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.lowest().model, "small");
        assert_eq!(chain.highest().model, "big");
        assert!(!chain.highest().supports_deterministic_params);
        assert_eq!(cfg.llm.chain(Provider::DeepSeek).len(), 1);
    }

    #[test]
    fn shipped_defaults_keep_provider_models_apart() {
        let text = std::fs::read_to_string(concat!(env!("CARGO_MANIFEST_DIR"), "/config/default.toml")).unwrap();
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(text.as_bytes()).unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        let deepseek: Vec<String> = cfg
            .llm
            .chain(Provider::DeepSeek)
            .profiles()
            .iter()
            .map(|p| p.model.clone())
            .collect();
        assert_eq!(deepseek, vec!["deepseek-chat", "deepseek-chat", "deepseek-reasoner"]);
        assert_eq!(cfg.llm.chain(Provider::OpenAi).lowest().model, "gpt-4o-mini");
    }

    #[test]
    fn max_chunk_cycles_rounds_up() {
        let engine = EngineConfig::default();
        assert_eq!(engine.max_chunk_cycles(42), 6);
        assert_eq!(engine.max_chunk_cycles(43), 7);
        assert_eq!(engine.max_chunk_cycles(1), 1);
    }

    #[test]
    fn normalization_fixes_zeroes() {
        let engine = EngineConfig {
            max_attempts: 0,
            cycle_divisor: 0,
            chunk_min_steps: 20,
            ..EngineConfig::default()
        }
        .normalized();
        assert_eq!(engine.max_attempts, 1);
        assert_eq!(engine.cycle_divisor, 1);
        assert_eq!(engine.chunk_min_steps, engine.chunk_max_steps);
    }
}
