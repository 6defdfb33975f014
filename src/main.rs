//! Stepwise - 自适应任务分解与执行引擎
//!
//! 入口：解析参数、初始化日志与配置、创建编排器，执行一条指令并打印完成报告。
//! 用法：stepwise [--config PATH] [--plan] <instruction...>；指令为 `-` 或缺省时从 stdin 读取。

use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use stepwise::{config::load_config, engine::classify, observability, Orchestrator};
use tokio_util::sync::CancellationToken;

const USAGE: &str = "Usage: stepwise [--config PATH] [--plan] <instruction...>\n\
                     Reads the instruction from stdin when it is omitted or '-'.";

struct CliArgs {
    config: Option<PathBuf>,
    plan_only: bool,
    instruction: Option<String>,
}

fn parse_args(args: impl Iterator<Item = String>) -> Result<CliArgs, String> {
    let mut config = None;
    let mut plan_only = false;
    let mut words: Vec<String> = Vec::new();
    let mut args = args;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = args.next().ok_or("--config needs a path")?;
                config = Some(PathBuf::from(path));
            }
            "--plan" => plan_only = true,
            "--help" | "-h" => return Err(String::new()),
            "--" => {
                words.extend(args.by_ref());
            }
            other if other.starts_with("--") => return Err(format!("unknown option {}", other)),
            _ => words.push(arg),
        }
    }
    let instruction = if words.is_empty() || (words.len() == 1 && words[0] == "-") {
        None
    } else {
        Some(words.join(" "))
    };
    Ok(CliArgs {
        config,
        plan_only,
        instruction,
    })
}

fn read_stdin() -> anyhow::Result<String> {
    let mut buf = String::new();
    std::io::stdin()
        .read_to_string(&mut buf)
        .context("Failed to read instruction from stdin")?;
    Ok(buf)
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = match parse_args(std::env::args().skip(1)) {
        Ok(cli) => cli,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {}", msg);
            }
            eprintln!("{}", USAGE);
            return Ok(ExitCode::from(2));
        }
    };

    observability::init();

    let instruction = match cli.instruction {
        Some(text) => text,
        None => read_stdin()?,
    };

    if cli.plan_only {
        let steps = classify(&instruction);
        if steps.is_empty() {
            println!("Nothing to execute: no numbered steps found in the instruction.");
            return Ok(ExitCode::from(1));
        }
        for step in &steps {
            println!("{}", step);
        }
        return Ok(ExitCode::SUCCESS);
    }

    let cfg = load_config(cli.config).context("Failed to load config")?;
    let orchestrator = Orchestrator::from_config(&cfg).context("Failed to create orchestrator")?;

    // Ctrl-C 在步骤之间生效
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping after the current step");
            on_signal.cancel();
        }
    });

    let report = orchestrator.run(&instruction, cancel).await;
    print!("{}", report);

    if report.nothing_to_execute() {
        Ok(ExitCode::from(1))
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Result<CliArgs, String> {
        parse_args(list.iter().map(|s| s.to_string()))
    }

    #[test]
    fn joins_instruction_words() {
        let cli = args(&["--plan", "1.", "Create", "directory", "a"]).unwrap();
        assert!(cli.plan_only);
        assert_eq!(cli.instruction.as_deref(), Some("1. Create directory a"));
    }

    #[test]
    fn dash_means_stdin() {
        assert!(args(&["-"]).unwrap().instruction.is_none());
        assert!(args(&[]).unwrap().instruction.is_none());
    }

    #[test]
    fn config_flag_takes_path() {
        let cli = args(&["--config", "my.toml", "x"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("my.toml")));
        assert!(args(&["--config"]).is_err());
        assert!(args(&["--verbose"]).is_err());
    }
}
