//! 步骤分类器
//!
//! 把自由文本指令拆成有序的 Step 列表（纯函数，无 I/O）：
//! 1. 以编号标记 `N.` 为边界切分，成对引号（`"`、`'`、`` ` ``）内的标记一律不算边界
//! 2. 有两行及以上以标记开头时按行切分（多行形式）；行内标记只有续上当前编号、
//!    且不与后面行首标记的编号冲突时才算边界，否则留作内容并记 warn
//! 3. 否则视为单行打包，行内每个标记都是边界；序号总是按出现顺序重新编为 1..N
//! 4. 每个片段按优先级匹配规则表：建目录 → 建文件 → 列目录 → 读文件 → 执行命令 → 计数；
//!    都不命中则为 Unknown，原文留到执行时交给后端解释

use std::sync::OnceLock;

use regex::Regex;

use crate::engine::types::{ActionType, Step};
use crate::tools::DEFAULT_ALLOWED_COMMANDS;

/// 没有扩展名但确实是文件的常见文件名
const EXTENSIONLESS_FILES: &[&str] = &[
    "dockerfile",
    "makefile",
    "readme",
    "license",
    "procfile",
    "gemfile",
    "rakefile",
    "jenkinsfile",
    "vagrantfile",
    "containerfile",
    "brewfile",
    "changelog",
];

struct Rules {
    marker: Regex,
    directory: Regex,
    mkdir: Regex,
    file: Regex,
    write_to: Regex,
    list: Regex,
    ls: Regex,
    read: Regex,
    command_cue: Regex,
    backtick: Regex,
    run: Regex,
    bash: Regex,
    count: Regex,
    how_many: Regex,
}

static RULES: OnceLock<Rules> = OnceLock::new();

fn rules() -> &'static Rules {
    RULES.get_or_init(|| Rules {
        marker: Regex::new(r"\d{1,3}\.").unwrap(),
        directory: Regex::new(
            r"(?i)^(?:please\s+)?(?:create|make|add|set\s+up)\s+(?:a\s+|an\s+|the\s+)?(?:new\s+)?(?:directory|folder|dir)\b(?:\s+(?:called|named))?\s+(?P<path>\S+)",
        )
        .unwrap(),
        mkdir: Regex::new(r"(?i)^mkdir\s+(?:-p\s+)?(?P<path>\S+)").unwrap(),
        file: Regex::new(
            r#"(?is)^(?:please\s+)?(?:create|make|add|write|generate)\s+(?:a\s+|an\s+|the\s+)?(?:new\s+)?(?P<desc>[\w+#-]+\s+(?:script|file|module)\s+)?(?P<kw>file\s+)?(?:called\s+|named\s+)?(?P<path>[^\s"'`]+)(?:\s+file)?(?:\s+(?:in|inside|under)\s+(?:the\s+)?(?:(?:directory|folder)\b\s*)?(?P<dir>[^\s"'`]+))?(?:\s+(?:with|containing)\b\s*(?:the\s+)?(?:(?:content|contents|text)\b)?\s*:?\s*(?P<content>.*))?$"#,
        )
        .unwrap(),
        write_to: Regex::new(
            r#"(?is)^(?:write|put|save)\s+(?P<content>"[^"]*"|'[^']*')\s+(?:to|into|in)\s+(?:the\s+)?(?:file\s+)?(?P<path>[^\s"'`]+)"#,
        )
        .unwrap(),
        list: Regex::new(
            r#"(?i)^(?:list|show|display|print)\s+(?:all\s+)?(?:the\s+)?(?:files|contents|entries|directory\s+contents)(?:\s+(?:in|of|inside|under|within)\s+(?:the\s+)?(?:current\s+)?(?:(?:directory|folder)\b)?\s*(?P<path>[^\s"'`]+)?)?"#,
        )
        .unwrap(),
        ls: Regex::new(r"(?i)^ls(?:\s+-\S+)*(?:\s+(?P<path>[^\s-]\S*))?\s*$").unwrap(),
        read: Regex::new(
            r#"(?i)^(?:read|cat|view|open|print|show|display)\s+(?:out\s+)?(?:the\s+)?(?:contents?\s+of\s+)?(?:the\s+)?(?P<kw>file\s+)?(?P<path>[^\s"'`]+)"#,
        )
        .unwrap(),
        command_cue: Regex::new(r"(?i)^(?:please\s+)?(?:run|execute|exec)\b").unwrap(),
        backtick: Regex::new(r"`([^`]+)`").unwrap(),
        run: Regex::new(
            r"(?is)^(?:please\s+)?(?:run|execute|exec)\s+(?:the\s+)?(?:following\s+)?(?:(?:(?:bash|shell)\s+)?command\b\s*)?:?\s*(?P<cmd>.+)$",
        )
        .unwrap(),
        bash: Regex::new(r"(?is)\bbash\b(?:\s+-c)?\s*:?\s*(?P<cmd>.+)$").unwrap(),
        count: Regex::new(
            r#"(?i)^(?:count|tally)\s+(?:the\s+)?(?:number\s+of\s+|total\s+)?(?:all\s+)?(?P<what>files|lines|directories|folders)(?:\s+(?:in|of|inside|under|within)\s+(?:the\s+)?(?:(?:directory|folder|file)\b\s*)?(?P<path>[^\s"'`]+))?"#,
        )
        .unwrap(),
        how_many: Regex::new(
            r#"(?i)^how\s+many\s+(?P<what>files|lines|directories|folders)\b\s*(?:are\s+)?(?:there\s+)?(?:in\s+(?:the\s+)?(?:(?:directory|folder|file)\b\s*)?(?P<path>[^\s"'`?]+))?"#,
        )
        .unwrap(),
    })
}

/// 把整段指令分类为有序步骤；没有任何编号标记时返回空列表（调用方据此判定「不可分解」）
pub fn classify(raw_instruction: &str) -> Vec<Step> {
    split_numbered(raw_instruction)
        .iter()
        .enumerate()
        .map(|(i, fragment)| classify_fragment(i + 1, fragment))
        .collect()
}

/// 编号标记候选（已排除引号内的）
#[derive(Debug, Clone, Copy)]
struct Marker {
    start: usize,
    body_start: usize,
    number: u32,
    at_line_start: bool,
}

fn find_markers(text: &str) -> Vec<Marker> {
    let quoted = quoted_spans(text);
    let mut markers = Vec::new();
    for m in rules().marker.find_iter(text) {
        let before = text[..m.start()].chars().next_back();
        if matches!(before, Some(c) if !c.is_whitespace()) {
            continue;
        }
        let after = text[m.end()..].chars().next();
        if matches!(after, Some(c) if !c.is_whitespace()) {
            continue;
        }
        if quoted.iter().any(|&(open, close)| open < m.start() && m.start() < close) {
            continue;
        }
        let number: u32 = match m.as_str().trim_end_matches('.').parse() {
            Ok(n) => n,
            Err(_) => continue,
        };
        let line_start = text[..m.start()].rfind('\n').map(|i| i + 1).unwrap_or(0);
        markers.push(Marker {
            start: m.start(),
            body_start: m.end(),
            number,
            at_line_start: text[line_start..m.start()].trim().is_empty(),
        });
    }
    markers
}

/// 成对引号覆盖的字节区间（开、闭引号的位置）；找不到闭合的开引号不算
fn quoted_spans(text: &str) -> Vec<(usize, usize)> {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let mut spans = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let (open_at, quote) = chars[i];
        let prev = i.checked_sub(1).map(|j| chars[j].1);
        if opens_quote(quote, prev) {
            let close = (i + 1..chars.len()).find(|&j| {
                closes_quote(quote, chars[j].1, chars[j - 1].1, chars.get(j + 1).map(|c| c.1))
            });
            if let Some(j) = close {
                spans.push((open_at, chars[j].0));
                i = j + 1;
                continue;
            }
        }
        i += 1;
    }
    spans
}

fn opens_quote(c: char, prev: Option<char>) -> bool {
    match c {
        '"' | '`' => true,
        // 词内撇号（don't、kids'）不是引号
        '\'' => prev.map_or(true, |p| !p.is_alphanumeric()),
        _ => false,
    }
}

fn closes_quote(quote: char, c: char, prev: char, next: Option<char>) -> bool {
    if c != quote {
        return false;
    }
    match quote {
        '"' => prev != '\\',
        '\'' => next.map_or(true, |n| !n.is_alphanumeric()),
        _ => true,
    }
}

/// 多行形式：行首标记都是边界；行内标记须续上编号，且后面的行首标记没有占用同一编号
fn accept_line_form(candidates: &[Marker]) -> Vec<Marker> {
    let mut accepted: Vec<Marker> = Vec::new();
    for (i, marker) in candidates.iter().enumerate() {
        if marker.at_line_start {
            accepted.push(*marker);
            continue;
        }
        let next_line_number = candidates[i + 1..]
            .iter()
            .find(|m| m.at_line_start)
            .map(|m| m.number);
        let continues = accepted
            .last()
            .is_some_and(|prev| marker.number == prev.number + 1)
            && next_line_number != Some(marker.number);
        if continues {
            accepted.push(*marker);
        } else {
            tracing::warn!(number = marker.number, "numbered marker inside a line kept as step content");
        }
    }
    accepted
}

/// 以编号标记为边界切出片段文本（不含标记本身）
pub fn split_numbered(text: &str) -> Vec<String> {
    let candidates = find_markers(text);
    if candidates.is_empty() {
        return Vec::new();
    }

    let line_starts = candidates.iter().filter(|m| m.at_line_start).count();
    let accepted = if line_starts >= 2 {
        accept_line_form(&candidates)
    } else {
        candidates
    };

    if accepted.windows(2).any(|w| w[1].number != w[0].number + 1) || accepted[0].number != 1 {
        tracing::warn!(
            numbers = ?accepted.iter().map(|m| m.number).collect::<Vec<_>>(),
            "step numbers out of sequence, renumbered in order"
        );
    }

    accepted
        .iter()
        .enumerate()
        .map(|(i, marker)| {
            let end = accepted.get(i + 1).map(|m| m.start).unwrap_or(text.len());
            text[marker.body_start..end].trim().to_string()
        })
        .collect()
}

/// 对单个片段应用规则表（分块规划与恢复分析产出的步骤文本也走这里）
pub fn classify_fragment(ordinal: usize, fragment: &str) -> Step {
    let text = fragment.trim();
    let step = |action: ActionType, target: Option<String>, content: Option<String>| Step {
        ordinal,
        raw_text: text.to_string(),
        action,
        target,
        content,
    };

    if let Some(path) = match_directory(text) {
        return step(ActionType::CreateDirectory, Some(path), None);
    }
    if let Some((path, content)) = match_file(text) {
        return step(ActionType::CreateFile, Some(path), Some(content));
    }
    if let Some(path) = match_list(text) {
        return step(ActionType::ListFiles, Some(path), None);
    }
    if let Some(path) = match_read(text) {
        return step(ActionType::ReadFile, Some(path), None);
    }
    if let Some(command) = match_command(text) {
        return step(ActionType::RunCommand, None, Some(command));
    }
    if let Some((path, command)) = match_count(text) {
        return step(ActionType::CountFiles, Some(path), Some(command));
    }
    step(ActionType::Unknown, None, None)
}

fn match_directory(text: &str) -> Option<String> {
    let r = rules();
    let caps = r.directory.captures(text).or_else(|| r.mkdir.captures(text))?;
    clean_target(&caps["path"])
}

fn match_file(text: &str) -> Option<(String, String)> {
    let r = rules();
    if let Some(caps) = r.write_to.captures(text) {
        let path = clean_target(&caps["path"])?;
        return Some((path, clean_content(&caps["content"])));
    }

    let caps = r.file.captures(text)?;
    let name = clean_target(&caps["path"])?;
    let named_as_file = caps.name("kw").is_some() || caps.name("desc").is_some();
    if !named_as_file && !looks_like_filename(&name) {
        return None;
    }
    let path = match caps.name("dir").and_then(|d| clean_target(d.as_str())) {
        Some(dir) => format!("{}/{}", dir.trim_end_matches('/'), name),
        None => name,
    };
    let content = caps
        .name("content")
        .map(|c| clean_content(c.as_str()))
        .unwrap_or_default();
    Some((path, content))
}

fn match_list(text: &str) -> Option<String> {
    let r = rules();
    let caps = r.list.captures(text).or_else(|| r.ls.captures(text))?;
    let path = caps
        .name("path")
        .and_then(|p| clean_target(p.as_str()))
        .unwrap_or_else(|| ".".to_string());
    // "show the contents of notes.md" 是读文件
    if looks_like_filename(&path) {
        return None;
    }
    Some(path)
}

fn match_read(text: &str) -> Option<String> {
    let caps = rules().read.captures(text)?;
    let path = clean_target(&caps["path"])?;
    if caps.name("kw").is_none() && !looks_like_filename(&path) && !path.contains('/') {
        return None;
    }
    Some(path)
}

fn match_command(text: &str) -> Option<String> {
    let r = rules();
    if r.command_cue.is_match(text) {
        if let Some(caps) = r.backtick.captures(text) {
            let cmd = caps[1].trim();
            if !cmd.is_empty() {
                return Some(cmd.to_string());
            }
        }
    }
    if let Some(caps) = r.run.captures(text) {
        let cmd = strip_quotes(caps["cmd"].trim());
        if !cmd.is_empty() {
            return Some(cmd);
        }
    }
    if let Some(caps) = r.bash.captures(text) {
        let cmd = caps["cmd"].trim();
        if !cmd.to_lowercase().starts_with("to ") {
            let cmd = strip_quotes(cmd);
            if !cmd.is_empty() {
                return Some(cmd);
            }
        }
    }
    let mut words = text.split_whitespace();
    let first = words.next()?;
    let second = words.next().map(str::to_lowercase);
    let reads_like_prose = matches!(
        second.as_deref(),
        Some("the" | "a" | "an" | "all" | "out" | "some" | "any" | "up")
    );
    if DEFAULT_ALLOWED_COMMANDS.contains(&first) && !reads_like_prose {
        return Some(text.to_string());
    }
    None
}

fn match_count(text: &str) -> Option<(String, String)> {
    let r = rules();
    let caps = r.count.captures(text).or_else(|| r.how_many.captures(text))?;
    let what = caps["what"].to_lowercase();
    let path = caps
        .name("path")
        .and_then(|p| clean_target(p.as_str()))
        .unwrap_or_else(|| ".".to_string());
    let quoted = shell_quote(&path);
    let command = match what.as_str() {
        "files" => format!("find {} -type f | wc -l", quoted),
        "directories" | "folders" => format!("find {} -mindepth 1 -type d | wc -l", quoted),
        _ if looks_like_filename(&path) => format!("wc -l < {}", quoted),
        _ => format!("find {} -type f -exec cat {{}} + | wc -l", quoted),
    };
    Some((path, command))
}

/// 含扩展名（点不在首尾）或属于无扩展名白名单
fn looks_like_filename(name: &str) -> bool {
    let base = name.rsplit('/').next().unwrap_or(name);
    if EXTENSIONLESS_FILES.contains(&base.to_lowercase().as_str()) {
        return true;
    }
    match base.rfind('.') {
        Some(i) => i + 1 < base.len() && base[i + 1..].chars().all(|c| c.is_ascii_alphanumeric()),
        None => false,
    }
}

/// 去掉路径两端的引号与句末标点；"." 与 ".." 保持不变
fn clean_target(raw: &str) -> Option<String> {
    let mut t = raw.trim().trim_matches(|c| c == '"' || c == '\'' || c == '`');
    t = t.trim_end_matches([',', ';', ':', '!', '?', ')']);
    if t.len() > 1 && t.ends_with('.') && !t.ends_with("..") {
        t = &t[..t.len() - 1];
    }
    if t.is_empty() {
        None
    } else {
        Some(t.to_string())
    }
}

/// 内容：成对引号取内部并还原 \n \t \" 转义；未加引号的去掉句末句号
fn clean_content(raw: &str) -> String {
    let t = raw.trim();
    for quote in ['"', '\'', '`'] {
        if t.len() >= 2 && t.starts_with(quote) {
            if let Some(end) = t[1..].rfind(quote) {
                return unescape(&t[1..end + 1]);
            }
        }
    }
    t.strip_suffix('.').unwrap_or(t).to_string()
}

fn unescape(s: &str) -> String {
    s.replace("\\n", "\n").replace("\\t", "\t").replace("\\\"", "\"")
}

fn strip_quotes(s: &str) -> String {
    let t = s.trim();
    for quote in ['"', '\'', '`'] {
        if t.len() >= 2 && t.starts_with(quote) && t.ends_with(quote) {
            return t[1..t.len() - 1].trim().to_string();
        }
    }
    t.to_string()
}

fn shell_quote(s: &str) -> String {
    if s.chars().all(|c| c.is_ascii_alphanumeric() || "./_-".contains(c)) {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}
