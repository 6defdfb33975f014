//! 沙箱文件系统工具
//!
//! SafeFs 绑定 root_dir，所有路径经 resolve 校验必须在 root 下（禁止 ../ 逃逸，也禁止经符号链接逃逸）；
//! 目标可以尚不存在（建目录 / 写文件）。基于 SafeFs 提供 create_directory / write_file / list_files / read_file。

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;

use crate::core::EngineError;
use crate::tools::registry::required_arg;
use crate::tools::Tool;

/// 沙箱文件系统：绑定根目录，resolve 校验路径在根下，防止路径逃逸
#[derive(Debug, Clone)]
pub struct SafeFs {
    root_dir: PathBuf,
}

impl SafeFs {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        let root = root_dir.as_ref().to_path_buf();
        let root_dir = root.canonicalize().unwrap_or(root);
        Self { root_dir }
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    /// 词法归一化后拼到根目录下；再对最深的已存在祖先做 canonicalize，确认没有经符号链接逃逸
    pub fn resolve(&self, path: &str) -> Result<PathBuf, EngineError> {
        let raw = path.trim();
        let requested = Path::new(raw);
        let relative = if requested.is_absolute() {
            requested
                .strip_prefix(&self.root_dir)
                .map_err(|_| EngineError::PathEscape(raw.to_string()))?
        } else {
            requested
        };

        let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
        for component in relative.components() {
            match component {
                Component::CurDir => {}
                Component::Normal(p) => parts.push(p),
                Component::ParentDir => {
                    // 如 ../../etc/passwd
                    if parts.pop().is_none() {
                        return Err(EngineError::PathEscape(raw.to_string()));
                    }
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(EngineError::PathEscape(raw.to_string()));
                }
            }
        }
        let full: PathBuf = parts.iter().fold(self.root_dir.clone(), |acc, p| acc.join(p));

        let mut existing = full.as_path();
        while !existing.exists() {
            match existing.parent() {
                Some(parent) => existing = parent,
                None => break,
            }
        }
        let canonical = existing
            .canonicalize()
            .unwrap_or_else(|_| existing.to_path_buf());
        if canonical.starts_with(&self.root_dir) {
            Ok(full)
        } else {
            Err(EngineError::PathEscape(raw.to_string()))
        }
    }

    pub fn create_dir(&self, path: &str) -> Result<PathBuf, EngineError> {
        let resolved = self.resolve(path)?;
        std::fs::create_dir_all(&resolved)
            .map_err(|e| EngineError::InvocationFailure(format!("Create directory failed: {}", e)))?;
        Ok(resolved)
    }

    /// 写入（覆盖）文件；父目录必须已存在
    pub fn write_file(&self, path: &str, content: &str) -> Result<PathBuf, EngineError> {
        let resolved = self.resolve(path)?;
        if let Some(parent) = resolved.parent() {
            if !parent.is_dir() {
                return Err(EngineError::InvocationFailure(format!(
                    "Parent directory does not exist: {}",
                    parent.display()
                )));
            }
        }
        std::fs::write(&resolved, content)
            .map_err(|e| EngineError::InvocationFailure(format!("Write failed: {}", e)))?;
        Ok(resolved)
    }

    pub fn read_file(&self, path: &str) -> Result<String, EngineError> {
        let resolved = self.resolve(path)?;
        std::fs::read_to_string(&resolved)
            .map_err(|e| EngineError::InvocationFailure(format!("Read failed: {}", e)))
    }

    pub fn list_dir(&self, path: &str) -> Result<Vec<String>, EngineError> {
        let base = if path.trim().is_empty() || path.trim() == "." {
            self.root_dir.clone()
        } else {
            self.resolve(path)?
        };
        let mut entries = Vec::new();
        for e in std::fs::read_dir(&base)
            .map_err(|e| EngineError::InvocationFailure(format!("List failed: {}", e)))?
        {
            let e = e.map_err(|e| EngineError::InvocationFailure(e.to_string()))?;
            let name = e.file_name().to_string_lossy().to_string();
            if !name.starts_with('.') {
                let ty = if e.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    "/"
                } else {
                    ""
                };
                entries.push(format!("{}{}", name, ty));
            }
        }
        entries.sort();
        Ok(entries)
    }

    fn display(&self, path: &Path) -> String {
        path.strip_prefix(&self.root_dir)
            .unwrap_or(path)
            .display()
            .to_string()
    }
}

fn path_schema(description: &str) -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "path": { "type": "string", "description": description }
        },
        "required": ["path"]
    })
}

/// 建目录（含所有缺失的上级目录）
pub struct CreateDirectoryTool {
    fs: SafeFs,
}

impl CreateDirectoryTool {
    pub fn new(fs: SafeFs) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Tool for CreateDirectoryTool {
    fn name(&self) -> &str {
        "create_directory"
    }

    fn description(&self) -> &str {
        "Create a directory (and missing parents) inside the workspace."
    }

    fn parameters_schema(&self) -> Value {
        path_schema("Directory path relative to the workspace")
    }

    async fn execute(&self, args: &BTreeMap<String, String>) -> Result<String, String> {
        let path = required_arg(args, "path")?;
        tracing::info!(path = %path, "create_directory tool execute");
        let created = self.fs.create_dir(path).map_err(|e| e.to_string())?;
        Ok(format!("Created directory {}", self.fs.display(&created)))
    }
}

/// 写文件（覆盖）；父目录不存在时失败
pub struct WriteFileTool {
    fs: SafeFs,
    max_file_size: usize,
}

impl WriteFileTool {
    pub fn new(fs: SafeFs) -> Self {
        Self {
            fs,
            max_file_size: 10 * 1024 * 1024, // 10MB
        }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write text content to a file inside the workspace, replacing any existing content. The parent directory must exist."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File path relative to the workspace" },
                "content": { "type": "string", "description": "Full file content" }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(&self, args: &BTreeMap<String, String>) -> Result<String, String> {
        let path = required_arg(args, "path")?;
        let content = required_arg(args, "content")?;
        if content.len() > self.max_file_size {
            return Err(format!(
                "Content too large: {} bytes (max: {})",
                content.len(),
                self.max_file_size
            ));
        }
        tracing::info!(path = %path, bytes = content.len(), "write_file tool execute");
        let written = self.fs.write_file(path, content).map_err(|e| e.to_string())?;
        Ok(format!(
            "Wrote {} ({} bytes)",
            self.fs.display(&written),
            content.len()
        ))
    }
}

/// 列目录
pub struct ListFilesTool {
    fs: SafeFs,
}

impl ListFilesTool {
    pub fn new(fs: SafeFs) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Tool for ListFilesTool {
    fn name(&self) -> &str {
        "list_files"
    }

    fn description(&self) -> &str {
        "List a directory inside the workspace. Directories end with '/'."
    }

    fn parameters_schema(&self) -> Value {
        path_schema("Directory path relative to the workspace, '.' for the root")
    }

    async fn execute(&self, args: &BTreeMap<String, String>) -> Result<String, String> {
        let path = args.get("path").map(String::as_str).unwrap_or(".");
        tracing::info!(path = %path, "list_files tool execute");
        let entries = self.fs.list_dir(path).map_err(|e| e.to_string())?;
        Ok(entries.join("\n"))
    }
}

/// 读文件
pub struct ReadFileTool {
    fs: SafeFs,
}

impl ReadFileTool {
    pub fn new(fs: SafeFs) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file inside the workspace."
    }

    fn parameters_schema(&self) -> Value {
        path_schema("File path relative to the workspace")
    }

    async fn execute(&self, args: &BTreeMap<String, String>) -> Result<String, String> {
        let path = required_arg(args, "path")?;
        tracing::info!(path = %path, "read_file tool execute");
        self.fs.read_file(path).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn resolve_blocks_parent_escape() {
        let dir = tempfile::tempdir().unwrap();
        let fs = SafeFs::new(dir.path());
        assert!(matches!(fs.resolve("../outside"), Err(EngineError::PathEscape(_))));
        assert!(matches!(fs.resolve("a/../../x"), Err(EngineError::PathEscape(_))));
        assert!(matches!(fs.resolve("/etc/passwd"), Err(EngineError::PathEscape(_))));
        assert!(fs.resolve("a/../b/c.txt").unwrap().ends_with("b/c.txt"));
    }

    #[test]
    fn absolute_path_inside_root_is_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let fs = SafeFs::new(dir.path());
        let inside = fs.root().join("x.txt");
        assert_eq!(fs.resolve(inside.to_str().unwrap()).unwrap(), inside);
    }

    #[tokio::test]
    async fn write_requires_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let fs = SafeFs::new(dir.path());
        let write = WriteFileTool::new(fs.clone());
        let mkdir = CreateDirectoryTool::new(fs.clone());

        let err = write
            .execute(&args(&[("path", "proj/a.txt"), ("content", "hi")]))
            .await
            .unwrap_err();
        assert!(err.contains("Parent directory does not exist"), "{err}");

        mkdir.execute(&args(&[("path", "proj")])).await.unwrap();
        let ok = write
            .execute(&args(&[("path", "proj/a.txt"), ("content", "hi")]))
            .await
            .unwrap();
        assert!(ok.contains("proj/a.txt"));
        assert_eq!(std::fs::read_to_string(dir.path().join("proj/a.txt")).unwrap(), "hi");
    }

    #[tokio::test]
    async fn list_and_read() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("b.txt"), "bee").unwrap();
        std::fs::write(dir.path().join(".hidden"), "").unwrap();
        let fs = SafeFs::new(dir.path());

        let listing = ListFilesTool::new(fs.clone())
            .execute(&args(&[("path", ".")]))
            .await
            .unwrap();
        assert_eq!(listing, "b.txt\nsub/");

        let content = ReadFileTool::new(fs)
            .execute(&args(&[("path", "b.txt")]))
            .await
            .unwrap();
        assert_eq!(content, "bee");
    }

    #[tokio::test]
    async fn create_directory_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let tool = CreateDirectoryTool::new(SafeFs::new(dir.path()));
        tool.execute(&args(&[("path", "a/b")])).await.unwrap();
        tool.execute(&args(&[("path", "a/b")])).await.unwrap();
        assert!(dir.path().join("a/b").is_dir());
    }
}
