//! 工具层：注册表、带超时的执行器、沙箱文件系统工具与白名单 Shell

pub mod executor;
pub mod filesystem;
pub mod registry;
pub mod schema;
pub mod shell;

pub use executor::{ToolExecutor, ToolInvoker};
pub use filesystem::{CreateDirectoryTool, ListFilesTool, ReadFileTool, SafeFs, WriteFileTool};
pub use registry::{Tool, ToolRegistry};
pub use schema::action_request_schema_json;
pub use shell::{default_allowed_commands, ShellTool, DEFAULT_ALLOWED_COMMANDS};
