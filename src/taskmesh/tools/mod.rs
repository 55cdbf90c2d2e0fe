//! Built-in Tool Implementations
//!
//! This module provides production-ready tools that agents can use to enhance their capabilities.
//! Each one implements [`ToolHandler`](crate::taskmesh::tool_protocol::ToolHandler) so it can be
//! registered directly with a [`ToolRegistry`](crate::taskmesh::tool_protocol::ToolRegistry).
//!
//! # Available Tools
//!
//! - **Bash**: Secure command execution on Linux and macOS
//!   - Cross-platform with configurable timeout
//!   - Security features: command allow/deny lists, working directory restrictions
//!   - Separate stdout/stderr capture with size limits
//!   - Full async/await support via tokio
//!
//! - **File System**: Safe file and directory operations with path restrictions
//!   - Read, write, list, delete files relative to a project's workspace
//!   - Path traversal protection (`../../../etc/passwd` is blocked)
//!   - Optional file extension filtering
//!   - Root path restriction for sandboxing
//!
//! # Integration with Agents
//!
//! ```ignore
//! use taskmesh::tool_protocol::ToolRegistry;
//!
//! # async {
//! let registry = ToolRegistry::with_builtin_tools().await;
//! # };
//! ```

pub mod bash;
pub mod filesystem;

pub use bash::{BashError, BashResult, BashTool, Platform};
pub use filesystem::{DirectoryEntry, FileMetadata, FileSystemError, FileSystemTool};
