use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::BotResult;
use crate::event::MessageEvent;

/// 本地工具处理器
///
/// 返回 `Some(text)` 作为该次调用的工具结果；返回 `None` 表示工具
/// 只通过事件结果输出、不产生上下文条目。处理器可以在执行中途给
/// 事件设置结果，调用循环会把它作为中间输出立即下发。
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, event: &mut MessageEvent, args: &Value) -> BotResult<Option<String>>;
}

/// MCP 服务器会话
#[async_trait]
pub trait McpSession: Send + Sync {
    async fn call_tool(&self, name: &str, args: &Value) -> BotResult<McpToolResult>;
}

#[derive(Debug, Clone)]
pub struct McpContent {
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct McpToolResult {
    pub content: Vec<McpContent>,
}

/// 工具来源
pub enum ToolOrigin {
    Local(Arc<dyn ToolHandler>),
    Mcp { server_name: String },
}

/// 一个可供模型调用的函数工具
pub struct FunctionTool {
    pub name: String,
    pub description: String,
    /// 参数的 JSON Schema
    pub parameters: Value,
    pub origin: ToolOrigin,
    /// 在这些平台上禁用
    pub disabled_platforms: Vec<String>,
}

impl FunctionTool {
    pub fn enabled_for(&self, platform_id: &str) -> bool {
        !self.disabled_platforms.iter().any(|p| p == platform_id)
    }
}

/// 工具集合与 MCP 会话表
#[derive(Default)]
pub struct ToolSet {
    tools: Vec<Arc<FunctionTool>>,
    mcp_sessions: HashMap<String, Arc<dyn McpSession>>,
}

impl ToolSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tool(&mut self, tool: FunctionTool) {
        self.tools.push(Arc::new(tool));
    }

    pub fn add_mcp_session(&mut self, server_name: impl Into<String>, session: Arc<dyn McpSession>) {
        self.mcp_sessions.insert(server_name.into(), session);
    }

    pub fn get(&self, name: &str) -> Option<Arc<FunctionTool>> {
        self.tools.iter().find(|t| t.name == name).cloned()
    }

    pub fn mcp_session(&self, server_name: &str) -> Option<Arc<dyn McpSession>> {
        self.mcp_sessions.get(server_name).cloned()
    }

    pub fn tools(&self) -> &[Arc<FunctionTool>] {
        &self.tools
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
