//! # Yunque (云雀)
//!
//! 轻量级 LLM 聊天机器人消息处理核心。
//!
//! 平台适配器把入站消息转换为 [`event::MessageEvent`]，
//! [`pipeline::PipelineScheduler`] 按固定顺序驱动各个阶段，
//! 其中 LLM 请求阶段负责与大模型对话（含工具调用循环），
//! 发送阶段负责把结果回传平台（可选分段发送）。

pub mod config;
pub mod conversation;
pub mod event;
pub mod hooks;
pub mod log;
pub mod message;
pub mod metrics;
pub mod pipeline;
pub mod platform;
pub mod provider;
pub mod tool;

/// 统一错误类型
pub type BotError = Box<dyn std::error::Error + Send + Sync>;
pub type BotResult<T> = Result<T, BotError>;

pub mod prelude {
    pub use crate::config::{AppConfig, PlatformSettings, ProviderConfig};
    pub use crate::conversation::{Conversation, ConversationManager};
    pub use crate::event::{MessageEvent, MessageEventResult, ResultContentType};
    pub use crate::hooks::{HookFlow, HookRegistry};
    pub use crate::message::{Component, MessageChain};
    pub use crate::pipeline::{PipelineContext, PipelineScheduler, Stage};
    pub use crate::provider::{LlmResponse, Provider, ProviderRequest, ResponseRole};
    pub use crate::tool::{FunctionTool, ToolSet};
    pub use crate::{BotError, BotResult};
    pub use async_trait::async_trait;
}
