use std::sync::Arc;

use async_trait::async_trait;

use crate::BotResult;
use crate::config::AppConfig;
use crate::conversation::ConversationManager;
use crate::event::MessageEvent;
use crate::hooks::HookRegistry;
use crate::provider::Provider;
use crate::tool::ToolSet;

pub mod llm_request;
pub mod respond;
pub mod scheduler;
pub mod waking;

pub use scheduler::{Downstream, PipelineScheduler};

/// 各阶段初始化时共享的依赖
pub struct PipelineContext {
    pub config: AppConfig,
    pub provider: Option<Arc<dyn Provider>>,
    pub conversations: Arc<ConversationManager>,
    pub hooks: Arc<HookRegistry>,
    pub tools: Arc<ToolSet>,
}

/// 流水线阶段
///
/// 阶段在 `process` 中完成本职工作后交还控制权，调度器继续执行
/// 后续阶段。需要在中途产出结果的阶段（流式分片、工具中间输出）
/// 通过 `downstream` 把当前事件结果完整送过一遍剩余阶段，随后
/// 继续自己的执行。
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    /// 服务事件前调用一次
    async fn initialize(&mut self, ctx: &PipelineContext) -> BotResult<()>;

    async fn process(
        &self,
        event: &mut MessageEvent,
        downstream: &Downstream<'_>,
    ) -> BotResult<()>;
}
