use async_trait::async_trait;

use crate::event::MessageEvent;
use crate::pipeline::{Downstream, PipelineContext, Stage};
use crate::{BotResult, debug};

/// 唤醒检查阶段
///
/// 私聊和 @ 机器人的消息直接唤醒；群聊消息命中任意唤醒前缀时
/// 唤醒并去掉前缀。未唤醒的群聊消息停止传播。
pub struct WakingCheckStage {
    wake_prefixes: Vec<String>,
}

impl WakingCheckStage {
    pub fn new() -> Self {
        Self {
            wake_prefixes: Vec::new(),
        }
    }
}

impl Default for WakingCheckStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Stage for WakingCheckStage {
    fn name(&self) -> &'static str {
        "WakingCheckStage"
    }

    async fn initialize(&mut self, ctx: &PipelineContext) -> BotResult<()> {
        self.wake_prefixes = ctx.config.wake_prefix.clone();
        Ok(())
    }

    async fn process(
        &self,
        event: &mut MessageEvent,
        _downstream: &Downstream<'_>,
    ) -> BotResult<()> {
        if event.is_private || event.is_at_bot {
            event.is_wake = true;
        }

        let text = event.message_str.trim_start();
        for prefix in &self.wake_prefixes {
            if let Some(rest) = text.strip_prefix(prefix.as_str()) {
                event.is_wake = true;
                event.message_str = rest.trim_start().to_string();
                break;
            }
        }

        if !event.is_wake {
            debug!(target: "Waking", "消息未唤醒机器人，忽略: {}", event.message.outline());
            event.stop_event();
        }
        Ok(())
    }
}
