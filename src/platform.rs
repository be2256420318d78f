use crate::BotResult;
use crate::event::MessageEvent;
use crate::message::MessageChain;
use async_trait::async_trait;
use tokio::sync::mpsc;

pub mod console;
pub mod onebot;

/// 发送目标
#[derive(Debug, Clone, Default)]
pub struct SendTarget {
    pub group_id: Option<i64>,
    pub user_id: Option<i64>,
}

/// 消息出口：事件通过它把消息链回传平台
///
/// 空消息链表示"本轮没有内容"，交互式平台（控制台）用它解除等待，
/// 其余平台直接忽略。
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn send(&self, target: &SendTarget, chain: &MessageChain) -> BotResult<()>;
}

/// 平台适配器：负责连接平台并把入站消息转换为 [`MessageEvent`]
#[async_trait]
pub trait Adapter: Send + Sync {
    /// 平台 ID（如 "console"、"onebot"）
    fn id(&self) -> &str;

    /// 适配器主循环，产出的事件写入 `event_tx`
    async fn run(&self, event_tx: mpsc::Sender<MessageEvent>) -> BotResult<()>;
}
