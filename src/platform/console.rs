use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::event::{MessageEvent, Sender};
use crate::message::MessageChain;
use crate::platform::{Adapter, MessageSink, SendTarget};
use crate::{BotResult, info};

/// 控制台出口：消息链打印到标准输出
pub struct ConsoleSink;

#[async_trait]
impl MessageSink for ConsoleSink {
    async fn send(&self, _target: &SendTarget, chain: &MessageChain) -> BotResult<()> {
        // 空消息兜底：本轮没有输出，静默返回
        if chain.chain.is_empty() {
            return Ok(());
        }
        println!("\x1b[36mBot>\x1b[0m {}", chain.outline());
        Ok(())
    }
}

/// 控制台适配器：标准输入逐行读入，作为私聊消息进入流水线
pub struct ConsoleAdapter {
    sink: Arc<ConsoleSink>,
}

impl ConsoleAdapter {
    pub fn new() -> Self {
        Self {
            sink: Arc::new(ConsoleSink),
        }
    }
}

impl Default for ConsoleAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Adapter for ConsoleAdapter {
    fn id(&self) -> &str {
        "console"
    }

    async fn run(&self, event_tx: mpsc::Sender<MessageEvent>) -> BotResult<()> {
        info!(target: "Console", "控制台适配器就绪，输入消息开始对话 (/exit 退出)");
        let stdin = tokio::io::stdin();
        let mut reader = BufReader::new(stdin).lines();
        let mut counter = 0u64;

        while let Ok(Some(line)) = reader.next_line().await {
            let content = line.trim().to_string();
            if content.is_empty() {
                continue;
            }
            if content == "/exit" {
                break;
            }

            counter += 1;
            let mut event = MessageEvent::new(
                "console",
                "dev",
                Sender {
                    id: "console_user".to_string(),
                    name: "Developer".to_string(),
                },
                MessageChain::new().text(content),
                true,
                self.sink.clone(),
            );
            event.message_id = format!("msg_{}", counter);

            if event_tx.send(event).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}
