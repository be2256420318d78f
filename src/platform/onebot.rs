use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use futures_util::{Sink, SinkExt, StreamExt};
use http::HeaderValue;
use serde_json::json;
use simd_json::OwnedValue;
use simd_json::base::ValueAsArray;
use simd_json::derived::{ValueObjectAccess, ValueObjectAccessAsScalar};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, protocol::Message as WsMessage},
};

use crate::event::{MessageEvent, Sender};
use crate::message::{Component, MessageChain};
use crate::platform::{Adapter, MessageSink, SendTarget};
use crate::{BotResult, error, info, warn};

pub type WsSink =
    Box<dyn Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Send + Unpin>;
pub type LockedWriter = Arc<AsyncMutex<WsSink>>;

/// OneBot 出口：消息链序列化为 send_msg 动作帧写入 WebSocket
pub struct OneBotSink {
    writer: LockedWriter,
}

#[async_trait]
impl MessageSink for OneBotSink {
    async fn send(&self, target: &SendTarget, chain: &MessageChain) -> BotResult<()> {
        if chain.chain.is_empty() {
            return Ok(());
        }
        let message = chain_to_segments(chain);
        let params = if let Some(group_id) = target.group_id {
            json!({ "message_type": "group", "group_id": group_id, "message": message })
        } else {
            json!({ "message_type": "private", "user_id": target.user_id, "message": message })
        };
        let frame = json!({ "action": "send_msg", "params": params }).to_string();

        let mut writer = self.writer.lock().await;
        writer.send(WsMessage::Text(frame.into())).await?;
        Ok(())
    }
}

/// OneBot 正向 WebSocket 适配器
pub struct OneBotAdapter {
    url: String,
    access_token: Option<String>,
}

impl OneBotAdapter {
    pub fn new(url: String, access_token: Option<String>) -> Self {
        Self { url, access_token }
    }

    async fn connect_and_listen(&self, event_tx: &mpsc::Sender<MessageEvent>) -> BotResult<()> {
        let mut request = self.url.as_str().into_client_request()?;
        if let Some(token) = &self.access_token
            && !token.is_empty()
        {
            let header = format!("Bearer {}", token);
            request
                .headers_mut()
                .insert("Authorization", HeaderValue::from_str(&header)?);
        }

        let (ws_stream, _) = connect_async(request).await?;
        info!(target: "OneBot", "已连接 {}", self.url);

        let (write_half, mut read_half) = ws_stream.split();
        let writer: LockedWriter = Arc::new(AsyncMutex::new(Box::new(write_half)));
        let sink = Arc::new(OneBotSink { writer });

        while let Some(frame) = read_half.next().await {
            let frame = frame?;
            let WsMessage::Text(text) = frame else {
                continue;
            };
            let mut bytes = text.as_bytes().to_vec();
            let Ok(value) = simd_json::to_owned_value(&mut bytes) else {
                warn!(target: "OneBot", "无法解析的事件帧");
                continue;
            };
            if value.get_str("post_type") != Some("message") {
                continue;
            }
            if let Some(event) = build_event(&value, sink.clone())
                && event_tx.send(event).await.is_err()
            {
                break;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Adapter for OneBotAdapter {
    fn id(&self) -> &str {
        "onebot"
    }

    async fn run(&self, event_tx: mpsc::Sender<MessageEvent>) -> BotResult<()> {
        loop {
            match self.connect_and_listen(&event_tx).await {
                Ok(()) => warn!(target: "OneBot", "连接断开，3 秒后重连..."),
                Err(e) => error!(target: "OneBot", "连接失败: {}，3 秒后重试...", e),
            }
            tokio::time::sleep(Duration::from_secs(3)).await;
        }
    }
}

static CQ_CODE_REGEX: OnceLock<Regex> = OnceLock::new();

fn cq_code_regex() -> &'static Regex {
    CQ_CODE_REGEX.get_or_init(|| Regex::new(r"\[CQ:[^\]]*\]").expect("Invalid Regex"))
}

fn get_i64(value: &OwnedValue, key: &str) -> Option<i64> {
    value
        .get_i64(key)
        .or_else(|| value.get_u64(key).map(|v| v as i64))
}

/// 把 OneBot 消息事件转换为流水线事件
fn build_event(value: &OwnedValue, sink: Arc<OneBotSink>) -> Option<MessageEvent> {
    let message_type = value.get_str("message_type")?;
    let is_private = message_type == "private";
    let user_id = get_i64(value, "user_id").unwrap_or(0);
    let group_id = get_i64(value, "group_id");
    let self_id = get_i64(value, "self_id").unwrap_or(0);

    let sender_name = value
        .get("sender")
        .and_then(|s| {
            s.get_str("card")
                .filter(|c| !c.is_empty())
                .or_else(|| s.get_str("nickname"))
        })
        .unwrap_or("Unknown")
        .to_string();

    let (chain, is_at_bot) = parse_segments(value, self_id);
    if chain.chain.is_empty() {
        return None;
    }

    let session_id = if is_private {
        user_id.to_string()
    } else {
        group_id.unwrap_or(0).to_string()
    };

    let mut event = MessageEvent::new(
        "onebot",
        session_id,
        Sender {
            id: user_id.to_string(),
            name: sender_name,
        },
        chain,
        is_private,
        sink,
    );
    event.is_at_bot = is_at_bot;
    event.message_id = get_i64(value, "message_id")
        .map(|v| v.to_string())
        .unwrap_or_default();
    event.target = SendTarget {
        group_id,
        user_id: Some(user_id),
    };
    Some(event)
}

/// 解析 message 段数组，返回组件链与是否 @ 了机器人
fn parse_segments(value: &OwnedValue, self_id: i64) -> (MessageChain, bool) {
    let mut chain = MessageChain::new();
    let mut is_at_bot = false;

    let Some(items) = value.get("message").and_then(|m| m.as_array()) else {
        // 没有结构化消息段时退回 raw_message，CQ 码一律剥掉
        if let Some(raw) = value.get_str("raw_message") {
            let text = cq_code_regex().replace_all(raw, "");
            if !text.trim().is_empty() {
                chain = chain.text(text.trim());
            }
        }
        return (chain, false);
    };

    for item in items.iter() {
        let seg_type = item.get_str("type").unwrap_or("");
        let data = item.get("data");
        let comp = match seg_type {
            "text" => Component::Plain {
                text: data
                    .and_then(|d| d.get_str("text"))
                    .unwrap_or("")
                    .to_string(),
            },
            "image" => Component::Image {
                file: data
                    .and_then(|d| d.get_str("url").or_else(|| d.get_str("file")))
                    .unwrap_or("")
                    .to_string(),
            },
            "at" => {
                let qq = data.and_then(|d| d.get_str("qq")).unwrap_or("").to_string();
                if qq == "all" {
                    Component::AtAll
                } else {
                    if qq == self_id.to_string() {
                        is_at_bot = true;
                    }
                    Component::At {
                        qq,
                        name: String::new(),
                    }
                }
            }
            "reply" => Component::Reply {
                id: data.and_then(|d| d.get_str("id")).unwrap_or("").to_string(),
                sender_id: None,
            },
            "face" => Component::Face {
                id: data
                    .and_then(|d| d.get_str("id"))
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0),
            },
            "record" => Component::Record {
                file: data
                    .and_then(|d| d.get_str("file"))
                    .unwrap_or("")
                    .to_string(),
            },
            "video" => Component::Video {
                file: data
                    .and_then(|d| d.get_str("file"))
                    .unwrap_or("")
                    .to_string(),
            },
            other => Component::Unknown {
                raw: other.to_string(),
            },
        };
        chain.chain.push(comp);
    }

    (chain, is_at_bot)
}

/// 组件链转 OneBot 消息段
fn chain_to_segments(chain: &MessageChain) -> Vec<serde_json::Value> {
    chain
        .chain
        .iter()
        .filter_map(|comp| match comp {
            Component::Plain { text } => Some(json!({ "type": "text", "data": { "text": text } })),
            Component::Image { file } => {
                Some(json!({ "type": "image", "data": { "file": file } }))
            }
            Component::At { qq, .. } => Some(json!({ "type": "at", "data": { "qq": qq } })),
            Component::AtAll => Some(json!({ "type": "at", "data": { "qq": "all" } })),
            Component::Reply { id, .. } => Some(json!({ "type": "reply", "data": { "id": id } })),
            Component::Record { file } => {
                Some(json!({ "type": "record", "data": { "file": file } }))
            }
            Component::Video { file } => {
                Some(json!({ "type": "video", "data": { "file": file } }))
            }
            Component::Face { id } => {
                Some(json!({ "type": "face", "data": { "id": id.to_string() } }))
            }
            Component::File { file, name } => {
                Some(json!({ "type": "file", "data": { "file": file, "name": name } }))
            }
            // 其余组件没有对应的 OneBot 消息段
            _ => None,
        })
        .collect()
}
