use serde::Serialize;
use std::path::PathBuf;

use crate::{BotError, BotResult, error};

/// 消息组件 (Component)
///
/// 发送与接收共用的封闭组件集合。平台适配器解析不了的消息段
/// 落入 `Unknown`，在发送阶段会被当作错误处理。
#[derive(Debug, Serialize, Clone, PartialEq)]
pub enum Component {
    /// 纯文本
    Plain { text: String },
    /// 图片 (URL / 文件路径 / base64://)
    Image { file: String },
    /// @某人
    At { qq: String, name: String },
    /// @全体成员
    AtAll,
    /// 语音
    Record { file: String },
    /// 视频
    Video { file: String },
    /// 文件
    File { file: String, name: String },
    /// 表情 (ID)
    Face { id: i64 },
    /// 戳一戳
    Poke { id: i64, qq: i64 },
    /// 回复引用
    Reply { id: String, sender_id: Option<i64> },
    /// 转发节点
    Node { name: String, uin: i64, content: String },
    /// 合并转发引用
    Forward { id: String },
    /// 无法识别的消息段
    Unknown { raw: String },
}

impl Component {
    pub fn plain(text: impl Into<String>) -> Self {
        Component::Plain { text: text.into() }
    }

    /// 该组件是否携带了有意义的内容
    ///
    /// `Unknown` 不在此判断，由 [`MessageChain::is_empty_chain`] 单独处理。
    pub fn is_meaningful(&self) -> bool {
        match self {
            Component::Plain { text } => !text.trim().is_empty(),
            Component::Image { file } => !file.is_empty(),
            Component::At { qq, name } => !qq.is_empty() || !name.is_empty(),
            Component::AtAll => true,
            Component::Record { file } => !file.is_empty(),
            Component::Video { file } => !file.is_empty(),
            Component::File { file, .. } => !file.is_empty(),
            Component::Face { .. } => true,
            Component::Poke { id, qq } => *id != 0 && *qq != 0,
            Component::Reply { id, sender_id } => !id.is_empty() && sender_id.is_some(),
            Component::Node { name, uin, content } => {
                !name.is_empty() && *uin != 0 && !content.is_empty()
            }
            Component::Forward { id } => !id.trim().is_empty(),
            Component::Unknown { .. } => false,
        }
    }

    /// 日志用摘要
    fn outline(&self) -> String {
        match self {
            Component::Plain { text } => text.replace('\n', " "),
            Component::Image { .. } => "[图片]".to_string(),
            Component::At { qq, .. } => format!("[At:{}]", qq),
            Component::AtAll => "[At:全体]".to_string(),
            Component::Record { .. } => "[语音]".to_string(),
            Component::Video { .. } => "[视频]".to_string(),
            Component::File { name, .. } => format!("[文件:{}]", name),
            Component::Face { id } => format!("[表情:{}]", id),
            Component::Poke { .. } => "[戳一戳]".to_string(),
            Component::Reply { .. } => "[回复]".to_string(),
            Component::Node { .. } => "[转发节点]".to_string(),
            Component::Forward { .. } => "[合并转发]".to_string(),
            Component::Unknown { raw } => format!("[未知:{}]", raw),
        }
    }
}

/// 消息链 (Message Chain)
#[derive(Debug, Serialize, Clone, Default, PartialEq)]
pub struct MessageChain {
    pub chain: Vec<Component>,
}

impl MessageChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, comp: Component) -> Self {
        self.chain.push(comp);
        self
    }

    /// 纯文本
    pub fn text(self, text: impl Into<String>) -> Self {
        self.push(Component::Plain { text: text.into() })
    }

    /// 图片
    pub fn image(self, file: impl Into<String>) -> Self {
        self.push(Component::Image { file: file.into() })
    }

    /// @某人
    pub fn at(self, qq: impl ToString) -> Self {
        self.push(Component::At {
            qq: qq.to_string(),
            name: String::new(),
        })
    }

    /// 回复消息
    pub fn reply(self, message_id: impl ToString, sender_id: Option<i64>) -> Self {
        self.push(Component::Reply {
            id: message_id.to_string(),
            sender_id,
        })
    }

    /// 拼接所有纯文本组件
    pub fn plain_text(&self) -> String {
        self.chain
            .iter()
            .filter_map(|comp| match comp {
                Component::Plain { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// 检查消息链是否为空
    ///
    /// 任意一个组件有内容即视为非空；遇到 `Unknown` 组件直接
    /// 判空并记录错误，整条消息取消发送。该检查不修改消息链。
    pub fn is_empty_chain(&self) -> bool {
        if self.chain.is_empty() {
            return true;
        }
        for comp in &self.chain {
            if let Component::Unknown { raw } = comp {
                error!(target: "Message", "消息链中包含无法识别的组件: {}，停止事件传播", raw);
                return true;
            }
            if comp.is_meaningful() {
                return false;
            }
        }
        true
    }

    /// 日志用单行摘要
    pub fn outline(&self) -> String {
        let mut out = String::new();
        for comp in &self.chain {
            out.push_str(&comp.outline());
        }
        if out.chars().count() > 100 {
            let truncated: String = out.chars().take(100).collect();
            format!("{}...", truncated)
        } else {
            out
        }
    }
}

impl From<&str> for MessageChain {
    fn from(s: &str) -> Self {
        MessageChain::new().text(s)
    }
}

impl From<String> for MessageChain {
    fn from(s: String) -> Self {
        MessageChain::new().text(s)
    }
}

// ================== 图片落地 ==================

/// 把图片来源统一转换为本地文件路径
///
/// - `http(s)://` 下载到缓存目录，以 URL 的 md5 作为缓存键
/// - `base64://` 解码后写入缓存目录
/// - `file://` 去掉协议头
/// - 其余视为已经是本地路径
pub async fn resolve_image_to_path(file: &str) -> BotResult<String> {
    let cache_dir = cache_dir()?;

    if file.starts_with("http://") || file.starts_with("https://") {
        let digest = format!("{:x}", md5::compute(file.as_bytes()));
        let path = cache_dir.join(digest);
        if !path.exists() {
            let bytes = reqwest::get(file).await?.bytes().await?;
            tokio::fs::write(&path, &bytes).await?;
        }
        return Ok(path.to_string_lossy().into_owned());
    }

    if let Some(encoded) = file.strip_prefix("base64://") {
        use base64::Engine;
        let bytes = base64::engine::general_purpose::STANDARD.decode(encoded)?;
        let digest = format!("{:x}", md5::compute(&bytes));
        let path = cache_dir.join(digest);
        if !path.exists() {
            tokio::fs::write(&path, &bytes).await?;
        }
        return Ok(path.to_string_lossy().into_owned());
    }

    if let Some(stripped) = file.strip_prefix("file://") {
        return Ok(stripped.to_string());
    }

    Ok(file.to_string())
}

fn cache_dir() -> Result<PathBuf, BotError> {
    let dir = std::env::temp_dir().join("yunque_images");
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_plain_is_empty() {
        let chain = MessageChain::new().text("   \n\t ");
        assert!(chain.is_empty_chain());
    }

    #[test]
    fn any_meaningful_component_makes_chain_non_empty() {
        let chain = MessageChain::new().text("").image("a.png");
        assert!(!chain.is_empty_chain());
    }

    #[test]
    fn unknown_component_empties_whole_chain() {
        let chain = MessageChain::new()
            .text("有内容")
            .push(Component::Unknown {
                raw: "mface".to_string(),
            });
        assert!(chain.is_empty_chain());
    }

    #[test]
    fn emptiness_check_is_idempotent_and_non_mutating() {
        let chain = MessageChain::new().text("  ").at("123");
        let before = chain.clone();
        let first = chain.is_empty_chain();
        let second = chain.is_empty_chain();
        assert_eq!(first, second);
        assert_eq!(chain, before);
    }

    #[test]
    fn empty_reply_and_poke_are_not_meaningful() {
        assert!(!Component::Reply {
            id: String::new(),
            sender_id: Some(1),
        }
        .is_meaningful());
        assert!(!Component::Poke { id: 0, qq: 10 }.is_meaningful());
        assert!(Component::Poke { id: 1, qq: 10 }.is_meaningful());
    }

    #[test]
    fn outline_truncates_long_text() {
        let chain = MessageChain::new().text("很".repeat(200));
        let outline = chain.outline();
        assert!(outline.ends_with("..."));
        assert_eq!(outline.chars().count(), 103);
    }
}
