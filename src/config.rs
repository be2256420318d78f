use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::BotResult;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    // 全局唤醒前缀（群聊中命中任意一个即唤醒，支持多个，如 ["/", "小雀"]）
    #[serde(default = "default_wake_prefix")]
    pub wake_prefix: Vec<String>,

    // LLM 提供商配置
    #[serde(default)]
    pub provider: ProviderConfig,

    // 平台回复行为配置
    #[serde(default)]
    pub platform_settings: PlatformSettings,

    // Bot 连接配置
    #[serde(default = "default_bots")]
    pub bots: Vec<BotConfig>,

    // sqlite 数据库路径
    #[serde(default = "default_db_path")]
    pub database_path: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProviderConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_api_base")]
    pub api_base: String,

    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_model")]
    pub model: String,

    // 系统提示词（人设）
    #[serde(default)]
    pub system_prompt: String,

    // 提供商级唤醒前缀：非空时，仅带此前缀的消息会请求 LLM
    #[serde(default)]
    pub wake_prefix: String,

    // 携带的最大对话轮数，-1 表示不限制
    #[serde(default = "default_max_context")]
    pub max_context_length: i64,

    // 超限时一次丢弃的对话轮数
    #[serde(default = "default_dequeue_context")]
    pub dequeue_context_length: i64,

    // 流式响应
    #[serde(default)]
    pub streaming_response: bool,

    // 单次请求超时（秒）
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct PlatformSettings {
    // 回复时 @ 发送者
    #[serde(default)]
    pub reply_with_mention: bool,

    // 回复时引用原消息
    #[serde(default)]
    pub reply_with_quote: bool,

    #[serde(default)]
    pub segmented_reply: SegmentedReplyConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SegmentedReplyConfig {
    #[serde(default)]
    pub enable: bool,

    // 仅对 LLM 结果分段
    #[serde(default = "default_true")]
    pub only_llm_result: bool,

    // "log" 或 "random"
    #[serde(default = "default_interval_method")]
    pub interval_method: String,

    // random 方法的区间，格式 "min,max"
    #[serde(default = "default_interval")]
    pub interval: String,

    // log 方法的对数底
    #[serde(default = "default_log_base")]
    pub log_base: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BotConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    // 协议类型 ("console" 或 "onebot")
    #[serde(default = "default_protocol")]
    pub protocol: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

impl AppConfig {
    /// 读取配置文件，不存在时生成默认配置并落盘
    pub async fn load_or_create(path: &str) -> BotResult<Self> {
        match fs::read_to_string(path).await {
            Ok(content) => Ok(toml::from_str(&content)?),
            Err(_) => {
                let config = Self::default();
                config.save(path).await?;
                Ok(config)
            }
        }
    }

    /// 先写临时文件再改名，避免中途崩溃损坏配置
    pub async fn save(&self, path: &str) -> BotResult<()> {
        let toml_string = toml::to_string_pretty(self)?;
        let tmp_path = format!("{}.tmp", path);
        fs::write(&tmp_path, toml_string).await?;
        fs::rename(&tmp_path, path).await?;
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            wake_prefix: default_wake_prefix(),
            provider: ProviderConfig::default(),
            platform_settings: PlatformSettings::default(),
            bots: default_bots(),
            database_path: default_db_path(),
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_base: default_api_base(),
            api_key: String::new(),
            model: default_model(),
            system_prompt: String::new(),
            wake_prefix: String::new(),
            max_context_length: default_max_context(),
            dequeue_context_length: default_dequeue_context(),
            streaming_response: false,
            timeout_secs: default_timeout(),
        }
    }
}

impl Default for SegmentedReplyConfig {
    fn default() -> Self {
        Self {
            enable: false,
            only_llm_result: true,
            interval_method: default_interval_method(),
            interval: default_interval(),
            log_base: default_log_base(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_wake_prefix() -> Vec<String> {
    vec!["/".to_string()]
}

fn default_api_base() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_max_context() -> i64 {
    -1
}

fn default_dequeue_context() -> i64 {
    3
}

fn default_timeout() -> u64 {
    120
}

fn default_interval_method() -> String {
    "random".to_string()
}

fn default_interval() -> String {
    "1.5,3.5".to_string()
}

fn default_log_base() -> f64 {
    2.6
}

fn default_protocol() -> String {
    "console".to_string()
}

fn default_bots() -> Vec<BotConfig> {
    vec![
        // 控制台适配器：开箱即用
        BotConfig {
            enabled: true,
            protocol: "console".to_string(),
            url: None,
            access_token: None,
        },
        // OneBot 适配器：生成配置占位符，默认禁用以防误连
        BotConfig {
            enabled: false,
            protocol: "onebot".to_string(),
            url: Some("ws://127.0.0.1:3001".to_string()),
            access_token: Some("YOUR_TOKEN_HERE".to_string()),
        },
    ]
}

fn default_db_path() -> String {
    "yunque.db".to_string()
}
