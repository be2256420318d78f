use std::collections::BTreeMap;
use std::time::Duration;

use async_openai::{
    Client,
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionMessageToolCall, ChatCompletionMessageToolCalls,
        ChatCompletionRequestAssistantMessageArgs,
        ChatCompletionRequestMessage, ChatCompletionRequestMessageContentPartImageArgs,
        ChatCompletionRequestMessageContentPartTextArgs, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestToolMessageArgs, ChatCompletionRequestUserMessageArgs,
        ChatCompletionRequestUserMessageContentPart, ChatCompletionTool, ChatCompletionTools,
        CreateChatCompletionRequestArgs, FunctionCall, FunctionObjectArgs, ImageUrlArgs,
    },
};
use async_trait::async_trait;
use base64::Engine;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde_json::Value;

use crate::config::ProviderConfig;
use crate::provider::{LlmResponse, Provider, ProviderRequest, ToolCall};
use crate::{BotResult, debug};

/// OpenAI 兼容接口的提供商
pub struct OpenAiProvider {
    client: Client<OpenAIConfig>,
    model: String,
    timeout: Duration,
}

impl OpenAiProvider {
    pub fn new(config: &ProviderConfig) -> Self {
        let client = Client::with_config(
            OpenAIConfig::new()
                .with_api_base(&config.api_base)
                .with_api_key(&config.api_key),
        );
        Self {
            client,
            model: config.model.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// 把一次请求装配成 OpenAI 消息列表：
    /// system + 历史上下文 + 本次用户输入 + 上一轮工具结果
    async fn build_messages(
        &self,
        req: &ProviderRequest,
    ) -> BotResult<Vec<ChatCompletionRequestMessage>> {
        let mut msgs: Vec<ChatCompletionRequestMessage> = Vec::new();

        if !req.system_prompt.is_empty() {
            msgs.push(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(req.system_prompt.as_str())
                    .build()?
                    .into(),
            );
        }

        for entry in &req.contexts {
            if let Some(msg) = value_to_message(entry)? {
                msgs.push(msg);
            }
        }

        // 本次用户输入
        if req.image_urls.is_empty() {
            msgs.push(
                ChatCompletionRequestUserMessageArgs::default()
                    .content(req.prompt.as_str())
                    .build()?
                    .into(),
            );
        } else {
            let mut parts: Vec<ChatCompletionRequestUserMessageContentPart> = Vec::new();
            if !req.prompt.is_empty() {
                parts.push(
                    ChatCompletionRequestMessageContentPartTextArgs::default()
                        .text(req.prompt.as_str())
                        .build()?
                        .into(),
                );
            }
            for path in &req.image_urls {
                let url = to_image_url(path).await?;
                parts.push(
                    ChatCompletionRequestMessageContentPartImageArgs::default()
                        .image_url(ImageUrlArgs::default().url(url).build()?)
                        .build()?
                        .into(),
                );
            }
            msgs.push(
                ChatCompletionRequestUserMessageArgs::default()
                    .content(parts)
                    .build()?
                    .into(),
            );
        }

        if let Some(tcr) = &req.tool_calls_result {
            for entry in tcr.to_openai_messages() {
                if let Some(msg) = value_to_message(&entry)? {
                    msgs.push(msg);
                }
            }
        }

        Ok(msgs)
    }

    fn build_tools(&self, req: &ProviderRequest) -> BotResult<Option<Vec<ChatCompletionTools>>> {
        let Some(tool_set) = &req.func_tool else {
            return Ok(None);
        };
        if tool_set.is_empty() {
            return Ok(None);
        }
        let mut tools = Vec::new();
        for tool in tool_set.tools() {
            tools.push(ChatCompletionTools::Function(ChatCompletionTool {
                function: FunctionObjectArgs::default()
                    .name(tool.name.as_str())
                    .description(tool.description.as_str())
                    .parameters(tool.parameters.clone())
                    .build()?,
            }));
        }
        Ok(Some(tools))
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    async fn text_chat(&self, req: &ProviderRequest) -> BotResult<LlmResponse> {
        let msgs = self.build_messages(req).await?;
        let mut builder = CreateChatCompletionRequestArgs::default();
        builder.model(&self.model).messages(msgs);
        if let Some(tools) = self.build_tools(req)? {
            builder.tools(tools);
        }
        let request = builder.build()?;

        let resp = match tokio::time::timeout(self.timeout, self.client.chat().create(request)).await
        {
            Ok(result) => result?,
            Err(_) => return Err("模型响应超时".into()),
        };

        let choice = resp.choices.into_iter().next().ok_or("响应中没有候选")?;
        let message = choice.message;
        let content = message.content.unwrap_or_default();

        if let Some(calls) = message.tool_calls
            && !calls.is_empty()
        {
            let mut resp = LlmResponse::tool(parse_tool_calls(&calls));
            resp.completion_text = content;
            return Ok(resp);
        }
        Ok(LlmResponse::assistant(content))
    }

    async fn text_chat_stream(
        &self,
        req: &ProviderRequest,
    ) -> BotResult<BoxStream<'static, BotResult<LlmResponse>>> {
        let msgs = self.build_messages(req).await?;
        let mut builder = CreateChatCompletionRequestArgs::default();
        builder.model(&self.model).messages(msgs).stream(true);
        if let Some(tools) = self.build_tools(req)? {
            builder.tools(tools);
        }
        let request = builder.build()?;

        let inner = self.client.chat().create_stream(request).await?;

        struct StreamState<S> {
            inner: S,
            text: String,
            calls: BTreeMap<u32, (String, String, String)>,
            finished: bool,
        }

        let state = StreamState {
            inner,
            text: String::new(),
            calls: BTreeMap::new(),
            finished: false,
        };

        let stream = futures_util::stream::unfold(state, |mut st| async move {
            if st.finished {
                return None;
            }
            loop {
                match st.inner.next().await {
                    Some(Ok(chunk)) => {
                        let Some(choice) = chunk.choices.first() else {
                            continue;
                        };
                        if let Some(tool_calls) = &choice.delta.tool_calls {
                            for tc in tool_calls {
                                let slot = st.calls.entry(tc.index as u32).or_default();
                                if let Some(id) = &tc.id {
                                    slot.0.push_str(id);
                                }
                                if let Some(f) = &tc.function {
                                    if let Some(name) = &f.name {
                                        slot.1.push_str(name);
                                    }
                                    if let Some(args) = &f.arguments {
                                        slot.2.push_str(args);
                                    }
                                }
                            }
                        }
                        if let Some(content) = &choice.delta.content
                            && !content.is_empty()
                        {
                            st.text.push_str(content);
                            return Some((Ok(LlmResponse::chunk(content.clone())), st));
                        }
                    }
                    Some(Err(e)) => {
                        st.finished = true;
                        return Some((Err(e.into()), st));
                    }
                    None => {
                        st.finished = true;
                        let resp = if st.calls.is_empty() {
                            LlmResponse::assistant(st.text.clone())
                        } else {
                            let calls = st
                                .calls
                                .values()
                                .map(|(id, name, args)| ToolCall {
                                    name: name.clone(),
                                    args: serde_json::from_str(args)
                                        .unwrap_or(Value::Object(Default::default())),
                                    id: id.clone(),
                                })
                                .collect();
                            let mut resp = LlmResponse::tool(calls);
                            resp.completion_text = st.text.clone();
                            resp
                        };
                        debug!(target: "Provider", "流式响应结束，共 {} 字符", st.text.chars().count());
                        return Some((Ok(resp), st));
                    }
                }
            }
        });

        Ok(stream.boxed())
    }

    fn model(&self) -> String {
        self.model.clone()
    }

    fn provider_type(&self) -> &str {
        "openai"
    }
}

fn parse_tool_calls(calls: &[ChatCompletionMessageToolCalls]) -> Vec<ToolCall> {
    calls
        .iter()
        .filter_map(|call| match call {
            ChatCompletionMessageToolCalls::Function(call) => Some(ToolCall {
                name: call.function.name.clone(),
                args: serde_json::from_str(&call.function.arguments)
                    .unwrap_or(Value::Object(Default::default())),
                id: call.id.clone(),
            }),
            ChatCompletionMessageToolCalls::Custom(_) => None,
        })
        .collect()
}

/// 把历史条目（OpenAI 消息格式的 JSON）转换为请求消息
fn value_to_message(entry: &Value) -> BotResult<Option<ChatCompletionRequestMessage>> {
    let role = entry.get("role").and_then(|r| r.as_str()).unwrap_or("");
    let content = entry
        .get("content")
        .and_then(|c| c.as_str())
        .unwrap_or("")
        .to_string();
    match role {
        "user" => Ok(Some(
            ChatCompletionRequestUserMessageArgs::default()
                .content(content)
                .build()?
                .into(),
        )),
        "assistant" => {
            let mut builder = ChatCompletionRequestAssistantMessageArgs::default();
            builder.content(content);
            if let Some(calls) = entry.get("tool_calls").and_then(|c| c.as_array())
                && !calls.is_empty()
            {
                let tool_calls: Vec<ChatCompletionMessageToolCalls> = calls
                    .iter()
                    .map(|call| {
                        ChatCompletionMessageToolCalls::Function(ChatCompletionMessageToolCall {
                            id: call["id"].as_str().unwrap_or("").to_string(),
                            function: FunctionCall {
                                name: call["function"]["name"].as_str().unwrap_or("").to_string(),
                                arguments: call["function"]["arguments"]
                                    .as_str()
                                    .unwrap_or("{}")
                                    .to_string(),
                            },
                        })
                    })
                    .collect();
                builder.tool_calls(tool_calls);
            }
            Ok(Some(builder.build()?.into()))
        }
        "tool" => Ok(Some(
            ChatCompletionRequestToolMessageArgs::default()
                .content(content)
                .tool_call_id(
                    entry
                        .get("tool_call_id")
                        .and_then(|i| i.as_str())
                        .unwrap_or(""),
                )
                .build()?
                .into(),
        )),
        "system" => Ok(Some(
            ChatCompletionRequestSystemMessageArgs::default()
                .content(content)
                .build()?
                .into(),
        )),
        // 带内部标记或未知角色的条目跳过
        _ => Ok(None),
    }
}

/// 本地图片转 data URL，网络地址原样传递
async fn to_image_url(path: &str) -> BotResult<String> {
    if path.starts_with("http://") || path.starts_with("https://") {
        return Ok(path.to_string());
    }
    let bytes = tokio::fs::read(path).await?;
    let mime = match path.rsplit('.').next() {
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "image/jpeg",
    };
    let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
    Ok(format!("data:{};base64,{}", mime, encoded))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn context_entry_roles_map_to_messages() {
        let user = value_to_message(&json!({ "role": "user", "content": "你好" })).unwrap();
        assert!(user.is_some());

        let tool = value_to_message(
            &json!({ "role": "tool", "tool_call_id": "c1", "content": "晴" }),
        )
        .unwrap();
        assert!(tool.is_some());

        let unknown = value_to_message(&json!({ "role": "err", "content": "x" })).unwrap();
        assert!(unknown.is_none());
    }

    #[test]
    fn assistant_entry_keeps_tool_calls() {
        let entry = json!({
            "role": "assistant",
            "content": "",
            "tool_calls": [{
                "id": "c1",
                "type": "function",
                "function": { "name": "weather", "arguments": "{\"city\":\"北京\"}" },
            }],
        });
        let msg = value_to_message(&entry).unwrap();
        assert!(msg.is_some());
    }
}
