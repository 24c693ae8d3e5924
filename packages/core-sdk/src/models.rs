use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::NodeError;

/**
 * \brief 上游服务类型，决定请求地址、请求头与响应解析方式。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    #[serde(alias = "openai-compatible")]
    OpenAI,
    #[serde(alias = "claude")]
    Anthropic,
    Ollama,
}

impl ProviderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderType::OpenAI => "openai",
            ProviderType::Anthropic => "anthropic",
            ProviderType::Ollama => "ollama",
        }
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderType {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" | "openai-compatible" => Ok(ProviderType::OpenAI),
            "anthropic" | "claude" => Ok(ProviderType::Anthropic),
            "ollama" => Ok(ProviderType::Ollama),
            other => Err(NodeError::Configuration(format!(
                "unknown provider type `{}` (expected openai, anthropic or ollama)",
                other
            ))),
        }
    }
}

/**
 * \brief 已解析的凭据，每次执行解析一次，之后只读。
 */
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    /** \brief API Key，Ollama 可为空 */
    pub api_key: String,
    /** \brief API 基地址 */
    pub base_url: String,
    /** \brief Provider 类型 */
    pub provider_type: ProviderType,
}

impl ProviderConfig {
    /**
     * \brief 去掉结尾斜杠后的基地址。
     */
    pub fn base(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    pub fn has_api_key(&self) -> bool {
        !self.api_key.trim().is_empty()
    }
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("base_url", &self.base_url)
            .field("provider_type", &self.provider_type)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

/**
 * \brief 消息结构，与 OpenAI Chat 消息格式对齐。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /** \brief 角色：system/user/assistant */
    pub role: String,
    /** \brief 内容 */
    pub content: String,
    /** \brief 发言者名称，仅角色首条消息与部分历史消息携带 */
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
            name: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
            name: None,
        }
    }

    pub fn assistant(content: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
            name: Some(name.into()),
        }
    }
}

/**
 * \brief 组装结果中的一轮对话。
 * \details 节点生成的消息为 `Message`；宿主给出的历史条目按原 JSON 对象保留，
 *          序列化时不做任何改写。
 */
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ChatTurn {
    Message(Message),
    History(Value),
}

impl ChatTurn {
    pub fn role(&self) -> Option<&str> {
        match self {
            ChatTurn::Message(m) => Some(m.role.as_str()),
            ChatTurn::History(v) => v.get("role").and_then(Value::as_str),
        }
    }

    pub fn content(&self) -> Option<&str> {
        match self {
            ChatTurn::Message(m) => Some(m.content.as_str()),
            ChatTurn::History(v) => v.get("content").and_then(Value::as_str),
        }
    }
}

impl From<Message> for ChatTurn {
    fn from(message: Message) -> Self {
        ChatTurn::Message(message)
    }
}

impl PartialEq<Message> for ChatTurn {
    fn eq(&self, other: &Message) -> bool {
        matches!(self, ChatTurn::Message(m) if m == other)
    }
}

/**
 * \brief 单次调用的聊天配置。
 * \details 可选段落以 `Option` 表示，只有去除空白后非空的文本才会参与组装。
 */
#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub character_name: String,
    pub character_description: String,
    pub first_message: String,
    pub user_name: String,
    pub scenario: Option<String>,
    pub message_example: Option<String>,
    pub model_preset: Option<String>,
    pub format_guidelines: Option<String>,
    pub other_pre_msg: Option<String>,
    pub chat_summary: Option<String>,
    /** \brief 已校验的历史条目，保持宿主给出的原样 */
    pub chat_history: Vec<Value>,
    pub message: String,
    pub model_id: String,
    pub temperature: f64,
    /** \brief 原样并入请求体的采样参数，如 `max_tokens`、`top_p` */
    pub additional_fields: Map<String, Value>,
    /** \brief 自由文本的对象片段，解析后覆盖默认字段 */
    pub extra_body: Option<String>,
}

pub const DEFAULT_USER_NAME: &str = "you";
pub const DEFAULT_TEMPERATURE: f64 = 0.9;

impl ChatConfig {
    /**
     * \brief 以必填字段构造配置，其余字段取默认值。
     */
    pub fn new(
        character_name: impl Into<String>,
        character_description: impl Into<String>,
        first_message: impl Into<String>,
        message: impl Into<String>,
        model_id: impl Into<String>,
    ) -> Self {
        Self {
            character_name: character_name.into(),
            character_description: character_description.into(),
            first_message: first_message.into(),
            user_name: DEFAULT_USER_NAME.to_string(),
            scenario: None,
            message_example: None,
            model_preset: None,
            format_guidelines: None,
            other_pre_msg: None,
            chat_summary: None,
            chat_history: Vec::new(),
            message: message.into(),
            model_id: model_id.into(),
            temperature: DEFAULT_TEMPERATURE,
            additional_fields: Map::new(),
            extra_body: None,
        }
    }
}

/**
 * \brief 模型列表条目，仅用于填充下拉选项。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub name: String,
    pub description: String,
}

/**
 * \brief 脱敏后的请求快照，供调试输出。
 */
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestDescriptor {
    pub url: String,
    pub headers: Map<String, Value>,
    pub body: Value,
}
