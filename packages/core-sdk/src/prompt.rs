use serde_json::Value;

use crate::error::{NodeError, NodeResult};
use crate::models::{ChatConfig, ChatTurn, Message};

pub const START_MARKER: &str = "[Start a new Chat]";
const HISTORY_WRAPPER_KEY: &str = "submit_history";

/**
 * \brief 按固定顺序将聊天配置组装为消息列表。
 * \details 顺序：预设 → 角色 → 场景 → 对话示例 → 格式要求 → 其他前置消息 → 开始标记
 *          → 角色首条消息 → 摘要 → 历史 → 用户消息。
 */
pub fn assemble(config: &ChatConfig) -> Vec<ChatTurn> {
    let mut messages: Vec<Message> = Vec::with_capacity(8);

    if let Some(preset) = present(&config.model_preset) {
        messages.push(Message::system(format!(
            "{}\nYou need to use {} as your name, and {} refer to user",
            preset, config.character_name, config.user_name
        )));
    }

    messages.push(Message::system(format!(
        "Character:{}",
        config.character_description
    )));

    if let Some(scenario) = present(&config.scenario) {
        messages.push(Message::system(format!("Scenario:{}", scenario)));
    }
    if let Some(example) = present(&config.message_example) {
        messages.push(Message::system(format!(
            "Here are examples of our conversation: {}",
            example
        )));
    }
    if let Some(guidelines) = present(&config.format_guidelines) {
        messages.push(Message::system(format!(
            "The conversation must follow the formats: {}",
            guidelines
        )));
    }
    if let Some(other) = present(&config.other_pre_msg) {
        messages.push(Message::system(other));
    }

    messages.push(Message::system(START_MARKER));
    messages.push(Message::assistant(
        config.first_message.as_str(),
        config.character_name.as_str(),
    ));

    if let Some(summary) = present(&config.chat_summary) {
        messages.push(Message::system(summary));
    }

    let mut turns: Vec<ChatTurn> = messages.into_iter().map(ChatTurn::from).collect();
    turns.extend(config.chat_history.iter().cloned().map(ChatTurn::History));
    turns.push(Message::user(config.message.as_str()).into());
    turns
}

/**
 * \brief 将宿主给出的开关与文本合并为可选段落。
 * \param flag 开关；缺省时仅由文本是否为空决定
 */
pub fn section(flag: Option<bool>, text: Option<&str>) -> Option<String> {
    if flag == Some(false) {
        return None;
    }
    text.filter(|t| !t.trim().is_empty()).map(|t| t.to_string())
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|t| !t.trim().is_empty())
}

/**
 * \brief 解析聊天历史。
 * \details 接受消息数组、`[{submit_history: [...]}]` 包装，或二者的 JSON 字符串形式；
 *          缺少 role/content 的条目被丢弃，其余条目原样保留。
 */
pub fn parse_chat_history(value: &Value) -> NodeResult<Vec<Value>> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::String(raw) => {
            if raw.trim().is_empty() {
                return Ok(Vec::new());
            }
            let parsed: Value = serde_json::from_str(raw).map_err(|e| {
                NodeError::Input(format!("chat history is not valid JSON: {}", e))
            })?;
            if parsed.is_string() {
                return Err(NodeError::Input(
                    "chat history must be an array of messages, got a string".to_string(),
                ));
            }
            parse_chat_history(&parsed)
        }
        Value::Array(items) => Ok(collect_entries(unwrap_history(items))),
        Value::Object(obj) => match obj.get(HISTORY_WRAPPER_KEY) {
            Some(Value::Array(inner)) => Ok(collect_entries(inner)),
            _ => Err(NodeError::Input(format!(
                "chat history must be an array of messages or a `{}` wrapper",
                HISTORY_WRAPPER_KEY
            ))),
        },
        other => Err(NodeError::Input(format!(
            "chat history must be an array of messages, got `{}`",
            other
        ))),
    }
}

fn unwrap_history(items: &[Value]) -> &[Value] {
    if let [only] = items {
        if let Some(wrapped) = only.get(HISTORY_WRAPPER_KEY) {
            return match wrapped {
                Value::Array(inner) => inner.as_slice(),
                _ => &[],
            };
        }
    }
    items
}

fn collect_entries(items: &[Value]) -> Vec<Value> {
    items.iter().filter(|item| is_history_entry(item)).cloned().collect()
}

fn is_history_entry(item: &Value) -> bool {
    let present = |key: &str| item.get(key).is_some_and(|v| !v.is_null());
    item.is_object() && present("role") && present("content")
}
