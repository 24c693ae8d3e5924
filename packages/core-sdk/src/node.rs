use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{NodeError, NodeResult};
use crate::models::{
    ChatConfig, ChatTurn, Message, ProviderConfig, RequestDescriptor, DEFAULT_TEMPERATURE,
    DEFAULT_USER_NAME,
};
use crate::{llm, prompt, telemetry};

/**
 * \brief 节点操作：`chat` 组装并发送对话；`custom` 直接输出凭据字段。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    #[default]
    Chat,
    Custom,
}

impl FromStr for Operation {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chat" => Ok(Operation::Chat),
            "custom" => Ok(Operation::Custom),
            other => Err(NodeError::Configuration(format!(
                "unknown operation `{}` (expected chat or custom)",
                other
            ))),
        }
    }
}

/**
 * \brief 宿主按条目传入的参数，键名与节点属性一致（camelCase）。
 * \details 每个可选段落由 `useXxx` 开关与文本组成；开关缺省时以文本是否为空为准。
 */
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeParameters {
    pub character_name: String,
    pub character_description: String,
    pub first_message: String,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub use_model_preset: Option<bool>,
    #[serde(default)]
    pub model_preset: Option<String>,
    #[serde(default)]
    pub use_scenario: Option<bool>,
    #[serde(default)]
    pub scenario: Option<String>,
    #[serde(default)]
    pub use_message_example: Option<bool>,
    #[serde(default)]
    pub message_example: Option<String>,
    #[serde(default)]
    pub use_format_guidelines: Option<bool>,
    #[serde(default)]
    pub format_guidelines: Option<String>,
    #[serde(default)]
    pub use_other_pre_msg: Option<bool>,
    #[serde(default)]
    pub other_pre_msg: Option<String>,
    #[serde(default)]
    pub use_chat_summary: Option<bool>,
    #[serde(default)]
    pub chat_summary: Option<String>,
    #[serde(default)]
    pub use_chat_history: Option<bool>,
    #[serde(default)]
    pub chat_history: Option<Value>,
    pub message: String,
    /** \brief 从模型列表中选中的模型 */
    #[serde(default)]
    pub model: Option<String>,
    /** \brief 手填模型名，非空时覆盖 `model` */
    #[serde(default)]
    pub custom_model: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default)]
    pub additional_fields: Map<String, Value>,
    #[serde(default)]
    pub extra_body: Option<String>,
    #[serde(default)]
    pub options: NodeOptions,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeOptions {
    /** \brief 输出完整消息列表（含助手回复） */
    #[serde(default)]
    pub raw_output: bool,
    /** \brief 输出脱敏后的请求快照 */
    #[serde(default)]
    pub include_request_log: bool,
}

fn default_temperature() -> f64 {
    DEFAULT_TEMPERATURE
}

impl NodeParameters {
    /**
     * \brief 从单个条目的 JSON 参数解析。
     */
    pub fn from_item(item: &Value) -> NodeResult<Self> {
        NodeParameters::deserialize(item)
            .map_err(|e| NodeError::Input(format!("invalid item parameters: {}", e)))
    }

    /**
     * \brief 将开关/文本对折叠为 `ChatConfig`，之后不再出现开关。
     */
    pub fn to_chat_config(&self) -> NodeResult<ChatConfig> {
        let model_id = [&self.custom_model, &self.model]
            .into_iter()
            .filter_map(|m| m.as_deref().map(str::trim))
            .find(|m| !m.is_empty())
            .ok_or_else(|| {
                NodeError::Configuration("a model must be selected or entered".to_string())
            })?;

        let chat_history = match (&self.use_chat_history, &self.chat_history) {
            (Some(false), _) | (_, None) => Vec::new(),
            (_, Some(raw)) => prompt::parse_chat_history(raw)?,
        };

        let user_name = self
            .user_name
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .unwrap_or(DEFAULT_USER_NAME);

        Ok(ChatConfig {
            character_name: self.character_name.clone(),
            character_description: self.character_description.clone(),
            first_message: self.first_message.clone(),
            user_name: user_name.to_string(),
            scenario: prompt::section(self.use_scenario, self.scenario.as_deref()),
            message_example: prompt::section(
                self.use_message_example,
                self.message_example.as_deref(),
            ),
            model_preset: prompt::section(self.use_model_preset, self.model_preset.as_deref()),
            format_guidelines: prompt::section(
                self.use_format_guidelines,
                self.format_guidelines.as_deref(),
            ),
            other_pre_msg: prompt::section(self.use_other_pre_msg, self.other_pre_msg.as_deref()),
            chat_summary: prompt::section(self.use_chat_summary, self.chat_summary.as_deref()),
            chat_history,
            message: self.message.clone(),
            model_id: model_id.to_string(),
            temperature: self.temperature,
            additional_fields: self.additional_fields.clone(),
            extra_body: self.extra_body.clone(),
        })
    }
}

/**
 * \brief `chat` 操作的单条输出。
 */
#[derive(Debug, Clone, Serialize)]
pub struct ChatOutput {
    pub response: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_data: Option<Vec<ChatTurn>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<RequestDescriptor>,
}

/**
 * \brief 按顺序逐条执行。
 * \param continue_on_fail 为 true 时单条失败写入 `{error}` 并继续，否则首个错误中止整批
 */
pub async fn execute(
    provider: &ProviderConfig,
    operation: Operation,
    items: &[Value],
    continue_on_fail: bool,
) -> NodeResult<Vec<Value>> {
    let mut results = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let outcome = match operation {
            Operation::Chat => run_chat_item(provider, item).await.map(|out| json!(out)),
            Operation::Custom => Ok(json!(provider)),
        };
        match outcome {
            Ok(value) => results.push(value),
            Err(err) => {
                telemetry::log_error("node.execute", &format!("item={} {}", index, err));
                if !continue_on_fail {
                    return Err(err);
                }
                results.push(json!({ "error": err.to_string() }));
            }
        }
    }
    Ok(results)
}

/**
 * \brief 处理单个条目：解析参数 → 组装消息 → 构造请求 → 发送 → 整理输出。
 */
pub async fn run_chat_item(provider: &ProviderConfig, item: &Value) -> NodeResult<ChatOutput> {
    let params = NodeParameters::from_item(item)?;
    let config = params.to_chat_config()?;
    let messages = prompt::assemble(&config);
    let request = llm::build_request(&messages, &config, provider)?;

    telemetry::log_event(
        "node.chat",
        &format!(
            "provider={} model={} msgs={} history={}",
            provider.provider_type,
            config.model_id,
            messages.len(),
            config.chat_history.len()
        ),
    );

    let response = llm::chat_once(&request, provider.provider_type).await?;

    let log = params
        .options
        .include_request_log
        .then(|| llm::request_log(&request));
    let raw_data = params.options.raw_output.then(|| {
        let mut raw = messages;
        raw.push(
            Message::assistant(response.as_str(), config.character_name.as_str()).into(),
        );
        raw
    });

    Ok(ChatOutput {
        response,
        raw_data,
        log,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProviderType;
    use mockito::Matcher;

    fn watson_item() -> Value {
        json!({
            "characterName": "Dr. Watson",
            "characterDescription": "medical professional",
            "firstMessage": "Good day.",
            "message": "I have a fever.",
            "model": "gpt-4o-mini",
            "temperature": 0.9
        })
    }

    fn openai(base_url: &str) -> ProviderConfig {
        ProviderConfig {
            api_key: "sk-test".to_string(),
            base_url: base_url.to_string(),
            provider_type: ProviderType::OpenAI,
        }
    }

    #[test]
    fn test_operation_parse() {
        assert_eq!("Chat".parse::<Operation>().unwrap(), Operation::Chat);
        assert_eq!("custom".parse::<Operation>().unwrap(), Operation::Custom);
        assert!("delete".parse::<Operation>().is_err());
    }

    #[test]
    fn test_flags_gate_sections() {
        let mut item = watson_item();
        item["useScenario"] = json!(false);
        item["scenario"] = json!("Baker Street");
        item["messageExample"] = json!("<START>");
        item["useFormatGuidelines"] = json!(true);
        item["formatGuidelines"] = json!("  ");
        item["useChatSummary"] = json!(true);
        item["chatSummary"] = json!("Met before.");

        let cfg = NodeParameters::from_item(&item)
            .and_then(|p| p.to_chat_config())
            .expect("config");
        assert_eq!(cfg.scenario, None);
        assert_eq!(cfg.message_example.as_deref(), Some("<START>"));
        assert_eq!(cfg.format_guidelines, None);
        assert_eq!(cfg.chat_summary.as_deref(), Some("Met before."));
        assert_eq!(cfg.user_name, DEFAULT_USER_NAME);
        assert_eq!(cfg.temperature, 0.9);
    }

    #[test]
    fn test_custom_model_overrides_selection() {
        let mut item = watson_item();
        item["customModel"] = json!(" my-finetune ");
        let cfg = NodeParameters::from_item(&item)
            .and_then(|p| p.to_chat_config())
            .expect("config");
        assert_eq!(cfg.model_id, "my-finetune");

        let mut item = watson_item();
        item["model"] = json!("");
        let err = NodeParameters::from_item(&item)
            .and_then(|p| p.to_chat_config())
            .unwrap_err();
        assert!(matches!(err, NodeError::Configuration(_)));
    }

    #[test]
    fn test_history_flag_and_parsing() {
        let mut item = watson_item();
        item["chatHistory"] = json!([{"submit_history": [{"role": "user", "content": "hi"}]}]);
        let cfg = NodeParameters::from_item(&item)
            .and_then(|p| p.to_chat_config())
            .expect("config");
        assert_eq!(cfg.chat_history, vec![json!({"role": "user", "content": "hi"})]);

        item["useChatHistory"] = json!(false);
        let cfg = NodeParameters::from_item(&item)
            .and_then(|p| p.to_chat_config())
            .expect("config");
        assert!(cfg.chat_history.is_empty());

        item["useChatHistory"] = json!(true);
        item["chatHistory"] = json!("{broken");
        let err = NodeParameters::from_item(&item)
            .and_then(|p| p.to_chat_config())
            .unwrap_err();
        assert!(matches!(err, NodeError::Input(_)));
    }

    #[test]
    fn test_missing_required_field_is_input_error() {
        let err = NodeParameters::from_item(&json!({"characterName": "x"})).unwrap_err();
        assert!(matches!(err, NodeError::Input(_)));
    }

    #[tokio::test]
    async fn test_watson_end_to_end() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .match_body(Matcher::PartialJson(json!({
                "model": "gpt-4o-mini",
                "temperature": 0.9,
                "messages": [
                    {"role": "system", "content": "Character:medical professional"},
                    {"role": "system", "content": "[Start a new Chat]"},
                    {"role": "assistant", "content": "Good day.", "name": "Dr. Watson"},
                    {"role": "user", "content": "I have a fever."}
                ]
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"choices":[{"message":{"content":" Take rest. "}}]}"#)
            .create_async()
            .await;

        let out = execute(&openai(&server.url()), Operation::Chat, &[watson_item()], false)
            .await
            .expect("execute");
        assert_eq!(out, vec![json!({"response": "Take rest."})]);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_history_entries_sent_as_given() {
        let entry = json!({
            "role": "user",
            "content": [{"type": "text", "text": "hi"}],
            "tool_call_id": "t1"
        });
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .match_body(Matcher::PartialJson(json!({
                "messages": [
                    {"role": "system", "content": "Character:medical professional"},
                    {"role": "system", "content": "[Start a new Chat]"},
                    {"role": "assistant", "content": "Good day.", "name": "Dr. Watson"},
                    entry.clone(),
                    {"role": "user", "content": "I have a fever."}
                ]
            })))
            .with_status(200)
            .with_body(r#"{"choices":[{"message":{"content":"Noted."}}]}"#)
            .create_async()
            .await;

        let mut item = watson_item();
        item["useChatHistory"] = json!(true);
        item["chatHistory"] = json!([{ "submit_history": [entry] }]);
        let out = run_chat_item(&openai(&server.url()), &item)
            .await
            .expect("run item");
        assert_eq!(out.response, "Noted.");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_raw_output_and_request_log() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_body(r#"{"choices":[{"message":{"content":"Rest well."}}]}"#)
            .create_async()
            .await;

        let mut item = watson_item();
        item["options"] = json!({"rawOutput": true, "includeRequestLog": true});
        let out = run_chat_item(&openai(&server.url()), &item)
            .await
            .expect("run item");

        let raw = out.raw_data.expect("raw data");
        assert_eq!(raw.len(), 5);
        assert_eq!(raw[4], Message::assistant("Rest well.", "Dr. Watson"));

        let log = out.log.expect("request log");
        assert_eq!(log.body["messages"], json!("[4 messages redacted]"));
        assert_eq!(log.headers["authorization"], json!("[REDACTED]"));
    }

    #[tokio::test]
    async fn test_continue_on_fail_captures_item_errors() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_body(r#"{"choices":[{"message":{"content":"ok"}}]}"#)
            .create_async()
            .await;

        let provider = openai(&server.url());
        let items = vec![json!({"characterName": "x"}), watson_item()];

        let out = execute(&provider, Operation::Chat, &items, true)
            .await
            .expect("tolerant execute");
        assert_eq!(out.len(), 2);
        assert!(out[0]["error"]
            .as_str()
            .unwrap_or_default()
            .starts_with("input error"));
        assert_eq!(out[1], json!({"response": "ok"}));

        let err = execute(&provider, Operation::Chat, &items, false)
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::Input(_)));
    }

    #[tokio::test]
    async fn test_response_shape_error_per_item() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_body(r#"{"choices":[]}"#)
            .create_async()
            .await;

        let out = execute(&openai(&server.url()), Operation::Chat, &[watson_item()], true)
            .await
            .expect("tolerant execute");
        let msg = out[0]["error"].as_str().expect("error message");
        assert!(msg.contains("choices[0].message.content"));
    }

    #[tokio::test]
    async fn test_custom_operation_returns_credential() {
        let provider = ProviderConfig {
            api_key: "ol".to_string(),
            base_url: "http://localhost:11434".to_string(),
            provider_type: ProviderType::Ollama,
        };
        let out = execute(&provider, Operation::Custom, &[json!({}), json!({})], false)
            .await
            .expect("custom");
        assert_eq!(out.len(), 2);
        assert_eq!(
            out[0],
            json!({
                "apiKey": "ol",
                "baseUrl": "http://localhost:11434",
                "providerType": "ollama"
            })
        );
    }
}
