use serde_json::{json, Value};

use crate::error::NodeResult;
use crate::llm;
use crate::models::{ProviderConfig, DEFAULT_TEMPERATURE, DEFAULT_USER_NAME};

pub const NODE_NAME: &str = "rpChat";
pub const CREDENTIAL_NAME: &str = "rpChatApi";

/**
 * \brief 节点描述：宿主据此渲染属性面板。
 * \details 属性名与 `node::NodeParameters` 的 camelCase 键一一对应。
 */
pub fn node_description() -> Value {
    let chat_only = json!({ "show": { "operation": ["chat"] } });

    let mut properties = vec![
        json!({
            "displayName": "Operation",
            "name": "operation",
            "type": "options",
            "noDataExpression": true,
            "default": "chat",
            "options": [
                { "name": "Chat", "value": "chat", "description": "Send a role-play chat request" },
                { "name": "Custom", "value": "custom", "description": "Output the resolved credential for downstream nodes" }
            ]
        }),
        json!({
            "displayName": "Model",
            "name": "model",
            "type": "options",
            "default": "",
            "typeOptions": { "loadOptionsMethod": "getModels" },
            "displayOptions": chat_only
        }),
        json!({
            "displayName": "Custom Model",
            "name": "customModel",
            "type": "string",
            "default": "",
            "description": "Overrides the selected model when not empty",
            "displayOptions": chat_only
        }),
        required_text("Character Name", "characterName", false, &chat_only),
        required_text("Character Description", "characterDescription", true, &chat_only),
        required_text("First Message", "firstMessage", true, &chat_only),
        json!({
            "displayName": "User Name",
            "name": "userName",
            "type": "string",
            "default": DEFAULT_USER_NAME,
            "displayOptions": chat_only
        }),
    ];

    for (flag, name, display) in OPTIONAL_SECTIONS {
        properties.extend(toggled_section(flag, name, display));
    }

    properties.extend([
        json!({
            "displayName": "Use Chat History",
            "name": "useChatHistory",
            "type": "boolean",
            "default": false,
            "displayOptions": chat_only
        }),
        json!({
            "displayName": "Chat History",
            "name": "chatHistory",
            "type": "json",
            "default": "[]",
            "description": "Array of {role, content, name?} or [{submit_history: [...]}]",
            "displayOptions": { "show": { "operation": ["chat"], "useChatHistory": [true] } }
        }),
        required_text("Message", "message", true, &chat_only),
        json!({
            "displayName": "Temperature",
            "name": "temperature",
            "type": "number",
            "default": DEFAULT_TEMPERATURE,
            "typeOptions": { "minValue": 0, "maxValue": 2, "numberPrecision": 2 },
            "displayOptions": chat_only
        }),
        json!({
            "displayName": "Additional Fields",
            "name": "additionalFields",
            "type": "collection",
            "placeholder": "Add Field",
            "default": {},
            "displayOptions": chat_only,
            "options": [
                number_field("Frequency Penalty", "frequency_penalty", 0),
                number_field("Max Tokens", "max_tokens", 1024),
                number_field("Presence Penalty", "presence_penalty", 0),
                number_field("Top P", "top_p", 1)
            ]
        }),
        json!({
            "displayName": "Extra Body",
            "name": "extraBody",
            "type": "string",
            "default": "",
            "typeOptions": { "rows": 3 },
            "placeholder": "\"seed\": 1, \"stop\": [\"\\n\"]",
            "description": "Object fields merged into the request body (into options for Ollama). Booleans must be lowercase.",
            "displayOptions": chat_only
        }),
        json!({
            "displayName": "Options",
            "name": "options",
            "type": "collection",
            "placeholder": "Add Option",
            "default": {},
            "displayOptions": chat_only,
            "options": [
                { "displayName": "Raw Output", "name": "rawOutput", "type": "boolean", "default": false,
                  "description": "Include the full message list with the reply appended" },
                { "displayName": "Include Request Log", "name": "includeRequestLog", "type": "boolean", "default": false,
                  "description": "Include the outgoing request with messages and keys redacted" }
            ]
        }),
    ]);

    json!({
        "displayName": "RP Chat",
        "name": NODE_NAME,
        "group": ["transform"],
        "version": 1,
        "description": "Assemble a role-play prompt and send it to an OpenAI, Anthropic or Ollama compatible endpoint",
        "inputs": ["main"],
        "outputs": ["main"],
        "credentials": [{ "name": CREDENTIAL_NAME, "required": true }],
        "properties": properties
    })
}

/**
 * \brief 凭据描述：Provider 类型、基地址与 API Key。
 */
pub fn credential_description() -> Value {
    json!({
        "name": CREDENTIAL_NAME,
        "displayName": "RP Chat API",
        "properties": [
            {
                "displayName": "Provider Type",
                "name": "providerType",
                "type": "options",
                "default": "openai",
                "options": [
                    { "name": "OpenAI Compatible", "value": "openai" },
                    { "name": "Anthropic", "value": "anthropic" },
                    { "name": "Ollama", "value": "ollama" }
                ]
            },
            { "displayName": "Base URL", "name": "baseUrl", "type": "string", "default": "https://api.openai.com/v1" },
            { "displayName": "API Key", "name": "apiKey", "type": "string", "typeOptions": { "password": true }, "default": "" }
        ]
    })
}

const OPTIONAL_SECTIONS: [(&str, &str, &str); 6] = [
    ("useModelPreset", "modelPreset", "Model Preset"),
    ("useScenario", "scenario", "Scenario"),
    ("useMessageExample", "messageExample", "Message Example"),
    ("useFormatGuidelines", "formatGuidelines", "Format Guidelines"),
    ("useOtherPreMsg", "otherPreMsg", "Other Pre-Message"),
    ("useChatSummary", "chatSummary", "Chat Summary"),
];

fn required_text(display: &str, name: &str, multiline: bool, display_options: &Value) -> Value {
    let mut prop = json!({
        "displayName": display,
        "name": name,
        "type": "string",
        "default": "",
        "required": true,
        "displayOptions": display_options
    });
    if multiline {
        prop["typeOptions"] = json!({ "rows": 4 });
    }
    prop
}

fn toggled_section(flag: &str, name: &str, display: &str) -> [Value; 2] {
    [
        json!({
            "displayName": format!("Use {}", display),
            "name": flag,
            "type": "boolean",
            "default": false,
            "displayOptions": { "show": { "operation": ["chat"] } }
        }),
        json!({
            "displayName": display,
            "name": name,
            "type": "string",
            "default": "",
            "typeOptions": { "rows": 4 },
            "displayOptions": { "show": { "operation": ["chat"], flag: [true] } }
        }),
    ]
}

fn number_field(display: &str, name: &str, default: i64) -> Value {
    json!({ "displayName": display, "name": name, "type": "number", "default": default })
}

/**
 * \brief 下拉框选项：`{name, value, description}`。
 */
pub async fn model_options(provider: &ProviderConfig) -> NodeResult<Vec<Value>> {
    let models = llm::list_models(provider).await?;
    Ok(models
        .into_iter()
        .map(|m| json!({ "name": m.name, "value": m.id, "description": m.description }))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProviderType;

    fn property_names(desc: &Value) -> Vec<String> {
        desc["properties"]
            .as_array()
            .expect("properties")
            .iter()
            .filter_map(|p| p["name"].as_str().map(|s| s.to_string()))
            .collect()
    }

    #[test]
    fn test_description_covers_node_parameters() {
        let desc = node_description();
        let names = property_names(&desc);
        for expected in [
            "operation",
            "model",
            "customModel",
            "characterName",
            "characterDescription",
            "firstMessage",
            "userName",
            "useScenario",
            "scenario",
            "useChatSummary",
            "chatSummary",
            "useChatHistory",
            "chatHistory",
            "message",
            "temperature",
            "additionalFields",
            "extraBody",
            "options",
        ] {
            assert!(names.iter().any(|n| n == expected), "missing {}", expected);
        }
        assert_eq!(desc["credentials"][0]["name"], CREDENTIAL_NAME);
    }

    #[test]
    fn test_section_value_shown_only_when_flag_on() {
        let desc = node_description();
        let scenario = desc["properties"]
            .as_array()
            .unwrap()
            .iter()
            .find(|p| p["name"] == "scenario")
            .expect("scenario property");
        assert_eq!(
            scenario["displayOptions"]["show"]["useScenario"],
            json!([true])
        );
    }

    #[tokio::test]
    async fn test_model_options_map_descriptors() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/models")
            .with_status(200)
            .with_body(r#"{"data":[{"id":"m-2","name":"Second"},{"id":"m-1","description":"first"}]}"#)
            .create_async()
            .await;

        let provider = ProviderConfig {
            api_key: "sk".to_string(),
            base_url: server.url(),
            provider_type: ProviderType::OpenAI,
        };
        let options = model_options(&provider).await.expect("options");
        assert_eq!(
            options,
            vec![
                json!({"name": "m-1", "value": "m-1", "description": "first"}),
                json!({"name": "Second", "value": "m-2", "description": ""}),
            ]
        );
    }
}
