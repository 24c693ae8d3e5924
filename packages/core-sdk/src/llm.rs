use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::{json, Map, Value};

use crate::error::{NodeError, NodeResult};
use crate::models::{
    ChatConfig, ChatTurn, ModelDescriptor, ProviderConfig, ProviderType, RequestDescriptor,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const APP_REFERER: &str = "https://rpchat.local";
const APP_TITLE: &str = "RPChat";
const REDACTED: &str = "[REDACTED]";

/**
 * \brief 待发送的聊天请求。
 */
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub url: String,
    pub headers: HeaderMap,
    pub body: Value,
}

/**
 * \brief 按 Provider 构造完整的补全请求（地址、请求头、请求体）。
 */
pub fn build_request(
    messages: &[ChatTurn],
    config: &ChatConfig,
    provider: &ProviderConfig,
) -> NodeResult<ChatRequest> {
    let extra = parse_extra_body(config.extra_body.as_deref())?;
    let headers = build_headers(provider)?;
    let (url, body) = match provider.provider_type {
        ProviderType::OpenAI | ProviderType::Anthropic => (
            format!("{}/chat/completions", provider.base()),
            openai_body(messages, config, extra),
        ),
        ProviderType::Ollama => (
            format!("{}/api/chat", provider.base()),
            ollama_body(messages, config, extra),
        ),
    };
    Ok(ChatRequest { url, headers, body })
}

/**
 * \brief 发送请求并提取回复文本。单次尝试，不重试。
 */
pub async fn chat_once(request: &ChatRequest, provider_type: ProviderType) -> NodeResult<String> {
    let client = reqwest::Client::builder().build()?;
    let resp = client
        .post(&request.url)
        .headers(request.headers.clone())
        .json(&request.body)
        .send()
        .await?;
    let resp = ensure_success(resp, "chat request").await?;
    let v: Value = resp
        .json()
        .await
        .map_err(|e| NodeError::Upstream(format!("chat response is not valid JSON: {}", e)))?;
    parse_reply(&v, provider_type)
}

/**
 * \brief 从响应中取出助手回复，并去除首尾空白。
 */
pub fn parse_reply(v: &Value, provider_type: ProviderType) -> NodeResult<String> {
    let (pointer, path) = reply_path(provider_type);
    v.pointer(pointer)
        .and_then(|c| c.as_str())
        .map(|s| s.trim().to_string())
        .ok_or(NodeError::ResponseShape { path })
}

fn reply_path(provider_type: ProviderType) -> (&'static str, &'static str) {
    match provider_type {
        ProviderType::OpenAI | ProviderType::Anthropic => {
            ("/choices/0/message/content", "choices[0].message.content")
        }
        ProviderType::Ollama => ("/message/content", "message.content"),
    }
}

/**
 * \brief 生成脱敏的请求快照：消息列表与鉴权头不会出现在输出中。
 */
pub fn request_log(request: &ChatRequest) -> RequestDescriptor {
    let mut headers = Map::new();
    for (name, value) in request.headers.iter() {
        let shown = if is_secret_header(name) {
            REDACTED.to_string()
        } else {
            value.to_str().unwrap_or_default().to_string()
        };
        headers.insert(name.as_str().to_string(), json!(shown));
    }

    let mut body = request.body.clone();
    if let Some(messages) = body.get_mut("messages") {
        let count = messages.as_array().map(|m| m.len()).unwrap_or(0);
        *messages = json!(format!("[{} messages redacted]", count));
    }

    RequestDescriptor {
        url: request.url.clone(),
        headers,
        body,
    }
}

fn is_secret_header(name: &HeaderName) -> bool {
    *name == AUTHORIZATION || name.as_str() == "x-api-key"
}

/**
 * \brief 列出当前 Provider 可用模型列表。
 */
pub async fn list_models(provider: &ProviderConfig) -> NodeResult<Vec<ModelDescriptor>> {
    let url = match provider.provider_type {
        ProviderType::OpenAI | ProviderType::Anthropic => format!("{}/models", provider.base()),
        ProviderType::Ollama => format!("{}/api/tags", provider.base()),
    };
    let client = reqwest::Client::new();
    let resp = client
        .get(url)
        .headers(build_headers(provider)?)
        .send()
        .await?;
    let resp = ensure_success(resp, "list models").await?;
    let v: Value = resp
        .json()
        .await
        .map_err(|e| NodeError::Upstream(format!("models response is not valid JSON: {}", e)))?;
    parse_model_list(&v, provider.provider_type)
}

/**
 * \brief 解析模型列表响应。
 * \details 依次尝试：`data` 字段 → 顶层数组 → `models` 字段 → 第一个首元素带标识的数组字段。
 *          Ollama 以 `name` 为标识，其余以 `id` 为标识。
 */
pub fn parse_model_list(v: &Value, provider_type: ProviderType) -> NodeResult<Vec<ModelDescriptor>> {
    let id_key = match provider_type {
        ProviderType::Ollama => "name",
        _ => "id",
    };
    let entries = locate_model_array(v, id_key).ok_or(NodeError::NoModelList)?;

    let mut models: Vec<ModelDescriptor> = entries
        .iter()
        .filter_map(|item| {
            let id = non_empty_str(item.get(id_key))?;
            let name = non_empty_str(item.get("name")).unwrap_or(id);
            let description = non_empty_str(item.get("description")).unwrap_or("");
            Some(ModelDescriptor {
                id: id.to_string(),
                name: name.to_string(),
                description: description.to_string(),
            })
        })
        .collect();

    if models.is_empty() {
        return Err(NodeError::EmptyModelList);
    }
    models.sort_by_cached_key(|m| m.name.to_lowercase());
    Ok(models)
}

fn locate_model_array<'a>(v: &'a Value, id_key: &str) -> Option<&'a Vec<Value>> {
    if let Some(arr) = v.get("data").and_then(|x| x.as_array()) {
        return Some(arr);
    }
    if let Some(arr) = v.as_array() {
        return Some(arr);
    }
    if let Some(arr) = v.get("models").and_then(|x| x.as_array()) {
        return Some(arr);
    }
    v.as_object()?.values().find_map(|field| {
        field
            .as_array()
            .filter(|arr| arr.first().and_then(|e| e.get(id_key)).is_some())
    })
}

fn non_empty_str(v: Option<&Value>) -> Option<&str> {
    v.and_then(|s| s.as_str()).filter(|s| !s.is_empty())
}

/**
 * \brief 解析附加请求体片段。
 * \details 片段外层补上花括号，字符串以外的 true/false 不区分大小写地统一为小写，再按 JSON 对象解析。
 *          空片段返回空对象。
 */
pub fn parse_extra_body(raw: Option<&str>) -> NodeResult<Map<String, Value>> {
    let fragment = match raw.map(str::trim) {
        Some(f) if !f.is_empty() => f,
        _ => return Ok(Map::new()),
    };
    let normalized = normalize_booleans(fragment);
    let wrapped = serde_json::from_str::<Map<String, Value>>(&format!("{{{}}}", normalized));
    // 已自带花括号的完整对象也接受
    let parsed = match wrapped {
        Err(_) if normalized.starts_with('{') => serde_json::from_str(&normalized),
        other => other,
    };
    parsed.map_err(|e| {
        NodeError::Configuration(format!(
            "invalid extra body `{}`: {}. Values must be valid JSON and booleans must be lowercase true/false",
            fragment, e
        ))
    })
}

fn normalize_booleans(fragment: &str) -> String {
    let mut out = String::with_capacity(fragment.len());
    let mut word = String::new();
    let mut in_string = false;
    let mut escaped = false;

    for ch in fragment.chars() {
        if in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        if ch.is_ascii_alphanumeric() || ch == '_' {
            word.push(ch);
            continue;
        }
        flush_word(&mut out, &mut word);
        if ch == '"' {
            in_string = true;
        }
        out.push(ch);
    }
    flush_word(&mut out, &mut word);
    out
}

fn flush_word(out: &mut String, word: &mut String) {
    if word.eq_ignore_ascii_case("true") || word.eq_ignore_ascii_case("false") {
        out.push_str(&word.to_ascii_lowercase());
    } else {
        out.push_str(word);
    }
    word.clear();
}

fn openai_body(messages: &[ChatTurn], config: &ChatConfig, extra: Map<String, Value>) -> Value {
    let mut body = Map::new();
    body.insert("model".to_string(), json!(config.model_id));
    body.insert("messages".to_string(), json!(messages));
    body.insert("temperature".to_string(), json!(config.temperature));
    for (key, value) in &config.additional_fields {
        body.insert(key.clone(), value.clone());
    }
    body.extend(extra);
    Value::Object(body)
}

fn ollama_body(messages: &[ChatTurn], config: &ChatConfig, extra: Map<String, Value>) -> Value {
    let mut options = config.additional_fields.clone();
    options.insert("temperature".to_string(), json!(config.temperature));
    options.extend(extra);
    json!({
        "model": config.model_id,
        "messages": messages,
        "options": options,
        "stream": false
    })
}

/**
 * \brief 每个 Provider 从零构造请求头，互不共享。
 */
fn build_headers(provider: &ProviderConfig) -> NodeResult<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    match provider.provider_type {
        ProviderType::OpenAI => {
            let key = require_api_key(provider)?;
            headers.insert(AUTHORIZATION, header_value(&format!("Bearer {}", key))?);
            headers.insert("http-referer", HeaderValue::from_static(APP_REFERER));
            headers.insert("x-title", HeaderValue::from_static(APP_TITLE));
        }
        ProviderType::Anthropic => {
            let key = require_api_key(provider)?;
            headers.insert("x-api-key", header_value(key)?);
            headers.insert(
                "anthropic-version",
                HeaderValue::from_static(ANTHROPIC_VERSION),
            );
        }
        ProviderType::Ollama => {
            if provider.has_api_key() {
                headers.insert(
                    AUTHORIZATION,
                    header_value(&format!("Bearer {}", provider.api_key.trim()))?,
                );
            }
        }
    }
    Ok(headers)
}

fn require_api_key(provider: &ProviderConfig) -> NodeResult<&str> {
    if !provider.has_api_key() {
        return Err(NodeError::Configuration(format!(
            "an API key is required for {} credentials",
            provider.provider_type
        )));
    }
    Ok(provider.api_key.trim())
}

fn header_value(raw: &str) -> NodeResult<HeaderValue> {
    HeaderValue::from_str(raw).map_err(|_| {
        NodeError::Configuration("API key contains characters not allowed in a header".to_string())
    })
}

async fn ensure_success(resp: reqwest::Response, what: &str) -> NodeResult<reqwest::Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    Err(NodeError::Upstream(format!(
        "{} failed: {} -> {}",
        what,
        status,
        upstream_message(&text)
    )))
}

fn upstream_message(text: &str) -> String {
    let parsed: Option<Value> = serde_json::from_str(text).ok();
    parsed
        .as_ref()
        .and_then(|v| {
            v.pointer("/error/message")
                .or_else(|| v.get("error"))
                .or_else(|| v.get("message"))
        })
        .and_then(|m| m.as_str())
        .map(|m| m.to_string())
        .unwrap_or_else(|| text.trim().to_string())
}
