use std::{path::PathBuf, sync::Arc};

use anyhow::{anyhow, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use rusqlite::Connection;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    db::{self, Credential},
    description, llm,
    models::ProviderConfig,
    node::{self, Operation},
    telemetry,
};

type ApiError = (StatusCode, String);

/**
 * \brief 路由共享状态：凭据库路径。每个请求在阻塞线程上单独打开连接。
 */
#[derive(Clone, Debug)]
pub struct AppState {
    db_path: Arc<PathBuf>,
}

impl AppState {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: Arc::new(db_path.into()),
        }
    }

    /**
     * \brief 在阻塞线程池中打开连接并执行存储操作。
     */
    async fn with_db<T, F>(&self, action: F) -> Result<T, ApiError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, ApiError> + Send + 'static,
    {
        let path = Arc::clone(&self.db_path);
        tokio::task::spawn_blocking(move || {
            let conn = db::open_db(path.as_path()).map_err(internal_err)?;
            action(&conn)
        })
        .await
        .map_err(internal_err)?
    }
}

/**
 * \brief 启动本地 HTTP 宿主，暴露节点描述、凭据管理、模型列表与批量执行接口。
 * \param addr 监听地址，如 "127.0.0.1:5678"
 */
pub async fn run(addr: &str) -> Result<()> {
    let state = AppState::new(db::default_db_path());
    let conn = db::open_db(state.db_path.as_path())?;
    db::migrate(&conn)?;
    telemetry::set_enabled(db::get_telemetry_enabled(&conn)?);
    drop(conn);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    println!("Server listening on http://{}", addr);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/node", get(get_node_description))
        .route(
            "/api/credentials",
            get(get_credentials).post(create_credential),
        )
        .route(
            "/api/credentials/{id}",
            put(update_credential).delete(delete_credential),
        )
        .route("/api/credentials/{id}/select", post(select_credential))
        .route("/api/models", get(list_models))
        .route("/api/health", get(health_check))
        .route("/api/execute", post(execute))
        .with_state(state)
}

#[derive(Deserialize, Debug)]
struct CredentialRequest {
    name: String,
    provider_type: String,
    base_url: String,
    #[serde(default)]
    api_key: String,
    #[serde(default)]
    set_default: Option<bool>,
    #[serde(default)]
    telemetry_enabled: Option<bool>,
}

#[derive(Deserialize, Debug)]
struct CredentialQuery {
    credential_id: Option<i64>,
}

#[derive(Deserialize, Debug)]
struct ExecuteRequest {
    /** \brief 凭据 ID（可选，缺省使用默认凭据） */
    #[serde(default)]
    credential_id: Option<i64>,
    #[serde(default)]
    operation: Operation,
    /** \brief 单条失败时是否继续 */
    #[serde(default)]
    continue_on_fail: bool,
    items: Vec<Value>,
}

fn internal_err<E: std::fmt::Display>(e: E) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

fn bad_request<E: std::fmt::Display>(e: E) -> ApiError {
    (StatusCode::BAD_REQUEST, e.to_string())
}

fn credentials_state(conn: &Connection) -> Result<Value> {
    let credentials = db::list_credentials(conn)?;
    let default_id = db::get_default_credential_id(conn)?;
    let telemetry_enabled = db::get_telemetry_enabled(conn)?;
    telemetry::set_enabled(telemetry_enabled);
    Ok(json!({
        "credentials": credentials,
        "default_credential_id": default_id,
        "telemetry_enabled": telemetry_enabled
    }))
}

/**
 * \brief 按 ID 或默认设置解析凭据；每次请求解析一次。
 */
async fn resolve_provider(
    state: &AppState,
    credential_id: Option<i64>,
) -> Result<ProviderConfig, ApiError> {
    state
        .with_db(move |conn| {
            telemetry::set_enabled(db::get_telemetry_enabled(conn).map_err(internal_err)?);
            let credential: Option<Credential> = match credential_id {
                Some(id) => db::get_credential_by_id(conn, id).map_err(internal_err)?,
                None => db::get_default_credential(conn).map_err(internal_err)?,
            };
            let credential = credential.ok_or_else(|| {
                bad_request(anyhow!("no credential available, create or select one first"))
            })?;
            credential.to_provider_config().map_err(bad_request)
        })
        .await
}

async fn get_node_description() -> Json<Value> {
    Json(json!({
        "node": description::node_description(),
        "credential": description::credential_description()
    }))
}

async fn get_credentials(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let body = state
        .with_db(|conn| credentials_state(conn).map_err(internal_err))
        .await?;
    Ok(Json(body))
}

async fn create_credential(
    State(state): State<AppState>,
    Json(payload): Json<CredentialRequest>,
) -> Result<Json<Value>, ApiError> {
    telemetry::log_event(
        "server.credential",
        &format!("create name={} type={}", payload.name, payload.provider_type),
    );
    let body = state
        .with_db(move |conn| {
            if payload.set_default.unwrap_or(false) {
                db::upsert_default_credential(
                    conn,
                    &payload.name,
                    &payload.provider_type,
                    &payload.base_url,
                    &payload.api_key,
                )
                .map_err(bad_request)?;
            } else {
                db::insert_credential(
                    conn,
                    &payload.name,
                    &payload.provider_type,
                    &payload.base_url,
                    &payload.api_key,
                )
                .map_err(bad_request)?;
            }
            if let Some(enabled) = payload.telemetry_enabled {
                db::set_telemetry_enabled(conn, enabled).map_err(internal_err)?;
            }
            credentials_state(conn).map_err(internal_err)
        })
        .await?;
    Ok(Json(body))
}

async fn update_credential(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(payload): Json<CredentialRequest>,
) -> Result<Json<Value>, ApiError> {
    telemetry::log_event(
        "server.credential",
        &format!("update id={} name={}", id, payload.name),
    );
    let body = state
        .with_db(move |conn| {
            db::update_credential(
                conn,
                id,
                &payload.name,
                &payload.provider_type,
                &payload.base_url,
                &payload.api_key,
            )
            .map_err(bad_request)?;
            if payload.set_default.unwrap_or(false) {
                db::set_default_credential_id(conn, id).map_err(internal_err)?;
            }
            if let Some(enabled) = payload.telemetry_enabled {
                db::set_telemetry_enabled(conn, enabled).map_err(internal_err)?;
            }
            credentials_state(conn).map_err(internal_err)
        })
        .await?;
    Ok(Json(body))
}

async fn delete_credential(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    telemetry::log_event("server.credential", &format!("delete id={}", id));
    let body = state
        .with_db(move |conn| {
            db::delete_credential(conn, id).map_err(internal_err)?;
            credentials_state(conn).map_err(internal_err)
        })
        .await?;
    Ok(Json(body))
}

async fn select_credential(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    telemetry::log_event("server.credential", &format!("select-default id={}", id));
    let body = state
        .with_db(move |conn| {
            db::set_default_credential_id(conn, id).map_err(bad_request)?;
            credentials_state(conn).map_err(internal_err)
        })
        .await?;
    Ok(Json(body))
}

/**
 * \brief 模型下拉选项（宿主的 loadOptions）。
 */
async fn list_models(
    State(state): State<AppState>,
    Query(q): Query<CredentialQuery>,
) -> Result<Json<Value>, ApiError> {
    let provider = resolve_provider(&state, q.credential_id).await?;
    let options = description::model_options(&provider)
        .await
        .map_err(|e| (StatusCode::BAD_GATEWAY, e.to_string()))?;
    Ok(Json(json!({ "models": options })))
}

/**
 * \brief 健康检查：尝试列出模型并返回状态。
 */
async fn health_check(
    State(state): State<AppState>,
    Query(q): Query<CredentialQuery>,
) -> Result<Json<Value>, ApiError> {
    let provider = resolve_provider(&state, q.credential_id).await?;
    match llm::list_models(&provider).await {
        Ok(list) => Ok(Json(json!({
            "ok": true,
            "provider": provider.provider_type,
            "base": provider.base_url,
            "models": list.len()
        }))),
        Err(e) => {
            telemetry::log_warn("server.health", &format!("base={} {}", provider.base_url, e));
            Ok(Json(json!({
                "ok": false,
                "provider": provider.provider_type,
                "base": provider.base_url,
                "error": e.to_string()
            })))
        }
    }
}

/**
 * \brief 批量执行：POST /api/execute {operation, continue_on_fail, items}
 */
async fn execute(
    State(state): State<AppState>,
    Json(req): Json<ExecuteRequest>,
) -> Result<Json<Value>, ApiError> {
    let provider = resolve_provider(&state, req.credential_id).await?;
    telemetry::log_event(
        "server.execute",
        &format!(
            "operation={:?} items={} continue_on_fail={}",
            req.operation,
            req.items.len(),
            req.continue_on_fail
        ),
    );
    let results = node::execute(&provider, req.operation, &req.items, req.continue_on_fail)
        .await
        .map_err(|e| (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))?;
    Ok(Json(json!({ "items": results })))
}
