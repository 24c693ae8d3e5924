use anyhow::{bail, Result};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::Serialize;
use std::{
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use crate::error::NodeResult;
use crate::models::ProviderConfig;

const DEFAULT_CREDENTIAL_KEY: &str = "default_credential_id";
const TELEMETRY_KEY: &str = "telemetry_enabled";

/**
 * \brief 已保存的凭据记录。
 */
#[derive(Debug, Clone, Serialize)]
pub struct Credential {
    /** \brief 自增主键 */
    pub id: i64,
    /** \brief 凭据名称，唯一 */
    pub name: String,
    /** \brief Provider 类型：openai/anthropic/ollama */
    pub provider_type: String,
    pub base_url: String,
    #[serde(skip_serializing)]
    pub api_key: String,
}

impl Credential {
    /**
     * \brief 解析为只读的 `ProviderConfig`；未知类型返回配置错误。
     */
    pub fn to_provider_config(&self) -> NodeResult<ProviderConfig> {
        Ok(ProviderConfig {
            api_key: self.api_key.clone(),
            base_url: self.base_url.clone(),
            provider_type: self.provider_type.parse()?,
        })
    }
}

/**
 * \brief 默认数据库路径，可由 `RPCHAT_DB` 覆盖（默认 rpchat.db）。
 */
pub fn default_db_path() -> PathBuf {
    std::env::var("RPCHAT_DB")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("rpchat.db"))
}

pub fn open_default_db() -> Result<Connection> {
    open_db(default_db_path())
}

pub fn open_db(path: impl AsRef<Path>) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

/**
 * \brief 运行数据库迁移，创建必要表结构。
 */
pub fn migrate(conn: &Connection) -> Result<()> {
    retry_on_locked(|| {
        conn.execute_batch(
            r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS credentials (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            provider_type TEXT NOT NULL DEFAULT 'openai',
            base_url TEXT NOT NULL,
            api_key  TEXT NOT NULL DEFAULT ''
        );

        CREATE TABLE IF NOT EXISTS app_config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        "#,
        )
    })?;
    Ok(())
}

fn set_config_value(conn: &Connection, key: &str, value: &str) -> Result<()> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO app_config (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![key, value],
        )
    })?;
    Ok(())
}

fn get_config_value(conn: &Connection, key: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM app_config WHERE key=?1",
        params![key],
        |row| row.get::<_, String>(0),
    )
    .optional()
    .map_err(Into::into)
}

fn map_credential(row: &rusqlite::Row<'_>) -> rusqlite::Result<Credential> {
    Ok(Credential {
        id: row.get(0)?,
        name: row.get(1)?,
        provider_type: row.get(2)?,
        base_url: row.get(3)?,
        api_key: row.get(4)?,
    })
}

/**
 * \brief 新增凭据，保存前校验 Provider 类型。
 */
pub fn insert_credential(
    conn: &Connection,
    name: &str,
    provider_type: &str,
    base_url: &str,
    api_key: &str,
) -> Result<i64> {
    let provider_type = provider_type.parse::<crate::models::ProviderType>()?;
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO credentials (name, provider_type, base_url, api_key) VALUES (?1, ?2, ?3, ?4)",
            params![name, provider_type.as_str(), base_url, api_key],
        )
    })?;
    Ok(conn.last_insert_rowid())
}

/**
 * \brief 更新凭据。
 */
pub fn update_credential(
    conn: &Connection,
    id: i64,
    name: &str,
    provider_type: &str,
    base_url: &str,
    api_key: &str,
) -> Result<()> {
    let provider_type = provider_type.parse::<crate::models::ProviderType>()?;
    let rows = retry_on_locked(|| {
        conn.execute(
            "UPDATE credentials SET name=?1, provider_type=?2, base_url=?3, api_key=?4 WHERE id=?5",
            params![name, provider_type.as_str(), base_url, api_key, id],
        )
    })?;
    if rows == 0 {
        bail!("credential id {} not found", id);
    }
    Ok(())
}

/**
 * \brief 删除凭据；若为默认凭据则同时清除默认设置。
 */
pub fn delete_credential(conn: &Connection, id: i64) -> Result<()> {
    if get_default_credential_id(conn)? == Some(id) {
        retry_on_locked(|| {
            conn.execute(
                "DELETE FROM app_config WHERE key=?1",
                params![DEFAULT_CREDENTIAL_KEY],
            )
        })?;
    }
    retry_on_locked(|| conn.execute("DELETE FROM credentials WHERE id=?1", params![id]))?;
    Ok(())
}

pub fn list_credentials(conn: &Connection) -> Result<Vec<Credential>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, provider_type, base_url, api_key FROM credentials ORDER BY id ASC",
    )?;
    let rows = stmt
        .query_map([], map_credential)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_credential_by_id(conn: &Connection, id: i64) -> Result<Option<Credential>> {
    conn.query_row(
        "SELECT id, name, provider_type, base_url, api_key FROM credentials WHERE id=?1",
        params![id],
        map_credential,
    )
    .optional()
    .map_err(Into::into)
}

pub fn get_credential_by_name(conn: &Connection, name: &str) -> Result<Option<Credential>> {
    conn.query_row(
        "SELECT id, name, provider_type, base_url, api_key FROM credentials WHERE name=?1",
        params![name],
        map_credential,
    )
    .optional()
    .map_err(Into::into)
}

/**
 * \brief 设置默认凭据。
 */
pub fn set_default_credential_id(conn: &Connection, id: i64) -> Result<()> {
    if get_credential_by_id(conn, id)?.is_none() {
        bail!("credential id {} not found", id);
    }
    set_config_value(conn, DEFAULT_CREDENTIAL_KEY, &id.to_string())
}

pub fn get_default_credential_id(conn: &Connection) -> Result<Option<i64>> {
    Ok(get_config_value(conn, DEFAULT_CREDENTIAL_KEY)?.and_then(|s| s.parse::<i64>().ok()))
}

/**
 * \brief 读取默认凭据（若未设置，返回 None）。
 */
pub fn get_default_credential(conn: &Connection) -> Result<Option<Credential>> {
    match get_default_credential_id(conn)? {
        Some(id) => get_credential_by_id(conn, id),
        None => Ok(None),
    }
}

/**
 * \brief 新增凭据并设为默认。
 */
pub fn upsert_default_credential(
    conn: &Connection,
    name: &str,
    provider_type: &str,
    base_url: &str,
    api_key: &str,
) -> Result<i64> {
    let id = match get_credential_by_name(conn, name)? {
        Some(existing) => {
            update_credential(conn, existing.id, name, provider_type, base_url, api_key)?;
            existing.id
        }
        None => insert_credential(conn, name, provider_type, base_url, api_key)?,
    };
    set_default_credential_id(conn, id)?;
    Ok(id)
}

/**
 * \brief 读取遥测开关。
 */
pub fn get_telemetry_enabled(conn: &Connection) -> Result<bool> {
    Ok(get_config_value(conn, TELEMETRY_KEY)?
        .map(|s| s == "1")
        .unwrap_or(false))
}

pub fn set_telemetry_enabled(conn: &Connection, enabled: bool) -> Result<()> {
    set_config_value(conn, TELEMETRY_KEY, if enabled { "1" } else { "0" })
}

/**
 * \brief 针对 SQLite 锁冲突的重试助手。
 * \details 捕获 `database is locked`/`database table is locked` 等错误并进行线性退避，最大尝试 6 次。
 */
fn retry_on_locked<T, F>(mut action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    for attempt in 0..=MAX_RETRIES {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                let backoff = Duration::from_millis(200 * (attempt as u64 + 1));
                thread::sleep(backoff);
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }
    unreachable!("retry_on_locked should have returned within the loop");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProviderType;

    fn mem_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        migrate(&conn).expect("migrate");
        conn
    }

    #[test]
    fn test_credential_crud_and_default() {
        let conn = mem_conn();
        let id1 = insert_credential(&conn, "openrouter", "openai", "https://openrouter.ai/api/v1", "sk-1")
            .expect("insert credential 1");
        let id2 = insert_credential(&conn, "local", "ollama", "http://localhost:11434", "")
            .expect("insert credential 2");
        let list = list_credentials(&conn).expect("list credentials");
        assert_eq!(list.len(), 2);

        set_default_credential_id(&conn, id2).expect("set default");
        let def = get_default_credential(&conn).expect("get default");
        assert_eq!(def.unwrap().id, id2);

        update_credential(&conn, id1, "claude", "anthropic", "https://api.anthropic.com/v1", "ak")
            .expect("update credential");
        let one = get_credential_by_id(&conn, id1).expect("get by id").unwrap();
        assert_eq!(one.name, "claude");
        let cfg = one.to_provider_config().expect("provider config");
        assert_eq!(cfg.provider_type, ProviderType::Anthropic);
        assert_eq!(cfg.api_key, "ak");

        let by_name = get_credential_by_name(&conn, "local").expect("get by name");
        assert_eq!(by_name.map(|c| c.id), Some(id2));
    }

    #[test]
    fn test_delete_default_clears_default() {
        let conn = mem_conn();
        let id = upsert_default_credential(&conn, "default", "openai", "http://x", "sk")
            .expect("upsert default");
        assert_eq!(get_default_credential_id(&conn).unwrap(), Some(id));

        delete_credential(&conn, id).expect("delete");
        assert!(get_default_credential(&conn).unwrap().is_none());
        assert!(list_credentials(&conn).unwrap().is_empty());
    }

    #[test]
    fn test_upsert_default_reuses_name() {
        let conn = mem_conn();
        let first = upsert_default_credential(&conn, "default", "openai", "http://a", "sk-a")
            .expect("first upsert");
        let second = upsert_default_credential(&conn, "default", "ollama", "http://b", "")
            .expect("second upsert");
        assert_eq!(first, second);
        let cred = get_default_credential(&conn).unwrap().unwrap();
        assert_eq!(cred.provider_type, "ollama");
        assert_eq!(cred.base_url, "http://b");
    }

    #[test]
    fn test_unknown_provider_type_rejected() {
        let conn = mem_conn();
        assert!(insert_credential(&conn, "bad", "gemini", "http://x", "k").is_err());
        assert!(set_default_credential_id(&conn, 42).is_err());
    }

    #[test]
    fn test_telemetry_flag_roundtrip() {
        let conn = mem_conn();
        assert!(!get_telemetry_enabled(&conn).unwrap());
        set_telemetry_enabled(&conn, true).expect("enable");
        assert!(get_telemetry_enabled(&conn).unwrap());
    }

    #[test]
    fn test_credential_serialization_hides_key() {
        let conn = mem_conn();
        let id = insert_credential(&conn, "c", "openai", "http://x", "sk-hidden").unwrap();
        let cred = get_credential_by_id(&conn, id).unwrap().unwrap();
        let text = serde_json::to_string(&cred).unwrap();
        assert!(!text.contains("sk-hidden"));
    }
}
