use anyhow::{anyhow, bail, Result};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::{path::Path, sync::Mutex, thread, time::Duration};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::error::LlmError;
use crate::models::{
    CallParameters, Configuration, CostRates, Interaction, Model, PromptTemplate, Provider,
};
use crate::resolver::ConfigurationStore;
use crate::usage::{InteractionLog, InteractionRecord, ModelUsageSummary};

/**
 * \brief 打开数据库文件并执行迁移。
 */
pub fn open_db(path: impl AsRef<Path>) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    migrate(&conn)?;
    Ok(conn)
}

/**
 * \brief 运行数据库迁移，创建编排层读写的表结构。
 */
pub fn migrate(conn: &Connection) -> Result<()> {
    retry_on_locked(|| {
        conn.execute_batch(
            r#"
        PRAGMA journal_mode=WAL;
        PRAGMA foreign_keys=ON;
        CREATE TABLE IF NOT EXISTS providers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            kind TEXT NOT NULL,
            base_url TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            credential_blob TEXT NOT NULL DEFAULT '',
            max_concurrency INTEGER
        );

        CREATE TABLE IF NOT EXISTS models (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            provider_id INTEGER NOT NULL REFERENCES providers(id),
            name TEXT NOT NULL,
            model_identifier TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            input_rate REAL,
            output_rate REAL,
            blended_rate REAL
        );

        CREATE TABLE IF NOT EXISTS prompt_templates (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            version INTEGER NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            body TEXT NOT NULL,
            UNIQUE(name, version)
        );

        CREATE TABLE IF NOT EXISTS configurations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            provider_id INTEGER NOT NULL REFERENCES providers(id),
            model_id INTEGER NOT NULL REFERENCES models(id),
            prompt_template_id INTEGER REFERENCES prompt_templates(id),
            is_active INTEGER NOT NULL DEFAULT 1,
            temperature REAL,
            max_tokens INTEGER,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS interactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            function_name TEXT NOT NULL,
            provider_id INTEGER,
            model_id INTEGER,
            prompt_template_id INTEGER,
            input_tokens INTEGER NOT NULL DEFAULT 0,
            output_tokens INTEGER NOT NULL DEFAULT 0,
            cost REAL NOT NULL DEFAULT 0,
            latency_ms INTEGER NOT NULL DEFAULT 0,
            success INTEGER NOT NULL,
            error_kind TEXT,
            error_message TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS app_config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_configurations_template
            ON configurations(prompt_template_id, is_active);
        CREATE INDEX IF NOT EXISTS idx_interactions_model
            ON interactions(model_id);
        "#,
        )
    })?;
    Ok(())
}

fn set_bool_config(conn: &Connection, key: &str, value: bool) -> Result<()> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO app_config (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![key, if value { "1" } else { "0" }],
        )
    })?;
    Ok(())
}

fn get_bool_config(conn: &Connection, key: &str, default: bool) -> Result<bool> {
    let val = conn
        .query_row(
            "SELECT value FROM app_config WHERE key=?1",
            params![key],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(val.map(|s| s == "1").unwrap_or(default))
}

/**
 * \brief 读取遥测开关。
 */
pub fn get_telemetry_enabled(conn: &Connection) -> Result<bool> {
    get_bool_config(conn, "telemetry_enabled", false)
}

/**
 * \brief 更新遥测开关。
 */
pub fn set_telemetry_enabled(conn: &Connection, enabled: bool) -> Result<()> {
    set_bool_config(conn, "telemetry_enabled", enabled)
}

// ---------------------------------------------------------------------------
// providers
// ---------------------------------------------------------------------------

const PROVIDER_COLUMNS: &str =
    "id, name, kind, base_url, is_active, credential_blob, max_concurrency";

fn map_provider(row: &Row<'_>) -> rusqlite::Result<Provider> {
    Ok(Provider {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: row.get(2)?,
        base_url: row.get(3)?,
        is_active: row.get(4)?,
        credential_blob: row.get(5)?,
        max_concurrency: row
            .get::<_, Option<i64>>(6)?
            .and_then(|n| u32::try_from(n).ok()),
    })
}

/**
 * \brief 新增 Provider（凭证为空，需另行通过保险箱写入）。
 */
pub fn insert_provider(
    conn: &Connection,
    name: &str,
    kind: &str,
    base_url: &str,
    max_concurrency: Option<u32>,
) -> Result<i64> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO providers (name, kind, base_url, max_concurrency) VALUES (?1, ?2, ?3, ?4)",
            params![name, kind, base_url, max_concurrency.map(i64::from)],
        )
    })?;
    Ok(conn.last_insert_rowid())
}

/**
 * \brief 写入加密后的凭证。
 */
pub fn set_provider_credential(conn: &Connection, id: i64, credential_blob: &str) -> Result<()> {
    let rows = retry_on_locked(|| {
        conn.execute(
            "UPDATE providers SET credential_blob=?1 WHERE id=?2",
            params![credential_blob, id],
        )
    })?;
    if rows == 0 {
        bail!("provider id {} not found", id);
    }
    Ok(())
}

pub fn set_provider_active(conn: &Connection, id: i64, active: bool) -> Result<()> {
    let rows = retry_on_locked(|| {
        conn.execute(
            "UPDATE providers SET is_active=?1 WHERE id=?2",
            params![active, id],
        )
    })?;
    if rows == 0 {
        bail!("provider id {} not found", id);
    }
    Ok(())
}

/**
 * \brief 按 ID 获取 Provider。
 */
pub fn get_provider_by_id(conn: &Connection, id: i64) -> Result<Option<Provider>> {
    conn.query_row(
        &format!("SELECT {} FROM providers WHERE id=?1", PROVIDER_COLUMNS),
        params![id],
        map_provider,
    )
    .optional()
    .map_err(Into::into)
}

pub fn get_provider_by_name(conn: &Connection, name: &str) -> Result<Option<Provider>> {
    conn.query_row(
        &format!("SELECT {} FROM providers WHERE name=?1", PROVIDER_COLUMNS),
        params![name],
        map_provider,
    )
    .optional()
    .map_err(Into::into)
}

/**
 * \brief 列出所有 Provider。
 */
pub fn list_providers(conn: &Connection) -> Result<Vec<Provider>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM providers ORDER BY id ASC",
        PROVIDER_COLUMNS
    ))?;
    let rows = stmt
        .query_map([], map_provider)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ---------------------------------------------------------------------------
// models
// ---------------------------------------------------------------------------

const MODEL_COLUMNS: &str =
    "id, provider_id, name, model_identifier, is_active, input_rate, output_rate, blended_rate";

fn map_model(row: &Row<'_>) -> rusqlite::Result<Model> {
    Ok(Model {
        id: row.get(0)?,
        provider_id: row.get(1)?,
        name: row.get(2)?,
        model_identifier: row.get(3)?,
        is_active: row.get(4)?,
        rates: CostRates {
            input_per_1k: row.get(5)?,
            output_per_1k: row.get(6)?,
            blended_per_1k: row.get(7)?,
        },
    })
}

pub fn insert_model(
    conn: &Connection,
    provider_id: i64,
    name: &str,
    model_identifier: &str,
    rates: CostRates,
) -> Result<i64> {
    if get_provider_by_id(conn, provider_id)?.is_none() {
        bail!("provider id {} not found", provider_id);
    }
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO models (provider_id, name, model_identifier, input_rate, output_rate, blended_rate)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                provider_id,
                name,
                model_identifier,
                rates.input_per_1k,
                rates.output_per_1k,
                rates.blended_per_1k
            ],
        )
    })?;
    Ok(conn.last_insert_rowid())
}

pub fn set_model_active(conn: &Connection, id: i64, active: bool) -> Result<()> {
    let rows = retry_on_locked(|| {
        conn.execute(
            "UPDATE models SET is_active=?1 WHERE id=?2",
            params![active, id],
        )
    })?;
    if rows == 0 {
        bail!("model id {} not found", id);
    }
    Ok(())
}

pub fn get_model_by_id(conn: &Connection, id: i64) -> Result<Option<Model>> {
    conn.query_row(
        &format!("SELECT {} FROM models WHERE id=?1", MODEL_COLUMNS),
        params![id],
        map_model,
    )
    .optional()
    .map_err(Into::into)
}

/**
 * \brief 列出指定 Provider 的模型。
 */
pub fn list_models_for_provider(conn: &Connection, provider_id: i64) -> Result<Vec<Model>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM models WHERE provider_id=?1 ORDER BY id ASC",
        MODEL_COLUMNS
    ))?;
    let rows = stmt
        .query_map(params![provider_id], map_model)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ---------------------------------------------------------------------------
// prompt templates
// ---------------------------------------------------------------------------

const TEMPLATE_COLUMNS: &str = "id, name, version, is_active, body";

fn map_template(row: &Row<'_>) -> rusqlite::Result<PromptTemplate> {
    Ok(PromptTemplate {
        id: row.get(0)?,
        name: row.get(1)?,
        version: row.get(2)?,
        is_active: row.get(3)?,
        body: row.get(4)?,
    })
}

/**
 * \brief 新增模板版本并设为唯一激活版本。
 */
pub fn insert_prompt_template(conn: &Connection, name: &str, body: &str) -> Result<i64> {
    let tx = conn.unchecked_transaction()?;
    let id = insert_template_version(&tx, name, body)?;
    tx.commit()?;
    Ok(id)
}

fn insert_template_version(conn: &Connection, name: &str, body: &str) -> Result<i64> {
    let next_version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) + 1 FROM prompt_templates WHERE name=?1",
        params![name],
        |row| row.get(0),
    )?;
    retry_on_locked(|| {
        conn.execute(
            "UPDATE prompt_templates SET is_active=0 WHERE name=?1",
            params![name],
        )
    })?;
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO prompt_templates (name, version, is_active, body) VALUES (?1, ?2, 1, ?3)",
            params![name, next_version, body],
        )
    })?;
    Ok(conn.last_insert_rowid())
}

/**
 * \brief 修改模板正文：生成新版本、停用旧版本，并把激活配置迁移到新版本。
 * \return 新版本的主键。
 */
pub fn update_prompt_template_content(conn: &Connection, id: i64, body: &str) -> Result<i64> {
    let current = get_prompt_template_by_id(conn, id)?
        .ok_or_else(|| anyhow!("prompt template id {} not found", id))?;
    if current.body == body {
        return Ok(current.id);
    }

    let tx = conn.unchecked_transaction()?;
    let bound = bound_configuration(&tx, &current.name)?;
    let new_id = insert_template_version(&tx, &current.name, body)?;
    rebind_configuration(&tx, &current.name, bound, new_id)?;
    tx.commit()?;
    Ok(new_id)
}

/**
 * \brief 仅修改激活状态（原地修改，不产生新版本）。
 */
pub fn set_prompt_template_active(conn: &Connection, id: i64, active: bool) -> Result<()> {
    let current = get_prompt_template_by_id(conn, id)?
        .ok_or_else(|| anyhow!("prompt template id {} not found", id))?;
    let tx = conn.unchecked_transaction()?;
    let bound = if active {
        bound_configuration(&tx, &current.name)?
    } else {
        None
    };
    if active {
        retry_on_locked(|| {
            tx.execute(
                "UPDATE prompt_templates SET is_active=0 WHERE name=?1 AND id<>?2",
                params![current.name, id],
            )
        })?;
    }
    retry_on_locked(|| {
        tx.execute(
            "UPDATE prompt_templates SET is_active=?1 WHERE id=?2",
            params![active, id],
        )
    })?;
    if active {
        rebind_configuration(&tx, &current.name, bound, id)?;
    }
    tx.commit()?;
    Ok(())
}

/**
 * \brief 同名模板各版本上仍激活的配置中应保留的一条。
 * \details 优先绑定在当前激活版本上的配置，其次按 updated_at、id 倒序。
 */
fn bound_configuration(conn: &Connection, name: &str) -> Result<Option<i64>> {
    conn.query_row(
        "SELECT c.id FROM configurations c
         JOIN prompt_templates t ON t.id = c.prompt_template_id
         WHERE t.name=?1 AND c.is_active=1
         ORDER BY t.is_active DESC, c.updated_at DESC, c.id DESC LIMIT 1",
        params![name],
        |row| row.get(0),
    )
    .optional()
    .map_err(Into::into)
}

/**
 * \brief 把保留的配置迁移到目标版本，同名其它版本上的激活配置一并停用。
 */
fn rebind_configuration(
    conn: &Connection,
    name: &str,
    keep: Option<i64>,
    target_id: i64,
) -> Result<()> {
    let Some(keep) = keep else {
        return Ok(());
    };
    let now = now_millis();
    retry_on_locked(|| {
        conn.execute(
            "UPDATE configurations SET is_active=0, updated_at=?1
             WHERE is_active=1 AND id<>?2
               AND prompt_template_id IN (SELECT id FROM prompt_templates WHERE name=?3)",
            params![now, keep, name],
        )
    })?;
    retry_on_locked(|| {
        conn.execute(
            "UPDATE configurations SET prompt_template_id=?1, updated_at=?2 WHERE id=?3",
            params![target_id, now, keep],
        )
    })?;
    Ok(())
}

pub fn get_prompt_template_by_id(conn: &Connection, id: i64) -> Result<Option<PromptTemplate>> {
    conn.query_row(
        &format!("SELECT {} FROM prompt_templates WHERE id=?1", TEMPLATE_COLUMNS),
        params![id],
        map_template,
    )
    .optional()
    .map_err(Into::into)
}

/**
 * \brief 按逻辑名称查找激活版本（多条激活时取最高版本）。
 */
pub fn find_active_prompt_template(conn: &Connection, name: &str) -> Result<Option<PromptTemplate>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM prompt_templates WHERE name=?1 AND is_active=1
             ORDER BY version DESC LIMIT 1",
            TEMPLATE_COLUMNS
        ),
        params![name],
        map_template,
    )
    .optional()
    .map_err(Into::into)
}

pub fn list_prompt_template_versions(conn: &Connection, name: &str) -> Result<Vec<PromptTemplate>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM prompt_templates WHERE name=?1 ORDER BY version ASC",
        TEMPLATE_COLUMNS
    ))?;
    let rows = stmt
        .query_map(params![name], map_template)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ---------------------------------------------------------------------------
// configurations
// ---------------------------------------------------------------------------

const CONFIGURATION_COLUMNS: &str =
    "id, provider_id, model_id, prompt_template_id, is_active, temperature, max_tokens, updated_at";

fn map_configuration(row: &Row<'_>) -> rusqlite::Result<Configuration> {
    Ok(Configuration {
        id: row.get(0)?,
        provider_id: row.get(1)?,
        model_id: row.get(2)?,
        prompt_template_id: row.get(3)?,
        is_active: row.get(4)?,
        parameters: CallParameters {
            temperature: row.get::<_, Option<f64>>(5)?.map(|t| t as f32),
            max_tokens: row
                .get::<_, Option<i64>>(6)?
                .and_then(|n| u32::try_from(n).ok()),
        },
        updated_at: row.get(7)?,
    })
}

/**
 * \brief 新增激活配置；同一模板（或默认槽位）下的其它配置会被停用。
 */
pub fn insert_configuration(
    conn: &Connection,
    provider_id: i64,
    model_id: i64,
    prompt_template_id: Option<i64>,
    parameters: CallParameters,
) -> Result<i64> {
    let tx = conn.unchecked_transaction()?;
    deactivate_siblings(&tx, prompt_template_id, None)?;
    let now = now_millis();
    retry_on_locked(|| {
        tx.execute(
            "INSERT INTO configurations
                (provider_id, model_id, prompt_template_id, is_active, temperature, max_tokens, updated_at)
             VALUES (?1, ?2, ?3, 1, ?4, ?5, ?6)",
            params![
                provider_id,
                model_id,
                prompt_template_id,
                parameters.temperature.map(f64::from),
                parameters.max_tokens.map(i64::from),
                now
            ],
        )
    })?;
    let id = tx.last_insert_rowid();
    tx.commit()?;
    Ok(id)
}

/**
 * \brief 切换配置激活状态并刷新 updated_at。
 */
pub fn set_configuration_active(conn: &Connection, id: i64, active: bool) -> Result<()> {
    let current = get_configuration_by_id(conn, id)?
        .ok_or_else(|| anyhow!("configuration id {} not found", id))?;
    let tx = conn.unchecked_transaction()?;
    if active {
        deactivate_siblings(&tx, current.prompt_template_id, Some(id))?;
    }
    let now = now_millis();
    retry_on_locked(|| {
        tx.execute(
            "UPDATE configurations SET is_active=?1, updated_at=?2 WHERE id=?3",
            params![active, now, id],
        )
    })?;
    tx.commit()?;
    Ok(())
}

fn deactivate_siblings(
    conn: &Connection,
    prompt_template_id: Option<i64>,
    keep_id: Option<i64>,
) -> Result<()> {
    let now = now_millis();
    retry_on_locked(|| {
        conn.execute(
            "UPDATE configurations SET is_active=0, updated_at=?1
             WHERE prompt_template_id IS ?2 AND is_active=1 AND id IS NOT ?3",
            params![now, prompt_template_id, keep_id],
        )
    })?;
    Ok(())
}

pub fn get_configuration_by_id(conn: &Connection, id: i64) -> Result<Option<Configuration>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM configurations WHERE id=?1",
            CONFIGURATION_COLUMNS
        ),
        params![id],
        map_configuration,
    )
    .optional()
    .map_err(Into::into)
}

/**
 * \brief 查找激活配置；`None` 表示默认配置槽位。
 * \details 多条命中时按 updated_at 倒序、id 倒序取第一条。
 */
pub fn find_active_configuration(
    conn: &Connection,
    prompt_template_id: Option<i64>,
) -> Result<Option<Configuration>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM configurations
             WHERE prompt_template_id IS ?1 AND is_active=1
             ORDER BY updated_at DESC, id DESC LIMIT 1",
            CONFIGURATION_COLUMNS
        ),
        params![prompt_template_id],
        map_configuration,
    )
    .optional()
    .map_err(Into::into)
}

pub fn list_configurations(conn: &Connection) -> Result<Vec<Configuration>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM configurations ORDER BY id ASC",
        CONFIGURATION_COLUMNS
    ))?;
    let rows = stmt
        .query_map([], map_configuration)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ---------------------------------------------------------------------------
// interactions
// ---------------------------------------------------------------------------

/**
 * \brief 追加一条调用日志。
 */
pub fn insert_interaction(conn: &Connection, record: &InteractionRecord) -> Result<i64> {
    let created_at = OffsetDateTime::now_utc().format(&Rfc3339)?;
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO interactions
                (function_name, provider_id, model_id, prompt_template_id, input_tokens, output_tokens,
                 cost, latency_ms, success, error_kind, error_message, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                record.function_name,
                record.provider_id,
                record.model_id,
                record.prompt_template_id,
                to_i64(record.usage.input_tokens),
                to_i64(record.usage.output_tokens),
                record.cost,
                to_i64(record.latency_ms),
                record.success,
                record.error_kind,
                record.error_message,
                created_at
            ],
        )
    })?;
    Ok(conn.last_insert_rowid())
}

/**
 * \brief 最近的调用日志（按主键倒序）。
 */
pub fn list_interactions(conn: &Connection, limit: usize) -> Result<Vec<Interaction>> {
    let mut stmt = conn.prepare(
        "SELECT id, function_name, provider_id, model_id, prompt_template_id, input_tokens,
                output_tokens, cost, latency_ms, success, error_kind, error_message, created_at
         FROM interactions ORDER BY id DESC LIMIT ?1",
    )?;
    let rows = stmt
        .query_map(params![to_i64(limit as u64)], |row| {
            Ok(Interaction {
                id: row.get(0)?,
                function_name: row.get(1)?,
                provider_id: row.get(2)?,
                model_id: row.get(3)?,
                prompt_template_id: row.get(4)?,
                input_tokens: row.get::<_, i64>(5)?.max(0) as u64,
                output_tokens: row.get::<_, i64>(6)?.max(0) as u64,
                cost: row.get(7)?,
                latency_ms: row.get::<_, i64>(8)?.max(0) as u64,
                success: row.get(9)?,
                error_kind: row.get(10)?,
                error_message: row.get(11)?,
                created_at: row.get(12)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/**
 * \brief 按模型聚合调用次数、失败次数、token 与费用。
 */
pub fn usage_summary(conn: &Connection) -> Result<Vec<ModelUsageSummary>> {
    let mut stmt = conn.prepare(
        "SELECT i.model_id, m.model_identifier, COUNT(*),
                SUM(CASE WHEN i.success=0 THEN 1 ELSE 0 END),
                SUM(i.input_tokens), SUM(i.output_tokens), SUM(i.cost)
         FROM interactions i LEFT JOIN models m ON m.id = i.model_id
         GROUP BY i.model_id ORDER BY i.model_id ASC",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(ModelUsageSummary {
                model_id: row.get(0)?,
                model_identifier: row.get(1)?,
                calls: row.get::<_, i64>(2)?.max(0) as u64,
                failures: row.get::<_, i64>(3)?.max(0) as u64,
                input_tokens: row.get::<_, i64>(4)?.max(0) as u64,
                output_tokens: row.get::<_, i64>(5)?.max(0) as u64,
                cost: row.get(6)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
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

/**
 * \brief 线程安全的存储句柄，供编排层注入使用。
 */
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::from_connection(open_db(path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        migrate(&conn)?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    /**
     * \brief 在持锁状态下执行一段数据库操作。
     */
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self
            .conn
            .lock()
            .map_err(|_| anyhow!("store connection mutex poisoned"))?;
        f(&guard)
    }
}

impl ConfigurationStore for Store {
    fn active_prompt_template(&self, name: &str) -> crate::error::Result<Option<PromptTemplate>> {
        self.with_conn(|c| find_active_prompt_template(c, name))
            .map_err(LlmError::from)
    }

    fn prompt_template(&self, id: i64) -> crate::error::Result<Option<PromptTemplate>> {
        self.with_conn(|c| get_prompt_template_by_id(c, id))
            .map_err(LlmError::from)
    }

    fn active_configuration(
        &self,
        prompt_template_id: Option<i64>,
    ) -> crate::error::Result<Option<Configuration>> {
        self.with_conn(|c| find_active_configuration(c, prompt_template_id))
            .map_err(LlmError::from)
    }

    fn provider(&self, id: i64) -> crate::error::Result<Option<Provider>> {
        self.with_conn(|c| get_provider_by_id(c, id))
            .map_err(LlmError::from)
    }

    fn model(&self, id: i64) -> crate::error::Result<Option<Model>> {
        self.with_conn(|c| get_model_by_id(c, id))
            .map_err(LlmError::from)
    }
}

impl InteractionLog for Store {
    fn append(&self, record: &InteractionRecord) -> crate::error::Result<i64> {
        self.with_conn(|c| insert_interaction(c, record))
            .map_err(LlmError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Usage;

    fn mem_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        migrate(&conn).expect("migrate");
        conn
    }

    fn seed_provider_and_model(conn: &Connection) -> (i64, i64) {
        let pid = insert_provider(conn, "anthropic", "anthropic", "https://api.anthropic.com", None)
            .expect("insert provider");
        let mid = insert_model(
            conn,
            pid,
            "Claude Sonnet",
            "claude-sonnet-4-5",
            CostRates {
                input_per_1k: Some(3.0),
                output_per_1k: Some(15.0),
                blended_per_1k: None,
            },
        )
        .expect("insert model");
        (pid, mid)
    }

    #[test]
    fn test_provider_crud_and_credential() {
        let conn = mem_conn();
        let id = insert_provider(&conn, "openai", "openai", "https://api.openai.com", Some(4))
            .expect("insert provider");
        let p = get_provider_by_id(&conn, id).expect("get").unwrap();
        assert!(!p.has_credential());
        assert_eq!(p.max_concurrency, Some(4));

        set_provider_credential(&conn, id, "v2:blob").expect("set credential");
        set_provider_active(&conn, id, false).expect("deactivate");
        let p = get_provider_by_name(&conn, "openai").expect("get").unwrap();
        assert!(p.has_credential());
        assert!(!p.is_active);

        assert!(set_provider_credential(&conn, id + 100, "x").is_err());
        assert!(insert_provider(&conn, "openai", "openai", "https://x", None).is_err());
        assert_eq!(list_providers(&conn).expect("list").len(), 1);
    }

    #[test]
    fn test_model_requires_existing_provider() {
        let conn = mem_conn();
        assert!(insert_model(&conn, 42, "ghost", "ghost-1", CostRates::default()).is_err());
        let (pid, mid) = seed_provider_and_model(&conn);
        let m = get_model_by_id(&conn, mid).expect("get").unwrap();
        assert_eq!(m.provider_id, pid);
        assert_eq!(m.rates.input_per_1k, Some(3.0));
        assert_eq!(m.rates.blended_per_1k, None);
        assert_eq!(list_models_for_provider(&conn, pid).expect("list").len(), 1);
    }

    #[test]
    fn test_template_content_edit_creates_new_version() {
        let conn = mem_conn();
        let (pid, mid) = seed_provider_and_model(&conn);
        let v1 = insert_prompt_template(&conn, "chat_system", "Eres {NOMBRE}").expect("insert");
        let cfg = insert_configuration(&conn, pid, mid, Some(v1), CallParameters::default())
            .expect("insert configuration");

        let v2 = update_prompt_template_content(&conn, v1, "Eres {NOMBRE}, juez").expect("edit");
        assert_ne!(v1, v2);

        let versions = list_prompt_template_versions(&conn, "chat_system").expect("versions");
        assert_eq!(versions.len(), 2);
        assert!(!versions[0].is_active);
        assert!(versions[1].is_active);
        assert_eq!(versions[1].version, 2);

        let active = find_active_prompt_template(&conn, "chat_system")
            .expect("find")
            .unwrap();
        assert_eq!(active.id, v2);

        let moved = get_configuration_by_id(&conn, cfg).expect("get").unwrap();
        assert_eq!(moved.prompt_template_id, Some(v2));
    }

    #[test]
    fn test_editing_a_retired_version_keeps_the_binding() {
        let conn = mem_conn();
        let (pid, mid) = seed_provider_and_model(&conn);
        let v1 = insert_prompt_template(&conn, "judge", "v1").expect("insert");
        let cfg = insert_configuration(&conn, pid, mid, Some(v1), CallParameters::default())
            .expect("configuration");
        let v2 = update_prompt_template_content(&conn, v1, "v2").expect("edit v1");
        assert_eq!(
            get_configuration_by_id(&conn, cfg).unwrap().unwrap().prompt_template_id,
            Some(v2)
        );

        // 通过已退役的 v1 再次编辑
        let v3 = update_prompt_template_content(&conn, v1, "v3").expect("edit stale v1");
        let active = find_active_prompt_template(&conn, "judge").unwrap().unwrap();
        assert_eq!(active.id, v3);
        let bound = find_active_configuration(&conn, Some(v3)).unwrap().unwrap();
        assert_eq!(bound.id, cfg);
    }

    #[test]
    fn test_reactivating_old_version_moves_the_binding() {
        let conn = mem_conn();
        let (pid, mid) = seed_provider_and_model(&conn);
        let v1 = insert_prompt_template(&conn, "judge", "v1").expect("insert");
        let cfg = insert_configuration(&conn, pid, mid, Some(v1), CallParameters::default())
            .expect("configuration");
        let v2 = update_prompt_template_content(&conn, v1, "v2").expect("edit");

        set_prompt_template_active(&conn, v1, true).expect("roll back to v1");
        let active = find_active_prompt_template(&conn, "judge").unwrap().unwrap();
        assert_eq!(active.id, v1);
        assert_eq!(find_active_configuration(&conn, Some(v1)).unwrap().unwrap().id, cfg);
        assert!(find_active_configuration(&conn, Some(v2)).unwrap().is_none());
    }

    #[test]
    fn test_rebinding_leaves_one_active_configuration() {
        let conn = mem_conn();
        let (pid, mid) = seed_provider_and_model(&conn);
        let v1 = insert_prompt_template(&conn, "judge", "v1").expect("insert");
        let stale = insert_configuration(&conn, pid, mid, Some(v1), CallParameters::default())
            .expect("stale configuration");
        let v2 = insert_prompt_template(&conn, "judge", "v2").expect("second version");
        let current = insert_configuration(&conn, pid, mid, Some(v2), CallParameters::default())
            .expect("current configuration");

        let v3 = update_prompt_template_content(&conn, v2, "v3").expect("edit");
        assert_eq!(find_active_configuration(&conn, Some(v3)).unwrap().unwrap().id, current);
        assert!(!get_configuration_by_id(&conn, stale).unwrap().unwrap().is_active);
    }

    #[test]
    fn test_template_same_content_is_noop() {
        let conn = mem_conn();
        let v1 = insert_prompt_template(&conn, "judge", "body").expect("insert");
        let same = update_prompt_template_content(&conn, v1, "body").expect("edit");
        assert_eq!(v1, same);
        assert_eq!(list_prompt_template_versions(&conn, "judge").unwrap().len(), 1);
    }

    #[test]
    fn test_template_metadata_edit_is_in_place() {
        let conn = mem_conn();
        let v1 = insert_prompt_template(&conn, "judge", "a").expect("insert");
        let v2 = insert_prompt_template(&conn, "judge", "b").expect("insert");

        set_prompt_template_active(&conn, v1, true).expect("activate v1");
        let versions = list_prompt_template_versions(&conn, "judge").unwrap();
        assert_eq!(versions.len(), 2);
        assert!(versions[0].is_active);
        assert!(!versions[1].is_active);

        set_prompt_template_active(&conn, v1, false).expect("deactivate v1");
        assert!(find_active_prompt_template(&conn, "judge").unwrap().is_none());
        assert!(get_prompt_template_by_id(&conn, v2).unwrap().is_some());
    }

    #[test]
    fn test_single_active_configuration_per_template() {
        let conn = mem_conn();
        let (pid, mid) = seed_provider_and_model(&conn);
        let t = insert_prompt_template(&conn, "chat_system", "x").expect("template");

        let first = insert_configuration(&conn, pid, mid, Some(t), CallParameters::default())
            .expect("first");
        let second = insert_configuration(
            &conn,
            pid,
            mid,
            Some(t),
            CallParameters {
                temperature: Some(0.2),
                max_tokens: Some(512),
            },
        )
        .expect("second");
        let default = insert_configuration(&conn, pid, mid, None, CallParameters::default())
            .expect("default");

        let active = find_active_configuration(&conn, Some(t)).unwrap().unwrap();
        assert_eq!(active.id, second);
        assert_eq!(active.parameters.max_tokens, Some(512));
        assert!(!get_configuration_by_id(&conn, first).unwrap().unwrap().is_active);

        let fallback = find_active_configuration(&conn, None).unwrap().unwrap();
        assert_eq!(fallback.id, default);

        set_configuration_active(&conn, first, true).expect("reactivate first");
        let active = find_active_configuration(&conn, Some(t)).unwrap().unwrap();
        assert_eq!(active.id, first);
        // 默认槽位不受影响
        assert!(get_configuration_by_id(&conn, default).unwrap().unwrap().is_active);
    }

    #[test]
    fn test_most_recently_updated_configuration_wins() {
        let conn = mem_conn();
        let (pid, mid) = seed_provider_and_model(&conn);
        conn.execute(
            "INSERT INTO configurations (provider_id, model_id, prompt_template_id, is_active, updated_at)
             VALUES (?1, ?2, NULL, 1, 2000), (?1, ?2, NULL, 1, 1000), (?1, ?2, NULL, 1, 2000)",
            params![pid, mid],
        )
        .expect("raw insert");
        let winner = find_active_configuration(&conn, None).unwrap().unwrap();
        assert_eq!(winner.updated_at, 2000);
        // 相同时间戳时取较新的主键
        assert_eq!(winner.id, 3);
    }

    #[test]
    fn test_interactions_append_and_summary() {
        let conn = mem_conn();
        let (pid, mid) = seed_provider_and_model(&conn);
        let ok = InteractionRecord {
            function_name: "chat_system".into(),
            provider_id: Some(pid),
            model_id: Some(mid),
            prompt_template_id: None,
            usage: Usage {
                input_tokens: 100,
                output_tokens: 50,
            },
            cost: 1.05,
            latency_ms: 420,
            success: true,
            error_kind: None,
            error_message: None,
        };
        let failed = InteractionRecord {
            usage: Usage::default(),
            cost: 0.0,
            success: false,
            error_kind: Some("provider_rejected".into()),
            error_message: Some(r#"{"error":"invalid model"}"#.into()),
            ..ok.clone()
        };
        insert_interaction(&conn, &ok).expect("insert ok");
        insert_interaction(&conn, &failed).expect("insert failed");

        let rows = list_interactions(&conn, 10).expect("list");
        assert_eq!(rows.len(), 2);
        assert!(!rows[0].success);
        assert_eq!(rows[0].error_message.as_deref(), Some(r#"{"error":"invalid model"}"#));
        assert_eq!(rows[1].input_tokens, 100);

        let summary = usage_summary(&conn).expect("summary");
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].calls, 2);
        assert_eq!(summary[0].failures, 1);
        assert_eq!(summary[0].model_identifier.as_deref(), Some("claude-sonnet-4-5"));
        assert!((summary[0].cost - 1.05).abs() < 1e-9);
    }

    #[test]
    fn test_telemetry_flag_roundtrip() {
        let conn = mem_conn();
        assert!(!get_telemetry_enabled(&conn).unwrap());
        set_telemetry_enabled(&conn, true).unwrap();
        assert!(get_telemetry_enabled(&conn).unwrap());
    }

    #[test]
    fn test_store_implements_configuration_store() {
        let store = Store::open_in_memory().expect("store");
        let pid = store
            .with_conn(|c| insert_provider(c, "openai", "openai", "https://api.openai.com", None))
            .expect("insert");
        let provider = ConfigurationStore::provider(&store, pid).unwrap().unwrap();
        assert_eq!(provider.kind, "openai");
        assert!(ConfigurationStore::model(&store, 99).unwrap().is_none());
    }
}
