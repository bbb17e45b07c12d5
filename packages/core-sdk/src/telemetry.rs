/*!
 * \brief 调用日志
 * \details 所有事件都会经 `tracing` 输出；开关打开时额外追加到 `logs/debate.log`，
 * 便于脱离终端排查线上调用。
 */

use std::{fs::OpenOptions, io::Write, path::PathBuf};

use anyhow::Result;
use once_cell::sync::Lazy;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

pub const LOG_FILE: &str = "debate.log";

static TELEMETRY_ENABLED: Lazy<std::sync::RwLock<bool>> =
    Lazy::new(|| std::sync::RwLock::new(false));

static LOG_DIR: Lazy<std::sync::RwLock<PathBuf>> =
    Lazy::new(|| std::sync::RwLock::new(PathBuf::from("logs")));

/**
 * \brief 更新文件日志开关状态。
 */
pub fn set_enabled(enabled: bool) {
    if let Ok(mut guard) = TELEMETRY_ENABLED.write() {
        *guard = enabled;
    }
}

/**
 * \brief 查询当前文件日志开关状态。
 */
pub fn is_enabled() -> bool {
    TELEMETRY_ENABLED.read().map(|g| *g).unwrap_or(false)
}

/**
 * \brief 修改日志目录（默认为工作目录下的 `logs/`）。
 */
pub fn set_log_dir(dir: impl Into<PathBuf>) {
    if let Ok(mut guard) = LOG_DIR.write() {
        *guard = dir.into();
    }
}

pub fn log_path() -> PathBuf {
    LOG_DIR
        .read()
        .map(|d| d.join(LOG_FILE))
        .unwrap_or_else(|_| PathBuf::from("logs").join(LOG_FILE))
}

/**
 * \brief 记录常规事件。
 */
pub fn log_event(category: &str, message: &str) {
    tracing::info!(target: "debate", category, "{}", message);
    if !is_enabled() {
        return;
    }
    if let Err(err) = write_line("INFO", category, message) {
        tracing::warn!("telemetry write failed: {}", err);
    }
}

/**
 * \brief 记录错误事件；厂商返回的原始错误正文经此落盘。
 */
pub fn log_error(category: &str, message: &str) {
    tracing::error!(target: "debate", category, "{}", message);
    if !is_enabled() {
        return;
    }
    if let Err(err) = write_line("ERROR", category, message) {
        tracing::warn!("telemetry write failed: {}", err);
    }
}

fn write_line(level: &str, category: &str, message: &str) -> Result<()> {
    let path = log_path();
    if let Some(dir) = path.parent() {
        if !dir.exists() {
            std::fs::create_dir_all(dir)?;
        }
    }
    let timestamp = OffsetDateTime::now_utc().format(&Rfc3339)?;
    let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
    writeln!(file, "{} [{}] {} - {}", timestamp, level, category, message)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writes_only_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        set_log_dir(dir.path());

        set_enabled(false);
        log_event("test.disabled", "should not be written");
        assert!(!log_path().exists());

        set_enabled(true);
        log_error("test.rejected", r#"400: {"error":"invalid model"}"#);
        let content = std::fs::read_to_string(log_path()).unwrap();
        assert!(content.contains("[ERROR] test.rejected"));
        assert!(content.contains(r#"{"error":"invalid model"}"#));
        assert!(!content.contains("should not be written"));

        set_enabled(false);
        set_log_dir("logs");
    }
}
