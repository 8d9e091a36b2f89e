use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{Local, NaiveDate};
use serde::Serialize;
use tracing::debug;

use nibble_core::config::{StoreConfig, SyncOptions};
use nibble_core::connection::ConnectionState;
use nibble_core::session::SyncSession;
use nibble_core::sqlite_store::SqliteStore;
use nibble_core::store::RemoteStore;

use crate::config::Config;
use crate::remote::HttpStore;

/// Path of a `sqlite://` store URL, or `None` for anything else.
pub(crate) fn sqlite_path(url: &str) -> Option<PathBuf> {
    url.trim()
        .strip_prefix("sqlite://")
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
}

pub(crate) fn open_store(store: &StoreConfig) -> Result<Arc<dyn RemoteStore>> {
    if !store.is_configured() {
        bail!(
            "No usable store configured (got '{}'). Set NIBBLE_URL or store_url in config.json",
            store.url
        );
    }
    if let Some(path) = sqlite_path(&store.url) {
        return Ok(Arc::new(SqliteStore::open(&path)?));
    }
    Ok(Arc::new(HttpStore::new(store)?))
}

/// Open the configured store, sign in and probe it.
pub(crate) async fn connect(config: &Config) -> Result<SyncSession> {
    let store_config = config.store_config();
    let store = open_store(&store_config)?;
    let session = SyncSession::new(store, store_config, SyncOptions::default());
    session.start();
    session.sign_in(config.user());
    let state = session.test_connection().await;
    debug!(%state, user = %config.user(), "session ready");
    if state != ConnectionState::Connected {
        eprintln!("Warning: store is {state}; changes cannot be saved");
    }
    Ok(session)
}

pub(crate) fn parse_date(date: Option<String>) -> Result<NaiveDate> {
    match date.as_deref() {
        None | Some("today") => Ok(Local::now().date_naive()),
        Some("yesterday") => Ok(Local::now().date_naive() - chrono::Duration::days(1)),
        Some("tomorrow") => Ok(Local::now().date_naive() + chrono::Duration::days(1)),
        Some(d) => NaiveDate::parse_from_str(d, "%Y-%m-%d")
            .with_context(|| format!("Invalid date: '{d}'. Use YYYY-MM-DD")),
    }
}

/// Parse a non-negative number of calories or grams.
pub(crate) fn parse_amount(label: &str, s: &str) -> Result<f64> {
    let trimmed = s.trim().trim_end_matches('g').trim();
    let value: f64 = trimmed
        .parse()
        .with_context(|| format!("Invalid {label}: '{s}'"))?;
    if !value.is_finite() || value < 0.0 {
        bail!("{label} must be a non-negative number");
    }
    Ok(value)
}

pub(crate) fn json_error(message: &str) -> String {
    #[derive(Serialize)]
    struct CliError<'a> {
        error: &'a str,
    }
    serde_json::to_string(&CliError { error: message })
        .unwrap_or_else(|_| format!("{{\"error\":\"{message}\"}}"))
}

pub(crate) fn no_neg_zero(v: f64) -> f64 {
    if v == 0.0 { 0.0 } else { v }
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let end = s.char_indices().nth(max - 3).map_or(s.len(), |(i, _)| i);
        format!("{}...", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_date_none() {
        let today = Local::now().date_naive();
        assert_eq!(parse_date(None).unwrap(), today);
    }

    #[test]
    fn test_parse_date_keywords() {
        let today = Local::now().date_naive();
        assert_eq!(parse_date(Some("today".to_string())).unwrap(), today);
        assert_eq!(
            parse_date(Some("yesterday".to_string())).unwrap(),
            today - chrono::Duration::days(1)
        );
        assert_eq!(
            parse_date(Some("tomorrow".to_string())).unwrap(),
            today + chrono::Duration::days(1)
        );
    }

    #[test]
    fn test_parse_date_iso() {
        let date = parse_date(Some("2024-01-15".to_string())).unwrap();
        assert_eq!(date, NaiveDate::from_ymd_opt(2024, 1, 15).unwrap());
    }

    #[test]
    fn test_parse_date_invalid() {
        assert!(parse_date(Some("nope".to_string())).is_err());
    }

    #[test]
    fn test_parse_amount() {
        assert!((parse_amount("protein", "32g").unwrap() - 32.0).abs() < f64::EPSILON);
        assert!((parse_amount("calories", " 450.5 ").unwrap() - 450.5).abs() < f64::EPSILON);
        assert!(parse_amount("calories", "-1").is_err());
        assert!(parse_amount("calories", "lots").is_err());
        assert!(parse_amount("calories", "NaN").is_err());
    }

    #[test]
    fn test_sqlite_path() {
        assert_eq!(
            sqlite_path("sqlite:///var/lib/nibble.db"),
            Some(PathBuf::from("/var/lib/nibble.db"))
        );
        assert_eq!(sqlite_path("sqlite://"), None);
        assert_eq!(sqlite_path("https://nibble.home.lan"), None);
    }

    #[test]
    fn test_open_store_refuses_placeholder() {
        let config = StoreConfig::new("https://your-server.example.com", None);
        assert!(open_store(&config).is_err());
    }

    #[test]
    fn test_open_store_local_database() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("n.db").display());
        assert!(open_store(&StoreConfig::new(url, None)).is_ok());
    }

    #[test]
    fn test_truncate_utf8() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("Crème fraîche", 10), "Crème f...");
        assert_eq!(truncate("日清カップヌードル", 8), "日清カップ...");
    }

    #[test]
    fn test_no_neg_zero() {
        assert_eq!(no_neg_zero(-0.0).to_bits(), 0.0_f64.to_bits());
        assert_eq!(no_neg_zero(5.0), 5.0);
        assert_eq!(no_neg_zero(-3.0), -3.0);
    }
}
