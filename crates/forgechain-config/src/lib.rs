//! Layered settings discovery and merge (§3, §6).
//!
//! Ports `config.py`'s `AppSettings`/`load_settings`/`merge` onto typed
//! `serde` structs, and adds a discovery walk in the shape of the teacher's
//! `xchecker-config::Config::discover_from` (explicit path, then walk-upward
//! search, then built-in defaults) ahead of the original's single fixed
//! `DEFAULT_SETTINGS_FILE` lookup.

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

pub const DEFAULT_SETTINGS_FILE: &str = "forgechain.json";

pub const DEFAULT_DENY_EXTENSIONS: &[&str] = &[
    ".exe", ".dll", ".zip", ".7z", ".rar", ".png", ".jpg", ".jpeg", ".gif", ".pdf", ".db",
    ".sqlite", ".pkl", ".pt", ".onnx",
];

pub const DEFAULT_DENY_GLOBS: &[&str] =
    &["**/.git/**", "**/node_modules/**", "**/venv/**", "**/.venv/**", "**/LOG/**"];

fn deny_extensions() -> Vec<String> {
    DEFAULT_DENY_EXTENSIONS.iter().map(|s| s.to_string()).collect()
}

fn deny_globs() -> Vec<String> {
    DEFAULT_DENY_GLOBS.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_s: f64,
    pub max_delay_s: f64,
    pub jitter_s: f64,
    pub circuit_breaker_failures: u32,
    pub circuit_breaker_cooldown_s: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            base_delay_s: 0.8,
            max_delay_s: 20.0,
            jitter_s: 0.25,
            circuit_breaker_failures: 6,
            circuit_breaker_cooldown_s: 20.0,
        }
    }
}

impl From<&RetryPolicy> for forgechain_retry::RetryPolicy {
    fn from(p: &RetryPolicy) -> Self {
        forgechain_retry::RetryPolicy {
            max_attempts: p.max_attempts,
            base_delay: std::time::Duration::from_secs_f64(p.base_delay_s.max(0.0)),
            max_delay: std::time::Duration::from_secs_f64(p.max_delay_s.max(0.0)),
            jitter: std::time::Duration::from_secs_f64(p.jitter_s.max(0.0)),
            circuit_breaker_failures: p.circuit_breaker_failures,
            circuit_breaker_cooldown: std::time::Duration::from_secs_f64(p.circuit_breaker_cooldown_s.max(0.0)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingPolicy {
    pub max_total_mb: u64,
    pub max_runs: u32,
    pub encrypt_logs: bool,
    pub mask_secrets: bool,
}

impl Default for LoggingPolicy {
    fn default() -> Self {
        Self { max_total_mb: 2048, max_runs: 200, encrypt_logs: false, mask_secrets: false }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingPolicy {
    pub source_url: String,
    pub cache_ttl_hours: u32,
    pub auto_refresh_on_start: bool,
}

impl Default for PricingPolicy {
    fn default() -> Self {
        Self {
            source_url: "https://raw.githubusercontent.com/openai/openai-python/refs/heads/main/pricing.json".to_string(),
            cache_ttl_hours: 72,
            auto_refresh_on_start: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityPolicy {
    pub allow_upload_sensitive: bool,
    pub deny_extensions_in: Option<Vec<String>>,
    pub allow_extensions_in: Option<Vec<String>>,
    pub deny_globs_in: Option<Vec<String>>,
    pub allow_globs_in: Option<Vec<String>>,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            allow_upload_sensitive: false,
            deny_extensions_in: Some(deny_extensions()),
            allow_extensions_in: None,
            deny_globs_in: Some(deny_globs()),
            allow_globs_in: None,
        }
    }
}

/// The fully-resolved, typed settings tree. SMTP/SSH sections from the
/// original dataclass are dropped; their consumers are out of scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub db_path: String,
    pub log_dir: String,
    pub cache_dir: String,
    pub retry: RetryPolicy,
    pub logging: LoggingPolicy,
    pub pricing: PricingPolicy,
    pub security: SecurityPolicy,
    pub batch_poll_interval_s: f64,
    pub batch_timeout_s: f64,
    pub default_model: String,
    pub default_temperature: f64,
    pub dry_run_modify: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: "forgechain.sqlite".to_string(),
            log_dir: "LOG".to_string(),
            cache_dir: "cache".to_string(),
            retry: RetryPolicy::default(),
            logging: LoggingPolicy::default(),
            pricing: PricingPolicy::default(),
            security: SecurityPolicy::default(),
            batch_poll_interval_s: 4.0,
            batch_timeout_s: 60.0 * 60.0,
            default_model: String::new(),
            default_temperature: 0.2,
            dry_run_modify: false,
        }
    }
}

/// Where a loaded settings tree came from, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Defaults,
    ConfigFile(Utf8PathBuf),
    Env,
}

/// Recursively overlay the JSON object `patch` onto `value`, only replacing
/// the fields `patch` actually sets — mirrors `config.py::load_settings`'s
/// nested `merge(obj, data)` helper, but operating on `serde_json::Value`
/// ahead of the final typed deserialize so unknown keys are tolerated the
/// same way `hasattr` skip does in the original.
fn merge_json(base: &mut serde_json::Value, patch: &serde_json::Value) {
    let (Some(base_obj), Some(patch_obj)) = (base.as_object_mut(), patch.as_object()) else {
        return;
    };
    for (k, v) in patch_obj {
        match base_obj.get_mut(k) {
            Some(existing) if existing.is_object() && v.is_object() => merge_json(existing, v),
            _ => {
                base_obj.insert(k.clone(), v.clone());
            }
        }
    }
}

/// Parse and merge one JSON settings file on top of `settings`.
pub fn apply_settings_file(settings: &mut Settings, text: &str) -> anyhow::Result<()> {
    let patch: serde_json::Value = serde_json::from_str(text)?;
    let mut base = serde_json::to_value(&*settings)?;
    merge_json(&mut base, &patch);
    *settings = serde_json::from_value(base)?;
    Ok(())
}

/// Environment overrides, applied after the project file and before CLI
/// flags. Only a handful of settings are realistically operator-tunable via
/// environment in a CI/headless context.
fn apply_env_overrides(settings: &mut Settings) {
    if let Ok(model) = std::env::var("FORGECHAIN_DEFAULT_MODEL") {
        if !model.trim().is_empty() {
            settings.default_model = model;
        }
    }
    if let Ok(db) = std::env::var("FORGECHAIN_DB_PATH") {
        if !db.trim().is_empty() {
            settings.db_path = db;
        }
    }
    if let Ok(log_dir) = std::env::var("FORGECHAIN_LOG_DIR") {
        if !log_dir.trim().is_empty() {
            settings.log_dir = log_dir;
        }
    }
}

/// Walk from `start_dir` upward looking for `DEFAULT_SETTINGS_FILE`,
/// stopping at the filesystem root. Mirrors the teacher's
/// `discover_config_file_from` upward search.
fn discover_config_file_from(start_dir: &Utf8Path) -> Option<Utf8PathBuf> {
    let mut dir = start_dir.to_path_buf();
    loop {
        let candidate = dir.join(DEFAULT_SETTINGS_FILE);
        if candidate.is_file() {
            return Some(candidate);
        }
        if !dir.pop() {
            return None;
        }
    }
}

/// Discover and load settings with precedence: explicit path > discovered
/// project file > built-in defaults, then environment overrides layered on
/// top. Never replaces the whole document; each layer only overrides the
/// fields it sets.
pub fn discover_and_load(
    start_dir: &Utf8Path,
    explicit_config_path: Option<&Utf8Path>,
) -> anyhow::Result<(Settings, ConfigSource)> {
    let mut settings = Settings::default();
    let mut source = ConfigSource::Defaults;

    let config_path: Option<Utf8PathBuf> = match explicit_config_path {
        Some(p) => Some(p.to_path_buf()),
        None => discover_config_file_from(start_dir),
    };

    if let Some(path) = &config_path {
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read settings file {path}: {e}"))?;
        apply_settings_file(&mut settings, &text)?;
        source = ConfigSource::ConfigFile(path.clone());
    }

    apply_env_overrides(&mut settings);

    Ok((settings, source))
}

/// Serialize `settings` to pretty JSON and write it atomically to `path`,
/// creating parent directories as needed — matches `config.py::save_settings`.
pub fn save_settings(settings: &Settings, path: &Utf8Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_string_pretty(settings)?;
    forgechain_utils::atomic_write::write_file_atomic(path, &json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn defaults_match_original_app_settings() {
        let s = Settings::default();
        assert_eq!(s.db_path, "forgechain.sqlite");
        assert_eq!(s.retry.max_attempts, 6);
        assert_eq!(s.security.deny_extensions_in.as_ref().unwrap().len(), 15);
        assert_eq!(s.pricing.cache_ttl_hours, 72);
    }

    #[test]
    fn apply_settings_file_overrides_only_set_fields() {
        let mut s = Settings::default();
        apply_settings_file(&mut s, r#"{"default_model": "gpt-4o", "retry": {"max_attempts": 3}}"#).unwrap();
        assert_eq!(s.default_model, "gpt-4o");
        assert_eq!(s.retry.max_attempts, 3);
        assert_eq!(s.retry.base_delay_s, 0.8);
        assert_eq!(s.log_dir, "LOG");
    }

    #[test]
    fn apply_settings_file_tolerates_unknown_keys() {
        let mut s = Settings::default();
        apply_settings_file(&mut s, r#"{"not_a_real_field": 42}"#).unwrap();
        assert_eq!(s, Settings::default());
    }

    #[test]
    fn discover_prefers_explicit_path_over_walk() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        std::fs::write(root.join(DEFAULT_SETTINGS_FILE), r#"{"default_model": "from-cwd"}"#).unwrap();

        let explicit_dir = tempfile::tempdir().unwrap();
        let explicit_path = Utf8Path::from_path(explicit_dir.path()).unwrap().join("explicit.json");
        std::fs::write(&explicit_path, r#"{"default_model": "from-explicit"}"#).unwrap();

        let (settings, source) = discover_and_load(root, Some(&explicit_path)).unwrap();
        assert_eq!(settings.default_model, "from-explicit");
        assert_eq!(source, ConfigSource::ConfigFile(explicit_path));
    }

    #[test]
    fn discover_walks_up_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        std::fs::write(root.join(DEFAULT_SETTINGS_FILE), r#"{"default_model": "from-parent"}"#).unwrap();
        let nested = root.join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        let (settings, source) = discover_and_load(&nested, None).unwrap();
        assert_eq!(settings.default_model, "from-parent");
        assert_eq!(source, ConfigSource::ConfigFile(root.join(DEFAULT_SETTINGS_FILE)));
    }

    #[test]
    fn discover_falls_back_to_defaults_when_nothing_found() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let (settings, source) = discover_and_load(root, None).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(source, ConfigSource::Defaults);
    }

    #[test]
    #[serial]
    fn env_override_applies_after_file_layer() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        std::fs::write(root.join(DEFAULT_SETTINGS_FILE), r#"{"default_model": "from-file"}"#).unwrap();

        unsafe { std::env::set_var("FORGECHAIN_DEFAULT_MODEL", "from-env") };
        let (settings, _) = discover_and_load(root, None).unwrap();
        unsafe { std::env::remove_var("FORGECHAIN_DEFAULT_MODEL") };

        assert_eq!(settings.default_model, "from-env");
    }

    #[test]
    fn retry_policy_converts_to_retry_crate_durations() {
        let p = RetryPolicy::default();
        let converted: forgechain_retry::RetryPolicy = (&p).into();
        assert_eq!(converted.max_attempts, 6);
        assert_eq!(converted.max_delay, std::time::Duration::from_secs(20));
    }

    #[test]
    fn save_settings_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(dir.path()).unwrap().join("out.json");
        let mut s = Settings::default();
        s.default_model = "gpt-4o-mini".to_string();
        save_settings(&s, &path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let loaded: Settings = serde_json::from_str(&text).unwrap();
        assert_eq!(loaded, s);
    }
}
