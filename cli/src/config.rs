use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::Deserialize;
use std::path::{Path, PathBuf};

const DB_ENV: &str = "NOURISH_DB";
const COACH_KEY_ENV: &str = "NOURISH_COACH_API_KEY";

/// Larger config files are rejected rather than read into memory.
const MAX_CONFIG_SIZE: u64 = 1_048_576;

/// Accepted range for `server.session_ttl_days`.
const SESSION_TTL_DAYS: std::ops::RangeInclusive<i64> = 1..=3650;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind: String,
    pub port: u16,
    pub session_ttl_days: i64,
    pub recommendation_ttl_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8080,
            session_ttl_days: 30,
            recommendation_ttl_secs: 600,
        }
    }
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct CoachSettings {
    pub base_url: Option<String>,
    pub model: String,
    pub api_key: Option<String>,
}

impl Default for CoachSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            model: "gpt-4o-mini".to_string(),
            api_key: None,
        }
    }
}

// The API key never appears in logs or error output.
impl std::fmt::Debug for CoachSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoachSettings")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FoodSettings {
    pub openfoodfacts: bool,
}

impl Default for FoodSettings {
    fn default() -> Self {
        Self {
            openfoodfacts: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub coach: CoachSettings,
    pub foods: FoodSettings,
}

impl Settings {
    /// Missing or empty file gives the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > MAX_CONFIG_SIZE => {
                anyhow::bail!(
                    "Config file {} is {} bytes (max {MAX_CONFIG_SIZE})",
                    path.display(),
                    meta.len()
                );
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read config file: {}", path.display()));
            }
            Ok(_) => {}
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let settings: Self = toml::from_str(&content)
            .with_context(|| format!("Invalid TOML in config file: {}", path.display()))?;
        settings
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        let ttl = self.server.session_ttl_days;
        if !SESSION_TTL_DAYS.contains(&ttl) {
            anyhow::bail!(
                "server.session_ttl_days must be between {} and {}, got {ttl}",
                SESSION_TTL_DAYS.start(),
                SESSION_TTL_DAYS.end()
            );
        }
        Ok(())
    }

    fn apply_env(&mut self, coach_key: Option<String>) {
        if let Some(key) = coach_key.filter(|k| !k.trim().is_empty()) {
            self.coach.api_key = Some(key);
        }
    }
}

#[derive(Debug)]
pub struct Config {
    pub db_path: PathBuf,
    pub data_dir: PathBuf,
    pub settings: Settings,
}

impl Config {
    /// `db_override` (from `--db`) wins over `NOURISH_DB`, which wins over the data dir.
    pub fn load(db_override: Option<PathBuf>) -> Result<Self> {
        let proj_dirs =
            ProjectDirs::from("", "", "nourish").context("Could not determine home directory")?;

        let data_dir = proj_dirs.data_dir().to_path_buf();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

        let mut settings = Settings::load(&proj_dirs.config_dir().join("config.toml"))?;
        settings.apply_env(std::env::var(COACH_KEY_ENV).ok());

        let db_path = db_override
            .or_else(|| std::env::var_os(DB_ENV).map(PathBuf::from))
            .unwrap_or_else(|| data_dir.join("nourish.db"));

        Ok(Config {
            db_path,
            data_dir,
            settings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(&dir.path().join("config.toml")).unwrap();
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.server.session_ttl_days, 30);
        assert_eq!(settings.server.recommendation_ttl_secs, 600);
        assert!(settings.foods.openfoodfacts);
        assert!(settings.coach.base_url.is_none());
    }

    #[test]
    fn test_partial_file_merges_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[server]\nport = 9000\n\n[coach]\nbase_url = \"http://localhost:11434/v1\"\nmodel = \"llama3\"\n\n[foods]\nopenfoodfacts = false"
        )
        .unwrap();
        let settings = Settings::load(file.path()).unwrap();
        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.server.bind, "127.0.0.1");
        assert_eq!(
            settings.coach.base_url.as_deref(),
            Some("http://localhost:11434/v1")
        );
        assert_eq!(settings.coach.model, "llama3");
        assert!(!settings.foods.openfoodfacts);
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server\nport = ").unwrap();
        let err = Settings::load(file.path()).unwrap_err();
        assert!(format!("{err:#}").contains("Invalid TOML"));
    }

    #[test]
    fn test_session_ttl_out_of_range_is_an_error() {
        for ttl in ["0", "-3", "100000000"] {
            let mut file = tempfile::NamedTempFile::new().unwrap();
            writeln!(file, "[server]\nsession_ttl_days = {ttl}").unwrap();
            let err = Settings::load(file.path()).unwrap_err();
            assert!(format!("{err:#}").contains("session_ttl_days"), "ttl {ttl}");
        }

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nsession_ttl_days = 3650").unwrap();
        assert_eq!(Settings::load(file.path()).unwrap().server.session_ttl_days, 3650);
    }

    #[test]
    fn test_env_key_overrides_and_debug_redacts() {
        let mut settings = Settings::default();
        settings.coach.api_key = Some("from-file".to_string());
        settings.apply_env(Some("  ".to_string()));
        assert_eq!(settings.coach.api_key.as_deref(), Some("from-file"));

        settings.apply_env(Some("sk-secret".to_string()));
        assert_eq!(settings.coach.api_key.as_deref(), Some("sk-secret"));
        let debug = format!("{:?}", settings.coach);
        assert!(!debug.contains("sk-secret"));
        assert!(debug.contains("[REDACTED]"));
    }
}
