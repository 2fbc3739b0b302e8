use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_CONFIG_FILE: &str = "claude-usage.toml";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub forward: ForwardConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            Self::from_file(path)?
        } else {
            let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
            if default_path.exists() {
                Self::from_file(&default_path)?
            } else {
                Self::default()
            }
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self =
            toml::from_str(&contents).with_context(|| "failed to parse configuration TOML")?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = env::var("CLAUDE_USAGE_PROJECTS_DIR") {
            self.sessions.projects_dir = PathBuf::from(dir);
        }
        if let Ok(db_path) = env::var("CLAUDE_USAGE_DB_PATH") {
            self.storage.database_path = PathBuf::from(db_path);
        }
        if let Ok(url) = env::var("CLAUDE_USAGE_FORWARD_URL") {
            self.forward.url = Some(url).filter(|url| !url.is_empty());
        }
        if let Ok(log_path) = env::var("CLAUDE_USAGE_LOG_FILE") {
            self.logging.file = Some(PathBuf::from(log_path));
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionsConfig {
    #[serde(default = "default_projects_dir")]
    pub projects_dir: PathBuf,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            projects_dir: default_projects_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatcherConfig {
    /// How long a file's size must stay unchanged before it is tailed.
    #[serde(default = "default_stabilization_ms")]
    pub stabilization_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Extra time a path stays claimed after its tail pass finishes.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Directory levels below the projects root that are watched.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl WatcherConfig {
    pub fn stabilization(&self) -> Duration {
        Duration::from_millis(self.stabilization_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            stabilization_ms: default_stabilization_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            cooldown_secs: default_cooldown_secs(),
            max_depth: default_max_depth(),
            event_buffer: default_event_buffer(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForwardConfig {
    /// When set, events are POSTed here instead of written to the local store.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_forward_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: default_forward_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub file: Option<PathBuf>,
}

fn default_projects_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude")
        .join("projects")
}

fn default_database_path() -> PathBuf {
    PathBuf::from("claude-usage.db")
}

fn default_stabilization_ms() -> u64 {
    2000
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_cooldown_secs() -> u64 {
    5
}

fn default_max_depth() -> usize {
    2
}

fn default_event_buffer() -> usize {
    1024
}

fn default_forward_timeout_secs() -> u64 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        env, fs,
        path::PathBuf,
        sync::{Mutex, OnceLock},
    };
    use tempfile::NamedTempFile;

    const ENV_KEYS: [&str; 4] = [
        "CLAUDE_USAGE_PROJECTS_DIR",
        "CLAUDE_USAGE_DB_PATH",
        "CLAUDE_USAGE_FORWARD_URL",
        "CLAUDE_USAGE_LOG_FILE",
    ];

    #[test]
    fn load_from_file_fills_missing_fields_with_defaults() {
        let _lock = ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap();
        let _guards: Vec<EnvGuard> = ENV_KEYS.into_iter().map(EnvGuard::unset).collect();

        let file = NamedTempFile::new().unwrap();
        let toml = r#"
            [sessions]
            projects_dir = "/data/projects"

            [storage]
            database_path = "custom.db"

            [watcher]
            stabilization_ms = 750
            max_depth = 3
        "#;
        fs::write(file.path(), toml).unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.sessions.projects_dir, PathBuf::from("/data/projects"));
        assert_eq!(config.storage.database_path, PathBuf::from("custom.db"));
        assert_eq!(config.watcher.stabilization(), Duration::from_millis(750));
        assert_eq!(config.watcher.max_depth, 3);
        assert_eq!(config.watcher.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.watcher.cooldown(), Duration::from_secs(5));
        assert!(config.forward.url.is_none());
        assert!(config.logging.file.is_none());
    }

    #[test]
    fn env_overrides_take_precedence() {
        let _lock = ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap();
        let _dir_guard = EnvGuard::set("CLAUDE_USAGE_PROJECTS_DIR", "/tmp/claude-projects");
        let _db_guard = EnvGuard::set("CLAUDE_USAGE_DB_PATH", "/tmp/claude-test.db");
        let _url_guard = EnvGuard::set("CLAUDE_USAGE_FORWARD_URL", "http://127.0.0.1:3001/api");
        let _log_guard = EnvGuard::set("CLAUDE_USAGE_LOG_FILE", "/tmp/claude-usage.log");

        let file = NamedTempFile::new().unwrap();
        fs::write(
            file.path(),
            r#"
            [storage]
            database_path = "ignored.db"

            [forward]
            url = "http://example.com"
            "#,
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(
            config.sessions.projects_dir,
            PathBuf::from("/tmp/claude-projects")
        );
        assert_eq!(
            config.storage.database_path,
            PathBuf::from("/tmp/claude-test.db")
        );
        assert_eq!(
            config.forward.url.as_deref(),
            Some("http://127.0.0.1:3001/api")
        );
        assert_eq!(
            config.logging.file,
            Some(PathBuf::from("/tmp/claude-usage.log"))
        );
    }

    #[test]
    fn empty_forward_url_disables_forwarding() {
        let _lock = ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap();
        let _url_guard = EnvGuard::set("CLAUDE_USAGE_FORWARD_URL", "");

        let file = NamedTempFile::new().unwrap();
        fs::write(file.path(), "[forward]\nurl = \"http://example.com\"\n").unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert!(config.forward.url.is_none());
    }

    #[test]
    fn invalid_toml_is_reported() {
        let file = NamedTempFile::new().unwrap();
        fs::write(file.path(), "[watcher\nmax_depth = 1").unwrap();
        let err = AppConfig::load(Some(file.path())).unwrap_err();
        assert!(err.to_string().contains("failed to parse configuration TOML"));
    }

    struct EnvGuard {
        key: &'static str,
        previous: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let previous = env::var(key).ok();
            unsafe { env::set_var(key, value) };
            Self { key, previous }
        }

        fn unset(key: &'static str) -> Self {
            let previous = env::var(key).ok();
            if previous.is_some() {
                unsafe { env::remove_var(key) };
            }
            Self { key, previous }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            if let Some(ref value) = self.previous {
                unsafe { env::set_var(self.key, value) };
            } else {
                unsafe { env::remove_var(self.key) };
            }
        }
    }

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
}
