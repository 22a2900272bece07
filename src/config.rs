use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

pub const DEFAULT_UPSTREAM_URL: &str = "https://api.anthropic.com";
pub const DEFAULT_LANGFUSE_URL: &str = "https://cloud.langfuse.com";
const DEFAULT_PORT: u16 = 4000;
const DEFAULT_MAX_REQUEST_BYTES: usize = 32 * 1024 * 1024;

/// Descriptor file names probed in the working directory, in order.
const CONFIG_FILE_NAMES: [&str; 4] = [
    "config.yaml",
    "config.yml",
    "proxy_config.yaml",
    "litellm_config.yaml",
];

/// Variables naming an explicit descriptor, in priority order.  The
/// `LITELLM_*` names let existing LiteLLM deployments keep their setup.
const CONFIG_PATH_VARS: [&str; 3] = ["HOOKRELAY_CONFIG", "LITELLM_CONFIG_PATH", "LITELLM_CONFIG"];

#[derive(Debug, Clone, PartialEq)]
pub struct LangfuseConfig {
    pub public_key: String,
    pub secret_key: String,
    pub base_url: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Server-side credential used when an extension rewrote the request,
    /// and when the client sends none.
    pub fallback_api_key: Option<String>,
    pub upstream_url: String,
    pub port: u16,
    pub config_path: Option<PathBuf>,
    pub max_request_bytes: usize,
    pub log_file: Option<String>,
    pub log_stdout: bool,
    pub langfuse: Option<LangfuseConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            fallback_api_key: None,
            upstream_url: DEFAULT_UPSTREAM_URL.to_string(),
            port: DEFAULT_PORT,
            config_path: None,
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
            log_file: None,
            log_stdout: true,
            langfuse: None,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let fallback_api_key = non_empty_env("ANTHROPIC_API_KEY");
        let upstream_url = non_empty_env("ANTHROPIC_API_URL")
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_UPSTREAM_URL.to_string());
        let port = match parse_optional_u64("HOOKRELAY_PORT")? {
            Some(p) => u16::try_from(p).map_err(|_| anyhow!("HOOKRELAY_PORT must be a valid port"))?,
            None => DEFAULT_PORT,
        };
        let max_request_bytes = parse_optional_u64("HOOKRELAY_MAX_REQUEST_BYTES")?
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_MAX_REQUEST_BYTES);
        let log_stdout = parse_bool_env("HOOKRELAY_LOG_STDOUT")?.unwrap_or(true);

        let langfuse = match (
            non_empty_env("LANGFUSE_PUBLIC_KEY"),
            non_empty_env("LANGFUSE_SECRET_KEY"),
        ) {
            (Some(public_key), Some(secret_key)) => Some(LangfuseConfig {
                public_key,
                secret_key,
                base_url: non_empty_env("LANGFUSE_BASE_URL")
                    .or_else(|| non_empty_env("LANGFUSE_HOST"))
                    .unwrap_or_else(|| DEFAULT_LANGFUSE_URL.to_string())
                    .trim_end_matches('/')
                    .to_string(),
            }),
            _ => None,
        };

        Ok(Self {
            fallback_api_key,
            upstream_url,
            port,
            config_path: find_config_path(),
            max_request_bytes,
            log_file: non_empty_env("LOG_FILE"),
            log_stdout,
            langfuse,
        })
    }

    /// Directory extension modules are loaded from: the descriptor's parent,
    /// or the working directory when there is no descriptor.
    pub fn project_root(&self) -> PathBuf {
        self.config_path
            .as_deref()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .or_else(|| env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// The first of [`CONFIG_PATH_VARS`] that names an existing file, else the
/// first known descriptor name present in the working directory.
pub fn find_config_path() -> Option<PathBuf> {
    for var in CONFIG_PATH_VARS {
        let Some(path) = non_empty_env(var) else {
            continue;
        };
        let path = PathBuf::from(path);
        if path.is_file() {
            return path.canonicalize().ok().or(Some(path));
        }
        tracing::warn!(var, path = %path.display(), "configured descriptor path is not a file");
    }
    let cwd = env::current_dir().ok()?;
    CONFIG_FILE_NAMES
        .iter()
        .map(|name| cwd.join(name))
        .find(|p| p.is_file())
}

/// Config descriptor.  Only the callback list is read; every other key is
/// ignored so existing proxy configs can be reused as-is.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigDescriptor {
    #[serde(default, alias = "litellm_settings")]
    pub proxy_settings: Option<ProxySettings>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProxySettings {
    #[serde(default)]
    pub callbacks: Option<Callbacks>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Callbacks {
    One(String),
    Many(Vec<String>),
}

impl ConfigDescriptor {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config descriptor '{}'", path.display()))?;
        // An empty file is a valid, empty descriptor.
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config descriptor '{}'", path.display()))
    }

    pub fn callbacks(&self) -> Vec<String> {
        match self.proxy_settings.as_ref().and_then(|s| s.callbacks.as_ref()) {
            Some(Callbacks::One(spec)) => vec![spec.clone()],
            Some(Callbacks::Many(specs)) => specs.clone(),
            None => Vec::new(),
        }
    }
}

fn non_empty_env(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_optional_u64(var: &str) -> Result<Option<u64>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a positive integer", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool_env(var: &str) -> Result<Option<bool>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value)
            .map(Some)
            .ok_or_else(|| anyhow!("{} must be a boolean (true/false/1/0)", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    static ENV_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    const VARS: [&str; 13] = [
        "ANTHROPIC_API_KEY",
        "ANTHROPIC_API_URL",
        "HOOKRELAY_PORT",
        "HOOKRELAY_CONFIG",
        "LITELLM_CONFIG_PATH",
        "LITELLM_CONFIG",
        "HOOKRELAY_MAX_REQUEST_BYTES",
        "HOOKRELAY_LOG_STDOUT",
        "LOG_FILE",
        "LANGFUSE_PUBLIC_KEY",
        "LANGFUSE_SECRET_KEY",
        "LANGFUSE_BASE_URL",
        "LANGFUSE_HOST",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn parses_environment_defaults() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();

        let cfg = AppConfig::from_env().unwrap();
        assert!(cfg.fallback_api_key.is_none());
        assert_eq!(cfg.upstream_url, DEFAULT_UPSTREAM_URL);
        assert_eq!(cfg.port, 4000);
        assert_eq!(cfg.max_request_bytes, DEFAULT_MAX_REQUEST_BYTES);
        assert!(cfg.log_stdout);
        assert!(cfg.langfuse.is_none());
    }

    #[test]
    fn parses_full_configuration() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();

        let descriptor = NamedTempFile::new().unwrap();
        std::env::set_var("ANTHROPIC_API_KEY", "fk1");
        std::env::set_var("ANTHROPIC_API_URL", "http://upstream.local/");
        std::env::set_var("HOOKRELAY_PORT", "8088");
        std::env::set_var("HOOKRELAY_CONFIG", descriptor.path());
        std::env::set_var("HOOKRELAY_MAX_REQUEST_BYTES", "2048");
        std::env::set_var("HOOKRELAY_LOG_STDOUT", "off");
        std::env::set_var("LOG_FILE", "/tmp/hookrelay.log");
        std::env::set_var("LANGFUSE_PUBLIC_KEY", "pk");
        std::env::set_var("LANGFUSE_SECRET_KEY", "sk");
        std::env::set_var("LANGFUSE_HOST", "http://langfuse.local/");

        let cfg = AppConfig::from_env().unwrap();
        assert_eq!(cfg.fallback_api_key.as_deref(), Some("fk1"));
        assert_eq!(cfg.upstream_url, "http://upstream.local");
        assert_eq!(cfg.port, 8088);
        assert!(cfg.config_path.is_some());
        assert_eq!(
            cfg.project_root(),
            descriptor.path().canonicalize().unwrap().parent().unwrap()
        );
        assert_eq!(cfg.max_request_bytes, 2048);
        assert!(!cfg.log_stdout);
        assert_eq!(cfg.log_file.as_deref(), Some("/tmp/hookrelay.log"));
        let langfuse = cfg.langfuse.unwrap();
        assert_eq!(langfuse.base_url, "http://langfuse.local");

        clear_env();
    }

    #[test]
    fn litellm_path_variables_are_honoured_in_order() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        let legacy = NamedTempFile::new().unwrap();
        let preferred = NamedTempFile::new().unwrap();

        std::env::set_var("LITELLM_CONFIG", legacy.path());
        assert_eq!(
            find_config_path().unwrap(),
            legacy.path().canonicalize().unwrap()
        );

        std::env::set_var("LITELLM_CONFIG_PATH", preferred.path());
        assert_eq!(
            find_config_path().unwrap(),
            preferred.path().canonicalize().unwrap()
        );

        // a dangling path falls through to the next variable
        std::env::set_var("HOOKRELAY_CONFIG", "/nonexistent/hookrelay.yaml");
        assert_eq!(
            find_config_path().unwrap(),
            preferred.path().canonicalize().unwrap()
        );
        clear_env();
    }

    #[test]
    fn langfuse_needs_both_keys() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        std::env::set_var("LANGFUSE_PUBLIC_KEY", "pk");
        let cfg = AppConfig::from_env().unwrap();
        assert!(cfg.langfuse.is_none());
        clear_env();
    }

    #[test]
    fn rejects_invalid_numbers() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        std::env::set_var("HOOKRELAY_PORT", "99999");
        let err = AppConfig::from_env().expect_err("port out of range");
        assert!(err.to_string().contains("HOOKRELAY_PORT"));
        clear_env();
    }

    #[test]
    fn descriptor_accepts_single_or_list_callbacks() {
        let one: ConfigDescriptor =
            serde_yaml::from_str("litellm_settings:\n  callbacks: my_hooks\n").unwrap();
        assert_eq!(one.callbacks(), vec!["my_hooks".to_string()]);

        let many: ConfigDescriptor = serde_yaml::from_str(
            "model_list: []\nproxy_settings:\n  callbacks: [a.b, c]\n",
        )
        .unwrap();
        assert_eq!(many.callbacks(), vec!["a.b".to_string(), "c".to_string()]);
    }

    #[test]
    fn empty_descriptor_file_loads() {
        let file = NamedTempFile::new().unwrap();
        let descriptor = ConfigDescriptor::load(file.path()).unwrap();
        assert!(descriptor.callbacks().is_empty());
    }
}
