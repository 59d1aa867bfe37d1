use anyhow::{anyhow, bail, Context, Result};
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Placeholder key shipped in sample configs; treated as "not configured".
pub const PLACEHOLDER_API_KEY: &str = "sk-REPLACE_ME";

/// Which generation backend the daemon talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderKind {
    /// Remote API-key-authenticated text service (OpenAI-style).
    #[serde(rename = "openai", alias = "api_key_service")]
    ApiKeyService,
    /// Locally reachable inference service (Ollama-style).
    #[serde(rename = "ollama", alias = "local_service")]
    LocalService,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::ApiKeyService => "openai",
            ProviderKind::LocalService => "ollama",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" | "api_key_service" => Some(ProviderKind::ApiKeyService),
            "ollama" | "local_service" => Some(ProviderKind::LocalService),
            _ => None,
        }
    }
}

impl Default for ProviderKind {
    fn default() -> Self {
        ProviderKind::ApiKeyService
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiSection {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
}

impl Default for OpenAiSection {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaSection {
    pub host: String,
    pub model: String,
}

impl Default for OllamaSection {
    fn default() -> Self {
        Self {
            host: "http://127.0.0.1:11434".to_string(),
            model: "llama3.1:8b".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSection {
    pub host: String,
    pub port: u16,
    pub request_timeout_secs: u64,
    pub max_concurrent_requests: usize,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8765,
            request_timeout_secs: 45,
            max_concurrent_requests: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSection {
    pub log_path: String,
}

impl Default for AuditSection {
    fn default() -> Self {
        Self {
            log_path: "~/.aishell/audit.jsonl".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsSection {
    pub provider_timeout_secs: u64,
    pub context_timeout_secs: u64,
    pub max_goal_chars: usize,
    pub max_context_entries: usize,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            provider_timeout_secs: 30,
            context_timeout_secs: 3,
            max_goal_chars: 2000,
            max_context_entries: 40,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub provider: ProviderKind,
    pub use_mock: bool,
    pub openai: OpenAiSection,
    pub ollama: OllamaSection,
    pub daemon: DaemonSection,
    pub audit: AuditSection,
    pub limits: LimitsSection,
}

/// The resolved settings for whichever backend is selected.
///
/// Built once at startup and handed to the provider factory; never re-read.
#[derive(Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub endpoint: String,
    pub model_name: String,
    pub credentials: Option<String>,
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("kind", &self.kind)
            .field("endpoint", &self.endpoint)
            .field("model_name", &self.model_name)
            .field("credentials", &self.credentials.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Config {
    /// Load configuration from file, environment variables, or create default
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let path = match config_file {
            Some(path) => path.to_path_buf(),
            None => Self::get_config_path()?,
        };

        let mut config = if path.exists() {
            let config = Self::load_from_file(&path)?;
            info!("Loaded config from: {}", path.display());
            config
        } else {
            info!("No config file found, using defaults");
            Self::default()
        };

        // Environment variables override config file
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Applies environment-style overrides from `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("AI_PROVIDER") {
            self.provider = ProviderKind::parse(&value)
                .ok_or_else(|| {
                    anyhow!("AI_PROVIDER must be 'openai' or 'ollama', got '{}'", value)
                })?;
        }
        if let Some(value) = lookup("OPENAI_API_KEY") {
            self.openai.api_key = Some(value);
        }
        if let Some(value) = lookup("OPENAI_MODEL") {
            self.openai.model = value;
        }
        if let Some(value) = lookup("OPENAI_BASE_URL") {
            self.openai.base_url = value;
        }
        if let Some(value) = lookup("OLLAMA_HOST") {
            self.ollama.host = value;
        }
        if let Some(value) = lookup("OLLAMA_MODEL") {
            self.ollama.model = value;
        }
        if let Some(value) = lookup("AI_HOST") {
            self.daemon.host = value;
        }
        if let Some(value) = lookup("AI_PORT") {
            self.daemon.port = value
                .trim()
                .parse()
                .with_context(|| format!("AI_PORT is not a valid port: '{}'", value))?;
        }
        if let Some(value) = lookup("LOG_PATH") {
            self.audit.log_path = value;
        }
        if lookup("AISHELL_USE_MOCK").is_some() {
            self.use_mock = true;
        }
        Ok(())
    }

    pub fn save(&self, config_file: Option<&Path>) -> Result<()> {
        let config_path = match config_file {
            Some(path) => path.to_path_buf(),
            None => Self::get_config_path()?,
        };

        // Create parent directory if it doesn't exist
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(&config_path, content)?;
        info!("Saved config to: {}", config_path.display());
        Ok(())
    }

    fn get_config_path() -> Result<PathBuf> {
        Ok(Self::get_config_dir()?.join("config.toml"))
    }

    pub fn get_config_dir() -> Result<PathBuf> {
        let home = home_dir().ok_or_else(|| anyhow!("Could not find home directory"))?;
        Ok(home.join(".aishell"))
    }

    /// Set API key and save config
    pub fn set_api_key(&mut self, api_key: String, config_file: Option<&Path>) -> Result<()> {
        self.openai.api_key = Some(api_key);
        self.save(config_file)?;
        info!("API key saved to config file");
        Ok(())
    }

    pub fn provider_config(&self) -> ProviderConfig {
        match self.provider {
            ProviderKind::ApiKeyService => ProviderConfig {
                kind: ProviderKind::ApiKeyService,
                endpoint: self.openai.base_url.trim_end_matches('/').to_string(),
                model_name: self.openai.model.clone(),
                credentials: self
                    .openai
                    .api_key
                    .clone()
                    .filter(|key| !key.trim().is_empty()),
            },
            ProviderKind::LocalService => ProviderConfig {
                kind: ProviderKind::LocalService,
                endpoint: self.ollama.host.trim_end_matches('/').to_string(),
                model_name: self.ollama.model.clone(),
                credentials: None,
            },
        }
    }

    /// Audit log location with `~` expanded.
    pub fn audit_log_path(&self) -> PathBuf {
        expand_tilde(&self.audit.log_path)
    }

    /// Address to bind, refusing anything that is not loopback.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        let host = self.daemon.host.trim();
        let ip: IpAddr = if host.eq_ignore_ascii_case("localhost") {
            IpAddr::from([127, 0, 0, 1])
        } else {
            host.parse()
                .with_context(|| format!("Daemon host '{}' is not an IP address", host))?
        };
        if !ip.is_loopback() {
            bail!("Daemon host must be a loopback address, got {}", ip);
        }
        Ok(SocketAddr::new(ip, self.daemon.port))
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.limits.provider_timeout_secs.max(1))
    }

    pub fn context_timeout(&self) -> Duration {
        Duration::from_secs(self.limits.context_timeout_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.daemon.request_timeout_secs.max(1))
    }

    pub fn show_config_info(&self, config_file: Option<&Path>) -> Result<()> {
        let config_path = match config_file {
            Some(path) => path.to_path_buf(),
            None => Self::get_config_path()?,
        };
        println!("Configuration file: {}", config_path.display());
        println!(
            "Status: {}",
            if config_path.exists() { "Found" } else { "Not found (using defaults)" }
        );

        let provider = self.provider_config();
        println!("Provider: {}", provider.kind.as_str());
        println!("Endpoint: {}", provider.endpoint);
        println!("Model: {}", provider.model_name);
        if provider.kind == ProviderKind::ApiKeyService {
            println!("API Key: {}", if provider.credentials.is_some() { "Set" } else { "Not set" });
        }
        println!("Mock mode: {}", self.use_mock);
        println!("Listen: {}:{}", self.daemon.host, self.daemon.port);
        println!("Audit log: {}", self.audit_log_path().display());

        println!("\nTo set API key:");
        println!("  aishelld --set-api-key <your-key>");
        println!("\nOr set environment variable:");
        println!("  export OPENAI_API_KEY=<your-key>");

        Ok(())
    }
}

/// Expands a leading `~` to the home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = home_dir() {
            return home;
        }
    } else if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.provider, ProviderKind::ApiKeyService);
        assert_eq!(config.daemon.host, "127.0.0.1");
        assert_eq!(config.daemon.port, 8765);
        assert_eq!(config.openai.model, "gpt-4o-mini");
        assert_eq!(config.ollama.model, "llama3.1:8b");
        assert!(!config.use_mock);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
provider = "ollama"

[ollama]
model = "qwen2.5-coder"
"#,
        )
        .unwrap();

        assert_eq!(config.provider, ProviderKind::LocalService);
        assert_eq!(config.ollama.model, "qwen2.5-coder");
        assert_eq!(config.ollama.host, "http://127.0.0.1:11434");
        assert_eq!(config.daemon.port, 8765);
    }

    #[test]
    fn test_spec_style_provider_names_are_accepted() {
        let config = Config::from_toml_str("provider = \"local_service\"").unwrap();
        assert_eq!(config.provider, ProviderKind::LocalService);
    }

    #[test]
    fn test_env_overrides_file_values() {
        let mut config = Config::from_toml_str("[daemon]\nport = 9000").unwrap();
        config
            .apply_overrides(env(&[
                ("AI_PROVIDER", "ollama"),
                ("AI_PORT", "9100"),
                ("OLLAMA_MODEL", "mistral"),
                ("LOG_PATH", "/tmp/audit.jsonl"),
                ("AISHELL_USE_MOCK", "1"),
            ]))
            .unwrap();

        assert_eq!(config.provider, ProviderKind::LocalService);
        assert_eq!(config.daemon.port, 9100);
        assert_eq!(config.ollama.model, "mistral");
        assert_eq!(config.audit_log_path(), PathBuf::from("/tmp/audit.jsonl"));
        assert!(config.use_mock);
    }

    #[test]
    fn test_invalid_provider_override_is_rejected() {
        let mut config = Config::default();
        let err = config.apply_overrides(env(&[("AI_PROVIDER", "bard")])).unwrap_err();
        assert!(err.to_string().contains("AI_PROVIDER"));
    }

    #[test]
    fn test_invalid_port_override_is_rejected() {
        let mut config = Config::default();
        assert!(config.apply_overrides(env(&[("AI_PORT", "eighty")])).is_err());
    }

    #[test]
    fn test_provider_config_for_api_key_service() {
        let mut config = Config::default();
        config.openai.api_key = Some("sk-test".to_string());
        config.openai.base_url = "https://example.test/v1/".to_string();

        let provider = config.provider_config();
        assert_eq!(provider.kind, ProviderKind::ApiKeyService);
        assert_eq!(provider.endpoint, "https://example.test/v1");
        assert_eq!(provider.credentials.as_deref(), Some("sk-test"));
    }

    #[test]
    fn test_provider_config_blank_key_is_none() {
        let mut config = Config::default();
        config.openai.api_key = Some("   ".to_string());
        assert!(config.provider_config().credentials.is_none());
    }

    #[test]
    fn test_provider_config_debug_redacts_credentials() {
        let mut config = Config::default();
        config.openai.api_key = Some("sk-very-secret".to_string());
        let rendered = format!("{:?}", config.provider_config());
        assert!(!rendered.contains("sk-very-secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_bind_addr_accepts_loopback_only() {
        let mut config = Config::default();
        assert_eq!(config.bind_addr().unwrap().to_string(), "127.0.0.1:8765");

        config.daemon.host = "localhost".to_string();
        assert!(config.bind_addr().unwrap().ip().is_loopback());

        config.daemon.host = "::1".to_string();
        assert!(config.bind_addr().is_ok());

        config.daemon.host = "0.0.0.0".to_string();
        assert!(config.bind_addr().is_err());

        config.daemon.host = "192.168.1.10".to_string();
        assert!(config.bind_addr().is_err());
    }

    #[test]
    fn test_save_and_reload_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.set_api_key("sk-saved".to_string(), Some(&path)).unwrap();

        let reloaded = Config::load_from_file(&path).unwrap();
        assert_eq!(reloaded.openai.api_key.as_deref(), Some("sk-saved"));
        assert_eq!(reloaded.daemon.port, 8765);
    }

    #[test]
    fn test_expand_tilde() {
        assert_eq!(expand_tilde("/var/log/a.jsonl"), PathBuf::from("/var/log/a.jsonl"));
        if let Some(home) = home_dir() {
            assert_eq!(expand_tilde("~/x/y"), home.join("x/y"));
        }
    }

    #[test]
    fn test_timeouts_never_zero() {
        let mut config = Config::default();
        config.limits.provider_timeout_secs = 0;
        assert_eq!(config.provider_timeout(), Duration::from_secs(1));
    }
}
