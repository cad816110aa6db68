use crate::error::HubError;
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const BOT_TOKEN_VAR: &str = "TELEGRAM_BOT_TOKEN";
pub const SERVICE_ACCOUNT_VAR: &str = "GOOGLE_SERVICE_ACCOUNT_PATH";
pub const TELEGRAM_API_BASE_VAR: &str = "TELEGRAM_API_BASE";
pub const DEFAULT_TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Configuration for retry logic used around transient network calls
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Minimum delay between retry attempts (in milliseconds)
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,

    /// Maximum delay between retry attempts (in milliseconds)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Maximum number of retries after the first attempt
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Whether to add random jitter to the computed delays
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    /// Create a RetryConfig with no retries (fail fast)
    pub fn no_retry() -> Self {
        Self {
            min_delay_ms: 0,
            max_delay_ms: 0,
            max_attempts: 0,
            jitter: false,
        }
    }

    /// Validate the configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), HubError> {
        if self.min_delay_ms > self.max_delay_ms {
            return Err(HubError::ConfigurationError(
                "minDelayMs cannot be greater than maxDelayMs".to_string(),
            ));
        }

        if self.max_attempts > 10 {
            return Err(HubError::ConfigurationError(
                "maxAttempts should not exceed 10 to avoid excessive retries".to_string(),
            ));
        }

        if self.max_delay_ms > 60_000 {
            return Err(HubError::ConfigurationError(
                "maxDelayMs should not exceed 60 seconds".to_string(),
            ));
        }

        Ok(())
    }

    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn retries_enabled(&self) -> bool {
        self.max_attempts > 0
    }
}

/// Static description of one supervised child process
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
#[builder(setter(into, strip_option))]
#[serde(rename_all = "camelCase")]
pub struct ServiceDescriptor {
    pub name: String,
    #[serde(default)]
    pub command: String,
    #[builder(default)]
    #[builder(setter(custom))]
    #[serde(default)]
    pub args: Vec<String>,
    #[builder(default)]
    #[builder(setter(custom))]
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub port: u16,
    #[builder(default)]
    #[serde(default)]
    pub description: String,
    #[builder(default)]
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
}

impl ServiceDescriptor {
    pub fn builder() -> ServiceDescriptorBuilder {
        ServiceDescriptorBuilder::default()
    }

    /// Arguments passed to the executable; always ends with the assigned port
    pub fn launch_args(&self) -> Vec<String> {
        let mut args = self.args.clone();
        args.push("--port".to_string());
        args.push(self.port.to_string());
        args
    }

    /// Full command line, for logs and status output
    pub fn launch_command(&self) -> String {
        std::iter::once(self.command.clone())
            .chain(self.launch_args())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn health_url(&self) -> String {
        format!("http://127.0.0.1:{}/health", self.port)
    }
}

impl ServiceDescriptorBuilder {
    pub fn args<S: ToString, I: IntoIterator<Item = S>>(&mut self, iter: I) -> &mut Self {
        let args: Vec<String> = iter.into_iter().map(|s| s.to_string()).collect();
        self.args = Some(args);
        self
    }

    pub fn env<T: ToString>(&mut self, key: T, value: T) -> &mut Self {
        let map = self.env.get_or_insert_with(HashMap::new);
        map.insert(key.to_string(), value.to_string());
        self
    }
}

/// Ordered, immutable set of service descriptors known at startup
#[derive(Debug, Clone)]
pub struct ServiceRegistry {
    services: Vec<ServiceDescriptor>,
}

#[derive(Deserialize)]
struct RegistryFile {
    services: Vec<ServiceDescriptor>,
}

impl ServiceRegistry {
    pub fn new(services: Vec<ServiceDescriptor>) -> Result<Self, HubError> {
        let mut names = HashSet::new();
        let mut ports = HashSet::new();
        for service in &services {
            if service.name.is_empty() {
                return Err(HubError::ConfigurationError(
                    "service name cannot be empty".to_string(),
                ));
            }
            if service.command.is_empty() {
                return Err(HubError::ConfigurationError(format!(
                    "service {} has no launch command",
                    service.name
                )));
            }
            if !names.insert(service.name.as_str()) {
                return Err(HubError::ConfigurationError(format!(
                    "duplicate service name: {}",
                    service.name
                )));
            }
            if !ports.insert(service.port) {
                return Err(HubError::ConfigurationError(format!(
                    "duplicate port {} for service {}",
                    service.port, service.name
                )));
            }
        }
        Ok(Self { services })
    }

    /// The mail, spreadsheet and file-storage services, each launched from `service_bin`
    pub fn default_fleet(service_bin: impl AsRef<Path>) -> Result<Self, HubError> {
        let command = service_bin.as_ref().to_string_lossy().to_string();
        let fleet: [(&str, u16, &str); 3] = [
            ("gmail", 8091, "Gmail API server"),
            ("sheets", 8092, "Google Sheets API server"),
            ("gdrive", 8093, "Google Drive API server"),
        ];

        let services = fleet
            .into_iter()
            .map(|(name, port, description)| {
                ServiceDescriptor::builder()
                    .name(name)
                    .command(command.clone())
                    .args(["--service", name])
                    .port(port)
                    .description(description)
                    .build()
                    .map_err(|e| HubError::ConfigurationError(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Self::new(services)
    }

    /// Load descriptors from a JSON file of the form `{"services": [...]}`.
    /// Entries without a command are launched from `service_bin`.
    pub fn from_json_file(
        path: impl AsRef<Path>,
        service_bin: impl AsRef<Path>,
    ) -> Result<Self, HubError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            HubError::ConfigurationError(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&raw, service_bin)
    }

    pub fn from_json_str(raw: &str, service_bin: impl AsRef<Path>) -> Result<Self, HubError> {
        let file: RegistryFile = serde_json::from_str(raw)
            .map_err(|e| HubError::ConfigurationError(format!("invalid registry: {e}")))?;
        let service_bin = service_bin.as_ref().to_string_lossy().to_string();

        let services = file
            .services
            .into_iter()
            .map(|mut service| {
                if service.command.is_empty() {
                    service.command = service_bin.clone();
                    if service.args.is_empty() {
                        service.args = vec!["--service".to_string(), service.name.clone()];
                    }
                }
                service
            })
            .collect();

        Self::new(services)
    }

    pub fn get(&self, name: &str) -> Option<&ServiceDescriptor> {
        self.services.iter().find(|s| s.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServiceDescriptor> {
        self.services.iter()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

/// Timings for the supervisor, crash monitor and health monitor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorConfig {
    /// How long a freshly spawned process must survive to count as started
    #[serde(default = "default_settle_ms")]
    pub settle_interval_ms: u64,

    #[serde(default = "default_monitor_ms")]
    pub monitor_interval_ms: u64,

    #[serde(default = "default_health_interval_ms")]
    pub health_interval_ms: u64,

    #[serde(default = "default_health_timeout_ms")]
    pub health_timeout_ms: u64,

    /// Wait after SIGTERM before escalating to SIGKILL
    #[serde(default = "default_grace_ms")]
    pub grace_period_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            settle_interval_ms: default_settle_ms(),
            monitor_interval_ms: default_monitor_ms(),
            health_interval_ms: default_health_interval_ms(),
            health_timeout_ms: default_health_timeout_ms(),
            grace_period_ms: default_grace_ms(),
        }
    }
}

impl SupervisorConfig {
    pub fn validate(&self) -> Result<(), HubError> {
        if self.monitor_interval_ms == 0 || self.health_interval_ms == 0 {
            return Err(HubError::ConfigurationError(
                "monitor and health intervals must be non-zero".to_string(),
            ));
        }
        if self.health_timeout_ms == 0 {
            return Err(HubError::ConfigurationError(
                "healthTimeoutMs must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn settle_interval(&self) -> Duration {
        Duration::from_millis(self.settle_interval_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

/// Settings for the inbound update consumer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_batch_limit")]
    pub batch_limit: u32,

    /// Long-poll timeout passed to the message source (seconds, 0 = short polling)
    #[serde(default)]
    pub long_poll_timeout_secs: u64,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            batch_limit: default_batch_limit(),
            long_poll_timeout_secs: 0,
            request_timeout_ms: default_request_timeout_ms(),
            retry: RetryConfig::default(),
        }
    }
}

impl ConsumerConfig {
    pub fn validate(&self) -> Result<(), HubError> {
        if self.batch_limit == 0 || self.batch_limit > 100 {
            return Err(HubError::ConfigurationError(
                "batchLimit must be between 1 and 100".to_string(),
            ));
        }
        if self.request_timeout_ms <= self.long_poll_timeout_secs.saturating_mul(1000) {
            return Err(HubError::ConfigurationError(
                "requestTimeoutMs must exceed the long-poll timeout".to_string(),
            ));
        }
        self.retry.validate()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Top-level file configuration for the supervisor binary
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HubConfig {
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
}

impl HubConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, HubError> {
        let config: HubConfig = serde_json::from_str(raw)
            .map_err(|e| HubError::ConfigurationError(format!("invalid config: {e}")))?;
        config.supervisor.validate()?;
        config.consumer.validate()?;
        Ok(config)
    }
}

/// Credentials and endpoints read from the environment
#[derive(Debug, Clone, PartialEq)]
pub struct EnvConfig {
    pub bot_token: String,
    pub service_account_path: Option<PathBuf>,
    pub telegram_api_base: String,
}

impl EnvConfig {
    pub fn from_env() -> Result<Self, HubError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// The bot token is required; the service account is optional and only
    /// degrades the integrations that need it.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, HubError> {
        let bot_token = lookup(BOT_TOKEN_VAR)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| HubError::MissingCredential(BOT_TOKEN_VAR.to_string()))?;

        let service_account_path = lookup(SERVICE_ACCOUNT_VAR)
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        let telegram_api_base = lookup(TELEGRAM_API_BASE_VAR)
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_TELEGRAM_API_BASE.to_string());

        Ok(Self {
            bot_token,
            service_account_path,
            telegram_api_base,
        })
    }
}

// Default value functions for serde
fn default_min_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    5_000
}
fn default_max_attempts() -> u32 {
    3
}
fn default_jitter() -> bool {
    true
}
fn default_settle_ms() -> u64 {
    3_000
}
fn default_monitor_ms() -> u64 {
    30_000
}
fn default_health_interval_ms() -> u64 {
    60_000
}
fn default_health_timeout_ms() -> u64 {
    5_000
}
fn default_grace_ms() -> u64 {
    10_000
}
fn default_poll_interval_ms() -> u64 {
    1_000
}
fn default_batch_limit() -> u32 {
    10
}
fn default_request_timeout_ms() -> u64 {
    5_000
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str, port: u16) -> ServiceDescriptor {
        ServiceDescriptor::builder()
            .name(name)
            .command("/usr/bin/true")
            .port(port)
            .build()
            .expect("Failed to create test descriptor")
    }

    #[test]
    fn test_launch_args_end_with_port() {
        let service = ServiceDescriptor::builder()
            .name("sheets")
            .command("/opt/hubmcp-service")
            .args(["--service", "sheets"])
            .port(8092u16)
            .build()
            .unwrap();

        assert_eq!(
            service.launch_args(),
            vec!["--service", "sheets", "--port", "8092"]
        );
        assert_eq!(
            service.launch_command(),
            "/opt/hubmcp-service --service sheets --port 8092"
        );
        assert_eq!(service.health_url(), "http://127.0.0.1:8092/health");
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let err = ServiceRegistry::new(vec![descriptor("a", 1), descriptor("a", 2)]).unwrap_err();
        assert!(err.to_string().contains("duplicate service name"));

        let err = ServiceRegistry::new(vec![descriptor("a", 1), descriptor("b", 1)]).unwrap_err();
        assert!(err.to_string().contains("duplicate port"));
    }

    #[test]
    fn test_default_fleet() {
        let registry = ServiceRegistry::default_fleet("/opt/hubmcp-service").unwrap();
        let ports: Vec<u16> = registry.iter().map(|s| s.port).collect();
        assert_eq!(ports, vec![8091, 8092, 8093]);
        assert_eq!(registry.get("gdrive").unwrap().args, vec!["--service", "gdrive"]);
    }

    #[test]
    fn test_registry_from_json_fills_command() {
        let raw = r#"{"services": [
            {"name": "gmail", "port": 9001, "description": "mail"},
            {"name": "custom", "command": "/bin/custom", "args": ["-v"], "port": 9002}
        ]}"#;
        let registry = ServiceRegistry::from_json_str(raw, "/opt/svc").unwrap();

        let gmail = registry.get("gmail").unwrap();
        assert_eq!(gmail.command, "/opt/svc");
        assert_eq!(gmail.args, vec!["--service", "gmail"]);

        let custom = registry.get("custom").unwrap();
        assert_eq!(custom.command, "/bin/custom");
        assert_eq!(custom.launch_args(), vec!["-v", "--port", "9002"]);
    }

    #[test]
    fn test_registry_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("services.json");
        std::fs::write(&path, r#"{"services": [{"name": "a", "port": 7001}]}"#).unwrap();

        let registry = ServiceRegistry::from_json_file(&path, "/opt/svc").unwrap();
        assert_eq!(registry.len(), 1);
        assert!(ServiceRegistry::from_json_file(dir.path().join("missing"), "/x").is_err());
    }

    #[test]
    fn test_retry_config() {
        assert!(RetryConfig::default().validate().is_ok());
        assert!(RetryConfig::default().retries_enabled());
        assert!(!RetryConfig::no_retry().retries_enabled());

        let config = RetryConfig {
            min_delay_ms: 1000,
            max_delay_ms: 500,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_hub_config_defaults_and_overrides() {
        let config = HubConfig::from_json_str(r#"{"supervisor": {"gracePeriodMs": 250}}"#).unwrap();
        assert_eq!(config.supervisor.grace_period(), Duration::from_millis(250));
        assert_eq!(config.supervisor.settle_interval_ms, 3_000);
        assert_eq!(config.consumer.batch_limit, 10);

        let err = HubConfig::from_json_str(r#"{"consumer": {"batchLimit": 0}}"#).unwrap_err();
        assert!(err.is_permanent());
    }

    #[test]
    fn test_consumer_timeout_must_cover_long_poll() {
        let config = ConsumerConfig {
            long_poll_timeout_secs: 30,
            request_timeout_ms: 5_000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_huge_long_poll_timeout_is_rejected() {
        let config = ConsumerConfig {
            long_poll_timeout_secs: u64::MAX,
            request_timeout_ms: u64::MAX - 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_config() {
        let env: HashMap<&str, &str> = [
            (BOT_TOKEN_VAR, "123:abc"),
            (SERVICE_ACCOUNT_VAR, "/secrets/sa.json"),
        ]
        .into_iter()
        .collect();
        let config = EnvConfig::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.bot_token, "123:abc");
        assert_eq!(
            config.service_account_path,
            Some(PathBuf::from("/secrets/sa.json"))
        );
        assert_eq!(config.telegram_api_base, DEFAULT_TELEGRAM_API_BASE);
    }

    #[test]
    fn test_env_config_requires_bot_token() {
        let err = EnvConfig::from_lookup(|_| None).unwrap_err();
        assert!(matches!(err, HubError::MissingCredential(ref v) if v == BOT_TOKEN_VAR));

        let err = EnvConfig::from_lookup(|k| (k == BOT_TOKEN_VAR).then(|| "  ".to_string()));
        assert!(err.is_err());
    }
}
