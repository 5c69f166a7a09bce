//! gatekeep configuration loader.
//!
//! TOML file first, then `.env`/process environment overrides, then validation.

use anyhow::Result;
use gate_core::{
    AdmissionConfig, BlockExpiry, DEFAULT_INVITE_EXPIRY, DuplicatePolicy, PoolConfig,
    RateLimitPolicy, Space,
};
use gate_platform::{SpaceId, UserId};
use serde::Deserialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const MAX_SPACES: usize = 2;

#[derive(Debug, Clone, Deserialize)]
pub struct GatekeepConfig {
    #[serde(default)]
    pub bot: BotConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub vault: VaultConfig,
    #[serde(default)]
    pub spaces: Vec<SpaceConfig>,
    #[serde(default)]
    pub pool: PoolSection,
    #[serde(default)]
    pub rate_limit: RateLimitSection,
    #[serde(default)]
    pub admission: AdmissionSection,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BotConfig {
    #[serde(default)]
    pub token: String,
    /// Telegram user ids allowed to run operator commands and receive review prompts.
    #[serde(default)]
    pub operator_ids: Vec<i64>,
    #[serde(default)]
    pub api_base: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            auth_token: None,
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}

fn default_call_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VaultConfig {
    #[serde(default)]
    pub encryption_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpaceConfig {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolSection {
    #[serde(default)]
    pub rotate_after_admissions: Option<u32>,
    #[serde(default = "default_max_admissions_per_day")]
    pub max_admissions_per_day: u32,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            rotate_after_admissions: None,
            max_admissions_per_day: default_max_admissions_per_day(),
        }
    }
}

fn default_max_admissions_per_day() -> u32 {
    gate_core::DEFAULT_MAX_ADMISSIONS_PER_DAY
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSection {
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Unset means blocks stay until an operator lifts them.
    #[serde(default)]
    pub auto_expire_after_secs: Option<u64>,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_secs: default_window_secs(),
            auto_expire_after_secs: None,
        }
    }
}

fn default_max_requests() -> u32 {
    gate_core::DEFAULT_MAX_REQUESTS
}

fn default_window_secs() -> u64 {
    gate_core::DEFAULT_WINDOW.as_secs()
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdmissionSection {
    #[serde(default)]
    pub duplicate_policy: DuplicatePolicy,
    #[serde(default = "default_invite_expiry_secs")]
    pub invite_expiry_secs: u64,
    /// Initial value of the `auto_admit` setting; the stored setting wins once written.
    #[serde(default = "default_auto_admit")]
    pub auto_admit: bool,
}

impl Default for AdmissionSection {
    fn default() -> Self {
        Self {
            duplicate_policy: DuplicatePolicy::default(),
            invite_expiry_secs: default_invite_expiry_secs(),
            auto_admit: default_auto_admit(),
        }
    }
}

fn default_invite_expiry_secs() -> u64 {
    DEFAULT_INVITE_EXPIRY.as_secs()
}

fn default_auto_admit() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default)]
    pub control_api_key: Option<String>,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_http_max_in_flight")]
    pub http_max_in_flight: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            bind_addr: default_bind_addr(),
            control_api_key: None,
            http_timeout_seconds: default_http_timeout_seconds(),
            http_max_in_flight: default_http_max_in_flight(),
        }
    }
}

fn default_data_dir() -> String {
    "~/.gatekeep/data".to_string()
}

fn default_bind_addr() -> String {
    "127.0.0.1:8088".to_string()
}

fn default_http_timeout_seconds() -> u64 {
    30
}

fn default_http_max_in_flight() -> usize {
    64
}

impl GatekeepConfig {
    pub async fn load(path: Option<PathBuf>) -> Result<Self> {
        Ok(Self::load_with_path(path).await?.0)
    }

    pub async fn load_with_path(path: Option<PathBuf>) -> Result<(Self, PathBuf)> {
        load_dotenv()?;
        let path = match path {
            Some(path) => path,
            None => default_config_path()?,
        };
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;

        let mut cfg = Self::parse(&contents)
            .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?;
        cfg.apply_overrides(|key| std::env::var(key).ok());
        cfg.validate()?;
        Ok((cfg, path))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let value = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(v) = value("GATEKEEP_BOT_TOKEN") {
            self.bot.token = v;
        }
        if let Some(v) = value("GATEKEEP_ENCRYPTION_KEY") {
            self.vault.encryption_key = v;
        }
        if let Some(v) = value("GATEKEEP_BRIDGE_URL") {
            self.bridge.base_url = v;
        }
        if let Some(v) = value("GATEKEEP_BRIDGE_TOKEN") {
            self.bridge.auth_token = Some(v);
        }
        if let Some(v) = value("GATEKEEP_DATA_DIR") {
            self.runtime.data_dir = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.bot.token.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "bot.token is required (or set GATEKEEP_BOT_TOKEN)"
            ));
        }
        if self.bot.operator_ids.is_empty() {
            return Err(anyhow::anyhow!("bot.operator_ids must list at least one operator"));
        }
        if self.vault.encryption_key.len() < gate_vault::MIN_SECRET_LEN {
            return Err(anyhow::anyhow!(
                "vault.encryption_key must be at least {} characters (or set GATEKEEP_ENCRYPTION_KEY)",
                gate_vault::MIN_SECRET_LEN
            ));
        }
        if self.bridge.base_url.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "bridge.base_url is required (or set GATEKEEP_BRIDGE_URL)"
            ));
        }
        if self.bridge.call_timeout_secs == 0 {
            return Err(anyhow::anyhow!("bridge.call_timeout_secs must be > 0"));
        }
        if self.spaces.is_empty() || self.spaces.len() > MAX_SPACES {
            return Err(anyhow::anyhow!(
                "between 1 and {MAX_SPACES} [[spaces]] entries are required, found {}",
                self.spaces.len()
            ));
        }
        let mut seen = HashSet::new();
        for space in &self.spaces {
            if space.name.trim().is_empty() {
                return Err(anyhow::anyhow!("spaces.name is required (space {})", space.id));
            }
            if !seen.insert(space.id) {
                return Err(anyhow::anyhow!("duplicate space id {}", space.id));
            }
        }
        if self.pool.max_admissions_per_day == 0 {
            return Err(anyhow::anyhow!("pool.max_admissions_per_day must be > 0"));
        }
        if self.pool.rotate_after_admissions == Some(0) {
            return Err(anyhow::anyhow!("pool.rotate_after_admissions must be > 0 when set"));
        }
        if self.rate_limit.max_requests == 0 || self.rate_limit.window_secs == 0 {
            return Err(anyhow::anyhow!(
                "rate_limit.max_requests and rate_limit.window_secs must be > 0"
            ));
        }
        if self.rate_limit.auto_expire_after_secs == Some(0) {
            return Err(anyhow::anyhow!("rate_limit.auto_expire_after_secs must be > 0 when set"));
        }
        if self.admission.invite_expiry_secs == 0 {
            return Err(anyhow::anyhow!("admission.invite_expiry_secs must be > 0"));
        }
        if self.runtime.http_timeout_seconds == 0 || self.runtime.http_max_in_flight == 0 {
            return Err(anyhow::anyhow!(
                "runtime.http_timeout_seconds and runtime.http_max_in_flight must be > 0"
            ));
        }
        self.bind_addr()?;
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.runtime
            .bind_addr
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("runtime.bind_addr {:?}: {e}", self.runtime.bind_addr))
    }

    pub fn data_dir_path(&self) -> Result<PathBuf> {
        expand_home(&self.runtime.data_dir)
    }

    pub fn database_path(&self) -> Result<PathBuf> {
        Ok(self.data_dir_path()?.join("gatekeep.db"))
    }

    pub fn control_api_key(&self) -> Option<&str> {
        self.runtime
            .control_api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
    }

    pub fn operator_ids(&self) -> Vec<UserId> {
        self.bot.operator_ids.iter().copied().map(UserId::new).collect()
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            rotate_after_admissions: self.pool.rotate_after_admissions,
            max_admissions_per_day: self.pool.max_admissions_per_day,
            call_timeout: Duration::from_secs(self.bridge.call_timeout_secs),
        }
    }

    pub fn rate_limit_policy(&self) -> RateLimitPolicy {
        RateLimitPolicy {
            max_requests: self.rate_limit.max_requests,
            window: Duration::from_secs(self.rate_limit.window_secs),
            expiry: match self.rate_limit.auto_expire_after_secs {
                Some(secs) => BlockExpiry::AutoExpireAfter(Duration::from_secs(secs)),
                None => BlockExpiry::Manual,
            },
            duplicates: self.admission.duplicate_policy,
        }
    }

    pub fn admission_config(&self) -> AdmissionConfig {
        AdmissionConfig {
            spaces: self
                .spaces
                .iter()
                .map(|space| Space {
                    id: SpaceId::new(space.id),
                    name: space.name.trim().to_string(),
                    description: space.description.trim().to_string(),
                })
                .collect(),
            invite_expiry: Duration::from_secs(self.admission.invite_expiry_secs),
            default_auto_admit: self.admission.auto_admit,
        }
    }
}

fn load_dotenv() -> Result<()> {
    match dotenvy::dotenv() {
        Ok(path) => {
            tracing::debug!(path = %path.display(), "loaded .env");
            Ok(())
        }
        Err(e) if e.not_found() => Ok(()),
        Err(e) => Err(anyhow::anyhow!("load .env: {e}")),
    }
}

pub fn default_config_path() -> Result<PathBuf> {
    let home = std::env::var("HOME").map_err(|_| anyhow::anyhow!("HOME is not set"))?;
    Ok(Path::new(&home).join(".gatekeep").join("config.toml"))
}

pub fn expand_home(path: &str) -> Result<PathBuf> {
    let trimmed = path.trim();
    if !trimmed.starts_with("~/") {
        return Ok(PathBuf::from(trimmed));
    }
    let home = std::env::var("HOME").map_err(|_| anyhow::anyhow!("HOME is not set"))?;
    Ok(PathBuf::from(trimmed.replacen('~', &home, 1)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const MINIMAL: &str = r#"
[bot]
token = "123:abc"
operator_ids = [42]

[bridge]
base_url = "http://127.0.0.1:9100"

[vault]
encryption_key = "0123456789abcdef0123"

[[spaces]]
id = -1001
name = "Rust Club"
"#;

    #[test]
    fn minimal_config_gets_documented_defaults() {
        let cfg = GatekeepConfig::parse(MINIMAL).expect("parse");
        cfg.validate().expect("valid");

        let policy = cfg.rate_limit_policy();
        assert_eq!(policy.max_requests, 5);
        assert_eq!(policy.window, Duration::from_secs(60));
        assert_eq!(policy.expiry, BlockExpiry::Manual);
        assert_eq!(policy.duplicates, DuplicatePolicy::Reject);
        assert_eq!(cfg.pool_config().max_admissions_per_day, 40);
        assert!(cfg.admission_config().default_auto_admit);
        assert_eq!(cfg.operator_ids(), vec![UserId::new(42)]);
        assert_eq!(cfg.control_api_key(), None);
    }

    #[test]
    fn environment_overrides_file_values() {
        let mut cfg = GatekeepConfig::parse(MINIMAL).expect("parse");
        let env: HashMap<&str, &str> = HashMap::from([
            ("GATEKEEP_BOT_TOKEN", "999:env"),
            ("GATEKEEP_BRIDGE_TOKEN", "bridge-secret"),
            ("GATEKEEP_DATA_DIR", "/var/lib/gatekeep"),
            ("GATEKEEP_BRIDGE_URL", "  "),
        ]);
        cfg.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(cfg.bot.token, "999:env");
        assert_eq!(cfg.bridge.auth_token.as_deref(), Some("bridge-secret"));
        assert_eq!(cfg.bridge.base_url, "http://127.0.0.1:9100");
        assert_eq!(
            cfg.database_path().expect("db path"),
            PathBuf::from("/var/lib/gatekeep/gatekeep.db")
        );
    }

    #[test]
    fn rejects_more_than_two_spaces() {
        let contents = format!(
            "{MINIMAL}\n[[spaces]]\nid = -1002\nname = \"Two\"\n\n[[spaces]]\nid = -1003\nname = \"Three\"\n"
        );
        let cfg = GatekeepConfig::parse(&contents).expect("parse");
        let err = cfg.validate().expect_err("three spaces");
        assert!(err.to_string().contains("[[spaces]]"));
    }

    #[test]
    fn rejects_short_encryption_key_and_duplicate_spaces() {
        let mut cfg = GatekeepConfig::parse(MINIMAL).expect("parse");
        cfg.vault.encryption_key = "short".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = GatekeepConfig::parse(MINIMAL).expect("parse");
        cfg.spaces.push(cfg.spaces[0].clone());
        assert!(cfg.validate().expect_err("dup").to_string().contains("duplicate"));
    }

    #[test]
    fn block_expiry_and_duplicate_policy_are_configurable() {
        let contents = format!(
            "{MINIMAL}\n[rate_limit]\nauto_expire_after_secs = 3600\n\n[admission]\nduplicate_policy = \"reuse_existing\"\nauto_admit = false\n"
        );
        let cfg = GatekeepConfig::parse(&contents).expect("parse");
        cfg.validate().expect("valid");
        let policy = cfg.rate_limit_policy();
        assert_eq!(
            policy.expiry,
            BlockExpiry::AutoExpireAfter(Duration::from_secs(3600))
        );
        assert_eq!(policy.duplicates, DuplicatePolicy::ReuseExisting);
        assert!(!cfg.admission_config().default_auto_admit);
    }
}
