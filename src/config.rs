use crate::encoding::{FieldOrder, FieldOrderSpec};
use crate::error::{NegotiationError, Result};
use crate::offer::DEFAULT_DEADLINE_HORIZON;
use alloy_primitives::Address;
use serde::Deserialize;
use std::fmt;
use std::path::Path;

/// Private key material. Never printed, never serialized back out.
#[derive(Clone, Deserialize)]
#[serde(transparent)]
pub struct SecretKey(String);

impl SecretKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(<redacted>)")
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    pub http_node_provider: String,
    pub provider_ipfs_topic: String,
    pub spot_ipfs_topic: String,
    pub ipfs_id_dapp: String,
    pub ipfs_id_spot: String,
    pub spot_address: String,
    pub spot_pk: SecretKey,

    #[serde(default = "default_ipfs_api_url")]
    pub ipfs_api_url: String,
    #[serde(default = "default_deadline_horizon")]
    pub deadline_horizon: u64,
    #[serde(default)]
    pub signed_fields: FieldOrderSpec,
    #[serde(default = "default_expiry_check_interval")]
    pub expiry_check_interval_secs: u64,
    #[serde(default = "default_retention_blocks")]
    pub retention_blocks: u64,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: Some("pretty".to_string()),
        }
    }
}

fn default_ipfs_api_url() -> String {
    "http://127.0.0.1:5001".to_string()
}

fn default_deadline_horizon() -> u64 {
    DEFAULT_DEADLINE_HORIZON
}

fn default_expiry_check_interval() -> u64 {
    15
}

fn default_retention_blocks() -> u64 {
    10_000
}

impl AgentConfig {
    /// Loads TOML, or JSON when the file has a `.json` extension.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config_str = std::fs::read_to_string(path)
            .map_err(|e| NegotiationError::Config(format!("Failed to read config file: {}", e)))?;

        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        // Parser messages quote the offending source, which may hold spot_pk;
        // only the position is reported.
        let config: AgentConfig = if is_json {
            serde_json::from_str(&config_str).map_err(|e| {
                NegotiationError::Config(format!(
                    "Failed to parse config file at line {}, column {}",
                    e.line(),
                    e.column()
                ))
            })?
        } else {
            toml::from_str(&config_str).map_err(|e| {
                let (line, column) = e
                    .span()
                    .map(|span| line_column(&config_str, span.start))
                    .unwrap_or((0, 0));
                NegotiationError::Config(format!(
                    "Failed to parse config file at line {}, column {}",
                    line, column
                ))
            })?
        };

        Ok(config)
    }

    pub fn load_with_env_overrides<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;

        // Override with environment variables
        if let Ok(pk) = std::env::var("SPOT_PK") {
            config.spot_pk = SecretKey::new(pk);
        }

        if let Ok(node) = std::env::var("HTTP_NODE_PROVIDER") {
            config.http_node_provider = node;
        }

        if let Ok(api) = std::env::var("IPFS_API_URL") {
            config.ipfs_api_url = api;
        }

        if let Ok(log_level) = std::env::var("RUST_LOG") {
            config.logging.level = log_level;
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let required = [
            ("http_node_provider", &self.http_node_provider),
            ("provider_ipfs_topic", &self.provider_ipfs_topic),
            ("spot_ipfs_topic", &self.spot_ipfs_topic),
            ("ipfs_id_dapp", &self.ipfs_id_dapp),
            ("ipfs_id_spot", &self.ipfs_id_spot),
            ("spot_address", &self.spot_address),
        ];

        for (key, value) in required {
            if value.trim().is_empty() {
                return Err(NegotiationError::Config(format!("{} cannot be empty", key)));
            }
        }

        if self.spot_pk.is_empty() {
            return Err(NegotiationError::Config("spot_pk cannot be empty".to_string()));
        }

        self.agent_address()?;

        if self.deadline_horizon == 0 {
            return Err(NegotiationError::Config("deadline_horizon cannot be 0".to_string()));
        }

        if self.expiry_check_interval_secs == 0 {
            return Err(NegotiationError::Config(
                "expiry_check_interval_secs cannot be 0".to_string(),
            ));
        }

        self.field_order()?;

        Ok(())
    }

    pub fn agent_address(&self) -> Result<Address> {
        self.spot_address
            .parse::<Address>()
            .map_err(|e| NegotiationError::Config(format!("spot_address is invalid: {}", e)))
    }

    pub fn field_order(&self) -> Result<FieldOrder> {
        self.signed_fields.resolve()
    }
}

/// One-based line and column of a byte offset.
fn line_column(source: &str, offset: usize) -> (usize, usize) {
    let prefix = source.get(..offset).unwrap_or(source);
    let line = prefix.matches('\n').count() + 1;
    let column = prefix.rfind('\n').map_or(prefix.len(), |i| prefix.len() - i - 1) + 1;
    (line, column)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::OfferField;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const TOML_CONFIG: &str = r#"
http_node_provider = "http://127.0.0.1:8545"
provider_ipfs_topic = "provider"
spot_ipfs_topic = "spot"
ipfs_id_dapp = "12D3KooWDapp"
ipfs_id_spot = "12D3KooWSpot"
spot_address = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266"
spot_pk = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80"
"#;

    fn write_config(suffix: &str, contents: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_toml_config_with_defaults() {
        let file = write_config(".toml", TOML_CONFIG);
        let config = AgentConfig::load(file.path()).unwrap();

        assert!(config.validate().is_ok());
        assert_eq!(config.deadline_horizon, 1000);
        assert_eq!(config.ipfs_api_url, "http://127.0.0.1:5001");
        assert_eq!(config.field_order().unwrap(), FieldOrder::v3());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_error_hides_key() {
        let key = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
        let toml = TOML_CONFIG.replace(&format!("\"0x{}\"", key), key);
        let file = write_config(".toml", &toml);

        let err = AgentConfig::load(file.path()).unwrap_err().to_string();
        assert!(!err.contains(key), "{}", err);
        assert!(err.contains("line 8"), "{}", err);

        let json = format!(r#"{{"spot_pk": 0x{}}}"#, key);
        let file = write_config(".json", &json);
        let err = AgentConfig::load(file.path()).unwrap_err().to_string();
        assert!(!err.contains(key), "{}", err);
    }

    #[test]
    fn test_line_column() {
        assert_eq!(line_column("a = 1\nb = x", 10), (2, 5));
        assert_eq!(line_column("abc", 0), (1, 1));
    }

    #[test]
    fn test_json_config() {
        let file = write_config(
            ".json",
            r#"{
                "http_node_provider": "http://127.0.0.1:8545",
                "provider_ipfs_topic": "provider",
                "spot_ipfs_topic": "spot",
                "ipfs_id_dapp": "dapp",
                "ipfs_id_spot": "spot",
                "spot_address": "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266",
                "spot_pk": "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80",
                "deadline_horizon": 100000,
                "signed_fields": "v1"
            }"#,
        );
        let config = AgentConfig::load(file.path()).unwrap();

        assert!(config.validate().is_ok());
        assert_eq!(config.deadline_horizon, 100_000);
        assert_eq!(config.field_order().unwrap(), FieldOrder::v1());
    }

    #[test]
    fn test_custom_field_list() {
        let contents = format!(
            "{}signed_fields = [\"model\", \"cost\", \"deadline\", \"nonce\", \"sender\"]\n",
            TOML_CONFIG
        );
        let file = write_config(".toml", &contents);
        let config = AgentConfig::load(file.path()).unwrap();

        assert_eq!(
            config.field_order().unwrap().fields(),
            &[
                OfferField::Model,
                OfferField::Cost,
                OfferField::Deadline,
                OfferField::Nonce,
                OfferField::Sender
            ]
        );
    }

    #[test]
    fn test_missing_required_key() {
        let contents = TOML_CONFIG.replace("ipfs_id_spot = \"12D3KooWSpot\"\n", "");
        let file = write_config(".toml", &contents);
        assert!(matches!(
            AgentConfig::load(file.path()),
            Err(NegotiationError::Config(_))
        ));
    }

    #[test]
    fn test_config_validation() {
        let file = write_config(".toml", TOML_CONFIG);
        let mut config = AgentConfig::load(file.path()).unwrap();
        assert!(config.validate().is_ok());

        config.deadline_horizon = 0;
        assert!(config.validate().is_err());
        config.deadline_horizon = 1000;

        config.spot_address = "0x1234".to_string();
        assert!(config.validate().is_err());
        config.spot_address = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266".to_string();

        config.signed_fields = FieldOrderSpec::Preset("v7".to_string());
        assert!(config.validate().is_err());
        config.signed_fields = FieldOrderSpec::default();

        config.ipfs_id_dapp = " ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_secret_key_not_in_debug() {
        let file = write_config(".toml", TOML_CONFIG);
        let config = AgentConfig::load(file.path()).unwrap();
        let debug = format!("{:?}", config);
        assert!(!debug.contains("ac0974bec39a17e3"));
        assert!(debug.contains("<redacted>"));
    }
}
