//! CLI configuration.
//!
//! Loaded from an optional TOML file and then `TERN__`-prefixed environment
//! variables, e.g. `TERN__TRANSPORT__BACKEND_URL` or
//! `TERN__FEES__BASE_FEE`. List values (`transport.public_key_pins`) are
//! comma separated in the environment.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tern_core::address::Network;
use tern_transport::{BackendClient, SecureTransport, TransportConfig};
use tern_wallet::FeePolicy;

const ENV_PREFIX: &str = "TERN";
const ENV_SEPARATOR: &str = "__";

/// Everything the CLI reads from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TernConfig {
    /// Network for newly created wallets.
    pub network: Network,
    pub transport: TransportConfig,
    pub fees: FeePolicy,
}

impl TernConfig {
    /// Load from `path` (required if given), else from the default
    /// location if that file exists, then apply the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (file, required) = match path {
            Some(p) => (Some(p.to_path_buf()), true),
            None => (default_config_path().ok(), false),
        };
        Self::load_with(file.as_deref(), required, environment())
    }

    fn load_with(file: Option<&Path>, required: bool, env: config::Environment) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(file) = file {
            builder = builder.add_source(
                config::File::from(file)
                    .format(config::FileFormat::Toml)
                    .required(required),
            );
        }
        builder
            .add_source(env)
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// Pinned backend client. Nothing is contacted until the first request.
    pub fn backend(&self) -> Result<Arc<BackendClient>> {
        let transport = SecureTransport::new(&self.transport)
            .context("Backend transport is not configured (see transport.* settings)")?;
        Ok(Arc::new(BackendClient::new(transport)))
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .separator(ENV_SEPARATOR)
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("transport.public_key_pins")
}

/// `~/.tern`
pub fn data_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".tern"))
}

fn default_config_path() -> Result<PathBuf> {
    Ok(data_dir()?.join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> config::Environment {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        environment().source(Some(map))
    }

    #[test]
    fn defaults_without_sources() {
        let cfg = TernConfig::load_with(None, false, env(&[])).unwrap();
        assert_eq!(cfg, TernConfig::default());
        assert_eq!(cfg.network, Network::Mainnet);
    }

    #[test]
    fn reads_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
network = "testnet"

[transport]
backend_url = "https://backend.example:8443"
public_key_pins = ["aa"]
certificate_pin = "bb"
request_timeout_secs = 5

[fees]
base_fee = 100
"#,
        )
        .unwrap();

        let cfg = TernConfig::load_with(Some(&path), true, env(&[])).unwrap();
        assert_eq!(cfg.network, Network::Testnet);
        assert_eq!(cfg.transport.backend_url, "https://backend.example:8443");
        assert_eq!(cfg.transport.public_key_pins, vec!["aa".to_string()]);
        assert_eq!(cfg.transport.request_timeout_secs, 5);
        assert_eq!(cfg.transport.connect_timeout_secs, TransportConfig::default().connect_timeout_secs);
        assert_eq!(cfg.fees.base_fee, 100);
        assert_eq!(cfg.fees.per_byte_milli, FeePolicy::default().per_byte_milli);
    }

    #[test]
    fn environment_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[fees]\nbase_fee = 100\n").unwrap();

        let cfg = TernConfig::load_with(
            Some(&path),
            true,
            env(&[
                ("TERN__FEES__BASE_FEE", "7"),
                ("TERN__TRANSPORT__PUBLIC_KEY_PINS", "aa,bb"),
            ]),
        )
        .unwrap();
        assert_eq!(cfg.fees.base_fee, 7);
        assert_eq!(cfg.transport.public_key_pins, vec!["aa".to_string(), "bb".to_string()]);
    }

    #[test]
    fn missing_required_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(TernConfig::load_with(Some(&path), true, env(&[])).is_err());
        assert!(TernConfig::load_with(Some(&path), false, env(&[])).is_ok());
    }

    #[test]
    fn backend_requires_pins() {
        let cfg = TernConfig::default();
        assert!(cfg.backend().is_err());
    }
}
