pub mod env;
pub mod types;

use std::path::Path;

use anyhow::{Context, Result};

pub use types::{Config, DnsConfig, HijackMode, ProxyConfig, ProxyMode, TunnelConfig, UdpConfig};

pub fn load_config(path: &str) -> Result<Config> {
    let content = load_config_content(path)?;
    parse_config(&content).with_context(|| format!("invalid config {}", path))
}

/// Read the file and expand environment references.
pub fn load_config_content(path: &str) -> Result<String> {
    let raw = std::fs::read_to_string(Path::new(path)).with_context(|| format!("failed to read {}", path))?;
    Ok(env::expand_env_vars(&raw))
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = serde_yml::from_str(content)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_config_expands_env_and_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::env::set_var("TUNRELAY_TEST_PROXY", "10.1.1.1:1080");
        std::fs::write(
            &path,
            "proxy:\n  mode: socks5\n  server: $TUNRELAY_TEST_PROXY\nudp:\n  queue_capacity: ${TUNRELAY_TEST_QUEUE:-4}\n",
        )
        .unwrap();

        let config = load_config(path.to_str().unwrap()).unwrap();
        assert_eq!(config.proxy.mode, ProxyMode::Socks5);
        assert_eq!(config.proxy.server.unwrap().to_string(), "10.1.1.1:1080");
        assert_eq!(config.udp.queue_capacity, 4);
        std::env::remove_var("TUNRELAY_TEST_PROXY");
    }

    #[test]
    fn missing_file_names_path() {
        let err = load_config("/nonexistent/tunrelay.yaml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/tunrelay.yaml"));
    }

    #[test]
    fn validation_failure_is_reported() {
        let err = parse_config("proxy:\n  mode: http\n").unwrap_err();
        assert!(err.to_string().contains("proxy.server"));
    }
}
