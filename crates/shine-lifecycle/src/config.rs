use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use shine_core::PricingRuleTable;

#[derive(Debug, Clone)]
pub struct ShineConfig {
    /// Absent means the in-memory store.
    pub database_url: Option<String>,
    pub documents_dir: PathBuf,
    pub pricing_rules_path: Option<PathBuf>,
    pub contract_prefix: String,
    pub invoice_prefix: String,
    /// Required unless `gateway_sandbox` is set.
    pub gateway_url: Option<String>,
    /// Use the in-process sandbox gateway when no URL is configured.
    pub gateway_sandbox: bool,
    pub gateway_token: String,
    pub gateway_timeout_secs: u64,
    pub payment_redirect_url: Option<String>,
    pub web_port: u16,
}

impl Default for ShineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            documents_dir: PathBuf::from("./documents"),
            pricing_rules_path: None,
            contract_prefix: "CSA".to_string(),
            invoice_prefix: "INV".to_string(),
            gateway_url: None,
            gateway_sandbox: false,
            gateway_token: String::new(),
            gateway_timeout_secs: 10,
            payment_redirect_url: None,
            web_port: 8000,
        }
    }
}

impl ShineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: non_empty_var("DATABASE_URL"),
            documents_dir: std::env::var("SHINE_DOCUMENTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.documents_dir),
            pricing_rules_path: non_empty_var("SHINE_PRICING_RULES").map(PathBuf::from),
            contract_prefix: std::env::var("SHINE_CONTRACT_PREFIX")
                .unwrap_or(defaults.contract_prefix),
            invoice_prefix: std::env::var("SHINE_INVOICE_PREFIX").unwrap_or(defaults.invoice_prefix),
            gateway_url: non_empty_var("SHINE_GATEWAY_URL"),
            gateway_sandbox: non_empty_var("SHINE_GATEWAY_SANDBOX")
                .is_some_and(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes")),
            gateway_token: std::env::var("SHINE_GATEWAY_TOKEN").unwrap_or_default(),
            gateway_timeout_secs: std::env::var("SHINE_GATEWAY_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.gateway_timeout_secs),
            payment_redirect_url: non_empty_var("SHINE_PAYMENT_REDIRECT_URL"),
            web_port: std::env::var("SHINE_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.web_port),
        }
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway_timeout_secs)
    }

    /// The configured rule file, or the table compiled into the binary.
    pub fn load_pricing_rules(&self) -> Result<PricingRuleTable> {
        match &self.pricing_rules_path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                PricingRuleTable::from_yaml_str(&text)
                    .with_context(|| format!("parsing {}", path.display()))
            }
            None => PricingRuleTable::embedded().context("parsing embedded pricing rules"),
        }
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_use_embedded_rules() {
        let config = ShineConfig::default();
        assert_eq!(config.contract_prefix, "CSA");
        assert_eq!(config.gateway_timeout(), Duration::from_secs(10));
        assert!(config.load_pricing_rules().is_ok());
    }

    #[test]
    fn missing_rule_file_names_the_path() {
        let config = ShineConfig {
            pricing_rules_path: Some(PathBuf::from("/nonexistent/pricing.yaml")),
            ..Default::default()
        };
        let err = config.load_pricing_rules().unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/pricing.yaml"));
    }
}
