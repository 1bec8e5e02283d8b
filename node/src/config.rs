use anyhow::{Context, Result};
use config::{Config, Environment, File as ConfigFile};
use forgeshare_treasury::PlanBook;
use forgeshare_types::{EngineSettings, NetworkParams, PlanDecl};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "config/forgeshare.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct NodeSection {
    data_dir: String,
    log_level: String,
    log_format: String,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct RawConfig {
    node: NodeSection,
    network: NetworkParams,
    engine: EngineSettings,
    plans: Vec<PlanDecl>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub config_path: Option<PathBuf>,
    pub data_dir: String,
    pub log_level: String,
    pub log_format: String,
    pub network: NetworkParams,
    pub engine: EngineSettings,
    pub plans: Vec<PlanDecl>,
}

impl AppConfig {
    /// Load from `path` (or the default location when it exists), then
    /// apply `FORGESHARE_*` environment overrides such as
    /// `FORGESHARE_ENGINE__DELEGATE`.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let resolved = match path {
            Some(path) => {
                let path = PathBuf::from(path);
                if !path.exists() {
                    anyhow::bail!(
                        "Configuration file {} not found (specified via --config)",
                        path.display()
                    );
                }
                Some(path)
            }
            None => Some(PathBuf::from(DEFAULT_CONFIG_PATH)).filter(|p| p.exists()),
        };

        let mut builder = Config::builder();
        if let Some(path) = &resolved {
            builder = builder.add_source(ConfigFile::from(path.as_path()));
        }
        builder = builder.add_source(
            Environment::with_prefix("FORGESHARE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let raw: RawConfig = builder
            .build()?
            .try_deserialize()
            .context("Invalid configuration")?;

        Ok(Self {
            config_path: resolved,
            data_dir: raw.node.data_dir,
            log_level: raw.node.log_level,
            log_format: raw.node.log_format,
            network: raw.network,
            engine: raw.engine,
            plans: raw.plans,
        })
    }

    pub fn ledger_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join("ledger")
    }

    /// Normalised plan book. Fails on malformed plans.
    pub fn plan_book(&self) -> Result<PlanBook> {
        Ok(PlanBook::new(self.plans.clone(), self.network)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.delegate.trim().is_empty() {
            anyhow::bail!("engine.delegate must name the monitored delegate");
        }
        if self.network.round_size == 0 {
            anyhow::bail!("network.round_size must be greater than zero");
        }
        if self.engine.sync_page_size == 0 {
            anyhow::bail!("engine.sync_page_size must be greater than zero");
        }
        if !matches!(self.log_format.as_str(), "pretty" | "json") {
            anyhow::bail!(
                "Invalid log_format '{}'; expected 'pretty' or 'json'",
                self.log_format
            );
        }
        self.plan_book()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
[node]
data_dir = "/var/lib/forgeshare"
log_format = "json"

[network]
round_size = 53

[engine]
delegate = "bp"
share_earned_fees = true
whitelist = ["cold-wallet"]

[[plans]]
share = 50.0
reserves = [{ address = "reserve", share = 50.0 }]
mincap = 100

[[plans]]
height = 1000
timestamp = "2024-01-01T00:00:00Z"
share = 60.0
payperiod = 5
"#;

    fn write_config(body: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_sections_and_plans() {
        let file = write_config(SAMPLE);
        let config = AppConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.data_dir, "/var/lib/forgeshare");
        assert_eq!(config.log_format, "json");
        assert_eq!(config.log_level, "info");
        assert_eq!(config.engine.delegate, "bp");
        assert!(config.engine.share_earned_fees);
        assert!(config.engine.antibot);
        assert_eq!(config.engine.whitelist, vec!["cold-wallet".to_string()]);
        assert_eq!(config.plans.len(), 2);
        config.validate().unwrap();

        let book = config.plan_book().unwrap();
        let later = book.resolve(2000, u64::MAX / 4);
        assert_eq!(later.share, 60.0);
        assert_eq!(later.payperiod, 24);
        assert_eq!(later.mincap.atomic(), 100);
    }

    #[test]
    fn missing_delegate_is_rejected() {
        let file = write_config(&SAMPLE.replace("delegate = \"bp\"", ""));
        let config = AppConfig::load(file.path().to_str()).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("delegate"), "unexpected error: {err}");
    }

    #[test]
    fn base_plan_without_reserve_is_rejected() {
        let body = SAMPLE.replace(
            "reserves = [{ address = \"reserve\", share = 50.0 }]\n",
            "",
        );
        let file = write_config(&body);
        let config = AppConfig::load(file.path().to_str()).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn explicit_missing_file_fails() {
        assert!(AppConfig::load(Some("/nonexistent/forgeshare.toml")).is_err());
    }
}
