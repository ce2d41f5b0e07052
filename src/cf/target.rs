use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::env;
use std::path::PathBuf;

/// The parts of the cf CLI's `config.json` used to find the API and space.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CfTarget {
    pub target: String,
    #[serde(rename = "SSLDisabled", default)]
    pub ssl_disabled: bool,
    pub space_fields: SpaceFields,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpaceFields {
    #[serde(rename = "GUID")]
    pub guid: String,
    #[serde(rename = "Name")]
    pub name: String,
}

impl CfTarget {
    /// Location of the CLI config, honouring `CF_HOME`
    pub fn config_path() -> Result<PathBuf> {
        let home = env::var_os("CF_HOME")
            .or_else(|| env::var_os("HOME"))
            .context("neither CF_HOME nor HOME is set")?;
        Ok(PathBuf::from(home).join(".cf").join("config.json"))
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let json = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&json)
    }

    pub fn parse(json: &str) -> Result<Self> {
        let target: CfTarget = serde_json::from_str(json)?;
        if target.target.is_empty() {
            bail!("no API endpoint set, run `cf api` first");
        }
        if target.space_fields.guid.is_empty() {
            bail!("no space targeted, run `cf target -s <space>` first");
        }
        Ok(target)
    }
}
