use crate::cf::{CfCli, CfPlatform, CfTarget, PlatformClient};
use crate::json_api::JsonApi;
use anyhow::{Context, Result};
use config::{Config, File};
use log::info;
use rollback_procedure::BackoffPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "bg-change-stack.yaml";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Settings {
    /// Cloud Controller URL, taken from the cf CLI config when not set
    pub api: Option<String>,

    /// Space the app lives in, taken from the cf CLI config when not set
    pub space_guid: Option<String>,

    /// Path to the cf CLI
    pub cf_binary: PathBuf,

    /// Bearer token for the API, `cf oauth-token` is used when not set
    pub token: Option<String>,

    /// Skip TLS verification of the API
    pub allow_invalid_certs: bool,

    /// How to poll the bits copy job
    pub poll: PollConfig,

    /// Warning printed when undoing a failed migration also fails
    pub rollback_failure_message: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api: None,
            space_guid: None,
            cf_binary: PathBuf::from("cf"),
            token: None,
            allow_invalid_certs: false,
            poll: PollConfig::default(),
            rollback_failure_message: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct PollConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub factor: f64,
    /// Give up waiting after this many seconds, wait forever when not set
    pub max_wait_secs: Option<u64>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 500,
            max_delay_ms: 10_000,
            factor: 2.0,
            max_wait_secs: Some(15 * 60),
        }
    }
}

impl PollConfig {
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy::default()
            .with_min_delay(Duration::from_millis(self.min_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_factor(self.factor)
            .with_max_wait(self.max_wait_secs.map(Duration::from_secs))
    }
}

impl Settings {
    /// Read settings from `path`, a missing file leaves everything at its default
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or(Path::new(DEFAULT_CONFIG_FILE));
        let settings = Config::builder()
            .add_source(File::from(path).required(false))
            .build()?
            .try_deserialize()
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(settings)
    }

    pub async fn get_platform(&self) -> Result<Arc<dyn PlatformClient>> {
        let cli = CfCli::new(&self.cf_binary);
        let target = match (&self.api, &self.space_guid) {
            (Some(_), Some(_)) => None,
            _ => Some(CfTarget::load()?),
        };

        let api = self
            .api
            .clone()
            .or_else(|| target.as_ref().map(|t| t.target.clone()))
            .context("no API endpoint configured")?;
        let space_guid = self
            .space_guid
            .clone()
            .or_else(|| target.as_ref().map(|t| t.space_fields.guid.clone()))
            .context("no space configured")?;
        let token = match &self.token {
            Some(t) => t.clone(),
            None => cli.oauth_token().await?,
        };
        let allow_invalid_certs =
            self.allow_invalid_certs || target.as_ref().is_some_and(|t| t.ssl_disabled);

        info!(
            "Using {} ({}) against {} in space {}",
            cli.binary().display(),
            if self.token.is_some() {
                "configured token"
            } else {
                "cf oauth-token"
            },
            api,
            space_guid
        );
        let json = JsonApi::token(&api, &bearer(&token), allow_invalid_certs)?;
        Ok(Arc::new(CfPlatform::new(cli, json, space_guid)))
    }
}

/// `cf oauth-token` prints `bearer <jwt>`, configured tokens may omit the scheme
fn bearer(token: &str) -> String {
    let token = token.trim();
    if token
        .get(..7)
        .is_some_and(|p| p.eq_ignore_ascii_case("bearer "))
    {
        token.to_string()
    } else {
        format!("bearer {}", token)
    }
}
