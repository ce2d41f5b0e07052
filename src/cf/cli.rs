use crate::error::{CfError, CfResult};
use log::{debug, info};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Runs the `cf` CLI, which is expected to be logged in and targeted at a space.
#[derive(Debug, Clone)]
pub struct CfCli {
    binary: PathBuf,
}

impl CfCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Run a command and return its stdout.
    pub async fn run<I, S>(&self, args: I) -> CfResult<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<_> = args
            .into_iter()
            .map(|a| a.as_ref().to_os_string())
            .collect();
        let printable = args
            .iter()
            .map(|a| a.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ");
        info!("cf {}", printable);

        let output = Command::new(&self.binary)
            .args(&args)
            .env("CF_COLOR", "false")
            .output()
            .await
            .map_err(|e| CfError::Command {
                args: printable.clone(),
                status: "not started".to_string(),
                output: e.to_string(),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        debug!("<< {}", stdout.trim_end());
        if output.status.success() {
            Ok(stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // cf prints most failures on stdout ("FAILED" followed by the reason)
            let output_text = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            Err(CfError::Command {
                args: printable,
                status: output.status.to_string(),
                output: output_text,
            })
        }
    }

    /// Current access token, refreshed by the CLI if needed
    pub async fn oauth_token(&self) -> CfResult<String> {
        let out = self.run(["oauth-token"]).await?;
        let token = out.lines().map(str::trim).find(|l| !l.is_empty());
        match token {
            Some(t) => Ok(t.to_string()),
            None => Err(CfError::Precondition(
                "cf oauth-token returned no token, are you logged in?".to_string(),
            )),
        }
    }
}
