use std::path::{Path, PathBuf};

use anyhow::Context;
use drivemirror_core::GraphClient;

use crate::organize::engine::DEFAULT_PAGE_SIZE;

const DEFAULT_API_BASE: &str = "https://graph.microsoft.com";
const DB_DIR_NAME: &str = "drivemirror";
const DB_FILE_NAME: &str = "mirror.db";

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    /// Bearer token; only remote commands need it.
    pub token: Option<String>,
    pub api_base: String,
    pub drive_id: Option<String>,
    pub db_path: PathBuf,
    pub page_size: u32,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let data_dir = dirs::data_dir().unwrap_or_else(|| home.join(".local/share"));
        Ok(Self::from_vars(
            |name| std::env::var(name).ok(),
            &home,
            &data_dir,
        ))
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>, home: &Path, data_dir: &Path) -> Self {
        let non_empty = |name: &str| var(name).filter(|value| !value.trim().is_empty());
        let db_path = non_empty("DRIVEMIRROR_DB")
            .map(|value| expand_with_home(&value, home))
            .unwrap_or_else(|| data_dir.join(DB_DIR_NAME).join(DB_FILE_NAME));
        let page_size = read_u64(
            non_empty("DRIVEMIRROR_PAGE_SIZE").as_deref(),
            u64::from(DEFAULT_PAGE_SIZE),
        );

        Self {
            token: non_empty("DRIVEMIRROR_TOKEN"),
            api_base: non_empty("DRIVEMIRROR_API_BASE")
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            drive_id: non_empty("DRIVEMIRROR_DRIVE_ID"),
            db_path,
            page_size: u32::try_from(page_size).unwrap_or(u32::MAX),
        }
    }

    pub fn build_client(&self) -> anyhow::Result<GraphClient> {
        let token = self
            .token
            .as_deref()
            .context("DRIVEMIRROR_TOKEN is not set")?;
        let client = GraphClient::with_base_url(&self.api_base, token)
            .with_context(|| format!("invalid api base url {}", self.api_base))?;
        Ok(match &self.drive_id {
            Some(drive_id) => client.with_drive_id(drive_id.clone()),
            None => client,
        })
    }
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

/// Positive integers only; anything else yields `default`.
fn read_u64(value: Option<&str>, default: u64) -> u64 {
    value
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}
