use crate::models::BacktestResult;
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::info;
use std::path::PathBuf;
use tokio::fs;

/// Persists a finished run and returns where it went.
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn save(&self, result: &BacktestResult) -> Result<String>;
}

/// Writes pretty-printed JSON, named `backtest-{id}.json` unless a file is given.
#[derive(Debug, Clone)]
pub struct JsonReportSink {
    dir: PathBuf,
    file_name: Option<String>,
}

impl JsonReportSink {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self {
            dir: dir.into(),
            file_name: None,
        }
    }

    pub fn to_file<P: Into<PathBuf>>(path: P) -> Self {
        let path: PathBuf = path.into();
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned());
        let dir = path
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        Self { dir, file_name }
    }

    fn path_for(&self, result: &BacktestResult) -> PathBuf {
        let name = self
            .file_name
            .clone()
            .unwrap_or_else(|| format!("backtest-{}.json", result.metadata.id));
        self.dir.join(name)
    }
}

#[async_trait]
impl ReportSink for JsonReportSink {
    async fn save(&self, result: &BacktestResult) -> Result<String> {
        if !self.dir.as_os_str().is_empty() {
            fs::create_dir_all(&self.dir)
                .await
                .with_context(|| format!("failed to create report dir {}", self.dir.display()))?;
        }
        let path = self.path_for(result);
        let payload =
            serde_json::to_vec_pretty(result).context("failed to serialize backtest result")?;
        fs::write(&path, payload)
            .await
            .with_context(|| format!("failed to write report {}", path.display()))?;
        info!("Saved backtest report to {}", path.display());
        Ok(path.display().to_string())
    }
}
