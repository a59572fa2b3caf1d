//! The remote-device collaborator interface.
//!
//! Request formatting, transport, and authentication live behind this trait;
//! the engine and workflows only see typed operations. Production
//! implementations wrap the device's management API; tests use scripted
//! fakes.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::config::{DeviceSettings, RemoteServiceSettings};

/// Errors from remote device or analysis-service operations.
#[derive(Debug, Clone, Error)]
pub enum DeviceError {
    /// Likely to succeed on retry (timeouts, transient service errors).
    #[error("transient device error: {0}")]
    Transient(String),

    /// Retrying will not help (bad credentials, unsupported operation).
    #[error("permanent device error: {0}")]
    Permanent(String),
}

impl DeviceError {
    /// Returns true if the error is worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, DeviceError::Transient(_))
    }
}

/// Progress of a remote analysis job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalysisStatus {
    /// Still processing; ask again later.
    Pending,

    /// The result is ready to fetch.
    Ready,

    /// The remote side gave up on this job.
    Failed(String),
}

/// Remote operations the concrete workflows perform.
///
/// Every method takes the settings it needs explicitly, so configuration is
/// fetched (and its errors surface) at the phase that first uses it.
#[async_trait]
pub trait DeviceClient: Send + Sync {
    /// Asks the device to produce a diagnostics archive and downloads it
    /// into `dest_dir`. Returns the local path of the archive.
    async fn collect_archive(
        &self,
        device: &DeviceSettings,
        dest_dir: &Path,
    ) -> Result<PathBuf, DeviceError>;

    /// Uploads a local archive to the analysis service. Returns the remote
    /// handle identifying the upload.
    async fn upload_archive(
        &self,
        service: &RemoteServiceSettings,
        archive: &Path,
    ) -> Result<String, DeviceError>;

    /// Asks the analysis service whether processing of an upload finished.
    async fn analysis_status(
        &self,
        service: &RemoteServiceSettings,
        handle: &str,
    ) -> Result<AnalysisStatus, DeviceError>;

    /// Fetches the finished analysis result for an upload.
    async fn fetch_analysis(
        &self,
        service: &RemoteServiceSettings,
        handle: &str,
    ) -> Result<Value, DeviceError>;

    /// Fetches the device's metrics overview (the primary payload).
    async fn fetch_overview(&self, device: &DeviceSettings) -> Result<Value, DeviceError>;

    /// Fetches per-item statistics for one item referenced by the overview
    /// (best-effort enrichment).
    async fn fetch_item_stats(
        &self,
        device: &DeviceSettings,
        item: &str,
    ) -> Result<Value, DeviceError>;
}
