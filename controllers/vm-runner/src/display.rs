//! Display password propagation
//!
//! The operator's display secret is mounted as files. The runner polls
//! them and pushes changes into the hypervisor.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crds::labels::{DISPLAY_PASSWORD_KEY, PASSWORD_EXPIRY_KEY};
use tracing::debug;

use crate::error::RunnerError;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DisplayCredentials {
    pub password: Option<String>,
    /// `never` or Unix epoch seconds
    pub expiry: Option<String>,
}

impl DisplayCredentials {
    /// Value for QMP `expire_password`
    pub fn expire_time(&self) -> &str {
        match self.expiry.as_deref() {
            Some(expiry) if !expiry.is_empty() => expiry,
            _ => "never",
        }
    }
}

async fn read_value(path: &Path) -> Result<Option<String>, RunnerError> {
    match tokio::fs::read_to_string(path).await {
        Ok(value) => Ok(Some(value.trim().to_string())),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug)]
pub struct DisplaySecretWatcher {
    dir: PathBuf,
    last: Option<DisplayCredentials>,
}

impl DisplaySecretWatcher {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            last: None,
        }
    }

    pub async fn read(&self) -> Result<DisplayCredentials, RunnerError> {
        Ok(DisplayCredentials {
            password: read_value(&self.dir.join(DISPLAY_PASSWORD_KEY)).await?,
            expiry: read_value(&self.dir.join(PASSWORD_EXPIRY_KEY)).await?,
        })
    }

    /// The current credentials if they differ from the last poll
    pub async fn poll(&mut self) -> Result<Option<DisplayCredentials>, RunnerError> {
        let current = self.read().await?;
        if self.last.as_ref() == Some(&current) {
            return Ok(None);
        }
        debug!(dir = %self.dir.display(), "Display credentials changed");
        self.last = Some(current.clone());
        Ok(Some(current))
    }

    /// Forget the last value so the next poll reports it again
    pub fn reset(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_poll_reports_changes_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = DisplaySecretWatcher::new(dir.path());

        let empty = watcher.poll().await.unwrap().unwrap();
        assert_eq!(empty, DisplayCredentials::default());
        assert_eq!(empty.expire_time(), "never");
        assert_eq!(watcher.poll().await.unwrap(), None);

        std::fs::write(dir.path().join(DISPLAY_PASSWORD_KEY), "s3cret").unwrap();
        std::fs::write(dir.path().join(PASSWORD_EXPIRY_KEY), "1760000000\n").unwrap();
        let creds = watcher.poll().await.unwrap().unwrap();
        assert_eq!(creds.password.as_deref(), Some("s3cret"));
        assert_eq!(creds.expire_time(), "1760000000");
        assert_eq!(watcher.poll().await.unwrap(), None);

        watcher.reset();
        assert!(watcher.poll().await.unwrap().is_some());
    }
}
