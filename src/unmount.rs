//! Tears the mount down once the session is cancelled.
//!
//! Unmounting fails with "resource busy" while some process still has the
//! token open, so busy failures are retried with exponential backoff until an
//! overall deadline. Any other failure ends the attempt immediately.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum UnmountError {
    #[error("mount point is busy: {0}")]
    Busy(String),
    #[error("unmount: {0}")]
    Failed(String),
    #[error("mount point still busy after {0:?}")]
    DeadlineExceeded(Duration),
}

pub trait Unmounter: Send + Sync {
    fn unmount(&self, path: &Path) -> impl Future<Output = Result<(), UnmountError>> + Send;
}

#[cfg(target_os = "macos")]
const UNMOUNT_COMMANDS: &[(&str, &[&str])] = &[("umount", &[])];
#[cfg(not(target_os = "macos"))]
const UNMOUNT_COMMANDS: &[(&str, &[&str])] = &[("fusermount3", &["-u"]), ("fusermount", &["-u"])];

/// Unmounts through the platform's FUSE helper, which works without root.
pub struct SystemUnmounter;

impl Unmounter for SystemUnmounter {
    async fn unmount(&self, path: &Path) -> Result<(), UnmountError> {
        for (program, args) in UNMOUNT_COMMANDS {
            let output = match Command::new(program).args(*args).arg(path).output().await {
                Ok(output) => output,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(UnmountError::Failed(format!("{program}: {e}"))),
            };
            if output.status.success() {
                return Ok(());
            }
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify(stderr.trim()));
        }
        Err(UnmountError::Failed("no unmount helper found".to_string()))
    }
}

fn classify(message: &str) -> UnmountError {
    if message.to_ascii_lowercase().contains("busy") {
        UnmountError::Busy(message.to_string())
    } else {
        UnmountError::Failed(message.to_string())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub multiplier: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            initial: Duration::from_millis(10),
            multiplier: 1.3,
        }
    }
}

pub struct UnmountSupervisor<U> {
    unmounter: U,
    mount_path: PathBuf,
    deadline: Duration,
    backoff: Backoff,
}

impl<U: Unmounter> UnmountSupervisor<U> {
    pub fn new(unmounter: U, mount_path: &Path, deadline: Duration) -> Self {
        UnmountSupervisor {
            unmounter,
            mount_path: mount_path.to_path_buf(),
            deadline,
            backoff: Backoff::default(),
        }
    }

    /// Waits for `cancel`, then unmounts.
    pub async fn supervise(self, cancel: CancellationToken) -> Result<u32, UnmountError> {
        cancel.cancelled().await;

        log::info!("attempting to unmount {}", self.mount_path.display());
        let result = self.unmount().await;
        match &result {
            Ok(attempts) => log::info!(
                "unmounted {} after {attempts} attempt(s)",
                self.mount_path.display()
            ),
            Err(e) => log::error!("unable to unmount {}: {e}", self.mount_path.display()),
        }
        result
    }

    /// Unmounts, retrying while busy. Returns the number of attempts made.
    pub async fn unmount(&self) -> Result<u32, UnmountError> {
        let deadline = Instant::now() + self.deadline;
        let mut delay = self.backoff.initial;
        let mut attempts = 0;

        loop {
            attempts += 1;
            let attempt = self.unmounter.unmount(&self.mount_path);
            let reason = match tokio::time::timeout_at(deadline, attempt).await {
                Ok(Ok(())) => return Ok(attempts),
                Ok(Err(UnmountError::Busy(reason))) => reason,
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(UnmountError::DeadlineExceeded(self.deadline)),
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(UnmountError::DeadlineExceeded(self.deadline));
            }
            log::warn!("resource busy while unmounting ({reason}); trying again in {delay:?}");
            tokio::time::sleep(delay.min(remaining)).await;
            delay = delay.mul_f64(self.backoff.multiplier);
        }
    }
}
