//! Frame capture of the DUT's display through GStreamer.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use tokio::process::{Child, Command};

use crate::{Error, Result};

const STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs `gst-launch-1.0` grabbing frames from the first v4l2 device into a directory of JPEGs.
pub struct Video {
    capture_dir: PathBuf,
    child: Option<Child>,
}

impl Video {
    pub const DEFAULT_CAPTURE_DIR: &str = "/tmp/capture";

    pub fn new(capture_dir: impl Into<PathBuf>) -> Self {
        Self {
            capture_dir: capture_dir.into(),
            child: None,
        }
    }

    pub fn capture_dir(&self) -> &Path {
        &self.capture_dir
    }

    pub const fn is_capturing(&self) -> bool {
        self.child.is_some()
    }

    /// Start capturing and return the directory frames are written to. A running capture is
    /// left alone.
    pub async fn start_capture(&mut self) -> Result<PathBuf> {
        if self.child.is_some() {
            tracing::warn!("Video capture already running");
            return Ok(self.capture_dir.clone());
        }

        tokio::fs::create_dir_all(&self.capture_dir).await?;

        let child = Command::new("gst-launch-1.0")
            .args(pipeline(&self.capture_dir))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Video(format!("Failed to start gst-launch-1.0: {e}")))?;

        tracing::info!("Capturing frames to {}", self.capture_dir.display());
        self.child = Some(child);

        Ok(self.capture_dir.clone())
    }

    /// Interrupt the pipeline so it can finish the current frame. Killed if it is still running
    /// after 30 s.
    pub async fn stop_capture(&mut self) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            return Err(Error::Video("No capture running".to_string()));
        };

        interrupt(&child);

        match tokio::time::timeout(STOP_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => tracing::info!("Video capture stopped: {status}"),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                tracing::warn!("Video capture did not stop in {STOP_TIMEOUT:?}, killing it");
                child.kill().await?;
            }
        }

        Ok(())
    }
}

#[cfg(unix)]
fn interrupt(child: &Child) {
    use nix::{
        sys::signal::{Signal, kill},
        unistd::Pid,
    };

    let Some(pid) = child.id() else {
        return;
    };

    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
        tracing::warn!("Failed to interrupt video capture: {e}");
    }
}

#[cfg(not(unix))]
fn interrupt(_: &Child) {}

fn pipeline(dir: &Path) -> Vec<String> {
    let location = format!("location={}", dir.join("%06d.jpg").display());

    [
        "-e",
        "v4l2src",
        "!",
        "decodebin",
        "!",
        "videocrop",
        "left=90",
        "right=90",
        "bottom=70",
        "top=70",
        "!",
        "jpegenc",
        "quality=10",
        "!",
        "multifilesink",
        &location,
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{Video, pipeline};

    #[test]
    fn gst_pipeline() {
        let args = pipeline(Path::new("/tmp/capture"));
        assert_eq!(args.first().map(String::as_str), Some("-e"));
        assert_eq!(
            args.last().map(String::as_str),
            Some("location=/tmp/capture/%06d.jpg")
        );
        assert!(args.iter().any(|x| x == "v4l2src"));
    }

    #[tokio::test]
    async fn stop_without_capture() {
        let mut v = Video::new(Video::DEFAULT_CAPTURE_DIR);
        assert!(!v.is_capturing());
        assert!(v.stop_capture().await.is_err());
    }
}
