//! Screen-recorded sessions.
//!
//! A [`VideoSession`] wraps a plain [`Session`] running one of the ffmpeg
//! browser images, records the virtual display for the lifetime of the
//! session, and copies the finished file out of the container before the
//! container is destroyed.

use std::{
    io::Cursor,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use {
    chrono::{Local, Utc},
    futures::future::BoxFuture,
    tracing::{debug, info, warn},
};

use crate::{
    browser::DriverConfig,
    client::WebDriverClient,
    error::DriverError,
    proxy::SquidProxy,
    session::{RunOutcome, Session, SessionState, TaskError},
};

/// The ffmpeg images expose the browser's display as X screen 99.
const DISPLAY: &str = ":99+0,0";

/// Directory inside the container where the recording is written.
const CONTAINER_VIDEO_DIR: &str = "/tmp";

/// Time for ffmpeg to flush and close the file after receiving SIGTERM.
const FFMPEG_FLUSH: Duration = Duration::from_secs(1);

/// Recording parameters.
#[derive(Debug, Clone)]
pub struct VideoConfig {
    /// Host directory finished recordings are extracted into.
    pub save_path: PathBuf,
    /// Capture size, `WIDTHxHEIGHT`.
    pub resolution: String,
    /// Capture framerate.
    pub fps: u32,
    /// Place recordings under `YYYY/MM/DD` subdirectories of `save_path`.
    pub shard_by_date: bool,
}

impl VideoConfig {
    pub fn new(save_path: impl Into<PathBuf>) -> Self {
        Self {
            save_path: save_path.into(),
            resolution: "1360x1020".to_string(),
            fps: 8,
            shard_by_date: true,
        }
    }

    /// Directory the recording lands in on the host.
    fn dest_dir(&self) -> PathBuf {
        if self.shard_by_date {
            let today = Local::now();
            self.save_path.join(today.format("%Y/%m/%d").to_string())
        } else {
            self.save_path.clone()
        }
    }
}

/// A session whose display is recorded from creation to quit.
pub struct VideoSession {
    inner: Session,
    config: VideoConfig,
    filename: String,
    recording: bool,
}

impl VideoSession {
    /// Create a recording session: a container from the browser's ffmpeg
    /// image, with the capture started before the session is handed out.
    pub async fn create(
        factory: Arc<corral_factory::ContainerFactory>,
        config: &DriverConfig,
        video: VideoConfig,
        proxy: Option<&SquidProxy>,
    ) -> Result<Self, DriverError> {
        let inner = Session::create_inner(factory, config, proxy, true).await?;
        let filename = recording_filename(config.browser.name());

        let mut session = Self {
            inner,
            config: video,
            filename,
            recording: false,
        };
        let title = video_title(session.inner.name());
        if let Err(e) = session.start_recording(&title).await {
            // no point keeping an unrecorded container alive
            let _ = session.inner.quit().await;
            return Err(e);
        }
        Ok(session)
    }

    /// The recording's filename inside and outside the container.
    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    /// Execute one task against the recorded session.
    pub async fn run<O, F>(&mut self, task: F) -> Result<RunOutcome<O>, DriverError>
    where
        F: for<'c> FnOnce(&'c WebDriverClient) -> BoxFuture<'c, Result<O, TaskError>>,
    {
        self.inner.run(task).await
    }

    /// Stop the capture, extract the file to the host, and tear the session
    /// down. Extraction failures are logged, not fatal: the container still
    /// has to go.
    pub async fn quit(&mut self) -> Result<(), DriverError> {
        if self.inner.state() == SessionState::Terminated {
            return Ok(());
        }
        if self.recording {
            if let Err(e) = self.stop_recording().await {
                warn!(name = self.inner.name(), error = %e, "failed to stop recording");
            } else if let Err(e) = self.extract_recording().await {
                warn!(name = self.inner.name(), error = %e, "failed to extract recording");
            }
            self.recording = false;
        }
        self.inner.quit().await
    }

    async fn start_recording(&mut self, title: &str) -> Result<(), DriverError> {
        let output = format!("{CONTAINER_VIDEO_DIR}/{}", self.filename);
        let cmd = format!(
            "ffmpeg -y -f x11grab -s {res} -framerate {fps} -i {DISPLAY} \
             -metadata title=\"{title}\" -qp 18 -c:v libx264 -preset ultrafast {output}",
            res = self.config.resolution,
            fps = self.config.fps,
        );
        debug!(name = self.inner.name(), file = self.filename, "starting recording");
        self.inner
            .factory()
            .exec_detached(
                self.inner.record(),
                vec!["/bin/sh".to_string(), "-c".to_string(), cmd],
                None,
            )
            .await?;
        self.recording = true;
        Ok(())
    }

    async fn stop_recording(&self) -> Result<(), DriverError> {
        debug!(name = self.inner.name(), "stopping recording");
        self.inner
            .factory()
            .exec_detached(
                self.inner.record(),
                vec!["pkill".to_string(), "ffmpeg".to_string()],
                None,
            )
            .await?;
        tokio::time::sleep(FFMPEG_FLUSH).await;
        Ok(())
    }

    async fn extract_recording(&self) -> Result<PathBuf, DriverError> {
        let container_path = format!("{CONTAINER_VIDEO_DIR}/{}", self.filename);
        let bytes = self
            .inner
            .factory()
            .download_archive(self.inner.record(), &container_path)
            .await?;

        let dest_dir = self.config.dest_dir();
        let path = tokio::task::spawn_blocking(move || unpack_archive(&bytes, &dest_dir))
            .await
            .map_err(|e| DriverError::Recording(format!("extraction task failed: {e}")))??;

        info!(name = self.inner.name(), path = %path.display(), "recording saved");
        Ok(path)
    }
}

/// Unpack a single-file tar archive into `dest_dir`, returning the extracted
/// file's path.
fn unpack_archive(bytes: &[u8], dest_dir: &Path) -> Result<PathBuf, DriverError> {
    std::fs::create_dir_all(dest_dir)
        .map_err(|e| DriverError::Recording(format!("cannot create {}: {e}", dest_dir.display())))?;

    let mut archive = tar::Archive::new(Cursor::new(bytes));
    let mut extracted = None;
    let entries = archive
        .entries()
        .map_err(|e| DriverError::Recording(format!("bad archive: {e}")))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| DriverError::Recording(format!("bad entry: {e}")))?;
        let name = entry
            .path()
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_os_string()))
            .ok_or_else(|| DriverError::Recording("archive entry without a name".into()))?;
        let dest = dest_dir.join(name);
        entry
            .unpack(&dest)
            .map_err(|e| DriverError::Recording(format!("cannot unpack {}: {e}", dest.display())))?;
        extracted = Some(dest);
    }
    extracted.ok_or_else(|| DriverError::Recording("archive was empty".into()))
}

/// `{browser}-docker-{timestamp}.mkv`, matching what operators grep for.
fn recording_filename(browser: &str) -> String {
    format!("{browser}-docker-{}.mkv", Utc::now().format("%Y%m%d%H%M%S"))
}

fn video_title(container_name: &str) -> String {
    format!("{container_name} session recording")
}
