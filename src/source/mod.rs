//! Capture sources.
//!
//! A `FrameSource` wraps one capture handle (video file or camera device)
//! and yields frames on demand. Sources are owned exclusively by the
//! pipeline worker; they are opened during `start()` and released when the
//! worker exits.
//!
//! Backends follow the same pattern for both source kinds:
//! - `stub://` file paths select a synthetic backend (always available,
//!   used by tests and stub deployments)
//! - real video files decode through FFmpeg (feature: ingest-file-ffmpeg)
//! - camera devices capture through V4L2 (feature: capture-v4l2); without
//!   the feature a synthetic camera stands in and says so in the log

#[cfg(feature = "ingest-file-ffmpeg")]
mod file_ffmpeg;
mod synthetic;
#[cfg(feature = "capture-v4l2")]
mod v4l2;

use anyhow::{anyhow, Context, Result};
use chrono::Local;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::frame::Frame;

use synthetic::{SyntheticCamera, SyntheticClip};

/// Where a source's frames come from. Resolved once at open time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Origin {
    FilePath(PathBuf),
    DeviceIndex(u32),
}

impl Origin {
    /// Live sources get timestamp overlays and recording sinks.
    pub fn is_live(&self) -> bool {
        matches!(self, Origin::DeviceIndex(_))
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::FilePath(path) => write!(f, "file:{}", path.display()),
            Origin::DeviceIndex(index) => write!(f, "device:{}", index),
        }
    }
}

/// Result of one read attempt.
pub enum ReadOutcome {
    Frame(Frame),
    /// The source has no more frames (file playback finished).
    EndOfStream,
}

/// Capture parameters requested at open time, honored best-effort.
#[derive(Clone, Copy, Debug)]
pub struct CaptureTarget {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Default for CaptureTarget {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30,
        }
    }
}

/// Parameters the backend actually negotiated.
#[derive(Clone, Copy, Debug)]
pub struct Negotiated {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

// ----------------------------------------------------------------------------
// StagingArea: per-run working directory for file sources and recordings
// ----------------------------------------------------------------------------

/// Per-run dated working directory under the configured work dir.
///
/// File-backed sources are copied here before capture begins; recording
/// sinks write their output here too.
pub struct StagingArea {
    dir: PathBuf,
}

impl StagingArea {
    /// Create (or reuse) today's working directory under `work_dir`.
    pub fn create(work_dir: &Path) -> Result<Self> {
        let dated = Local::now().format("%d%m%Y").to_string();
        let dir = work_dir.join(dated);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create working directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Copy a source file into the working directory.
    ///
    /// A file of the same name already present there is reused and the copy
    /// is skipped.
    pub fn stage_file(&self, source: &Path) -> Result<PathBuf> {
        let name = source
            .file_name()
            .ok_or_else(|| anyhow!("source path {} has no file name", source.display()))?;
        let target = self.dir.join(name);

        if target.exists() {
            log::info!("source already staged: {}", target.display());
            return Ok(target);
        }
        if !source.is_file() {
            return Err(anyhow!("source file not found: {}", source.display()));
        }
        std::fs::copy(source, &target).with_context(|| {
            format!("stage {} into {}", source.display(), self.dir.display())
        })?;
        log::info!("staged source file: {}", target.display());
        Ok(target)
    }
}

// ----------------------------------------------------------------------------
// FrameSource
// ----------------------------------------------------------------------------

enum SourceBackend {
    SyntheticClip(SyntheticClip),
    SyntheticCamera(SyntheticCamera),
    #[cfg(feature = "ingest-file-ffmpeg")]
    FfmpegFile(file_ffmpeg::FfmpegFileSource),
    #[cfg(feature = "capture-v4l2")]
    V4l2(v4l2::V4l2Device),
}

/// One open capture stream.
pub struct FrameSource {
    id: u32,
    origin: Origin,
    negotiated: Negotiated,
    backend: SourceBackend,
    frames_read: u64,
}

impl fmt::Debug for FrameSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameSource")
            .field("id", &self.id)
            .field("origin", &self.origin)
            .field("negotiated", &self.negotiated)
            .field("frames_read", &self.frames_read)
            .finish_non_exhaustive()
    }
}

impl FrameSource {
    /// Open a source. Any failure here is fatal to pipeline startup.
    pub fn open(
        id: u32,
        origin: Origin,
        staging: &StagingArea,
        target: CaptureTarget,
    ) -> Result<Self> {
        let (backend, negotiated) = match &origin {
            Origin::FilePath(path) => Self::open_file(path, staging, target)?,
            Origin::DeviceIndex(index) => Self::open_device(*index, target)?,
        };
        log::info!(
            "source {} opened ({}) at {}x{}@{}",
            id,
            origin,
            negotiated.width,
            negotiated.height,
            negotiated.fps
        );
        Ok(Self {
            id,
            origin,
            negotiated,
            backend,
            frames_read: 0,
        })
    }

    fn open_file(
        path: &Path,
        staging: &StagingArea,
        target: CaptureTarget,
    ) -> Result<(SourceBackend, Negotiated)> {
        let spec = path.to_string_lossy();
        if spec.starts_with("stub://") {
            let clip = SyntheticClip::from_url(&spec, target)?;
            let negotiated = clip.negotiated();
            return Ok((SourceBackend::SyntheticClip(clip), negotiated));
        }

        let staged = staging.stage_file(path)?;
        #[cfg(feature = "ingest-file-ffmpeg")]
        {
            let source = file_ffmpeg::FfmpegFileSource::open(&staged, target)?;
            let negotiated = source.negotiated();
            Ok((SourceBackend::FfmpegFile(source), negotiated))
        }
        #[cfg(not(feature = "ingest-file-ffmpeg"))]
        {
            Err(anyhow!(
                "opening {} requires the ingest-file-ffmpeg feature",
                staged.display()
            ))
        }
    }

    fn open_device(index: u32, target: CaptureTarget) -> Result<(SourceBackend, Negotiated)> {
        #[cfg(feature = "capture-v4l2")]
        {
            let device = v4l2::V4l2Device::open(index, target)?;
            let negotiated = device.negotiated();
            Ok((SourceBackend::V4l2(device), negotiated))
        }
        #[cfg(not(feature = "capture-v4l2"))]
        {
            log::warn!(
                "capture-v4l2 not enabled; device {} runs a synthetic camera",
                index
            );
            let camera = SyntheticCamera::new(target);
            let negotiated = camera.negotiated();
            Ok((SourceBackend::SyntheticCamera(camera), negotiated))
        }
    }

    /// Read one frame. Read failures are recoverable at the pipeline level.
    pub fn read(&mut self) -> Result<ReadOutcome> {
        let pixels = match &mut self.backend {
            SourceBackend::SyntheticClip(clip) => clip.next_pixels(),
            SourceBackend::SyntheticCamera(camera) => Some(camera.next_pixels()),
            #[cfg(feature = "ingest-file-ffmpeg")]
            SourceBackend::FfmpegFile(source) => source.read_pixels()?,
            #[cfg(feature = "capture-v4l2")]
            SourceBackend::V4l2(device) => Some(device.read_pixels()?),
        };

        match pixels {
            Some((data, width, height)) => {
                self.frames_read += 1;
                Ok(ReadOutcome::Frame(Frame::new(self.id, data, width, height)))
            }
            None => Ok(ReadOutcome::EndOfStream),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn negotiated(&self) -> Negotiated {
        self.negotiated
    }

    pub fn is_live(&self) -> bool {
        self.origin.is_live()
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
