//! Pipeline configuration.
//!
//! The configuration store itself is an external collaborator; this module
//! is the boundary contract: a TOML file merged over defaults, then
//! `BOLTWATCH_*` environment overrides, then validation. The pipeline only
//! ever sees the validated `PipelineConfig`.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::source::Origin;
use crate::stats::FpsMode;

const DEFAULT_MODEL_PATH: &str = "stub://cam";
const DEFAULT_CONFIDENCE: f32 = 50.0;
const DEFAULT_IOU: f32 = 0.45;
const DEFAULT_CROP_DIR: &str = "data/cropped";
const DEFAULT_WORK_DIR: &str = "data/source";
const DEFAULT_CLASS_NAMES: [&str; 2] = ["damaged", "intact"];

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    model_path: Option<String>,
    confidence_threshold: Option<f32>,
    iou_threshold: Option<f32>,
    source_count: Option<usize>,
    record: Option<bool>,
    sources: Option<HashMap<String, OriginSpec>>,
    output: Option<OutputConfigFile>,
    overlay: Option<OverlayConfigFile>,
    stats: Option<StatsConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct OutputConfigFile {
    crop_dir: Option<PathBuf>,
    work_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct OverlayConfigFile {
    font_path: Option<PathBuf>,
    class_names: Option<Vec<String>>,
    flagged_class: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct StatsConfigFile {
    fps_mode: Option<FpsMode>,
}

/// One entry of the source map: a video file path or a device index.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum OriginSpec {
    Device(u32),
    Path(String),
}

impl OriginSpec {
    pub fn to_origin(&self) -> Origin {
        match self {
            OriginSpec::Device(index) => Origin::DeviceIndex(*index),
            OriginSpec::Path(path) => Origin::FilePath(PathBuf::from(path)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Model artifact path, or a `stub://` engine spec.
    pub model_path: String,
    /// Confidence threshold in percent, `0..=100`.
    pub confidence_threshold: f32,
    /// IoU threshold in `0..=1`, handed to the engine at load time.
    pub iou_threshold: f32,
    pub source_count: usize,
    /// Source ordinal to origin. Every ordinal in `[0, source_count)` must
    /// be mapped for `start()` to accept the configuration.
    pub sources: HashMap<u32, OriginSpec>,
    /// Record annotated video for live sources.
    pub record: bool,
    pub crop_dir: PathBuf,
    pub work_dir: PathBuf,
    /// TTF font for overlay text; labels degrade to backing rectangles
    /// without one.
    pub font_path: Option<PathBuf>,
    pub class_names: Vec<String>,
    pub flagged_class: u32,
    pub fps_mode: FpsMode,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let mut sources = HashMap::new();
        sources.insert(0, OriginSpec::Path("stub://clip".to_string()));
        Self {
            model_path: DEFAULT_MODEL_PATH.to_string(),
            confidence_threshold: DEFAULT_CONFIDENCE,
            iou_threshold: DEFAULT_IOU,
            source_count: 1,
            sources,
            record: true,
            crop_dir: PathBuf::from(DEFAULT_CROP_DIR),
            work_dir: PathBuf::from(DEFAULT_WORK_DIR),
            font_path: None,
            class_names: DEFAULT_CLASS_NAMES.iter().map(|s| s.to_string()).collect(),
            flagged_class: 0,
            fps_mode: FpsMode::default(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration: defaults, then the TOML file (explicit path or
    /// `BOLTWATCH_CONFIG`), then environment overrides, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var("BOLTWATCH_CONFIG").ok().map(PathBuf::from);
        let file_cfg = match path.or(env_path.as_deref()) {
            Some(path) => read_config_file(path)?,
            None => PipelineConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PipelineConfigFile) -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(model_path) = file.model_path {
            cfg.model_path = model_path;
        }
        if let Some(confidence) = file.confidence_threshold {
            cfg.confidence_threshold = confidence;
        }
        if let Some(iou) = file.iou_threshold {
            cfg.iou_threshold = iou;
        }
        if let Some(count) = file.source_count {
            cfg.source_count = count;
        }
        if let Some(record) = file.record {
            cfg.record = record;
        }
        if let Some(sources) = file.sources {
            cfg.sources = sources
                .into_iter()
                .map(|(key, spec)| {
                    let ordinal: u32 = key
                        .parse()
                        .map_err(|_| anyhow!("source key '{}' is not an ordinal", key))?;
                    Ok((ordinal, spec))
                })
                .collect::<Result<_>>()?;
        }
        if let Some(output) = file.output {
            if let Some(crop_dir) = output.crop_dir {
                cfg.crop_dir = crop_dir;
            }
            if let Some(work_dir) = output.work_dir {
                cfg.work_dir = work_dir;
            }
        }
        if let Some(overlay) = file.overlay {
            cfg.font_path = overlay.font_path.or(cfg.font_path);
            if let Some(class_names) = overlay.class_names {
                cfg.class_names = class_names;
            }
            if let Some(flagged_class) = overlay.flagged_class {
                cfg.flagged_class = flagged_class;
            }
        }
        if let Some(stats) = file.stats {
            if let Some(fps_mode) = stats.fps_mode {
                cfg.fps_mode = fps_mode;
            }
        }
        Ok(cfg)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(model_path) = std::env::var("BOLTWATCH_MODEL_PATH") {
            if !model_path.trim().is_empty() {
                self.model_path = model_path;
            }
        }
        if let Ok(confidence) = std::env::var("BOLTWATCH_CONFIDENCE") {
            self.confidence_threshold = confidence
                .parse()
                .map_err(|_| anyhow!("BOLTWATCH_CONFIDENCE must be a number (percent)"))?;
        }
        if let Ok(record) = std::env::var("BOLTWATCH_RECORD") {
            self.record = record
                .parse()
                .map_err(|_| anyhow!("BOLTWATCH_RECORD must be true or false"))?;
        }
        if let Ok(crop_dir) = std::env::var("BOLTWATCH_CROP_DIR") {
            if !crop_dir.trim().is_empty() {
                self.crop_dir = PathBuf::from(crop_dir);
            }
        }
        if let Ok(work_dir) = std::env::var("BOLTWATCH_WORK_DIR") {
            if !work_dir.trim().is_empty() {
                self.work_dir = PathBuf::from(work_dir);
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..=100.0).contains(&self.confidence_threshold) {
            return Err(anyhow!(
                "confidence_threshold must be 0..=100 percent, got {}",
                self.confidence_threshold
            ));
        }
        if !(0.0..=1.0).contains(&self.iou_threshold) {
            return Err(anyhow!(
                "iou_threshold must be 0..=1, got {}",
                self.iou_threshold
            ));
        }
        if self.source_count == 0 {
            return Err(anyhow!("source_count must be at least 1"));
        }
        if self.class_names.is_empty() {
            return Err(anyhow!("class_names must not be empty"));
        }
        if self.flagged_class as usize >= self.class_names.len() {
            return Err(anyhow!(
                "flagged_class {} is out of range for {} class names",
                self.flagged_class,
                self.class_names.len()
            ));
        }
        Ok(())
    }

    /// Confidence threshold as a fraction in `[0, 1]`, the unit the engine
    /// contract uses.
    pub fn confidence_fraction(&self) -> f32 {
        self.confidence_threshold / 100.0
    }
}

fn read_config_file(path: &Path) -> Result<PipelineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read config file {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("invalid config file {}", path.display()))
}
