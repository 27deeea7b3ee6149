//! Session configuration
//!
//! Loaded from camelCase JSON or built in code. Validated once at session
//! open; nothing downstream re-checks it.

use crate::export::ExportPreset;
use crate::utils::error::{RecorderError, RecorderResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Default ticks per second for the native time representation
pub const DEFAULT_TIME_SCALE: u32 = 600;

/// Delay between the nominal session start and the side recorder start,
/// absorbing audio warm-up latency relative to video capture
pub const DEFAULT_AUDIO_LEAD_SECS: f64 = 0.2;

/// Output container format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerFormat {
    #[default]
    Mp4,
    Mov,
    M4v,
}

impl ContainerFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ContainerFormat::Mp4 => "mp4",
            ContainerFormat::Mov => "mov",
            ContainerFormat::M4v => "m4v",
        }
    }

    /// FFmpeg muxer name for this format
    pub fn muxer(&self) -> &'static str {
        match self {
            ContainerFormat::Mp4 | ContainerFormat::M4v => "mp4",
            ContainerFormat::Mov => "mov",
        }
    }
}

/// Keyed encoder settings (codec, bitrate, resolution, ...)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncoderSettings(pub BTreeMap<String, Value>);

impl EncoderSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(Value::as_u64)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.0.get(key).and_then(Value::as_f64)
    }
}

/// How audio reaches the output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AudioMode {
    /// Standalone recorder writes a side file, merged after finish
    SideFile,
    /// Samples are appended straight into the container
    Direct,
}

/// Configuration for one recording session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Final output file
    pub output_path: PathBuf,

    #[serde(default)]
    pub format: ContainerFormat,

    #[serde(default)]
    pub video_settings: EncoderSettings,

    #[serde(default)]
    pub video_format_hint: Option<String>,

    /// Empty selects side-file audio
    #[serde(default)]
    pub audio_settings: EncoderSettings,

    #[serde(default)]
    pub audio_format_hint: Option<String>,

    /// Ticks per second, must be > 0
    #[serde(default = "default_time_scale")]
    pub time_scale: u32,

    #[serde(default = "default_audio_lead_secs")]
    pub audio_lead_secs: f64,

    /// Where side audio files live (system temp dir if unset)
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,

    /// Quality of the audio merge export
    #[serde(default)]
    pub export_preset: ExportPreset,
}

fn default_time_scale() -> u32 {
    DEFAULT_TIME_SCALE
}

fn default_audio_lead_secs() -> f64 {
    DEFAULT_AUDIO_LEAD_SECS
}

impl SessionConfig {
    pub fn new(output_path: impl Into<PathBuf>) -> Self {
        Self {
            output_path: output_path.into(),
            format: ContainerFormat::default(),
            video_settings: EncoderSettings::default(),
            video_format_hint: None,
            audio_settings: EncoderSettings::default(),
            audio_format_hint: None,
            time_scale: DEFAULT_TIME_SCALE,
            audio_lead_secs: DEFAULT_AUDIO_LEAD_SECS,
            scratch_dir: None,
            export_preset: ExportPreset::default(),
        }
    }

    pub fn from_json_str(json: &str) -> RecorderResult<Self> {
        let config: SessionConfig = serde_json::from_str(json)
            .map_err(|e| RecorderError::InvalidConfig(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> RecorderResult<Self> {
        let content = std::fs::read_to_string(path)?;
        tracing::debug!("Loaded session config from {:?}", path);
        Self::from_json_str(&content)
    }

    pub fn validate(&self) -> RecorderResult<()> {
        if self.output_path.as_os_str().is_empty() {
            return Err(RecorderError::InvalidConfig("output path is empty".to_string()));
        }
        if self.time_scale == 0 {
            return Err(RecorderError::InvalidConfig(
                "time scale must be greater than zero".to_string(),
            ));
        }
        if !self.audio_lead_secs.is_finite() || self.audio_lead_secs < 0.0 {
            return Err(RecorderError::InvalidConfig(format!(
                "audio lead must be a non-negative number of seconds, got {}",
                self.audio_lead_secs
            )));
        }
        Ok(())
    }

    pub fn audio_mode(&self) -> AudioMode {
        if self.audio_settings.is_empty() {
            AudioMode::SideFile
        } else {
            AudioMode::Direct
        }
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.scratch_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let config = SessionConfig::from_json_str(r#"{ "outputPath": "/tmp/out.mp4" }"#).unwrap();
        assert_eq!(config.format, ContainerFormat::Mp4);
        assert_eq!(config.time_scale, DEFAULT_TIME_SCALE);
        assert_eq!(config.audio_lead_secs, DEFAULT_AUDIO_LEAD_SECS);
        assert_eq!(config.audio_mode(), AudioMode::SideFile);
        assert_eq!(config.export_preset, ExportPreset::Highest);
    }

    #[test]
    fn test_parse_full_config() {
        let json = r#"{
            "outputPath": "/tmp/out.mov",
            "format": "mov",
            "videoSettings": { "codec": "h264", "width": 1280, "height": 720, "fps": 30 },
            "audioSettings": { "codec": "aac", "bitrate": 128000 },
            "timeScale": 1000,
            "exportPreset": "balanced"
        }"#;
        let config = SessionConfig::from_json_str(json).unwrap();
        assert_eq!(config.format, ContainerFormat::Mov);
        assert_eq!(config.video_settings.get_u64("width"), Some(1280));
        assert_eq!(config.video_settings.get_str("codec"), Some("h264"));
        assert_eq!(config.audio_mode(), AudioMode::Direct);
        assert_eq!(config.time_scale, 1000);
        assert_eq!(config.export_preset, ExportPreset::Balanced);
    }

    #[test]
    fn test_zero_time_scale_rejected() {
        let err = SessionConfig::from_json_str(r#"{ "outputPath": "a.mp4", "timeScale": 0 }"#)
            .unwrap_err();
        assert!(matches!(err, RecorderError::InvalidConfig(_)));
    }

    #[test]
    fn test_negative_lead_rejected() {
        let mut config = SessionConfig::new("a.mp4");
        config.audio_lead_secs = -0.1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_format_muxer() {
        assert_eq!(ContainerFormat::M4v.muxer(), "mp4");
        assert_eq!(ContainerFormat::Mov.extension(), "mov");
    }
}
