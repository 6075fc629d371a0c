//! Preset files describing a shader chain and its cosmetic layers.
//!
//! A preset is a small TOML document naming up to [`MAX_STAGES`] shader
//! stages (scale, filter, size semantics, parameter overrides) plus the
//! output sharpness, the effect layer and the overlay image. The compositor
//! consumes the parsed [`Preset`]; this crate only knows how to read and
//! validate it.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

/// Capacity of the shader stage registry.
pub const MAX_STAGES: usize = 3;

/// Interval the background image loader waits for further requests before
/// decoding.
pub const DEFAULT_LOADER_DEBOUNCE: Duration = Duration::from_millis(120);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read preset {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse preset: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid preset: {0}")]
    Invalid(String),
}

/// Texture sampling mode of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Filter {
    #[default]
    Nearest,
    Linear,
}

/// Which earlier dimension drives a stage's input or output size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeSource {
    /// The emulator core's native frame size.
    Source,
    /// The output of the previous stage (the native frame for stage 0).
    #[default]
    Previous,
    /// The letterboxed destination rectangle on the device.
    Device,
}

/// Output scale of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageScale {
    /// Integer multiple of the dimension chosen by the stage's scale type.
    Factor(u32),
    /// Render straight at the destination rectangle's size.
    Fill,
}

impl Default for StageScale {
    fn default() -> Self {
        Self::Factor(1)
    }
}

impl Serialize for StageScale {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            StageScale::Factor(factor) => serializer.serialize_u32(*factor),
            StageScale::Fill => serializer.serialize_str("fill"),
        }
    }
}

impl<'de> Deserialize<'de> for StageScale {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Helper {
            Str(String),
            Num(i64),
        }

        match Helper::deserialize(deserializer)? {
            Helper::Str(raw) => parse_scale(&raw).map_err(de::Error::custom),
            Helper::Num(value) => {
                if value < 0 || value > i64::from(u32::MAX) {
                    return Err(de::Error::custom(format!("invalid stage scale {value}")));
                }
                Ok(StageScale::Factor(value as u32))
            }
        }
    }
}

fn parse_scale(raw: &str) -> Result<StageScale, String> {
    let normalized = raw.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "fill" | "screen" | "device" => Ok(StageScale::Fill),
        other => other
            .strip_suffix('x')
            .unwrap_or(other)
            .parse::<u32>()
            .map(StageScale::Factor)
            .map_err(|_| format!("invalid stage scale '{raw}'")),
    }
}

/// Final upscale behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Sharpness {
    /// Nearest-neighbour final blit.
    Sharp,
    /// Integer nearest upscale into an intermediate target, then a linear blit.
    Crisp,
    /// Linear final blit.
    #[default]
    Soft,
}

/// Cosmetic pattern drawn over the game rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EffectKind {
    #[default]
    None,
    Line,
    Grid,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StagePreset {
    pub shader: PathBuf,
    #[serde(default)]
    pub scale: StageScale,
    #[serde(default)]
    pub filter: Filter,
    #[serde(default)]
    pub source: SizeSource,
    #[serde(default)]
    pub scale_type: SizeSource,
    #[serde(default)]
    pub parameters: BTreeMap<String, f32>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EffectPreset {
    #[serde(default)]
    pub kind: EffectKind,
    /// Fixed pattern scale; omit to follow the frame's on-screen scale.
    #[serde(default)]
    pub scale: Option<u32>,
    /// RGB565 tint for grid effects; 0 keeps the image's own colour.
    #[serde(default)]
    pub color: u16,
}

impl Default for EffectPreset {
    fn default() -> Self {
        Self {
            kind: EffectKind::None,
            scale: None,
            color: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct OverlayPreset {
    pub path: PathBuf,
    #[serde(default)]
    pub tag: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Preset {
    pub version: u32,
    #[serde(default)]
    pub sharpness: Sharpness,
    #[serde(default)]
    pub stage_count: Option<usize>,
    #[serde(
        default,
        deserialize_with = "deserialize_duration_opt",
        skip_serializing
    )]
    pub loader_debounce: Option<Duration>,
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default)]
    pub effects_dir: Option<PathBuf>,
    #[serde(default)]
    pub stages: Vec<StagePreset>,
    #[serde(default)]
    pub effect: EffectPreset,
    #[serde(default)]
    pub overlay: Option<OverlayPreset>,
    #[serde(skip)]
    base_dir: Option<PathBuf>,
}

fn deserialize_duration_opt<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    struct Visitor;
    impl<'de> de::Visitor<'de> for Visitor {
        type Value = Option<Duration>;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("a duration as number of milliseconds or human-readable string")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            humantime::parse_duration(v)
                .map(Some)
                .map_err(|err| E::custom(format!("invalid duration '{v}': {err}")))
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Some(Duration::from_millis(v)))
        }

        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v < 0 {
                return Err(E::custom("duration must be non-negative"));
            }
            Ok(Some(Duration::from_millis(v as u64)))
        }

        fn visit_none<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(None)
        }
    }

    deserializer.deserialize_any(Visitor)
}

impl Preset {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let raw: Preset = toml::from_str(input)?;
        raw.validate()?;
        Ok(raw)
    }

    /// Reads a preset from disk; relative paths (shaders, overlay, cache and
    /// effect directories) resolve against the preset's own directory.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut preset = Self::from_toml_str(&text)?;
        preset.base_dir = path.parent().map(Path::to_path_buf);
        Ok(preset)
    }

    /// Number of stages the compositor should run.
    pub fn active_stage_count(&self) -> usize {
        self.stage_count
            .unwrap_or(self.stages.len())
            .min(self.stages.len())
    }

    pub fn loader_debounce(&self) -> Duration {
        self.loader_debounce.unwrap_or(DEFAULT_LOADER_DEBOUNCE)
    }

    pub fn resolve_shader(&self, stage: &StagePreset) -> PathBuf {
        self.resolve(&stage.shader)
    }

    pub fn resolve_overlay(&self) -> Option<PathBuf> {
        self.overlay.as_ref().and_then(|overlay| {
            if overlay.path.as_os_str().is_empty() {
                None
            } else {
                Some(self.resolve(&overlay.path))
            }
        })
    }

    /// Program cache directory, relative to the preset file when loaded
    /// from disk.
    pub fn resolve_cache_dir(&self) -> Option<PathBuf> {
        self.cache_dir.as_deref().map(|dir| self.resolve(dir))
    }

    pub fn resolve_effects_dir(&self) -> Option<PathBuf> {
        self.effects_dir.as_deref().map(|dir| self.resolve(dir))
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != 1 {
            return Err(ConfigError::Invalid(format!(
                "unsupported preset version {}; expected 1",
                self.version
            )));
        }

        if self.stages.len() > MAX_STAGES {
            return Err(ConfigError::Invalid(format!(
                "preset defines {} stages; at most {MAX_STAGES} are supported",
                self.stages.len()
            )));
        }

        if let Some(count) = self.stage_count {
            if count > self.stages.len() {
                return Err(ConfigError::Invalid(format!(
                    "stage_count {count} exceeds the {} stages defined",
                    self.stages.len()
                )));
            }
        }

        for (index, stage) in self.stages.iter().enumerate() {
            if stage.shader.as_os_str().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "stage {index} must name a shader file"
                )));
            }
            if stage.scale == StageScale::Factor(0) {
                return Err(ConfigError::Invalid(format!(
                    "stage {index} scale must be at least 1"
                )));
            }
            for (name, value) in &stage.parameters {
                if !value.is_finite() {
                    return Err(ConfigError::Invalid(format!(
                        "stage {index} parameter '{name}' must be a finite number"
                    )));
                }
            }
        }

        if self.effect.scale == Some(0) {
            return Err(ConfigError::Invalid(
                "effect scale must be at least 1".into(),
            ));
        }

        Ok(())
    }
}
