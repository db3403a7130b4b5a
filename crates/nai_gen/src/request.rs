use serde::{Deserialize, Serialize};
use std::fmt::Display;

use crate::{GenError, Result};

/// Tags appended to the prompt by [`GenerateRequest::with_quality_tags`]
pub const QUALITY_TAGS: &str = "best quality, amazing quality, very aesthetic, absurdres";

/// Fallback size when neither explicit dimensions nor a preset are given
pub const DEFAULT_DIMENSIONS: Dimensions = Dimensions {
    width: 1024,
    height: 1024,
};

/// A generation request as the server expects it. Built once, never mutated
/// after it has been handed to a client.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct GenerateRequest {
    prompt: String,
    neg_prompt: String,
    seed: i64,
    scale: f64,
    width: u32,
    height: u32,
    steps: u32,
    sampler: Sampler,
    schedule: Schedule,
    smea: bool,
    r#dyn: bool,
    quality_toggle: bool,
    dyn_threshold: bool,
    cfg_rescale: f64,
    img_sub_folder: String,
    extra_infos: String,
}

impl Default for GenerateRequest {
    fn default() -> Self {
        Self::new(String::new())
    }
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            neg_prompt: String::new(),
            seed: -1,
            scale: 5.0,
            width: DEFAULT_DIMENSIONS.width,
            height: DEFAULT_DIMENSIONS.height,
            steps: 28,
            sampler: Sampler::KEuler,
            schedule: Schedule::Native,
            smea: false,
            r#dyn: false,
            quality_toggle: false,
            dyn_threshold: false,
            cfg_rescale: 0.0,
            img_sub_folder: String::new(),
            extra_infos: String::new(),
        }
    }

    pub fn update_negative_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.neg_prompt = prompt.into();
        self
    }

    /// -1 leaves picking a seed to the server
    pub fn update_seed(mut self, seed: i64) -> Self {
        self.seed = seed;
        self
    }

    pub fn update_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    pub fn update_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn update_dimensions(self, dimensions: Dimensions) -> Self {
        self.update_size(dimensions.width, dimensions.height)
    }

    pub fn update_steps(mut self, steps: u32) -> Self {
        self.steps = steps;
        self
    }

    pub fn update_sampler(mut self, sampler: Sampler) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn update_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn update_smea(mut self, smea: bool) -> Self {
        self.smea = smea;
        self
    }

    pub fn update_dyn(mut self, dyn_: bool) -> Self {
        self.r#dyn = dyn_;
        self
    }

    pub fn update_dyn_threshold(mut self, dyn_threshold: bool) -> Self {
        self.dyn_threshold = dyn_threshold;
        self
    }

    pub fn update_quality_toggle(mut self, quality_toggle: bool) -> Self {
        self.quality_toggle = quality_toggle;
        self
    }

    pub fn update_cfg_rescale(mut self, cfg_rescale: f64) -> Self {
        self.cfg_rescale = cfg_rescale;
        self
    }

    /// Raw JSON object string passed to the server as a side channel
    pub fn update_extra_infos(mut self, extra_infos: impl Into<String>) -> Self {
        self.extra_infos = extra_infos.into();
        self
    }

    /// Appends [`QUALITY_TAGS`] to the prompt
    pub fn with_quality_tags(mut self) -> Self {
        self.prompt = format!("{}, {}", self.prompt, QUALITY_TAGS);
        self
    }

    /// Prefixes the negative prompt with the preset's tags
    pub fn with_uc_preset(mut self, preset: UcPreset) -> Self {
        self.neg_prompt = format!("{}, {}", preset.tags(), self.neg_prompt);
        self
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn negative_prompt(&self) -> &str {
        &self.neg_prompt
    }

    pub fn seed(&self) -> i64 {
        self.seed
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn dimensions(&self) -> Dimensions {
        Dimensions {
            width: self.width,
            height: self.height,
        }
    }

    pub fn steps(&self) -> u32 {
        self.steps
    }

    pub fn sampler(&self) -> Sampler {
        self.sampler
    }

    pub fn schedule(&self) -> Schedule {
        self.schedule
    }

    pub fn smea(&self) -> bool {
        self.smea
    }

    pub fn dyn_(&self) -> bool {
        self.r#dyn
    }

    pub fn dyn_threshold(&self) -> bool {
        self.dyn_threshold
    }

    pub fn quality_toggle(&self) -> bool {
        self.quality_toggle
    }

    pub fn cfg_rescale(&self) -> f64 {
        self.cfg_rescale
    }

    pub fn extra_infos(&self) -> &str {
        &self.extra_infos
    }

    /// Checks the numeric fields. Enumerated fields are valid by construction.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(GenError::InvalidParameter("width and height must be positive"));
        }
        if self.steps == 0 {
            return Err(GenError::InvalidParameter("steps must be positive"));
        }
        if !self.scale.is_finite() || self.scale <= 0.0 {
            return Err(GenError::InvalidParameter("scale must be a positive number"));
        }
        if !self.cfg_rescale.is_finite() {
            return Err(GenError::InvalidParameter("cfg rescale must be a number"));
        }
        Ok(())
    }

    /// Whether the request stays inside the free generation tier
    pub fn is_free(&self) -> bool {
        u64::from(self.width) * u64::from(self.height) <= 1024 * 1024 && self.steps <= 28
    }
}

/// The samplers the server accepts
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Sampler {
    #[default]
    #[serde(rename = "k_euler")]
    KEuler,
    #[serde(rename = "k_euler_ancestral")]
    KEulerAncestral,
    #[serde(rename = "k_dpmpp_2s_ancestral")]
    KDpmpp2sAncestral,
    #[serde(rename = "k_dpmpp_2m")]
    KDpmpp2m,
    #[serde(rename = "k_dpmpp_sde")]
    KDpmppSde,
    #[serde(rename = "ddim_v3")]
    DdimV3,
}

impl Sampler {
    pub const ALL: [Sampler; 6] = [
        Self::KEuler,
        Self::KEulerAncestral,
        Self::KDpmpp2sAncestral,
        Self::KDpmpp2m,
        Self::KDpmppSde,
        Self::DdimV3,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::KEuler => "k_euler",
            Self::KEulerAncestral => "k_euler_ancestral",
            Self::KDpmpp2sAncestral => "k_dpmpp_2s_ancestral",
            Self::KDpmpp2m => "k_dpmpp_2m",
            Self::KDpmppSde => "k_dpmpp_sde",
            Self::DdimV3 => "ddim_v3",
        }
    }

    /// The name image viewers use for this sampler in generation captions
    pub fn caption_label(&self) -> &'static str {
        match self {
            Self::KEuler => "Euler",
            Self::KEulerAncestral => "Euler a",
            Self::KDpmpp2sAncestral => "DPM++ 2S a",
            Self::KDpmpp2m => "DPM++ 2M",
            Self::KDpmppSde => "DPM++ SDE",
            Self::DdimV3 => "DDIM",
        }
    }
}

impl Display for Sampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for Sampler {
    type Error = GenError;

    fn try_from(value: &str) -> std::result::Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|s| s.as_str() == value)
            .ok_or_else(|| GenError::InvalidSampler(value.to_string()))
    }
}

impl TryFrom<String> for Sampler {
    type Error = GenError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.as_str().try_into()
    }
}

#[cfg(feature = "clap")]
impl clap::ValueEnum for Sampler {
    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        Some(clap::builder::PossibleValue::new(self.as_str()))
    }

    fn value_variants<'a>() -> &'a [Self] {
        &Self::ALL
    }
}

/// The noise schedules the server accepts
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Schedule {
    #[default]
    Native,
    Karras,
    Exponential,
    Polyexponential,
}

impl Schedule {
    pub const ALL: [Schedule; 4] = [
        Self::Native,
        Self::Karras,
        Self::Exponential,
        Self::Polyexponential,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::Karras => "karras",
            Self::Exponential => "exponential",
            Self::Polyexponential => "polyexponential",
        }
    }
}

impl Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for Schedule {
    type Error = GenError;

    fn try_from(value: &str) -> std::result::Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|s| s.as_str() == value)
            .ok_or_else(|| GenError::InvalidSchedule(value.to_string()))
    }
}

impl TryFrom<String> for Schedule {
    type Error = GenError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.as_str().try_into()
    }
}

#[cfg(feature = "clap")]
impl clap::ValueEnum for Schedule {
    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        Some(clap::builder::PossibleValue::new(self.as_str()))
    }

    fn value_variants<'a>() -> &'a [Self] {
        &Self::ALL
    }
}

/// Negative prompt presets prepended to the user's negative prompt
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UcPreset {
    Heavy,
    Light,
    None,
}

impl UcPreset {
    pub fn tags(&self) -> &'static str {
        match self {
            Self::Heavy => concat!(
                "lowres, {bad}, error, fewer, extra, missing, worst quality, jpeg artifacts, ",
                "bad quality, watermark, unfinished, displeasing, chromatic aberration, signature, ",
                "extra digits, artistic error, username, scan, [abstract]"
            ),
            Self::Light => "lowres, jpeg artifacts, worst quality, watermark, blurry, very displeasing",
            Self::None => "lowres",
        }
    }
}

impl Display for UcPreset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Heavy => write!(f, "Heavy"),
            Self::Light => write!(f, "Light"),
            Self::None => write!(f, "None"),
        }
    }
}

impl TryFrom<String> for UcPreset {
    type Error = GenError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        match value.as_str() {
            "Heavy" => Ok(Self::Heavy),
            "Light" => Ok(Self::Light),
            "None" => Ok(Self::None),
            _ => Err(GenError::InvalidUcPreset(value)),
        }
    }
}

/// Aspect ratio presets, each mapped to a fixed pixel size
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AspectRatio {
    #[cfg_attr(feature = "clap", value(name = "h"))]
    Horizontal,
    #[cfg_attr(feature = "clap", value(name = "v"))]
    Vertical,
    #[cfg_attr(feature = "clap", value(name = "u"))]
    UltraWide,
    #[cfg_attr(feature = "clap", value(name = "t"))]
    UltraTall,
    #[cfg_attr(feature = "clap", value(name = "s"))]
    Square,
}

impl AspectRatio {
    pub fn dimensions(&self) -> Dimensions {
        let (width, height) = match self {
            Self::Horizontal => (1216, 832),
            Self::Vertical => (832, 1216),
            Self::UltraWide => (1472, 704),
            Self::UltraTall => (704, 1472),
            Self::Square => (1024, 1024),
        };
        Dimensions { width, height }
    }
}

impl Display for AspectRatio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Horizontal => write!(f, "Horizontal"),
            Self::Vertical => write!(f, "Vertical"),
            Self::UltraWide => write!(f, "UltraWide"),
            Self::UltraTall => write!(f, "UltraTall"),
            Self::Square => write!(f, "Square"),
        }
    }
}

impl TryFrom<&str> for AspectRatio {
    type Error = GenError;

    fn try_from(value: &str) -> std::result::Result<Self, Self::Error> {
        match value {
            "h" => Ok(Self::Horizontal),
            "v" => Ok(Self::Vertical),
            "u" => Ok(Self::UltraWide),
            "t" => Ok(Self::UltraTall),
            "s" => Ok(Self::Square),
            _ => Err(GenError::InvalidAspectRatio(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Display for Dimensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Picks the final image size. An explicit width or height always beats the
/// preset on its axis. Whatever is still missing afterwards falls back to
/// [`DEFAULT_DIMENSIONS`] as a whole.
pub fn resolve_dimensions(
    width: Option<u32>,
    height: Option<u32>,
    ar: Option<AspectRatio>,
) -> Dimensions {
    let (width, height) = match ar {
        Some(ar) => {
            let preset = ar.dimensions();
            if width.is_some() || height.is_some() {
                tracing::warn!(
                    "explicit width/height given, they take precedence over aspect ratio {ar}"
                );
            } else {
                tracing::info!("using aspect ratio {ar} ({preset})");
            }
            (
                Some(width.unwrap_or(preset.width)),
                Some(height.unwrap_or(preset.height)),
            )
        }
        None => (width, height),
    };

    match (width, height) {
        (Some(width), Some(height)) => Dimensions { width, height },
        _ => {
            tracing::warn!("width or height is not specified, using default {DEFAULT_DIMENSIONS}");
            DEFAULT_DIMENSIONS
        }
    }
}
