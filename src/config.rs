// Runtime configuration
//
// Loaded from a TOML file, then the OXR_* environment variables are
// layered on top. Every field has a default so an empty file is valid.
use crate::compositor::{XrError, XrResult};
use serde::Deserialize;
use strata::vk;
use utils::log::LogLevel;

use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Which presentation target to drive
#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    /// Direct mode if a display is found, otherwise headless
    #[default]
    Auto,
    Headless,
    /// A window surface handed to us by the host
    Window,
    Direct,
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ColorFormat {
    #[default]
    B8g8r8a8Srgb,
    B8g8r8a8Unorm,
    R8g8b8a8Srgb,
    R8g8b8a8Unorm,
    A2b10g10r10UnormPack32,
    R16g16b16a16Sfloat,
}

impl From<ColorFormat> for vk::Format {
    fn from(format: ColorFormat) -> Self {
        match format {
            ColorFormat::B8g8r8a8Srgb => vk::Format::B8G8R8A8_SRGB,
            ColorFormat::B8g8r8a8Unorm => vk::Format::B8G8R8A8_UNORM,
            ColorFormat::R8g8b8a8Srgb => vk::Format::R8G8B8A8_SRGB,
            ColorFormat::R8g8b8a8Unorm => vk::Format::R8G8B8A8_UNORM,
            ColorFormat::A2b10g10r10UnormPack32 => vk::Format::A2B10G10R10_UNORM_PACK32,
            ColorFormat::R16g16b16a16Sfloat => vk::Format::R16G16B16A16_SFLOAT,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ColorSpace {
    #[default]
    SrgbNonlinear,
    ExtendedSrgbLinear,
}

impl From<ColorSpace> for vk::ColorSpaceKHR {
    fn from(space: ColorSpace) -> Self {
        match space {
            ColorSpace::SrgbNonlinear => vk::ColorSpaceKHR::SRGB_NONLINEAR,
            ColorSpace::ExtendedSrgbLinear => vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PresentMode {
    Immediate,
    Mailbox,
    #[default]
    Fifo,
    FifoRelaxed,
}

impl From<PresentMode> for vk::PresentModeKHR {
    fn from(mode: PresentMode) -> Self {
        match mode {
            PresentMode::Immediate => vk::PresentModeKHR::IMMEDIATE,
            PresentMode::Mailbox => vk::PresentModeKHR::MAILBOX,
            PresentMode::Fifo => vk::PresentModeKHR::FIFO,
            PresentMode::FifoRelaxed => vk::PresentModeKHR::FIFO_RELAXED,
        }
    }
}

/// Preferred size of window targets
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PreferredSize {
    pub width: u32,
    pub height: u32,
}

impl Default for PreferredSize {
    fn default() -> Self {
        Self {
            width: 2880,
            height: 1600,
        }
    }
}

/// Replacement angles for the left eye's field of view, in radians
#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct FovOverride {
    pub left: Option<f32>,
    pub right: Option<f32>,
    pub up: Option<f32>,
    pub down: Option<f32>,
}

impl FovOverride {
    pub fn is_set(&self) -> bool {
        self.left.is_some() || self.right.is_some() || self.up.is_some() || self.down.is_some()
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub target: TargetKind,
    /// Composite and distort in one compute dispatch
    pub use_compute: bool,
    /// Reproject single projection layers to the latest head pose,
    /// only honored by the compute path
    pub use_timewarp: bool,
    /// Sampler budget of one compute dispatch
    pub max_layers_per_dispatch: u32,
    pub color_format: ColorFormat,
    pub color_space: ColorSpace,
    pub present_mode: PresentMode,
    pub preferred: PreferredSize,
    /// Scale of the scratch images relative to the view extents
    pub viewport_scale: f32,
    /// Used by the pacer until the display reports timings
    pub nominal_frame_interval_ns: i64,
    pub selected_gpu_index: Option<usize>,
    pub client_gpu_index: Option<usize>,
    /// Display mode used by direct mode targets
    pub desired_mode: Option<usize>,
    pub log_level: String,
    pub fullscreen: bool,
    /// List the modes of direct mode displays and exit
    pub print_modes: bool,
    pub validation: bool,
    /// Present one frame at startup even if no client connects
    pub do_warm_start: bool,
    /// Where the compiled SPIR-V shaders live
    pub shader_dir: PathBuf,

    pub debug_views: bool,
    pub debug_spaces: bool,
    pub debug_bindings: bool,
    pub lifecycle_verbose: bool,
    pub fov_override: FovOverride,
    /// Metres added to every head pose
    pub tracking_origin_offset: [f32; 3],
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target: TargetKind::Auto,
            use_compute: false,
            use_timewarp: false,
            max_layers_per_dispatch: strata::MAX_LAYERS as u32,
            color_format: ColorFormat::default(),
            color_space: ColorSpace::default(),
            present_mode: PresentMode::default(),
            preferred: PreferredSize::default(),
            viewport_scale: 1.0,
            nominal_frame_interval_ns: 16_666_667,
            selected_gpu_index: None,
            client_gpu_index: None,
            desired_mode: None,
            log_level: "info".to_string(),
            fullscreen: false,
            print_modes: false,
            validation: false,
            do_warm_start: true,
            shader_dir: PathBuf::from("shaders"),
            debug_views: false,
            debug_spaces: false,
            debug_bindings: false,
            lifecycle_verbose: false,
            fov_override: FovOverride::default(),
            tracking_origin_offset: [0.0; 3],
        }
    }
}

/// Accepts 1, true and on, anything else is false
fn parse_env_bool(val: &str) -> bool {
    matches!(val.trim().to_ascii_lowercase().as_str(), "1" | "true" | "on")
}

fn parse_env_f32(name: &str, val: &str) -> Option<f32> {
    match val.trim().parse::<f32>() {
        Ok(f) => Some(f),
        Err(_) => {
            utils::log::warn!("Ignoring {}={}, not a number", name, val);
            None
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(s)?;
        Ok(config)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Could not read {}: {}", path.display(), e))?;
        Self::from_toml_str(&contents)
    }

    /// Layer the OXR_* variables returned by `lookup` on top
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let flag = |name: &str, field: &mut bool| {
            if let Some(val) = lookup(name) {
                *field = parse_env_bool(&val);
            }
        };
        flag("OXR_DEBUG_VIEWS", &mut self.debug_views);
        flag("OXR_DEBUG_SPACES", &mut self.debug_spaces);
        flag("OXR_DEBUG_BINDINGS", &mut self.debug_bindings);
        flag("OXR_LIFECYCLE_VERBOSE", &mut self.lifecycle_verbose);

        let float = |name: &str| lookup(name).and_then(|v| parse_env_f32(name, &v));
        if let Some(f) = float("OXR_OVERRIDE_LFOV_LEFT") {
            self.fov_override.left = Some(f);
        }
        if let Some(f) = float("OXR_OVERRIDE_LFOV_RIGHT") {
            self.fov_override.right = Some(f);
        }
        if let Some(f) = float("OXR_OVERRIDE_LFOV_UP") {
            self.fov_override.up = Some(f);
        }
        if let Some(f) = float("OXR_OVERRIDE_LFOV_DOWN") {
            self.fov_override.down = Some(f);
        }

        for (i, axis) in ["X", "Y", "Z"].iter().enumerate() {
            if let Some(f) = float(&format!("OXR_TRACKING_ORIGIN_OFFSET_{}", axis)) {
                self.tracking_origin_offset[i] = f;
            }
        }
    }

    /// Apply the variables of this process
    pub fn apply_process_env(&mut self) {
        self.apply_env(|name| std::env::var(name).ok());
    }

    pub fn validate(&self) -> XrResult<()> {
        if !(self.viewport_scale > 0.0 && self.viewport_scale <= 1.0) {
            utils::log::error!(
                "viewport_scale must be in (0, 1], got {}",
                self.viewport_scale
            );
            return Err(XrError::INVALID);
        }
        if self.max_layers_per_dispatch == 0 {
            return Err(XrError::INVALID);
        }
        if self.nominal_frame_interval_ns <= 0 {
            return Err(XrError::INVALID);
        }
        Ok(())
    }

    pub fn log_level(&self) -> anyhow::Result<LogLevel> {
        LogLevel::from_str(&self.log_level)
    }

    pub fn target_create_info(&self, width: u32, height: u32) -> strata::TargetCreateInfo {
        let mut info = strata::TargetCreateInfo::new(width, height);
        info.format = self.color_format.into();
        info.color_space = self.color_space.into();
        info.present_mode = self.present_mode.into();
        info
    }

    /// Parameters for the renderer
    pub fn renderer_info(&self) -> strata::RendererCreateInfo {
        strata::RendererCreateInfo {
            use_compute: self.use_compute,
            use_timewarp: self.use_timewarp,
            max_layers: self.max_layers_per_dispatch,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.nominal_frame_interval_ns, 16_666_667);
        assert!(config.do_warm_start);
        assert_eq!(config.max_layers_per_dispatch, 16);
        assert_eq!(config.log_level().unwrap(), LogLevel::info);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn toml_values() {
        let config = Config::from_toml_str(
            r#"
            target = "headless"
            use_compute = true
            color_format = "r8g8b8a8_unorm"
            present_mode = "mailbox"
            desired_mode = 2
            log_level = "debug"

            [preferred]
            width = 1280
            "#,
        )
        .unwrap();

        assert_eq!(config.target, TargetKind::Headless);
        assert!(config.use_compute);
        assert_eq!(vk::Format::from(config.color_format), vk::Format::R8G8B8A8_UNORM);
        assert_eq!(
            vk::PresentModeKHR::from(config.present_mode),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(config.desired_mode, Some(2));
        assert_eq!(config.preferred.width, 1280);
        assert_eq!(config.preferred.height, 1600);
        assert_eq!(config.log_level().unwrap(), LogLevel::debug);
    }

    #[test]
    fn unknown_target_is_rejected() {
        assert!(Config::from_toml_str("target = \"hologram\"").is_err());
    }

    #[test]
    fn viewport_scale_range() {
        let mut config = Config::default();
        config.viewport_scale = 0.0;
        assert_eq!(config.validate(), Err(XrError::INVALID));
        config.viewport_scale = 1.5;
        assert_eq!(config.validate(), Err(XrError::INVALID));
        config.viewport_scale = 0.5;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn environment_overrides() {
        let vars: HashMap<&str, &str> = [
            ("OXR_DEBUG_VIEWS", "on"),
            ("OXR_DEBUG_SPACES", "0"),
            ("OXR_LIFECYCLE_VERBOSE", "TRUE"),
            ("OXR_OVERRIDE_LFOV_LEFT", "-0.5"),
            ("OXR_OVERRIDE_LFOV_UP", "not a number"),
            ("OXR_TRACKING_ORIGIN_OFFSET_Y", "1.6"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.debug_spaces = true;
        config.apply_env(|name| vars.get(name).map(|v| v.to_string()));

        assert!(config.debug_views);
        assert!(!config.debug_spaces);
        assert!(!config.debug_bindings);
        assert!(config.lifecycle_verbose);
        assert_eq!(config.fov_override.left, Some(-0.5));
        assert_eq!(config.fov_override.up, None);
        assert!(config.fov_override.is_set());
        assert_eq!(config.tracking_origin_offset, [0.0, 1.6, 0.0]);
    }
}
