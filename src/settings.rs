use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::renderer::device::AntiAliasMode;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderSettings {
    #[serde(default)]
    pub anti_alias: AntiAliasSetting,
    /// Ratio of the geometry/light stage resolution to the display
    /// resolution. Values below 1.0 shade fewer pixels than are displayed.
    #[serde(default = "RenderSettings::default_inferred_scale")]
    pub inferred_scale: f32,
    /// Requested supersampling factor, only used when `anti_alias` is
    /// `Ssaa`. Reduced automatically if the device cannot fit it.
    #[serde(default = "RenderSettings::default_ssaa_factor")]
    pub ssaa_factor: u32,
    #[serde(default)]
    pub resolution: Resolution,
    /// Clear all buffers to transparent when the scene is disabled
    /// instead of leaving stale frames behind.
    #[serde(default)]
    pub clear_when_disabled: bool,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            anti_alias: AntiAliasSetting::default(),
            inferred_scale: Self::default_inferred_scale(),
            ssaa_factor: Self::default_ssaa_factor(),
            resolution: Resolution::default(),
            clear_when_disabled: false,
        }
    }
}

impl RenderSettings {
    pub fn load_from_path<P: AsRef<std::path::Path>>(path: P) -> Self {
        use std::fs;

        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<RenderSettings>(&contents) {
                Ok(settings) => {
                    info!("Loaded render settings from {:?}", path);
                    settings.validate()
                }
                Err(err) => {
                    warn!(
                        "Failed to parse {:?} ({}). Falling back to default render settings.",
                        path, err
                    );
                    RenderSettings::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(
                    "Render settings file {:?} not found. Using default settings.",
                    path
                );
                RenderSettings::default()
            }
            Err(err) => {
                warn!(
                    "Failed to read {:?} ({}). Falling back to default render settings.",
                    path, err
                );
                RenderSettings::default()
            }
        }
    }

    pub fn validate(mut self) -> Self {
        if !self.inferred_scale.is_finite() || self.inferred_scale <= 0.0 {
            warn!(
                "Inferred scale {} is not usable. Using {} instead.",
                self.inferred_scale,
                Self::default_inferred_scale()
            );
            self.inferred_scale = Self::default_inferred_scale();
        }

        if self.ssaa_factor < 2 || !self.ssaa_factor.is_power_of_two() {
            warn!(
                "SSAA factor {} must be a power of two >= 2. Using {} instead.",
                self.ssaa_factor,
                Self::default_ssaa_factor()
            );
            self.ssaa_factor = Self::default_ssaa_factor();
        }

        if self.resolution.width == 0 || self.resolution.height == 0 {
            warn!("Resolution must be greater than zero. Using default resolution.");
            self.resolution = Resolution::default();
        }

        self
    }

    pub fn anti_alias_mode(&self) -> AntiAliasMode {
        match self.anti_alias {
            AntiAliasSetting::Off => AntiAliasMode::None,
            AntiAliasSetting::Msaa => AntiAliasMode::Msaa,
            AntiAliasSetting::Fxaa => AntiAliasMode::Fxaa,
            AntiAliasSetting::Ssaa => AntiAliasMode::Ssaa,
        }
    }

    const fn default_inferred_scale() -> f32 {
        1.0
    }

    const fn default_ssaa_factor() -> u32 {
        2
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Default for Resolution {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AntiAliasSetting {
    Off,
    Msaa,
    #[default]
    Fxaa,
    Ssaa,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invalid_settings() -> RenderSettings {
        RenderSettings {
            anti_alias: AntiAliasSetting::Ssaa,
            inferred_scale: 0.0,
            ssaa_factor: 3,
            resolution: Resolution {
                width: 0,
                height: 0,
            },
            clear_when_disabled: false,
        }
    }

    #[test]
    fn validate_replaces_invalid_values_with_defaults() {
        let validated = invalid_settings().validate();

        assert_eq!(validated.inferred_scale, 1.0);
        assert_eq!(validated.ssaa_factor, 2);
        assert_eq!(validated.resolution.width, Resolution::default().width);
        assert_eq!(validated.resolution.height, Resolution::default().height);
        // The AA mode itself is preserved; only the factor is repaired.
        assert_eq!(validated.anti_alias, AntiAliasSetting::Ssaa);
    }

    #[test]
    fn validate_preserves_valid_values() {
        let valid = RenderSettings {
            anti_alias: AntiAliasSetting::Msaa,
            inferred_scale: 0.5,
            ssaa_factor: 4,
            resolution: Resolution {
                width: 1920,
                height: 1080,
            },
            clear_when_disabled: true,
        };

        let validated = valid.clone().validate();

        assert_eq!(validated.inferred_scale, valid.inferred_scale);
        assert_eq!(validated.ssaa_factor, valid.ssaa_factor);
        assert_eq!(validated.resolution.width, valid.resolution.width);
        assert!(validated.clear_when_disabled);
    }

    #[test]
    fn nonfinite_scale_is_rejected() {
        let settings = RenderSettings {
            inferred_scale: f32::NAN,
            ..RenderSettings::default()
        };
        assert_eq!(settings.validate().inferred_scale, 1.0);
    }
}
