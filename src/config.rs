// =============================================================================
// CONFIGURATION - Load runtime settings from pulse.toml
// =============================================================================
//
// Backend choice, debug level and executor/fence tuning can be set without
// recompiling. Missing files or sections fall back to defaults.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::types::{BackendFlags, DebugLevel, ShaderFormats};

/// Default file looked up by `PulseConfig::load`
pub const CONFIG_FILE: &str = "pulse.toml";

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PulseConfig {
    pub backend: BackendConfig,
    pub software: SoftwareConfig,
    pub fence: FenceConfig,
    pub vulkan: VulkanConfig,
}

/// Backend selection
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Names out of: any, vulkan, d3d11, opengl, opengl_es, webgpu, software
    pub candidates: Vec<String>,
    /// Names out of: spirv, dxbc, wgsl, glsl
    pub shader_formats: Vec<String>,
    /// none, low, high or paranoid
    pub debug_level: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            candidates: vec!["any".to_string()],
            shader_formats: vec!["spirv".to_string()],
            debug_level: "low".to_string(),
        }
    }
}

/// CPU fallback executor
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SoftwareConfig {
    /// Worker threads for dispatches, 0 means one per hardware thread
    pub worker_threads: usize,
}

/// Fence polling
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FenceConfig {
    /// Sleep between polls when no native blocking wait exists
    pub poll_interval_us: u64,
    /// Timeout used by `Device::wait_for_fences_default`
    pub default_timeout_ms: u64,
}

impl Default for FenceConfig {
    fn default() -> Self {
        Self {
            poll_interval_us: 100,
            default_timeout_ms: 10_000,
        }
    }
}

/// Vulkan driver settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VulkanConfig {
    pub application_name: String,
    /// Only honoured when the debug level is high or paranoid
    pub validation_layers: bool,
}

impl Default for VulkanConfig {
    fn default() -> Self {
        Self {
            application_name: "Pulse".to_string(),
            validation_layers: true,
        }
    }
}

impl PulseConfig {
    /// Load configuration from pulse.toml, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path(CONFIG_FILE).unwrap_or_else(|e| {
            log::warn!("Failed to load {}: {:#}. Using defaults.", CONFIG_FILE, e);
            PulseConfig::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(PulseConfig::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Candidate mask built from `backend.candidates`
    pub fn candidate_mask(&self) -> BackendFlags {
        let mut mask = BackendFlags::empty();
        for name in &self.backend.candidates {
            match name.to_lowercase().as_str() {
                "any" => mask |= BackendFlags::ANY,
                "vulkan" => mask |= BackendFlags::VULKAN,
                "d3d11" => mask |= BackendFlags::D3D11,
                "opengl" => mask |= BackendFlags::OPENGL,
                "opengl_es" | "opengles" => mask |= BackendFlags::OPENGL_ES,
                "webgpu" => mask |= BackendFlags::WEBGPU,
                "software" | "soft" | "cpu" => mask |= BackendFlags::SOFTWARE,
                other => log::warn!("Unknown backend '{}' in config, ignoring", other),
            }
        }
        if mask.is_empty() {
            BackendFlags::ANY
        } else {
            mask
        }
    }

    pub fn shader_format_mask(&self) -> ShaderFormats {
        let mut mask = ShaderFormats::empty();
        for name in &self.backend.shader_formats {
            match name.to_lowercase().as_str() {
                "spirv" | "spv" => mask |= ShaderFormats::SPIRV,
                "dxbc" => mask |= ShaderFormats::DXBC,
                "wgsl" => mask |= ShaderFormats::WGSL,
                "glsl" => mask |= ShaderFormats::GLSL,
                other => log::warn!("Unknown shader format '{}' in config, ignoring", other),
            }
        }
        mask
    }

    pub fn debug_level(&self) -> DebugLevel {
        match self.backend.debug_level.to_lowercase().as_str() {
            "none" | "no_debug" | "off" => DebugLevel::NoDebug,
            "low" => DebugLevel::Low,
            "high" => DebugLevel::High,
            "paranoid" => DebugLevel::Paranoid,
            other => {
                log::warn!("Unknown debug level '{}', defaulting to low", other);
                DebugLevel::Low
            }
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.fence.poll_interval_us.max(1))
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.fence.default_timeout_ms)
    }

    /// Resolved worker thread count for the CPU executor
    pub fn worker_threads(&self) -> usize {
        if self.software.worker_threads > 0 {
            return self.software.worker_threads;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_select_any_backend_with_spirv() {
        let config = PulseConfig::default();
        assert_eq!(config.candidate_mask(), BackendFlags::ANY);
        assert_eq!(config.shader_format_mask(), ShaderFormats::SPIRV);
        assert_eq!(config.debug_level(), DebugLevel::Low);
        assert!(config.worker_threads() >= 1);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config = PulseConfig::from_toml(
            r#"
            [backend]
            candidates = ["software", "vulkan"]
            debug_level = "paranoid"

            [software]
            worker_threads = 3
            "#,
        )
        .unwrap();
        assert_eq!(
            config.candidate_mask(),
            BackendFlags::SOFTWARE | BackendFlags::VULKAN
        );
        assert_eq!(config.debug_level(), DebugLevel::Paranoid);
        assert_eq!(config.worker_threads(), 3);
        assert_eq!(config.fence.poll_interval_us, 100);
        assert_eq!(config.vulkan.application_name, "Pulse");
    }

    #[test]
    fn missing_file_gives_defaults() {
        let config = PulseConfig::load_from_path("definitely/not/here/pulse.toml").unwrap();
        assert_eq!(config.backend.candidates, vec!["any".to_string()]);
    }

    #[test]
    fn malformed_file_is_an_error() {
        assert!(PulseConfig::from_toml("[backend\ncandidates = 3").is_err());
    }
}
