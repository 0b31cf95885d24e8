// Backend module - driver registry and selection
//
// The registry is a fixed list ordered by preference: hardware APIs first,
// the CPU fallback last. Only the Vulkan and CPU drivers are compiled in;
// the other kinds exist so masks and formats round-trip, but never probe
// successfully.

pub mod soft;
#[cfg(feature = "vulkan")]
pub mod vulkan;

use std::sync::Arc;

use crate::config::PulseConfig;
use crate::debug::{DebugCallback, DebugSink};
use crate::device::{Device, DeviceImpl};
use crate::error::{Error, Result};
use crate::types::{BackendFlags, DebugLevel, ShaderFormats};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Vulkan,
    D3D11,
    OpenGL,
    OpenGLES,
    WebGPU,
    Software,
}

impl BackendKind {
    pub fn flag(self) -> BackendFlags {
        match self {
            BackendKind::Vulkan => BackendFlags::VULKAN,
            BackendKind::D3D11 => BackendFlags::D3D11,
            BackendKind::OpenGL => BackendFlags::OPENGL,
            BackendKind::OpenGLES => BackendFlags::OPENGL_ES,
            BackendKind::WebGPU => BackendFlags::WEBGPU,
            BackendKind::Software => BackendFlags::SOFTWARE,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Vulkan => "Vulkan",
            BackendKind::D3D11 => "D3D11",
            BackendKind::OpenGL => "OpenGL",
            BackendKind::OpenGLES => "OpenGL ES",
            BackendKind::WebGPU => "WebGPU",
            BackendKind::Software => "Software",
        }
    }
}

struct BackendDescriptor {
    kind: BackendKind,
    shader_formats: ShaderFormats,
    /// Whether the driver can actually create an instance on this machine
    probe: fn(&PulseConfig) -> bool,
}

fn not_compiled(_: &PulseConfig) -> bool {
    false
}

fn always(_: &PulseConfig) -> bool {
    true
}

#[cfg(feature = "vulkan")]
fn probe_vulkan(config: &PulseConfig) -> bool {
    vulkan::probe(config)
}

#[cfg(not(feature = "vulkan"))]
fn probe_vulkan(_: &PulseConfig) -> bool {
    false
}

// Ordered by default preference
const REGISTRY: &[BackendDescriptor] = &[
    BackendDescriptor {
        kind: BackendKind::Vulkan,
        shader_formats: ShaderFormats::SPIRV,
        probe: probe_vulkan,
    },
    BackendDescriptor {
        kind: BackendKind::D3D11,
        shader_formats: ShaderFormats::DXBC,
        probe: not_compiled,
    },
    BackendDescriptor {
        kind: BackendKind::OpenGL,
        shader_formats: ShaderFormats::GLSL,
        probe: not_compiled,
    },
    BackendDescriptor {
        kind: BackendKind::OpenGLES,
        shader_formats: ShaderFormats::GLSL,
        probe: not_compiled,
    },
    BackendDescriptor {
        kind: BackendKind::WebGPU,
        shader_formats: ShaderFormats::WGSL,
        probe: not_compiled,
    },
    BackendDescriptor {
        kind: BackendKind::Software,
        shader_formats: soft::SHADER_FORMATS,
        probe: always,
    },
];

fn descriptor(kind: BackendKind) -> &'static BackendDescriptor {
    // Every kind has exactly one registry entry
    REGISTRY
        .iter()
        .find(|d| d.kind == kind)
        .unwrap_or(&REGISTRY[REGISTRY.len() - 1])
}

fn select_with(candidates: BackendFlags, formats: ShaderFormats, config: &PulseConfig) -> Result<BackendKind> {
    if candidates.contains(BackendFlags::INVALID) {
        log::error!("Backend candidates contain the invalid flag");
        return Err(Error::InitializationFailed);
    }

    let mut format_mismatch = false;
    for entry in REGISTRY {
        if !candidates.contains(BackendFlags::ANY) && !candidates.contains(entry.kind.flag()) {
            continue;
        }
        if !formats.intersects(entry.shader_formats) {
            format_mismatch = true;
            continue;
        }
        if (entry.probe)(config) {
            return Ok(entry.kind);
        }
        log::debug!("{} backend is not usable on this machine", entry.kind.name());
    }

    if format_mismatch {
        Err(Error::BackendsCandidatesShaderFormatMismatch)
    } else {
        Err(Error::InitializationFailed)
    }
}

/// First registered backend selected by `candidates` that consumes one of
/// `formats` and works on this machine
pub fn select_backend(candidates: BackendFlags, formats: ShaderFormats) -> Result<BackendKind> {
    select_with(candidates, formats, &PulseConfig::default())
}

/// Whether `select_backend` would succeed
pub fn supports_backend(candidates: BackendFlags, formats: ShaderFormats) -> bool {
    select_backend(candidates, formats).is_ok()
}

enum BackendImpl {
    Soft,
    #[cfg(feature = "vulkan")]
    Vulkan(Arc<vulkan::instance::VulkanInstance>),
}

/// A loaded driver. Unloaded when dropped; devices created from it keep
/// what they need alive.
pub struct Backend {
    kind: BackendKind,
    shader_formats: ShaderFormats,
    sink: Arc<DebugSink>,
    config: PulseConfig,
    imp: BackendImpl,
}

impl Backend {
    pub fn load(candidates: BackendFlags, formats: ShaderFormats, debug_level: DebugLevel) -> Result<Self> {
        Self::load_inner(candidates, formats, debug_level, PulseConfig::default())
    }

    /// Load from the `[backend]` section of a config
    pub fn load_with_config(config: &PulseConfig) -> Result<Self> {
        Self::load_inner(
            config.candidate_mask(),
            config.shader_format_mask(),
            config.debug_level(),
            config.clone(),
        )
    }

    fn load_inner(
        candidates: BackendFlags,
        formats: ShaderFormats,
        debug_level: DebugLevel,
        config: PulseConfig,
    ) -> Result<Self> {
        let kind = select_with(candidates, formats, &config)?;
        let sink = Arc::new(DebugSink::new(debug_level));

        let imp = match kind {
            BackendKind::Software => BackendImpl::Soft,
            #[cfg(feature = "vulkan")]
            BackendKind::Vulkan => {
                let instance = vulkan::instance::VulkanInstance::new(&config, sink.clone()).map_err(|e| {
                    sink.error(format!("failed to load Vulkan backend: {:#}", e));
                    Error::InitializationFailed
                })?;
                BackendImpl::Vulkan(Arc::new(instance))
            }
            _ => return Err(Error::InitializationFailed),
        };

        log::info!("Loaded {} backend (debug level {:?})", kind.name(), debug_level);
        Ok(Self {
            kind,
            shader_formats: descriptor(kind).shader_formats,
            sink,
            config,
            imp,
        })
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn shader_formats(&self) -> ShaderFormats {
        self.shader_formats
    }

    pub fn debug_level(&self) -> DebugLevel {
        self.sink.level()
    }

    /// Replace the callback receiving this backend's diagnostics
    pub fn set_debug_callback(&self, callback: Option<DebugCallback>) {
        self.sink.set_callback(callback);
    }

    /// Create a device on the best adapter not used by any of `forbidden`
    pub fn create_device(&self, forbidden: &[&Device]) -> Result<Device> {
        let forbidden: Vec<u64> = forbidden
            .iter()
            .filter(|d| d.backend_in_use() == self.kind)
            .map(|d| d.adapter_id())
            .collect();

        let imp = match &self.imp {
            BackendImpl::Soft => DeviceImpl::Soft(soft::SoftDevice::new(self.sink.clone(), &self.config)?),
            #[cfg(feature = "vulkan")]
            BackendImpl::Vulkan(instance) => DeviceImpl::Vulkan(vulkan::VulkanDevice::new(
                instance.clone(),
                &forbidden,
                self.sink.clone(),
            )?),
        };
        if !forbidden.is_empty() && self.kind == BackendKind::Software {
            log::debug!("The CPU backend has a single adapter, forbidden devices are ignored");
        }

        Ok(Device::new(
            self.kind,
            self.shader_formats,
            self.sink.clone(),
            self.config.poll_interval(),
            self.config.default_timeout(),
            imp,
        ))
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        log::info!("Unloaded {} backend", self.kind.name());
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("kind", &self.kind)
            .field("shader_formats", &self.shader_formats)
            .field("sink", &self.sink)
            .finish()
    }
}
