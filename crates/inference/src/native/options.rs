//! Runtime option resolution for the native backend
//!
//! Every option follows the same precedence: explicit override, then the
//! `LLAMA_*` environment variables, then the default. GPU selection
//! defaults to auto-detection against the backends the binding reports.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::constants::env;

/// GPU backend the native runtime can be built against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpuBackend {
    Cuda,
    Vulkan,
    Metal,
}

/// Requested GPU mode before detection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpuSetting {
    Auto,
    /// CPU only
    Disabled,
    Cuda,
    Vulkan,
    Metal,
}

/// How the binding may (re)build its native code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildMode {
    Auto,
    Never,
    Try,
    ForceRebuild,
}

/// Partial overrides; `None` means "not set here"
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeOptions {
    pub gpu: Option<GpuSetting>,
    pub build: Option<BuildMode>,
    pub debug: Option<bool>,
    pub max_threads: Option<u32>,
}

impl RuntimeOptions {
    /// Overlay the fields set in `other`
    pub fn merge(&mut self, other: &RuntimeOptions) {
        if other.gpu.is_some() {
            self.gpu = other.gpu;
        }
        if other.build.is_some() {
            self.build = other.build;
        }
        if other.debug.is_some() {
            self.debug = other.debug;
        }
        if other.max_threads.is_some() {
            self.max_threads = other.max_threads;
        }
    }
}

/// Overrides plus an explicit request to rebuild the runtime
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SetOptions {
    #[serde(flatten)]
    pub options: RuntimeOptions,
    pub reinitialize: bool,
}

/// Options handed to the binding
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedOptions {
    /// `None` runs on the CPU
    pub gpu: Option<GpuBackend>,
    pub build: Option<BuildMode>,
    pub debug: bool,
    pub max_threads: Option<u32>,
}

/// Host platform, as far as GPU preference goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    MacOs,
    Other,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else {
            Platform::Other
        }
    }
}

/// Environment lookup, injectable for tests
pub type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

pub fn process_env() -> EnvLookup {
    Arc::new(|key: &str| std::env::var(key).ok())
}

/// Lookup that sees no variables at all
pub fn empty_env() -> EnvLookup {
    Arc::new(|_: &str| None)
}

fn env_value(lookup: &EnvLookup, key: &str) -> Option<String> {
    lookup(key)
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty())
}

fn is_booleanish_false(value: &str) -> bool {
    matches!(value, "false" | "off" | "none" | "disable" | "disabled")
}

/// GPU setting before detection
pub fn requested_gpu(overrides: &RuntimeOptions, lookup: &EnvLookup) -> GpuSetting {
    if let Some(gpu) = overrides.gpu {
        return gpu;
    }
    match env_value(lookup, env::GPU).as_deref() {
        Some(v) if is_booleanish_false(v) => GpuSetting::Disabled,
        Some("cuda") => GpuSetting::Cuda,
        Some("vulkan") => GpuSetting::Vulkan,
        Some("metal") => GpuSetting::Metal,
        _ => GpuSetting::Auto,
    }
}

/// Pick a backend from what the binding supports
pub fn detect_gpu(platform: Platform, supported: &[GpuBackend]) -> Option<GpuBackend> {
    let preference: &[GpuBackend] = match platform {
        Platform::MacOs => &[GpuBackend::Metal],
        Platform::Windows | Platform::Other => &[GpuBackend::Cuda, GpuBackend::Vulkan],
    };
    preference.iter().copied().find(|b| supported.contains(b))
}

/// Resolve everything except auto GPU detection, which needs the binding.
/// `supported` is only consulted when the GPU setting is `Auto`; `None`
/// means detection failed and falls back to the CPU.
pub fn resolve(
    overrides: &RuntimeOptions,
    lookup: &EnvLookup,
    platform: Platform,
    supported: Option<&[GpuBackend]>,
) -> ResolvedOptions {
    let gpu = match requested_gpu(overrides, lookup) {
        GpuSetting::Auto => supported.and_then(|s| detect_gpu(platform, s)),
        GpuSetting::Disabled => None,
        GpuSetting::Cuda => Some(GpuBackend::Cuda),
        GpuSetting::Vulkan => Some(GpuBackend::Vulkan),
        GpuSetting::Metal => Some(GpuBackend::Metal),
    };

    let build = overrides.build.or_else(|| {
        match env_value(lookup, env::BUILD).as_deref() {
            Some("auto") => Some(BuildMode::Auto),
            Some("never") => Some(BuildMode::Never),
            Some("try") => Some(BuildMode::Try),
            Some("forcerebuild") => Some(BuildMode::ForceRebuild),
            _ => None,
        }
    });

    let debug = overrides.debug.unwrap_or_else(|| {
        matches!(
            env_value(lookup, env::DEBUG).as_deref(),
            Some("1" | "true" | "yes")
        )
    });

    // Unparseable or negative values clamp to 0
    let max_threads = overrides.max_threads.or_else(|| {
        env_value(lookup, env::MAX_THREADS)
            .map(|v| v.parse::<i64>().unwrap_or(0).clamp(0, u32::MAX as i64) as u32)
    });

    ResolvedOptions {
        gpu,
        build,
        debug,
        max_threads,
    }
}
