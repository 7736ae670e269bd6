//! In-process native runtime: binding interface, option resolution,
//! lifecycle manager and model downloads

pub mod binding;
mod download;
mod manager;
pub mod options;

#[cfg(test)]
pub(crate) mod mock;

pub use download::{DownloadOutcome, ModelDownloader};
pub use manager::{Lifecycle, NativeRuntimeManager};
pub use options::{BuildMode, GpuBackend, GpuSetting, ResolvedOptions, RuntimeOptions, SetOptions};
