//! Worker-hosted WebGPU engine: engine primitive traits, init-progress
//! normalisation and the lifecycle adapter

mod adapter;
pub mod engine;
pub mod progress;

pub use adapter::BrowserEngineAdapter;
pub use engine::{BrowserEngineHost, EngineError, WorkerEngine};
