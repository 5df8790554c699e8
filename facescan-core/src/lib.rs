pub mod batch;
pub mod config;
pub mod detection;
pub mod enhance;
pub mod pipeline;
pub mod rendering;
pub mod report;
pub mod runtime;
pub mod stats;
pub mod video;

// Re-export the top-level error type so callers only need `facescan_core::Error`
pub use anyhow::Error;
pub use anyhow::Result;
