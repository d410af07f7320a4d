//! Logging initialization and configuration.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the logging system with tracing.
///
/// This sets up tracing-subscriber with:
/// - Environment-based filtering (RUST_LOG)
/// - Target and thread id output, since secondary command lists may be
///   recorded on worker threads
///
/// Calling this more than once is harmless; later calls are ignored.
///
/// # Example
/// ```
/// vkframe_core::init_logging();
/// tracing::info!("Backend initialized");
/// ```
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,vkframe_rhi=debug,gpu_allocator=warn"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .try_init();
}
