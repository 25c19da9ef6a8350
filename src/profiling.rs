//! Feature-gated profiling support via `tracing-chrome`.
//!
//! With the `profiling` feature, [`init`] installs a Chrome trace subscriber
//! writing to the given file. Generation steps, prefill, sampling filters and
//! SNAC decoding each get their own span. Open the result in
//! `chrome://tracing` or [Perfetto](https://ui.perfetto.dev).
//!
//! Without the feature, [`init`] returns `None` and does nothing.

use std::path::Path;

/// Guard that flushes the trace file on drop.
///
/// Hold this in `main()`; the trace is written when the guard is dropped.
#[cfg(feature = "profiling")]
pub struct ProfilingGuard {
    _guard: tracing_chrome::FlushGuard,
}

/// Placeholder guard when profiling is compiled out.
#[cfg(not(feature = "profiling"))]
pub struct ProfilingGuard;

/// Initialize the Chrome tracing layer writing to `path`.
///
/// Returns `Some(guard)` when the `profiling` feature is active, `None`
/// otherwise. The caller must hold the guard until the end of the program.
///
/// ```rust,ignore
/// let _guard = orpheus_tts::profiling::init("trace.json");
/// ```
pub fn init<P: AsRef<Path>>(path: P) -> Option<ProfilingGuard> {
    #[cfg(feature = "profiling")]
    {
        use tracing_chrome::ChromeLayerBuilder;
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;

        let path = path.as_ref();
        let (chrome_layer, guard) = ChromeLayerBuilder::new()
            .file(path)
            .include_args(true)
            .build();

        tracing_subscriber::registry().with(chrome_layer).init();

        tracing::info!("Profiling enabled, trace will be written to {}", path.display());
        Some(ProfilingGuard { _guard: guard })
    }

    #[cfg(not(feature = "profiling"))]
    {
        let _ = path;
        None
    }
}
