//! Progress-callback trait for per-document batch events.
//!
//! Inject an [`Arc<dyn BatchProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to receive
//! events as the batch moves through its documents. The CLI drives its
//! progress bar from these; a host application can forward them anywhere.
//!
//! # Example
//!
//! ```rust
//! use diploma_stamp::{BatchProgressCallback, ReasonCode};
//! use std::path::Path;
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct RejectCounter(AtomicUsize);
//!
//! impl BatchProgressCallback for RejectCounter {
//!     fn on_document_rejected(&self, _index: usize, path: &Path, reason: ReasonCode, _msg: &str) {
//!         self.0.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("{}: {}", path.display(), reason);
//!     }
//! }
//!
//! let cb: Arc<dyn BatchProgressCallback> = Arc::new(RejectCounter(AtomicUsize::new(0)));
//! ```

use crate::error::ReasonCode;
use crate::output::BatchStats;
use std::path::Path;
use std::sync::Arc;

/// Called by the batch runner as documents start and finish.
///
/// All methods default to no-ops. Documents run concurrently, so
/// `on_document_*` may be called from several tasks at once; protect any
/// shared state with `Mutex` or atomics.
pub trait BatchProgressCallback: Send + Sync {
    /// Called once before any document is dispatched.
    fn on_batch_start(&self, total: usize) {
        let _ = total;
    }

    /// `index` is the job's 0-based position in the submitted list.
    fn on_document_start(&self, index: usize, path: &Path) {
        let _ = (index, path);
    }

    fn on_document_stamped(&self, index: usize, path: &Path, output: &Path) {
        let _ = (index, path, output);
    }

    fn on_document_rejected(&self, index: usize, path: &Path, reason: ReasonCode, message: &str) {
        let _ = (index, path, reason, message);
    }

    /// Called once after the last in-flight document finishes.
    fn on_batch_complete(&self, stats: &BatchStats) {
        let _ = stats;
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl BatchProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn BatchProgressCallback>;
