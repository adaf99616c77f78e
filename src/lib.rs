//! Asynchronous layer drawing.
//!
//! Drawing layers render their contents either inline or on a worker pool.
//! Background results are delivered back to the coordinating thread in
//! batches: every async request becomes a [`Transaction`] queued on a
//! [`TransactionGroup`], and the group commits when the thread's [`RunLoop`]
//! reaches one of its observed phases. A per-layer generation counter makes
//! newer requests silently supersede older ones, so only the latest drawing
//! is ever presented.
//!
//! ```ignore
//! use drawlayer::prelude::*;
//!
//! drawlayer::init(SchedulerConfig::new().worker_threads(4))?;
//!
//! let layer = DrawingLayer::new();
//! layer.set_bounds(Size::new(64.0, 64.0));
//! layer.set_delegate(Some(delegate));
//!
//! // Resizing marked the layer; the main group displays marked layers and
//! // commits before the loop goes to sleep
//! RunLoop::current()?.run_once(None)?;
//! ```

pub mod config;
pub mod drawing_layer;
pub mod error;
pub mod generation;
pub mod geometry;
pub mod run_loop;
pub mod transaction;
pub mod tree;

mod worker;

pub use config::SchedulerConfig;
pub use drawing_layer::{
    display_marked_layers, Contents, DrawingDelegate, DrawingLayer, DrawingMode, DrawingParameter,
};
pub use error::{Error, Result};
pub use generation::GenerationCounter;
pub use run_loop::{LoopPhase, LoopWaker, ObserverId, PhaseObserver, RunLoop};
pub use transaction::{Transaction, TransactionGroup, TransactionState};
pub use tree::{AsLayer, Layer, LayerId};

pub mod prelude {
    pub use crate::drawing_layer::{DrawingDelegate, DrawingLayer, DrawingMode, DrawingParameter};
    pub use crate::geometry::{make_rect, ContentsGravity, Orientation, Rect, Size};
    pub use crate::run_loop::{LoopPhase, RunLoop};
    pub use crate::transaction::{Transaction, TransactionGroup};
    pub use crate::tree::{AsLayer, Layer};
    pub use crate::SchedulerConfig;
}

/// Configure the worker pool and the default commit phases.
///
/// Must run before the first asynchronous draw; later calls fail with
/// [`Error::WorkerPoolInitialized`]. Without it, producers run on rayon's
/// global pool and main groups commit on `BEFORE_WAITING | EXIT`.
pub fn init(config: SchedulerConfig) -> Result<()> {
    worker::install_pool(&config)?;
    config::set_commit_phases(config.commit_phases);
    Ok(())
}
