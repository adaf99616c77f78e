//! Layers that render their contents synchronously or in the background.
//!
//! A [`DrawingLayer`] turns every display request into either an inline draw
//! on the coordinating thread or a [`Transaction`] whose producer renders on a
//! worker. Each request bumps the layer's generation counter first, which
//! silently invalidates anything still in flight for the same layer: the
//! producer checks the generation before and after drawing, and the
//! completion checks it once more before presenting.
//!
//! Layers marked with [`DrawingLayer::set_needs_display`] are redrawn by
//! [`display_marked_layers`], which every observed transaction group runs
//! right before it commits.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::sync::Arc;

use image::RgbaImage;

use crate::generation::GenerationCounter;
use crate::geometry::{Rect, Size};
use crate::transaction::{Transaction, TransactionGroup};
use crate::tree::{release_layer, with_layer_tree, with_layer_tree_mut, AsLayer, LayerId};

/// The bitmap presented by a drawing layer.
pub type Contents = Arc<RgbaImage>;

/// Opaque per-request state handed from the coordinating thread to `draw`.
pub type DrawingParameter = Arc<dyn Any + Send + Sync>;

/// How a drawing layer renders its contents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DrawingMode {
    /// Draw inline on the coordinating thread
    Sync,
    /// Draw on a worker and present at the next commit
    Async,
    /// Async, unless the nearest drawing ancestor is itself async or auto.
    /// In that case the ancestor's pass is already off the hot path and this
    /// layer draws inline.
    #[default]
    Auto,
}

/// The rendering backend of a drawing layer.
pub trait DrawingDelegate: Send + Sync {
    /// Snapshot the state `draw` needs. Called on the coordinating thread.
    fn drawing_parameter(&self) -> Option<DrawingParameter> {
        None
    }

    /// Render `rect` (in points) into `target`, which is `rect` scaled by
    /// `scale` and rounded up to whole pixels.
    ///
    /// `asynchronous` tells whether this runs on a worker thread.
    fn draw(
        &self,
        rect: Rect,
        target: &mut RgbaImage,
        scale: f32,
        flipped: bool,
        parameter: Option<&DrawingParameter>,
        asynchronous: bool,
    );
}

thread_local! {
    /// Layers marked since the last display pass of this thread.
    static MARKED_LAYERS: RefCell<Vec<Weak<LayerState>>> = const { RefCell::new(Vec::new()) };
}

/// Display every drawing layer of this thread that is still marked.
///
/// Observed groups call this before committing, so a layer marked during an
/// iteration is redrawn, and presented if it draws asynchronously, at the
/// same commit. Hosts committing a manual group call it themselves first.
/// Layers marked while the pass runs wait for the next one.
pub fn display_marked_layers() -> usize {
    let marked = MARKED_LAYERS.with(|marked| std::mem::take(&mut *marked.borrow_mut()));
    marked
        .iter()
        .filter_map(Weak::upgrade)
        .filter(|layer| layer.display_if_needed())
        .count()
}

/// A layer that draws through a [`DrawingDelegate`].
///
/// The handle is bound to the thread that created it.
pub struct DrawingLayer {
    state: Rc<LayerState>,
}

struct LayerState {
    id: LayerId,
    counter: Arc<GenerationCounter>,
    delegate: RefCell<Option<Arc<dyn DrawingDelegate>>>,
    bounds: Cell<Size>,
    contents_scale: Cell<f32>,
    geometry_flipped: Cell<bool>,
    needs_display: Cell<bool>,
}

impl DrawingLayer {
    /// Create a drawing layer in `Auto` mode.
    pub fn new() -> Self {
        Self::with_mode(DrawingMode::Auto)
    }

    pub fn with_mode(mode: DrawingMode) -> Self {
        Self {
            state: Rc::new(LayerState {
                id: with_layer_tree_mut(|tree| tree.register(Some(mode))),
                counter: Arc::new(GenerationCounter::new()),
                delegate: RefCell::new(None),
                bounds: Cell::new(Size::zero()),
                contents_scale: Cell::new(1.0),
                geometry_flipped: Cell::new(false),
                needs_display: Cell::new(false),
            }),
        }
    }

    pub fn drawing_mode(&self) -> DrawingMode {
        with_layer_tree(|tree| tree.drawing_mode(self.state.id)).unwrap_or_default()
    }

    pub fn set_drawing_mode(&self, mode: DrawingMode) {
        with_layer_tree_mut(|tree| tree.set_drawing_mode(self.state.id, mode));
    }

    pub fn set_delegate(&self, delegate: Option<Arc<dyn DrawingDelegate>>) {
        *self.state.delegate.borrow_mut() = delegate;
    }

    pub fn bounds(&self) -> Size {
        self.state.bounds.get()
    }

    /// Resize the layer. A size change marks the layer as needing display.
    pub fn set_bounds(&self, bounds: Size) {
        if self.state.bounds.get() != bounds {
            self.state.bounds.set(bounds);
            self.set_needs_display();
        }
    }

    pub fn contents_scale(&self) -> f32 {
        self.state.contents_scale.get()
    }

    pub fn set_contents_scale(&self, scale: f32) {
        self.state.contents_scale.set(scale);
    }

    pub fn is_geometry_flipped(&self) -> bool {
        self.state.geometry_flipped.get()
    }

    pub fn set_geometry_flipped(&self, flipped: bool) {
        self.state.geometry_flipped.set(flipped);
    }

    /// The currently presented bitmap.
    pub fn contents(&self) -> Option<Contents> {
        with_layer_tree(|tree| tree.contents(self.state.id))
    }

    /// Incremented every time new contents are presented.
    pub fn contents_serial(&self) -> u64 {
        with_layer_tree(|tree| tree.contents_serial(self.state.id))
    }

    /// Current value of the generation counter.
    pub fn generation(&self) -> u64 {
        self.state.counter.read()
    }

    /// Invalidate in-flight drawing and mark the layer for display.
    ///
    /// The layer is redrawn by the next [`display_marked_layers`] pass, which
    /// the main group of this thread runs on its commit phases.
    pub fn set_needs_display(&self) {
        self.state.cancel_drawing();
        if !self.state.needs_display.replace(true) {
            MARKED_LAYERS.with(|marked| marked.borrow_mut().push(Rc::downgrade(&self.state)));
            // The main group's observer drives the display pass
            TransactionGroup::main();
        }
    }

    pub fn needs_display(&self) -> bool {
        self.state.needs_display.get()
    }

    /// Run [`DrawingLayer::display`] if the layer was marked.
    pub fn display_if_needed(&self) -> bool {
        self.state.display_if_needed()
    }

    /// The mode a display request would use right now: `Sync` or `Async`.
    pub fn resolved_mode(&self) -> DrawingMode {
        self.state.resolved_mode()
    }

    /// Render the layer.
    ///
    /// Sync layers present new contents before this returns. Async layers
    /// queue a transaction on their group and present at its next commit,
    /// unless a later request supersedes this one first.
    pub fn display(&self) {
        self.state.display();
    }

    #[cfg(test)]
    fn cancel_drawing(&self) {
        self.state.cancel_drawing();
    }
}

impl LayerState {
    fn display_if_needed(&self) -> bool {
        if self.needs_display.get() {
            self.display();
            true
        } else {
            false
        }
    }

    fn resolved_mode(&self) -> DrawingMode {
        with_layer_tree(|tree| {
            let asynchronous = match tree.drawing_mode(self.id).unwrap_or_default() {
                DrawingMode::Sync => false,
                DrawingMode::Async => true,
                DrawingMode::Auto => matches!(
                    tree.nearest_drawing_ancestor_mode(self.id),
                    None | Some(DrawingMode::Sync)
                ),
            };
            if asynchronous {
                DrawingMode::Async
            } else {
                DrawingMode::Sync
            }
        })
    }

    fn display(&self) {
        self.needs_display.set(false);
        self.cancel_drawing();

        let Some(delegate) = self.delegate.borrow().clone() else {
            log::trace!("{:?}: no delegate, skipping display", self.id);
            return;
        };

        match self.resolved_mode() {
            DrawingMode::Async => self.display_async(delegate),
            _ => self.display_sync(&*delegate),
        }
    }

    fn display_sync(&self, delegate: &dyn DrawingDelegate) {
        let parameter = delegate.drawing_parameter();
        let Some(image) = render(
            delegate,
            self.bounds.get(),
            self.contents_scale.get(),
            self.geometry_flipped.get(),
            parameter.as_ref(),
            false,
        ) else {
            return;
        };
        with_layer_tree_mut(|tree| tree.set_contents(self.id, Some(Arc::new(image))));
    }

    fn display_async(&self, delegate: Arc<dyn DrawingDelegate>) {
        let id = self.id;
        let group = with_layer_tree_mut(|tree| tree.resolve_transaction_group(id));

        let parameter = delegate.drawing_parameter();
        let size = self.bounds.get();
        let scale = self.contents_scale.get();
        let flipped = self.geometry_flipped.get();
        let generation = self.counter.read();

        let producer_counter = Arc::downgrade(&self.counter);
        let completion_counter = Arc::downgrade(&self.counter);

        let producer = move || {
            let counter = producer_counter.upgrade()?;
            if counter.read() != generation {
                log::trace!("{:?}: generation {} superseded before drawing", id, generation);
                return None;
            }

            let image = render(&*delegate, size, scale, flipped, parameter.as_ref(), true)?;

            if counter.read() != generation {
                log::trace!("{:?}: generation {} superseded while drawing", id, generation);
                return None;
            }
            Some(image)
        };

        let completion = move |image: Option<RgbaImage>| {
            let Some(image) = image else {
                return;
            };
            // Every increment happens on this thread, so this read is exact
            let current = completion_counter.upgrade().map(|counter| counter.read());
            if current != Some(generation) {
                log::trace!("{:?}: dropping stale contents of generation {}", id, generation);
                return;
            }
            with_layer_tree_mut(|tree| tree.set_contents(id, Some(Arc::new(image))));
        };

        group.add(Transaction::new(producer, completion));
    }

    fn cancel_drawing(&self) {
        self.counter.increment();
    }
}

impl Drop for LayerState {
    fn drop(&mut self) {
        release_layer(self.id);
    }
}

impl Default for DrawingLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl AsLayer for DrawingLayer {
    fn layer_id(&self) -> LayerId {
        self.state.id
    }
}

fn render(
    delegate: &dyn DrawingDelegate,
    size: Size,
    scale: f32,
    flipped: bool,
    parameter: Option<&DrawingParameter>,
    asynchronous: bool,
) -> Option<RgbaImage> {
    let Some((width, height)) = size.pixel_size(scale) else {
        log::warn!("No bitmap for {:?} at scale {}: too large or not finite", size, scale);
        return None;
    };
    if width == 0 || height == 0 {
        return None;
    }

    let mut target = RgbaImage::new(width, height);
    delegate.draw(
        Rect::from_size(size),
        &mut target,
        scale,
        flipped,
        parameter,
        asynchronous,
    );
    Some(target)
}
