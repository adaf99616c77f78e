use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use calloop::timer::{TimeoutAction, Timer};
use clap::{Parser, ValueEnum};
use drawlayer::prelude::*;
use image::{Rgba, RgbaImage};

#[derive(Parser, Debug)]
#[command(name = "drawlayer-demo", version)]
struct Cli {
    /// Number of drawing layers to create.
    #[arg(long, default_value_t = 3)]
    layers: usize,

    /// How many times every layer is invalidated before the loop stops.
    #[arg(long, default_value_t = 20)]
    invalidations: u32,

    /// Interval between invalidations, in milliseconds.
    #[arg(long, default_value_t = 8)]
    interval_ms: u64,

    /// Simulated cost of a single draw, in milliseconds.
    #[arg(long, default_value_t = 20)]
    draw_ms: u64,

    /// Layer size in points.
    #[arg(long, default_value_t = 128.0)]
    size: f32,

    /// Contents scale.
    #[arg(long, default_value_t = 1.0)]
    scale: f32,

    /// Drawing mode for every layer.
    #[arg(long, value_enum, default_value_t = ModeChoice::Auto)]
    mode: ModeChoice,

    /// Worker threads (rayon default if omitted).
    #[arg(long)]
    workers: Option<usize>,

    /// Directory for the final PNGs.
    #[arg(long, default_value = "drawlayer-out")]
    out: PathBuf,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeChoice {
    Sync,
    Async,
    Auto,
}

impl From<ModeChoice> for DrawingMode {
    fn from(choice: ModeChoice) -> Self {
        match choice {
            ModeChoice::Sync => DrawingMode::Sync,
            ModeChoice::Async => DrawingMode::Async,
            ModeChoice::Auto => DrawingMode::Auto,
        }
    }
}

/// Fills the layer with a base colour and a vertical stripe whose position
/// follows the frame number captured at request time.
struct StripeDelegate {
    color: [u8; 3],
    frame: AtomicU32,
    cost: Duration,
    draws: AtomicU32,
}

impl DrawingDelegate for StripeDelegate {
    fn drawing_parameter(&self) -> Option<DrawingParameter> {
        Some(Arc::new(self.frame.load(Ordering::Relaxed)))
    }

    fn draw(
        &self,
        _rect: Rect,
        target: &mut RgbaImage,
        _scale: f32,
        flipped: bool,
        parameter: Option<&DrawingParameter>,
        asynchronous: bool,
    ) {
        self.draws.fetch_add(1, Ordering::Relaxed);
        std::thread::sleep(self.cost);

        let frame = parameter
            .and_then(|p| p.downcast_ref::<u32>())
            .copied()
            .unwrap_or(0);
        let (width, height) = target.dimensions();
        let stripe = frame % width.max(1);
        let [r, g, b] = self.color;

        for (x, y, pixel) in target.enumerate_pixels_mut() {
            let row = if flipped { height - 1 - y } else { y };
            *pixel = if x == stripe {
                Rgba([255, 255, 255, 255])
            } else {
                Rgba([r, g, b.saturating_add((row % 64) as u8), 255])
            };
        }

        log::trace!("Drew frame {} (asynchronous: {})", frame, asynchronous);
    }
}

const PALETTE: [[u8; 3]; 4] = [[200, 60, 60], [60, 160, 90], [60, 90, 200], [190, 150, 40]];

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = SchedulerConfig::new();
    if let Some(workers) = cli.workers {
        config = config.worker_threads(workers);
    }
    drawlayer::init(config)?;

    let run_loop = RunLoop::current()?;

    let root = Layer::new();
    let mut delegates = Vec::with_capacity(cli.layers);
    let mut layers = Vec::with_capacity(cli.layers);
    for i in 0..cli.layers {
        let delegate = Arc::new(StripeDelegate {
            color: PALETTE[i % PALETTE.len()],
            frame: AtomicU32::new(0),
            cost: Duration::from_millis(cli.draw_ms),
            draws: AtomicU32::new(0),
        });
        let layer = DrawingLayer::with_mode(cli.mode.into());
        layer.set_contents_scale(cli.scale);
        layer.set_bounds(Size::new(cli.size, cli.size));
        layer.set_delegate(Some(delegate.clone()));
        root.add_sublayer(&layer);

        delegates.push(delegate);
        layers.push(layer);
    }
    let layers = Rc::new(layers);

    let interval = Duration::from_millis(cli.interval_ms);
    let invalidations = cli.invalidations;
    let waker = run_loop.waker();
    let timer_layers = layers.clone();
    let timer_delegates = delegates.clone();
    let mut fired = 0u32;

    run_loop
        .handle()
        .insert_source(Timer::from_duration(interval), move |_, _, _| {
            fired += 1;
            for (layer, delegate) in timer_layers.iter().zip(&timer_delegates) {
                delegate.frame.store(fired, Ordering::Relaxed);
                // Redrawn by the main group right before it commits
                layer.set_needs_display();
            }

            if fired >= invalidations {
                waker.stop();
                TimeoutAction::Drop
            } else {
                TimeoutAction::ToDuration(interval)
            }
        })
        .map_err(|err| err.error)?;

    let started = Instant::now();
    run_loop.run()?;
    log::info!(
        "Ran {} invalidations on {} layers in {:?}",
        invalidations,
        layers.len(),
        started.elapsed()
    );

    std::fs::create_dir_all(&cli.out)
        .with_context(|| format!("create output directory '{}'", cli.out.display()))?;

    for (i, (layer, delegate)) in layers.iter().zip(&delegates).enumerate() {
        let draws = delegate.draws.load(Ordering::Relaxed);
        let Some(contents) = layer.contents() else {
            println!("layer {i}: no contents ({draws} draws)");
            continue;
        };

        let path = cli.out.join(format!("layer-{i}.png"));
        contents
            .save(&path)
            .with_context(|| format!("write '{}'", path.display()))?;
        println!(
            "layer {i}: {}x{} presented {} times from {draws} draws -> {}",
            contents.width(),
            contents.height(),
            layer.contents_serial(),
            path.display()
        );
    }

    Ok(())
}
