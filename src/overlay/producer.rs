//! Periodic capture of the overlay surface into the shared frame

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use color_eyre::{eyre::eyre, Result};
use crossbeam::utils::CachePadded;
use tracing::{debug, info, warn};

use crate::overlay::frame::SharedFrame;
use crate::overlay::surface::Surface;

#[derive(Default)]
pub struct ProducerStats {
    published: AtomicUsize,
    skipped: AtomicUsize,
}

impl ProducerStats {
    /// (published, skipped)
    pub fn snapshot(&self) -> (usize, usize) {
        (
            self.published.load(Ordering::Relaxed),
            self.skipped.load(Ordering::Relaxed),
        )
    }
}

/// Copies the surface into a scratch buffer and publishes it
pub struct FrameProducer<S> {
    surface: S,
    frame: SharedFrame,
    /// Allocated once at the frame size
    scratch: Vec<u8>,
    stats: Arc<CachePadded<ProducerStats>>,
}

impl<S: Surface> FrameProducer<S> {
    pub fn new(surface: S, frame: SharedFrame) -> Self {
        let scratch = vec![0; frame.geometry().len()];
        Self {
            surface,
            frame,
            scratch,
            stats: Arc::new(CachePadded::new(ProducerStats::default())),
        }
    }

    pub fn stats(&self) -> Arc<CachePadded<ProducerStats>> {
        Arc::clone(&self.stats)
    }

    /// One timer tick. Never fails: an unavailable surface skips the tick.
    pub fn tick(&mut self) -> bool {
        let start = Instant::now();
        let geometry = self.frame.geometry();

        if !self.surface.capture(&mut self.scratch, &geometry) {
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("overlay_frames_skipped").increment(1);
            return false;
        }

        let published = self.frame.publish(&self.scratch);
        if published {
            self.stats.published.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("overlay_frames_published").increment(1);
            metrics::histogram!("overlay_copy_time_us").record(start.elapsed().as_micros() as f64);
        } else {
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
        }
        published
    }
}

/// Render thread driving a [`FrameProducer`] at a fixed period
pub struct RenderThread {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    stats: Arc<CachePadded<ProducerStats>>,
}

impl RenderThread {
    /// `make_surface` runs on the new thread, so surfaces holding blocking
    /// clients never touch the async runtime.
    pub fn spawn<S, F>(make_surface: F, frame: SharedFrame, period: Duration) -> Result<Self>
    where
        S: Surface,
        F: FnOnce() -> S + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(CachePadded::new(ProducerStats::default()));

        let thread_stop = Arc::clone(&stop);
        let thread_stats = Arc::clone(&stats);
        let handle = thread::Builder::new()
            .name("overlay-render".into())
            .spawn(move || {
                let mut producer = FrameProducer {
                    stats: thread_stats,
                    ..FrameProducer::new(make_surface(), frame)
                };
                run_producer(&mut producer, &thread_stop, period);
            })
            .map_err(|e| eyre!("Failed to spawn render thread: {}", e))?;

        info!("Overlay render thread started ({:?} period)", period);
        Ok(Self {
            stop,
            handle: Some(handle),
            stats,
        })
    }

    pub fn stats(&self) -> Arc<CachePadded<ProducerStats>> {
        Arc::clone(&self.stats)
    }

    /// Signal the thread and wait for it to exit.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Overlay render thread panicked");
            }
            debug!("Overlay render thread joined");
        }
    }
}

impl Drop for RenderThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_producer<S: Surface>(producer: &mut FrameProducer<S>, stop: &AtomicBool, period: Duration) {
    let mut next = Instant::now();
    while !stop.load(Ordering::Relaxed) {
        producer.tick();

        next += period;
        let now = Instant::now();
        if next > now {
            thread::sleep(next - now);
        } else {
            // Fell behind; don't try to catch up with a burst.
            next = now;
        }
    }
}
