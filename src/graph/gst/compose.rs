//! Overlay composition for the compositing node's draw callback

use std::sync::{Arc, Mutex};

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_video as gst_video;
use tracing::{debug, warn};

use crate::overlay::SharedFrame;

/// Placeholder shown until the first overlay frame is published
const MARKER_SIZE: u32 = 200;
const MARKER_OFFSET: i32 = 100;
/// Red at 50% alpha, premultiplied BGRA
const MARKER_PIXEL: [u8; 4] = [0, 0, 128, 128];

/// Builds and caches the composition handed to `overlaycomposition`.
pub struct Compositor {
    frame: SharedFrame,
    /// Last composition and the publish sequence it was built from
    cached: Mutex<Option<(u64, gst_video::VideoOverlayComposition)>>,
    placeholder: Option<gst_video::VideoOverlayComposition>,
}

impl Compositor {
    pub fn new(frame: SharedFrame) -> Self {
        let pixels = MARKER_PIXEL.repeat((MARKER_SIZE * MARKER_SIZE) as usize);
        let placeholder =
            composition(pixels, MARKER_SIZE, MARKER_SIZE, MARKER_OFFSET, MARKER_OFFSET)
                .map_err(|e| warn!("Failed to build overlay placeholder: {}", e))
                .ok();

        Self {
            frame,
            cached: Mutex::new(None),
            placeholder,
        }
    }

    /// Composition for the current frame, rebuilt only when a new overlay
    /// frame has been published.
    pub fn current(&self) -> Option<gst_video::VideoOverlayComposition> {
        if !self.frame.has_data() {
            return self.placeholder.clone();
        }

        let sequence = self.frame.sequence();
        let mut cached = self.cached.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((seq, comp)) = cached.as_ref() {
            if *seq == sequence {
                return Some(comp.clone());
            }
        }

        let geometry = self.frame.geometry();
        // The frame lock is held only for the copy.
        let (pixels, sequence) = self.frame.with_latest(|pixels, seq| (pixels.to_vec(), seq))?;
        match composition(pixels, geometry.width, geometry.height, 0, 0) {
            Ok(comp) => {
                debug!(sequence, "Overlay composition rebuilt");
                *cached = Some((sequence, comp.clone()));
                Some(comp)
            }
            Err(e) => {
                warn!("Failed to build overlay composition: {}", e);
                cached.as_ref().map(|(_, comp)| comp.clone())
            }
        }
    }

    /// Return value for the `draw` signal. With nothing to draw this is a
    /// NULL composition of the signal's type, which passes the frame through.
    pub fn draw_value(&self) -> gst::glib::Value {
        self.current().to_value()
    }

    /// Hook the compositor into an `overlaycomposition` element.
    pub fn attach(self: &Arc<Self>, element: &gst::Element) {
        let compositor = Arc::clone(self);
        element.connect("draw", false, move |_args| Some(compositor.draw_value()));
    }
}

fn composition(
    pixels: Vec<u8>,
    width: u32,
    height: u32,
    x: i32,
    y: i32,
) -> Result<gst_video::VideoOverlayComposition, gst::glib::BoolError> {
    let mut buffer = gst::Buffer::from_mut_slice(pixels);
    gst_video::VideoMeta::add(
        buffer.make_mut(),
        gst_video::VideoFrameFlags::empty(),
        gst_video::VideoFormat::Bgra,
        width,
        height,
    )?;

    let rect = gst_video::VideoOverlayRectangle::new_raw(
        &buffer,
        x,
        y,
        width,
        height,
        gst_video::VideoOverlayFormatFlags::PREMULTIPLIED_ALPHA,
    );
    gst_video::VideoOverlayComposition::new(Some(&rect))
}
