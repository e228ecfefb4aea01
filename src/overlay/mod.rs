//! Overlay picture pipeline: render thread to shared frame

pub mod frame;
pub mod producer;
pub mod surface;

pub use frame::{FrameGeometry, SharedFrame};
pub use producer::{FrameProducer, ProducerStats, RenderThread};
pub use surface::{ImageSurface, OverlaySource, Surface};
