use std::sync::{Arc, Mutex, MutexGuard};

/// Bytes per premultiplied BGRA pixel
pub const BYTES_PER_PIXEL: usize = 4;

/// Fixed size of the overlay picture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
}

impl FrameGeometry {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn stride(&self) -> usize {
        self.width as usize * BYTES_PER_PIXEL
    }

    /// Size of one frame in bytes
    pub fn len(&self) -> usize {
        self.stride() * self.height as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct FrameSlot {
    pixels: Vec<u8>,
    has_data: bool,
    /// Incremented on every publish
    sequence: u64,
}

/// Single-slot overlay picture shared between the render thread and the
/// compositing callback. The lock is held only while pixels are copied.
#[derive(Clone)]
pub struct SharedFrame {
    geometry: FrameGeometry,
    slot: Arc<Mutex<FrameSlot>>,
}

impl SharedFrame {
    pub fn new(geometry: FrameGeometry) -> Self {
        Self {
            geometry,
            slot: Arc::new(Mutex::new(FrameSlot {
                pixels: vec![0; geometry.len()],
                has_data: false,
                sequence: 0,
            })),
        }
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    // A writer that panicked mid-copy leaves at worst a torn picture.
    fn lock(&self) -> MutexGuard<'_, FrameSlot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Copy a full frame in. Returns false, leaving the slot untouched, when
    /// `pixels` does not match the geometry.
    pub fn publish(&self, pixels: &[u8]) -> bool {
        if pixels.len() != self.geometry.len() {
            return false;
        }
        let mut slot = self.lock();
        slot.pixels.copy_from_slice(pixels);
        slot.has_data = true;
        slot.sequence += 1;
        true
    }

    pub fn has_data(&self) -> bool {
        self.lock().has_data
    }

    pub fn sequence(&self) -> u64 {
        self.lock().sequence
    }

    /// Run `f` on the latest frame and its sequence, if any was published.
    pub fn with_latest<R>(&self, f: impl FnOnce(&[u8], u64) -> R) -> Option<R> {
        let slot = self.lock();
        slot.has_data.then(|| f(&slot.pixels, slot.sequence))
    }
}
