//! Overlay render targets

use std::path::PathBuf;
use std::time::{Duration, Instant};

use color_eyre::{eyre::eyre, Result};
use image::imageops::FilterType;
use tracing::{debug, info, warn};
use url::Url;

use crate::overlay::frame::{FrameGeometry, BYTES_PER_PIXEL};

/// A rendered 2-D picture the producer copies from
pub trait Surface {
    /// Copy the current picture into `dst` as premultiplied BGRA. Returns
    /// false when nothing is available yet.
    fn capture(&mut self, dst: &mut [u8], geometry: &FrameGeometry) -> bool;
}

/// Where the overlay picture comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverlaySource {
    File(PathBuf),
    Http(String),
}

impl OverlaySource {
    /// Accepts `file://` URLs, `http(s)://` URLs and plain paths.
    pub fn parse(location: &str) -> Result<Self> {
        match Url::parse(location) {
            Ok(url) if url.scheme() == "file" => url
                .to_file_path()
                .map(OverlaySource::File)
                .map_err(|_| eyre!("Invalid file URL: {}", location)),
            Ok(url) if matches!(url.scheme(), "http" | "https") => {
                Ok(OverlaySource::Http(location.to_string()))
            }
            Ok(url) if url.scheme().len() > 1 => {
                Err(eyre!("Unsupported overlay scheme: {}", url.scheme()))
            }
            _ => Ok(OverlaySource::File(PathBuf::from(location))),
        }
    }
}

/// Delay between attempts while the source cannot be loaded
const RETRY_INTERVAL: Duration = Duration::from_secs(1);
const FETCH_TIMEOUT: Duration = Duration::from_secs(2);

/// Still image loaded from a file or URL, scaled to the frame size.
///
/// Must be created on the thread that uses it: the HTTP client blocks.
pub struct ImageSurface {
    source: OverlaySource,
    client: Option<reqwest::blocking::Client>,
    /// Premultiplied BGRA at the geometry it was loaded for
    picture: Option<(FrameGeometry, Vec<u8>)>,
    reload: Option<Duration>,
    last_attempt: Option<Instant>,
    last_ok: bool,
}

impl ImageSurface {
    pub fn new(source: OverlaySource, reload: Option<Duration>) -> Self {
        let client = match &source {
            OverlaySource::Http(_) => reqwest::blocking::Client::builder()
                .timeout(FETCH_TIMEOUT)
                .build()
                .map_err(|e| warn!("Failed to create overlay HTTP client: {}", e))
                .ok(),
            OverlaySource::File(_) => None,
        };

        Self {
            source,
            client,
            picture: None,
            reload,
            last_attempt: None,
            last_ok: false,
        }
    }

    fn due(&self, geometry: &FrameGeometry) -> bool {
        let stale_size = self
            .picture
            .as_ref()
            .map(|(g, _)| g != geometry)
            .unwrap_or(true);
        let Some(last) = self.last_attempt else {
            return true;
        };

        let wait = match (self.last_ok, self.reload) {
            (false, _) => RETRY_INTERVAL,
            (true, _) if stale_size => Duration::ZERO,
            (true, Some(reload)) => reload,
            (true, None) => return false,
        };
        last.elapsed() >= wait
    }

    fn fetch(&self) -> Result<Vec<u8>> {
        match &self.source {
            OverlaySource::File(path) => std::fs::read(path)
                .map_err(|e| eyre!("Failed to read {}: {}", path.display(), e)),
            OverlaySource::Http(url) => {
                let client = self
                    .client
                    .as_ref()
                    .ok_or_else(|| eyre!("No HTTP client"))?;
                let response = client
                    .get(url)
                    .send()
                    .and_then(|r| r.error_for_status())
                    .map_err(|e| eyre!("Failed to fetch {}: {}", url, e))?;
                let bytes = response
                    .bytes()
                    .map_err(|e| eyre!("Failed to read {}: {}", url, e))?;
                Ok(bytes.to_vec())
            }
        }
    }

    fn load(&mut self, geometry: &FrameGeometry) -> Result<()> {
        let encoded = self.fetch()?;
        let decoded = image::load_from_memory(&encoded)
            .map_err(|e| eyre!("Failed to decode overlay: {}", e))?;
        let rgba = decoded
            .resize_exact(geometry.width, geometry.height, FilterType::Triangle)
            .to_rgba8();

        let mut bgra = rgba.into_raw();
        premultiply_to_bgra(&mut bgra);
        self.picture = Some((*geometry, bgra));
        Ok(())
    }
}

impl Surface for ImageSurface {
    fn capture(&mut self, dst: &mut [u8], geometry: &FrameGeometry) -> bool {
        if self.due(geometry) {
            self.last_attempt = Some(Instant::now());
            match self.load(geometry) {
                Ok(()) => {
                    if !self.last_ok {
                        info!("Overlay loaded from {:?}", self.source);
                    }
                    self.last_ok = true;
                }
                Err(e) => {
                    if self.last_ok || self.picture.is_none() {
                        warn!("{}", e);
                    } else {
                        debug!("{}", e);
                    }
                    self.last_ok = false;
                }
            }
        }

        match &self.picture {
            Some((g, pixels)) if g == geometry && dst.len() == pixels.len() => {
                dst.copy_from_slice(pixels);
                true
            }
            _ => false,
        }
    }
}

/// Straight RGBA to premultiplied BGRA, in place
pub fn premultiply_to_bgra(pixels: &mut [u8]) {
    for px in pixels.chunks_exact_mut(BYTES_PER_PIXEL) {
        let a = u16::from(px[3]);
        let scale = |c: u8| ((u16::from(c) * a + 127) / 255) as u8;
        let (r, g, b) = (scale(px[0]), scale(px[1]), scale(px[2]));
        px[0] = b;
        px[1] = g;
        px[2] = r;
    }
}
