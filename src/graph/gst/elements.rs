//! Element chains for each backbone node kind, and factory detection

use gstreamer as gst;
use gstreamer::prelude::*;
use tracing::{debug, info, warn};

use crate::error::GraphError;
use crate::graph::node::{GraphNode, MediaKind, NodeKind, SourceKind, TransformKind};
use crate::Config;

/// First and last element of the chain realising one node
#[derive(Debug, Clone)]
pub struct Chain {
    pub first: gst::Element,
    pub last: gst::Element,
    pub elements: Vec<gst::Element>,
}

impl Chain {
    fn single(element: gst::Element) -> Self {
        Self {
            first: element.clone(),
            last: element.clone(),
            elements: vec![element],
        }
    }

    fn linked(elements: Vec<gst::Element>) -> Result<Self, GraphError> {
        gst::Element::link_many(&elements)
            .map_err(|e| GraphError::Backend(format!("Failed to link chain: {}", e)))?;
        let first = elements
            .first()
            .cloned()
            .ok_or_else(|| GraphError::Backend("empty element chain".into()))?;
        let last = elements.last().cloned().unwrap_or_else(|| first.clone());
        Ok(Self {
            first,
            last,
            elements,
        })
    }
}

pub(crate) fn make(factory: &str, name: &str) -> Result<gst::Element, GraphError> {
    gst::ElementFactory::make(factory)
        .name(name)
        .build()
        .map_err(|e| GraphError::Backend(format!("Failed to create {}: {}", factory, e)))
}

pub(crate) fn video_caps(config: &Config) -> gst::Caps {
    gst::Caps::builder("video/x-raw")
        .field("format", "I420")
        .field("width", config.video.width as i32)
        .field("height", config.video.height as i32)
        .field("framerate", gst::Fraction::new(config.video.framerate as i32, 1))
        .field("pixel-aspect-ratio", gst::Fraction::new(1, 1))
        .build()
}

pub(crate) fn audio_caps(config: &Config) -> gst::Caps {
    gst::Caps::builder("audio/x-raw")
        .field("format", "S16LE")
        .field("layout", "interleaved")
        .field("rate", config.audio.sample_rate as i32)
        .field("channels", config.audio.channels as i32)
        .build()
}

fn capsfilter(name: &str, caps: &gst::Caps) -> Result<gst::Element, GraphError> {
    let filter = make("capsfilter", name)?;
    filter.set_property("caps", caps);
    Ok(filter)
}

/// Build the elements for a backbone node. Elements are not yet in a bin.
pub fn realize(node: &GraphNode, config: &Config) -> Result<Chain, GraphError> {
    let name = node.name.as_str();
    match &node.kind {
        NodeKind::Source(SourceKind::Pattern) => {
            let src = make("videotestsrc", name)?;
            src.set_property("is-live", true);
            src.set_property_from_str("pattern", &config.video.pattern);
            Chain::linked(vec![
                src,
                capsfilter(&format!("{name}-caps"), &video_caps(config))?,
            ])
        }
        NodeKind::Source(SourceKind::Music) => match &config.audio.music_path {
            Some(path) => music_chain(name, path, config),
            None => {
                let src = make("audiotestsrc", name)?;
                src.set_property("is-live", true);
                src.set_property_from_str("wave", "silence");
                Chain::linked(vec![
                    src,
                    capsfilter(&format!("{name}-caps"), &audio_caps(config))?,
                ])
            }
        },
        NodeKind::Selector(_) => {
            let selector = make("input-selector", name)?;
            selector.set_property("cache-buffers", false);
            Ok(Chain::single(selector))
        }
        NodeKind::Mixer => Ok(Chain::single(make("audiomixer", name)?)),
        NodeKind::Transform(TransformKind::Overlay) => Chain::linked(vec![
            make("overlaycomposition", name)?,
            make("videoconvert", &format!("{name}-convert"))?,
        ]),
        NodeKind::Transform(TransformKind::Buffer) => {
            let queue = make("queue", name)?;
            queue.set_property_from_str("leaky", "downstream");
            queue.set_property("max-size-buffers", 0u32);
            queue.set_property("max-size-bytes", 0u32);
            queue.set_property("max-size-time", gst::ClockTime::from_seconds(2).nseconds());
            Ok(Chain::single(queue))
        }
        NodeKind::Encoder(MediaKind::Video) => Chain::linked(vec![
            video_encoder(name, config)?,
            make("h264parse", &format!("{name}-parse"))?,
        ]),
        NodeKind::Encoder(MediaKind::Audio) => Chain::linked(vec![
            make("audioconvert", &format!("{name}-convert"))?,
            audio_encoder(name, config)?,
            make("aacparse", &format!("{name}-parse"))?,
        ]),
        NodeKind::Mux => {
            let mux = make("flvmux", name)?;
            mux.set_property("streamable", true);
            Ok(Chain::single(mux))
        }
        NodeKind::Duplicator => {
            let tee = make("tee", name)?;
            tee.set_property("allow-not-linked", true);
            Ok(Chain::single(tee))
        }
        NodeKind::Sink(location) => {
            let factory = detect_rtmp_sink();
            let sink = make(factory, name)?;
            sink.set_property("location", location);
            sink.set_property("async", false);
            Ok(Chain::single(sink))
        }
        NodeKind::Source(SourceKind::Decode)
        | NodeKind::Transform(TransformKind::Normalize(_))
        | NodeKind::Encoder(MediaKind::Muxed) => Err(GraphError::Backend(format!(
            "node '{}' is not part of the backbone",
            name
        ))),
    }
}

/// Looping music file. The decoder's pad is linked once it appears; looping
/// is driven by segment seeks from the bus handler.
fn music_chain(
    name: &str,
    path: &std::path::Path,
    config: &Config,
) -> Result<Chain, GraphError> {
    let source = crate::graph::MediaSource::File(path.to_path_buf());
    let decode = make("uridecodebin", name)?;
    decode.set_property("uri", source.uri()?);

    let convert = make("audioconvert", &format!("{name}-convert"))?;
    let resample = make("audioresample", &format!("{name}-resample"))?;
    let caps = capsfilter(&format!("{name}-caps"), &audio_caps(config))?;
    gst::Element::link_many([&convert, &resample, &caps])
        .map_err(|e| GraphError::Backend(format!("Failed to link music chain: {}", e)))?;

    let convert_weak = convert.downgrade();
    decode.connect_pad_added(move |_, pad| {
        let Some(convert) = convert_weak.upgrade() else {
            return;
        };
        let is_audio = pad
            .current_caps()
            .and_then(|caps| caps.structure(0).map(|s| s.name().starts_with("audio/")))
            .unwrap_or(false);
        let Some(sink) = convert.static_pad("sink") else {
            return;
        };
        if is_audio && !sink.is_linked() {
            if let Err(e) = pad.link(&sink) {
                warn!("Failed to link music decoder: {:?}", e);
            }
        }
    });

    Ok(Chain {
        first: decode.clone(),
        last: caps.clone(),
        elements: vec![decode, convert, resample, caps],
    })
}

/// Detect best available H.264 encoder (hardware > software)
fn video_encoder(name: &str, config: &Config) -> Result<gst::Element, GraphError> {
    let bitrate = config.output.video_bitrate_kbps;
    let keyframes = config.video.framerate * 2;

    if gst::ElementFactory::find("x264enc").is_some() {
        let enc = make("x264enc", name)?;
        enc.set_property_from_str("tune", "zerolatency");
        enc.set_property_from_str("speed-preset", "veryfast");
        enc.set_property("bitrate", bitrate);
        enc.set_property("key-int-max", keyframes);
        info!("Using video encoder: x264enc");
        return Ok(enc);
    }

    let fallbacks = ["nvh264enc", "vaapih264enc", "openh264enc"];
    for factory in fallbacks {
        if gst::ElementFactory::find(factory).is_some() {
            let enc = make(factory, name)?;
            if enc.find_property("bitrate").is_some() {
                // openh264enc counts bits, the others kilobits
                let value = if factory == "openh264enc" {
                    bitrate * 1000
                } else {
                    bitrate
                };
                enc.set_property_from_str("bitrate", &value.to_string());
            }
            warn!("x264enc not found, using video encoder: {}", factory);
            return Ok(enc);
        }
    }

    Err(GraphError::Backend("no H.264 encoder available".into()))
}

/// Detect best available AAC encoder
fn audio_encoder(name: &str, config: &Config) -> Result<gst::Element, GraphError> {
    let encoders = ["fdkaacenc", "avenc_aac", "voaacenc", "faac"];
    let bitrate = config.output.audio_bitrate_kbps * 1000;

    for factory in encoders {
        if let Some(found) = gst::ElementFactory::find(factory) {
            debug!(
                "Found audio encoder: {} - {}",
                factory,
                found.metadata("long-name").unwrap_or("")
            );
            let enc = make(factory, name)?;
            if enc.find_property("bitrate").is_some() {
                enc.set_property_from_str("bitrate", &bitrate.to_string());
            }
            info!("Using audio encoder: {}", factory);
            return Ok(enc);
        }
    }

    Err(GraphError::Backend("no AAC encoder available".into()))
}

/// Detect best available RTMP sink
fn detect_rtmp_sink() -> &'static str {
    if gst::ElementFactory::find("rtmp2sink").is_some() {
        return "rtmp2sink";
    }
    warn!("rtmp2sink not found, using rtmpsink");
    "rtmpsink"
}

/// Normalizing chain for one decoded branch output
pub fn normalizer(name: &str, media: MediaKind, config: &Config) -> Result<Chain, GraphError> {
    match media {
        MediaKind::Video => Chain::linked(vec![
            make("queue", &format!("{name}-queue"))?,
            make("videoconvert", &format!("{name}-convert"))?,
            make("videoscale", &format!("{name}-scale"))?,
            make("videorate", &format!("{name}-rate"))?,
            capsfilter(&format!("{name}-caps"), &video_caps(config))?,
        ]),
        MediaKind::Audio => Chain::linked(vec![
            make("queue", &format!("{name}-queue"))?,
            make("audioconvert", &format!("{name}-convert"))?,
            make("audioresample", &format!("{name}-resample"))?,
            capsfilter(&format!("{name}-caps"), &audio_caps(config))?,
        ]),
        MediaKind::Muxed => Err(GraphError::Backend(
            "muxed streams cannot be normalized".into(),
        )),
    }
}
