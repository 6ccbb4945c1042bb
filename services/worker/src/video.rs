//! Video file decoding and encoding.
//!
//! Decoding yields frames as a forward-only iterator; encoding writes a list
//! of frames to an MP4 file. Both are traits so the pipeline can run against
//! in-memory sources. The GStreamer implementations use
//! `filesrc ! decodebin ! videoconvert ! appsink` and
//! `appsrc ! videoconvert ! x264enc ! mp4mux ! filesink`.

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use gstreamer_video::prelude::VideoFrameExt;
use image::RgbImage;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Frame rate assumed when a container does not declare one.
const FALLBACK_FPS: f64 = 30.0;

/// Longest a single appsink pull blocks before the bus is checked again.
const PULL_POLL: Duration = Duration::from_millis(100);

/// Errors that can occur while reading or writing video files.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("GStreamer initialization failed: {0}")]
    Init(String),

    #[error("Failed to open video {path}: {message}")]
    Open { path: PathBuf, message: String },

    #[error("Failed to decode frame {index}: {message}")]
    Frame { index: u64, message: String },

    #[error("Failed to encode video {path}: {message}")]
    Encode { path: PathBuf, message: String },
}

/// Stream properties needed to re-encode the output at the source rate and size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamInfo {
    pub fps: f64,
    pub width: u32,
    pub height: u32,
}

/// One decoded frame in RGB order.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Zero-based position in the stream
    pub index: u64,
    pub image: RgbImage,
}

/// A sequential, finite stream of decoded frames.
pub trait FrameSource: Iterator<Item = Result<Frame, DecodeError>> + Send {
    fn info(&self) -> StreamInfo;
}

/// Opens video files as frame streams.
pub trait VideoDecoder: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>, DecodeError>;
}

/// Writes frames to a video file.
pub trait VideoEncoder: Send + Sync {
    fn encode(&self, frames: &[RgbImage], info: &StreamInfo, path: &Path) -> Result<(), DecodeError>;
}

fn path_str(path: &Path) -> Result<&str, String> {
    path.to_str()
        .ok_or_else(|| format!("path {} is not valid UTF-8", path.display()))
}

fn error_text(err: &gst::message::Error) -> String {
    match err.debug() {
        Some(debug) => format!("{} ({})", err.error(), debug),
        None => err.error().to_string(),
    }
}

/// Pop the first error message waiting on a pipeline bus, if any.
fn pending_bus_error(pipeline: &gst::Pipeline) -> Option<String> {
    let bus = pipeline.bus()?;
    let message = bus.pop_filtered(&[gst::MessageType::Error])?;
    match message.view() {
        gst::MessageView::Error(err) => Some(error_text(err)),
        _ => None,
    }
}

/// Why a bounded wait on the appsink gave up.
#[derive(Debug, PartialEq)]
enum Stop {
    Ended,
    Failed(String),
    TimedOut,
}

/// Check whether waiting on `appsink` can still produce anything.
fn sink_stop(pipeline: &gst::Pipeline, appsink: &gst_app::AppSink) -> Option<Stop> {
    if let Some(message) = pending_bus_error(pipeline) {
        return Some(Stop::Failed(message));
    }
    appsink.is_eos().then_some(Stop::Ended)
}

/// Call `pull` with slices of at most `poll` until it yields, `check` reports
/// a stop, or `timeout` runs out.
fn wait_for<T>(
    timeout: Duration,
    poll: Duration,
    mut pull: impl FnMut(Duration) -> Option<T>,
    mut check: impl FnMut() -> Option<Stop>,
) -> Result<T, Stop> {
    let deadline = Instant::now() + timeout;
    loop {
        let slice = deadline.saturating_duration_since(Instant::now()).min(poll);
        if let Some(item) = pull(slice) {
            return Ok(item);
        }
        if let Some(stop) = check() {
            return Err(stop);
        }
        if Instant::now() >= deadline {
            return Err(Stop::TimedOut);
        }
    }
}

fn clock_time(duration: Duration) -> gst::ClockTime {
    gst::ClockTime::from_nseconds(duration.as_nanos() as u64)
}

/// GStreamer-backed decoder.
pub struct GstDecoder {
    timeout: Duration,
}

impl GstDecoder {
    /// `timeout` bounds both opening a file and waiting for each frame.
    pub fn new(timeout: Duration) -> Result<Self, DecodeError> {
        gst::init().map_err(|e| DecodeError::Init(e.to_string()))?;
        Ok(Self { timeout })
    }
}

impl VideoDecoder for GstDecoder {
    fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>, DecodeError> {
        Ok(Box::new(GstFrameReader::open(path, self.timeout)?))
    }
}

/// Pulls RGB frames out of an appsink one at a time.
pub struct GstFrameReader {
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
    video_info: gst_video::VideoInfo,
    info: StreamInfo,
    timeout: Duration,
    next_index: u64,
    finished: bool,
}

impl GstFrameReader {
    pub fn open(path: &Path, timeout: Duration) -> Result<Self, DecodeError> {
        let open_error = |message: String| DecodeError::Open {
            path: path.to_path_buf(),
            message,
        };

        let location = path_str(path).map_err(open_error)?;

        let pipeline = gst::parse::launch(
            "filesrc name=src ! decodebin ! videoconvert \
             ! video/x-raw,format=RGB \
             ! appsink name=sink sync=false max-buffers=8",
        )
        .map_err(|e| open_error(e.to_string()))?
        .downcast::<gst::Pipeline>()
        .map_err(|_| open_error("Failed to cast to Pipeline".to_string()))?;

        let source = pipeline
            .by_name("src")
            .ok_or_else(|| open_error("filesrc not found".to_string()))?;
        source.set_property("location", location);

        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| open_error("appsink not found".to_string()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| open_error("Could not cast to AppSink".to_string()))?;

        if let Err(e) = pipeline.set_state(gst::State::Paused) {
            let message = pending_bus_error(&pipeline).unwrap_or_else(|| e.to_string());
            let _ = pipeline.set_state(gst::State::Null);
            return Err(open_error(message));
        }

        // The preroll sample carries the negotiated caps; it is handed out
        // again by pull_sample once the pipeline plays. A stream with no
        // linkable video pad never prerolls, so the wait is bounded.
        let preroll = wait_for(
            timeout,
            PULL_POLL,
            |slice| appsink.try_pull_preroll(clock_time(slice)),
            || sink_stop(&pipeline, &appsink),
        );
        let preroll = match preroll {
            Ok(sample) => sample,
            Err(stop) => {
                let _ = pipeline.set_state(gst::State::Null);
                let message = match stop {
                    Stop::Failed(message) => message,
                    Stop::Ended => "no decodable video stream".to_string(),
                    Stop::TimedOut => format!("no video stream prerolled within {:?}", timeout),
                };
                return Err(open_error(message));
            }
        };

        let caps = preroll
            .caps()
            .ok_or_else(|| open_error("preroll sample has no caps".to_string()))?;
        let video_info = gst_video::VideoInfo::from_caps(caps)
            .map_err(|e| open_error(e.to_string()))?;

        let rate = video_info.fps();
        let fps = if rate.numer() > 0 && rate.denom() > 0 {
            rate.numer() as f64 / rate.denom() as f64
        } else {
            warn!(path = %path.display(), "Video declares no frame rate, assuming {}", FALLBACK_FPS);
            FALLBACK_FPS
        };

        let info = StreamInfo {
            fps,
            width: video_info.width(),
            height: video_info.height(),
        };

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| open_error(e.to_string()))?;

        info!(
            path = %path.display(),
            width = info.width,
            height = info.height,
            fps = info.fps,
            "Opened video"
        );

        Ok(Self {
            pipeline,
            appsink,
            video_info,
            info,
            timeout,
            next_index: 0,
            finished: false,
        })
    }

    fn to_frame(&self, sample: &gst::Sample) -> Result<Frame, DecodeError> {
        let index = self.next_index;
        let frame_error = |message: &str| DecodeError::Frame {
            index,
            message: message.to_string(),
        };

        let buffer = sample.buffer().ok_or_else(|| frame_error("sample has no buffer"))?;
        let mapped = gst_video::VideoFrameRef::from_buffer_ref_readable(buffer, &self.video_info)
            .map_err(|_| frame_error("buffer could not be mapped"))?;

        let width = self.info.width as usize;
        let height = self.info.height as usize;
        let row = width * 3;
        let stride = mapped.plane_stride()[0] as usize;
        let data = mapped
            .plane_data(0)
            .map_err(|_| frame_error("plane 0 is not readable"))?;

        let mut pixels = Vec::with_capacity(row * height);
        for y in 0..height {
            let start = y * stride;
            let line = data
                .get(start..start + row)
                .ok_or_else(|| frame_error("buffer shorter than frame"))?;
            pixels.extend_from_slice(line);
        }

        let image = RgbImage::from_raw(self.info.width, self.info.height, pixels)
            .ok_or_else(|| frame_error("pixel count does not match frame size"))?;

        Ok(Frame { index, image })
    }
}

impl Iterator for GstFrameReader {
    type Item = Result<Frame, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        let (pipeline, appsink) = (&self.pipeline, &self.appsink);
        let sample = wait_for(
            self.timeout,
            PULL_POLL,
            |slice| appsink.try_pull_sample(clock_time(slice)),
            || sink_stop(pipeline, appsink),
        );

        match sample {
            Ok(sample) => {
                let frame = self.to_frame(&sample);
                match frame {
                    Ok(_) => self.next_index += 1,
                    Err(_) => self.finished = true,
                }
                Some(frame)
            }
            Err(stop) => {
                self.finished = true;
                let message = match stop {
                    Stop::Ended => {
                        debug!(frames = self.next_index, "End of stream");
                        return None;
                    }
                    Stop::Failed(message) => message,
                    Stop::TimedOut => format!("no frame within {:?}", self.timeout),
                };
                Some(Err(DecodeError::Frame {
                    index: self.next_index,
                    message,
                }))
            }
        }
    }
}

impl FrameSource for GstFrameReader {
    fn info(&self) -> StreamInfo {
        self.info
    }
}

impl Drop for GstFrameReader {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

/// GStreamer-backed H.264/MP4 encoder.
pub struct GstEncoder;

impl GstEncoder {
    pub fn new() -> Result<Self, DecodeError> {
        gst::init().map_err(|e| DecodeError::Init(e.to_string()))?;
        Ok(Self)
    }
}

impl VideoEncoder for GstEncoder {
    fn encode(&self, frames: &[RgbImage], info: &StreamInfo, path: &Path) -> Result<(), DecodeError> {
        let encode_error = |message: String| DecodeError::Encode {
            path: path.to_path_buf(),
            message,
        };

        let location = path_str(path).map_err(encode_error)?;

        let pipeline = gst::parse::launch(
            "appsrc name=src format=time ! videoconvert ! x264enc ! mp4mux \
             ! filesink name=sink",
        )
        .map_err(|e| encode_error(e.to_string()))?
        .downcast::<gst::Pipeline>()
        .map_err(|_| encode_error("Failed to cast to Pipeline".to_string()))?;

        pipeline
            .by_name("sink")
            .ok_or_else(|| encode_error("filesink not found".to_string()))?
            .set_property("location", location);

        let appsrc = pipeline
            .by_name("src")
            .ok_or_else(|| encode_error("appsrc not found".to_string()))?
            .downcast::<gst_app::AppSrc>()
            .map_err(|_| encode_error("Could not cast to AppSrc".to_string()))?;

        let rate = gst::Fraction::approximate_f64(info.fps).unwrap_or(gst::Fraction::new(30, 1));
        let video_info =
            gst_video::VideoInfo::builder(gst_video::VideoFormat::Rgb, info.width, info.height)
                .fps(rate)
                .build()
                .map_err(|e| encode_error(e.to_string()))?;
        let caps = video_info
            .to_caps()
            .map_err(|e| encode_error(e.to_string()))?;
        appsrc.set_caps(Some(&caps));

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| encode_error(e.to_string()))?;

        let result = push_frames(&appsrc, frames, &video_info, info.fps)
            .and_then(|()| wait_for_eos(&pipeline));
        let _ = pipeline.set_state(gst::State::Null);
        result.map_err(encode_error)?;

        info!(
            path = %path.display(),
            frames = frames.len(),
            fps = info.fps,
            "Encoded video"
        );

        Ok(())
    }
}

fn push_frames(
    appsrc: &gst_app::AppSrc,
    frames: &[RgbImage],
    video_info: &gst_video::VideoInfo,
    fps: f64,
) -> Result<(), String> {
    let fps = if fps > 0.0 { fps } else { FALLBACK_FPS };
    let frame_ns = (1_000_000_000f64 / fps).round() as u64;
    let stride = video_info.stride()[0] as usize;
    let height = video_info.height() as usize;

    for (i, image) in frames.iter().enumerate() {
        let row = image.width() as usize * 3;
        // RGB rows are padded to a 4-byte stride on the GStreamer side.
        let data = if stride == row {
            image.as_raw().clone()
        } else {
            let mut padded = vec![0u8; stride * height];
            for (y, line) in image.as_raw().chunks_exact(row).enumerate().take(height) {
                padded[y * stride..y * stride + row].copy_from_slice(line);
            }
            padded
        };

        let mut buffer = gst::Buffer::from_mut_slice(data);
        {
            let buffer = buffer.make_mut();
            buffer.set_pts(gst::ClockTime::from_nseconds(i as u64 * frame_ns));
            buffer.set_duration(gst::ClockTime::from_nseconds(frame_ns));
        }

        appsrc
            .push_buffer(buffer)
            .map_err(|e| format!("push of frame {} refused: {:?}", i, e))?;
    }

    appsrc
        .end_of_stream()
        .map_err(|e| format!("end of stream refused: {:?}", e))?;

    Ok(())
}

fn wait_for_eos(pipeline: &gst::Pipeline) -> Result<(), String> {
    let bus = pipeline.bus().ok_or_else(|| "pipeline has no bus".to_string())?;

    for message in bus.iter_timed(gst::ClockTime::NONE) {
        match message.view() {
            gst::MessageView::Eos(..) => return Ok(()),
            gst::MessageView::Error(err) => return Err(error_text(err)),
            _ => {}
        }
    }

    Err("bus closed before end of stream".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_returns_sample_once_ready() {
        let mut pulls = 0;
        let result = wait_for(
            Duration::from_secs(5),
            Duration::from_millis(1),
            |_| {
                pulls += 1;
                (pulls == 3).then_some("sample")
            },
            || None,
        );

        assert_eq!(result, Ok("sample"));
        assert_eq!(pulls, 3);
    }

    #[test]
    fn test_wait_stops_on_bus_error_without_sample() {
        // A stream whose only pad never links posts an error but never prerolls
        let mut pulls = 0;
        let result: Result<(), Stop> = wait_for(
            Duration::from_secs(60),
            Duration::from_millis(1),
            |_| {
                pulls += 1;
                None
            },
            || Some(Stop::Failed("Internal data stream error".to_string())),
        );

        assert_eq!(
            result,
            Err(Stop::Failed("Internal data stream error".to_string()))
        );
        assert_eq!(pulls, 1);
    }

    #[test]
    fn test_wait_reports_end_of_stream() {
        let result: Result<(), Stop> = wait_for(
            Duration::from_secs(60),
            Duration::from_millis(1),
            |_| None,
            || Some(Stop::Ended),
        );
        assert_eq!(result, Err(Stop::Ended));
    }

    #[test]
    fn test_wait_gives_up_after_timeout() {
        let mut slices = Vec::new();
        let started = Instant::now();
        let result: Result<(), Stop> = wait_for(
            Duration::from_millis(30),
            Duration::from_millis(10),
            |slice| {
                slices.push(slice);
                std::thread::sleep(slice);
                None
            },
            || None,
        );

        assert_eq!(result, Err(Stop::TimedOut));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(slices.len() >= 2);
        assert!(slices.iter().all(|slice| *slice <= Duration::from_millis(10)));
    }
}
