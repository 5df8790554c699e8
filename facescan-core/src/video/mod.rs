//! video — FFmpeg bridge
//!
//! Opens a video, iterates decoded frames as packed RGB24, and optionally
//! re-encodes whatever the frame callback leaves behind into an H.264 file.
//! Packets the decoder rejects are surfaced as [`FrameEvent::Unreadable`] and
//! the loop moves on to the next packet.

use anyhow::{Context, Result, bail};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{
    codec, encoder, format, frame, media, software::scaling, util::rational::Rational,
};
use image::RgbImage;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Output pixel format for the encoder (YUV420p is universally compatible).
const ENCODE_FORMAT: format::Pixel = format::Pixel::YUV420P;
/// Scaler flags shared by the decode and encode converters.
const SCALE_FLAGS: scaling::Flags = scaling::Flags::BILINEAR;

/// A single decoded video frame in RGB24 format, along with its presentation
/// timestamp (in the source stream's time-base units).
#[derive(Debug, Clone)]
pub struct RgbFrame {
    pub data: Vec<u8>, // packed RGB24, row-major
    pub width: u32,
    pub height: u32,
    pub pts: i64,
}

impl RgbFrame {
    /// A black frame of the given size.
    pub fn blank(width: u32, height: u32) -> Self {
        Self {
            data: vec![0u8; (width * height * 3) as usize],
            width,
            height,
            pts: 0,
        }
    }

    /// Move the pixel buffer into an `image::RgbImage`, leaving this frame empty.
    pub fn take_image(&mut self) -> Result<RgbImage> {
        let data = std::mem::take(&mut self.data);
        RgbImage::from_raw(self.width, self.height, data).with_context(|| {
            format!(
                "frame buffer does not match {}x{} RGB24",
                self.width, self.height
            )
        })
    }

    /// Put a (possibly modified) image back into this frame.
    pub fn restore_image(&mut self, img: RgbImage) {
        let (width, height) = img.dimensions();
        self.width = width;
        self.height = height;
        self.data = img.into_raw();
    }
}

/// What the frame callback receives for each video packet.
pub enum FrameEvent<'a> {
    /// A decoded frame; modify in-place to change what gets encoded.
    Decoded(&'a mut RgbFrame),
    /// The decoder could not produce a frame. The loop has already logged it
    /// and moves on to the next packet.
    Unreadable,
}

/// Counts reported once the decode loop ends.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FrameTally {
    pub decoded: u64,
    pub unreadable: u64,
    pub stopped_early: bool,
}

impl FrameTally {
    pub fn total(&self) -> u64 {
        self.decoded + self.unreadable
    }
}

/// Container-level metadata for a video stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoInfo {
    pub frame_count: u64,
    pub fps: f64,
    pub duration_secs: f64,
    pub width: u32,
    pub height: u32,
}

/// Read frame count, frame rate and duration of the best video stream.
///
/// When the container does not store a frame count it is estimated from the
/// stream duration; duration is `frame_count / fps` (zero when fps is unknown).
pub fn probe<P: AsRef<Path>>(input_path: P) -> Result<VideoInfo> {
    ffmpeg::init().context("failed to initialise FFmpeg")?;
    let path = input_path.as_ref();
    let ictx = format::input(&path)
        .with_context(|| format!("could not open input file {}", path.display()))?;
    let stream = ictx
        .streams()
        .best(media::Type::Video)
        .context("no video stream found in input")?;

    let rate = stream.avg_frame_rate();
    let fps = if rate.denominator() > 0 {
        rate.numerator() as f64 / rate.denominator() as f64
    } else {
        0.0
    };

    let mut frame_count = stream.frames().max(0) as u64;
    if frame_count == 0 {
        // nb_frames is not set by every muxer; fall back to duration × fps.
        let dur = stream.duration();
        let tb = stream.time_base();
        if dur > 0 && tb.denominator() > 0 && fps > 0.0 {
            let seconds = dur as f64 * tb.numerator() as f64 / tb.denominator() as f64;
            frame_count = (seconds * fps).round() as u64;
        }
    }

    let duration_secs = if fps > 0.0 {
        frame_count as f64 / fps
    } else {
        0.0
    };

    let params = codec::context::Context::from_parameters(stream.parameters())
        .context("failed to read stream parameters")?
        .decoder()
        .video()
        .context("failed to open video decoder")?;

    Ok(VideoInfo {
        frame_count,
        fps,
        duration_secs,
        width: params.width(),
        height: params.height(),
    })
}

/// Decode every frame of `input_path` and hand it to `frame_fn`. Returning
/// `ControlFlow::Break` stops decoding.
pub fn for_each_frame<P, F>(input_path: P, mut frame_fn: F) -> Result<FrameTally>
where
    P: AsRef<Path>,
    F: FnMut(FrameEvent<'_>) -> ControlFlow<()>,
{
    run_frames(input_path.as_ref(), None, &mut frame_fn)
}

/// Same as [`for_each_frame`], and additionally encode every decoded frame
/// (as left by `frame_fn`) to `output_path` as H.264. Audio is stream-copied.
///
/// The output size is fixed by the first frame the callback returns; every
/// later frame must have the same dimensions.
pub fn transcode<P, Q, F>(input_path: P, output_path: Q, mut frame_fn: F) -> Result<FrameTally>
where
    P: AsRef<Path>,
    Q: AsRef<Path>,
    F: FnMut(FrameEvent<'_>) -> ControlFlow<()>,
{
    run_frames(
        input_path.as_ref(),
        Some(output_path.as_ref()),
        &mut frame_fn,
    )
}

fn run_frames(
    input_path: &Path,
    output_path: Option<&Path>,
    frame_fn: &mut dyn FnMut(FrameEvent<'_>) -> ControlFlow<()>,
) -> Result<FrameTally> {
    ffmpeg::init().context("failed to initialise FFmpeg")?;

    // ── Input ────────────────────────────────────────────────────────────────
    let mut ictx = format::input(&input_path)
        .with_context(|| format!("could not open input file {}", input_path.display()))?;

    let (video_stream_index, video_time_base, frame_rate, video_params) = {
        let stream = ictx
            .streams()
            .best(media::Type::Video)
            .context("no video stream found in input")?;
        (
            stream.index(),
            stream.time_base(),
            stream.avg_frame_rate(),
            stream.parameters(),
        )
    };
    let audio_stream = ictx
        .streams()
        .best(media::Type::Audio)
        .map(|s| (s.index(), s.parameters()));

    let decoder_ctx = codec::context::Context::from_parameters(video_params)
        .context("failed to build decoder context")?;
    let mut decoder = decoder_ctx
        .decoder()
        .video()
        .context("failed to open video decoder")?;

    let src_width = decoder.width();
    let src_height = decoder.height();
    let src_pixel_fmt = decoder.format();

    info!(
        src_width,
        src_height,
        ?src_pixel_fmt,
        "opened input video stream"
    );

    let mut converter = RgbConverter {
        to_rgb: scaling::Context::get(
            src_pixel_fmt,
            src_width,
            src_height,
            format::Pixel::RGB24,
            src_width,
            src_height,
            SCALE_FLAGS,
        )
        .context("failed to create to-RGB scaler")?,
        rgb_frame: frame::Video::empty(),
        width: src_width,
        height: src_height,
    };

    // ── Output (optional) ────────────────────────────────────────────────────
    let mut sink = match output_path {
        Some(path) => Some(EncodeSink::create(
            path,
            audio_stream,
            video_time_base,
            frame_rate,
        )?),
        None => None,
    };

    // ── Decode / callback / encode loop ──────────────────────────────────────
    let mut tally = FrameTally::default();
    let mut decoded_frame = frame::Video::empty();

    'packets: for (stream, packet) in ictx.packets() {
        let stream_index = stream.index();

        if let Some(sink) = sink.as_mut() {
            if sink.is_audio(stream_index) {
                sink.write_audio(&packet, stream.time_base())?;
                continue;
            }
        }

        if stream_index != video_stream_index {
            continue;
        }

        if let Err(e) = decoder.send_packet(&packet) {
            tally.unreadable += 1;
            warn!(frame = tally.total(), error = %e, "frame could not be read");
            if frame_fn(FrameEvent::Unreadable).is_break() {
                tally.stopped_early = true;
                break;
            }
            continue;
        }

        while decoder.receive_frame(&mut decoded_frame).is_ok() {
            let flow = deliver(
                &decoded_frame,
                &mut converter,
                &mut tally,
                sink.as_mut(),
                frame_fn,
            )?;
            if flow.is_break() {
                tally.stopped_early = true;
                break 'packets;
            }
        }
    }

    if !tally.stopped_early {
        // Drain frames still buffered in the decoder.
        decoder.send_eof().ok();
        while decoder.receive_frame(&mut decoded_frame).is_ok() {
            let flow = deliver(
                &decoded_frame,
                &mut converter,
                &mut tally,
                sink.as_mut(),
                frame_fn,
            )?;
            if flow.is_break() {
                tally.stopped_early = true;
                break;
            }
        }
    }

    if let Some(sink) = sink {
        sink.finish()?;
    }

    info!(
        decoded = tally.decoded,
        unreadable = tally.unreadable,
        "decode complete"
    );
    Ok(tally)
}

struct RgbConverter {
    to_rgb: scaling::Context,
    rgb_frame: frame::Video,
    width: u32,
    height: u32,
}

impl RgbConverter {
    /// Convert to RGB24 and compact to a plain `Vec<u8>` (strips stride padding).
    fn convert(&mut self, decoded: &frame::Video) -> Result<Vec<u8>> {
        self.to_rgb
            .run(decoded, &mut self.rgb_frame)
            .context("to-RGB scaling failed")?;

        let stride = self.rgb_frame.stride(0);
        let raw = self.rgb_frame.data(0);
        let row_len = self.width as usize * 3;
        let mut rgb_data = Vec::with_capacity(row_len * self.height as usize);
        for row in 0..self.height as usize {
            let start = row * stride;
            rgb_data.extend_from_slice(&raw[start..start + row_len]);
        }
        Ok(rgb_data)
    }
}

fn deliver(
    decoded: &frame::Video,
    converter: &mut RgbConverter,
    tally: &mut FrameTally,
    sink: Option<&mut EncodeSink>,
    frame_fn: &mut dyn FnMut(FrameEvent<'_>) -> ControlFlow<()>,
) -> Result<ControlFlow<()>> {
    let data = match converter.convert(decoded) {
        Ok(data) => data,
        Err(e) => {
            tally.unreadable += 1;
            warn!(frame = tally.total(), error = %e, "frame could not be read");
            return Ok(frame_fn(FrameEvent::Unreadable));
        }
    };

    tally.decoded += 1;
    let mut rgb = RgbFrame {
        data,
        width: converter.width,
        height: converter.height,
        pts: decoded.pts().unwrap_or(tally.decoded as i64),
    };

    let flow = frame_fn(FrameEvent::Decoded(&mut rgb));

    if let Some(sink) = sink {
        sink.encode(&rgb)?;
    }
    if tally.decoded % 100 == 0 {
        debug!(frames = tally.decoded, "decoded frames");
    }
    Ok(flow)
}

// ── Encoder ──────────────────────────────────────────────────────────────────

struct EncoderState {
    video_encoder: encoder::Video,
    to_yuv: scaling::Context,
    out_rgb_frame: frame::Video,
    yuv_frame: frame::Video,
    video_out_index: usize,
    out_width: u32,
    out_height: u32,
}

/// H.264 muxer whose video stream is opened lazily on the first frame, once
/// the output dimensions are known.
struct EncodeSink {
    octx: format::context::Output,
    output_path: PathBuf,
    encoder_codec: ffmpeg::Codec,
    global_header: bool,
    time_base: Rational,
    frame_rate: Rational,
    /// (input audio stream index, output audio stream index)
    audio: Option<(usize, usize)>,
    /// Audio packets that arrive before the header is written.
    audio_buffer: Vec<(ffmpeg::Packet, Rational)>,
    state: Option<EncoderState>,
}

impl EncodeSink {
    fn create(
        output_path: &Path,
        audio_stream: Option<(usize, codec::Parameters)>,
        time_base: Rational,
        frame_rate: Rational,
    ) -> Result<Self> {
        let mut octx = format::output(&output_path).with_context(|| {
            format!("could not create output context {}", output_path.display())
        })?;

        let global_header = octx
            .format()
            .flags()
            .contains(format::flag::Flags::GLOBAL_HEADER);

        let encoder_codec = encoder::find(codec::Id::H264)
            .context("H.264 encoder not found; is FFmpeg built with libx264?")?;

        let audio = match audio_stream {
            Some((ai, params)) => {
                let mut audio_out = octx.add_stream(codec::Id::None)?;
                audio_out.set_parameters(params);
                Some((ai, audio_out.index()))
            }
            None => None,
        };

        Ok(Self {
            octx,
            output_path: output_path.to_path_buf(),
            encoder_codec,
            global_header,
            time_base,
            frame_rate,
            audio,
            audio_buffer: Vec::new(),
            state: None,
        })
    }

    fn is_audio(&self, stream_index: usize) -> bool {
        self.audio.is_some_and(|(ai, _)| ai == stream_index)
    }

    fn out_time_base(&self, index: usize) -> Result<Rational> {
        Ok(self
            .octx
            .stream(index)
            .context("output stream disappeared")?
            .time_base())
    }

    fn write_audio(&mut self, packet: &ffmpeg::Packet, src_tb: Rational) -> Result<()> {
        let Some((_, ao)) = self.audio else {
            return Ok(());
        };
        if self.state.is_none() {
            self.audio_buffer.push((packet.clone(), src_tb));
            return Ok(());
        }
        let mut pkt = packet.clone();
        pkt.set_stream(ao);
        pkt.rescale_ts(src_tb, self.out_time_base(ao)?);
        pkt.write_interleaved(&mut self.octx)
            .context("failed to write audio packet")
    }

    fn open_video(&mut self, out_w: u32, out_h: u32) -> Result<()> {
        let mut video_out_stream = self.octx.add_stream(self.encoder_codec)?;
        let encoder_ctx = codec::context::Context::new_with_codec(self.encoder_codec);
        let mut builder = encoder_ctx.encoder().video()?;

        builder.set_width(out_w);
        builder.set_height(out_h);
        builder.set_format(ENCODE_FORMAT);
        builder.set_time_base(self.time_base);
        builder.set_frame_rate(Some(self.frame_rate));
        if self.global_header {
            builder.set_flags(codec::flag::Flags::GLOBAL_HEADER);
        }

        let video_encoder = builder
            .open_as_with(
                self.encoder_codec,
                ffmpeg::Dictionary::from_iter([("crf", "23"), ("preset", "fast")]),
            )
            .context("failed to open H.264 encoder")?;

        video_out_stream.set_parameters(&video_encoder);
        let video_out_index = video_out_stream.index();

        let to_yuv = scaling::Context::get(
            format::Pixel::RGB24,
            out_w,
            out_h,
            ENCODE_FORMAT,
            out_w,
            out_h,
            SCALE_FLAGS,
        )
        .context("failed to create to-YUV scaler")?;

        info!(out_w, out_h, output = %self.output_path.display(), "writing annotated video");
        self.octx
            .write_header()
            .context("failed to write output header")?;

        if let Some((_, ao)) = self.audio {
            let dst_tb = self.out_time_base(ao)?;
            for (mut pkt, src_tb) in self.audio_buffer.drain(..) {
                pkt.set_stream(ao);
                pkt.rescale_ts(src_tb, dst_tb);
                pkt.write_interleaved(&mut self.octx)
                    .context("failed to write buffered audio packet")?;
            }
        }

        self.state = Some(EncoderState {
            video_encoder,
            to_yuv,
            out_rgb_frame: frame::Video::new(format::Pixel::RGB24, out_w, out_h),
            yuv_frame: frame::Video::empty(),
            video_out_index,
            out_width: out_w,
            out_height: out_h,
        });
        Ok(())
    }

    fn encode(&mut self, rgb: &RgbFrame) -> Result<()> {
        if self.state.is_none() {
            self.open_video(rgb.width, rgb.height)?;
        }
        let time_base = self.time_base;
        let Some(state) = self.state.as_mut() else {
            bail!("encoder was not initialised");
        };

        if rgb.width != state.out_width || rgb.height != state.out_height {
            bail!(
                "frame size changed from {}x{} to {}x{} mid-stream",
                state.out_width,
                state.out_height,
                rgb.width,
                rgb.height
            );
        }

        let out_stride = state.out_rgb_frame.stride(0);
        let row_len = state.out_width as usize * 3;
        let plane_data = state.out_rgb_frame.data_mut(0);
        for row in 0..state.out_height as usize {
            let dst_start = row * out_stride;
            let src_start = row * row_len;
            plane_data[dst_start..dst_start + row_len]
                .copy_from_slice(&rgb.data[src_start..src_start + row_len]);
        }

        state
            .to_yuv
            .run(&state.out_rgb_frame, &mut state.yuv_frame)
            .context("to-YUV scaling failed")?;
        state.yuv_frame.set_pts(Some(rgb.pts));

        state
            .video_encoder
            .send_frame(&state.yuv_frame)
            .context("encoder send_frame")?;

        flush_encoder(
            &mut state.video_encoder,
            &mut self.octx,
            state.video_out_index,
            time_base,
        )
    }

    fn finish(mut self) -> Result<()> {
        let Some(state) = self.state.as_mut() else {
            warn!(output = %self.output_path.display(), "no frames encoded; output left empty");
            return Ok(());
        };

        state.video_encoder.send_eof().ok();
        flush_encoder(
            &mut state.video_encoder,
            &mut self.octx,
            state.video_out_index,
            self.time_base,
        )?;

        self.octx
            .write_trailer()
            .context("failed to write output trailer")?;
        Ok(())
    }
}

/// Drain all pending packets from the encoder and write them to the muxer.
fn flush_encoder(
    encoder: &mut encoder::Video,
    octx: &mut format::context::Output,
    stream_index: usize,
    time_base: Rational,
) -> Result<()> {
    let mut encoded = ffmpeg::Packet::empty();
    while encoder.receive_packet(&mut encoded).is_ok() {
        let out_tb = octx
            .stream(stream_index)
            .context("output video stream disappeared")?
            .time_base();
        encoded.set_stream(stream_index);
        encoded.rescale_ts(time_base, out_tb);
        encoded
            .write_interleaved(octx)
            .context("failed to write encoded packet")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn image_round_trip_keeps_dimensions_and_pixels() {
        let mut frame = RgbFrame::blank(4, 2);
        frame.pts = 42;
        let mut img = frame.take_image().unwrap();
        assert!(frame.data.is_empty());
        img.put_pixel(3, 1, Rgb([9, 8, 7]));
        frame.restore_image(img);

        assert_eq!((frame.width, frame.height, frame.pts), (4, 2, 42));
        let idx = (4 + 3) * 3;
        assert_eq!(&frame.data[idx..idx + 3], &[9, 8, 7]);
    }

    #[test]
    fn take_image_rejects_short_buffer() {
        let mut frame = RgbFrame {
            data: vec![0; 5],
            width: 2,
            height: 2,
            pts: 0,
        };
        assert!(frame.take_image().is_err());
    }

    #[test]
    fn tally_total_counts_unreadable_frames() {
        let tally = FrameTally {
            decoded: 7,
            unreadable: 3,
            stopped_early: false,
        };
        assert_eq!(tally.total(), 10);
    }

    #[test]
    fn probe_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(probe(dir.path().join("missing.mp4")).is_err());
    }
}
