//! FFmpeg capture for local files, RTSP and HTTP media URLs.
//!
//! Decodes the best video stream and converts each frame to packed BGR24 at its
//! native size. Running out of packets drains the decoder and then reports end
//! of stream; a dropped network stream looks the same.

use anyhow::{Context, Result};
use ffmpeg_next as ffmpeg;

use super::VideoCapture;
use crate::frame::{ChannelOrder, Frame};

pub(crate) struct FfmpegCapture {
    location: String,
    stream: Option<FfmpegStream>,
    frame_count: u64,
}

struct FfmpegStream {
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    eof_sent: bool,
}

impl FfmpegCapture {
    pub(crate) fn open(location: &str) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let input = ffmpeg::format::input(&location)
            .with_context(|| format!("failed to open '{}' with ffmpeg", location))?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow::anyhow!("'{}' has no video track", location))?;
        let stream_index = input_stream.index();
        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::BGR24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        log::info!(
            "FfmpegCapture: opened {} ({}x{})",
            location,
            decoder.width(),
            decoder.height()
        );

        Ok(Self {
            location: location.to_string(),
            stream: Some(FfmpegStream {
                input,
                stream_index,
                decoder,
                scaler,
                eof_sent: false,
            }),
            frame_count: 0,
        })
    }
}

impl FfmpegStream {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let mut decoded = ffmpeg::frame::Video::empty();
        loop {
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                return self.convert(&decoded).map(Some);
            }
            if self.eof_sent {
                return Ok(None);
            }

            let next = self
                .input
                .packets()
                .next()
                .map(|(stream, packet)| (stream.index(), packet));
            match next {
                Some((index, packet)) if index == self.stream_index => {
                    self.decoder
                        .send_packet(&packet)
                        .context("send packet to ffmpeg decoder")?;
                }
                Some(_) => continue,
                None => {
                    self.decoder.send_eof().context("flush ffmpeg decoder")?;
                    self.eof_sent = true;
                }
            }
        }
    }

    fn convert(&mut self, decoded: &ffmpeg::frame::Video) -> Result<Frame> {
        let mut bgr_frame = ffmpeg::frame::Video::empty();
        self.scaler
            .run(decoded, &mut bgr_frame)
            .context("scale frame to BGR")?;
        let (pixels, width, height) = frame_to_pixels(&bgr_frame)?;
        Frame::new(pixels, width, height, ChannelOrder::Bgr)
    }
}

impl VideoCapture for FfmpegCapture {
    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn read_frame(&mut self) -> Result<Option<Frame>> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(None);
        };
        let frame = stream.next_frame()?;
        match &frame {
            Some(_) => self.frame_count += 1,
            None => log::debug!(
                "FfmpegCapture: {} drained after {} frames",
                self.location,
                self.frame_count
            ),
        }
        Ok(frame)
    }

    fn release(&mut self) {
        // Dropping the stream closes the demuxer and the decoder.
        if self.stream.take().is_some() {
            log::info!(
                "FfmpegCapture: released {} after {} frames",
                self.location,
                self.frame_count
            );
        }
    }
}

fn frame_to_pixels(frame: &ffmpeg::frame::Video) -> Result<(Vec<u8>, u32, u32)> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        return Ok((
            data.get(..row_bytes * height as usize)
                .context("ffmpeg frame is shorter than its dimensions")?
                .to_vec(),
            width,
            height,
        ));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("ffmpeg frame row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}
