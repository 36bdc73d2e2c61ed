//! Frame buffers.
//!
//! A `Frame` is a packed 8-bit three-channel image with an explicit channel order.
//! Everything decoded from video is BGR; images loaded from disk are RGB. Frames
//! are transient: capture produces them, the model consumes them, the display
//! sink encodes the annotated copy, and nothing keeps them afterwards.

use anyhow::{anyhow, Context, Result};
use image::{imageops::FilterType, ImageBuffer, Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Width every frame is resized to before inference.
pub const DISPLAY_WIDTH: u32 = 720;

/// Height every frame is resized to before inference (720 * 9 / 16 = 405, exact).
pub const DISPLAY_HEIGHT: u32 = DISPLAY_WIDTH * 9 / 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOrder {
    Bgr,
    Rgb,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    data: Vec<u8>,
    width: u32,
    height: u32,
    channels: ChannelOrder,
}

impl Frame {
    /// Wrap a packed buffer. The length must be exactly `width * height * 3`.
    pub fn new(data: Vec<u8>, width: u32, height: u32, channels: ChannelOrder) -> Result<Self> {
        let expected = packed_len(width, height)?;
        if data.len() != expected {
            return Err(anyhow!(
                "frame length mismatch: expected {} bytes for {}x{}, got {}",
                expected,
                width,
                height,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            channels,
        })
    }

    /// A frame filled with one pixel value, given in the frame's own channel order.
    pub fn filled(width: u32, height: u32, channels: ChannelOrder, pixel: [u8; 3]) -> Self {
        let count = width as usize * height as usize;
        let mut data = Vec::with_capacity(count * 3);
        for _ in 0..count {
            data.extend_from_slice(&pixel);
        }
        Self {
            data,
            width,
            height,
            channels,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn channels(&self) -> ChannelOrder {
        self.channels
    }

    /// Label the stored bytes as `channels` without reordering them.
    pub fn reinterpret(mut self, channels: ChannelOrder) -> Self {
        self.channels = channels;
        self
    }

    /// Pixel at (x, y) as RGB regardless of storage order.
    pub fn rgb_at(&self, x: u32, y: u32) -> [u8; 3] {
        let idx = (y as usize * self.width as usize + x as usize) * 3;
        let px = [self.data[idx], self.data[idx + 1], self.data[idx + 2]];
        match self.channels {
            ChannelOrder::Rgb => px,
            ChannelOrder::Bgr => [px[2], px[1], px[0]],
        }
    }

    /// Reorder channels in place if needed.
    pub fn with_channels(mut self, channels: ChannelOrder) -> Self {
        if self.channels != channels {
            swap_red_blue(&mut self.data);
            self.channels = channels;
        }
        self
    }

    /// Bilinear resize to an exact size, keeping the channel order.
    pub fn resize(&self, width: u32, height: u32) -> Result<Frame> {
        if width == 0 || height == 0 {
            return Err(anyhow!("cannot resize frame to {}x{}", width, height));
        }
        if (width, height) == (self.width, self.height) {
            return Ok(self.clone());
        }
        let buffer = self.as_image_buffer()?;
        let resized = image::imageops::resize(&buffer, width, height, FilterType::Triangle);
        Ok(Self {
            data: resized.into_raw(),
            width,
            height,
            channels: self.channels,
        })
    }

    /// Resize to the canonical 720x405 inference/display size.
    pub fn resize_for_display(&self) -> Result<Frame> {
        self.resize(DISPLAY_WIDTH, DISPLAY_HEIGHT)
    }

    /// Copy into an `RgbImage`, swapping channels when the frame is BGR.
    pub fn to_rgb_image(&self) -> Result<RgbImage> {
        let rgb = self.clone().with_channels(ChannelOrder::Rgb);
        ImageBuffer::from_raw(rgb.width, rgb.height, rgb.data)
            .ok_or_else(|| anyhow!("frame buffer does not match its dimensions"))
    }

    /// Build a frame from an `RgbImage`, stored in the requested channel order.
    pub fn from_rgb_image(image: RgbImage, channels: ChannelOrder) -> Frame {
        let (width, height) = image.dimensions();
        Frame {
            data: image.into_raw(),
            width,
            height,
            channels: ChannelOrder::Rgb,
        }
        .with_channels(channels)
    }

    /// Load a still image from disk (any format the `image` crate decodes).
    pub fn load(path: &Path) -> Result<Frame> {
        let image = image::open(path)
            .with_context(|| format!("failed to decode image {}", path.display()))?;
        Ok(Self::from_rgb_image(image.into_rgb8(), ChannelOrder::Rgb))
    }

    /// Decode an in-memory image (uploads).
    pub fn decode(bytes: &[u8]) -> Result<Frame> {
        let image = image::load_from_memory(bytes).context("failed to decode uploaded image")?;
        Ok(Self::from_rgb_image(image.into_rgb8(), ChannelOrder::Rgb))
    }

    /// Encode as JPEG. The caller says how the stored bytes are ordered, the way a
    /// display widget is told `channels="BGR"`.
    pub fn encode_jpeg(&self, channels: ChannelOrder, quality: u8) -> Result<Vec<u8>> {
        let rgb = self.clone().reinterpret(channels).to_rgb_image()?;
        let mut out = Vec::new();
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality)
            .encode_image(&rgb)
            .context("jpeg encode")?;
        Ok(out)
    }

    fn as_image_buffer(&self) -> Result<ImageBuffer<Rgb<u8>, Vec<u8>>> {
        // Resampling is channel-agnostic, so BGR bytes ride in an Rgb container.
        ImageBuffer::from_raw(self.width, self.height, self.data.clone())
            .ok_or_else(|| anyhow!("frame buffer does not match its dimensions"))
    }
}

fn packed_len(width: u32, height: u32) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(3))
        .ok_or_else(|| anyhow!("frame dimensions overflow"))
}

fn swap_red_blue(data: &mut [u8]) {
    for px in data.chunks_exact_mut(3) {
        px.swap(0, 2);
    }
}
