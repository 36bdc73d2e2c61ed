//! V4L2 webcam capture.
//!
//! Opens `/dev/video{index}`, asks for RGB3 at 1280x720 and accepts whatever
//! the driver settles on as long as it is RGB3 or YUYV. Frames are converted to
//! BGR in memory. A webcam never reports end of stream; read errors surface as
//! decode failures.

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;

use super::normalize::{normalize_to_bgr, PixelFormat};
use super::VideoCapture;
use crate::frame::{ChannelOrder, Frame};

const PREFERRED_WIDTH: u32 = 1280;
const PREFERRED_HEIGHT: u32 = 720;

pub(crate) struct V4l2Capture {
    device_path: String,
    state: Option<V4l2State>,
    width: u32,
    height: u32,
    format: PixelFormat,
    frame_count: u64,
}

#[self_referencing]
struct V4l2State {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Capture {
    pub(crate) fn open(index: u32) -> Result<Self> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let device_path = format!("/dev/video{}", index);
        let device = v4l::Device::with_path(&device_path)
            .with_context(|| format!("open v4l2 device {}", device_path))?;

        let mut format = device.format().context("read v4l2 format")?;
        format.width = PREFERRED_WIDTH;
        format.height = PREFERRED_HEIGHT;
        format.fourcc = v4l::FourCC::new(b"RGB3");
        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "V4l2Capture: failed to set format on {}: {}",
                    device_path,
                    err
                );
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };
        let pixel_format = PixelFormat::from_fourcc(&format.fourcc.repr).ok_or_else(|| {
            anyhow!(
                "{} delivers unsupported pixel format {}",
                device_path,
                format.fourcc
            )
        })?;

        let state = V4l2StateTryBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;

        log::info!(
            "V4l2Capture: opened {} ({}x{} {:?})",
            device_path,
            format.width,
            format.height,
            pixel_format
        );

        Ok(Self {
            device_path,
            state: Some(state),
            width: format.width,
            height: format.height,
            format: pixel_format,
            frame_count: 0,
        })
    }
}

impl VideoCapture for V4l2Capture {
    fn is_open(&self) -> bool {
        self.state.is_some()
    }

    fn read_frame(&mut self) -> Result<Option<Frame>> {
        use v4l::io::traits::CaptureStream;

        let (width, height, format) = (self.width, self.height, self.format);
        let Some(state) = self.state.as_mut() else {
            return Ok(None);
        };
        let pixels = state.with_stream_mut(|stream| -> Result<Vec<u8>> {
            let (buf, _meta) = stream.next().context("capture v4l2 frame")?;
            normalize_to_bgr(buf, width, height, format)
        })?;

        self.frame_count += 1;
        Frame::new(pixels, width, height, ChannelOrder::Bgr).map(Some)
    }

    fn release(&mut self) {
        if self.state.take().is_some() {
            log::info!(
                "V4l2Capture: released {} after {} frames",
                self.device_path,
                self.frame_count
            );
        }
    }
}
