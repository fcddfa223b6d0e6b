//! Frame decoding behind a narrow capability trait.
//!
//! The grabber never touches codec internals: it pushes parameter sets and
//! coded NAL units into a [`FrameDecoder`] and takes the first still image
//! that comes out. The production implementation drives an `ffmpeg` child
//! process decoding Annex-B input into a single PNG; tests substitute a pure
//! software double through [`DecoderProvider`].

use std::io::Write;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver};
use tracing::debug;

use crate::error::DecoderError;

/// Annex-B start code prepended to every NAL unit fed to a decoder.
const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// How long `push_nalu` waits for an image that may already be in flight.
const IMAGE_POLL: Duration = Duration::from_millis(5);

/// Video codec negotiated for a grabber session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Codec {
    H264,
    H265,
}

impl Codec {
    pub fn name(&self) -> &'static str {
        match self {
            Codec::H264 => "H264",
            Codec::H265 => "H265",
        }
    }

    /// FFmpeg demuxer name for raw Annex-B input of this codec.
    fn demuxer(&self) -> &'static str {
        match self {
            Codec::H264 => "h264",
            Codec::H265 => "hevc",
        }
    }
}

/// Capability consumed by the grabber to turn NAL units into one still image.
pub trait FrameDecoder: Send {
    /// Feed a parameter set (SPS/PPS, and VPS for H.265) before any slice.
    fn push_parameter_set(&mut self, nalu: &[u8]) -> Result<(), DecoderError>;

    /// Feed one coded NAL unit; returns an encoded still image once the
    /// decoder has assembled a full picture.
    fn push_nalu(&mut self, nalu: &[u8]) -> Result<Option<Vec<u8>>, DecoderError>;

    /// Release decoder resources. Idempotent.
    fn close(&mut self);
}

/// Factory seam for decoders, so sessions and tests pick implementations.
pub trait DecoderProvider: Send + Sync {
    fn create(&self, codec: Codec) -> Result<Box<dyn FrameDecoder>, DecoderError>;
}

/// Provider backed by an `ffmpeg` child process per grabber session.
#[derive(Debug, Default)]
pub struct FfmpegDecoderProvider;

impl DecoderProvider for FfmpegDecoderProvider {
    fn create(&self, codec: Codec) -> Result<Box<dyn FrameDecoder>, DecoderError> {
        Ok(Box::new(FfmpegFrameDecoder::spawn(codec)?))
    }
}

/// Decoder that streams Annex-B NAL units into `ffmpeg` and reads back the
/// first decoded picture as PNG.
///
/// The child is started with `-frames:v 1`, so it exits on its own after
/// emitting one image; a reader thread forwards the finished PNG through a
/// channel the way the ingest readers hand frames back to their callers.
pub struct FfmpegFrameDecoder {
    child: Child,
    stdin: Option<ChildStdin>,
    image_rx: Receiver<Vec<u8>>,
    reader: Option<JoinHandle<()>>,
    closed: bool,
}

impl FfmpegFrameDecoder {
    fn spawn(codec: Codec) -> Result<Self, DecoderError> {
        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-f")
            .arg(codec.demuxer())
            .arg("-i")
            .arg("pipe:0")
            .arg("-frames:v")
            .arg("1")
            .arg("-c:v")
            .arg("png")
            .arg("-f")
            .arg("image2pipe")
            .arg("pipe:1");
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let mut child = cmd.spawn().map_err(DecoderError::Spawn)?;
        let stdin = child.stdin.take();
        let mut stdout = child.stdout.take().ok_or_else(|| {
            DecoderError::Spawn(std::io::Error::other("decoder stdout unavailable"))
        })?;

        let (image_tx, image_rx) = bounded::<Vec<u8>>(1);
        let reader = thread::Builder::new()
            .name("h26x-decoder-reader".to_string())
            .spawn(move || {
                use std::io::Read;
                let mut image = Vec::new();
                if stdout.read_to_end(&mut image).is_ok() && !image.is_empty() {
                    let _ = image_tx.send(image);
                }
            })
            .map_err(DecoderError::Spawn)?;

        Ok(Self {
            child,
            stdin,
            image_rx,
            reader: Some(reader),
            closed: false,
        })
    }

    fn write_annex_b(&mut self, nalu: &[u8]) -> Result<(), std::io::Error> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| std::io::Error::other("decoder stdin closed"))?;
        stdin.write_all(&START_CODE)?;
        stdin.write_all(nalu)?;
        stdin.flush()
    }
}

impl FrameDecoder for FfmpegFrameDecoder {
    fn push_parameter_set(&mut self, nalu: &[u8]) -> Result<(), DecoderError> {
        self.write_annex_b(nalu).map_err(DecoderError::Write)
    }

    fn push_nalu(&mut self, nalu: &[u8]) -> Result<Option<Vec<u8>>, DecoderError> {
        if let Ok(image) = self.image_rx.try_recv() {
            return Ok(Some(image));
        }

        if let Err(err) = self.write_annex_b(nalu) {
            // A closed pipe usually means the child already produced its
            // single frame and exited; the image settles through the reader.
            return match self.image_rx.recv_timeout(IMAGE_POLL) {
                Ok(image) => Ok(Some(image)),
                Err(_) => Err(DecoderError::Write(err)),
            };
        }

        match self.image_rx.recv_timeout(IMAGE_POLL) {
            Ok(image) => Ok(Some(image)),
            Err(_) => Ok(None),
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        drop(self.stdin.take());
        if let Err(err) = self.child.kill() {
            debug!("failed to kill decoder process: {err}");
        }
        let _ = self.child.wait();
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

impl Drop for FfmpegFrameDecoder {
    fn drop(&mut self) {
        self.close();
    }
}
