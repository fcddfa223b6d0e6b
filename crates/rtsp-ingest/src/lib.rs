//! RTSP still-image ingest for the snapshot agent.
//!
//! The crate owns everything between an `rtsp://` URL and one encoded still
//! image:
//! - `client`: RTSP/1.0 exchanges and TCP-interleaved RTP demuxing.
//! - `sdp`: session description parsing and parameter-set recovery.
//! - `rtp`: H.264/H.265 depacketization into NAL units.
//! - `decoder`: the `FrameDecoder` capability and its FFmpeg-backed
//!   implementation.
//! - `grabber`: the per-camera DESCRIBE/SETUP/PLAY/PAUSE state machine.

pub mod client;
pub mod decoder;
pub mod error;
pub mod grabber;
pub mod rtp;
pub mod sdp;

pub use decoder::{Codec, DecoderProvider, FfmpegDecoderProvider, FrameDecoder};
pub use error::{DecoderError, GrabberError, RtpError, RtspError, SdpError};
pub use grabber::{FrameGrabber, GrabbedFrame, GrabberState};
