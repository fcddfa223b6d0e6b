//! Error types shared by the RTSP ingest layers.

use thiserror::Error;

use crate::grabber::GrabberState;

/// Errors raised by the RTSP wire client.
#[derive(Debug, Error)]
pub enum RtspError {
    #[error("I/O failure on RTSP transport: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed RTSP message: {0}")]
    Protocol(String),
    #[error("{method} rejected with status {status}")]
    Status { method: &'static str, status: u16 },
    #[error("server closed the RTSP connection")]
    ConnectionClosed,
}

/// Errors raised while parsing a session description.
#[derive(Debug, Error)]
pub enum SdpError {
    #[error("malformed SDP line {0:?}")]
    MalformedLine(String),
    #[error("malformed parameter set in fmtp attribute: {0}")]
    BadParameterSet(String),
}

/// Depacketization outcomes that are not full access units.
///
/// `MorePacketsNeeded` and `NonStartingFragment` are expected mid-stream
/// conditions; callers skip the packet and keep reading.
#[derive(Debug, Error)]
pub enum RtpError {
    #[error("packet too short for RTP framing")]
    Truncated,
    #[error("unsupported RTP version {0}")]
    BadVersion(u8),
    #[error("more packets needed to complete the fragmented unit")]
    MorePacketsNeeded,
    #[error("non-starting fragment without a preceding start")]
    NonStartingFragment,
    #[error("unsupported packetization type {0}")]
    UnsupportedPacketization(u8),
}

impl RtpError {
    /// True for conditions that are part of normal fragmented reassembly.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RtpError::MorePacketsNeeded | RtpError::NonStartingFragment
        )
    }
}

/// Errors raised by a [`crate::decoder::FrameDecoder`] implementation.
#[derive(Debug, Error)]
pub enum DecoderError {
    #[error("failed to spawn decoder process: {0}")]
    Spawn(std::io::Error),
    #[error("failed to feed decoder input: {0}")]
    Write(std::io::Error),
    #[error("decoder exited without producing an image")]
    NoImage,
}

/// Errors surfaced by [`crate::grabber::FrameGrabber`] operations.
#[derive(Debug, Error)]
pub enum GrabberError {
    #[error("invalid RTSP URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("error connecting to camera at {endpoint}")]
    ConnectFailed {
        endpoint: String,
        #[source]
        source: RtspError,
    },
    #[error("DESCRIBE exchange failed")]
    DescribeFailed(#[source] RtspError),
    #[error("session description could not be parsed")]
    BadDescription(#[source] SdpError),
    #[error("session offers no H.264 or H.265 media")]
    MediaNotFound,
    #[error("frame decoder initialization failed")]
    CodecInitFailed(#[source] DecoderError),
    #[error("SETUP exchange failed")]
    SetupFailed(#[source] RtspError),
    #[error("PLAY exchange failed")]
    PlayFailed(#[source] RtspError),
    #[error("PAUSE exchange failed")]
    PauseFailed(#[source] RtspError),
    #[error("timed out waiting for a decodable frame")]
    FrameTimeout,
    #[error("RTSP transport failed mid-stream")]
    Transport(#[source] RtspError),
    #[error("operation {operation} is invalid while the grabber is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: GrabberState,
    },
    #[error("{left}; {right}")]
    Joined {
        left: Box<GrabberError>,
        right: Box<GrabberError>,
    },
}

impl GrabberError {
    /// Combine two errors raised on the same exit path.
    pub fn join(left: GrabberError, right: GrabberError) -> GrabberError {
        GrabberError::Joined {
            left: Box::new(left),
            right: Box::new(right),
        }
    }
}
