//! Per-camera RTSP session state machine producing one still image.
//!
//! A [`FrameGrabber`] walks `Idle → Described → Ready → Playing → Paused`
//! and may move to the terminal `Closed` state from anywhere. One codec is
//! active per grabber for its lifetime; H.264 is preferred over H.265.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::client::{parse_target, RtspClient, Target};
use crate::decoder::{DecoderProvider, FrameDecoder};
use crate::error::GrabberError;
use crate::rtp::{self, Depacketizer};
use crate::sdp::{ParameterSets, SessionDescription};

/// Upper bound on a single socket wait inside the frame loop, so the
/// per-job deadline is re-checked at a steady cadence.
const READ_SLICE: Duration = Duration::from_millis(250);

/// Lifecycle states of a grabber.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GrabberState {
    Idle,
    Described,
    Ready,
    Playing,
    Paused,
    Closed,
}

/// A decoded still plus any non-fatal error raised on the exit path.
#[derive(Debug)]
pub struct GrabbedFrame {
    /// Encoded still image ready for upload.
    pub image: Vec<u8>,
    /// Set when PAUSE failed after the frame was already decoded.
    pub pause_warning: Option<GrabberError>,
}

struct ActiveSession {
    client: RtspClient,
    depacketizer: Box<dyn Depacketizer>,
    decoder: Box<dyn FrameDecoder>,
}

/// RTSP frame grabber for a single camera.
pub struct FrameGrabber {
    target: Target,
    deadline: Duration,
    provider: Arc<dyn DecoderProvider>,
    state: GrabberState,
    session: Option<ActiveSession>,
}

impl FrameGrabber {
    /// Validate the camera URL and prepare a grabber in `Idle` state.
    /// No I/O happens until [`FrameGrabber::open`].
    pub fn new(
        url: &str,
        deadline: Duration,
        provider: Arc<dyn DecoderProvider>,
    ) -> Result<Self, GrabberError> {
        let target = parse_target(url).map_err(|reason| GrabberError::InvalidUrl {
            url: url.to_string(),
            reason,
        })?;

        Ok(Self {
            target,
            deadline,
            provider,
            state: GrabberState::Idle,
            session: None,
        })
    }

    pub fn state(&self) -> GrabberState {
        self.state
    }

    /// Connect, DESCRIBE, select a codec, initialize the decoder with its
    /// parameter sets, and SETUP the media. Leaves the grabber `Ready`.
    pub fn open(&mut self) -> Result<(), GrabberError> {
        if self.state != GrabberState::Idle {
            return Err(GrabberError::InvalidState {
                operation: "open",
                state: self.state,
            });
        }

        let mut client =
            RtspClient::connect(&self.target, self.deadline).map_err(|source| {
                GrabberError::ConnectFailed {
                    endpoint: self.target.endpoint.clone(),
                    source,
                }
            })?;

        let sdp_text = client.describe().map_err(GrabberError::DescribeFailed)?;
        self.state = GrabberState::Described;

        let description =
            SessionDescription::parse(&sdp_text).map_err(GrabberError::BadDescription)?;
        let (codec, media, format) = description
            .video_format()
            .ok_or(GrabberError::MediaNotFound)?;
        debug!(codec = codec.name(), "selected camera codec");

        let mut decoder = self
            .provider
            .create(codec)
            .map_err(GrabberError::CodecInitFailed)?;
        let sets = ParameterSets::from_format(codec, format)
            .map_err(GrabberError::BadDescription)?;
        for set in sets.in_feed_order() {
            if let Err(err) = decoder.push_parameter_set(set) {
                decoder.close();
                return Err(GrabberError::CodecInitFailed(err));
            }
        }

        if let Err(err) = client.setup(media.control.as_deref()) {
            decoder.close();
            return Err(GrabberError::SetupFailed(err));
        }

        self.session = Some(ActiveSession {
            client,
            depacketizer: rtp::depacketizer_for(codec),
            decoder,
        });
        self.state = GrabberState::Ready;
        Ok(())
    }

    /// PLAY, wait for one decodable access unit, then PAUSE.
    ///
    /// Times out after the configured per-job deadline with
    /// [`GrabberError::FrameTimeout`]; PAUSE is attempted on every exit path.
    pub fn next_frame(&mut self) -> Result<GrabbedFrame, GrabberError> {
        if !matches!(self.state, GrabberState::Ready | GrabberState::Paused) {
            return Err(GrabberError::InvalidState {
                operation: "next_frame",
                state: self.state,
            });
        }
        let session = self
            .session
            .as_mut()
            .ok_or(GrabberError::InvalidState {
                operation: "next_frame",
                state: self.state,
            })?;

        session.client.play().map_err(GrabberError::PlayFailed)?;
        self.state = GrabberState::Playing;

        let deadline = Instant::now() + self.deadline;
        let image = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.state = GrabberState::Paused;
                return match session.client.pause() {
                    Ok(()) => Err(GrabberError::FrameTimeout),
                    Err(err) => Err(GrabberError::join(
                        GrabberError::FrameTimeout,
                        GrabberError::PauseFailed(err),
                    )),
                };
            }

            let packet = match session.client.read_packet(remaining.min(READ_SLICE)) {
                Ok(Some(packet)) if packet.channel == 0 => packet,
                Ok(_) => continue, // nothing yet, or RTCP on channel 1
                Err(err) => {
                    self.state = GrabberState::Paused;
                    let transport = GrabberError::Transport(err);
                    return match session.client.pause() {
                        Ok(()) => Err(transport),
                        Err(pause) => Err(GrabberError::join(
                            transport,
                            GrabberError::PauseFailed(pause),
                        )),
                    };
                }
            };

            let parsed = match rtp::parse_packet(&packet.payload) {
                Ok(parsed) => parsed,
                Err(err) => {
                    debug!("dropping malformed RTP packet: {err}");
                    continue;
                }
            };

            let units = match session.depacketizer.push(&parsed) {
                Ok(units) => units,
                Err(err) if err.is_transient() => continue,
                Err(err) => {
                    warn!("error depacketizing RTP payload: {err}");
                    continue;
                }
            };

            let mut produced = None;
            for unit in &units {
                match session.decoder.push_nalu(unit) {
                    Ok(Some(image)) => {
                        produced = Some(image);
                        break;
                    }
                    Ok(None) => {}
                    Err(err) => warn!("error decoding access unit: {err}"),
                }
            }

            match produced {
                Some(image) => break image,
                // Every NALU of this access unit produced no image yet.
                None => continue,
            }
        };

        self.state = GrabberState::Paused;
        let pause_warning = session
            .client
            .pause()
            .err()
            .map(GrabberError::PauseFailed);

        Ok(GrabbedFrame {
            image,
            pause_warning,
        })
    }

    /// Release the decoder and RTSP session. Idempotent; the grabber stays
    /// `Closed` and every later operation fails.
    pub fn close(&mut self) {
        if self.state == GrabberState::Closed {
            return;
        }
        if let Some(mut session) = self.session.take() {
            if let Err(err) = session.client.teardown() {
                debug!("TEARDOWN failed during close: {err}");
            }
            session.decoder.close();
        }
        self.state = GrabberState::Closed;
    }
}

impl Drop for FrameGrabber {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{Codec, FfmpegDecoderProvider};

    #[test]
    fn invalid_url_is_rejected_up_front() {
        let provider: Arc<dyn DecoderProvider> = Arc::new(FfmpegDecoderProvider);
        let err = FrameGrabber::new("http://not-rtsp/stream", Duration::from_secs(5), provider)
            .err()
            .expect("scheme must be rtsp");
        assert!(matches!(err, GrabberError::InvalidUrl { .. }));
    }

    #[test]
    fn close_is_terminal_and_idempotent() {
        let provider: Arc<dyn DecoderProvider> = Arc::new(FfmpegDecoderProvider);
        let mut grabber =
            FrameGrabber::new("rtsp://10.0.0.9/live", Duration::from_secs(5), provider).unwrap();
        assert_eq!(grabber.state(), GrabberState::Idle);

        grabber.close();
        grabber.close();
        assert_eq!(grabber.state(), GrabberState::Closed);

        assert!(matches!(
            grabber.open(),
            Err(GrabberError::InvalidState { state: GrabberState::Closed, .. })
        ));
        assert!(matches!(
            grabber.next_frame(),
            Err(GrabberError::InvalidState { state: GrabberState::Closed, .. })
        ));
    }

    #[test]
    fn codec_names_match_sdp_encodings() {
        assert_eq!(Codec::H264.name(), "H264");
        assert_eq!(Codec::H265.name(), "H265");
    }
}
