//! Minimal SDP parsing for camera session descriptions.
//!
//! Only the subset needed to pick a video codec and recover its parameter
//! sets is handled: media sections, `rtpmap`, `fmtp`, and `control`
//! attributes.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::decoder::Codec;
use crate::error::SdpError;

/// Parsed `a=rtpmap`/`a=fmtp` pair for one payload type.
#[derive(Debug, Clone)]
pub struct MediaFormat {
    pub payload_type: u8,
    pub encoding: String,
    pub clock_rate: u32,
    /// `fmtp` parameters split on `;`, keyed by name.
    pub parameters: HashMap<String, String>,
}

/// One `m=` section of a session description.
#[derive(Debug, Clone)]
pub struct MediaDescription {
    pub kind: String,
    pub control: Option<String>,
    pub formats: Vec<MediaFormat>,
}

impl MediaDescription {
    /// Find the format with the given encoding name (case-insensitive).
    pub fn format(&self, encoding: &str) -> Option<&MediaFormat> {
        self.formats
            .iter()
            .find(|format| format.encoding.eq_ignore_ascii_case(encoding))
    }
}

/// Parsed session description.
#[derive(Debug, Clone, Default)]
pub struct SessionDescription {
    pub medias: Vec<MediaDescription>,
}

impl SessionDescription {
    pub fn parse(text: &str) -> Result<Self, SdpError> {
        let mut medias: Vec<MediaDescription> = Vec::new();
        let mut rtpmaps: HashMap<u8, (String, u32)> = HashMap::new();
        let mut fmtps: HashMap<u8, HashMap<String, String>> = HashMap::new();

        for raw in text.lines() {
            let line = raw.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            let Some((kind, value)) = line.split_once('=') else {
                return Err(SdpError::MalformedLine(line.to_string()));
            };

            match kind {
                "m" => {
                    finalize_media(&mut medias, &mut rtpmaps, &mut fmtps);
                    let mut parts = value.split_whitespace();
                    let media_kind = parts
                        .next()
                        .ok_or_else(|| SdpError::MalformedLine(line.to_string()))?;
                    medias.push(MediaDescription {
                        kind: media_kind.to_string(),
                        control: None,
                        formats: Vec::new(),
                    });
                }
                "a" => {
                    let Some(media) = medias.last_mut() else {
                        continue; // session-level attribute
                    };
                    if let Some(rest) = value.strip_prefix("rtpmap:") {
                        let (pt, map) = parse_rtpmap(rest)
                            .ok_or_else(|| SdpError::MalformedLine(line.to_string()))?;
                        rtpmaps.insert(pt, map);
                    } else if let Some(rest) = value.strip_prefix("fmtp:") {
                        let (pt, params) = parse_fmtp(rest)
                            .ok_or_else(|| SdpError::MalformedLine(line.to_string()))?;
                        fmtps.insert(pt, params);
                    } else if let Some(rest) = value.strip_prefix("control:") {
                        media.control = Some(rest.trim().to_string());
                    }
                }
                _ => {}
            }
        }

        finalize_media(&mut medias, &mut rtpmaps, &mut fmtps);
        Ok(Self { medias })
    }

    /// Locate the preferred video media: H.264 first, then H.265.
    pub fn video_format(&self) -> Option<(Codec, &MediaDescription, &MediaFormat)> {
        for codec in [Codec::H264, Codec::H265] {
            for media in self.medias.iter().filter(|m| m.kind == "video") {
                if let Some(format) = media.format(codec.name()) {
                    return Some((codec, media, format));
                }
            }
        }
        None
    }
}

/// Out-of-band parameter sets recovered from `fmtp` attributes.
#[derive(Debug, Clone, Default)]
pub struct ParameterSets {
    pub vps: Option<Vec<u8>>,
    pub sps: Option<Vec<u8>>,
    pub pps: Option<Vec<u8>>,
}

impl ParameterSets {
    /// Sets in decoder feed order: VPS, SPS, PPS.
    pub fn in_feed_order(&self) -> Vec<&[u8]> {
        [self.vps.as_deref(), self.sps.as_deref(), self.pps.as_deref()]
            .into_iter()
            .flatten()
            .collect()
    }

    /// Extract the sets applicable to `codec` from a media format.
    pub fn from_format(codec: Codec, format: &MediaFormat) -> Result<Self, SdpError> {
        let mut sets = ParameterSets::default();
        match codec {
            Codec::H264 => {
                if let Some(raw) = format.parameters.get("sprop-parameter-sets") {
                    let mut pieces = raw.split(',');
                    sets.sps = pieces.next().map(decode_set).transpose()?;
                    sets.pps = pieces.next().map(decode_set).transpose()?;
                }
            }
            Codec::H265 => {
                sets.vps = format.parameters.get("sprop-vps").map(decode_set).transpose()?;
                sets.sps = format.parameters.get("sprop-sps").map(decode_set).transpose()?;
                sets.pps = format.parameters.get("sprop-pps").map(decode_set).transpose()?;
            }
        }
        Ok(sets)
    }
}

fn decode_set(value: impl AsRef<str>) -> Result<Vec<u8>, SdpError> {
    let value = value.as_ref().trim();
    BASE64
        .decode(value)
        .map_err(|_| SdpError::BadParameterSet(value.to_string()))
}

fn parse_rtpmap(rest: &str) -> Option<(u8, (String, u32))> {
    let (pt, map) = rest.split_once(' ')?;
    let pt = pt.trim().parse().ok()?;
    let mut parts = map.trim().split('/');
    let encoding = parts.next()?.to_string();
    let clock_rate = parts.next().and_then(|v| v.parse().ok()).unwrap_or(90_000);
    Some((pt, (encoding, clock_rate)))
}

fn parse_fmtp(rest: &str) -> Option<(u8, HashMap<String, String>)> {
    let (pt, params) = rest.split_once(' ')?;
    let pt = pt.trim().parse().ok()?;
    let mut map = HashMap::new();
    for piece in params.split(';') {
        let piece = piece.trim();
        if piece.is_empty() {
            continue;
        }
        match piece.split_once('=') {
            Some((key, value)) => map.insert(key.trim().to_string(), value.trim().to_string()),
            None => map.insert(piece.to_string(), String::new()),
        };
    }
    Some((pt, map))
}

/// Attach collected rtpmap/fmtp attributes to the media being closed out.
fn finalize_media(
    medias: &mut [MediaDescription],
    rtpmaps: &mut HashMap<u8, (String, u32)>,
    fmtps: &mut HashMap<u8, HashMap<String, String>>,
) {
    let Some(media) = medias.last_mut() else {
        rtpmaps.clear();
        fmtps.clear();
        return;
    };

    for (pt, (encoding, clock_rate)) in rtpmaps.drain() {
        media.formats.push(MediaFormat {
            payload_type: pt,
            encoding,
            clock_rate,
            parameters: fmtps.remove(&pt).unwrap_or_default(),
        });
    }
    fmtps.clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "v=0\r\n\
        o=- 0 0 IN IP4 10.0.0.5\r\n\
        s=cam\r\n\
        t=0 0\r\n\
        m=audio 0 RTP/AVP 0\r\n\
        a=control:trackID=2\r\n\
        m=video 0 RTP/AVP 96\r\n\
        a=rtpmap:96 H264/90000\r\n\
        a=fmtp:96 packetization-mode=1; sprop-parameter-sets=Z0IAH6tAoAt2AtwEBAaQeJEV,aM48gA==\r\n\
        a=control:trackID=1\r\n";

    #[test]
    fn parses_video_media_and_prefers_h264() {
        let sdp = SessionDescription::parse(SAMPLE).expect("sample SDP parses");
        let (codec, media, format) = sdp.video_format().expect("video media present");

        assert_eq!(codec, Codec::H264);
        assert_eq!(media.control.as_deref(), Some("trackID=1"));
        assert_eq!(format.payload_type, 96);
        assert_eq!(format.clock_rate, 90_000);
    }

    #[test]
    fn extracts_h264_parameter_sets() {
        let sdp = SessionDescription::parse(SAMPLE).unwrap();
        let (codec, _, format) = sdp.video_format().unwrap();
        let sets = ParameterSets::from_format(codec, format).expect("valid sprop sets");

        let feed = sets.in_feed_order();
        assert_eq!(feed.len(), 2);
        assert_eq!(feed[0][0] & 0x1F, 7, "first set is an SPS");
        assert_eq!(feed[1][0] & 0x1F, 8, "second set is a PPS");
    }

    #[test]
    fn h265_parameter_sets_feed_in_vps_sps_pps_order() {
        let text = "v=0\r\n\
            m=video 0 RTP/AVP 97\r\n\
            a=rtpmap:97 H265/90000\r\n\
            a=fmtp:97 sprop-sps=QgE=; sprop-pps=RAE=; sprop-vps=QAE=\r\n";
        let sdp = SessionDescription::parse(text).unwrap();
        let (codec, _, format) = sdp.video_format().unwrap();
        assert_eq!(codec, Codec::H265);

        let sets = ParameterSets::from_format(codec, format).unwrap();
        let feed = sets.in_feed_order();
        assert_eq!(feed, vec![&[0x40, 0x01][..], &[0x42, 0x01][..], &[0x44, 0x01][..]]);
    }

    #[test]
    fn no_supported_codec_yields_none() {
        let text = "v=0\r\nm=video 0 RTP/AVP 26\r\na=rtpmap:26 JPEG/90000\r\n";
        let sdp = SessionDescription::parse(text).unwrap();
        assert!(sdp.video_format().is_none());
    }
}
