//! H.265 RTP depacketization (RFC 7798): single NAL units, aggregation
//! packets, and fragmentation units.

use crate::error::RtpError;
use crate::rtp::{Depacketizer, RtpPacket};

const NAL_TYPE_AP: u8 = 48;
const NAL_TYPE_FU: u8 = 49;

#[derive(Default)]
pub struct H265Depacketizer {
    fragment: Option<Vec<u8>>,
}

impl Depacketizer for H265Depacketizer {
    fn push(&mut self, packet: &RtpPacket<'_>) -> Result<Vec<Vec<u8>>, RtpError> {
        let payload = packet.payload;
        if payload.len() < 2 {
            return Err(RtpError::Truncated);
        }

        let nal_type = (payload[0] >> 1) & 0x3F;
        match nal_type {
            NAL_TYPE_AP => split_aggregation(payload),
            NAL_TYPE_FU => self.push_fragment(payload),
            _ => Ok(vec![payload.to_vec()]),
        }
    }
}

impl H265Depacketizer {
    fn push_fragment(&mut self, payload: &[u8]) -> Result<Vec<Vec<u8>>, RtpError> {
        if payload.len() < 3 {
            return Err(RtpError::Truncated);
        }

        let fu_header = payload[2];
        let start = fu_header & 0x80 != 0;
        let end = fu_header & 0x40 != 0;
        let original_type = fu_header & 0x3F;

        if start {
            // Rebuild the two-byte NAL header with the original unit type.
            let mut unit = vec![(payload[0] & 0x81) | (original_type << 1), payload[1]];
            unit.extend_from_slice(&payload[3..]);
            self.fragment = Some(unit);
            if end {
                return Ok(vec![self.fragment.take().unwrap_or_default()]);
            }
            return Err(RtpError::MorePacketsNeeded);
        }

        let Some(fragment) = self.fragment.as_mut() else {
            return Err(RtpError::NonStartingFragment);
        };
        fragment.extend_from_slice(&payload[3..]);

        if end {
            Ok(vec![self.fragment.take().unwrap_or_default()])
        } else {
            Err(RtpError::MorePacketsNeeded)
        }
    }
}

fn split_aggregation(payload: &[u8]) -> Result<Vec<Vec<u8>>, RtpError> {
    let mut units = Vec::new();
    let mut index = 2;

    while index + 2 <= payload.len() {
        let size = u16::from_be_bytes([payload[index], payload[index + 1]]) as usize;
        index += 2;
        if size == 0 || index + size > payload.len() {
            return Err(RtpError::Truncated);
        }
        units.push(payload[index..index + size].to_vec());
        index += size;
    }

    if units.is_empty() {
        return Err(RtpError::Truncated);
    }
    Ok(units)
}
