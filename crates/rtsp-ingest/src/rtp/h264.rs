//! H.264 RTP depacketization (RFC 6184): single NAL units, STAP-A
//! aggregates, and FU-A fragmentation units.

use crate::error::RtpError;
use crate::rtp::{Depacketizer, RtpPacket};

const NAL_TYPE_STAP_A: u8 = 24;
const NAL_TYPE_FU_A: u8 = 28;

#[derive(Default)]
pub struct H264Depacketizer {
    fragment: Option<Vec<u8>>,
}

impl Depacketizer for H264Depacketizer {
    fn push(&mut self, packet: &RtpPacket<'_>) -> Result<Vec<Vec<u8>>, RtpError> {
        let payload = packet.payload;
        if payload.is_empty() {
            return Err(RtpError::Truncated);
        }

        let nal_type = payload[0] & 0x1F;
        match nal_type {
            1..=23 => Ok(vec![payload.to_vec()]),
            NAL_TYPE_STAP_A => split_stap_a(payload),
            NAL_TYPE_FU_A => self.push_fragment(payload),
            other => Err(RtpError::UnsupportedPacketization(other)),
        }
    }
}

impl H264Depacketizer {
    fn push_fragment(&mut self, payload: &[u8]) -> Result<Vec<Vec<u8>>, RtpError> {
        if payload.len() < 2 {
            return Err(RtpError::Truncated);
        }

        let indicator = payload[0];
        let header = payload[1];
        let start = header & 0x80 != 0;
        let end = header & 0x40 != 0;

        if start {
            // Reconstruct the NAL header from the indicator's NRI bits and
            // the fragmented unit's original type.
            let mut unit = vec![(indicator & 0xE0) | (header & 0x1F)];
            unit.extend_from_slice(&payload[2..]);
            self.fragment = Some(unit);
            if end {
                return Ok(vec![self.fragment.take().unwrap_or_default()]);
            }
            return Err(RtpError::MorePacketsNeeded);
        }

        let Some(fragment) = self.fragment.as_mut() else {
            return Err(RtpError::NonStartingFragment);
        };
        fragment.extend_from_slice(&payload[2..]);

        if end {
            Ok(vec![self.fragment.take().unwrap_or_default()])
        } else {
            Err(RtpError::MorePacketsNeeded)
        }
    }
}

fn split_stap_a(payload: &[u8]) -> Result<Vec<Vec<u8>>, RtpError> {
    let mut units = Vec::new();
    let mut index = 1;

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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::{parse_packet, test_packet};

    fn push(depacketizer: &mut H264Depacketizer, payload: &[u8]) -> Result<Vec<Vec<u8>>, RtpError> {
        let raw = test_packet(payload, true);
        let packet = parse_packet(&raw).unwrap();
        depacketizer.push(&packet)
    }

    #[test]
    fn single_nal_unit_passes_through() {
        let mut depacketizer = H264Depacketizer::default();
        let units = push(&mut depacketizer, &[0x65, 0x01, 0x02]).unwrap();
        assert_eq!(units, vec![vec![0x65, 0x01, 0x02]]);
    }

    #[test]
    fn stap_a_splits_aggregated_units() {
        // STAP-A holding an SPS (2 bytes) and a PPS (1 byte).
        let payload = [0x78, 0x00, 0x02, 0x67, 0x42, 0x00, 0x01, 0x68];
        let mut depacketizer = H264Depacketizer::default();
        let units = push(&mut depacketizer, &payload).unwrap();
        assert_eq!(units, vec![vec![0x67, 0x42], vec![0x68]]);
    }

    #[test]
    fn fu_a_reassembles_across_packets() {
        let mut depacketizer = H264Depacketizer::default();

        let start = [0x7C, 0x85, 0xAA, 0xBB]; // FU-A, start, type 5
        assert!(matches!(
            push(&mut depacketizer, &start),
            Err(RtpError::MorePacketsNeeded)
        ));

        let middle = [0x7C, 0x05, 0xCC];
        assert!(matches!(
            push(&mut depacketizer, &middle),
            Err(RtpError::MorePacketsNeeded)
        ));

        let end = [0x7C, 0x45, 0xDD];
        let units = push(&mut depacketizer, &end).unwrap();
        assert_eq!(units, vec![vec![0x65, 0xAA, 0xBB, 0xCC, 0xDD]]);
    }

    #[test]
    fn non_starting_fragment_without_start_is_flagged() {
        let mut depacketizer = H264Depacketizer::default();
        let middle = [0x7C, 0x05, 0xCC];
        let err = push(&mut depacketizer, &middle).unwrap_err();
        assert!(matches!(err, RtpError::NonStartingFragment));
        assert!(err.is_transient());
    }
}
