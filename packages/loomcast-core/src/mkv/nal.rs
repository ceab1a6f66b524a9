//! NAL stream adaptation.
//!
//! Encoders hand out either Annex-B byte streams (start-code delimited) or
//! AVCC/length-prefixed payloads. The container wants length prefixes, and
//! codec private data must be in the avcC record form, so the packager
//! adapts payloads transparently and can lift parameter sets out of the
//! first key frame when the caller never supplied codec private data.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{StreamError, StreamResult};

/// Length-prefix width used for adapted output.
const NAL_LENGTH_SIZE: usize = 4;

/// H.264 NAL unit types for parameter sets.
const NAL_TYPE_SPS: u8 = 7;
const NAL_TYPE_PPS: u8 = 8;

/// Splits an Annex-B byte stream into NAL unit payloads.
///
/// Accepts both 3-byte and 4-byte start codes. Returns an error when the
/// stream does not begin with a start code.
pub fn split_annexb(data: &[u8]) -> StreamResult<Vec<&[u8]>> {
    let mut units = Vec::new();
    let mut pos = match start_code_len(data) {
        Some(len) => len,
        None => {
            return Err(StreamError::InvalidArgument(
                "Annex-B payload does not start with a start code".into(),
            ))
        }
    };

    let mut unit_start = pos;
    while pos < data.len() {
        if let Some(len) = start_code_len(&data[pos..]) {
            if pos > unit_start {
                units.push(&data[unit_start..pos]);
            }
            pos += len;
            unit_start = pos;
        } else {
            pos += 1;
        }
    }
    if unit_start < data.len() {
        units.push(&data[unit_start..]);
    }
    Ok(units)
}

fn start_code_len(data: &[u8]) -> Option<usize> {
    if data.len() >= 4 && data[..4] == [0, 0, 0, 1] {
        Some(4)
    } else if data.len() >= 3 && data[..3] == [0, 0, 1] {
        Some(3)
    } else {
        None
    }
}

/// Converts an Annex-B payload to length-prefixed form.
pub fn annexb_to_avcc(data: &[u8]) -> StreamResult<Bytes> {
    let units = split_annexb(data)?;
    let total: usize = units.iter().map(|u| u.len() + NAL_LENGTH_SIZE).sum();
    let mut out = BytesMut::with_capacity(total);
    for unit in units {
        out.put_u32(unit.len() as u32);
        out.put_slice(unit);
    }
    Ok(out.freeze())
}

/// Converts a length-prefixed payload to Annex-B form.
pub fn avcc_to_annexb(data: &[u8]) -> StreamResult<Bytes> {
    let mut out = BytesMut::with_capacity(data.len());
    let mut pos = 0usize;
    while pos < data.len() {
        if pos + NAL_LENGTH_SIZE > data.len() {
            return Err(StreamError::InvalidArgument(
                "truncated NAL length prefix".into(),
            ));
        }
        let len = u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
            as usize;
        pos += NAL_LENGTH_SIZE;
        if pos + len > data.len() {
            return Err(StreamError::InvalidArgument(
                "NAL length exceeds payload".into(),
            ));
        }
        out.put_slice(&[0, 0, 0, 1]);
        out.put_slice(&data[pos..pos + len]);
        pos += len;
    }
    Ok(out.freeze())
}

/// Builds an avcC codec-private record from the parameter sets found in an
/// Annex-B key frame. Returns `None` when the frame carries no SPS/PPS.
pub fn extract_h264_cpd(annexb: &[u8]) -> StreamResult<Option<Vec<u8>>> {
    let units = split_annexb(annexb)?;
    let sps: Vec<&[u8]> = units
        .iter()
        .copied()
        .filter(|u| !u.is_empty() && u[0] & 0x1F == NAL_TYPE_SPS)
        .collect();
    let pps: Vec<&[u8]> = units
        .iter()
        .copied()
        .filter(|u| !u.is_empty() && u[0] & 0x1F == NAL_TYPE_PPS)
        .collect();
    if sps.is_empty() || pps.is_empty() {
        return Ok(None);
    }

    let first_sps = sps[0];
    if first_sps.len() < 4 {
        return Err(StreamError::InvalidArgument("SPS too short".into()));
    }

    let mut cpd = BytesMut::new();
    cpd.put_u8(1); // configurationVersion
    cpd.put_u8(first_sps[1]); // AVCProfileIndication
    cpd.put_u8(first_sps[2]); // profile_compatibility
    cpd.put_u8(first_sps[3]); // AVCLevelIndication
    cpd.put_u8(0xFC | (NAL_LENGTH_SIZE as u8 - 1)); // lengthSizeMinusOne
    cpd.put_u8(0xE0 | (sps.len() as u8 & 0x1F));
    for unit in &sps {
        cpd.put_u16(unit.len() as u16);
        cpd.put_slice(unit);
    }
    cpd.put_u8(pps.len() as u8);
    for unit in &pps {
        cpd.put_u16(unit.len() as u16);
        cpd.put_slice(unit);
    }
    Ok(Some(cpd.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Minimal plausible SPS/PPS/IDR payloads.
    const SPS: &[u8] = &[0x67, 0x42, 0x00, 0x1E, 0xAB, 0x40];
    const PPS: &[u8] = &[0x68, 0xCE, 0x3C, 0x80];
    const IDR: &[u8] = &[0x65, 0x88, 0x84, 0x00, 0x33];

    fn annexb_frame() -> Vec<u8> {
        let mut v = Vec::new();
        for unit in [SPS, PPS, IDR] {
            v.extend_from_slice(&[0, 0, 0, 1]);
            v.extend_from_slice(unit);
        }
        v
    }

    #[test]
    fn splits_mixed_start_codes() {
        let mut v = Vec::new();
        v.extend_from_slice(&[0, 0, 1]);
        v.extend_from_slice(SPS);
        v.extend_from_slice(&[0, 0, 0, 1]);
        v.extend_from_slice(IDR);
        let units = split_annexb(&v).unwrap();
        assert_eq!(units, vec![SPS, IDR]);
    }

    #[test]
    fn annexb_round_trips_through_avcc() {
        let adapted = annexb_to_avcc(&annexb_frame()).unwrap();
        // 3 units, each with a 4-byte prefix.
        assert_eq!(
            adapted.len(),
            SPS.len() + PPS.len() + IDR.len() + 3 * NAL_LENGTH_SIZE
        );
        let back = avcc_to_annexb(&adapted).unwrap();
        assert_eq!(&back[..], &annexb_frame()[..]);
    }

    #[test]
    fn rejects_payload_without_start_code() {
        assert!(annexb_to_avcc(&[0x65, 0x01, 0x02]).is_err());
    }

    #[test]
    fn rejects_truncated_length_prefix() {
        assert!(avcc_to_annexb(&[0x00, 0x00, 0x00, 0x09, 0x65]).is_err());
    }

    #[test]
    fn cpd_extraction_builds_avcc_record() {
        let cpd = extract_h264_cpd(&annexb_frame()).unwrap().unwrap();
        assert_eq!(cpd[0], 1);
        assert_eq!(cpd[1], SPS[1]);
        assert_eq!(cpd[4] & 0x03, (NAL_LENGTH_SIZE - 1) as u8);
        // One SPS, one PPS.
        assert_eq!(cpd[5] & 0x1F, 1);
    }

    #[test]
    fn cpd_extraction_returns_none_without_parameter_sets() {
        let mut v = Vec::new();
        v.extend_from_slice(&[0, 0, 0, 1]);
        v.extend_from_slice(IDR);
        assert!(extract_h264_cpd(&v).unwrap().is_none());
    }
}
