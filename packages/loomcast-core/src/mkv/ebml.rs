//! EBML primitives for the MKV packager.
//!
//! Element ids are stored with their length marker bits included, exactly
//! as they appear on the wire, and emitted minimally. Sizes use the EBML
//! variable-length coding; streaming master elements (Segment, Cluster)
//! use the 8-byte unknown-size form so they never need back-patching.

use bytes::{BufMut, BytesMut};

// Top level
pub const ID_EBML: u32 = 0x1A45_DFA3;
pub const ID_SEGMENT: u32 = 0x1853_8067;

// EBML header
pub const ID_EBML_VERSION: u32 = 0x4286;
pub const ID_EBML_READ_VERSION: u32 = 0x42F7;
pub const ID_EBML_MAX_ID_LENGTH: u32 = 0x42F2;
pub const ID_EBML_MAX_SIZE_LENGTH: u32 = 0x42F3;
pub const ID_DOC_TYPE: u32 = 0x4282;
pub const ID_DOC_TYPE_VERSION: u32 = 0x4287;
pub const ID_DOC_TYPE_READ_VERSION: u32 = 0x4285;

// Segment info
pub const ID_INFO: u32 = 0x1549_A966;
pub const ID_SEGMENT_UID: u32 = 0x73A4;
pub const ID_TIMECODE_SCALE: u32 = 0x2AD7_B1;
pub const ID_TITLE: u32 = 0x7BA9;
pub const ID_MUXING_APP: u32 = 0x4D80;
pub const ID_WRITING_APP: u32 = 0x5741;

// Tracks
pub const ID_TRACKS: u32 = 0x1654_AE6B;
pub const ID_TRACK_ENTRY: u32 = 0xAE;
pub const ID_TRACK_NUMBER: u32 = 0xD7;
pub const ID_TRACK_UID: u32 = 0x73C5;
pub const ID_TRACK_TYPE: u32 = 0x83;
pub const ID_TRACK_NAME: u32 = 0x536E;
pub const ID_CODEC_ID: u32 = 0x86;
pub const ID_CODEC_PRIVATE: u32 = 0x63A2;
pub const ID_VIDEO: u32 = 0xE0;
pub const ID_PIXEL_WIDTH: u32 = 0xB0;
pub const ID_PIXEL_HEIGHT: u32 = 0xBA;
pub const ID_AUDIO: u32 = 0xE1;
pub const ID_SAMPLING_FREQUENCY: u32 = 0xB5;
pub const ID_CHANNELS: u32 = 0x9F;

// Cluster
pub const ID_CLUSTER: u32 = 0x1F43_B675;
pub const ID_TIMECODE: u32 = 0xE7;
pub const ID_SIMPLE_BLOCK: u32 = 0xA3;

// Tags
pub const ID_TAGS: u32 = 0x1254_C367;
pub const ID_TAG: u32 = 0x7373;
pub const ID_SIMPLE_TAG: u32 = 0x67C8;
pub const ID_TAG_NAME: u32 = 0x45A3;
pub const ID_TAG_STRING: u32 = 0x4487;

/// MKV track type values.
pub const TRACK_TYPE_VIDEO: u64 = 1;
pub const TRACK_TYPE_AUDIO: u64 = 2;

/// SimpleBlock flag: frame is a key frame.
pub const SIMPLE_BLOCK_FLAG_KEY: u8 = 0x80;
/// SimpleBlock flag: frame is discardable.
pub const SIMPLE_BLOCK_FLAG_DISCARDABLE: u8 = 0x01;

/// Writes an element id verbatim, skipping leading zero bytes.
pub fn put_id(buf: &mut BytesMut, id: u32) {
    let bytes = id.to_be_bytes();
    let skip = bytes.iter().take_while(|&&b| b == 0).count();
    buf.put_slice(&bytes[skip..]);
}

/// Writes a size in EBML variable-length coding using the minimal width.
pub fn put_size(buf: &mut BytesMut, size: u64) {
    for width in 1..=8u32 {
        // Each width stores 7*width data bits; the all-ones pattern is
        // reserved for "unknown".
        let max = (1u64 << (7 * width)) - 2;
        if size <= max {
            let marked = size | (1u64 << (7 * width));
            let bytes = marked.to_be_bytes();
            buf.put_slice(&bytes[(8 - width as usize)..]);
            return;
        }
    }
    // Unreachable for sizes under 2^56; fall through to unknown.
    put_unknown_size(buf);
}

/// Writes the 8-byte unknown-size marker.
pub fn put_unknown_size(buf: &mut BytesMut) {
    buf.put_slice(&[0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
}

/// Writes an unsigned integer element with a minimal-width payload.
pub fn put_uint(buf: &mut BytesMut, id: u32, value: u64) {
    put_id(buf, id);
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|&&b| b == 0).count().min(7);
    put_size(buf, (8 - skip) as u64);
    buf.put_slice(&bytes[skip..]);
}

/// Writes a UTF-8 string element.
pub fn put_string(buf: &mut BytesMut, id: u32, value: &str) {
    put_id(buf, id);
    put_size(buf, value.len() as u64);
    buf.put_slice(value.as_bytes());
}

/// Writes a binary element.
pub fn put_binary(buf: &mut BytesMut, id: u32, value: &[u8]) {
    put_id(buf, id);
    put_size(buf, value.len() as u64);
    buf.put_slice(value);
}

/// Writes an 8-byte float element.
pub fn put_float(buf: &mut BytesMut, id: u32, value: f64) {
    put_id(buf, id);
    put_size(buf, 8);
    buf.put_slice(&value.to_be_bytes());
}

/// Writes a master element with a known size around pre-built children.
pub fn put_master(buf: &mut BytesMut, id: u32, children: &[u8]) {
    put_id(buf, id);
    put_size(buf, children.len() as u64);
    buf.put_slice(children);
}

/// Writes a track number as an EBML VINT for a SimpleBlock prefix.
/// Track numbers above 127 need the two-byte form; the packager never
/// declares more.
pub fn put_block_track_number(buf: &mut BytesMut, track_number: u64) {
    if track_number < 0x80 {
        buf.put_u8(0x80 | track_number as u8);
    } else {
        buf.put_u8(0x40 | (track_number >> 8) as u8);
        buf.put_u8((track_number & 0xFF) as u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emitted(f: impl FnOnce(&mut BytesMut)) -> Vec<u8> {
        let mut buf = BytesMut::new();
        f(&mut buf);
        buf.to_vec()
    }

    #[test]
    fn ids_are_emitted_verbatim() {
        assert_eq!(emitted(|b| put_id(b, ID_EBML)), [0x1A, 0x45, 0xDF, 0xA3]);
        assert_eq!(emitted(|b| put_id(b, ID_SIMPLE_BLOCK)), [0xA3]);
        assert_eq!(emitted(|b| put_id(b, ID_SEGMENT_UID)), [0x73, 0xA4]);
    }

    #[test]
    fn sizes_use_minimal_width() {
        assert_eq!(emitted(|b| put_size(b, 0)), [0x80]);
        assert_eq!(emitted(|b| put_size(b, 126)), [0xFE]);
        // 127 needs two bytes: 0x7F is the one-byte reserved pattern.
        assert_eq!(emitted(|b| put_size(b, 127)), [0x40, 0x7F]);
        assert_eq!(emitted(|b| put_size(b, 500)), [0x41, 0xF4]);
    }

    #[test]
    fn uint_payload_is_minimal() {
        assert_eq!(
            emitted(|b| put_uint(b, ID_TRACK_NUMBER, 1)),
            [0xD7, 0x81, 0x01]
        );
        assert_eq!(
            emitted(|b| put_uint(b, ID_TIMECODE, 0x0102)),
            [0xE7, 0x82, 0x01, 0x02]
        );
        // Zero still takes one payload byte.
        assert_eq!(emitted(|b| put_uint(b, ID_TIMECODE, 0)), [0xE7, 0x81, 0x00]);
    }

    #[test]
    fn block_track_number_vint() {
        assert_eq!(emitted(|b| put_block_track_number(b, 1)), [0x81]);
        assert_eq!(emitted(|b| put_block_track_number(b, 0x90)), [0x40, 0x90]);
    }
}
