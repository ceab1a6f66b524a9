//! Media frame input type.

use bytes::Bytes;

use crate::time::Ticks;

/// No frame flags.
pub const FRAME_FLAG_NONE: u32 = 0;
/// The frame is a key frame (fragment boundary candidate).
pub const FRAME_FLAG_KEY_FRAME: u32 = 1 << 0;
/// The frame is discardable and references no other frame.
pub const FRAME_FLAG_DISCARDABLE: u32 = 1 << 1;
/// Sentinel frame closing the current fragment run. Carries no payload.
pub const FRAME_FLAG_END_OF_FRAGMENT: u32 = 1 << 2;

/// A single encoded media frame handed to `put_frame`.
///
/// Timestamps are in 100 ns ticks. The library does not inspect or reorder
/// the payload beyond the optional NAL adaptation configured on the stream.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Track this frame belongs to. Ignored for end-of-fragment sentinels.
    pub track_id: u64,
    /// Bitwise OR of `FRAME_FLAG_*`.
    pub flags: u32,
    /// Presentation timestamp.
    pub presentation_ts: Ticks,
    /// Decoding timestamp. Zero means "same as presentation".
    pub decoding_ts: Ticks,
    /// Frame duration. May be zero when the stream derives durations from
    /// inter-frame timestamps.
    pub duration: Ticks,
    /// Encoded payload.
    pub data: Bytes,
}

impl Frame {
    /// Whether the key-frame flag is set.
    #[must_use]
    pub fn is_key_frame(&self) -> bool {
        self.flags & FRAME_FLAG_KEY_FRAME != 0
    }

    /// Whether this is an end-of-fragment sentinel.
    #[must_use]
    pub fn is_eofr(&self) -> bool {
        self.flags & FRAME_FLAG_END_OF_FRAGMENT != 0
    }

    /// Builds the end-of-fragment sentinel.
    #[must_use]
    pub fn eofr() -> Self {
        Self {
            track_id: 0,
            flags: FRAME_FLAG_END_OF_FRAGMENT,
            presentation_ts: 0,
            decoding_ts: 0,
            duration: 0,
            data: Bytes::new(),
        }
    }

    /// Normalizes a zero decoding timestamp to the presentation timestamp.
    pub(crate) fn fixup(&mut self) {
        if self.decoding_ts == 0 {
            self.decoding_ts = self.presentation_ts;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eofr_sentinel_has_no_payload() {
        let f = Frame::eofr();
        assert!(f.is_eofr());
        assert!(!f.is_key_frame());
        assert!(f.data.is_empty());
    }

    #[test]
    fn fixup_copies_pts_into_zero_dts() {
        let mut f = Frame {
            track_id: 1,
            flags: FRAME_FLAG_KEY_FRAME,
            presentation_ts: 1234,
            decoding_ts: 0,
            duration: 0,
            data: Bytes::from_static(b"x"),
        };
        f.fixup();
        assert_eq!(f.decoding_ts, 1234);
    }
}
