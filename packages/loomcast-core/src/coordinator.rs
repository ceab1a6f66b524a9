//! Multi-track frame-order coordination.
//!
//! Audio and video arrive on independent tracks but must reach the
//! packager in container timestamp order. The coordinator keeps one FIFO
//! per declared track and releases the earliest frame only while every
//! track has data, so a lagging track stalls interleaving instead of
//! producing out-of-order clusters.
//!
//! The coordinator is a pure reorder buffer: `put` and `flush` return the
//! frames to forward and the stream drives them through packaging.

use std::collections::VecDeque;

use crate::config::{FrameOrderMode, StreamInfo, TrackType};
use crate::error::{StreamError, StreamResult};
use crate::frame::{Frame, FRAME_FLAG_KEY_FRAME};
use crate::protocol_constants::MAX_FRAME_QUEUE_SIZE_PER_TRACK;
use crate::time::Ticks;

struct TrackQueue {
    track_id: u64,
    track_type: TrackType,
    frames: VecDeque<Frame>,
}

/// Per-track reorder buffer ahead of the packager.
pub struct FrameOrderCoordinator {
    mode: FrameOrderMode,
    timecode_scale: Ticks,
    tracks: Vec<TrackQueue>,
    /// An end-of-fragment sentinel went through; the next released frame
    /// re-arms key-frame status so the following cluster starts cleanly.
    eofr_put: bool,
    key_frame_detected: bool,
}

impl FrameOrderCoordinator {
    /// Builds the coordinator for a stream configuration.
    #[must_use]
    pub fn new(info: &StreamInfo) -> Self {
        Self {
            mode: info.frame_order_mode,
            timecode_scale: info.timecode_scale,
            tracks: info
                .tracks
                .iter()
                .map(|t| TrackQueue {
                    track_id: t.track_id,
                    track_type: t.track_type,
                    frames: VecDeque::new(),
                })
                .collect(),
            eofr_put: false,
            key_frame_detected: false,
        }
    }

    /// Accepts one frame, returning the frames released for packaging in
    /// order. An end-of-fragment sentinel flushes all queues first and is
    /// returned last.
    pub fn put(&mut self, frame: Frame) -> StreamResult<Vec<Frame>> {
        debug_assert_ne!(self.mode, FrameOrderMode::PassThrough);

        if frame.is_eofr() {
            // Explicit fragmentation and key-frame fragmentation are
            // mutually exclusive once a key frame has been observed.
            if self.mode == FrameOrderMode::MultiTrackByPts && self.key_frame_detected {
                return Err(StreamError::KeyFrameFlagWhileUsingEofr);
            }
            let mut released = self.flush();
            if self.mode == FrameOrderMode::MultiTrackByDts {
                self.eofr_put = true;
            }
            released.push(frame);
            return Ok(released);
        }

        let queue = self
            .tracks
            .iter_mut()
            .find(|t| t.track_id == frame.track_id)
            .ok_or(StreamError::TrackInfoNotFound(frame.track_id))?;
        if queue.frames.len() >= MAX_FRAME_QUEUE_SIZE_PER_TRACK {
            return Err(StreamError::MaxFrameTimestampDeltaBetweenTracks);
        }
        if frame.is_key_frame() {
            self.key_frame_detected = true;
        }
        queue.frames.push_back(frame);

        let mut released = Vec::new();
        while self.tracks.iter().all(|t| !t.frames.is_empty()) {
            released.push(self.release_earliest());
        }
        Ok(released)
    }

    /// Drains every queue in timestamp order.
    pub fn flush(&mut self) -> Vec<Frame> {
        let mut released = Vec::new();
        while self.tracks.iter().any(|t| !t.frames.is_empty()) {
            released.push(self.release_earliest());
        }
        released
    }

    /// Whether any frame is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tracks.iter().all(|t| t.frames.is_empty())
    }

    fn scaled_ts(&self, frame: &Frame) -> u64 {
        let ts = match self.mode {
            FrameOrderMode::MultiTrackByDts => frame.decoding_ts,
            _ => frame.presentation_ts,
        };
        ts / self.timecode_scale
    }

    /// Picks the track whose front frame has the smallest scaled timestamp
    /// and dequeues it. On a cross-track tie between a non-key and a key
    /// frame the non-key frame goes first and the key frame is advanced by
    /// one timecode unit, so the cluster it opens starts strictly after
    /// every frame of the previous one.
    fn release_earliest(&mut self) -> Frame {
        let mut best: Option<usize> = None;
        for (index, queue) in self.tracks.iter().enumerate() {
            let Some(front) = queue.frames.front() else {
                continue;
            };
            match best {
                None => best = Some(index),
                Some(current) => {
                    let chosen = self.tracks[current].frames.front().expect("non-empty");
                    let candidate_ts = self.scaled_ts(front);
                    let chosen_ts = self.scaled_ts(chosen);
                    if candidate_ts < chosen_ts {
                        best = Some(index);
                    } else if candidate_ts == chosen_ts
                        && self.tracks[index].track_type != self.tracks[current].track_type
                        && chosen.is_key_frame()
                        && !front.is_key_frame()
                    {
                        best = Some(index);
                    }
                }
            }
        }
        let best = best.expect("release_earliest called with at least one queued frame");

        // Bump a tied key frame on another track past the released frame.
        let released_ts = {
            let front = self.tracks[best].frames.front().expect("non-empty");
            (self.scaled_ts(front), front.is_key_frame())
        };
        if !released_ts.1 {
            for (index, queue) in self.tracks.iter_mut().enumerate() {
                if index == best {
                    continue;
                }
                if let Some(front) = queue.frames.front_mut() {
                    if front.is_key_frame()
                        && front.presentation_ts / self.timecode_scale == released_ts.0
                    {
                        front.presentation_ts += self.timecode_scale;
                    }
                }
            }
        }

        let mut frame = self.tracks[best].frames.pop_front().expect("non-empty");
        if self.eofr_put {
            self.eofr_put = false;
            frame.flags |= FRAME_FLAG_KEY_FRAME;
        }
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        AudioTrackParams, TrackInfo, TrackParams, VideoTrackParams,
    };
    use crate::frame::FRAME_FLAG_NONE;
    use crate::time::TICKS_PER_MILLISECOND;
    use bytes::Bytes;

    fn av_info(mode: FrameOrderMode) -> StreamInfo {
        StreamInfo {
            name: "av".into(),
            frame_order_mode: mode,
            tracks: vec![
                TrackInfo {
                    track_id: 1,
                    track_type: TrackType::Video,
                    codec_id: "V_MPEG4/ISO/AVC".into(),
                    track_name: "video".into(),
                    codec_private_data: None,
                    params: TrackParams::Video(VideoTrackParams {
                        width: 640,
                        height: 480,
                    }),
                },
                TrackInfo {
                    track_id: 2,
                    track_type: TrackType::Audio,
                    codec_id: "A_AAC".into(),
                    track_name: "audio".into(),
                    codec_private_data: None,
                    params: TrackParams::Audio(AudioTrackParams {
                        sampling_frequency: 48_000.0,
                        channels: 2,
                    }),
                },
            ],
            ..StreamInfo::default()
        }
    }

    fn frame(track: u64, ts_ms: u64, key: bool) -> Frame {
        Frame {
            track_id: track,
            flags: if key { FRAME_FLAG_KEY_FRAME } else { FRAME_FLAG_NONE },
            presentation_ts: ts_ms * TICKS_PER_MILLISECOND,
            decoding_ts: ts_ms * TICKS_PER_MILLISECOND,
            duration: 0,
            data: Bytes::from_static(b"f"),
        }
    }

    #[test]
    fn holds_frames_until_all_tracks_have_data() {
        let mut coordinator = FrameOrderCoordinator::new(&av_info(FrameOrderMode::MultiTrackByPts));
        assert!(coordinator.put(frame(1, 0, true)).unwrap().is_empty());
        assert!(coordinator.put(frame(1, 33, false)).unwrap().is_empty());

        // Audio arrives; both video frames precede it.
        let released = coordinator.put(frame(2, 40, false)).unwrap();
        let ids: Vec<u64> = released.iter().map(|f| f.track_id).collect();
        assert_eq!(ids, vec![1, 1]);
    }

    #[test]
    fn releases_in_timestamp_order_across_tracks() {
        let mut coordinator = FrameOrderCoordinator::new(&av_info(FrameOrderMode::MultiTrackByPts));
        coordinator.put(frame(1, 10, true)).unwrap();
        coordinator.put(frame(1, 43, false)).unwrap();
        let released = coordinator.put(frame(2, 20, false)).unwrap();
        let ts: Vec<u64> = released
            .iter()
            .map(|f| f.presentation_ts / TICKS_PER_MILLISECOND)
            .collect();
        assert_eq!(ts, vec![10, 20]);
    }

    #[test]
    fn tie_favors_non_key_and_advances_key_frame() {
        let mut coordinator = FrameOrderCoordinator::new(&av_info(FrameOrderMode::MultiTrackByPts));
        coordinator.put(frame(1, 100, true)).unwrap();
        let released = coordinator.put(frame(2, 100, false)).unwrap();

        // Audio (non-key) first at 100, video key second pushed one unit on.
        assert_eq!(released[0].track_id, 2);
        assert_eq!(released[0].presentation_ts, 100 * TICKS_PER_MILLISECOND);
        assert_eq!(released[1].track_id, 1);
        assert_eq!(
            released[1].presentation_ts,
            100 * TICKS_PER_MILLISECOND + TICKS_PER_MILLISECOND
        );
    }

    #[test]
    fn eofr_flushes_queues_then_forwards_sentinel() {
        let mut coordinator = FrameOrderCoordinator::new(&av_info(FrameOrderMode::MultiTrackByDts));
        coordinator.put(frame(1, 0, false)).unwrap();
        coordinator.put(frame(1, 33, false)).unwrap();
        let released = coordinator.put(Frame::eofr()).unwrap();
        assert_eq!(released.len(), 3);
        assert!(released[2].is_eofr());
        assert!(released[0].presentation_ts <= released[1].presentation_ts);
    }

    #[test]
    fn frame_after_eofr_is_promoted_to_key_frame() {
        let mut coordinator = FrameOrderCoordinator::new(&av_info(FrameOrderMode::MultiTrackByDts));
        coordinator.put(Frame::eofr()).unwrap();
        coordinator.put(frame(1, 100, false)).unwrap();
        let released = coordinator.put(frame(2, 110, false)).unwrap();
        assert!(released[0].is_key_frame());
    }

    #[test]
    fn eofr_with_key_frame_fragmentation_is_rejected() {
        let mut coordinator = FrameOrderCoordinator::new(&av_info(FrameOrderMode::MultiTrackByPts));
        coordinator.put(frame(1, 0, true)).unwrap();
        assert!(matches!(
            coordinator.put(Frame::eofr()),
            Err(StreamError::KeyFrameFlagWhileUsingEofr)
        ));
    }

    #[test]
    fn queue_overflow_reports_timestamp_delta_error() {
        let mut coordinator = FrameOrderCoordinator::new(&av_info(FrameOrderMode::MultiTrackByPts));
        for i in 0..MAX_FRAME_QUEUE_SIZE_PER_TRACK as u64 {
            coordinator.put(frame(1, i * 33, false)).unwrap();
        }
        assert!(matches!(
            coordinator.put(frame(1, 9_999, false)),
            Err(StreamError::MaxFrameTimestampDeltaBetweenTracks)
        ));
    }

    #[test]
    fn unknown_track_is_rejected() {
        let mut coordinator = FrameOrderCoordinator::new(&av_info(FrameOrderMode::MultiTrackByPts));
        assert!(matches!(
            coordinator.put(frame(9, 0, false)),
            Err(StreamError::TrackInfoNotFound(9))
        ));
    }
}
