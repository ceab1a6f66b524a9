//! Stateful MKV stream generator.

use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::config::{NalAdaptation, StreamInfo, TrackInfo, TrackParams};
use crate::error::{StreamError, StreamResult};
use crate::frame::{Frame, FRAME_FLAG_DISCARDABLE};
use crate::time::Ticks;

use super::ebml;
use super::nal;

/// Codec ids eligible for NAL adaptation.
const CODEC_ID_H264: &str = "V_MPEG4/ISO/AVC";
const CODEC_ID_H265: &str = "V_MPEGH/ISO/HEVC";

/// Generator position applied to a frame.
///
/// `StartStream` frames carry a fresh stream header and open a cluster;
/// `StartCluster` frames open a cluster; `StartBlock` frames extend the
/// current cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorState {
    /// Fresh container: EBML + Segment + Info + Tracks, then a cluster.
    StartStream,
    /// New cluster inside the current container.
    StartCluster,
    /// Block appended to the current cluster.
    StartBlock,
}

/// Packaging outcome for one frame, reported alongside the bytes.
#[derive(Debug, Clone, Copy)]
pub struct EncodedFrameInfo {
    /// The generator position applied to this frame.
    pub generator_state: GeneratorState,
    /// Stream-start timestamp of the container this frame belongs to.
    pub stream_start_ts: Ticks,
    /// Presentation timestamp of the containing cluster.
    pub cluster_pts: Ticks,
    /// Decoding timestamp of the containing cluster.
    pub cluster_dts: Ticks,
    /// Frame presentation timestamp relative to the cluster.
    pub frame_pts: Ticks,
    /// Frame decoding timestamp relative to the cluster.
    pub frame_dts: Ticks,
    /// Frame duration, carried through for the view item.
    pub duration: Ticks,
    /// Byte offset of the post-header payload (cluster start) inside the
    /// produced bytes. Non-zero only for `StartStream` frames.
    pub data_offset: u32,
}

#[derive(Debug, Clone, Copy)]
struct Position {
    pending: GeneratorState,
    stream_start_ts: Ticks,
    cluster_pts: Ticks,
    cluster_dts: Ticks,
}

/// MKV stream generator.
///
/// Measure-only calls never mutate generator state: packaging runs as a
/// pure function of the committed position and the commit flag decides
/// whether the new position is stored.
pub struct MkvGenerator {
    timecode_scale: Ticks,
    fragment_duration: Ticks,
    key_frame_fragmentation: bool,
    absolute_fragment_times: bool,
    nal_adaptation: NalAdaptation,
    client_id: String,
    uuid_pinned: bool,
    segment_uuid: [u8; 16],
    tracks: Vec<TrackInfo>,
    position: Position,
}

impl MkvGenerator {
    /// Builds a generator from the stream configuration.
    pub fn new(info: &StreamInfo, client_id: &str) -> Self {
        let (segment_uuid, uuid_pinned) = match info.segment_uuid {
            Some(uuid) => (uuid, true),
            None => (*Uuid::new_v4().as_bytes(), false),
        };
        Self {
            timecode_scale: info.timecode_scale,
            fragment_duration: info.fragment_duration,
            key_frame_fragmentation: info.key_frame_fragmentation,
            absolute_fragment_times: info.absolute_fragment_times,
            nal_adaptation: info.nal_adaptation,
            client_id: client_id.to_string(),
            uuid_pinned,
            segment_uuid,
            tracks: info.tracks.clone(),
            position: Position {
                pending: GeneratorState::StartStream,
                stream_start_ts: 0,
                cluster_pts: 0,
                cluster_dts: 0,
            },
        }
    }

    /// Converts an ACK timecode (MKV timecode units) to ticks.
    #[must_use]
    pub fn timecode_to_ticks(&self, timecode: u64) -> Ticks {
        timecode.saturating_mul(self.timecode_scale)
    }

    /// Current (stream start, cluster pts, cluster dts) of the committed
    /// position.
    #[must_use]
    pub fn current_timestamps(&self) -> (Ticks, Ticks, Ticks) {
        (
            self.position.stream_start_ts,
            self.position.cluster_pts,
            self.position.cluster_dts,
        )
    }

    /// Forces the next successful frame to emit a fresh stream header.
    /// Regenerates the segment UUID unless the caller pinned one.
    pub fn reset(&mut self) {
        self.position.pending = GeneratorState::StartStream;
        if !self.uuid_pinned {
            self.segment_uuid = *Uuid::new_v4().as_bytes();
        }
        log::debug!("[Mkv] Generator reset, next frame starts a new stream");
    }

    /// Installs codec private data for a track.
    pub fn set_codec_private_data(&mut self, track_id: u64, data: Vec<u8>) -> StreamResult<()> {
        let track = self
            .tracks
            .iter_mut()
            .find(|t| t.track_id == track_id)
            .ok_or(StreamError::TrackInfoNotFound(track_id))?;
        track.codec_private_data = Some(data);
        Ok(())
    }

    /// Packages one frame.
    ///
    /// With `commit` unset this is a pure measurement: the returned bytes
    /// and info describe exactly what a committed call would produce, and
    /// the generator position is untouched.
    pub fn package_frame(
        &mut self,
        frame: &Frame,
        track_id: u64,
        commit: bool,
    ) -> StreamResult<(Bytes, EncodedFrameInfo)> {
        let track_index = self
            .tracks
            .iter()
            .position(|t| t.track_id == track_id)
            .ok_or(StreamError::TrackInfoNotFound(track_id))?;

        let payload = self.adapt_payload(frame, track_index)?;

        let mut state = self.next_state(frame);

        // A frame whose scaled distance to the cluster base no longer fits
        // the signed 16-bit block timecode opens a new cluster instead.
        if state == GeneratorState::StartBlock {
            let relative =
                frame.presentation_ts.saturating_sub(self.position.cluster_pts) / self.timecode_scale;
            if relative > i16::MAX as u64 {
                state = GeneratorState::StartCluster;
            }
        }

        let stream_start_ts = if state == GeneratorState::StartStream {
            frame.presentation_ts
        } else {
            self.position.stream_start_ts
        };
        let (cluster_pts, cluster_dts) = if state == GeneratorState::StartBlock {
            (self.position.cluster_pts, self.position.cluster_dts)
        } else {
            (frame.presentation_ts, frame.decoding_ts)
        };

        let mut out = BytesMut::new();
        let mut data_offset = 0u32;
        if state == GeneratorState::StartStream {
            self.put_header(&mut out);
            data_offset = out.len() as u32;
        }
        if state != GeneratorState::StartBlock {
            self.put_cluster_header(&mut out, cluster_pts, stream_start_ts);
        }
        self.put_simple_block(&mut out, frame, track_index, cluster_pts, &payload);

        let info = EncodedFrameInfo {
            generator_state: state,
            stream_start_ts,
            cluster_pts,
            cluster_dts,
            frame_pts: frame.presentation_ts.saturating_sub(cluster_pts),
            frame_dts: frame.decoding_ts.saturating_sub(cluster_dts),
            duration: frame.duration,
            data_offset,
        };

        if commit {
            self.position = Position {
                pending: GeneratorState::StartBlock,
                stream_start_ts,
                cluster_pts,
                cluster_dts,
            };
        }

        Ok((out.freeze(), info))
    }

    /// Produces a stream header alone, returning the bytes and the stream
    /// start timestamp of the container it belongs to. Never mutates the
    /// committed position.
    #[must_use]
    pub fn generate_header(&self) -> (Bytes, Ticks) {
        let mut out = BytesMut::new();
        self.put_header(&mut out);
        (out.freeze(), self.position.stream_start_ts)
    }

    /// Produces one Tag element.
    ///
    /// A committed tag closes the current cluster (tags are level-1
    /// elements), so the next frame opens a new one.
    pub fn generate_tag(&mut self, name: &str, value: &str, commit: bool) -> StreamResult<Bytes> {
        if name.is_empty() {
            return Err(StreamError::InvalidArgument("empty metadata name".into()));
        }
        let mut simple_tag = BytesMut::new();
        ebml::put_string(&mut simple_tag, ebml::ID_TAG_NAME, name);
        ebml::put_string(&mut simple_tag, ebml::ID_TAG_STRING, value);

        let mut tag = BytesMut::new();
        ebml::put_master(&mut tag, ebml::ID_SIMPLE_TAG, &simple_tag);

        let mut tags = BytesMut::new();
        ebml::put_master(&mut tags, ebml::ID_TAG, &tag);

        let mut out = BytesMut::new();
        ebml::put_master(&mut out, ebml::ID_TAGS, &tags);

        if commit && self.position.pending == GeneratorState::StartBlock {
            self.position.pending = GeneratorState::StartCluster;
        }
        Ok(out.freeze())
    }

    fn next_state(&self, frame: &Frame) -> GeneratorState {
        match self.position.pending {
            GeneratorState::StartStream => GeneratorState::StartStream,
            GeneratorState::StartCluster => GeneratorState::StartCluster,
            GeneratorState::StartBlock => {
                if self.key_frame_fragmentation && frame.is_key_frame() {
                    GeneratorState::StartCluster
                } else if frame
                    .presentation_ts
                    .saturating_sub(self.position.cluster_pts)
                    >= self.fragment_duration
                {
                    GeneratorState::StartCluster
                } else {
                    GeneratorState::StartBlock
                }
            }
        }
    }

    fn adapt_payload(&mut self, frame: &Frame, track_index: usize) -> StreamResult<Bytes> {
        let track = &self.tracks[track_index];
        let adaptable = track.codec_id == CODEC_ID_H264 || track.codec_id == CODEC_ID_H265;
        if !adaptable || frame.data.is_empty() {
            return Ok(frame.data.clone());
        }
        match self.nal_adaptation {
            NalAdaptation::None => Ok(frame.data.clone()),
            NalAdaptation::AnnexBToAvcc => {
                // Extraction also runs in measure mode so the measured and
                // committed headers always agree on the codec private data.
                if frame.is_key_frame()
                    && track.codec_id == CODEC_ID_H264
                    && track.codec_private_data.is_none()
                {
                    if let Some(cpd) = nal::extract_h264_cpd(&frame.data)? {
                        log::info!(
                            "[Mkv] Extracted {} bytes of codec private data from key frame",
                            cpd.len()
                        );
                        self.tracks[track_index].codec_private_data = Some(cpd);
                    }
                }
                nal::annexb_to_avcc(&frame.data)
            }
            NalAdaptation::AvccToAnnexB => nal::avcc_to_annexb(&frame.data),
        }
    }

    fn put_header(&self, out: &mut BytesMut) {
        // EBML header
        let mut ebml_children = BytesMut::new();
        ebml::put_uint(&mut ebml_children, ebml::ID_EBML_VERSION, 1);
        ebml::put_uint(&mut ebml_children, ebml::ID_EBML_READ_VERSION, 1);
        ebml::put_uint(&mut ebml_children, ebml::ID_EBML_MAX_ID_LENGTH, 4);
        ebml::put_uint(&mut ebml_children, ebml::ID_EBML_MAX_SIZE_LENGTH, 8);
        ebml::put_string(&mut ebml_children, ebml::ID_DOC_TYPE, "matroska");
        ebml::put_uint(&mut ebml_children, ebml::ID_DOC_TYPE_VERSION, 2);
        ebml::put_uint(&mut ebml_children, ebml::ID_DOC_TYPE_READ_VERSION, 2);
        ebml::put_master(out, ebml::ID_EBML, &ebml_children);

        // Segment, open-ended for streaming.
        ebml::put_id(out, ebml::ID_SEGMENT);
        ebml::put_unknown_size(out);

        // SegmentInfo
        let mut info = BytesMut::new();
        ebml::put_binary(&mut info, ebml::ID_SEGMENT_UID, &self.segment_uuid);
        // TimecodeScale is expressed in nanoseconds on the wire.
        ebml::put_uint(&mut info, ebml::ID_TIMECODE_SCALE, self.timecode_scale * 100);
        ebml::put_string(&mut info, ebml::ID_TITLE, &self.client_id);
        ebml::put_string(
            &mut info,
            ebml::ID_MUXING_APP,
            concat!("loomcast-", env!("CARGO_PKG_VERSION")),
        );
        ebml::put_string(&mut info, ebml::ID_WRITING_APP, &self.client_id);
        ebml::put_master(out, ebml::ID_INFO, &info);

        // Tracks
        let mut tracks = BytesMut::new();
        for (index, track) in self.tracks.iter().enumerate() {
            let mut entry = BytesMut::new();
            ebml::put_uint(&mut entry, ebml::ID_TRACK_NUMBER, index as u64 + 1);
            ebml::put_uint(&mut entry, ebml::ID_TRACK_UID, track.track_id.max(1));
            ebml::put_string(&mut entry, ebml::ID_TRACK_NAME, &track.track_name);
            ebml::put_string(&mut entry, ebml::ID_CODEC_ID, &track.codec_id);
            match track.params {
                TrackParams::Video(v) => {
                    ebml::put_uint(&mut entry, ebml::ID_TRACK_TYPE, ebml::TRACK_TYPE_VIDEO);
                    let mut video = BytesMut::new();
                    ebml::put_uint(&mut video, ebml::ID_PIXEL_WIDTH, u64::from(v.width));
                    ebml::put_uint(&mut video, ebml::ID_PIXEL_HEIGHT, u64::from(v.height));
                    ebml::put_master(&mut entry, ebml::ID_VIDEO, &video);
                }
                TrackParams::Audio(a) => {
                    ebml::put_uint(&mut entry, ebml::ID_TRACK_TYPE, ebml::TRACK_TYPE_AUDIO);
                    let mut audio = BytesMut::new();
                    ebml::put_float(&mut audio, ebml::ID_SAMPLING_FREQUENCY, a.sampling_frequency);
                    ebml::put_uint(&mut audio, ebml::ID_CHANNELS, u64::from(a.channels));
                    ebml::put_master(&mut entry, ebml::ID_AUDIO, &audio);
                }
            }
            if let Some(cpd) = &track.codec_private_data {
                ebml::put_binary(&mut entry, ebml::ID_CODEC_PRIVATE, cpd);
            }
            ebml::put_master(&mut tracks, ebml::ID_TRACK_ENTRY, &entry);
        }
        ebml::put_master(out, ebml::ID_TRACKS, &tracks);
    }

    fn put_cluster_header(&self, out: &mut BytesMut, cluster_pts: Ticks, stream_start_ts: Ticks) {
        ebml::put_id(out, ebml::ID_CLUSTER);
        ebml::put_unknown_size(out);
        let base = if self.absolute_fragment_times {
            cluster_pts
        } else {
            cluster_pts.saturating_sub(stream_start_ts)
        };
        ebml::put_uint(out, ebml::ID_TIMECODE, base / self.timecode_scale);
    }

    fn put_simple_block(
        &self,
        out: &mut BytesMut,
        frame: &Frame,
        track_index: usize,
        cluster_pts: Ticks,
        payload: &[u8],
    ) {
        let relative =
            (frame.presentation_ts.saturating_sub(cluster_pts) / self.timecode_scale) as i16;
        let mut flags = 0u8;
        if frame.is_key_frame() {
            flags |= ebml::SIMPLE_BLOCK_FLAG_KEY;
        }
        if frame.flags & FRAME_FLAG_DISCARDABLE != 0 {
            flags |= ebml::SIMPLE_BLOCK_FLAG_DISCARDABLE;
        }

        let mut block = BytesMut::with_capacity(payload.len() + 8);
        ebml::put_block_track_number(&mut block, track_index as u64 + 1);
        block.put_i16(relative);
        block.put_u8(flags);
        block.put_slice(payload);

        ebml::put_id(out, ebml::ID_SIMPLE_BLOCK);
        ebml::put_size(out, block.len() as u64);
        out.put_slice(&block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TrackType, VideoTrackParams};
    use crate::frame::{FRAME_FLAG_KEY_FRAME, FRAME_FLAG_NONE};
    use crate::time::TICKS_PER_MILLISECOND;

    fn test_info() -> StreamInfo {
        StreamInfo {
            name: "gen-test".into(),
            tracks: vec![TrackInfo {
                track_id: 1,
                track_type: TrackType::Video,
                codec_id: "V_MPEG4/ISO/AVC".into(),
                track_name: "video".into(),
                codec_private_data: None,
                params: TrackParams::Video(VideoTrackParams {
                    width: 640,
                    height: 480,
                }),
            }],
            segment_uuid: Some([7u8; 16]),
            fragment_duration: 2_000 * TICKS_PER_MILLISECOND,
            ..StreamInfo::default()
        }
    }

    fn frame(pts: Ticks, key: bool) -> Frame {
        Frame {
            track_id: 1,
            flags: if key { FRAME_FLAG_KEY_FRAME } else { FRAME_FLAG_NONE },
            presentation_ts: pts,
            decoding_ts: pts,
            duration: 33 * TICKS_PER_MILLISECOND,
            data: Bytes::from_static(&[0x65, 1, 2, 3]),
        }
    }

    #[test]
    fn first_frame_opens_stream_then_blocks_follow() {
        let mut generator = MkvGenerator::new(&test_info(), "test");
        let (bytes, info) = generator.package_frame(&frame(0, true), 1, true).unwrap();
        assert_eq!(info.generator_state, GeneratorState::StartStream);
        assert!(info.data_offset > 0);
        assert!(bytes.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]));
        // Cluster id follows the header at data_offset.
        let cluster = &bytes[info.data_offset as usize..];
        assert!(cluster.starts_with(&[0x1F, 0x43, 0xB6, 0x75]));

        let (bytes, info) = generator
            .package_frame(&frame(33 * TICKS_PER_MILLISECOND, false), 1, true)
            .unwrap();
        assert_eq!(info.generator_state, GeneratorState::StartBlock);
        assert_eq!(info.data_offset, 0);
        assert!(bytes.starts_with(&[0xA3]));
    }

    #[test]
    fn measurement_does_not_mutate_state() {
        let mut generator = MkvGenerator::new(&test_info(), "test");
        let (measured, _) = generator.package_frame(&frame(0, true), 1, false).unwrap();
        let (packaged, info) = generator.package_frame(&frame(0, true), 1, true).unwrap();
        assert_eq!(measured, packaged);
        assert_eq!(info.generator_state, GeneratorState::StartStream);
    }

    #[test]
    fn key_frames_open_clusters() {
        let mut generator = MkvGenerator::new(&test_info(), "test");
        generator.package_frame(&frame(0, true), 1, true).unwrap();
        let (_, info) = generator
            .package_frame(&frame(500 * TICKS_PER_MILLISECOND, true), 1, true)
            .unwrap();
        assert_eq!(info.generator_state, GeneratorState::StartCluster);
        assert_eq!(info.cluster_pts, 500 * TICKS_PER_MILLISECOND);
    }

    #[test]
    fn fragment_duration_bounds_cluster_length() {
        let info = StreamInfo {
            key_frame_fragmentation: false,
            ..test_info()
        };
        let mut generator = MkvGenerator::new(&info, "test");
        generator.package_frame(&frame(0, true), 1, true).unwrap();
        let (_, encoded) = generator
            .package_frame(&frame(2_500 * TICKS_PER_MILLISECOND, false), 1, true)
            .unwrap();
        assert_eq!(encoded.generator_state, GeneratorState::StartCluster);
    }

    #[test]
    fn committed_tag_forces_new_cluster() {
        let mut generator = MkvGenerator::new(&test_info(), "test");
        generator.package_frame(&frame(0, true), 1, true).unwrap();
        let tag = generator.generate_tag("NAME", "value", true).unwrap();
        assert!(tag.starts_with(&[0x12, 0x54, 0xC3, 0x67]));
        let (_, info) = generator
            .package_frame(&frame(33 * TICKS_PER_MILLISECOND, false), 1, true)
            .unwrap();
        assert_eq!(info.generator_state, GeneratorState::StartCluster);
    }

    #[test]
    fn reset_reopens_stream_and_regenerates_unpinned_uuid() {
        let mut info = test_info();
        info.segment_uuid = None;
        let mut generator = MkvGenerator::new(&info, "test");
        let (first, _) = generator.package_frame(&frame(0, true), 1, true).unwrap();
        generator.reset();
        let (second, encoded) = generator
            .package_frame(&frame(1_000 * TICKS_PER_MILLISECOND, true), 1, true)
            .unwrap();
        assert_eq!(encoded.generator_state, GeneratorState::StartStream);
        // Same layout, different segment UUID.
        assert_eq!(first.len(), second.len());
        assert_ne!(first, second);
    }

    #[test]
    fn pinned_uuid_survives_reset() {
        let mut generator = MkvGenerator::new(&test_info(), "test");
        let (first, _) = generator.package_frame(&frame(0, true), 1, true).unwrap();
        generator.reset();
        let (second, _) = generator.package_frame(&frame(0, true), 1, true).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn relative_cluster_timecode_subtracts_stream_start() {
        let mut generator = MkvGenerator::new(&test_info(), "test");
        let start = 5_000 * TICKS_PER_MILLISECOND;
        let (_, info) = generator.package_frame(&frame(start, true), 1, true).unwrap();
        assert_eq!(info.stream_start_ts, start);
        let (bytes, info) = generator
            .package_frame(&frame(start + 2_500 * TICKS_PER_MILLISECOND, true), 1, true)
            .unwrap();
        assert_eq!(info.generator_state, GeneratorState::StartCluster);
        // Timecode element payload: 2500ms relative = 0x09C4.
        let tc_pos = bytes
            .windows(2)
            .position(|w| w == [0xE7, 0x82])
            .expect("timecode element");
        assert_eq!(&bytes[tc_pos + 2..tc_pos + 4], &[0x09, 0xC4]);
    }

    #[test]
    fn header_generation_is_pure() {
        let mut generator = MkvGenerator::new(&test_info(), "test");
        generator.package_frame(&frame(1_000, true), 1, true).unwrap();
        let (header_a, start_a) = generator.generate_header();
        let (header_b, start_b) = generator.generate_header();
        assert_eq!(header_a, header_b);
        assert_eq!(start_a, start_b);
        assert_eq!(start_a, 1_000);
    }

    #[test]
    fn timecode_mapping_uses_scale() {
        let generator = MkvGenerator::new(&test_info(), "test");
        assert_eq!(generator.timecode_to_ticks(1), TICKS_PER_MILLISECOND);
    }
}
