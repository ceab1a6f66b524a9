//! Upload handle lifecycle.
//!
//! Every successful put-stream call yields an opaque [`UploadHandle`] for
//! one outbound HTTP streaming request. Handles live in an ordered list
//! (oldest first) and advance through a small state machine driven only by
//! `get_stream_data` and ACK/termination events. During token rotation two
//! handles overlap: the old one drains to its end-of-stream while the new
//! one waits its turn.

use std::collections::VecDeque;

use crate::time::Ticks;

/// Opaque identifier of one outbound upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UploadHandle(pub u64);

/// Upload handle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// Created by a put-stream result, not yet eligible to serve.
    New,
    /// Eligible to start serving data.
    Ready,
    /// Actively serving view bytes.
    Streaming,
    /// Drained past a stream boundary; emitting trailing metadata/EOS.
    Terminating,
    /// EOS emitted; awaiting the persisted ACK of its last fragment.
    AwaitingAck,
    /// Last persisted ACK arrived; next read returns end-of-stream.
    AckReceived,
    /// Finished or externally terminated.
    Terminated,
    /// Failed; reads return an abort indication.
    Error,
}

impl HandleState {
    /// Bit value for mask queries.
    #[must_use]
    pub fn mask(self) -> u32 {
        match self {
            Self::New => 1 << 0,
            Self::Ready => 1 << 1,
            Self::Streaming => 1 << 2,
            Self::Terminating => 1 << 3,
            Self::AwaitingAck => 1 << 4,
            Self::AckReceived => 1 << 5,
            Self::Terminated => 1 << 6,
            Self::Error => 1 << 7,
        }
    }
}

/// States that still participate in the upload pipeline.
pub const HANDLE_STATE_ACTIVE: u32 = (1 << 0) | (1 << 1) | (1 << 2) | (1 << 3) | (1 << 4) | (1 << 5);
/// States that have not served any data yet.
pub const HANDLE_STATE_NOT_IN_USE: u32 = (1 << 0) | (1 << 1);
/// States draining trailing metadata/EOS bytes.
pub const HANDLE_STATE_SENDING_EOS: u32 = (1 << 3) | (1 << 6);
/// States an older handle must reach before a newer handle's persisted
/// ACKs may trim the shared view tail.
pub const HANDLE_STATE_READY_TO_TRIM: u32 = (1 << 5) | (1 << 6);

/// Book-keeping for one upload session.
#[derive(Debug, Clone)]
pub struct UploadHandleInfo {
    /// The handle value issued by the host.
    pub handle: UploadHandle,
    /// Current lifecycle state.
    pub state: HandleState,
    /// Wall-clock creation time.
    pub create_time: Ticks,
    /// Stream-start timestamp captured when the session first serves data;
    /// translates session-relative ACK timecodes to absolute time.
    pub session_start_ts: Option<Ticks>,
    /// ACK timestamp of the last fragment boundary this session served.
    pub last_fragment_ts: Option<Ticks>,
    /// Timestamp of the last persisted ACK received on this session.
    pub last_persisted_ack_ts: Option<Ticks>,
}

impl UploadHandleInfo {
    /// Creates a handle record in the `New` state.
    #[must_use]
    pub fn new(handle: UploadHandle, create_time: Ticks) -> Self {
        Self {
            handle,
            state: HandleState::New,
            create_time,
            session_start_ts: None,
            last_fragment_ts: None,
            last_persisted_ack_ts: None,
        }
    }

    /// Whether the state matches any bit of `mask`.
    #[must_use]
    pub fn in_state(&self, mask: u32) -> bool {
        self.state.mask() & mask != 0
    }

    /// Whether the session already received the persisted ACK covering its
    /// last served fragment.
    #[must_use]
    pub fn last_fragment_acked(&self) -> bool {
        match (self.last_persisted_ack_ts, self.last_fragment_ts) {
            (Some(acked), Some(last)) => acked >= last,
            _ => false,
        }
    }
}

/// Ordered upload handle table, oldest first.
#[derive(Debug, Default)]
pub struct UploadHandleList {
    handles: VecDeque<UploadHandleInfo>,
}

impl UploadHandleList {
    /// Creates an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether no handles are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Appends a freshly created handle.
    pub fn push(&mut self, info: UploadHandleInfo) {
        self.handles.push_back(info);
    }

    /// Looks up a handle.
    #[must_use]
    pub fn get(&self, handle: UploadHandle) -> Option<&UploadHandleInfo> {
        self.handles.iter().find(|h| h.handle == handle)
    }

    /// Looks up a handle mutably.
    pub fn get_mut(&mut self, handle: UploadHandle) -> Option<&mut UploadHandleInfo> {
        self.handles.iter_mut().find(|h| h.handle == handle)
    }

    /// Oldest handle whose state matches `mask`.
    #[must_use]
    pub fn first_in_state(&self, mask: u32) -> Option<&UploadHandleInfo> {
        self.handles.iter().find(|h| h.in_state(mask))
    }

    /// Oldest handle whose state matches `mask`, mutably.
    pub fn first_in_state_mut(&mut self, mask: u32) -> Option<&mut UploadHandleInfo> {
        self.handles.iter_mut().find(|h| h.in_state(mask))
    }

    /// Removes a handle from the table.
    pub fn remove(&mut self, handle: UploadHandle) -> Option<UploadHandleInfo> {
        let pos = self.handles.iter().position(|h| h.handle == handle)?;
        self.handles.remove(pos)
    }

    /// Whether every handle older than `handle` has finished its ACK
    /// obligations, making `handle`'s persisted ACKs eligible to trim the
    /// view tail.
    #[must_use]
    pub fn eligible_to_trim(&self, handle: UploadHandle) -> bool {
        for info in &self.handles {
            if info.handle == handle {
                return true;
            }
            if !info.in_state(HANDLE_STATE_READY_TO_TRIM) {
                return false;
            }
        }
        // Unknown handles never trim.
        false
    }

    /// Iterates over all handles, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &UploadHandleInfo> {
        self.handles.iter()
    }

    /// Iterates mutably over all handles, oldest first.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut UploadHandleInfo> {
        self.handles.iter_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_queries_find_oldest_match() {
        let mut list = UploadHandleList::new();
        let mut a = UploadHandleInfo::new(UploadHandle(1), 0);
        a.state = HandleState::Terminated;
        let mut b = UploadHandleInfo::new(UploadHandle(2), 1);
        b.state = HandleState::Ready;
        let mut c = UploadHandleInfo::new(UploadHandle(3), 2);
        c.state = HandleState::Ready;
        list.push(a);
        list.push(b);
        list.push(c);

        assert_eq!(
            list.first_in_state(HANDLE_STATE_NOT_IN_USE).unwrap().handle,
            UploadHandle(2)
        );
        assert!(list.first_in_state(HandleState::Error.mask()).is_none());
    }

    #[test]
    fn trim_eligibility_requires_older_handles_finished() {
        let mut list = UploadHandleList::new();
        let mut old = UploadHandleInfo::new(UploadHandle(1), 0);
        old.state = HandleState::AwaitingAck;
        list.push(old);
        list.push(UploadHandleInfo::new(UploadHandle(2), 1));

        assert!(list.eligible_to_trim(UploadHandle(1)));
        assert!(!list.eligible_to_trim(UploadHandle(2)));

        list.get_mut(UploadHandle(1)).unwrap().state = HandleState::AckReceived;
        assert!(list.eligible_to_trim(UploadHandle(2)));
    }

    #[test]
    fn last_fragment_acked_compares_timestamps() {
        let mut info = UploadHandleInfo::new(UploadHandle(1), 0);
        assert!(!info.last_fragment_acked());
        info.last_fragment_ts = Some(100);
        info.last_persisted_ack_ts = Some(90);
        assert!(!info.last_fragment_acked());
        info.last_persisted_ack_ts = Some(100);
        assert!(info.last_fragment_acked());
    }
}
