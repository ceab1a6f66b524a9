//! Fragment metadata queue and pre-generated tag blobs.
//!
//! Application metadata is queued as serialized Tag entries and flushed at
//! the next cluster boundary (tags are level-1 elements and cannot sit
//! inside a cluster). Persistent entries re-emit with every fragment until
//! removed; one-shot entries emit once. The end-of-stream blob is a single
//! pre-generated end-of-fragment tag appended when an upload session
//! drains past a stream boundary.

use bytes::BytesMut;

use crate::error::{StreamError, StreamResult};
use crate::protocol_constants::{
    EOFR_METADATA_NAME, INTERNAL_METADATA_PREFIX, MAX_FRAGMENT_METADATA_COUNT,
    MAX_METADATA_STRING_LEN,
};

use super::{state, BlobTracker, SerializedMetadata, StreamInner};

/// Regenerates the end-of-stream blob (one end-of-fragment tag).
pub(crate) fn regenerate_eos_blob(inner: &mut StreamInner) -> StreamResult<()> {
    let tag = inner.generator.generate_tag(EOFR_METADATA_NAME, "", false)?;
    inner.eos_tracker = BlobTracker {
        data: tag,
        offset: 0,
        send: false,
    };
    Ok(())
}

/// Validates and queues one application metadata entry.
pub(crate) fn put_fragment_metadata(
    inner: &mut StreamInner,
    name: &str,
    value: &str,
    persistent: bool,
) -> StreamResult<()> {
    if inner.stream_stopped {
        return Err(StreamError::StreamHasBeenStopped);
    }

    // Metadata is accepted at any point of the control-plane handshake
    // except the pre-describe states.
    if inner.indicator != state::STREAM_STATE_READY {
        let allowed = state::STREAM_STATE_READY
            | state::STREAM_STATE_PUT_STREAM
            | state::STREAM_STATE_TAG_STREAM
            | state::STREAM_STATE_STREAMING
            | state::STREAM_STATE_GET_ENDPOINT
            | state::STREAM_STATE_GET_TOKEN
            | state::STREAM_STATE_STOPPED;
        if !state::machine_accepts(inner, allowed) {
            return Err(StreamError::InvalidStreamState);
        }
    }

    if name.starts_with(INTERNAL_METADATA_PREFIX) {
        return Err(StreamError::InvalidArgument(format!(
            "metadata name '{name}' uses the reserved prefix"
        )));
    }
    if name.len() > MAX_METADATA_STRING_LEN || value.len() > MAX_METADATA_STRING_LEN {
        return Err(StreamError::InvalidArgument(
            "metadata name or value too long".into(),
        ));
    }

    // Measure without mutating the generator.
    let packaged_size = inner.generator.generate_tag(name, value, false)?.len();

    if persistent {
        if let Some(pos) = inner
            .metadata_queue
            .iter()
            .position(|m| m.persistent && m.name == name)
        {
            inner.metadata_queue.remove(pos);
            // Empty value removes a persistent entry.
            if value.is_empty() {
                return Ok(());
            }
        }
    }

    if inner.metadata_queue.len() >= MAX_FRAGMENT_METADATA_COUNT {
        return Err(StreamError::InvalidArgument(
            "fragment metadata queue is full".into(),
        ));
    }

    append_validated(inner, name, value, persistent, packaged_size);
    Ok(())
}

/// Appends a pre-validated entry to the queue.
pub(crate) fn append_validated(
    inner: &mut StreamInner,
    name: &str,
    value: &str,
    persistent: bool,
    packaged_size: usize,
) {
    inner.metadata_queue.push_back(SerializedMetadata {
        name: name.to_string(),
        value: value.to_string(),
        persistent,
        applied: false,
        packaged_size,
    });
}

/// Byte size of the metadata that a flush with the same `not_sent_only`
/// setting would produce.
pub(crate) fn pending_metadata_size(inner: &StreamInner, not_sent_only: bool) -> usize {
    inner
        .metadata_queue
        .iter()
        .filter(|m| !(m.applied && not_sent_only))
        .map(|m| m.packaged_size)
        .sum()
}

/// Packages queued metadata into one byte run.
///
/// Every packaged entry is marked applied; one-shot entries leave the
/// queue, persistent ones stay and re-emit at the next boundary. With
/// `commit_tags` set the generator registers the tag run so the next frame
/// opens a new cluster.
pub(crate) fn package_metadata(
    inner: &mut StreamInner,
    not_sent_only: bool,
    commit_tags: bool,
) -> StreamResult<bytes::Bytes> {
    let mut out = BytesMut::new();
    let mut entries = std::mem::take(&mut inner.metadata_queue);
    let mut failure = None;

    for entry in entries.iter_mut() {
        if failure.is_none() && !(entry.applied && not_sent_only) {
            match inner
                .generator
                .generate_tag(&entry.name, &entry.value, commit_tags)
            {
                Ok(tag) => {
                    out.extend_from_slice(&tag);
                    entry.applied = true;
                }
                Err(err) => failure = Some(err),
            }
        }
    }

    entries.retain(|m| m.persistent);
    inner.metadata_queue = entries;

    match failure {
        Some(err) => Err(err),
        None => Ok(out.freeze()),
    }
}

/// Whether any queued entry has not been emitted yet. Suppressed after an
/// explicit end-of-fragment: appending tags there would orphan them.
pub(crate) fn has_unsent_metadata(inner: &StreamInner) -> bool {
    if inner.eofr_frame {
        return false;
    }
    inner.metadata_queue.iter().any(|m| !m.applied)
}

/// Packages every unsent entry into the metadata tracker blob for the
/// uploader to drain ahead of the end-of-stream tag.
pub(crate) fn package_unsent_metadata(inner: &mut StreamInner) -> StreamResult<()> {
    let mut out = BytesMut::new();
    let mut entries = std::mem::take(&mut inner.metadata_queue);
    let mut failure = None;

    for entry in entries.iter_mut() {
        if failure.is_none() && !entry.applied {
            match inner.generator.generate_tag(&entry.name, &entry.value, true) {
                Ok(tag) => {
                    out.extend_from_slice(&tag);
                    entry.applied = true;
                }
                Err(err) => failure = Some(err),
            }
        }
    }
    drop(entries);

    if let Some(err) = failure {
        return Err(err);
    }

    inner.metadata_tracker = BlobTracker {
        data: out.freeze(),
        offset: 0,
        send: true,
    };
    Ok(())
}
