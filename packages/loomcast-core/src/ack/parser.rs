//! Streaming ACK tokenizer.
//!
//! The upload connection interleaves one JSON object per acknowledgment
//! into the response stream. The parser is a byte-wise state machine that
//! accepts arbitrarily split input, decodes exactly one ACK per outer
//! brace pair, skips unknown keys with structured values at the correct
//! brace/bracket depth, and resets itself on any malformed byte without
//! tearing down the connection.

use crate::error::{AckFormatError, ServiceCallResult, StreamError, StreamResult};
use crate::protocol_constants::{MAX_ACK_FRAGMENT_LEN, MAX_FRAGMENT_SEQUENCE_NUMBER_LEN};

use super::{AckType, FragmentAck};

const KEY_EVENT_TYPE: &str = "EventType";
const KEY_FRAGMENT_TIMECODE: &str = "FragmentTimecode";
const KEY_FRAGMENT_NUMBER: &str = "FragmentNumber";
const KEY_ERROR_ID: &str = "ErrorId";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParserState {
    /// Scanning for the opening brace.
    Start,
    /// Inside the object, before a key.
    AckStart,
    /// Accumulating a quoted key.
    KeyStart,
    /// Between key and value, expecting the colon.
    Delimiter,
    /// Expecting the first byte of a value.
    BodyStart,
    /// Skipping a nested object.
    SkipBodyBrace,
    /// Skipping a nested array.
    SkipBodyBracket,
    /// Accumulating a quoted value.
    TextValue,
    /// Accumulating a numeric value.
    NumericValue,
    /// After a value, expecting a comma, a new key, or the closing brace.
    ValueEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyName {
    EventType,
    FragmentTimecode,
    FragmentNumber,
    ErrorId,
    Unknown,
}

impl KeyName {
    fn parse(key: &str) -> Self {
        match key {
            KEY_EVENT_TYPE => Self::EventType,
            KEY_FRAGMENT_TIMECODE => Self::FragmentTimecode,
            KEY_FRAGMENT_NUMBER => Self::FragmentNumber,
            KEY_ERROR_ID => Self::ErrorId,
            _ => Self::Unknown,
        }
    }

    fn seen_slot(self) -> Option<usize> {
        match self {
            Self::EventType => Some(0),
            Self::FragmentTimecode => Some(1),
            Self::FragmentNumber => Some(2),
            Self::ErrorId => Some(3),
            Self::Unknown => None,
        }
    }
}

/// Incremental fragment ACK parser. One instance per upload connection
/// direction; feeding it is serialized by the stream lock.
pub struct FragmentAckParser {
    state: ParserState,
    accumulator: String,
    cur_key: KeyName,
    skip_depth: u32,
    keys_seen: [bool; 4],
    ack_type: Option<AckType>,
    timecode: Option<u64>,
    sequence_number: Option<String>,
    error_result: ServiceCallResult,
}

impl Default for FragmentAckParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FragmentAckParser {
    /// Creates a parser in its initial state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ParserState::Start,
            accumulator: String::new(),
            cur_key: KeyName::Unknown,
            skip_depth: 0,
            keys_seen: [false; 4],
            ack_type: None,
            timecode: None,
            sequence_number: None,
            error_result: ServiceCallResult::Ok,
        }
    }

    /// Drops any partial state and returns to scanning for an object.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Consumes one segment of the ACK byte stream, emitting every
    /// completed acknowledgment.
    ///
    /// Splitting the stream at any byte boundary yields the same ACKs as
    /// feeding it whole. A grammar violation resets the parser and is
    /// reported; already-emitted ACKs stand.
    pub fn feed(&mut self, segment: &[u8]) -> StreamResult<Vec<FragmentAck>> {
        if segment.len() > MAX_ACK_FRAGMENT_LEN {
            return Err(StreamError::InvalidAckFormat(AckFormatError::SegmentTooLong));
        }

        let mut acks = Vec::new();
        for &byte in segment {
            match self.feed_byte(byte) {
                Ok(Some(ack)) => acks.push(ack),
                Ok(None) => {}
                Err(err) => {
                    log::warn!("[AckParser] Resetting on malformed input: {err}");
                    self.reset();
                    return Err(err);
                }
            }
        }
        Ok(acks)
    }

    fn feed_byte(&mut self, byte: u8) -> StreamResult<Option<FragmentAck>> {
        let ch = byte as char;
        match self.state {
            ParserState::Start => {
                if ch == '{' {
                    self.state = ParserState::AckStart;
                }
            }
            ParserState::AckStart => {
                if !ch.is_ascii_whitespace() {
                    if ch != '"' {
                        return Err(StreamError::InvalidAckFormat(AckFormatError::KeyStart));
                    }
                    self.state = ParserState::KeyStart;
                }
            }
            ParserState::KeyStart => {
                if ch == '"' {
                    self.cur_key = KeyName::parse(&self.accumulator);
                    self.accumulator.clear();
                    self.state = ParserState::Delimiter;
                } else {
                    self.accumulate(ch)?;
                }
            }
            ParserState::Delimiter => {
                if !ch.is_ascii_whitespace() && ch == ':' {
                    self.state = ParserState::BodyStart;
                }
            }
            ParserState::BodyStart => {
                if ch.is_ascii_whitespace() {
                    return Ok(None);
                }
                match ch {
                    '{' => {
                        self.skip_depth = 1;
                        self.state = ParserState::SkipBodyBrace;
                    }
                    '[' => {
                        self.skip_depth = 1;
                        self.state = ParserState::SkipBodyBracket;
                    }
                    '"' => self.state = ParserState::TextValue,
                    '-' | '0'..='9' => {
                        self.accumulate(ch)?;
                        self.state = ParserState::NumericValue;
                    }
                    _ => {
                        return Err(StreamError::InvalidAckFormat(AckFormatError::ValueStart));
                    }
                }
            }
            ParserState::TextValue => {
                if ch == '"' {
                    self.process_value()?;
                    self.state = ParserState::ValueEnd;
                } else {
                    self.accumulate(ch)?;
                }
            }
            ParserState::NumericValue => {
                if ch.is_ascii_whitespace() || ch == ',' {
                    self.process_value()?;
                    self.state = ParserState::ValueEnd;
                } else if ch == '}' {
                    self.process_value()?;
                    return self.finish_ack().map(Some);
                } else if matches!(ch, '"' | '{' | '[' | ']' | ':') {
                    return Err(StreamError::InvalidAckFormat(AckFormatError::ValueEnd));
                } else {
                    self.accumulate(ch)?;
                }
            }
            ParserState::SkipBodyBrace => {
                match ch {
                    '{' => self.skip_depth += 1,
                    '}' => self.skip_depth -= 1,
                    _ => {}
                }
                if self.skip_depth == 0 {
                    self.state = ParserState::ValueEnd;
                }
            }
            ParserState::SkipBodyBracket => {
                match ch {
                    '[' => self.skip_depth += 1,
                    ']' => self.skip_depth -= 1,
                    _ => {}
                }
                if self.skip_depth == 0 {
                    self.state = ParserState::ValueEnd;
                }
            }
            ParserState::ValueEnd => {
                if ch.is_ascii_whitespace() || ch == ',' {
                    return Ok(None);
                }
                if ch == '}' {
                    return self.finish_ack().map(Some);
                }
                if ch == '"' {
                    self.state = ParserState::KeyStart;
                } else {
                    return Err(StreamError::InvalidAckFormat(AckFormatError::KeyStart));
                }
            }
        }
        Ok(None)
    }

    fn accumulate(&mut self, ch: char) -> StreamResult<()> {
        if self.accumulator.len() >= MAX_FRAGMENT_SEQUENCE_NUMBER_LEN {
            return Err(StreamError::InvalidAckFormat(AckFormatError::TokenTooLong));
        }
        self.accumulator.push(ch);
        Ok(())
    }

    fn process_value(&mut self) -> StreamResult<()> {
        if let Some(slot) = self.cur_key.seen_slot() {
            if self.keys_seen[slot] {
                return Err(StreamError::InvalidAckFormat(AckFormatError::DuplicateKey));
            }
            self.keys_seen[slot] = true;
        }

        match self.cur_key {
            KeyName::EventType => {
                self.ack_type = AckType::from_event_type(&self.accumulator);
            }
            KeyName::FragmentTimecode => {
                let value: u64 = self
                    .accumulator
                    .parse()
                    .map_err(|_| StreamError::InvalidAckFormat(AckFormatError::InvalidNumber))?;
                self.timecode = Some(value);
            }
            KeyName::FragmentNumber => {
                self.sequence_number = Some(self.accumulator.clone());
            }
            KeyName::ErrorId => {
                let value: u64 = self
                    .accumulator
                    .parse()
                    .map_err(|_| StreamError::InvalidAckFormat(AckFormatError::InvalidNumber))?;
                self.error_result = ServiceCallResult::from_ack_error_id(value);
            }
            KeyName::Unknown => {}
        }

        self.accumulator.clear();
        Ok(())
    }

    fn finish_ack(&mut self) -> StreamResult<FragmentAck> {
        let ack_type = self
            .ack_type
            .ok_or(StreamError::InvalidAckFormat(AckFormatError::MissingEventType))?;
        if ack_type == AckType::Error && self.error_result == ServiceCallResult::Ok {
            return Err(StreamError::InvalidAckFormat(AckFormatError::MissingErrorId));
        }
        let ack = FragmentAck {
            ack_type,
            timecode: self.timecode,
            sequence_number: self.sequence_number.take(),
            result: self.error_result,
        };
        self.reset();
        Ok(ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(parser: &mut FragmentAckParser, payload: &str) -> Vec<FragmentAck> {
        parser.feed(payload.as_bytes()).unwrap()
    }

    #[test]
    fn decodes_one_ack_per_object() {
        let mut parser = FragmentAckParser::new();
        let acks = feed_all(
            &mut parser,
            r#"{"EventType":"PERSISTED","FragmentTimecode":9000,"FragmentNumber":"91343852333"}"#,
        );
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].ack_type, AckType::Persisted);
        assert_eq!(acks[0].timecode, Some(9000));
        assert_eq!(acks[0].sequence_number.as_deref(), Some("91343852333"));
    }

    #[test]
    fn byte_at_a_time_feed_is_equivalent() {
        let payload = r#"{"EventType":"RECEIVED","FragmentTimecode":1234567}"#;
        let mut parser = FragmentAckParser::new();
        let mut acks = Vec::new();
        for b in payload.as_bytes() {
            acks.extend(parser.feed(std::slice::from_ref(b)).unwrap());
        }
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].ack_type, AckType::Received);
        assert_eq!(acks[0].timecode, Some(1234567));
    }

    #[test]
    fn split_anywhere_matches_whole_feed() {
        let payload =
            r#" {"EventType":"BUFFERING","FragmentTimecode":42} {"EventType":"PERSISTED","FragmentTimecode":43}"#;
        let whole = {
            let mut p = FragmentAckParser::new();
            feed_all(&mut p, payload)
        };
        for split in 1..payload.len() {
            let mut p = FragmentAckParser::new();
            let mut acks = p.feed(&payload.as_bytes()[..split]).unwrap();
            acks.extend(p.feed(&payload.as_bytes()[split..]).unwrap());
            assert_eq!(acks, whole, "split at {split}");
        }
    }

    #[test]
    fn error_ack_requires_error_id() {
        let mut parser = FragmentAckParser::new();
        let err = parser
            .feed(br#"{"EventType":"ERROR","FragmentTimecode":5}"#)
            .unwrap_err();
        assert_eq!(
            err,
            StreamError::InvalidAckFormat(AckFormatError::MissingErrorId)
        );

        // Parser recovered: the next well-formed ACK decodes.
        let acks = feed_all(
            &mut parser,
            r#"{"EventType":"ERROR","ErrorId":4006,"FragmentTimecode":5}"#,
        );
        assert_eq!(acks[0].ack_type, AckType::Error);
        assert_eq!(acks[0].result, ServiceCallResult::AckInvalidMkvData);
    }

    #[test]
    fn unknown_structured_values_are_skipped_at_depth() {
        let mut parser = FragmentAckParser::new();
        let acks = feed_all(
            &mut parser,
            r#"{"Extra":{"nested":{"deep":[1,2,{"x":3}]}},"EventType":"IDLE","List":[[1],[2]]}"#,
        );
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].ack_type, AckType::Idle);
        assert_eq!(acks[0].timecode, None);
    }

    #[test]
    fn duplicate_keys_reset_the_parser() {
        let mut parser = FragmentAckParser::new();
        let err = parser
            .feed(br#"{"EventType":"RECEIVED","EventType":"RECEIVED"}"#)
            .unwrap_err();
        assert_eq!(
            err,
            StreamError::InvalidAckFormat(AckFormatError::DuplicateKey)
        );
        // Fresh object parses after the reset.
        let acks = feed_all(&mut parser, r#"{"EventType":"RECEIVED","FragmentTimecode":1}"#);
        assert_eq!(acks.len(), 1);
    }

    #[test]
    fn whitespace_tolerant_grammar() {
        let mut parser = FragmentAckParser::new();
        let acks = feed_all(
            &mut parser,
            "  {  \"EventType\" : \"BUFFERING\" ,\n \"FragmentTimecode\" : 77 }",
        );
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].timecode, Some(77));
    }

    #[test]
    fn oversized_segment_is_rejected() {
        let mut parser = FragmentAckParser::new();
        let big = vec![b' '; MAX_ACK_FRAGMENT_LEN + 1];
        assert!(parser.feed(&big).is_err());
    }
}
