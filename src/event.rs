//! Normalized event schema and line-oriented JSON codec (C1).
//!
//! The wire format is one JSON object per line: `{"eventType": "...",
//! "payload": {...}}`. [`decode_line`] turns one line into an [`Event`];
//! [`LineCodec`] accumulates bytes from a stream and yields complete,
//! decoded events, buffering a trailing partial line across reads.

use serde::{Deserialize, Serialize};

/// A structured test error, attached to a failed [`crate::model::TestCase`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TestError {
    pub message: String,
    #[serde(default)]
    pub stack: Option<String>,
    #[serde(default)]
    pub expected: Option<String>,
    #[serde(default)]
    pub actual: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
}

/// Terminal or non-terminal status carried on the wire. Distinct from
/// [`crate::model::Status`] so the codec has no dependency on model internals.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum WireStatus {
    Pass,
    Fail,
    Skip,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Totals {
    #[serde(default)]
    pub passed: u32,
    #[serde(default)]
    pub failed: u32,
    #[serde(default)]
    pub skipped: u32,
    #[serde(default)]
    pub total: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GroupPath {
    #[serde(rename = "groupName")]
    pub group_name: String,
    #[serde(rename = "parentNames", default)]
    pub parent_names: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GroupResultPayload {
    #[serde(rename = "groupName")]
    pub group_name: String,
    #[serde(rename = "parentNames", default)]
    pub parent_names: Vec<String>,
    pub status: WireStatus,
    #[serde(default)]
    pub duration: Option<u64>,
    #[serde(default)]
    pub totals: Option<Totals>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GroupErrorPayload {
    #[serde(rename = "groupName")]
    pub group_name: String,
    #[serde(rename = "parentNames", default)]
    pub parent_names: Vec<String>,
    #[serde(rename = "errorMessage")]
    pub error_message: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TestCasePayload {
    #[serde(rename = "testName")]
    pub test_name: String,
    #[serde(rename = "parentNames", default)]
    pub parent_names: Vec<String>,
    pub status: WireStatus,
    #[serde(default)]
    pub duration: Option<u64>,
    #[serde(default)]
    pub error: Option<TestError>,
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub stderr: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GroupOutputPayload {
    #[serde(rename = "groupName")]
    pub group_name: String,
    #[serde(rename = "parentNames", default)]
    pub parent_names: Vec<String>,
    pub chunk: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct CollectionFinishPayload {
    #[serde(default)]
    pub collected: u32,
}

/// The normalized event union. Deserialized from `{"eventType": ..., "payload": ...}`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "eventType", content = "payload")]
pub enum Event {
    #[serde(rename = "testGroupDiscovered")]
    GroupDiscovered(GroupPath),
    #[serde(rename = "testGroupStart")]
    GroupStart(GroupPath),
    #[serde(rename = "testGroupResult")]
    GroupResult(GroupResultPayload),
    #[serde(rename = "testGroupError")]
    GroupError(GroupErrorPayload),
    #[serde(rename = "testCase")]
    TestCase(TestCasePayload),
    #[serde(rename = "groupStdout")]
    GroupStdout(GroupOutputPayload),
    #[serde(rename = "groupStderr")]
    GroupStderr(GroupOutputPayload),
    #[serde(rename = "collectionStart")]
    CollectionStart,
    #[serde(rename = "collectionFinish")]
    CollectionFinish(CollectionFinishPayload),
    #[serde(rename = "runComplete")]
    RunComplete,
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed event line: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unknown event type: {0}")]
    UnknownEventType(String),
}

/// Strips a leading UTF-8 BOM and surrounding whitespace, then parses the
/// line as one [`Event`]. A line that is empty after trimming yields `Ok(None)`.
pub fn decode_line(raw: &[u8]) -> Result<Option<Event>, CodecError> {
    let text = String::from_utf8_lossy(raw);
    let trimmed = text
        .trim_start_matches('\u{feff}')
        .trim();

    if trimmed.is_empty() {
        return Ok(None);
    }

    // Detect unknown eventType values up front so we can produce a distinct,
    // loggable error rather than the generic serde message.
    if let Ok(probe) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(event_type) = probe.get("eventType").and_then(|v| v.as_str()) {
            const KNOWN: &[&str] = &[
                "testGroupDiscovered",
                "testGroupStart",
                "testGroupResult",
                "testGroupError",
                "testCase",
                "groupStdout",
                "groupStderr",
                "collectionStart",
                "collectionFinish",
                "runComplete",
            ];
            if !KNOWN.contains(&event_type) {
                return Err(CodecError::UnknownEventType(event_type.to_string()));
            }
        }
    }

    let event: Event = serde_json::from_str(trimmed)?;
    Ok(Some(event))
}

/// Accumulates bytes from a stream into complete lines, decoding each as an
/// event. Malformed or unknown lines are logged and skipped; a trailing
/// partial line is buffered until more bytes arrive.
#[derive(Default)]
pub struct LineCodec {
    buffer: Vec<u8>,
}

impl LineCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds new bytes in and returns all complete, successfully decoded
    /// events found so far. Decode errors on individual lines are logged via
    /// `tracing` and otherwise swallowed, per the parser's resilience rules.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Event> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();

        loop {
            let newline_pos = self.buffer.iter().position(|&b| b == b'\n');
            let Some(pos) = newline_pos else { break };
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = &line[..line.len() - 1]; // drop the newline itself

            match decode_line(line) {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "dropping malformed IPC line");
                }
            }
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_group_discovered() {
        let line = br#"{"eventType":"testGroupDiscovered","payload":{"groupName":"t.js","parentNames":[]}}"#;
        let event = decode_line(line).unwrap().unwrap();
        match event {
            Event::GroupDiscovered(p) => assert_eq!(p.group_name, "t.js"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn strips_bom_and_whitespace() {
        let mut line = vec![0xEF, 0xBB, 0xBF];
        line.extend_from_slice(br#"  {"eventType":"collectionStart","payload":{}}  "#);
        let event = decode_line(&line).unwrap().unwrap();
        assert!(matches!(event, Event::CollectionStart));
    }

    #[test]
    fn empty_line_yields_none() {
        assert!(decode_line(b"   ").unwrap().is_none());
        assert!(decode_line(b"").unwrap().is_none());
    }

    #[test]
    fn unknown_event_type_is_an_error() {
        let line = br#"{"eventType":"somethingUnknown","payload":{}}"#;
        let err = decode_line(line).unwrap_err();
        assert!(matches!(err, CodecError::UnknownEventType(_)));
    }

    #[test]
    fn malformed_json_is_an_error() {
        let line = b"not json at all {";
        assert!(decode_line(line).is_err());
    }

    #[test]
    fn invalid_utf8_is_replaced_not_fatal() {
        let line = [b'"', 0xFF, 0xFE, b'"'].to_vec();
        // Not valid JSON, but must not panic; from_utf8_lossy replaces bytes.
        let _ = decode_line(&line);
    }

    #[test]
    fn line_codec_buffers_partial_lines_across_feeds() {
        let mut codec = LineCodec::new();
        let events = codec.feed(br#"{"eventType":"collectionStart","payload":{}}"#);
        assert!(events.is_empty(), "no newline yet, must not decode");

        let events = codec.feed(b"\n");
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn line_codec_skips_malformed_lines_without_stopping() {
        let mut codec = LineCodec::new();
        let input = b"not json\n{\"eventType\":\"collectionStart\",\"payload\":{}}\n";
        let events = codec.feed(input);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn line_codec_decodes_multiple_events_in_one_feed() {
        let mut codec = LineCodec::new();
        let input = b"{\"eventType\":\"collectionStart\",\"payload\":{}}\n{\"eventType\":\"runComplete\",\"payload\":{}}\n";
        let events = codec.feed(input);
        assert_eq!(events.len(), 2);
    }
}
