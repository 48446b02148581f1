//! Attach protocol: newline-delimited JSON frames over the session socket.
//!
//! A client opens a connection and sends either `hello` (subscribe) or
//! `control` (one request, answered by one `ack`). The daemon answers a
//! `hello` with the recorded history after `since_cursor`, then the live tail,
//! then `bye` when the session ends.

use std::io::{BufRead, Write};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorKind;
use crate::recorder::{EventKind, RecordedEvent};

/// Bumped whenever a frame or meta event kind changes.
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Hello {
        protocol: u32,
        /// Deliver events with a cursor greater than this.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        since_cursor: Option<u64>,
    },
    Event {
        cursor: u64,
        ts: DateTime<Utc>,
        kind: EventKind,
        payload: String,
        /// `payload` is base64 because the recorded bytes are not UTF-8.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        binary: bool,
    },
    Control {
        verb: String,
        #[serde(default)]
        args: Value,
    },
    Ack {
        verb: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        err: Option<AckError>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    Bye,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckError {
    pub kind: ErrorKind,
    pub message: String,
}

impl Frame {
    pub fn event(event: &RecordedEvent) -> Self {
        let (payload, binary) = match std::str::from_utf8(&event.payload) {
            Ok(text) => (text.to_string(), false),
            Err(_) => (BASE64.encode(&event.payload), true),
        };
        Self::Event {
            cursor: event.cursor,
            ts: event.ts,
            kind: event.kind,
            payload,
            binary,
        }
    }

    pub fn ack_ok(verb: &str, data: Option<Value>) -> Self {
        Self::Ack {
            verb: verb.to_string(),
            ok: true,
            err: None,
            data,
        }
    }

    pub fn ack_err(verb: &str, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Ack {
            verb: verb.to_string(),
            ok: false,
            err: Some(AckError {
                kind,
                message: message.into(),
            }),
            data: None,
        }
    }
}

/// The recorded bytes carried by an event frame.
pub fn decode_payload(payload: String, binary: bool) -> anyhow::Result<Vec<u8>> {
    if binary {
        Ok(BASE64.decode(payload)?)
    } else {
        Ok(payload.into_bytes())
    }
}

/// Structured events written to the recording with tag `meta`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetaEvent {
    SessionStart {
        session_id: u64,
        loop_name: String,
        profile: String,
        steps: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_session_id: Option<u64>,
    },
    TurnStart {
        cycle: u32,
        step: usize,
        turn: u32,
        profile: String,
        role: String,
        turn_id: String,
    },
    TurnEnd {
        cycle: u32,
        step: usize,
        turn: u32,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit: Option<i32>,
        cause: String,
        duration_ms: u64,
        #[serde(default)]
        cost: f64,
        #[serde(default)]
        tools: u64,
    },
    Heartbeat {
        cycle: u32,
    },
    StepMessage {
        from_step: usize,
        to_step: usize,
        text: String,
    },
    Notify {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        message: String,
    },
    Note {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        author: Option<String>,
    },
    SpawnStarted {
        child_id: u64,
        child_index: u32,
        profile: String,
        role: String,
        read_only: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        worktree: Option<String>,
    },
    SpawnFinished {
        child_id: u64,
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_kind: Option<String>,
    },
    SpawnFailed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        child_id: Option<u64>,
        profile: String,
        reason: String,
    },
    PushFailed {
        error: String,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
    LoopEnd {
        reason: String,
        cycles: u32,
    },
    SessionEnd {
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_kind: Option<String>,
    },
    /// A kind this build does not know; skipped by readers.
    #[serde(other)]
    Unknown,
}

impl MetaEvent {
    pub fn to_payload(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_else(|_| b"{\"type\":\"unknown\"}".to_vec())
    }

    pub fn from_payload(payload: &[u8]) -> Option<Self> {
        serde_json::from_slice(payload).ok()
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::SessionStart { .. } => "session_start",
            Self::TurnStart { .. } => "turn_start",
            Self::TurnEnd { .. } => "turn_end",
            Self::Heartbeat { .. } => "heartbeat",
            Self::StepMessage { .. } => "step_message",
            Self::Notify { .. } => "notify",
            Self::Note { .. } => "note",
            Self::SpawnStarted { .. } => "spawn_started",
            Self::SpawnFinished { .. } => "spawn_finished",
            Self::SpawnFailed { .. } => "spawn_failed",
            Self::PushFailed { .. } => "push_failed",
            Self::Error { .. } => "error",
            Self::LoopEnd { .. } => "loop_end",
            Self::SessionEnd { .. } => "session_end",
            Self::Unknown => "unknown",
        }
    }
}

// -- control arguments -------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NoteArgs {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StopArgs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageArgs {
    pub text: String,
    /// Destination step index; defaults to the next step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_step: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyArgs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpawnArgs {
    pub profile: String,
    pub task: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub read_only: bool,
    /// `/`-separated profile path into the step's delegation tree.
    #[serde(default)]
    pub parent_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChildArgs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpawnWaitArgs {
    pub child: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergeArgs {
    pub child: u64,
    #[serde(default)]
    pub squash: bool,
}

// -- framing -----------------------------------------------------------------

pub fn write_frame(w: &mut impl Write, frame: &Frame) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(frame).map_err(std::io::Error::other)?;
    line.push(b'\n');
    w.write_all(&line)?;
    w.flush()
}

/// Read one frame. `Ok(None)` on clean EOF.
pub fn read_frame(r: &mut impl BufRead) -> anyhow::Result<Option<Frame>> {
    let mut line = String::new();
    loop {
        line.clear();
        if r.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        if !line.trim().is_empty() {
            break;
        }
    }
    let frame = serde_json::from_str(line.trim_end())
        .map_err(|e| anyhow::anyhow!("malformed frame: {e}"))?;
    Ok(Some(frame))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufReader;

    #[test]
    fn frames_are_tagged_by_type() {
        let hello = Frame::Hello { protocol: 1, since_cursor: Some(2) };
        let json = serde_json::to_string(&hello).unwrap();
        assert_eq!(json, r#"{"type":"hello","protocol":1,"since_cursor":2}"#);

        let ack = Frame::ack_err("spawn", ErrorKind::SpawnDenied, "no rule");
        let json = serde_json::to_string(&ack).unwrap();
        assert!(json.contains(r#""kind":"spawn_denied""#));
    }

    #[test]
    fn unknown_meta_kind_decodes_as_unknown() {
        let meta = MetaEvent::from_payload(br#"{"type":"telepathy","level":9}"#).unwrap();
        assert_eq!(meta, MetaEvent::Unknown);
    }

    #[test]
    fn meta_payload_round_trips() {
        let meta = MetaEvent::TurnEnd {
            cycle: 0,
            step: 1,
            turn: 0,
            ok: true,
            exit: Some(0),
            cause: "exited".into(),
            duration_ms: 12,
            cost: 0.0,
            tools: 0,
        };
        assert_eq!(MetaEvent::from_payload(&meta.to_payload()), Some(meta));
    }

    #[test]
    fn read_frame_skips_blank_lines_and_reports_eof() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Frame::Bye).unwrap();
        let data = [b"\n".as_slice(), &buf].concat();
        let mut reader = BufReader::new(data.as_slice());
        assert_eq!(read_frame(&mut reader).unwrap(), Some(Frame::Bye));
        assert_eq!(read_frame(&mut reader).unwrap(), None);
    }

    #[test]
    fn non_utf8_payloads_travel_as_base64() {
        let recorded = RecordedEvent {
            cursor: 4,
            ts: Utc::now(),
            kind: EventKind::Stdout,
            payload: vec![b'o', b'k', 0xff, 0xfe, b'\n'],
        };
        let Frame::Event { payload, binary, .. } = Frame::event(&recorded) else {
            panic!("expected an event frame");
        };
        assert!(binary);
        assert_eq!(decode_payload(payload, binary).unwrap(), recorded.payload);

        let text = RecordedEvent {
            payload: b"plain text".to_vec(),
            ..recorded
        };
        let json = serde_json::to_string(&Frame::event(&text)).unwrap();
        assert!(json.contains(r#""payload":"plain text""#));
        assert!(!json.contains("binary"));
    }

    #[test]
    fn control_args_default_when_missing() {
        let frame: Frame = serde_json::from_str(r#"{"type":"control","verb":"status"}"#).unwrap();
        assert_eq!(frame, Frame::Control { verb: "status".into(), args: Value::Null });
    }
}
