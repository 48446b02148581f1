//! Append-only session recording.
//!
//! Each event is a text header followed by the raw payload:
//!
//! ```text
//! 2026-01-02T03:04:05.123456789Z stdout 5
//! hello
//! ```
//!
//! The header carries an RFC 3339 timestamp with nanoseconds, the event tag,
//! and the payload length in bytes. The payload is followed by one newline.
//! Cursors are not stored: an event's cursor is its 1-based position.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind as IoErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::OrchardError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Stdin,
    Stdout,
    Stderr,
    Meta,
}

impl EventKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stdin => "stdin",
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::Meta => "meta",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "stdin" => Some(Self::Stdin),
            "stdout" => Some(Self::Stdout),
            "stderr" => Some(Self::Stderr),
            "meta" => Some(Self::Meta),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub cursor: u64,
    pub ts: DateTime<Utc>,
    pub kind: EventKind,
    pub payload: Vec<u8>,
}

impl RecordedEvent {
    /// Payload as text; invalid UTF-8 shows as U+FFFD.
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Writer half. Owned by the session daemon.
pub struct Recorder {
    path: PathBuf,
    file: File,
    count: u64,
    last_ts: Option<DateTime<Utc>>,
}

impl Recorder {
    /// Open (or create) the recording at `path`. An existing recording is
    /// scanned so new events continue its cursor sequence.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        let mut count = 0;
        let mut last_ts = None;
        if path.exists() {
            for event in replay(path)? {
                let event = event?;
                count = event.cursor;
                last_ts = Some(event.ts);
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening recording {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            count,
            last_ts,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of events written so far; also the last assigned cursor.
    pub const fn len(&self) -> u64 {
        self.count
    }

    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Append one event. Timestamps never go backwards within a recording.
    /// Meta events are synced to disk before returning.
    pub fn append(&mut self, kind: EventKind, payload: &[u8]) -> anyhow::Result<RecordedEvent> {
        let mut ts = Utc::now();
        if let Some(last) = self.last_ts
            && ts < last
        {
            ts = last;
        }
        let header = format!(
            "{} {} {}\n",
            ts.to_rfc3339_opts(SecondsFormat::Nanos, true),
            kind.as_str(),
            payload.len()
        );
        let mut record = Vec::with_capacity(header.len() + payload.len() + 1);
        record.extend_from_slice(header.as_bytes());
        record.extend_from_slice(payload);
        record.push(b'\n');

        self.file
            .write_all(&record)
            .with_context(|| format!("appending to {}", self.path.display()))?;
        self.file.flush()?;
        if kind == EventKind::Meta {
            self.file
                .sync_data()
                .with_context(|| format!("syncing {}", self.path.display()))?;
        }

        self.count += 1;
        self.last_ts = Some(ts);
        Ok(RecordedEvent {
            cursor: self.count,
            ts,
            kind,
            payload: payload.to_vec(),
        })
    }
}

/// Iterate the whole recording from the start.
pub fn replay(path: &Path) -> anyhow::Result<Replay> {
    replay_range(path, 0, None)
}

/// Iterate events with `after < cursor <= upto`. `upto = None` reads to EOF.
pub fn replay_range(path: &Path, after: u64, upto: Option<u64>) -> anyhow::Result<Replay> {
    let file = File::open(path).with_context(|| format!("opening recording {}", path.display()))?;
    Ok(Replay {
        reader: BufReader::new(file),
        offset: 0,
        cursor: 0,
        after,
        upto,
        done: false,
    })
}

/// Lazy event sequence over a recording file.
pub struct Replay {
    reader: BufReader<File>,
    offset: u64,
    cursor: u64,
    after: u64,
    upto: Option<u64>,
    done: bool,
}

impl Replay {
    fn corrupted(&mut self, message: impl Into<String>) -> anyhow::Error {
        self.done = true;
        OrchardError::RecordingCorrupted {
            offset: self.offset,
            message: message.into(),
        }
        .into()
    }

    fn read_one(&mut self) -> anyhow::Result<Option<RecordedEvent>> {
        let mut header = Vec::new();
        let n = self.reader.read_until(b'\n', &mut header)?;
        if n == 0 {
            return Ok(None);
        }
        if header.last() != Some(&b'\n') {
            return Err(self.corrupted("truncated event header"));
        }
        let header = String::from_utf8_lossy(&header[..n - 1]).into_owned();
        let mut parts = header.splitn(3, ' ');
        let (Some(ts), Some(tag), Some(len)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(self.corrupted(format!("malformed header {header:?}")));
        };
        let Ok(ts) = DateTime::parse_from_rfc3339(ts) else {
            return Err(self.corrupted(format!("bad timestamp {ts:?}")));
        };
        let Some(kind) = EventKind::parse(tag) else {
            return Err(self.corrupted(format!("unknown event tag {tag:?}")));
        };
        let Ok(len) = len.parse::<usize>() else {
            return Err(self.corrupted(format!("bad length {len:?}")));
        };

        let mut payload = vec![0u8; len];
        match self.reader.read_exact(&mut payload) {
            Ok(()) => {}
            Err(e) if e.kind() == IoErrorKind::UnexpectedEof => {
                return Err(self.corrupted(format!("length prefix {len} overruns end of file")));
            }
            Err(e) => return Err(e.into()),
        }
        let mut newline = [0u8; 1];
        match self.reader.read_exact(&mut newline) {
            Ok(()) if newline[0] == b'\n' => {}
            Ok(()) => return Err(self.corrupted("missing record terminator")),
            Err(e) if e.kind() == IoErrorKind::UnexpectedEof => {
                return Err(self.corrupted("length prefix overruns end of file"));
            }
            Err(e) => return Err(e.into()),
        }

        self.offset += (n + len + 1) as u64;
        self.cursor += 1;
        Ok(Some(RecordedEvent {
            cursor: self.cursor,
            ts: ts.with_timezone(&Utc),
            kind,
            payload,
        }))
    }
}

impl Iterator for Replay {
    type Item = anyhow::Result<RecordedEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done || self.upto.is_some_and(|u| self.cursor >= u) {
                return None;
            }
            match self.read_one() {
                Ok(Some(event)) if event.cursor <= self.after => {}
                Ok(Some(event)) => return Some(Ok(event)),
                Ok(None) => {
                    self.done = true;
                    return None;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, kind_of};

    fn recording() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records").join("1").join("events.log");
        (dir, path)
    }

    #[test]
    fn replay_reproduces_events_in_order() {
        let (_dir, path) = recording();
        let mut rec = Recorder::open(&path).unwrap();
        rec.append(EventKind::Meta, br#"{"type":"turn_start"}"#).unwrap();
        rec.append(EventKind::Stdout, b"hello").unwrap();
        rec.append(EventKind::Stdout, b"line with\nnewline").unwrap();
        rec.append(EventKind::Stderr, b"").unwrap();

        let events: Vec<_> = replay(&path).unwrap().map(Result::unwrap).collect();
        assert_eq!(events.len(), 4);
        assert_eq!(events[1].payload, b"hello");
        assert_eq!(events[2].payload, b"line with\nnewline");
        assert_eq!(events[3].kind, EventKind::Stderr);
        for pair in events.windows(2) {
            assert!(pair[0].cursor < pair[1].cursor);
            assert!(pair[0].ts <= pair[1].ts);
        }
    }

    #[test]
    fn reopen_continues_cursor_sequence() {
        let (_dir, path) = recording();
        let mut rec = Recorder::open(&path).unwrap();
        rec.append(EventKind::Stdout, b"a").unwrap();
        rec.append(EventKind::Stdout, b"b").unwrap();
        drop(rec);
        let mut rec = Recorder::open(&path).unwrap();
        assert_eq!(rec.len(), 2);
        assert_eq!(rec.append(EventKind::Stdout, b"c").unwrap().cursor, 3);
    }

    #[test]
    fn range_respects_bounds() {
        let (_dir, path) = recording();
        let mut rec = Recorder::open(&path).unwrap();
        for i in 0..5 {
            rec.append(EventKind::Stdout, format!("{i}").as_bytes()).unwrap();
        }
        let cursors: Vec<u64> = replay_range(&path, 2, Some(4))
            .unwrap()
            .map(|e| e.unwrap().cursor)
            .collect();
        assert_eq!(cursors, vec![3, 4]);
    }

    #[test]
    fn overrunning_length_prefix_is_corruption() {
        let (_dir, path) = recording();
        let mut rec = Recorder::open(&path).unwrap();
        rec.append(EventKind::Stdout, b"ok").unwrap();
        drop(rec);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"2026-01-01T00:00:00.000000000Z stdout 100\nshort").unwrap();

        let mut it = replay(&path).unwrap();
        assert!(it.next().unwrap().is_ok());
        let err = it.next().unwrap().unwrap_err();
        assert_eq!(kind_of(&err), ErrorKind::RecordingCorrupted);
        assert!(it.next().is_none());
    }

    #[test]
    fn malformed_header_is_corruption() {
        let (_dir, path) = recording();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "garbage\n").unwrap();
        let err = replay(&path).unwrap().next().unwrap().unwrap_err();
        assert_eq!(kind_of(&err), ErrorKind::RecordingCorrupted);
    }
}
