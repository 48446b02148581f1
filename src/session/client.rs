//! Attach client: subscribe to a session's event stream and send controls.

use std::borrow::Cow;
use std::io::{BufReader, BufWriter};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::cancel::{CancelToken, HookGuard};
use crate::error::OrchardError;
use crate::recorder::{EventKind, RecordedEvent};
use crate::session::SessionMeta;
use crate::session::protocol::{Frame, MetaEvent, PROTOCOL_VERSION, decode_payload, read_frame, write_frame};

const STREAM_DEPTH: usize = 256;
const CONTROL_TIMEOUT: Duration = Duration::from_secs(120);

/// One event as seen by a client.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientEvent {
    pub cursor: u64,
    pub ts: DateTime<Utc>,
    pub kind: EventKind,
    pub payload: Vec<u8>,
}

impl ClientEvent {
    /// The decoded meta event, for `meta` events.
    pub fn meta(&self) -> Option<MetaEvent> {
        (self.kind == EventKind::Meta)
            .then(|| MetaEvent::from_payload(&self.payload))
            .flatten()
    }

    /// Payload for display. Invalid UTF-8 shows as U+FFFD.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

impl From<RecordedEvent> for ClientEvent {
    fn from(event: RecordedEvent) -> Self {
        Self {
            cursor: event.cursor,
            ts: event.ts,
            kind: event.kind,
            payload: event.payload,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AttachClient {
    session_id: u64,
    socket: PathBuf,
}

/// Live event stream. Finite once the session ends; not restartable.
pub struct EventStream {
    rx: Receiver<anyhow::Result<ClientEvent>>,
    stream: UnixStream,
    _cancel: Option<HookGuard>,
}

impl AttachClient {
    pub fn connect(meta: &SessionMeta) -> anyhow::Result<Self> {
        if !meta.status.is_live() {
            return Err(OrchardError::SocketUnavailable(format!(
                "session {} is {}",
                meta.id, meta.status
            ))
            .into());
        }
        Ok(Self {
            session_id: meta.id,
            socket: meta.socket_path.clone(),
        })
    }

    pub const fn session_id(&self) -> u64 {
        self.session_id
    }

    fn open(&self) -> anyhow::Result<UnixStream> {
        UnixStream::connect(&self.socket).map_err(|e| {
            OrchardError::SocketUnavailable(format!("{}: {e}", self.socket.display())).into()
        })
    }

    /// Subscribe to events after `since` (all history when `None`). Cancelling
    /// the token closes the connection and ends the stream.
    pub fn subscribe(&self, since: Option<u64>, cancel: Option<&CancelToken>) -> anyhow::Result<EventStream> {
        let stream = self.open()?;
        let mut writer = BufWriter::new(stream.try_clone()?);
        write_frame(
            &mut writer,
            &Frame::Hello {
                protocol: PROTOCOL_VERSION,
                since_cursor: since,
            },
        )
        .context("sending hello")?;
        drop(writer);

        let (tx, rx) = mpsc::sync_channel(STREAM_DEPTH);
        let mut reader = BufReader::new(stream.try_clone()?);
        let session_id = self.session_id;
        thread::spawn(move || {
            loop {
                let item = match read_frame(&mut reader) {
                    Ok(Some(Frame::Event {
                        cursor,
                        ts,
                        kind,
                        payload,
                        binary,
                    })) => decode_payload(payload, binary).map(|payload| ClientEvent {
                        cursor,
                        ts,
                        kind,
                        payload,
                    }),
                    Ok(Some(Frame::Ack {
                        ok: false, err, ..
                    })) => Err(match err {
                        Some(e) => OrchardError::Remote {
                            kind: e.kind,
                            message: e.message,
                        }
                        .into(),
                        None => anyhow::anyhow!("subscription refused"),
                    }),
                    Ok(Some(Frame::Bye) | None) => break,
                    Ok(Some(other)) => {
                        debug!(session_id, ?other, "ignoring unexpected frame");
                        continue;
                    }
                    Err(e) => Err(e),
                };
                let stop = item.is_err();
                if tx.send(item).is_err() || stop {
                    break;
                }
            }
        });

        let guard = cancel.map(|token| {
            let closer = stream.try_clone();
            token.on_cancel(move || {
                if let Ok(s) = &closer {
                    let _ = s.shutdown(Shutdown::Both);
                }
            })
        });
        Ok(EventStream {
            rx,
            stream,
            _cancel: guard,
        })
    }

    /// Send one control and wait for its ack. A refused control becomes an
    /// error carrying the daemon's error kind.
    pub fn control(&self, verb: &str, args: impl Serialize) -> anyhow::Result<Value> {
        self.control_timeout(verb, args, Some(CONTROL_TIMEOUT))
    }

    pub fn control_timeout(
        &self,
        verb: &str,
        args: impl Serialize,
        timeout: Option<Duration>,
    ) -> anyhow::Result<Value> {
        let stream = self.open()?;
        stream.set_read_timeout(timeout)?;
        stream.set_write_timeout(Some(Duration::from_secs(10)))?;
        let mut writer = BufWriter::new(stream.try_clone()?);
        write_frame(
            &mut writer,
            &Frame::Control {
                verb: verb.to_string(),
                args: serde_json::to_value(args)?,
            },
        )
        .with_context(|| format!("sending {verb}"))?;
        drop(writer);

        let mut reader = BufReader::new(stream);
        loop {
            match read_frame(&mut reader).with_context(|| format!("waiting for {verb} ack"))? {
                Some(Frame::Ack {
                    ok: true, data, ..
                }) => return Ok(data.unwrap_or(Value::Null)),
                Some(Frame::Ack {
                    ok: false, err, ..
                }) => {
                    let (kind, message) = err.map_or_else(
                        || (crate::error::ErrorKind::Internal, format!("{verb} failed")),
                        |e| (e.kind, e.message),
                    );
                    return Err(OrchardError::Remote { kind, message }.into());
                }
                Some(Frame::Bye) | None => {
                    return Err(OrchardError::SocketUnavailable(format!(
                        "session {} closed before answering {verb}",
                        self.session_id
                    ))
                    .into());
                }
                Some(_) => {}
            }
        }
    }
}

impl EventStream {
    /// Close the connection; the stream ends after buffered events.
    pub fn close(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

impl Iterator for EventStream {
    type Item = anyhow::Result<ClientEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.recv().ok()
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.close();
    }
}
