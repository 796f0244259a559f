// THEORY:
// The `ReconnectingSource` is the only part of a camera unit that talks to the
// camera. Real streams misbehave: RTSP sessions time out, Wi-Fi cameras reboot,
// decoders stall on a corrupt GOP. The source hides all of that behind one call,
// `next_frame()`, which always returns promptly with either a frame or
// `Unavailable`. It never errors and never panics the unit.
//
// Key architectural principles:
// 1.  **Pluggable transport**: the actual decoding sits behind `StreamBackend` /
//     `StreamConnection`. The binary plugs in OpenCV; tests plug in a script.
// 2.  **Blocking work off the runtime**: opens and reads are blocking calls, so
//     they run on tokio's blocking pool under a timeout. The connection is moved
//     into the blocking closure and handed back with the result. A blocking call
//     cannot be cancelled: if the timeout fires first, the call is kept as
//     `abandoned` and the next open waits for it (within `connect_timeout`) so
//     the late connection is dropped first. There is never more than one live
//     connection per camera.
// 3.  **Explicit backoff**: after a failure the source waits `initial` before the
//     next open attempt, doubling per failed attempt up to `max`. While waiting,
//     `next_frame()` answers `Unavailable` without touching the network. Only a
//     frame read resets it; a reopen that cannot deliver a frame keeps doubling.
// 4.  **Counting recoveries**: a lost stream that delivers frames again is one
//     reconnect sequence, however many opens and reads failed in between.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};

use crate::config::{StreamSettings, StreamUri};
use crate::core_modules::frame::Frame;
use crate::error::Result;

/// An open, blocking stream connection.
pub trait StreamConnection: Send {
    /// Blocks until the next decoded frame is available.
    fn read_frame(&mut self) -> Result<Frame>;
}

/// Opens connections for a stream URI.
pub trait StreamBackend: Send + Sync {
    fn open(&self, uri: &StreamUri, settings: &StreamSettings) -> Result<Box<dyn StreamConnection>>;
}

#[derive(Debug)]
pub enum NextFrame {
    Ready(Frame),
    Unavailable,
}

/// Exponential backoff between reconnect attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.min(max);
        Backoff { initial, max, next: initial, failures: 0 }
    }

    /// Delay to wait after one more failure.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.failures += 1;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
        self.failures = 0;
    }

    /// Consecutive failures since the last reset.
    pub fn failures(&self) -> u32 {
        self.failures
    }
}

enum Link {
    /// No connection; the next call attempts to open one.
    Idle,
    Connected(Box<dyn StreamConnection>),
    Waiting { retry_at: Instant },
}

/// A timed-out blocking open or read; resolves once the call returns and its connection is dropped.
type Abandoned = Pin<Box<dyn Future<Output = ()> + Send>>;

fn abandon<T: Send + 'static>(call: tokio::task::JoinHandle<T>) -> Abandoned {
    Box::pin(async move {
        let _ = call.await;
    })
}

pub struct ReconnectingSource {
    camera_id: String,
    uri: StreamUri,
    settings: StreamSettings,
    backend: Arc<dyn StreamBackend>,
    link: Link,
    backoff: Backoff,
    abandoned: Option<Abandoned>,
    /// Set when an established connection was lost and no frame has been read since.
    recovering: bool,
    reconnect_sequences: u64,
    open_attempts: u64,
}

impl ReconnectingSource {
    pub fn new(camera_id: impl Into<String>, uri: StreamUri, settings: StreamSettings, backend: Arc<dyn StreamBackend>) -> Self {
        let backoff = Backoff::new(settings.initial_backoff(), settings.max_backoff());
        ReconnectingSource {
            camera_id: camera_id.into(),
            uri,
            settings,
            backend,
            link: Link::Idle,
            backoff,
            abandoned: None,
            recovering: false,
            reconnect_sequences: 0,
            open_attempts: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.link, Link::Connected(_))
    }

    /// Completed recoveries (a lost stream delivering frames again).
    pub fn reconnect_sequences(&self) -> u64 {
        self.reconnect_sequences
    }

    pub fn open_attempts(&self) -> u64 {
        self.open_attempts
    }

    /// Time left before the next open attempt, if backing off.
    pub fn backoff_remaining(&self) -> Option<Duration> {
        match self.link {
            Link::Waiting { retry_at } => Some(retry_at.saturating_duration_since(Instant::now())),
            _ => None,
        }
    }

    /// Drops the current connection, if any.
    pub fn disconnect(&mut self) {
        if self.is_connected() {
            debug!(camera = %self.camera_id, "closing stream");
        }
        self.link = Link::Idle;
    }

    pub async fn next_frame(&mut self) -> NextFrame {
        let conn = match std::mem::replace(&mut self.link, Link::Idle) {
            Link::Connected(conn) => conn,
            Link::Waiting { retry_at } if Instant::now() < retry_at => {
                self.link = Link::Waiting { retry_at };
                return NextFrame::Unavailable;
            }
            Link::Waiting { .. } | Link::Idle => match self.open().await {
                Some(conn) => conn,
                None => return NextFrame::Unavailable,
            },
        };
        self.read(conn).await
    }

    /// Waits for a timed-out call to return. False if it is still stuck.
    async fn settle_abandoned(&mut self) -> bool {
        let Some(mut call) = self.abandoned.take() else {
            return true;
        };
        if timeout(self.settings.connect_timeout(), &mut call).await.is_ok() {
            return true;
        }
        self.abandoned = Some(call);
        false
    }

    async fn open(&mut self) -> Option<Box<dyn StreamConnection>> {
        if !self.settle_abandoned().await {
            self.schedule_retry("previous stream call still blocked");
            return None;
        }
        self.open_attempts += 1;
        let backend = Arc::clone(&self.backend);
        let uri = self.uri.clone();
        let settings = self.settings.clone();
        let mut call = tokio::task::spawn_blocking(move || backend.open(&uri, &settings));
        let opened = timeout(self.settings.connect_timeout(), &mut call).await;

        let reason = match opened {
            Ok(Ok(Ok(conn))) => {
                if self.recovering {
                    debug!(camera = %self.camera_id, attempts = self.backoff.failures() + 1, "stream reopened");
                } else {
                    info!(camera = %self.camera_id, uri = %self.uri, "stream opened");
                }
                return Some(conn);
            }
            Ok(Ok(Err(e))) => e.to_string(),
            Ok(Err(join_error)) => format!("open task failed: {join_error}"),
            Err(_) => {
                self.abandoned = Some(abandon(call));
                format!("open timed out after {:?}", self.settings.connect_timeout())
            }
        };
        self.schedule_retry(&reason);
        None
    }

    async fn read(&mut self, mut conn: Box<dyn StreamConnection>) -> NextFrame {
        let mut call = tokio::task::spawn_blocking(move || {
            let result = conn.read_frame();
            (conn, result)
        });
        let read = timeout(self.settings.read_timeout(), &mut call).await;

        let reason = match read {
            Ok(Ok((conn, Ok(frame)))) => {
                self.link = Link::Connected(conn);
                if self.recovering {
                    self.recovering = false;
                    self.reconnect_sequences += 1;
                    info!(
                        camera = %self.camera_id,
                        failures = self.backoff.failures(),
                        sequences = self.reconnect_sequences,
                        "stream reconnected"
                    );
                }
                self.backoff.reset();
                return NextFrame::Ready(frame);
            }
            Ok(Ok((_conn, Err(e)))) => e.to_string(),
            Ok(Err(join_error)) => format!("read task failed: {join_error}"),
            Err(_) => {
                self.abandoned = Some(abandon(call));
                format!("read timed out after {:?}", self.settings.read_timeout())
            }
        };
        self.recovering = true;
        self.schedule_retry(&reason);
        NextFrame::Unavailable
    }

    fn schedule_retry(&mut self, reason: &str) {
        let delay = self.backoff.next_delay();
        warn!(
            camera = %self.camera_id,
            failures = self.backoff.failures(),
            retry_in_ms = delay.as_millis() as u64,
            "stream unavailable: {reason}"
        );
        self.link = Link::Waiting { retry_at: Instant::now() + delay };
    }
}
