//! Stream broadcaster
//!
//! A single producer task reads translated SSE frames from the upstream and
//! fans them out to subscriber channels. The full frame backlog is retained
//! until the stream terminates, so a subscriber joining mid-stream replays
//! from the beginning and every subscriber observes the identical frame
//! sequence. Slow subscribers are disconnected rather than slowing the
//! upstream; subscriber disconnects never affect the upstream until the last
//! subscriber is gone.

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use nimbus_ingress::sse::SseFrame;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

/// How a broadcast ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminal {
    /// Upstream closed normally (including after an inline error frame)
    Completed,
    /// Every subscriber left before the upstream finished; the upstream
    /// read was abandoned
    Cancelled,
    /// No upstream frame arrived within the idle timeout
    IdleTimeout,
    /// The stream exceeded its absolute duration bound
    TotalTimeout,
}

impl Terminal {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Terminal::IdleTimeout | Terminal::TotalTimeout)
    }
}

/// Broadcaster limits, taken from the settings snapshot at stream start
#[derive(Debug, Clone)]
pub struct BroadcastOptions {
    pub idle_timeout: Duration,
    pub total_timeout: Duration,
    /// Frames a subscriber may fall behind before being disconnected
    pub backlog_max: usize,
}

enum SubMessage {
    Frame(SseFrame),
    End(Terminal),
}

struct BroadcastState {
    backlog: Vec<SseFrame>,
    subscribers: Vec<mpsc::Sender<SubMessage>>,
    /// Whether any subscriber ever attached; distinguishes "nobody came yet"
    /// from "everybody left"
    had_subscribers: bool,
}

/// Single-producer, multi-subscriber fan-out of one upstream stream
pub struct Broadcaster {
    state: Mutex<BroadcastState>,
    terminal_rx: watch::Receiver<Option<Terminal>>,
    backlog_max: usize,
}

impl Broadcaster {
    /// Spawn the producer task over a stream of wire-ready frames.
    pub fn spawn(frames: BoxStream<'static, SseFrame>, opts: BroadcastOptions) -> Arc<Self> {
        let (terminal_tx, terminal_rx) = watch::channel(None);
        let broadcaster = Arc::new(Self {
            state: Mutex::new(BroadcastState {
                backlog: Vec::new(),
                subscribers: Vec::new(),
                had_subscribers: false,
            }),
            terminal_rx,
            backlog_max: opts.backlog_max,
        });

        let producer = Arc::clone(&broadcaster);
        tokio::spawn(async move {
            let terminal = producer.run(frames, &opts).await;
            producer.finish(terminal.clone(), &terminal_tx);
        });

        broadcaster
    }

    async fn run(&self, mut frames: BoxStream<'static, SseFrame>, opts: &BroadcastOptions) -> Terminal {
        let deadline = Instant::now() + opts.total_timeout;

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Terminal::TotalTimeout;
            }
            let wait = opts.idle_timeout.min(deadline - now);

            match tokio::time::timeout(wait, frames.next()).await {
                Err(_) => {
                    return if Instant::now() >= deadline {
                        Terminal::TotalTimeout
                    } else {
                        Terminal::IdleTimeout
                    };
                }
                Ok(None) => return Terminal::Completed,
                Ok(Some(frame)) => {
                    if !self.distribute(frame) {
                        // Last subscriber left; abandon the upstream read.
                        return Terminal::Cancelled;
                    }
                }
            }
        }
    }

    /// Append a frame to the backlog and fan it out. Returns false when no
    /// subscribers remain (and at least one had attached).
    fn distribute(&self, frame: SseFrame) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.backlog.push(frame.clone());

        state.subscribers.retain(|tx| {
            match tx.try_send(SubMessage::Frame(frame.clone())) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!("subscriber exceeded backlog limit, disconnecting");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });

        !(state.had_subscribers && state.subscribers.is_empty())
    }

    fn finish(&self, terminal: Terminal, terminal_tx: &watch::Sender<Option<Terminal>>) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());

        // Timeouts surface to connected clients as an inline error frame.
        if terminal.is_timeout() {
            let frame = SseFrame::error("timeout_error", "stream timed out waiting for upstream");
            state.backlog.push(frame.clone());
            for tx in &state.subscribers {
                let _ = tx.try_send(SubMessage::Frame(frame.clone()));
            }
        }

        for tx in state.subscribers.drain(..) {
            let _ = tx.try_send(SubMessage::End(terminal.clone()));
        }
        let _ = terminal_tx.send(Some(terminal));
    }

    /// Attach a subscriber. The returned subscription first replays the
    /// backlog, then follows live frames. Joining after termination replays
    /// the whole stream.
    pub fn subscribe(&self) -> Subscription {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let backlog = state.backlog.clone();

        let (tx, rx) = mpsc::channel(self.backlog_max.max(16));
        if let Some(terminal) = self.terminal() {
            let _ = tx.try_send(SubMessage::End(terminal));
        } else {
            state.subscribers.push(tx);
            state.had_subscribers = true;
        }

        Subscription {
            backlog: backlog.into_iter(),
            rx,
            finished: false,
        }
    }

    /// Terminal status, if the broadcast has ended.
    pub fn terminal(&self) -> Option<Terminal> {
        self.terminal_rx.borrow().clone()
    }

    /// Wait for the broadcast to end.
    pub async fn wait_terminal(&self) -> Terminal {
        let mut rx = self.terminal_rx.clone();
        loop {
            if let Some(terminal) = rx.borrow_and_update().clone() {
                return terminal;
            }
            if rx.changed().await.is_err() {
                return Terminal::Completed;
            }
        }
    }

}

/// One subscriber's view of the broadcast: backlog replay, then live frames.
/// Yields wire-ready frames; ends after the terminal frame. A subscription
/// cut off for lagging ends with an inline error frame.
pub struct Subscription {
    backlog: std::vec::IntoIter<SseFrame>,
    rx: mpsc::Receiver<SubMessage>,
    finished: bool,
}

impl Stream for Subscription {
    type Item = SseFrame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        if let Some(frame) = self.backlog.next() {
            return Poll::Ready(Some(frame));
        }
        match self.rx.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(SubMessage::Frame(frame))) => Poll::Ready(Some(frame)),
            Poll::Ready(Some(SubMessage::End(_))) => {
                self.finished = true;
                Poll::Ready(None)
            }
            Poll::Ready(None) => {
                // Channel dropped without a terminal: this subscriber lagged
                // past the backlog limit.
                self.finished = true;
                Poll::Ready(Some(SseFrame::error(
                    "api_error",
                    "subscriber fell behind the stream and was disconnected",
                )))
            }
        }
    }
}
