//! Fakes shared by unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use parking_lot::Mutex;
use tether_core::{
    DeadLetter, DeadLetterSink, Identity, Message, PresenceEvent, PresenceSink, SinkError,
    TransportError,
};
use tokio::sync::OwnedMutexGuard;

use crate::admission::Admission;
use crate::config::DeliveryConfig;
use crate::connection::FrameWriter;
use crate::hub::DeliveryHub;
use crate::session::Inbound;

pub(crate) fn config() -> DeliveryConfig {
    DeliveryConfig {
        idle_timeout: Duration::from_secs(30),
        retry_delay: Duration::from_secs(2),
        max_attempts: 3,
        write_timeout: Duration::from_secs(5),
    }
}

pub(crate) fn admission(identity: &str) -> Admission {
    Admission {
        identity: Identity::parse(identity).unwrap(),
        version: "1.0.1".into(),
        platform: "iOS".into(),
    }
}

struct RecordingWriter {
    frames: mpsc::UnboundedSender<String>,
    failing: Arc<AtomicBool>,
    closes: Arc<AtomicUsize>,
    gate: Arc<tokio::sync::Mutex<()>>,
}

#[async_trait]
impl FrameWriter for RecordingWriter {
    async fn write_text(&mut self, text: String) -> Result<(), TransportError> {
        let _open = self.gate.lock().await;
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::Write("broken pipe".into()));
        }
        let _ = self.frames.unbounded_send(text);
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Observes what a [`RecordingWriter`] was asked to do.
pub(crate) struct WriterTap {
    frames: mpsc::UnboundedReceiver<String>,
    failing: Arc<AtomicBool>,
    closes: Arc<AtomicUsize>,
    gate: Arc<tokio::sync::Mutex<()>>,
}

impl WriterTap {
    /// Block every write until the returned guard is dropped.
    pub(crate) fn hold(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.gate).try_lock_owned().unwrap()
    }

    pub(crate) fn set_failing(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.close_count() > 0
    }

    pub(crate) fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Drain frames written since the last call.
    pub(crate) fn raw_frames(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(Some(frame)) = self.frames.try_next() {
            out.push(frame);
        }
        out
    }

    /// Drain and decode frames written since the last call.
    pub(crate) fn messages(&mut self) -> Vec<Message> {
        self.raw_frames()
            .iter()
            .map(|f| serde_json::from_str(f).unwrap())
            .collect()
    }
}

pub(crate) fn writer() -> (Box<dyn FrameWriter>, WriterTap) {
    let (tx, rx) = mpsc::unbounded();
    let failing = Arc::new(AtomicBool::new(false));
    let closes = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(tokio::sync::Mutex::new(()));
    let writer = RecordingWriter {
        frames: tx,
        failing: Arc::clone(&failing),
        closes: Arc::clone(&closes),
        gate: Arc::clone(&gate),
    };
    let tap = WriterTap {
        frames: rx,
        failing,
        closes,
        gate,
    };
    (Box::new(writer), tap)
}

/// Feeds frames into a read loop.
pub(crate) struct InboundFeed {
    tx: mpsc::UnboundedSender<Result<Inbound, TransportError>>,
}

impl InboundFeed {
    pub(crate) fn send(&self, frame: Inbound) {
        let _ = self.tx.unbounded_send(Ok(frame));
    }

    pub(crate) fn fail(&self, err: TransportError) {
        let _ = self.tx.unbounded_send(Err(err));
    }
}

pub(crate) fn inbound() -> (
    InboundFeed,
    mpsc::UnboundedReceiver<Result<Inbound, TransportError>>,
) {
    let (tx, rx) = mpsc::unbounded();
    (InboundFeed { tx }, rx)
}

async fn wait_until<T: Clone>(items: &Mutex<Vec<T>>, n: usize) -> Vec<T> {
    for _ in 0..200 {
        if items.lock().len() >= n {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    items.lock().clone()
}

#[derive(Default)]
pub(crate) struct RecordingPresence {
    events: Mutex<Vec<PresenceEvent>>,
}

impl RecordingPresence {
    /// Wait until at least `n` events were recorded.
    pub(crate) async fn wait_for(&self, n: usize) -> Vec<PresenceEvent> {
        wait_until(&self.events, n).await
    }
}

#[async_trait]
impl PresenceSink for RecordingPresence {
    async fn record(&self, event: PresenceEvent) -> Result<(), SinkError> {
        self.events.lock().push(event);
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct RecordingDeadLetters {
    letters: Mutex<Vec<DeadLetter>>,
}

impl RecordingDeadLetters {
    pub(crate) fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().clone()
    }

    pub(crate) async fn wait_for(&self, n: usize) -> Vec<DeadLetter> {
        wait_until(&self.letters, n).await
    }
}

#[async_trait]
impl DeadLetterSink for RecordingDeadLetters {
    async fn dead_letter(&self, letter: DeadLetter) -> Result<(), SinkError> {
        self.letters.lock().push(letter);
        Ok(())
    }
}

/// A hub wired to recording sinks.
pub(crate) struct Harness {
    pub(crate) hub: Arc<DeliveryHub>,
    pub(crate) presence: Arc<RecordingPresence>,
    pub(crate) dead_letters: Arc<RecordingDeadLetters>,
}

impl Harness {
    pub(crate) fn new() -> Self {
        let presence = Arc::new(RecordingPresence::default());
        let dead_letters = Arc::new(RecordingDeadLetters::default());
        let hub = DeliveryHub::with_sinks(config(), presence.clone(), dead_letters.clone());
        Self {
            hub,
            presence,
            dead_letters,
        }
    }
}
