//! Pump state shared by the stream and frame transports.
//!
//! Both transports run a reader task and a writer task over the same
//! [`TransportState`]. Either task can begin shutdown. The reader ends the
//! incoming stream as soon as it stops; the writer finishes shutdown after
//! draining what was already queued, bounded by [`DRAIN_TIMEOUT`]. A guard
//! in each task makes the cleanup run even when the task is aborted.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use fastacp_core::config::DEFAULT_MAX_MESSAGE_SIZE;
use fastacp_core::logging::targets;
use fastacp_protocol::JsonRpcMessage;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{CloseObserver, CloseReason, ErrorObserver, TransportError};

/// How long the writer keeps flushing once shutdown has begun.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

type SharedErrorObserver = Arc<dyn Fn(&TransportError) + Send + Sync>;
type SharedCloseObserver = Arc<dyn Fn(&CloseReason) + Send + Sync>;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Channel ends handed to the pump tasks on start.
pub(crate) struct Pumps {
    pub(crate) incoming: mpsc::UnboundedSender<JsonRpcMessage>,
    pub(crate) outbound: mpsc::UnboundedReceiver<JsonRpcMessage>,
}

pub(crate) struct TransportState {
    outbound_tx: mpsc::UnboundedSender<JsonRpcMessage>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<JsonRpcMessage>>>,
    incoming_tx: Mutex<Option<mpsc::UnboundedSender<JsonRpcMessage>>>,
    incoming_rx: Mutex<Option<mpsc::UnboundedReceiver<JsonRpcMessage>>>,
    error_observer: Mutex<Option<SharedErrorObserver>>,
    close_observer: Mutex<Option<SharedCloseObserver>>,
    close_reason: Mutex<Option<CloseReason>>,
    started: AtomicBool,
    closing: AtomicBool,
    finished: AtomicBool,
    max_message_size: AtomicUsize,
    shutdown: CancellationToken,
    label: &'static str,
}

impl TransportState {
    pub(crate) fn new(label: &'static str) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            incoming_tx: Mutex::new(Some(incoming_tx)),
            incoming_rx: Mutex::new(Some(incoming_rx)),
            error_observer: Mutex::new(None),
            close_observer: Mutex::new(None),
            close_reason: Mutex::new(None),
            started: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            max_message_size: AtomicUsize::new(DEFAULT_MAX_MESSAGE_SIZE),
            shutdown: CancellationToken::new(),
            label,
        })
    }

    /// Marks the transport started and hands out the pump channel ends.
    pub(crate) fn begin(&self) -> Result<Pumps, TransportError> {
        if self.closing.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(TransportError::AlreadyStarted);
        }
        let incoming = lock(&self.incoming_tx).clone();
        let outbound = lock(&self.outbound_rx).take();
        match (incoming, outbound) {
            (Some(incoming), Some(outbound)) => Ok(Pumps { incoming, outbound }),
            _ => Err(TransportError::Closed),
        }
    }

    pub(crate) fn max_message_size(&self) -> usize {
        self.max_message_size.load(Ordering::Acquire)
    }

    pub(crate) fn set_max_message_size(&self, size: usize) {
        if self.is_started() {
            log::debug!(target: targets::TRANSPORT, "{} transport already started; size limit unchanged", self.label);
            return;
        }
        self.max_message_size.store(size, Ordering::Release);
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub(crate) fn send(&self, message: JsonRpcMessage) -> Result<(), TransportError> {
        if self.closing.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.outbound_tx
            .send(message)
            .map_err(|_| TransportError::Closed)
    }

    pub(crate) fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<JsonRpcMessage>> {
        lock(&self.incoming_rx).take()
    }

    /// Registers an error observer, chained after any existing one.
    pub(crate) fn add_error_observer(&self, observer: ErrorObserver) {
        let mut slot = lock(&self.error_observer);
        let previous = slot.take();
        *slot = Some(Arc::new(move |err: &TransportError| {
            if let Some(previous) = &previous {
                previous(err);
            }
            observer(err);
        }));
    }

    /// Registers a close observer, chained after any existing one.
    pub(crate) fn add_close_observer(&self, observer: CloseObserver) {
        let mut slot = lock(&self.close_observer);
        let previous = slot.take();
        *slot = Some(Arc::new(move |reason: &CloseReason| {
            if let Some(previous) = &previous {
                previous(reason);
            }
            observer(reason);
        }));
    }

    pub(crate) fn report_error(&self, err: &TransportError) {
        log::warn!(target: targets::TRANSPORT, "{} transport error: {}", self.label, err);
        let observer = lock(&self.error_observer).clone();
        if let Some(observer) = observer {
            observer(err);
        }
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Records why the transport is closing (first caller wins) and wakes
    /// both pump tasks.
    pub(crate) fn begin_close(&self, reason: CloseReason) {
        {
            let mut slot = lock(&self.close_reason);
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.closing.store(true, Ordering::Release);
        self.shutdown.cancel();
    }

    /// Drops the stored incoming sender so the stream ends once the reader's
    /// own sender is gone too.
    pub(crate) fn end_incoming(&self) {
        lock(&self.incoming_tx).take();
    }

    pub(crate) fn close_reason(&self) -> Option<CloseReason> {
        lock(&self.close_reason).clone()
    }

    /// Completes shutdown: ends the incoming stream and fires the close
    /// observers. Runs at most once.
    pub(crate) fn finish(&self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        self.begin_close(CloseReason::Local);
        self.end_incoming();

        let reason = self.close_reason().unwrap_or(CloseReason::Local);
        match &reason {
            CloseReason::Failed(cause) => {
                log::error!(target: targets::TRANSPORT, "{} transport failed: {}", self.label, cause);
            }
            _ => {
                log::info!(target: targets::TRANSPORT, "{} transport closed ({})", self.label, reason);
            }
        }

        let observer = lock(&self.close_observer).clone();
        if let Some(observer) = observer {
            observer(&reason);
        }
    }
}

/// Begins shutdown and ends the incoming stream when the reader task exits
/// for any reason.
pub(crate) struct ReaderGuard(pub(crate) Arc<TransportState>);

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        self.0.begin_close(CloseReason::Local);
        self.0.end_incoming();
    }
}

/// Bounds the writer's I/O once shutdown has begun.
///
/// Until then a write may take as long as the peer needs. After it, all
/// remaining writes share one deadline, [`DRAIN_TIMEOUT`] after the writer
/// first noticed the shutdown.
pub(crate) struct DrainClock<'a> {
    state: &'a TransportState,
    deadline: Option<Instant>,
}

impl<'a> DrainClock<'a> {
    pub(crate) fn new(state: &'a TransportState) -> Self {
        Self {
            state,
            deadline: None,
        }
    }

    /// Starts the drain deadline if it is not running yet.
    pub(crate) fn start_draining(&mut self) -> Instant {
        *self
            .deadline
            .get_or_insert_with(|| Instant::now() + DRAIN_TIMEOUT)
    }

    /// Runs `io` to completion, or returns `None` once the drain deadline
    /// has passed.
    pub(crate) async fn run<F: Future>(&mut self, io: F) -> Option<F::Output> {
        tokio::pin!(io);
        let deadline = match self.deadline {
            Some(deadline) => deadline,
            None => {
                tokio::select! {
                    biased;
                    output = &mut io => return Some(output),
                    () = self.state.shutdown.cancelled() => {}
                }
                self.start_draining()
            }
        };
        tokio::time::timeout_at(deadline, io).await.ok()
    }
}

/// Finishes shutdown when the writer task exits for any reason.
pub(crate) struct WriterGuard(pub(crate) Arc<TransportState>);

impl Drop for WriterGuard {
    fn drop(&mut self) {
        self.0.finish();
    }
}
