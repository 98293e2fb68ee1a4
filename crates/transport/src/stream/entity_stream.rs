use std::collections::VecDeque;
use std::fmt;
use std::future::poll_fn;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

use bytes::Bytes;
use futures::Stream;
use tracing::{trace, warn};

use super::StreamError;

/// Lifecycle of an [`EntityStream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    /// no reader attached yet
    Created,
    /// reader attached but no demand granted yet
    ReaderAttached,
    /// reader has granted demand at least once
    Active,
    /// reader observed normal completion
    Done,
    /// the stream terminated abnormally (writer error, contract violation or cancellation)
    Error,
}

/// Counters describing the flow of a single stream.
///
/// `written <= granted` holds at every point in time, and `delivered <= written`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// cumulative demand granted by the reader, in chunks
    pub granted: u64,
    /// cumulative chunks accepted from the writer
    pub written: u64,
    /// cumulative chunks handed to the reader
    pub delivered: u64,
    /// cumulative payload bytes accepted from the writer
    pub bytes_written: u64,
}

/// Passive listener attached to a stream before its reader.
///
/// Observers cannot influence flow control. A panicking observer is logged and ignored.
pub trait Observer: Send {
    fn on_data(&mut self, _chunk: &Bytes) {}

    fn on_done(&mut self) {}

    fn on_error(&mut self, _error: &StreamError) {}
}

#[derive(Debug, Clone)]
enum Terminal {
    Done,
    Error(StreamError),
}

struct State {
    phase: StreamPhase,
    writer_attached: bool,
    reader_attached: bool,
    cancelled: bool,
    demand: u64,
    queue: VecDeque<Bytes>,
    // chunks known up front, released into `queue` as demand arrives
    prefilled: VecDeque<Bytes>,
    terminal: Option<Terminal>,
    terminal_delivered: bool,
    observers: Vec<Box<dyn Observer>>,
    reader_waker: Option<Waker>,
    writer_waker: Option<Waker>,
    stats: StreamStats,
}

impl State {
    fn new() -> Self {
        Self {
            phase: StreamPhase::Created,
            writer_attached: false,
            reader_attached: false,
            cancelled: false,
            demand: 0,
            queue: VecDeque::new(),
            prefilled: VecDeque::new(),
            terminal: None,
            terminal_delivered: false,
            observers: Vec::new(),
            reader_waker: None,
            writer_waker: None,
            stats: StreamStats::default(),
        }
    }

    fn wake_reader(&mut self) {
        if let Some(waker) = self.reader_waker.take() {
            waker.wake();
        }
    }

    fn wake_writer(&mut self) {
        if let Some(waker) = self.writer_waker.take() {
            waker.wake();
        }
    }

    fn accept(&mut self, chunk: Bytes) {
        self.demand -= 1;
        self.stats.written += 1;
        self.stats.bytes_written += chunk.len() as u64;
        for observer in &mut self.observers {
            if catch_unwind(AssertUnwindSafe(|| observer.on_data(&chunk))).is_err() {
                warn!("entity stream observer panicked in on_data");
            }
        }
        self.queue.push_back(chunk);
    }

    fn release_prefilled(&mut self) {
        while self.demand > 0 {
            match self.prefilled.pop_front() {
                Some(chunk) => self.accept(chunk),
                None => break,
            }
        }
    }

    fn complete(&mut self) {
        self.terminal = Some(Terminal::Done);
        for observer in &mut self.observers {
            if catch_unwind(AssertUnwindSafe(|| observer.on_done())).is_err() {
                warn!("entity stream observer panicked in on_done");
            }
        }
        self.wake_reader();
    }

    fn fail(&mut self, error: StreamError) {
        trace!(cause = %error, "entity stream failed");
        self.queue.clear();
        self.prefilled.clear();
        self.phase = StreamPhase::Error;
        for observer in &mut self.observers {
            if catch_unwind(AssertUnwindSafe(|| observer.on_error(&error))).is_err() {
                warn!("entity stream observer panicked in on_error");
            }
        }
        self.terminal = Some(Terminal::Error(error));
        self.wake_reader();
        self.wake_writer();
    }

    fn writer_blocked_reason(&self) -> Option<StreamError> {
        if self.cancelled {
            return Some(StreamError::Cancelled);
        }
        match &self.terminal {
            Some(Terminal::Error(e)) => Some(e.clone()),
            Some(Terminal::Done) => Some(StreamError::illegal_state("writer already completed the stream")),
            None => None,
        }
    }
}

struct Shared {
    state: Mutex<State>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A single-use, single-producer single-consumer byte chunk pipe with pull-based flow control.
///
/// The stream itself only hands out capabilities: [`EntityStream::set_writer`] and
/// [`EntityStream::set_reader`] may each be called once. Dropping the `EntityStream` before a
/// reader was attached cancels the stream, so a writer never waits for demand from a body that
/// nobody is going to read.
pub struct EntityStream {
    shared: Arc<Shared>,
}

impl EntityStream {
    pub fn new() -> Self {
        Self { shared: Arc::new(Shared { state: Mutex::new(State::new()) }) }
    }

    /// Creates a stream whose writer side is already complete: `chunks` are released to the reader
    /// as it grants demand, followed by the done signal.
    pub(crate) fn prefilled<I: IntoIterator<Item = Bytes>>(chunks: I) -> Self {
        let stream = Self::new();
        {
            let mut state = stream.shared.lock();
            state.writer_attached = true;
            state.prefilled = chunks.into_iter().filter(|chunk| !chunk.is_empty()).collect();
            state.terminal = Some(Terminal::Done);
        }
        stream
    }

    /// Creates a stream together with its writer, for bodies fed by a connection.
    pub(crate) fn with_writer() -> (Self, WriteHandle) {
        let stream = Self::new();
        stream.shared.lock().writer_attached = true;
        let writer = WriteHandle { shared: Arc::clone(&stream.shared), completed: false };
        (stream, writer)
    }

    /// Attaches the writer. Fails with [`StreamError::IllegalState`] when a writer is already set.
    pub fn set_writer(&self) -> Result<WriteHandle, StreamError> {
        let mut state = self.shared.lock();
        if state.writer_attached {
            return Err(StreamError::illegal_state("writer already set"));
        }
        state.writer_attached = true;
        Ok(WriteHandle { shared: Arc::clone(&self.shared), completed: false })
    }

    /// Attaches the reader. Fails with [`StreamError::IllegalState`] when a reader is already set.
    pub fn set_reader(&self) -> Result<ReadHandle, StreamError> {
        let mut state = self.shared.lock();
        if state.reader_attached {
            return Err(StreamError::illegal_state("reader already set"));
        }
        state.reader_attached = true;
        if state.phase == StreamPhase::Created {
            state.phase = StreamPhase::ReaderAttached;
        }
        Ok(ReadHandle { shared: Arc::clone(&self.shared), finished: false })
    }

    /// Adds an observer. Observers must be added before the reader is attached.
    pub fn add_observer<O: Observer + 'static>(&self, observer: O) -> Result<(), StreamError> {
        let mut state = self.shared.lock();
        if state.reader_attached {
            return Err(StreamError::illegal_state("observers must be added before the reader"));
        }
        state.observers.push(Box::new(observer));
        Ok(())
    }

    pub fn phase(&self) -> StreamPhase {
        self.shared.lock().phase
    }

    pub fn stats(&self) -> StreamStats {
        self.shared.lock().stats
    }

    /// Total body length, known only for streams whose writer completed before any reader showed
    /// up (buffered bodies).
    pub fn exact_len(&self) -> Option<u64> {
        let state = self.shared.lock();
        match state.terminal {
            Some(Terminal::Done) if !state.reader_attached => {
                Some(state.queue.iter().chain(state.prefilled.iter()).map(|chunk| chunk.len() as u64).sum())
            }
            _ => None,
        }
    }
}

impl Default for EntityStream {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EntityStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("EntityStream").field("phase", &state.phase).field("stats", &state.stats).finish()
    }
}

impl Drop for EntityStream {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        if !state.reader_attached && state.terminal.is_none() {
            state.cancelled = true;
            state.fail(StreamError::Cancelled);
        }
    }
}

/// Reader capability of an [`EntityStream`].
///
/// [`ReadHandle::read`] only yields chunks the reader has asked for through
/// [`ReadHandle::request`]. The [`Stream`] implementation is a convenience that keeps exactly one
/// chunk of demand outstanding. Dropping the handle before the stream finished cancels it.
pub struct ReadHandle {
    shared: Arc<Shared>,
    finished: bool,
}

impl ReadHandle {
    /// Grants `n` more chunks of demand.
    pub fn request(&self, n: u64) -> Result<(), StreamError> {
        if n == 0 {
            return Err(StreamError::illegal_state("demand must be positive"));
        }

        let mut state = self.shared.lock();
        if state.terminal.is_some() || state.cancelled {
            // late demand on a finished stream is harmless
            return Ok(());
        }
        if matches!(state.phase, StreamPhase::Created | StreamPhase::ReaderAttached) {
            state.phase = StreamPhase::Active;
        }
        state.demand = state.demand.saturating_add(n);
        state.stats.granted = state.stats.granted.saturating_add(n);
        state.release_prefilled();
        if !state.queue.is_empty() {
            state.wake_reader();
        }
        state.wake_writer();
        Ok(())
    }

    /// Outstanding demand that the writer has not used yet.
    pub fn outstanding(&self) -> u64 {
        self.shared.lock().demand
    }

    /// Polls for the next delivered chunk.
    ///
    /// Yields `None` once the writer completed and every chunk has been delivered. An error is
    /// yielded once, after which the handle yields `None`.
    pub fn poll_read(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Bytes, StreamError>>> {
        let mut state = self.shared.lock();
        if let Some(chunk) = state.queue.pop_front() {
            state.stats.delivered += 1;
            return Poll::Ready(Some(Ok(chunk)));
        }

        if state.prefilled.is_empty() {
            match state.terminal.clone() {
                Some(Terminal::Done) => {
                    state.phase = StreamPhase::Done;
                    state.terminal_delivered = true;
                    self.finished = true;
                    return Poll::Ready(None);
                }
                Some(Terminal::Error(e)) => {
                    self.finished = true;
                    if state.terminal_delivered {
                        return Poll::Ready(None);
                    }
                    state.terminal_delivered = true;
                    return Poll::Ready(Some(Err(e)));
                }
                None => {}
            }
        }

        match &state.reader_waker {
            Some(waker) if waker.will_wake(cx.waker()) => {}
            _ => state.reader_waker = Some(cx.waker().clone()),
        }
        Poll::Pending
    }

    /// Waits for the next delivered chunk, see [`ReadHandle::poll_read`].
    pub async fn read(&mut self) -> Option<Result<Bytes, StreamError>> {
        poll_fn(|cx| self.poll_read(cx)).await
    }

    /// Abandons the stream. Buffered chunks are discarded and the writer observes
    /// [`StreamError::Cancelled`] on its next interaction.
    pub fn cancel(&mut self) {
        self.finished = true;
        let mut state = self.shared.lock();
        if state.cancelled {
            return;
        }
        state.cancelled = true;
        state.terminal_delivered = true;
        if state.terminal.is_none() || !state.queue.is_empty() || !state.prefilled.is_empty() {
            state.fail(StreamError::Cancelled);
        } else {
            state.wake_writer();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl fmt::Debug for ReadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadHandle").field("finished", &self.finished).finish_non_exhaustive()
    }
}

impl Stream for ReadHandle {
    type Item = Result<Bytes, StreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        {
            let mut state = this.shared.lock();
            if state.demand == 0 && state.queue.is_empty() && state.terminal.is_none() && !state.cancelled {
                state.demand = 1;
                state.stats.granted += 1;
                if matches!(state.phase, StreamPhase::Created | StreamPhase::ReaderAttached) {
                    state.phase = StreamPhase::Active;
                }
                state.release_prefilled();
                state.wake_writer();
            }
        }
        this.poll_read(cx)
    }
}

impl Drop for ReadHandle {
    fn drop(&mut self) {
        if !self.finished {
            self.cancel();
        }
    }
}

/// Writer capability of an [`EntityStream`].
///
/// Dropping the handle without calling [`WriteHandle::done`] or [`WriteHandle::error`] fails the
/// stream with [`StreamError::WriterDropped`].
pub struct WriteHandle {
    shared: Arc<Shared>,
    completed: bool,
}

impl WriteHandle {
    /// Outstanding demand, i.e. how many chunks may be written right now.
    pub fn remaining(&self) -> u64 {
        self.shared.lock().demand
    }

    pub fn poll_write_possible(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), StreamError>> {
        let mut state = self.shared.lock();
        if let Some(e) = state.writer_blocked_reason() {
            return Poll::Ready(Err(e));
        }
        if state.demand > 0 {
            return Poll::Ready(Ok(()));
        }
        match &state.writer_waker {
            Some(waker) if waker.will_wake(cx.waker()) => {}
            _ => state.writer_waker = Some(cx.waker().clone()),
        }
        Poll::Pending
    }

    /// Waits until the reader has granted demand, or fails if the stream was cancelled.
    pub async fn write_possible(&mut self) -> Result<(), StreamError> {
        poll_fn(|cx| self.poll_write_possible(cx)).await
    }

    /// Pushes one chunk, consuming one unit of demand.
    ///
    /// Writing without demand is a contract violation: the stream terminates with
    /// [`StreamError::WriteWithoutDemand`] which is returned here and delivered to the reader.
    pub fn write(&mut self, chunk: Bytes) -> Result<(), StreamError> {
        let mut state = self.shared.lock();
        if let Some(e) = state.writer_blocked_reason() {
            return Err(e);
        }
        if state.demand == 0 {
            self.completed = true;
            state.fail(StreamError::WriteWithoutDemand);
            return Err(StreamError::WriteWithoutDemand);
        }
        state.accept(chunk);
        state.wake_reader();
        Ok(())
    }

    /// Waits for demand and writes `chunk`.
    pub async fn send(&mut self, chunk: Bytes) -> Result<(), StreamError> {
        self.write_possible().await?;
        self.write(chunk)
    }

    /// Signals normal completion. The reader sees it after every written chunk was delivered.
    pub fn done(&mut self) -> Result<(), StreamError> {
        let mut state = self.shared.lock();
        if let Some(e) = state.writer_blocked_reason() {
            return Err(e);
        }
        self.completed = true;
        state.complete();
        Ok(())
    }

    /// Signals abnormal completion, discarding chunks the reader has not consumed yet.
    pub fn error(&mut self, error: StreamError) {
        let mut state = self.shared.lock();
        self.completed = true;
        if state.terminal.is_some() || state.cancelled {
            return;
        }
        state.fail(error);
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.lock().cancelled
    }

    /// Polls for the reader cancelling the stream.
    pub fn poll_cancelled(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        let mut state = self.shared.lock();
        if state.cancelled {
            return Poll::Ready(());
        }
        match &state.writer_waker {
            Some(waker) if waker.will_wake(cx.waker()) => {}
            _ => state.writer_waker = Some(cx.waker().clone()),
        }
        Poll::Pending
    }

    /// Resolves once the reader cancelled the stream, so a writer blocked on its own source can
    /// stop early.
    pub async fn cancelled(&mut self) {
        poll_fn(|cx| self.poll_cancelled(cx)).await;
    }
}

impl fmt::Debug for WriteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteHandle").field("completed", &self.completed).finish_non_exhaustive()
    }
}

impl Drop for WriteHandle {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        let mut state = self.shared.lock();
        if state.terminal.is_none() && !state.cancelled {
            state.fail(StreamError::WriterDropped);
        }
    }
}
