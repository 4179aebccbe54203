mod drain;
mod registry;
pub(crate) mod source;

use std::{
    borrow::Cow,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
    thread,
    time::Duration,
};

use mio::{Poll, Registry, Waker};
use tracing::{debug, trace, warn};

use self::drain::{Drainer, Wake, WAKE_TOKEN};
use self::registry::TagRegistry;
use self::source::{endpoint::Endpoint, EventStream, SourceInstruction};
pub use self::source::{endpoint::TagWriter, transport::TransportKind};
use crate::error::{DrainError, Error, Interrupted, Result};
use crate::MuxConfig;

/// One chunk of data and the tag of the endpoint it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record<T> {
    pub tag: T,
    pub data: Vec<u8>,
}

impl<T> Record<T> {
    /// The data as text, with invalid UTF-8 replaced.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }
}

/// A multiplexer merging any number of tagged writers into one record stream.
///
/// Each call to [`Mux::tag`] creates a socket pair and hands back its write
/// side; the multiplexer keeps the read side and drains all of them through a
/// single readiness poller. Records come back in the order data became
/// readable, which for concurrent producers is not necessarily the order
/// they wrote in.
///
/// All methods take `&self`: tags can be registered and the multiplexer closed
/// from other threads while a drain is blocked.
pub struct Mux<T> {
    config: MuxConfig,
    registry: Registry,
    waker: Waker,
    drainer: Mutex<Drainer>,
    tags: Mutex<TagRegistry<T>>,
    closed: AtomicBool,
}

/// The result of one step of a drain.
enum Step<T> {
    Record(Record<T>),
    /// Only the waker fired.
    Woken,
    /// A bounded wait elapsed with nothing ready.
    Idle,
    /// Nothing queued and no endpoints left to wait on.
    Exhausted,
}

impl<T> Mux<T> {
    pub fn transport(&self) -> TransportKind {
        self.config.transport
    }

    pub fn config(&self) -> &MuxConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of live tags.
    pub fn len(&self) -> usize {
        self.lock_tags().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_tags().is_empty()
    }

    /// Closes every endpoint and wakes any blocked drain, which then returns
    /// [`Error::Closed`]. Closing an already closed multiplexer does nothing.
    pub fn close(&self) -> Result<()> {
        let mut tags = self.lock_tags();
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let count = tags.clear(&self.registry);
        drop(tags);
        debug!(endpoints = count, "closed multiplexer");
        self.waker.wake()?;
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        Ok(())
    }

    // The guarded state stays consistent across a panic, so a poisoned lock
    // is still usable.
    fn lock_tags(&self) -> MutexGuard<'_, TagRegistry<T>> {
        self.tags.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_drainer(&self) -> MutexGuard<'_, Drainer> {
        self.drainer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone + PartialEq> Mux<T> {
    /// A multiplexer over stream sockets with the default configuration.
    pub fn new() -> Result<Self> {
        Self::with_config(MuxConfig::default())
    }

    pub fn with_transport(transport: TransportKind) -> Result<Self> {
        Self::with_config(MuxConfig::default().with_transport(transport))
    }

    /// Creates the poller and checks that the host supports the configured
    /// transport. Every failure here is an [`Error::Setup`].
    pub fn with_config(config: MuxConfig) -> Result<Self> {
        let transport = config.transport;
        let setup = move |source| Error::Setup { transport, source };

        let poll = Poll::new().map_err(setup)?;
        let registry = poll.registry().try_clone().map_err(setup)?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN).map_err(setup)?;
        transport.probe().map_err(setup)?;
        debug!(%transport, "created multiplexer");

        Ok(Self {
            drainer: Mutex::new(Drainer::new(poll, &config)),
            config,
            registry,
            waker,
            tags: Mutex::new(TagRegistry::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Registers a new endpoint under `tag` and returns its write side.
    ///
    /// A tag can only be registered once while its endpoint is live; a second
    /// registration fails with [`Error::DuplicateTag`]. Once every write side
    /// of a stream or packet endpoint is closed and its data drained, the tag
    /// is released and can be registered again.
    pub fn tag(&self, tag: T) -> Result<TagWriter> {
        let mut tags = self.lock_tags();
        // checked under the lock so a concurrent close cannot miss this entry
        self.ensure_open()?;
        if tags.contains(&tag) {
            return Err(Error::DuplicateTag);
        }
        let (endpoint, writer) = Endpoint::pair(self.config.transport)?;
        let token = tags.insert(tag, endpoint, &self.registry)?;
        debug!(token = token.0, transport = %self.config.transport, "registered tag");
        Ok(writer)
    }

    /// Blocks until some endpoint has data and returns one chunk of it.
    ///
    /// Fails right away with [`Error::NoConnections`] when no tag is
    /// registered, and with [`Error::Closed`] if the multiplexer is or
    /// becomes closed. For message-preserving transports a chunk is exactly
    /// one message.
    pub fn read(&self) -> Result<Record<T>> {
        self.ensure_open()?;
        let mut drainer = self.lock_drainer();
        loop {
            match self.step(&mut drainer, None)? {
                Step::Record(record) => return Ok(record),
                Step::Exhausted => return Err(Error::NoConnections),
                Step::Woken | Step::Idle => {}
            }
        }
    }

    /// Runs `work` on another thread while draining every endpoint on this
    /// one, and returns the collected records.
    ///
    /// Draining continues after `work` returns until nothing is left to read:
    /// either every endpoint has reached end of stream, or
    /// `tail_rechecks + 1` consecutive polls of `tail_grace` found nothing
    /// ready. Producers that may still be flushing when `work` returns should
    /// close their writers; end of stream is the only signal that does not
    /// depend on timing.
    ///
    /// Consecutive stream chunks with the same tag are merged into one
    /// record. On failure the records collected so far are kept in
    /// [`Interrupted::records`]; an error from `work` comes back unchanged as
    /// [`DrainError::Work`].
    pub fn read_while<F, E>(&self, work: F) -> std::result::Result<Vec<Record<T>>, Interrupted<T, E>>
    where
        F: FnOnce() -> std::result::Result<(), E> + Send,
        E: Send,
    {
        let merge = !self.config.transport.preserves_boundaries();
        let mut records: Vec<Record<T>> = Vec::new();
        let result = self.read_while_with(work, |record| {
            if merge {
                if let Some(last) = records.last_mut() {
                    if last.tag == record.tag {
                        last.data.extend_from_slice(&record.data);
                        return;
                    }
                }
            }
            records.push(record);
        });
        match result {
            Ok(()) => Ok(records),
            Err(error) => Err(Interrupted { records, error }),
        }
    }

    /// Like [`Mux::read_while`], but hands each chunk to `sink` as soon as it
    /// is read instead of collecting them. Chunks are never merged.
    pub fn read_while_with<F, E, S>(&self, work: F, mut sink: S) -> std::result::Result<(), DrainError<E>>
    where
        F: FnOnce() -> std::result::Result<(), E> + Send,
        E: Send,
        S: FnMut(Record<T>),
    {
        self.ensure_open()?;
        let mut drainer = self.lock_drainer();
        let finished = AtomicBool::new(false);
        let waker = &self.waker;

        let (drained, outcome) = thread::scope(|scope| {
            let worker = thread::Builder::new()
                .name("iomux-work".into())
                .spawn_scoped(scope, || {
                    let outcome = work();
                    finished.store(true, Ordering::Release);
                    if let Err(e) = waker.wake() {
                        warn!("failed to wake drainer after work finished: {e}");
                    }
                    outcome
                })
                .map_err(Error::Io)?;

            let drained = self.drain_until(&mut drainer, &finished, &mut sink);
            let outcome = match worker.join() {
                Ok(outcome) => outcome,
                Err(panic) => std::panic::resume_unwind(panic),
            };
            Ok::<_, Error>((drained, outcome))
        })?;

        drained?;
        outcome.map_err(DrainError::Work)
    }

    fn drain_until(
        &self,
        drainer: &mut Drainer,
        finished: &AtomicBool,
        sink: &mut impl FnMut(Record<T>),
    ) -> Result<()> {
        let mut quiet = 0;
        loop {
            let tail = finished.load(Ordering::Acquire);
            let timeout = tail.then_some(self.config.tail_grace);
            match self.step(drainer, timeout)? {
                Step::Record(record) => {
                    quiet = 0;
                    sink(record);
                }
                Step::Exhausted if tail => return Ok(()),
                Step::Exhausted => {
                    // nothing to read until new tags appear or the work ends;
                    // either way the loop goes round and rechecks `finished`
                    drainer.wait(None)?;
                }
                Step::Idle if tail => {
                    quiet += 1;
                    if quiet > self.config.tail_rechecks {
                        return Ok(());
                    }
                }
                Step::Idle | Step::Woken => {}
            }
        }
    }

    fn step(&self, drainer: &mut Drainer, timeout: Option<Duration>) -> Result<Step<T>> {
        loop {
            self.ensure_open()?;
            // every consumed wakeup goes back to the caller, which rechecks
            // its flags before waiting again
            if drainer.refresh()? {
                return Ok(Step::Woken);
            }

            if let Some(token) = drainer.front() {
                let mut tags = self.lock_tags();
                let Some(entry) = tags.get(token) else {
                    drainer.pop_front();
                    continue;
                };
                match entry.endpoint.next(drainer.buffer())? {
                    EventStream::Emit(n) => {
                        let record = Record {
                            tag: entry.tag.clone(),
                            data: drainer.buffer()[..n].to_vec(),
                        };
                        drop(tags);
                        trace!(token = token.0, bytes = n, "read chunk");
                        drainer.mark_stale();
                        return Ok(Step::Record(record));
                    }
                    EventStream::Drained(SourceInstruction::Reregister) => drainer.pop_front(),
                    EventStream::Drained(SourceInstruction::Deregister) => {
                        drainer.pop_front();
                        tags.remove(token, &self.registry)?;
                        debug!(token = token.0, "endpoint reached end of stream");
                    }
                }
                continue;
            }

            if self.lock_tags().is_empty() {
                return Ok(Step::Exhausted);
            }
            match drainer.wait(timeout)? {
                Wake::Ready => continue,
                Wake::Woken => return Ok(Step::Woken),
                Wake::Idle => return Ok(Step::Idle),
            }
        }
    }
}

impl<T> Drop for Mux<T> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("failed to close multiplexer: {e}");
        }
    }
}
