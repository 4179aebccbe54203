use std::{
    collections::VecDeque,
    io::{self, ErrorKind},
    time::Duration,
};

use mio::{Events, Poll, Token};
use tracing::trace;

use crate::MuxConfig;

/// Reserved for the multiplexer's waker; slab keys never reach it.
pub(crate) const WAKE_TOKEN: Token = Token(usize::MAX);

/// What a call to [`Drainer::wait`] observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wake {
    /// At least one endpoint was reported readable.
    Ready,
    /// The waker fired. Endpoints reported by the same poll are queued too.
    Woken,
    /// The timeout elapsed with nothing to report.
    Idle,
}

/// The poller plus everything a drain needs between reads.
///
/// `ready` holds endpoints in the order the poller reported them. An endpoint
/// stays at its position until a read on it would block or hits end of
/// stream; when the poller reports it again it moves to the back.
pub(crate) struct Drainer {
    poll: Poll,
    events: Events,
    ready: VecDeque<Token>,
    buf: Vec<u8>,
    // set after handing out a chunk so the next step picks up readiness that
    // arrived in the meantime before reading again
    stale: bool,
}

impl Drainer {
    pub(crate) fn new(poll: Poll, config: &MuxConfig) -> Self {
        Self {
            poll,
            events: Events::with_capacity(config.events_capacity.max(1)),
            ready: VecDeque::new(),
            buf: vec![0; config.read_buffer_size.max(1)],
            stale: false,
        }
    }

    pub(crate) fn front(&self) -> Option<Token> {
        self.ready.front().copied()
    }

    pub(crate) fn pop_front(&mut self) {
        self.ready.pop_front();
    }

    pub(crate) fn buffer(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    pub(crate) fn mark_stale(&mut self) {
        self.stale = true;
    }

    /// Picks up readiness reported since the last wait, without blocking.
    /// Returns whether that poll consumed a wakeup.
    pub(crate) fn refresh(&mut self) -> io::Result<bool> {
        if !self.stale {
            return Ok(false);
        }
        self.stale = false;
        Ok(self.wait(Some(Duration::ZERO))? == Wake::Woken)
    }

    pub(crate) fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Wake> {
        loop {
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => break,
                // if our poll is interrupted by a signal then retry
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        let mut woken = false;
        let mut reported = 0;
        for event in self.events.iter() {
            let token = event.token();
            if token == WAKE_TOKEN {
                woken = true;
                continue;
            }
            self.ready.retain(|t| *t != token);
            self.ready.push_back(token);
            reported += 1;
        }
        self.events.clear();
        trace!(reported, woken, queued = self.ready.len(), "poll returned");

        Ok(if woken {
            Wake::Woken
        } else if reported > 0 {
            Wake::Ready
        } else {
            Wake::Idle
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::muxer::source::endpoint::Endpoint;
    use crate::muxer::source::transport::TransportKind;
    use mio::{event::Source, Interest, Waker};
    use std::io::Write;

    #[test]
    fn idle_then_ready_in_report_order() {
        let poll = Poll::new().unwrap();
        let registry = poll.registry().try_clone().unwrap();
        let mut drainer = Drainer::new(poll, &MuxConfig::default());

        let (mut a, mut wa) = Endpoint::pair(TransportKind::Stream).unwrap();
        let (mut b, mut wb) = Endpoint::pair(TransportKind::Stream).unwrap();
        a.register(&registry, Token(0), Interest::READABLE).unwrap();
        b.register(&registry, Token(1), Interest::READABLE).unwrap();

        assert_eq!(drainer.wait(Some(Duration::ZERO)).unwrap(), Wake::Idle);

        wa.write_all(b"a").unwrap();
        wb.write_all(b"b").unwrap();
        assert_eq!(
            drainer.wait(Some(Duration::from_secs(5))).unwrap(),
            Wake::Ready
        );
        // both writes happened before the wait; pick up any stragglers
        while drainer.ready.len() < 2 {
            drainer.wait(Some(Duration::from_secs(5))).unwrap();
        }
        assert_eq!(drainer.front(), Some(Token(0)));
        drainer.pop_front();
        assert_eq!(drainer.front(), Some(Token(1)));
    }

    #[test]
    fn waker_alone_reports_woken() {
        let poll = Poll::new().unwrap();
        let waker = Waker::new(poll.registry(), WAKE_TOKEN).unwrap();
        let mut drainer = Drainer::new(poll, &MuxConfig::default());

        waker.wake().unwrap();
        assert_eq!(drainer.wait(None).unwrap(), Wake::Woken);
        assert_eq!(drainer.front(), None);
    }

    #[test]
    fn refresh_reports_a_wakeup_it_consumed() {
        let poll = Poll::new().unwrap();
        let waker = Waker::new(poll.registry(), WAKE_TOKEN).unwrap();
        let mut drainer = Drainer::new(poll, &MuxConfig::default());

        assert!(!drainer.refresh().unwrap());
        drainer.mark_stale();
        waker.wake().unwrap();
        assert!(drainer.refresh().unwrap());
        assert_eq!(drainer.wait(Some(Duration::ZERO)).unwrap(), Wake::Idle);
    }

    #[test]
    fn wakeup_wins_over_ready_endpoints() {
        let poll = Poll::new().unwrap();
        let registry = poll.registry().try_clone().unwrap();
        let waker = Waker::new(poll.registry(), WAKE_TOKEN).unwrap();
        let mut drainer = Drainer::new(poll, &MuxConfig::default());

        let (mut a, mut wa) = Endpoint::pair(TransportKind::Stream).unwrap();
        a.register(&registry, Token(0), Interest::READABLE).unwrap();
        wa.write_all(b"a").unwrap();
        waker.wake().unwrap();

        let mut woken = false;
        while !woken || drainer.front().is_none() {
            woken |= drainer.wait(Some(Duration::from_secs(5))).unwrap() == Wake::Woken;
        }
        assert_eq!(drainer.front(), Some(Token(0)));
    }
}
