//! Single-threaded epoll loop with a deferred-closure queue.
//!
//! The thread that drives [`EventLoop::poll_once`] is the loop thread: all
//! connection state is mutated from it and nowhere else. Public entry
//! points on other objects defer closures here instead of touching state
//! directly, which is also what makes callback re-entry safe: a callback
//! that submits a new operation only enqueues another closure.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::fd::{BorrowedFd, RawFd};
use std::rc::Rc;
use std::thread::ThreadId;
use std::time::Duration;

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};

/// Receiver of file-descriptor readiness events.
pub trait EventHandler {
    fn handle_events(&self, events: EpollFlags);
}

pub struct EventLoop {
    epoll: Epoll,
    handlers: RefCell<HashMap<RawFd, Rc<dyn EventHandler>>>,
    deferred: RefCell<VecDeque<Box<dyn FnOnce()>>>,
    /// The thread that first drove `poll_once`; latched for `in_loop`.
    loop_thread: Cell<Option<ThreadId>>,
}

impl EventLoop {
    pub fn new() -> io::Result<Rc<Self>> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        Ok(Rc::new(Self {
            epoll,
            handlers: RefCell::new(HashMap::new()),
            deferred: RefCell::new(VecDeque::new()),
            loop_thread: Cell::new(None),
        }))
    }

    /// Whether the caller is the loop thread. Before the first
    /// `poll_once` no thread owns the loop and anything goes.
    pub fn in_loop(&self) -> bool {
        match self.loop_thread.get() {
            Some(id) => id == std::thread::current().id(),
            None => true,
        }
    }

    /// Register `fd` for the given readiness mask, replacing any previous
    /// registration of the same descriptor.
    pub fn register_descriptor(
        &self,
        fd: RawFd,
        events: EpollFlags,
        handler: Rc<dyn EventHandler>,
    ) -> io::Result<()> {
        let mut event = EpollEvent::new(events, fd as u64);
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        match self.epoll.add(borrowed, event) {
            Ok(()) => {}
            Err(nix::errno::Errno::EEXIST) => self.epoll.modify(borrowed, &mut event)?,
            Err(e) => return Err(e.into()),
        }
        self.handlers.borrow_mut().insert(fd, handler);
        Ok(())
    }

    pub fn unregister_descriptor(&self, fd: RawFd) -> io::Result<()> {
        self.handlers.borrow_mut().remove(&fd);
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll.delete(borrowed)?;
        Ok(())
    }

    /// Queue a closure for execution on the loop thread. The closure runs
    /// during a later `poll_once`, never inline.
    pub fn defer(&self, f: Box<dyn FnOnce()>) {
        self.deferred.borrow_mut().push_back(f);
    }

    fn run_deferred(&self) {
        loop {
            // Take the whole batch at once so closures enqueued while
            // running land in a fresh queue instead of extending this one.
            let batch = std::mem::take(&mut *self.deferred.borrow_mut());
            if batch.is_empty() {
                return;
            }
            for f in batch {
                f();
            }
        }
    }

    /// Run queued closures, then dispatch descriptor readiness.
    pub fn poll_once(&self, timeout: Duration) -> io::Result<()> {
        if self.loop_thread.get().is_none() {
            self.loop_thread.set(Some(std::thread::current().id()));
        }
        debug_assert!(self.in_loop());
        self.run_deferred();

        let mut events = [EpollEvent::empty(); 64];
        let timeout = EpollTimeout::try_from(timeout).unwrap_or(EpollTimeout::NONE);
        let n = match self.epoll.wait(&mut events, timeout) {
            Ok(n) => n,
            Err(nix::errno::Errno::EINTR) => 0,
            Err(e) => return Err(e.into()),
        };
        for event in &events[..n] {
            let fd = event.data() as RawFd;
            // A handler that ran earlier in this batch may have
            // unregistered this descriptor; stale readiness is dropped.
            let handler = self.handlers.borrow().get(&fd).cloned();
            if let Some(handler) = handler {
                handler.handle_events(event.events());
            }
        }

        self.run_deferred();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;

    #[test]
    fn test_deferred_closures_run_in_order() {
        let looper = EventLoop::new().unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));
        for i in 0..3 {
            let log = log.clone();
            looper.defer(Box::new(move || log.borrow_mut().push(i)));
        }
        looper.poll_once(Duration::ZERO).unwrap();
        assert_eq!(*log.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn test_deferred_closure_may_defer_more() {
        let looper = EventLoop::new().unwrap();
        let hits = Rc::new(Cell::new(0));
        {
            let looper2 = looper.clone();
            let hits = hits.clone();
            looper.defer(Box::new(move || {
                let hits = hits.clone();
                looper2.defer(Box::new(move || hits.set(hits.get() + 1)));
            }));
        }
        looper.poll_once(Duration::ZERO).unwrap();
        assert_eq!(hits.get(), 1);
    }

    struct Recorder {
        seen: Cell<EpollFlags>,
    }

    impl EventHandler for Recorder {
        fn handle_events(&self, events: EpollFlags) {
            self.seen.set(self.seen.get() | events);
        }
    }

    #[test]
    fn test_readiness_dispatch_and_unregister() {
        let looper = EventLoop::new().unwrap();
        let (mut tx, rx) = std::os::unix::net::UnixStream::pair().unwrap();
        rx.set_nonblocking(true).unwrap();

        let recorder = Rc::new(Recorder {
            seen: Cell::new(EpollFlags::empty()),
        });
        looper
            .register_descriptor(rx.as_raw_fd(), EpollFlags::EPOLLIN, recorder.clone())
            .unwrap();

        tx.write_all(b"x").unwrap();
        looper.poll_once(Duration::from_millis(100)).unwrap();
        assert!(recorder.seen.get().contains(EpollFlags::EPOLLIN));

        looper.unregister_descriptor(rx.as_raw_fd()).unwrap();
        recorder.seen.set(EpollFlags::empty());
        tx.write_all(b"y").unwrap();
        looper.poll_once(Duration::ZERO).unwrap();
        assert!(recorder.seen.get().is_empty());
    }

    #[test]
    fn test_reregister_replaces_mask() {
        let looper = EventLoop::new().unwrap();
        let (_tx, rx) = std::os::unix::net::UnixStream::pair().unwrap();
        rx.set_nonblocking(true).unwrap();

        let recorder = Rc::new(Recorder {
            seen: Cell::new(EpollFlags::empty()),
        });
        looper
            .register_descriptor(rx.as_raw_fd(), EpollFlags::EPOLLIN, recorder.clone())
            .unwrap();
        // Second registration of the same fd must not fail.
        looper
            .register_descriptor(rx.as_raw_fd(), EpollFlags::EPOLLOUT, recorder.clone())
            .unwrap();
    }
}
