use std::cell::{Cell, RefCell};
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use signal_hook::low_level::pipe as signal_pipe;
use signal_hook::SigId;

use crate::error::{Error, Result};

type Callback = Box<dyn FnMut() -> Result<()>>;

enum EventKind {
    FdReadable { fd: RawFd, oneshot: bool },
    Signal { read_fd: RawFd, write_fd: RawFd, sig_ids: Vec<SigId> },
    Periodic { interval: Duration, next_fire: Cell<Instant> },
}

struct IOEvent {
    kind: EventKind,
    callback: RefCell<Callback>,
    enabled: Cell<bool>,
}

impl Drop for IOEvent {
    fn drop(&mut self) {
        if let EventKind::Signal { read_fd, write_fd, sig_ids } = &self.kind {
            for sig_id in sig_ids {
                signal_hook::low_level::unregister(*sig_id);
            }
            unsafe {
                libc::close(*read_fd);
                libc::close(*write_fd);
            }
        }
    }
}

/// Handle to a registration in the loop; dropping it does not cancel.
#[derive(Clone)]
pub struct IOEventRef(Rc<IOEvent>);

impl IOEventRef {
    pub fn cancel(&self) {
        self.0.enabled.set(false);
    }
}

struct LoopState {
    events: RefCell<Vec<Rc<IOEvent>>>,
    exit: Cell<bool>,
    error: RefCell<Option<Error>>,
}

/// A single-threaded event loop multiplexing fd readiness, signals, and
/// periodic timers.
///
/// Callbacks run to completion and must not block; a callback returning an
/// error latches it and makes [`IOEventLoop::run`] return it. Signals are
/// delivered as ordinary callbacks via a self-pipe, never from signal
/// handler context. The loop is a cheap cloneable handle so callbacks can
/// hold one to register further events or request exit.
#[derive(Clone)]
pub struct IOEventLoop {
    state: Rc<LoopState>,
}

impl Default for IOEventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl IOEventLoop {
    pub fn new() -> Self {
        IOEventLoop {
            state: Rc::new(LoopState {
                events: RefCell::new(Vec::new()),
                exit: Cell::new(false),
                error: RefCell::new(None),
            }),
        }
    }

    fn add(&self, kind: EventKind, callback: Callback) -> IOEventRef {
        let event = Rc::new(IOEvent {
            kind,
            callback: RefCell::new(callback),
            enabled: Cell::new(true),
        });
        self.state.events.borrow_mut().push(event.clone());
        IOEventRef(event)
    }

    /// Run `callback` every time `fd` becomes readable.
    pub fn add_fd_event<F>(&self, fd: RawFd, callback: F) -> IOEventRef
    where
        F: FnMut() -> Result<()> + 'static,
    {
        self.add(
            EventKind::FdReadable { fd, oneshot: false },
            Box::new(callback),
        )
    }

    /// Run `callback` once, the first time `fd` becomes readable.
    pub fn add_oneshot_fd_event<F>(&self, fd: RawFd, callback: F) -> IOEventRef
    where
        F: FnMut() -> Result<()> + 'static,
    {
        self.add(
            EventKind::FdReadable { fd, oneshot: true },
            Box::new(callback),
        )
    }

    /// Route the given signals into `callback`. One registration covers all
    /// of them, so `SIGINT`/`SIGTERM`/`SIGHUP` can share an exit path.
    pub fn add_signal_events<F>(&self, signals: &[i32], callback: F) -> Result<IOEventRef>
    where
        F: FnMut() -> Result<()> + 'static,
    {
        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) } != 0 {
            return Err(Error::Poll(io::Error::last_os_error()));
        }
        let (read_fd, write_fd) = (fds[0], fds[1]);
        let mut sig_ids = Vec::with_capacity(signals.len());
        for &signo in signals {
            match signal_pipe::register_raw(signo, write_fd) {
                Ok(sig_id) => sig_ids.push(sig_id),
                Err(err) => {
                    for sig_id in sig_ids {
                        signal_hook::low_level::unregister(sig_id);
                    }
                    unsafe {
                        libc::close(read_fd);
                        libc::close(write_fd);
                    }
                    return Err(Error::Poll(err));
                }
            }
        }
        Ok(self.add(
            EventKind::Signal { read_fd, write_fd, sig_ids },
            Box::new(callback),
        ))
    }

    pub fn add_signal_event<F>(&self, signo: i32, callback: F) -> Result<IOEventRef>
    where
        F: FnMut() -> Result<()> + 'static,
    {
        self.add_signal_events(&[signo], callback)
    }

    /// Run `callback` every `interval`, first at `now + interval`. The next
    /// fire time is taken from the moment the callback starts, not from when
    /// it finishes.
    pub fn add_periodic_event<F>(&self, interval: Duration, callback: F) -> IOEventRef
    where
        F: FnMut() -> Result<()> + 'static,
    {
        self.add(
            EventKind::Periodic {
                interval,
                next_fire: Cell::new(Instant::now() + interval),
            },
            Box::new(callback),
        )
    }

    /// Make [`IOEventLoop::run`] return after the current callback.
    pub fn exit_loop(&self) {
        self.state.exit.set(true);
    }

    fn dispatch(&self, event: &Rc<IOEvent>) {
        let result = (event.callback.borrow_mut())();
        if let Err(err) = result {
            *self.state.error.borrow_mut() = Some(err);
            self.state.exit.set(true);
        }
    }

    /// Dispatch events until exit is requested or a callback fails.
    pub fn run(&self) -> Result<()> {
        self.state.exit.set(false);
        let mut pollfds: Vec<libc::pollfd> = Vec::new();
        let mut polled: Vec<Rc<IOEvent>> = Vec::new();
        loop {
            if self.state.exit.get() {
                break;
            }
            // Snapshot so callbacks may add or cancel registrations.
            let events: Vec<Rc<IOEvent>> = self
                .state
                .events
                .borrow()
                .iter()
                .filter(|e| e.enabled.get())
                .cloned()
                .collect();
            if events.is_empty() {
                break;
            }

            pollfds.clear();
            polled.clear();
            let mut timeout_ms: i32 = -1;
            let now = Instant::now();
            for event in &events {
                match &event.kind {
                    EventKind::FdReadable { fd, .. } => {
                        pollfds.push(libc::pollfd {
                            fd: *fd,
                            events: libc::POLLIN | libc::POLLHUP,
                            revents: 0,
                        });
                        polled.push(event.clone());
                    }
                    EventKind::Signal { read_fd, .. } => {
                        pollfds.push(libc::pollfd {
                            fd: *read_fd,
                            events: libc::POLLIN,
                            revents: 0,
                        });
                        polled.push(event.clone());
                    }
                    EventKind::Periodic { next_fire, .. } => {
                        let wait = next_fire.get().saturating_duration_since(now);
                        let wait_ms = wait.as_millis().min(i32::MAX as u128) as i32;
                        if timeout_ms < 0 || wait_ms < timeout_ms {
                            timeout_ms = wait_ms;
                        }
                    }
                }
            }

            let ready = unsafe {
                libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms)
            };
            if ready < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(Error::Poll(err));
            }

            let now = Instant::now();
            for event in &events {
                if self.state.exit.get() {
                    break;
                }
                if !event.enabled.get() {
                    continue;
                }
                if let EventKind::Periodic { interval, next_fire } = &event.kind {
                    if next_fire.get() <= now {
                        next_fire.set(Instant::now() + *interval);
                        self.dispatch(event);
                    }
                }
            }
            for (pollfd, event) in pollfds.iter().zip(&polled) {
                if self.state.exit.get() {
                    break;
                }
                if !event.enabled.get() {
                    continue;
                }
                if pollfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) == 0 {
                    continue;
                }
                match &event.kind {
                    EventKind::Signal { read_fd, .. } => {
                        let mut scratch = [0u8; 64];
                        while unsafe {
                            libc::read(*read_fd, scratch.as_mut_ptr() as *mut libc::c_void, 64)
                        } > 0
                        {}
                    }
                    EventKind::FdReadable { oneshot, .. } => {
                        if *oneshot {
                            event.enabled.set(false);
                        }
                    }
                    EventKind::Periodic { .. } => unreachable!(),
                }
                self.dispatch(event);
            }

            self.state
                .events
                .borrow_mut()
                .retain(|event| event.enabled.get());
        }

        match self.state.error.borrow_mut().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn periodic_event_fires_and_exit_stops_the_loop() {
        let io_loop = IOEventLoop::new();
        let count = Rc::new(Cell::new(0));
        let counter = count.clone();
        let handle = io_loop.clone();
        io_loop.add_periodic_event(Duration::from_millis(2), move || {
            counter.set(counter.get() + 1);
            if counter.get() == 3 {
                handle.exit_loop();
            }
            Ok(())
        });
        io_loop.run().unwrap();
        assert_eq!(count.get(), 3);
    }

    #[test]
    fn fd_event_fires_when_readable() {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (read_fd, write_fd) = (fds[0], fds[1]);
        unsafe {
            libc::write(write_fd, b"x".as_ptr() as *const libc::c_void, 1);
        }

        let io_loop = IOEventLoop::new();
        let fired = Rc::new(Cell::new(false));
        let fired_flag = fired.clone();
        let handle = io_loop.clone();
        io_loop.add_fd_event(read_fd, move || {
            let mut byte = [0u8; 1];
            unsafe {
                libc::read(read_fd, byte.as_mut_ptr() as *mut libc::c_void, 1);
            }
            fired_flag.set(true);
            handle.exit_loop();
            Ok(())
        });
        io_loop.run().unwrap();
        assert!(fired.get());
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn oneshot_fd_event_fires_once() {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (read_fd, write_fd) = (fds[0], fds[1]);
        unsafe {
            libc::write(write_fd, b"xy".as_ptr() as *const libc::c_void, 2);
        }

        let io_loop = IOEventLoop::new();
        let count = Rc::new(Cell::new(0));
        let counter = count.clone();
        io_loop.add_oneshot_fd_event(read_fd, move || {
            counter.set(counter.get() + 1);
            Ok(())
        });
        // A later periodic tick proves the oneshot did not fire again even
        // though the fd stayed readable.
        let handle = io_loop.clone();
        io_loop.add_periodic_event(Duration::from_millis(10), move || {
            handle.exit_loop();
            Ok(())
        });
        io_loop.run().unwrap();
        assert_eq!(count.get(), 1);
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn callback_error_latches_and_run_fails() {
        let io_loop = IOEventLoop::new();
        io_loop.add_periodic_event(Duration::from_millis(1), || {
            Err(Error::InvalidConfig("boom".into()))
        });
        let err = io_loop.run().unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn cancelled_events_do_not_fire() {
        let io_loop = IOEventLoop::new();
        let count = Rc::new(Cell::new(0));
        let counter = count.clone();
        let cancelled = io_loop.add_periodic_event(Duration::from_millis(1), move || {
            counter.set(counter.get() + 1);
            Ok(())
        });
        cancelled.cancel();
        let handle = io_loop.clone();
        io_loop.add_periodic_event(Duration::from_millis(5), move || {
            handle.exit_loop();
            Ok(())
        });
        io_loop.run().unwrap();
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn run_returns_when_no_events_remain() {
        let io_loop = IOEventLoop::new();
        assert!(io_loop.run().is_ok());
    }
}
