//! The work queue of a session.
//!
//! One thread owns the multi handle and every [`NativeProtocol`]. Everything
//! that touches them runs on that thread: engine callbacks, timers, and jobs
//! posted from other threads by tasks and redirect decisions. Jobs are sent
//! over a channel and the `mio` waker interrupts the poll so they run
//! promptly.

use std::{
    io, mem,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use mio::{Events, Waker};
use tokio::sync::mpsc;

use crate::{
    engine::{Action, Callbacks, Engine, FillResult, HandleId, Progress, SeekResult},
    error::{Error, ErrorCode},
    multi::{Finished, MultiHandle, WAKER},
    protocol::{self, NativeProtocol},
    request::Request,
    task::{Task, TaskState},
};

/// How long a body source that asked to be retried is left alone.
const RETRY_DELAY: Duration = Duration::from_millis(10);

pub(crate) type Job = Box<dyn FnOnce(&mut Runtime) + Send>;

/// Sends jobs to the work queue.
#[derive(Clone)]
pub(crate) struct Poster {
    tx: mpsc::UnboundedSender<Job>,
    waker: Arc<Waker>,
}

impl Poster {
    /// Queues `job`. Returns false once the work queue is gone.
    pub(crate) fn post<F>(&self, job: F) -> bool
    where
        F: FnOnce(&mut Runtime) + Send + 'static,
    {
        if self.tx.send(Box::new(job)).is_err() {
            return false;
        }
        if let Err(e) = self.waker.wake() {
            log::warn!("waking the work queue failed: {e}");
        }
        true
    }
}

impl std::fmt::Debug for Poster {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Poster").finish()
    }
}

/// Starts the work queue thread for `engine`.
pub(crate) fn spawn(engine: Box<dyn Engine>) -> io::Result<Poster> {
    let (multi, waker) = MultiHandle::new(engine)?;
    let (tx, rx) = mpsc::unbounded_channel();
    let runtime = Runtime {
        multi,
        jobs: rx,
        protocols: Vec::new(),
        free: Vec::new(),
        deferred: Vec::new(),
        shutdown: false,
    };
    thread::Builder::new()
        .name("rquest-transfer".to_owned())
        .spawn(move || runtime.run())?;
    Ok(Poster { tx, waker })
}

pub(crate) struct Runtime {
    multi: MultiHandle,
    jobs: mpsc::UnboundedReceiver<Job>,
    protocols: Vec<Option<NativeProtocol>>,
    free: Vec<usize>,
    deferred: Vec<(Instant, Job)>,
    shutdown: bool,
}

// ===== impl Runtime =====

impl Runtime {
    fn run(mut self) {
        log::debug!("work queue started");
        let mut events = Events::with_capacity(256);
        loop {
            self.run_jobs();
            let now = Instant::now();
            self.run_deferred(now);
            self.check_timeouts(now);
            let finished = self.multi.timer_due(now, &mut Router {
                protocols: &mut self.protocols,
                deferred: &mut self.deferred,
            });
            self.dispatch(finished);

            if self.shutdown && self.is_idle() {
                break;
            }

            let timeout = self.poll_timeout(Instant::now());
            if let Err(e) = self.multi.poll(&mut events, timeout) {
                log::error!("polling failed: {e}");
                self.fail_all();
                break;
            }
            for event in events.iter() {
                if event.token() == WAKER {
                    continue;
                }
                let finished = self.multi.socket_ready(event, &mut Router {
                    protocols: &mut self.protocols,
                    deferred: &mut self.deferred,
                });
                self.dispatch(finished);
            }
        }
        log::debug!("work queue stopped");
    }

    fn run_jobs(&mut self) {
        loop {
            match self.jobs.try_recv() {
                Ok(job) => job(self),
                Err(mpsc::error::TryRecvError::Empty) => return,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.shutdown = true;
                    return;
                }
            }
        }
    }

    fn run_deferred(&mut self, now: Instant) {
        if self.deferred.is_empty() {
            return;
        }
        let (due, pending): (Vec<_>, Vec<_>) = mem::take(&mut self.deferred)
            .into_iter()
            .partition(|(at, _)| *at <= now);
        self.deferred = pending;
        for (_, job) in due {
            job(self);
        }
    }

    fn check_timeouts(&mut self, now: Instant) {
        let expired: Vec<HandleId> = self
            .protocols
            .iter()
            .flatten()
            .filter(|protocol| protocol.is_timed_out(now))
            .map(NativeProtocol::id)
            .collect();
        for handle in expired {
            self.with_protocol(handle, |protocol, multi| protocol.timed_out(multi));
        }
    }

    fn dispatch(&mut self, finished: Vec<Finished>) {
        for (handle, result) in finished {
            self.with_protocol(handle, |protocol, multi| {
                protocol.transfer_completed(result, multi)
            });
        }
    }

    fn poll_timeout(&self, now: Instant) -> Option<Duration> {
        let deadlines = self
            .protocols
            .iter()
            .flatten()
            .filter_map(NativeProtocol::deadline)
            .chain(self.deferred.iter().map(|(at, _)| *at))
            .chain(self.multi.timer());
        deadlines
            .min()
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    fn is_idle(&self) -> bool {
        self.deferred.is_empty() && self.protocols.iter().all(Option::is_none)
    }

    fn fail_all(&mut self) {
        let handles: Vec<HandleId> = self
            .protocols
            .iter()
            .flatten()
            .map(NativeProtocol::id)
            .collect();
        for handle in handles {
            self.with_protocol(handle, |protocol, multi| {
                protocol.stop_loading(
                    Error::request(ErrorCode::Unknown, "work queue failed"),
                    multi,
                )
            });
        }
    }

    /// Runs `f` with the protocol of `handle` taken out of its slot, and
    /// frees the slot once the protocol finished.
    fn with_protocol<F>(&mut self, handle: HandleId, f: F)
    where
        F: FnOnce(&mut NativeProtocol, &mut MultiHandle),
    {
        let Some(mut protocol) = self
            .protocols
            .get_mut(handle.index())
            .and_then(Option::take)
        else {
            log::warn!("no transfer for {handle:?}");
            return;
        };
        f(&mut protocol, &mut self.multi);
        if protocol.is_finished() {
            log::trace!("releasing {handle:?}");
            self.free.push(handle.index());
        } else {
            self.protocols[handle.index()] = Some(protocol);
        }
    }

    /// The handle of the protocol running `task`.
    fn handle_of(&self, task: &Task) -> Option<HandleId> {
        let handle = task.handle()?;
        match self.protocols.get(handle.index()) {
            Some(Some(protocol)) if protocol.task().task_identifier() == task.task_identifier() => {
                Some(handle)
            }
            _ => None,
        }
    }

    // ===== jobs =====

    pub(crate) fn resume_task(&mut self, task: &Task) {
        if let Some(handle) = self.handle_of(task) {
            return self.with_protocol(handle, |protocol, multi| protocol.resume(multi));
        }
        if task.state() != TaskState::Running {
            return;
        }

        let url = task.original_request().url();
        let Some(handler) = protocol::handler_for(url) else {
            log::debug!("no protocol for {url}");
            task.complete(Err(Error::url_bad_scheme(url.clone())));
            return;
        };

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.protocols.push(None);
                self.protocols.len() - 1
            }
        };
        let handle = HandleId::new(index);
        task.set_handle(Some(handle));
        self.protocols[index] = Some(NativeProtocol::new(task.clone(), handler, handle));
        self.with_protocol(handle, |protocol, multi| protocol.start_loading(multi));
    }

    pub(crate) fn suspend_task(&mut self, task: &Task) {
        if let Some(handle) = self.handle_of(task) {
            self.with_protocol(handle, |protocol, multi| protocol.suspend(multi));
        }
    }

    pub(crate) fn cancel_task(&mut self, task: &Task) {
        match self.handle_of(task) {
            Some(handle) => self.with_protocol(handle, |protocol, multi| {
                protocol.stop_loading(Error::cancelled(), multi)
            }),
            None => task.complete(Err(Error::cancelled())),
        }
    }

    pub(crate) fn redirect_decided(&mut self, task: &Task, request: Option<Request>) {
        match self.handle_of(task) {
            Some(handle) => self.with_protocol(handle, |protocol, multi| {
                protocol.redirect_decided(request, multi)
            }),
            None => log::debug!(
                "redirect decision for finished task {}",
                task.task_identifier()
            ),
        }
    }

    fn unpause_send(&mut self, task: &Task) {
        if let Some(handle) = self.handle_of(task) {
            self.with_protocol(handle, |protocol, multi| protocol.unpause_send(multi));
        }
    }

    /// Stops the thread once every running task finished.
    pub(crate) fn shutdown(&mut self) {
        log::debug!("work queue shutting down");
        self.shutdown = true;
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("multi", &self.multi)
            .field("protocols", &self.protocols.iter().flatten().count())
            .field("shutdown", &self.shutdown)
            .finish()
    }
}

/// Routes engine callbacks to the protocol owning the handle.
struct Router<'a> {
    protocols: &'a mut Vec<Option<NativeProtocol>>,
    deferred: &'a mut Vec<(Instant, Job)>,
}

impl Router<'_> {
    fn protocol(&mut self, handle: HandleId) -> Option<&mut NativeProtocol> {
        let protocol = self.protocols.get_mut(handle.index()).and_then(Option::as_mut);
        if protocol.is_none() {
            log::warn!("callback for unknown transfer {handle:?}");
        }
        protocol
    }
}

impl Callbacks for Router<'_> {
    fn on_header(&mut self, handle: HandleId, data: &[u8], content_length: Option<u64>) -> Action {
        match self.protocol(handle) {
            Some(protocol) => protocol.did_receive_header(data, content_length),
            None => Action::Abort,
        }
    }

    fn on_write(&mut self, handle: HandleId, data: &[u8]) -> Action {
        match self.protocol(handle) {
            Some(protocol) => protocol.did_receive_body(data),
            None => Action::Abort,
        }
    }

    fn on_read(&mut self, handle: HandleId, buf: &mut [u8]) -> FillResult {
        let Some(protocol) = self.protocols.get_mut(handle.index()).and_then(Option::as_mut) else {
            log::warn!("callback for unknown transfer {handle:?}");
            return FillResult::Abort;
        };
        let result = protocol.fill_write_buffer(buf);
        if protocol.take_retry_later() {
            let task = protocol.task().clone();
            self.deferred.push((
                Instant::now() + RETRY_DELAY,
                Box::new(move |runtime: &mut Runtime| runtime.unpause_send(&task)),
            ));
        }
        result
    }

    fn on_seek(&mut self, handle: HandleId, offset: u64) -> SeekResult {
        match self.protocol(handle) {
            Some(protocol) => protocol.seek_input_stream(offset),
            None => SeekResult::Fail,
        }
    }

    fn on_progress(&mut self, handle: HandleId, progress: Progress) {
        if let Some(protocol) = self.protocol(handle) {
            protocol.update_progress(progress);
        }
    }
}
