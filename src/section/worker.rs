//! Dereference Worker
//!
//! Based on Mach4 kern/thread_swap.c
//!
//! One long-lived thread consumes deferred work so that deletions never run
//! on a caller's stack while the page cache lock or a file system lock is
//! held. It waits on three sources in priority order:
//!
//! 1. the dereference semaphore: one deferred request per release
//! 2. the unused-cleanup signal: run the eviction pass
//! 3. shutdown
//!
//! Swap grow requests go to the front of the deferred queue so a failing
//! commit is relieved quickly. Contract requests go to the back.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use crate::kern::event::Event;
use crate::section::context::LifecycleContext;
use crate::section::object::ObjectId;

// ============================================================================
// Deferred Requests
// ============================================================================

const RESIZE_PENDING: u8 = 0;
const RESIZE_SUCCEEDED: u8 = 1;
const RESIZE_FAILED: u8 = 2;

/// Direction of a swap resize
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapResize {
    Grow(u64),
    Contract(u64),
}

#[derive(Debug)]
struct ResizeRequest {
    resize: SwapResize,
    outcome: AtomicU8,
    done: Event,
}

/// Completion handle for a swap resize request
#[derive(Debug, Clone)]
pub struct SwapResizeTicket {
    request: Arc<ResizeRequest>,
}

impl SwapResizeTicket {
    fn new(resize: SwapResize) -> Self {
        Self {
            request: Arc::new(ResizeRequest {
                resize,
                outcome: AtomicU8::new(RESIZE_PENDING),
                done: Event::new(),
            }),
        }
    }

    /// Requested change
    pub fn resize(&self) -> SwapResize {
        self.request.resize
    }

    /// Block until the worker served the request; true if it succeeded
    pub fn wait(&self) -> bool {
        self.request.done.wait();
        self.succeeded()
    }

    /// Wait at most `timeout`; `None` if still pending
    pub fn wait_timeout(&self, timeout: Duration) -> Option<bool> {
        self.request
            .done
            .wait_timeout(timeout)
            .then(|| self.succeeded())
    }

    pub fn is_complete(&self) -> bool {
        self.request.outcome.load(Ordering::Acquire) != RESIZE_PENDING
    }

    fn succeeded(&self) -> bool {
        self.request.outcome.load(Ordering::Acquire) == RESIZE_SUCCEEDED
    }

    fn complete(&self, succeeded: bool) {
        let outcome = if succeeded {
            RESIZE_SUCCEEDED
        } else {
            RESIZE_FAILED
        };
        self.request.outcome.store(outcome, Ordering::Release);
        self.request.done.set();
    }
}

/// Work handed to the dereference worker
#[derive(Debug)]
pub(crate) enum DeferredRequest {
    /// Tear down a descriptor already marked for deletion
    Delete(ObjectId),
    /// Grow or contract swap space
    Resize(SwapResizeTicket),
}

/// FIFO of deferred requests
///
/// Guarded by a spin lock nested inside the page cache lock; never held
/// across a blocking call.
#[derive(Debug, Default)]
pub(crate) struct DeferredQueue {
    queue: spin::Mutex<VecDeque<DeferredRequest>>,
}

impl DeferredQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&self, request: DeferredRequest) {
        self.queue.lock().push_back(request);
    }

    pub fn push_front(&self, request: DeferredRequest) {
        self.queue.lock().push_front(request);
    }

    pub fn pop(&self) -> Option<DeferredRequest> {
        self.queue.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }
}

// ============================================================================
// Worker Signals
// ============================================================================

/// What woke the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerWake {
    Dereference,
    UnusedCleanup,
    Shutdown,
}

#[derive(Debug, Default)]
struct SignalState {
    /// Dereference semaphore count
    dereference: u32,
    /// Unused-cleanup signal
    cleanup: bool,
    shutdown: bool,
    /// Worker is processing a wake-up
    busy: bool,
}

/// Wake-up sources of the dereference worker
#[derive(Debug, Default)]
pub(crate) struct WorkerSignals {
    state: Mutex<SignalState>,
    changed: Condvar,
}

impl WorkerSignals {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SignalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Release the dereference semaphore once
    pub fn release_dereference(&self) {
        self.state().dereference += 1;
        self.changed.notify_all();
    }

    /// Set the unused-cleanup signal
    pub fn set_cleanup(&self) {
        self.state().cleanup = true;
        self.changed.notify_all();
    }

    pub fn request_shutdown(&self) {
        self.state().shutdown = true;
        self.changed.notify_all();
    }

    pub fn shutdown_requested(&self) -> bool {
        self.state().shutdown
    }

    /// Block for the highest-priority source and consume it
    pub fn wait_any(&self) -> WorkerWake {
        let mut state = self.state();
        loop {
            if state.dereference > 0 {
                state.dereference -= 1;
                state.busy = true;
                return WorkerWake::Dereference;
            }
            if state.cleanup {
                state.cleanup = false;
                state.busy = true;
                return WorkerWake::UnusedCleanup;
            }
            if state.shutdown {
                return WorkerWake::Shutdown;
            }
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Worker finished handling a wake-up
    pub fn mark_idle(&self) {
        self.state().busy = false;
        self.changed.notify_all();
    }

    /// Block until nothing is pending and the worker is idle
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let state = self.state();
        let (state, _) = self
            .changed
            .wait_timeout_while(state, timeout, |s| {
                !s.shutdown && (s.dereference > 0 || s.cleanup || s.busy)
            })
            .unwrap_or_else(PoisonError::into_inner);
        state.dereference == 0 && !state.cleanup && !state.busy
    }
}

// ============================================================================
// Worker
// ============================================================================

impl LifecycleContext {
    /// Body of the dereference worker thread
    pub(crate) fn run_worker(&self) {
        log::info!("dereference worker started");
        loop {
            match self.signals.wait_any() {
                WorkerWake::Dereference => {
                    self.process_deferred();
                }
                WorkerWake::UnusedCleanup => self.eviction_pass(),
                WorkerWake::Shutdown => break,
            }
            self.signals.mark_idle();
        }
        log::info!("dereference worker stopped");
    }

    /// Queue a descriptor teardown for the worker
    ///
    /// Called with the page cache lock held; the queue lock nests inside it.
    pub(crate) fn queue_deletion(&self, id: ObjectId) {
        self.deferred.push_back(DeferredRequest::Delete(id));
        self.stats.deletions_queued.inc();
        self.stats.deferred_peak.observe(self.deferred.len());
        self.signals.release_dereference();
        log::trace!("{:?} queued for deletion", id);
    }

    /// Queue a swap resize; grows jump the queue
    pub(crate) fn queue_swap_resize(&self, resize: SwapResize) -> SwapResizeTicket {
        let ticket = SwapResizeTicket::new(resize);
        let request = DeferredRequest::Resize(ticket.clone());
        match resize {
            SwapResize::Grow(_) => self.deferred.push_front(request),
            SwapResize::Contract(_) => self.deferred.push_back(request),
        }
        self.stats.deferred_peak.observe(self.deferred.len());
        self.signals.release_dereference();
        ticket
    }

    /// Serve one deferred request; false if the queue was empty
    pub(crate) fn process_deferred(&self) -> bool {
        let Some(request) = self.deferred.pop() else {
            return false;
        };
        match request {
            DeferredRequest::Delete(id) => self.delete_descriptor(id),
            DeferredRequest::Resize(ticket) => {
                let succeeded = match ticket.resize() {
                    SwapResize::Grow(pages) => {
                        self.stats.swap_grows.inc();
                        self.collab.swap.grow(pages)
                    }
                    SwapResize::Contract(pages) => {
                        self.stats.swap_contracts.inc();
                        self.collab.swap.contract(pages)
                    }
                };
                log::debug!("swap {:?} served: {}", ticket.resize(), succeeded);
                ticket.complete(succeeded);
            }
        }
        true
    }

    /// Serve every queued request on the calling thread
    pub(crate) fn drain_deferred(&self) -> usize {
        let mut served = 0;
        while self.process_deferred() {
            served += 1;
        }
        served
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_signal_priority() {
        let signals = WorkerSignals::new();
        signals.request_shutdown();
        signals.set_cleanup();
        signals.release_dereference();

        assert_eq!(signals.wait_any(), WorkerWake::Dereference);
        assert_eq!(signals.wait_any(), WorkerWake::UnusedCleanup);
        assert_eq!(signals.wait_any(), WorkerWake::Shutdown);
    }

    #[test]
    fn test_wait_idle_tracks_busy() {
        let signals = Arc::new(WorkerSignals::new());
        signals.release_dereference();
        assert!(!signals.wait_idle(Duration::from_millis(1)));

        assert_eq!(signals.wait_any(), WorkerWake::Dereference);
        let waiter = {
            let signals = signals.clone();
            thread::spawn(move || signals.wait_idle(Duration::from_secs(5)))
        };
        signals.mark_idle();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_queue_order() {
        let queue = DeferredQueue::new();
        queue.push_back(DeferredRequest::Delete(ObjectId(1)));
        queue.push_front(DeferredRequest::Delete(ObjectId(2)));
        assert_eq!(queue.len(), 2);
        assert!(matches!(queue.pop(), Some(DeferredRequest::Delete(ObjectId(2)))));
        assert!(matches!(queue.pop(), Some(DeferredRequest::Delete(ObjectId(1)))));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_ticket_completion() {
        let ticket = SwapResizeTicket::new(SwapResize::Grow(8));
        assert!(!ticket.is_complete());
        assert_eq!(ticket.wait_timeout(Duration::from_millis(1)), None);

        ticket.complete(true);
        assert!(ticket.is_complete());
        assert!(ticket.wait());
    }
}
