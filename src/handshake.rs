//! Revoke and transfer handshakes.
//!
//! An initiator asks another party to act on a notification context (give up
//! a resource, or take one over), releases the segment lock, and polls the
//! context's `confirm` semaphore for a bounded time before taking the lock
//! back. The other party is a handler thread in the process that registered
//! the context; it blocks on the context's `act` semaphore.
//!
//! ```text
//! initiator                           handler thread
//! ─────────                           ──────────────
//! lock
//! phase = AwaitingAck
//! post(act) ───────────────────────▶  wakes
//! unlock                              Revoked: run callback, which
//! poll confirm (300 x 10ms)             releases and posts confirm
//!            ◀───────────────────────  Granted: lock, adopt, post confirm
//! lock
//! ```
//!
//! Timing out is not an error: the initiator proceeds as if confirmed.

use crate::caps::ResourceType;
use crate::error::Result;
use crate::manager::{Notification, NotifyCallback, RequestId};
use crate::state::{NotifyEvent, NotifySems, NotifyState, SharedState, StateGuard, StateTable};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Number of `confirm` polls before an initiator gives up.
pub const HANDSHAKE_RETRIES: u32 = 300;

/// Delay between two `confirm` polls.
pub const HANDSHAKE_INTERVAL: Duration = Duration::from_millis(10);

/// How long [`HandlerHandle::stop`] waits for a woken handler to exit.
const STOP_TIMEOUT: Duration = Duration::from_millis(500);

/// How a handshake ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// The other party posted `confirm`.
    Confirmed,
    /// The retry budget ran out.
    TimedOut,
}

/// Notification context a handshake runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Revocation context of a resource record (table index).
    Resource(usize),
    /// Grant context of a queue node.
    Node(usize),
}

impl Target {
    fn sems(self, state: &SharedState) -> &NotifySems {
        match self {
            Target::Resource(i) => &state.signals().resources[i],
            Target::Node(i) => &state.signals().nodes[i],
        }
    }

    fn notify(self, table: &mut StateTable) -> &mut NotifyState {
        match self {
            Target::Resource(i) => &mut table.resources[i].notify,
            Target::Node(i) => &mut table.nodes[i].notify,
        }
    }

    /// Non-zero word for [`HandlerFlags::parked_on`].
    fn encode(self) -> u64 {
        match self {
            Target::Resource(i) => (1 << 32) | i as u64,
            Target::Node(i) => (2 << 32) | i as u64,
        }
    }

    fn decode(word: u64) -> Option<Self> {
        let index = (word & u64::from(u32::MAX)) as usize;
        match word >> 32 {
            1 => Some(Target::Resource(index)),
            2 => Some(Target::Node(index)),
            _ => None,
        }
    }
}

/// Run one handshake on `target`, consuming and returning the lock.
///
/// The context is left in `AwaitingAck`; the caller settles it once the
/// lock is back.
pub fn signal_and_wait<'a>(
    state: &'a SharedState,
    mut guard: StateGuard<'a>,
    target: Target,
    event: NotifyEvent,
    initiator: i32,
) -> Result<(StateGuard<'a>, HandshakeOutcome)> {
    let sems = target.sems(state);
    target.notify(&mut guard).begin_handshake(event, initiator);
    sems.confirm.reset(0);
    sems.act.post()?;
    drop(guard);

    let mut outcome = HandshakeOutcome::TimedOut;
    for _ in 0..HANDSHAKE_RETRIES {
        if sems.confirm.try_wait() {
            outcome = HandshakeOutcome::Confirmed;
            break;
        }
        thread::sleep(HANDSHAKE_INTERVAL);
    }

    if outcome == HandshakeOutcome::TimedOut {
        tracing::info!(
            "{:?} handshake on {:?} timed out after {} tries, proceeding",
            event,
            target,
            HANDSHAKE_RETRIES
        );
    }

    Ok((state.lock()?, outcome))
}

/// Result of a handler's attempt to take over a granted resource.
pub(crate) enum Adoption {
    /// The resource is ours now.
    Adopted {
        record: usize,
        resource_type: ResourceType,
        index: usize,
    },
    /// Still queued; keep waiting.
    Waiting,
    /// Neither queued nor granted; stop.
    Gone,
}

/// The side of the manager a grant handler calls back into.
pub(crate) trait GrantHost: Send + Sync + 'static {
    /// Take over the tentative ownership left for `request_id` by a
    /// transfer on `node`.
    fn adopt(&self, node: usize, request_id: i32) -> Result<Adoption>;
}

/// Where a handler starts.
pub(crate) enum Phase {
    /// Waiting on a queue node for a grant.
    Pending { node: usize },
    /// Holding a record, waiting to be revoked.
    Owner {
        record: usize,
        resource_type: ResourceType,
        index: usize,
    },
}

#[derive(Default)]
struct HandlerFlags {
    cancelled: AtomicBool,
    waiting: AtomicBool,
    /// Context of the last `act` wait, as [`Target::encode`].
    parked_on: AtomicU64,
}

impl HandlerFlags {
    /// Block on the `act` semaphore of `target`; false means the handler
    /// should exit.
    ///
    /// A cancelled handler that wakes up passes the post on, in case it was
    /// meant for a live handler parked on the same semaphore.
    fn park(&self, state: &SharedState, target: Target) -> bool {
        let act = &target.sems(state).act;
        self.parked_on.store(target.encode(), Ordering::SeqCst);
        self.waiting.store(true, Ordering::SeqCst);
        if self.cancelled.load(Ordering::SeqCst) {
            self.waiting.store(false, Ordering::SeqCst);
            return false;
        }
        let woke = act.wait();
        self.waiting.store(false, Ordering::SeqCst);
        if let Err(e) = woke {
            tracing::warn!("notification wait failed: {}", e);
            return false;
        }
        if self.cancelled.load(Ordering::SeqCst) {
            if let Err(e) = act.post() {
                tracing::warn!("failed to pass on notification: {}", e);
            }
            return false;
        }
        true
    }
}

/// Process-local half of a notification context.
pub(crate) struct HandlerHandle {
    flags: Arc<HandlerFlags>,
    thread: Option<JoinHandle<()>>,
}

impl HandlerHandle {
    /// Start a handler thread for `request_id`.
    pub(crate) fn spawn<H: GrantHost>(
        state: Arc<SharedState>,
        host: Weak<H>,
        request_id: i32,
        phase: Phase,
        callback: NotifyCallback,
    ) -> Result<Self> {
        let flags = Arc::new(HandlerFlags::default());
        let thread = {
            let flags = Arc::clone(&flags);
            thread::Builder::new()
                .name(format!("resmgr-notify-{request_id}"))
                .spawn(move || run(&state, &host, &flags, request_id, phase, &callback))?
        };
        Ok(Self {
            flags,
            thread: Some(thread),
        })
    }

    fn cancel(&self) {
        self.flags.cancelled.store(true, Ordering::SeqCst);
    }

    /// Cancel the handler and, if it is blocked on an `act` semaphore, wake
    /// and join it.
    ///
    /// Called with the segment lock held. A woken handler exits on the
    /// cancel flag without touching the lock. A handler busy in its callback
    /// sees the flag before it blocks again and is left to exit on its own.
    pub(crate) fn stop(mut self, state: &SharedState) {
        self.cancel();
        let Some(thread) = self.thread.take() else {
            return;
        };
        if thread.thread().id() == thread::current().id() {
            return;
        }
        if !self.flags.waiting.load(Ordering::SeqCst) {
            return;
        }
        let Some(target) = Target::decode(self.flags.parked_on.load(Ordering::SeqCst)) else {
            return;
        };
        let act = &target.sems(state).act;
        if let Err(e) = act.post() {
            tracing::warn!("failed to wake notification handler: {}", e);
            return;
        }

        let deadline = Instant::now() + STOP_TIMEOUT;
        while !thread.is_finished() {
            if Instant::now() >= deadline {
                tracing::warn!("notification handler on {:?} did not exit, detaching", target);
                return;
            }
            // Another waiter on the same semaphore may have taken the post.
            if self.flags.waiting.load(Ordering::SeqCst) && act.value() == 0 {
                if let Err(e) = act.post() {
                    tracing::warn!("failed to wake notification handler: {}", e);
                    return;
                }
            }
            thread::sleep(Duration::from_millis(1));
        }
        if thread.join().is_err() {
            tracing::warn!("notification handler panicked");
        }
        act.reset(0);
    }

    /// Tracks whether the handler thread has exited.
    #[cfg(test)]
    pub(crate) fn watch(&self) -> HandlerWatch {
        HandlerWatch(Arc::downgrade(&self.flags))
    }
}

/// See [`HandlerHandle::watch`].
#[cfg(test)]
pub(crate) struct HandlerWatch(Weak<HandlerFlags>);

#[cfg(test)]
impl HandlerWatch {
    /// Both the handle and its thread are gone.
    pub(crate) fn exited(&self) -> bool {
        self.0.strong_count() == 0
    }
}

fn run<H: GrantHost>(
    state: &SharedState,
    host: &Weak<H>,
    flags: &HandlerFlags,
    request_id: i32,
    mut phase: Phase,
    callback: &NotifyCallback,
) {
    let id = RequestId(request_id);
    loop {
        match phase {
            Phase::Pending { node } => {
                if !flags.park(state, Target::Node(node)) {
                    return;
                }
                let Some(host) = host.upgrade() else {
                    return;
                };
                match host.adopt(node, request_id) {
                    Ok(Adoption::Adopted {
                        record,
                        resource_type,
                        index,
                    }) => {
                        drop(host);
                        tracing::debug!("request {} granted {} {}", request_id, resource_type, index);
                        callback(&Notification::Granted {
                            resource_type,
                            index,
                            request_id: id,
                        });
                        phase = Phase::Owner {
                            record,
                            resource_type,
                            index,
                        };
                    }
                    Ok(Adoption::Waiting) => {}
                    Ok(Adoption::Gone) => return,
                    Err(e) => {
                        tracing::warn!("request {}: grant failed: {}", request_id, e);
                        return;
                    }
                }
            }
            Phase::Owner {
                record,
                resource_type,
                index,
            } => {
                if !flags.park(state, Target::Resource(record)) {
                    return;
                }
                tracing::debug!("request {} revoked from {} {}", request_id, resource_type, index);
                callback(&Notification::Revoked {
                    resource_type,
                    index,
                    request_id: id,
                });
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::sync::Mutex;
    use std::time::Instant;
    use tempfile::tempdir;

    struct NoHost;

    impl GrantHost for NoHost {
        fn adopt(&self, _node: usize, _request_id: i32) -> Result<Adoption> {
            Ok(Adoption::Gone)
        }
    }

    fn open_state() -> (tempfile::TempDir, Arc<SharedState>) {
        let dir = tempdir().unwrap();
        let state = SharedState::open(&dir.path().join("seg"), Config::default()).unwrap();
        (dir, Arc::new(state))
    }

    fn owner_phase() -> Phase {
        Phase::Owner {
            record: 0,
            resource_type: ResourceType::VideoDecoder,
            index: 0,
        }
    }

    #[test]
    fn test_handshake_times_out() {
        let (_dir, state) = open_state();
        let guard = state.lock().unwrap();
        let start = Instant::now();
        let (guard, outcome) =
            signal_and_wait(&state, guard, Target::Resource(0), NotifyEvent::Revoked, 1).unwrap();
        assert_eq!(outcome, HandshakeOutcome::TimedOut);
        assert!(start.elapsed() >= HANDSHAKE_INTERVAL * HANDSHAKE_RETRIES);
        assert!(guard.resources[0].notify.in_flight());
        assert_eq!(state.signals().resources[0].act.value(), 1);
    }

    #[test]
    fn test_handler_confirms_revoke() {
        let (_dir, state) = open_state();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let callback: NotifyCallback = {
            let state = Arc::clone(&state);
            let seen = Arc::clone(&seen);
            Arc::new(move |n: &Notification| {
                seen.lock().unwrap().push(*n);
                state.signals().resources[0].confirm.post().unwrap();
            })
        };
        let handler = HandlerHandle::spawn(
            Arc::clone(&state),
            Weak::<NoHost>::new(),
            7,
            owner_phase(),
            callback,
        )
        .unwrap();

        let guard = state.lock().unwrap();
        let (_guard, outcome) =
            signal_and_wait(&state, guard, Target::Resource(0), NotifyEvent::Revoked, 1).unwrap();
        assert_eq!(outcome, HandshakeOutcome::Confirmed);
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[Notification::Revoked {
                resource_type: ResourceType::VideoDecoder,
                index: 0,
                request_id: RequestId(7),
            }]
        );
        drop(handler);
    }

    #[test]
    fn test_stop_joins_parked_handler() {
        let (_dir, state) = open_state();
        let fired = Arc::new(AtomicBool::new(false));
        let callback: NotifyCallback = {
            let fired = Arc::clone(&fired);
            Arc::new(move |_: &Notification| fired.store(true, Ordering::SeqCst))
        };
        let handler = HandlerHandle::spawn(
            Arc::clone(&state),
            Weak::<NoHost>::new(),
            3,
            owner_phase(),
            callback,
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while !handler.flags.waiting.load(Ordering::SeqCst) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        handler.stop(&state);
        assert!(!fired.load(Ordering::SeqCst));
        assert_eq!(state.signals().resources[0].act.value(), 0);
    }

    #[test]
    fn test_stop_wakes_grant_handler() {
        let (_dir, state) = open_state();
        let handler = HandlerHandle::spawn(
            Arc::clone(&state),
            Weak::<NoHost>::new(),
            4,
            Phase::Pending { node: 5 },
            Arc::new(|_: &Notification| {}),
        )
        .unwrap();
        let watch = handler.watch();

        let deadline = Instant::now() + Duration::from_secs(2);
        while !handler.flags.waiting.load(Ordering::SeqCst) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        handler.stop(&state);
        assert!(watch.exited());
        assert_eq!(state.signals().nodes[5].act.value(), 0);
        assert_eq!(state.signals().resources[0].act.value(), 0);
    }

    #[test]
    fn test_target_encoding() {
        for target in [Target::Resource(0), Target::Resource(15), Target::Node(47)] {
            assert_eq!(Target::decode(target.encode()), Some(target));
        }
        assert_eq!(Target::decode(0), None);
    }
}
