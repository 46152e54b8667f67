//! The resource manager handle.
//!
//! Every public call takes the segment lock once, validates, does its work
//! and releases. The only exception is a handshake, which drops the lock
//! while it waits for the other party.
//!
//! Callbacks never enter shared memory. Each handle keeps a registry from
//! request id to callback and notification handler; shared memory only
//! carries the plain fields of a request.
//!
//! Lock order: segment lock, then the registry mutex.

use crate::caps::{RequestedUsage, ResourceCaps, ResourceType};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::handshake::{
    Adoption, GrantHost, HandlerHandle, HandshakeOutcome, Phase, Target, signal_and_wait,
};
use crate::memory::{SharedSegment, ShmSemaphore};
use crate::select::{OwnerView, ResourceView, SelectRequest, select};
use crate::state::{NotifyEvent, ResourceRecord, SharedRequest, SharedState, StateGuard};
use std::collections::HashMap;
use std::fmt::{self, Write as _};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

/// How long a request waits on the request permit before revalidating.
const PERMIT_POLL: Duration = Duration::from_millis(100);

/// Revoke attempts before a preempting request gives up on a record.
const PREEMPT_ATTEMPTS: usize = 3;

/// Application callback for grants and revocations.
///
/// Runs on a notification thread of the manager, never while the segment
/// lock is held. It may call back into the manager.
pub type NotifyCallback = Arc<dyn Fn(&Notification) + Send + Sync>;

/// Opaque request handle, unique for the lifetime of the segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub(crate) i32);

impl RequestId {
    /// The raw id as stored in shared memory.
    pub fn as_raw(self) -> i32 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Event delivered to a [`NotifyCallback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    /// A pending request now owns `index`.
    Granted {
        /// Kind of the resource.
        resource_type: ResourceType,
        /// Index among resources of that kind.
        index: usize,
        /// The request that was granted.
        request_id: RequestId,
    },
    /// The owner of `index` must release it.
    Revoked {
        /// Kind of the resource.
        resource_type: ResourceType,
        /// Index among resources of that kind.
        index: usize,
        /// The ownership being revoked.
        request_id: RequestId,
    },
}

impl Notification {
    /// Kind of the resource concerned.
    pub fn resource_type(&self) -> ResourceType {
        match self {
            Notification::Granted { resource_type, .. }
            | Notification::Revoked { resource_type, .. } => *resource_type,
        }
    }

    /// Index of the resource concerned.
    pub fn index(&self) -> usize {
        match self {
            Notification::Granted { index, .. } | Notification::Revoked { index, .. } => *index,
        }
    }

    /// Request concerned.
    pub fn request_id(&self) -> RequestId {
        match self {
            Notification::Granted { request_id, .. }
            | Notification::Revoked { request_id, .. } => *request_id,
        }
    }
}

/// A request for one resource instance.
#[derive(Clone)]
pub struct ResourceRequest {
    /// Kind of resource wanted.
    pub resource_type: ResourceType,
    /// Usage profile and frame size.
    pub usage: RequestedUsage,
    /// Priority (larger = more important).
    pub priority: i32,
    /// Whether the request may wait in a pending queue.
    pub async_allowed: bool,
    /// Receives grants and revocations. Required.
    pub callback: Option<NotifyCallback>,
}

impl ResourceRequest {
    /// A synchronous request without a callback.
    pub fn new(resource_type: ResourceType, usage: RequestedUsage, priority: i32) -> Self {
        Self {
            resource_type,
            usage,
            priority,
            async_allowed: false,
            callback: None,
        }
    }

    /// Allow or forbid queueing.
    pub fn with_async(mut self, async_allowed: bool) -> Self {
        self.async_allowed = async_allowed;
        self
    }

    /// Set the notification callback.
    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
        self
    }
}

impl fmt::Debug for ResourceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceRequest")
            .field("resource_type", &self.resource_type)
            .field("usage", &self.usage)
            .field("priority", &self.priority)
            .field("async_allowed", &self.async_allowed)
            .field("callback", &self.callback.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// Where a successful request landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantOutcome {
    /// The caller owns this index now.
    Assigned(usize),
    /// Queued; a [`Notification::Granted`] follows when it is handed over.
    Pending,
}

/// Result of [`ResourceManager::request_resource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grant {
    /// Handle for later priority, usage and cancel calls.
    pub request_id: RequestId,
    /// Assigned index or pending.
    pub outcome: GrantOutcome,
}

/// Owner of a resource as seen by a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceOwner {
    /// Owning process, 0 when unowned.
    pub pid: i32,
    /// Owner priority, 0 when unowned.
    pub priority: i32,
}

impl ResourceOwner {
    /// Whether anyone owns the resource.
    pub fn is_owned(&self) -> bool {
        self.pid != 0
    }
}

/// Overrides for [`ResourceManager::open_with`].
#[derive(Debug, Clone, Default)]
pub struct Settings {
    /// Segment file; defaults to `${XDG_RUNTIME_DIR}/essrmgr`.
    pub segment_path: Option<PathBuf>,
    /// Resource table used on (re)initialization; defaults to [`Config::load`].
    pub config: Option<Config>,
}

/// The plain fields of a request.
#[derive(Debug, Clone, Copy)]
struct Ask {
    resource_type: ResourceType,
    usage: RequestedUsage,
    priority: i32,
    async_allowed: bool,
}

impl Ask {
    fn shared(&self, request_id: i32) -> SharedRequest {
        SharedRequest {
            request_id,
            kind: self.resource_type as u32,
            usage: self.usage.usage.bits(),
            max_width: self.usage.max_width,
            max_height: self.usage.max_height,
            priority: self.priority,
            async_allowed: u32::from(self.async_allowed),
        }
    }
}

enum Placement {
    Granted(Grant),
    Denied(String),
}

struct Registration {
    resource_type: ResourceType,
    callback: NotifyCallback,
    handler: Option<HandlerHandle>,
}

/// Held request semaphore; posted back on drop.
struct RequestPermit<'a> {
    sem: &'a ShmSemaphore,
}

impl Drop for RequestPermit<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.sem.post() {
            tracing::warn!("failed to return request permit: {}", e);
        }
    }
}

struct Inner {
    state: Arc<SharedState>,
    pid: i32,
    registry: Mutex<HashMap<i32, Registration>>,
    /// Table generation the registry belongs to.
    generation: AtomicU32,
    me: Weak<Inner>,
}

/// Handle to the shared resource table.
///
/// Cloning is cheap; clones share registrations. Dropping the last clone
/// releases everything this handle still owns and cancels what it has
/// queued.
///
/// # Example
///
/// ```rust,no_run
/// use resmgr::prelude::*;
///
/// let manager = ResourceManager::open()?;
/// let request = ResourceRequest::new(
///     ResourceType::VideoDecoder,
///     RequestedUsage::new(Usage::all()),
///     5,
/// )
/// .with_async(true)
/// .with_callback(|n| println!("{n:?}"));
///
/// let grant = manager.request_resource(ResourceType::VideoDecoder, request)?;
/// if let GrantOutcome::Assigned(index) = grant.outcome {
///     manager.release_resource(ResourceType::VideoDecoder, index)?;
/// }
/// # Ok::<(), resmgr::Error>(())
/// ```
#[derive(Clone)]
pub struct ResourceManager {
    inner: Arc<Inner>,
}

impl ResourceManager {
    /// Open the default segment with the config from the environment.
    pub fn open() -> Result<Self> {
        Self::open_with(Settings::default())
    }

    /// Open with explicit overrides.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SegmentUnavailable`] if the segment path cannot be
    /// resolved, created or mapped.
    pub fn open_with(settings: Settings) -> Result<Self> {
        let path = match settings.segment_path {
            Some(path) => path,
            None => SharedSegment::default_path()?,
        };
        let config = settings.config.unwrap_or_else(Config::load);
        let state = Arc::new(SharedState::open(&path, config)?);
        let generation = state.lock()?.header.generation;
        tracing::debug!("opened resource manager on {}", path.display());

        let inner = Arc::new_cyclic(|me| Inner {
            state,
            pid: std::process::id() as i32,
            registry: Mutex::new(HashMap::new()),
            generation: AtomicU32::new(generation),
            me: me.clone(),
        });
        Ok(Self { inner })
    }

    /// Release and cancel everything this handle holds.
    pub fn close(self) {
        self.inner.shutdown();
    }

    /// Number of configured instances of `resource_type`.
    pub fn resource_count(&self, resource_type: ResourceType) -> Result<usize> {
        let guard = self.inner.lock()?;
        Ok(guard.indices_of(resource_type).len())
    }

    /// Current owner of an instance.
    pub fn resource_owner(&self, resource_type: ResourceType, index: usize) -> Result<ResourceOwner> {
        let guard = self.inner.lock()?;
        let record = &guard.resources[table_index(&guard, resource_type, index)?];
        Ok(if record.is_owned() {
            ResourceOwner {
                pid: record.owner_pid,
                priority: record.priority,
            }
        } else {
            ResourceOwner::default()
        })
    }

    /// Capabilities of an instance.
    pub fn resource_caps(&self, resource_type: ResourceType, index: usize) -> Result<ResourceCaps> {
        let guard = self.inner.lock()?;
        let t = table_index(&guard, resource_type, index)?;
        Ok(guard.resources[t].resource_caps())
    }

    /// Ask for an instance of `resource_type`.
    ///
    /// The request is assigned immediately (preempting a lower-priority
    /// owner if needed), queued when `async_allowed` is set and an instance
    /// could become available, or denied.
    ///
    /// # Errors
    ///
    /// - [`Error::TypeMismatch`] if `request.resource_type` differs
    /// - [`Error::NoCallback`] without a callback
    /// - [`Error::Denied`] when nothing can be assigned or queued
    pub fn request_resource(
        &self,
        resource_type: ResourceType,
        request: ResourceRequest,
    ) -> Result<Grant> {
        if request.resource_type != resource_type {
            tracing::warn!(
                "request for {} passed to a {} call",
                request.resource_type,
                resource_type
            );
            return Err(Error::TypeMismatch {
                expected: resource_type,
                actual: request.resource_type,
            });
        }
        let Some(callback) = request.callback else {
            tracing::warn!("{} request without a callback", resource_type);
            return Err(Error::NoCallback);
        };
        let ask = Ask {
            resource_type,
            usage: request.usage,
            priority: request.priority,
            async_allowed: request.async_allowed,
        };
        self.inner.request(ask, callback, None)
    }

    /// Give up an owned instance.
    ///
    /// Releasing an instance this handle does not own is logged and ignored.
    /// The instance goes to the head of its pending queue, if any.
    pub fn release_resource(&self, resource_type: ResourceType, index: usize) -> Result<()> {
        let inner = &self.inner;
        let guard = inner.lock()?;
        let t = table_index(&guard, resource_type, index)?;
        let record = guard.resources[t];
        if !record.is_owned() {
            tracing::debug!("release of unowned {} {}", resource_type, index);
            return Ok(());
        }
        if record.owner_pid != inner.pid || !inner.registry().contains_key(&record.request_id) {
            tracing::warn!(
                "release of {} {} owned by pid {} rejected",
                resource_type,
                index,
                record.owner_pid
            );
            return Ok(());
        }
        drop(inner.release_locked(guard, t)?);
        Ok(())
    }

    /// Change the priority of an ownership or pending request.
    ///
    /// An owner is never preempted by its own priority change. A pending
    /// request that reaches its resource's owner priority has the owner
    /// revoked in its favour.
    pub fn set_priority(&self, resource_type: ResourceType, id: RequestId, priority: i32) -> Result<()> {
        self.inner.set_priority(resource_type, id.0, priority)
    }

    /// Change the usage of an ownership or pending request.
    ///
    /// An owner whose resource no longer fits is revoked; so is an owner
    /// whose resource would be an exact match for the first pending request
    /// but not for itself. A pending request is requeued as a fresh request
    /// under the same id.
    pub fn set_usage(&self, resource_type: ResourceType, id: RequestId, usage: RequestedUsage) -> Result<()> {
        self.inner.set_usage(resource_type, id.0, usage)
    }

    /// Release an ownership or withdraw a pending request. Unknown ids are ignored.
    pub fn cancel(&self, resource_type: ResourceType, id: RequestId) -> Result<()> {
        let guard = self.inner.lock()?;
        drop(self.inner.cancel_locked(guard, id.0, Some(resource_type))?);
        Ok(())
    }

    /// Human-readable snapshot of the shared table.
    pub fn dump_state(&self) -> Result<String> {
        let guard = self.inner.lock()?;
        Ok(render(&guard, self.inner.state.path()))
    }
}

impl fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceManager")
            .field("segment", &self.inner.state.path())
            .field("pid", &self.inner.pid)
            .finish_non_exhaustive()
    }
}

fn table_index(guard: &StateGuard<'_>, resource_type: ResourceType, index: usize) -> Result<usize> {
    guard
        .table_index(resource_type, index)
        .ok_or(Error::InvalidIndex {
            resource_type,
            index,
        })
}

/// A record in the middle of a handshake, or one that is being handed to
/// a pending request.
fn busy(guard: &StateGuard<'_>, t: usize) -> bool {
    guard.resources[t].notify.in_flight()
        || guard
            .pending(t)
            .any(|n| guard.nodes[n].notify.in_flight())
}

fn view(guard: &StateGuard<'_>, t: usize) -> ResourceView {
    let record: &ResourceRecord = &guard.resources[t];
    let busy = busy(guard, t);
    let owner = (busy || record.is_owned()).then(|| OwnerView {
        priority: record.priority,
        usage: record.owner_usage(),
        busy,
    });
    ResourceView {
        caps: record.resource_caps(),
        owner,
    }
}

impl Inner {
    fn registry(&self) -> MutexGuard<'_, HashMap<i32, Registration>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, request_id: i32, registration: Registration) {
        let replaced = self.registry().insert(request_id, registration);
        if let Some(handler) = replaced.and_then(|r| r.handler) {
            handler.stop(&self.state);
        }
    }

    /// Drop every registration if the table was rebuilt since we last looked.
    fn check_generation(&self, guard: &StateGuard<'_>) {
        let current = guard.header.generation;
        if self.generation.swap(current, Ordering::SeqCst) == current {
            return;
        }
        let stale: Vec<Registration> = self.registry().drain().map(|(_, r)| r).collect();
        if !stale.is_empty() {
            tracing::info!("segment was reset, dropping {} registrations", stale.len());
        }
        for handler in stale.into_iter().filter_map(|r| r.handler) {
            handler.stop(&self.state);
        }
    }

    /// Lock the segment. Any free record with a waiting request, such as one
    /// that validation just took back from a dead owner, is handed to the
    /// head of its queue first.
    fn lock(&self) -> Result<StateGuard<'_>> {
        let mut guard = self.state.lock()?;
        self.check_generation(&guard);
        for t in 0..guard.live_resources().len() {
            guard = self.transfer_next(guard, t)?;
        }
        Ok(guard)
    }

    fn acquire_permit(&self) -> Result<RequestPermit<'_>> {
        let sem = &self.state.signals().request;
        loop {
            if sem.wait_timeout(PERMIT_POLL)? {
                return Ok(RequestPermit { sem });
            }
            // Validation gives back a permit held by a dead process.
            drop(self.lock()?);
        }
    }

    fn request(&self, ask: Ask, callback: NotifyCallback, reuse: Option<i32>) -> Result<Grant> {
        let permit = self.acquire_permit()?;
        let mut guard = self.lock()?;
        if guard.report().reset {
            // The reset handed out a fresh permit while we hold the old one.
            permit.sem.try_wait();
        }
        guard.header.request_holder = self.pid;
        let id = match reuse {
            Some(id) => id,
            None => guard.next_request_id(),
        };

        match self.place(guard, ask, ask.shared(id), callback) {
            Ok((mut guard, placement)) => {
                guard.header.request_holder = 0;
                match placement {
                    Placement::Granted(grant) => Ok(grant),
                    Placement::Denied(reason) => {
                        tracing::debug!("request {} denied: {}", id, reason);
                        Err(Error::Denied(reason))
                    }
                }
            }
            Err(e) => {
                if let Ok(mut guard) = self.state.lock() {
                    guard.header.request_holder = 0;
                }
                Err(e)
            }
        }
    }

    fn place<'a>(
        &'a self,
        guard: StateGuard<'a>,
        ask: Ask,
        shared: SharedRequest,
        callback: NotifyCallback,
    ) -> Result<(StateGuard<'a>, Placement)> {
        let candidates = guard.indices_of(ask.resource_type);
        if candidates.is_empty() {
            let reason = format!("no {} configured", ask.resource_type);
            return Ok((guard, Placement::Denied(reason)));
        }
        let views: Vec<ResourceView> = candidates.iter().map(|&t| view(&guard, t)).collect();
        let selection = select(
            &SelectRequest {
                priority: ask.priority,
                usage: ask.usage,
            },
            &views,
        );

        if let Some(pos) = selection.assigned {
            return self.assign(guard, candidates[pos], ask, shared, callback);
        }
        if let Some(pos) = selection.pending {
            if ask.async_allowed {
                return self.enqueue(guard, candidates[pos], ask, shared, callback);
            }
        }
        let reason = format!("no {} available at priority {}", ask.resource_type, ask.priority);
        Ok((guard, Placement::Denied(reason)))
    }

    fn assign<'a>(
        &'a self,
        mut guard: StateGuard<'a>,
        t: usize,
        ask: Ask,
        shared: SharedRequest,
        callback: NotifyCallback,
    ) -> Result<(StateGuard<'a>, Placement)> {
        for _ in 0..PREEMPT_ATTEMPTS {
            let record = &guard.resources[t];
            if !record.is_owned() || busy(&guard, t) {
                break;
            }
            let old = record.request_id;
            tracing::debug!(
                "request {} preempting request {} (priority {} over {})",
                shared.request_id,
                old,
                shared.priority,
                record.priority
            );
            let (g, outcome) =
                signal_and_wait(&self.state, guard, Target::Resource(t), NotifyEvent::Revoked, self.pid)?;
            guard = g;
            let record = &mut guard.resources[t];
            if record.is_owned() && record.request_id == old {
                if outcome == HandshakeOutcome::Confirmed {
                    tracing::debug!("request {} confirmed without releasing", old);
                }
                record.clear_owner();
                self.forget(old);
            }
            record.notify.reset();
        }

        if guard.resources[t].is_owned() || busy(&guard, t) {
            let reason = format!("{} {} is busy", ask.resource_type, guard.local_index(t));
            return Ok((guard, Placement::Denied(reason)));
        }

        let index = guard.local_index(t);
        let record = &mut guard.resources[t];
        record.assign(self.pid, &shared);
        record.notify.arm();
        self.state.signals().resources[t].reset();

        let phase = Phase::Owner {
            record: t,
            resource_type: ask.resource_type,
            index,
        };
        let handler = match HandlerHandle::spawn(
            Arc::clone(&self.state),
            self.me.clone(),
            shared.request_id,
            phase,
            Arc::clone(&callback),
        ) {
            Ok(handler) => handler,
            Err(e) => {
                let record = &mut guard.resources[t];
                record.clear_owner();
                record.notify.reset();
                return Err(e);
            }
        };
        self.register(
            shared.request_id,
            Registration {
                resource_type: ask.resource_type,
                callback,
                handler: Some(handler),
            },
        );

        tracing::debug!(
            "request {} assigned {} {} (pid {}, priority {})",
            shared.request_id,
            ask.resource_type,
            index,
            self.pid,
            shared.priority
        );
        let grant = Grant {
            request_id: RequestId(shared.request_id),
            outcome: GrantOutcome::Assigned(index),
        };
        Ok((guard, Placement::Granted(grant)))
    }

    fn enqueue<'a>(
        &'a self,
        mut guard: StateGuard<'a>,
        t: usize,
        ask: Ask,
        shared: SharedRequest,
        callback: NotifyCallback,
    ) -> Result<(StateGuard<'a>, Placement)> {
        let Some(n) = guard.alloc_node() else {
            return Ok((guard, Placement::Denied("pending pool exhausted".into())));
        };
        let node = &mut guard.nodes[n];
        node.pid = self.pid;
        node.priority = shared.priority;
        node.request = shared;
        node.notify.arm();
        self.state.signals().nodes[n].act.reset(0);
        guard.enqueue(t, n);

        let handler = match HandlerHandle::spawn(
            Arc::clone(&self.state),
            self.me.clone(),
            shared.request_id,
            Phase::Pending { node: n },
            Arc::clone(&callback),
        ) {
            Ok(handler) => handler,
            Err(e) => {
                guard.dequeue(n);
                guard.free_node(n);
                return Err(e);
            }
        };
        self.register(
            shared.request_id,
            Registration {
                resource_type: ask.resource_type,
                callback,
                handler: Some(handler),
            },
        );

        tracing::debug!(
            "request {} queued on {} {} at priority {}",
            shared.request_id,
            ask.resource_type,
            guard.local_index(t),
            shared.priority
        );
        let grant = Grant {
            request_id: RequestId(shared.request_id),
            outcome: GrantOutcome::Pending,
        };
        Ok((guard, Placement::Granted(grant)))
    }

    /// Drop a registration whose ownership was taken away without a release.
    fn forget(&self, request_id: i32) {
        let registration = self.registry().remove(&request_id);
        if let Some(handler) = registration.and_then(|r| r.handler) {
            handler.stop(&self.state);
        }
    }

    /// Clear an ownership held by this handle.
    fn release_locked<'a>(&'a self, mut guard: StateGuard<'a>, t: usize) -> Result<StateGuard<'a>> {
        let signals = self.state.signals();
        let id = guard.resources[t].request_id;
        let registration = self.registry().remove(&id);
        let handler = registration.and_then(|r| r.handler);

        if guard.resources[t].notify.in_flight() {
            // Being revoked: the initiator takes the record once confirmed.
            let record = &mut guard.resources[t];
            record.clear_owner();
            record.notify.need_confirm = 0;
            if let Some(handler) = handler {
                handler.stop(&self.state);
            }
            signals.resources[t].confirm.post()?;
            tracing::debug!("request {} released under revoke", id);
            return Ok(guard);
        }

        let record = &mut guard.resources[t];
        record.clear_owner();
        record.notify.reset();
        if let Some(handler) = handler {
            handler.stop(&self.state);
        }
        tracing::debug!("request {} released", id);
        self.transfer_next(guard, t)
    }

    /// Hand a free record to the first pending request that is not already
    /// being granted something.
    fn transfer_next<'a>(&'a self, mut guard: StateGuard<'a>, t: usize) -> Result<StateGuard<'a>> {
        if guard.resources[t].is_owned() || busy(&guard, t) {
            return Ok(guard);
        }
        let Some(n) = guard.first_waiting(t) else {
            return Ok(guard);
        };
        let node = guard.nodes[n];
        guard.resources[t].assign(node.pid, &node.request);
        tracing::debug!(
            "transferring resource {} to request {} (pid {})",
            t,
            node.request.request_id,
            node.pid
        );

        let (mut guard, _) =
            signal_and_wait(&self.state, guard, Target::Node(n), NotifyEvent::Granted, self.pid)?;

        let still_queued = {
            let current = &guard.nodes[n];
            current.is_queued()
                && current.resource == t as i32
                && current.request.request_id == node.request.request_id
        };
        if still_queued {
            guard.dequeue(n);
            guard.free_node(n);
        }
        Ok(guard)
    }

    /// Revoke the owner of `t`, then hand `t` to its pending queue.
    fn revoke_and_transfer<'a>(&'a self, guard: StateGuard<'a>, t: usize) -> Result<StateGuard<'a>> {
        let old = guard.resources[t].request_id;
        let (mut guard, _) =
            signal_and_wait(&self.state, guard, Target::Resource(t), NotifyEvent::Revoked, self.pid)?;
        let record = &mut guard.resources[t];
        if record.is_owned() && record.request_id == old {
            record.clear_owner();
            self.forget(old);
        }
        record.notify.reset();
        self.state.signals().resources[t].reset();
        self.transfer_next(guard, t)
    }

    fn owned_by_me(&self, guard: &StateGuard<'_>, id: i32, ty: Option<ResourceType>) -> Option<usize> {
        guard.find_owner(id).filter(|&t| {
            let record = &guard.resources[t];
            record.owner_pid == self.pid && ty.is_none_or(|ty| record.kind == ty as u32)
        })
    }

    fn queued_by_me(&self, guard: &StateGuard<'_>, id: i32, ty: Option<ResourceType>) -> Option<usize> {
        guard.find_pending(id).filter(|&n| {
            let node = &guard.nodes[n];
            node.pid == self.pid && ty.is_none_or(|ty| node.request.kind == ty as u32)
        })
    }

    fn set_priority(&self, ty: ResourceType, id: i32, priority: i32) -> Result<()> {
        let mut guard = self.lock()?;
        if !self.registry().contains_key(&id) {
            tracing::warn!("set_priority on unknown request {}", id);
            return Err(Error::UnknownRequest(RequestId(id)));
        }

        if let Some(t) = self.owned_by_me(&guard, id, Some(ty)) {
            guard.resources[t].priority = priority;
            tracing::debug!("request {} owner priority now {}", id, priority);
            return Ok(());
        }

        let Some(n) = self.queued_by_me(&guard, id, Some(ty)) else {
            tracing::warn!("set_priority on unknown request {}", id);
            return Err(Error::UnknownRequest(RequestId(id)));
        };
        let t = guard.nodes[n].resource as usize;
        let granting = guard.nodes[n].notify.in_flight();
        let node = &mut guard.nodes[n];
        node.priority = priority;
        node.request.priority = priority;
        if granting {
            return Ok(());
        }
        guard.dequeue(n);
        guard.enqueue(t, n);
        tracing::debug!("request {} pending priority now {}", id, priority);

        if busy(&guard, t) {
            return Ok(());
        }
        let record = guard.resources[t];
        let guard = if !record.is_owned() {
            self.transfer_next(guard, t)?
        } else if priority >= record.priority {
            tracing::debug!("request {} promoted over request {}", id, record.request_id);
            self.revoke_and_transfer(guard, t)?
        } else {
            guard
        };
        drop(guard);
        Ok(())
    }

    fn set_usage(&self, ty: ResourceType, id: i32, usage: RequestedUsage) -> Result<()> {
        let mut guard = self.lock()?;
        if !self.registry().contains_key(&id) {
            tracing::warn!("set_usage on unknown request {}", id);
            return Err(Error::UnknownRequest(RequestId(id)));
        }

        if let Some(t) = self.owned_by_me(&guard, id, Some(ty)) {
            let record = &mut guard.resources[t];
            record.usage = usage.usage.bits();
            record.req_max_width = usage.max_width;
            record.req_max_height = usage.max_height;
            let caps = record.resource_caps();
            if busy(&guard, t) {
                return Ok(());
            }

            let revoke = if !usage.fits(&caps) {
                tracing::debug!("request {} no longer fits resource {}, revoking", id, t);
                true
            } else {
                guard.first_waiting(t).is_some_and(|head| {
                    let wanted = guard.nodes[head].request.requested_usage();
                    let better = wanted.fits(&caps)
                        && wanted.is_ideal(caps.capabilities)
                        && !usage.is_ideal(caps.capabilities);
                    if better {
                        tracing::debug!(
                            "resource {} suits pending request {} better, revoking {}",
                            t,
                            guard.nodes[head].request.request_id,
                            id
                        );
                    }
                    better
                })
            };
            if revoke {
                drop(self.revoke_and_transfer(guard, t)?);
            }
            return Ok(());
        }

        let Some(n) = self.queued_by_me(&guard, id, Some(ty)) else {
            tracing::warn!("set_usage on unknown request {}", id);
            return Err(Error::UnknownRequest(RequestId(id)));
        };
        if guard.nodes[n].notify.in_flight() {
            return Err(Error::Denied(format!("request {id} is being granted")));
        }

        let request = guard.nodes[n].request;
        let Some(registration) = self.registry().remove(&id) else {
            return Err(Error::UnknownRequest(RequestId(id)));
        };
        if let Some(handler) = registration.handler {
            handler.stop(&self.state);
        }
        guard.dequeue(n);
        guard.free_node(n);
        drop(guard);

        tracing::debug!("request {} requeued with new usage", id);
        let ask = Ask {
            resource_type: registration.resource_type,
            usage,
            priority: request.priority,
            async_allowed: request.async_allowed != 0,
        };
        self.request(ask, registration.callback, Some(id))?;
        Ok(())
    }

    /// Release or withdraw request `id` if this handle holds it.
    fn cancel_locked<'a>(
        &'a self,
        mut guard: StateGuard<'a>,
        id: i32,
        ty: Option<ResourceType>,
    ) -> Result<StateGuard<'a>> {
        if !self.registry().contains_key(&id) {
            tracing::debug!("cancel of unknown request {}", id);
            return Ok(guard);
        }
        if let Some(t) = self.owned_by_me(&guard, id, ty) {
            return self.release_locked(guard, t);
        }
        let Some(n) = self.queued_by_me(&guard, id, ty) else {
            tracing::debug!("cancel of request {} with nothing left in shared state", id);
            self.forget(id);
            return Ok(guard);
        };

        let signals = self.state.signals();
        let t = guard.nodes[n].resource as usize;
        let handler = self.registry().remove(&id).and_then(|r| r.handler);

        if !guard.nodes[n].notify.in_flight() {
            if let Some(handler) = handler {
                handler.stop(&self.state);
            }
            guard.dequeue(n);
            guard.free_node(n);
            tracing::debug!("request {} withdrawn", id);
            return Ok(guard);
        }

        // Cancelled mid-grant: undo the tentative ownership and let the
        // initiator go.
        if guard.resources[t].is_owned() && guard.resources[t].request_id == id {
            guard.resources[t].clear_owner();
        }
        guard.dequeue(n);
        guard.free_node(n);
        if let Some(handler) = handler {
            handler.stop(&self.state);
        }
        signals.nodes[n].confirm.post()?;
        tracing::debug!("request {} withdrawn during grant", id);
        self.transfer_next(guard, t)
    }

    fn shutdown(&self) {
        let ids: Vec<i32> = self.registry().keys().copied().collect();
        if ids.is_empty() {
            return;
        }
        let mut guard = match self.lock() {
            Ok(guard) => guard,
            Err(e) => {
                tracing::warn!("closing manager: {}", e);
                return;
            }
        };
        for id in ids {
            guard = match self.cancel_locked(guard, id, None) {
                Ok(guard) => guard,
                Err(e) => {
                    tracing::warn!("closing manager: request {}: {}", id, e);
                    return;
                }
            };
        }
    }
}

impl GrantHost for Inner {
    fn adopt(&self, node: usize, request_id: i32) -> Result<Adoption> {
        let mut guard = self.state.lock()?;
        self.check_generation(&guard);
        let reclaimed = !guard.report().reclaimed.is_empty();
        let adoption = self.take_over(&mut guard, node, request_id)?;
        drop(guard);

        if reclaimed {
            // Serve the queues of records this validation freed.
            match self.lock() {
                Ok(guard) => drop(guard),
                Err(e) => tracing::warn!("request {}: hand-off after reclaim failed: {}", request_id, e),
            }
        }
        Ok(adoption)
    }
}

impl Inner {
    fn take_over(&self, guard: &mut StateGuard<'_>, node: usize, request_id: i32) -> Result<Adoption> {
        let signals = self.state.signals();
        let queued = guard
            .nodes
            .get(node)
            .is_some_and(|n| n.is_queued() && n.request.request_id == request_id);
        let Some(t) = self.owned_by_me(guard, request_id, None) else {
            return Ok(if queued { Adoption::Waiting } else { Adoption::Gone });
        };
        let Some(resource_type) = self.registry().get(&request_id).map(|r| r.resource_type) else {
            return Ok(Adoption::Gone);
        };

        guard.resources[t].notify.arm();
        signals.resources[t].reset();
        if queued {
            guard.dequeue(node);
            guard.free_node(node);
        }
        signals.nodes[node].confirm.post()?;

        Ok(Adoption::Adopted {
            record: t,
            resource_type,
            index: guard.local_index(t),
        })
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn render(guard: &StateGuard<'_>, path: &std::path::Path) -> String {
    let h = &guard.header;
    let mut out = String::new();
    let _ = writeln!(
        out,
        "segment {} version {} checksum {:#010x} next request {}",
        path.display(),
        h.content_version,
        h.checksum,
        h.next_request_id
    );
    for (t, record) in guard.live_resources().iter().enumerate() {
        let kind = record
            .resource_type()
            .map_or_else(|| format!("kind {}", record.kind), |ty| ty.to_string());
        let caps = record.resource_caps();
        let _ = write!(
            out,
            "{} {} caps {:?} max {}x{}",
            kind,
            guard.local_index(t),
            caps.capabilities,
            caps.max_width,
            caps.max_height
        );
        if record.is_owned() {
            let _ = write!(
                out,
                " owner pid {} request {} priority {} usage {:#x}",
                record.owner_pid, record.request_id, record.priority, record.usage
            );
        } else {
            let _ = write!(out, " free");
        }
        let _ = writeln!(out, " [{:?}]", record.notify.phase());
        for n in guard.pending(t) {
            let node = &guard.nodes[n];
            let _ = writeln!(
                out,
                "  pending request {} pid {} priority {} [{:?}]",
                node.request.request_id,
                node.pid,
                node.priority,
                node.notify.phase()
            );
        }
    }
    let _ = writeln!(out, "free nodes {}/{}", guard.free_count(), guard.pool_size());
    out
}
