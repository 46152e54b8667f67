//! Shared segment layout.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │ StateTable (lock-protected, plain integers, no padding)        │
//! │ ┌────────────────────────────────────────────────────────────┐ │
//! │ │ SegmentHeader (64 bytes)                                   │ │
//! │ │ magic │ format_version │ length │ content_version │ checksum│ │
//! │ │ next_request_id │ resource_count │ pool_size │ free_head … │ │
//! │ ├────────────────────────────────────────────────────────────┤ │
//! │ │ ResourceRecord[MAX_RESOURCES]    (checksummed)             │ │
//! │ ├────────────────────────────────────────────────────────────┤ │
//! │ │ QueueNode[MAX_QUEUE_NODES]       (free pool + pending lists)│ │
//! │ └────────────────────────────────────────────────────────────┘ │
//! ├──────────────── 64-byte aligned ───────────────────────────────┤
//! │ SignalTable (futex words, touched without the lock)            │
//! │ request │ act/confirm per record │ act/confirm per node         │
//! ├────────────────────────────────────────────────────────────────┤
//! │ reserved up to SEGMENT_SIZE                                    │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Links between nodes are indices into the node array, never pointers;
//! every process maps the segment at its own address.

use crate::caps::{Capabilities, RequestedUsage, ResourceCaps, ResourceType, Usage};
use crate::memory::ShmSemaphore;

/// Magic number identifying an initialized segment ("ESRM").
pub const SEGMENT_MAGIC: u32 = 0x4553_524D;

/// Current layout version. A mismatch resets the segment.
pub const FORMAT_VERSION: u32 = 1;

/// Capacity of the resource table.
pub const MAX_RESOURCES: usize = 16;

/// Capacity of the pending-request node pool.
pub const MAX_QUEUE_NODES: usize = 3 * MAX_RESOURCES;

/// Total size of the mapped segment.
pub const SEGMENT_SIZE: usize = MAX_RESOURCES * 1024;

/// "No index" sentinel for links and heads.
pub const NO_INDEX: i32 = -1;

/// Offset of the [`SignalTable`] from the start of the segment.
pub const SIGNAL_OFFSET: usize = (std::mem::size_of::<StateTable>() + 63) & !63;

const _: () = assert!(SIGNAL_OFFSET + std::mem::size_of::<SignalTable>() <= SEGMENT_SIZE);
const _: () = assert!(std::mem::size_of::<SegmentHeader>() == 64);

/// Segment header.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SegmentHeader {
    /// [`SEGMENT_MAGIC`] once initialized.
    pub magic: u32,
    /// [`FORMAT_VERSION`].
    pub format_version: u32,
    /// Segment length in bytes.
    pub length: u32,
    /// Bumped on every committed mutation.
    pub content_version: u32,
    /// CRC-32 of the resource table.
    pub checksum: u32,
    /// Next request id to hand out.
    pub next_request_id: i32,
    /// Number of configured resource records.
    pub resource_count: u32,
    /// Number of usable queue nodes (3x `resource_count`).
    pub pool_size: u32,
    /// Head of the free node list.
    pub free_head: i32,
    /// Process currently holding the request semaphore (0 = none).
    pub request_holder: i32,
    /// Bumped every time the table is (re)initialized.
    pub generation: u32,
    /// Reserved for future use.
    pub reserved: [u32; 5],
}

/// Phase of a notification context.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NotifyPhase {
    /// No handler is registered.
    #[default]
    Idle = 0,
    /// A handler is blocked on the context's `act` semaphore.
    Armed = 1,
    /// An initiator posted `act` and is waiting for `confirm`.
    AwaitingAck = 2,
}

impl NotifyPhase {
    fn from_u32(v: u32) -> Self {
        match v {
            1 => NotifyPhase::Armed,
            2 => NotifyPhase::AwaitingAck,
            _ => NotifyPhase::Idle,
        }
    }
}

/// Event delivered through a notification context.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NotifyEvent {
    /// Nothing pending.
    #[default]
    None = 0,
    /// A pending request is being handed a resource.
    Granted = 1,
    /// An owner is being asked to give its resource up.
    Revoked = 2,
}

/// Shared half of a notification context.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct NotifyState {
    phase: u32,
    event: u32,
    /// Set while a handler wants to be told about `event`.
    pub need_notification: u32,
    /// Set while an initiator waits for `confirm`.
    pub need_confirm: u32,
    /// Process that started the in-flight handshake.
    pub initiator: i32,
}

impl NotifyState {
    /// Current phase.
    pub fn phase(&self) -> NotifyPhase {
        NotifyPhase::from_u32(self.phase)
    }

    /// Event of the in-flight handshake.
    pub fn event(&self) -> NotifyEvent {
        match self.event {
            1 => NotifyEvent::Granted,
            2 => NotifyEvent::Revoked,
            _ => NotifyEvent::None,
        }
    }

    /// A handler is now waiting on this context.
    pub fn arm(&mut self) {
        self.phase = NotifyPhase::Armed as u32;
        self.event = NotifyEvent::None as u32;
        self.need_notification = 1;
        self.need_confirm = 0;
        self.initiator = 0;
    }

    /// Process `initiator` is about to post `act` for `event`.
    pub fn begin_handshake(&mut self, event: NotifyEvent, initiator: i32) {
        self.phase = NotifyPhase::AwaitingAck as u32;
        self.event = event as u32;
        self.need_confirm = 1;
        self.initiator = initiator;
    }

    /// Back to idle.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Whether a handshake is in flight.
    pub fn in_flight(&self) -> bool {
        self.phase() == NotifyPhase::AwaitingAck
    }
}

/// The pointer-free part of a request, as stored in shared memory.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SharedRequest {
    /// Request id.
    pub request_id: i32,
    /// [`ResourceType`] discriminant.
    pub kind: u32,
    /// [`Usage`] bits.
    pub usage: u32,
    /// Largest width the requester will use.
    pub max_width: i32,
    /// Largest height the requester will use.
    pub max_height: i32,
    /// Requested priority.
    pub priority: i32,
    /// Nonzero if the request may wait in a pending queue.
    pub async_allowed: u32,
}

impl SharedRequest {
    /// Usage profile carried by the request.
    pub fn requested_usage(&self) -> RequestedUsage {
        RequestedUsage {
            usage: Usage::from_bits_truncate(self.usage),
            max_width: self.max_width,
            max_height: self.max_height,
        }
    }
}

/// One resource instance.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceRecord {
    /// [`ResourceType`] discriminant.
    pub kind: u32,
    /// [`Capabilities`] bits.
    pub caps: u32,
    /// Resolution ceiling width (0 = none).
    pub max_width: i32,
    /// Resolution ceiling height (0 = none).
    pub max_height: i32,
    /// Owning process (0 = unowned).
    pub owner_pid: i32,
    /// Request id of the ownership.
    pub request_id: i32,
    /// Owner's priority.
    pub priority: i32,
    /// Owner's usage bits.
    pub usage: u32,
    /// Owner's requested width.
    pub req_max_width: i32,
    /// Owner's requested height.
    pub req_max_height: i32,
    /// First node of the pending list ([`NO_INDEX`] = empty).
    pub pending_head: i32,
    /// Revocation context of the current ownership.
    pub notify: NotifyState,
}

impl ResourceRecord {
    /// Kind of this record, `None` if the stored value is garbage.
    pub fn resource_type(&self) -> Option<ResourceType> {
        ResourceType::from_u32(self.kind)
    }

    /// Capabilities of this record.
    pub fn resource_caps(&self) -> ResourceCaps {
        ResourceCaps {
            capabilities: Capabilities::from_bits_truncate(self.caps),
            max_width: self.max_width,
            max_height: self.max_height,
        }
    }

    /// Whether a process owns this record.
    #[inline]
    pub fn is_owned(&self) -> bool {
        self.owner_pid != 0
    }

    /// The owner's usage profile.
    pub fn owner_usage(&self) -> RequestedUsage {
        RequestedUsage {
            usage: Usage::from_bits_truncate(self.usage),
            max_width: self.req_max_width,
            max_height: self.req_max_height,
        }
    }

    /// Record `pid` as owner for `request`. The notification context is untouched.
    pub fn assign(&mut self, pid: i32, request: &SharedRequest) {
        self.owner_pid = pid;
        self.request_id = request.request_id;
        self.priority = request.priority;
        self.usage = request.usage;
        self.req_max_width = request.max_width;
        self.req_max_height = request.max_height;
    }

    /// Clear every ownership field.
    pub fn clear_owner(&mut self) {
        self.owner_pid = 0;
        self.request_id = 0;
        self.priority = 0;
        self.usage = 0;
        self.req_max_width = 0;
        self.req_max_height = 0;
    }
}

/// A pending-queue node.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueNode {
    /// This node's own index.
    pub index: i32,
    /// Next node in the free list or pending list.
    pub next: i32,
    /// Previous node in the pending list (unused in the free list).
    pub prev: i32,
    /// Record whose pending list holds this node ([`NO_INDEX`] = free).
    pub resource: i32,
    /// Requesting process.
    pub pid: i32,
    /// Requester priority, cached for ordering.
    pub priority: i32,
    /// The original request.
    pub request: SharedRequest,
    /// Grant context of this pending request.
    pub notify: NotifyState,
}

impl QueueNode {
    /// Whether this node sits in a pending list.
    pub fn is_queued(&self) -> bool {
        self.resource != NO_INDEX
    }
}

/// Everything the segment lock protects.
#[repr(C)]
pub struct StateTable {
    /// Header.
    pub header: SegmentHeader,
    /// Resource records; the first `header.resource_count` are live.
    pub resources: [ResourceRecord; MAX_RESOURCES],
    /// Node pool; the first `header.pool_size` are usable.
    pub nodes: [QueueNode; MAX_QUEUE_NODES],
}

impl StateTable {
    /// Live resource records.
    pub fn live_resources(&self) -> &[ResourceRecord] {
        let n = (self.header.resource_count as usize).min(MAX_RESOURCES);
        &self.resources[..n]
    }

    /// Usable pool size, clamped to the array.
    pub fn pool_size(&self) -> usize {
        (self.header.pool_size as usize).min(MAX_QUEUE_NODES)
    }

    /// Table index of the `index`-th record of `resource_type`.
    pub fn table_index(&self, resource_type: ResourceType, index: usize) -> Option<usize> {
        self.live_resources()
            .iter()
            .enumerate()
            .filter(|(_, r)| r.kind == resource_type as u32)
            .nth(index)
            .map(|(i, _)| i)
    }

    /// Position of table record `table_idx` among records of its own kind.
    pub fn local_index(&self, table_idx: usize) -> usize {
        let kind = self.resources[table_idx].kind;
        self.resources[..table_idx]
            .iter()
            .filter(|r| r.kind == kind)
            .count()
    }

    /// Table indices of every live record of `resource_type`.
    pub fn indices_of(&self, resource_type: ResourceType) -> Vec<usize> {
        self.live_resources()
            .iter()
            .enumerate()
            .filter(|(_, r)| r.kind == resource_type as u32)
            .map(|(i, _)| i)
            .collect()
    }

    /// Record owning `request_id`, if any.
    pub fn find_owner(&self, request_id: i32) -> Option<usize> {
        if request_id == 0 {
            return None;
        }
        self.live_resources()
            .iter()
            .position(|r| r.is_owned() && r.request_id == request_id)
    }

    /// Allocate the next request id.
    pub fn next_request_id(&mut self) -> i32 {
        let id = self.header.next_request_id.max(1);
        self.header.next_request_id = id.checked_add(1).unwrap_or(1);
        id
    }
}

/// `act`/`confirm` pair of one notification context.
#[repr(C)]
#[derive(Debug, Default)]
pub struct NotifySems {
    /// Wakes the handler.
    pub act: ShmSemaphore,
    /// Wakes the initiator.
    pub confirm: ShmSemaphore,
}

impl NotifySems {
    /// Zero both counts.
    pub fn reset(&self) {
        self.act.reset(0);
        self.confirm.reset(0);
    }
}

/// Semaphores; accessed without the segment lock.
#[repr(C)]
#[derive(Debug)]
pub struct SignalTable {
    /// Serializes the request path across processes (initial count 1).
    pub request: ShmSemaphore,
    /// One context per resource record.
    pub resources: [NotifySems; MAX_RESOURCES],
    /// One context per queue node.
    pub nodes: [NotifySems; MAX_QUEUE_NODES],
}

impl SignalTable {
    /// Re-create every semaphore with its initial count.
    pub fn reset(&self) {
        self.request.reset(1);
        for sems in self.resources.iter().chain(self.nodes.iter()) {
            sems.reset();
        }
    }
}
