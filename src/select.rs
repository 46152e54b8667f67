//! Choosing a resource instance for a request.
//!
//! The selector is a pure function over snapshots of the records of one
//! resource type. It yields either an instance to assign (which may mean
//! preempting its owner) or, failing that, an instance whose pending list the
//! request could wait on.
//!
//! Two passes run: first over the instances that match the request's usage
//! profile exactly, then over every eligible instance. A pass:
//!
//! 1. drops ineligible instances and, for size-limited ones, instances whose
//!    ceiling is below the requested frame size;
//! 2. turns busy instances and instances held at a higher priority, or at the
//!    same priority with the same usage, into pending candidates;
//! 3. ranks what is left: free beats held, a lower owner priority beats a
//!    higher one, and a smaller ceiling beats a larger (or no) ceiling.

use crate::caps::{RequestedUsage, ResourceCaps};
use std::cmp::Ordering;

/// Current holder of an instance, as far as selection cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnerView {
    /// Owner priority.
    pub priority: i32,
    /// Owner usage.
    pub usage: RequestedUsage,
    /// A handshake is running on the instance. It can be waited on but not
    /// assigned, whatever the priorities.
    pub busy: bool,
}

/// Snapshot of one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceView {
    /// Instance capabilities.
    pub caps: ResourceCaps,
    /// `None` when free.
    pub owner: Option<OwnerView>,
}

/// What is being asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectRequest {
    /// Request priority (larger = more important).
    pub priority: i32,
    /// Usage profile and frame size.
    pub usage: RequestedUsage,
}

/// Outcome of [`select`]. Indices are positions in the input slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Selection {
    /// Instance to assign, possibly preempting its owner.
    pub assigned: Option<usize>,
    /// Instance to wait on when nothing can be assigned.
    pub pending: Option<usize>,
}

/// Pick an instance for `request` among `records`.
///
/// # Example
///
/// ```rust
/// use resmgr::caps::{Capabilities, RequestedUsage, ResourceCaps, Usage};
/// use resmgr::select::{ResourceView, SelectRequest, select};
///
/// let records = [
///     ResourceView { caps: ResourceCaps::new(Capabilities::HARDWARE), owner: None },
///     ResourceView {
///         caps: ResourceCaps::limited(Capabilities::HARDWARE, 320, 240),
///         owner: None,
///     },
/// ];
/// let request = SelectRequest {
///     priority: 1,
///     usage: RequestedUsage::new(Usage::empty()).with_max_size(200, 150),
/// };
/// assert_eq!(select(&request, &records).assigned, Some(1));
/// ```
pub fn select(request: &SelectRequest, records: &[ResourceView]) -> Selection {
    let ideal = run_pass(request, records, true);
    if ideal.assigned.is_some() {
        return ideal;
    }
    let full = run_pass(request, records, false);
    Selection {
        assigned: full.assigned,
        pending: ideal.pending.or(full.pending),
    }
}

fn run_pass(request: &SelectRequest, records: &[ResourceView], ideal_only: bool) -> Selection {
    let usage = &request.usage;
    let mut assigned: Option<usize> = None;
    let mut pending: Option<(usize, i32)> = None;

    for (i, record) in records.iter().enumerate() {
        let caps = &record.caps;
        if !usage.is_eligible(caps.capabilities) {
            continue;
        }
        if ideal_only && !usage.is_ideal(caps.capabilities) {
            continue;
        }
        if !caps.fits_size(usage.max_width, usage.max_height) {
            continue;
        }

        if let Some(owner) = &record.owner {
            let outranks = owner.priority > request.priority;
            let same_grant = owner.priority == request.priority && owner.usage == *usage;
            if owner.busy || outranks || same_grant {
                if pending.is_none_or(|(_, p)| owner.priority < p) {
                    pending = Some((i, owner.priority));
                }
                continue;
            }
        }

        assigned = match assigned {
            Some(best) if prefer(&records[best], record) != Ordering::Greater => Some(best),
            _ => Some(i),
        };
    }

    Selection {
        assigned,
        pending: pending.map(|(i, _)| i),
    }
}

/// `Less` when `a` is the better pick, `Greater` when `b` is.
fn prefer(a: &ResourceView, b: &ResourceView) -> Ordering {
    match (&a.owner, &b.owner) {
        (None, Some(_)) => return Ordering::Less,
        (Some(_), None) => return Ordering::Greater,
        (Some(x), Some(y)) if x.priority != y.priority => return x.priority.cmp(&y.priority),
        _ => {}
    }
    match (a.caps.area(), b.caps.area()) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
