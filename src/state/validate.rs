//! Validation and repair, run on every lock acquisition.
//!
//! A header that fails any check (magic, version, length, counts, checksum)
//! means the segment is reinitialized from config. Otherwise the table is
//! kept and cleaned up after processes that died: their ownerships, their
//! pending requests, their half-finished handshakes and a request permit
//! they may have been holding.

use super::checksum::resource_checksum;
use super::layout::{
    FORMAT_VERSION, MAX_QUEUE_NODES, MAX_RESOURCES, NO_INDEX, QueueNode, ResourceRecord,
    SEGMENT_MAGIC, SEGMENT_SIZE, SegmentHeader, SignalTable, StateTable,
};
use crate::config::Config;
use rustix::io::Errno;
use rustix::process::Pid;

/// What one validation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    /// The segment was reinitialized.
    pub reset: bool,
    /// Records whose dead owner was cleared.
    pub reclaimed: Vec<usize>,
    /// Nodes of dead requesters returned to the pool.
    pub dropped_pending: Vec<usize>,
    /// Out-of-range links found (logged, not repaired).
    pub anomalies: usize,
    /// A dead process's request permit was given back.
    pub released_request_sem: bool,
}

impl ValidationReport {
    /// Whether the pass wrote to the table.
    pub fn changed(&self) -> bool {
        self.reset
            || !self.reclaimed.is_empty()
            || !self.dropped_pending.is_empty()
            || self.released_request_sem
    }
}

/// Whether `pid` names a live process.
///
/// A process we may not signal still exists.
pub fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    let Some(pid) = Pid::from_raw(pid) else {
        return false;
    };
    match rustix::process::test_kill_process(pid) {
        Ok(()) | Err(Errno::PERM) => true,
        Err(_) => false,
    }
}

/// Check the table and repair what can be repaired.
///
/// `alive` decides whether a recorded pid still runs.
pub fn validate<F>(
    table: &mut StateTable,
    signals: &SignalTable,
    config: &Config,
    alive: F,
) -> ValidationReport
where
    F: Fn(i32) -> bool,
{
    let mut report = ValidationReport::default();

    if let Some(problem) = header_problem(table) {
        tracing::info!("shared state invalid ({}), reinitializing", problem);
        initialize(table, signals, config);
        report.reset = true;
        return report;
    }

    report.anomalies = count_anomalies(table);

    let count = table.live_resources().len();
    for i in 0..count {
        let record = &mut table.resources[i];
        if record.is_owned() && !alive(record.owner_pid) {
            tracing::debug!(
                "resource {} owner {} is gone, reclaiming",
                i,
                record.owner_pid
            );
            record.clear_owner();
            record.notify.reset();
            signals.resources[i].reset();
            report.reclaimed.push(i);
        } else if record.notify.in_flight() && !alive(record.notify.initiator) {
            settle_orphaned_handshake(record, i, signals);
            report.reclaimed.push(i);
        }
    }

    for i in 0..table.pool_size() {
        let node = &table.nodes[i];
        if node.is_queued() && !alive(node.pid) {
            tracing::debug!("pending node {} requester {} is gone", i, node.pid);
            table.dequeue(i);
            table.free_node(i);
            signals.nodes[i].reset();
            report.dropped_pending.push(i);
        }
    }

    let holder = table.header.request_holder;
    if holder != 0 && !alive(holder) {
        tracing::debug!("request permit holder {} is gone, releasing", holder);
        table.header.request_holder = 0;
        if let Err(e) = signals.request.post() {
            tracing::warn!("failed to release request permit: {}", e);
        }
        report.released_request_sem = true;
    }

    report
}

/// The initiator of a revoke died between posting and collecting the ack.
fn settle_orphaned_handshake(record: &mut ResourceRecord, index: usize, signals: &SignalTable) {
    tracing::debug!(
        "resource {} handshake initiator {} is gone",
        index,
        record.notify.initiator
    );
    if record.is_owned() {
        // The owner's handler already consumed `act`; leave its semaphores.
        record.notify.arm();
    } else {
        record.notify.reset();
        signals.resources[index].reset();
    }
}

fn header_problem(table: &StateTable) -> Option<String> {
    let h = &table.header;
    if h.magic != SEGMENT_MAGIC {
        return Some(format!("bad magic {:#010x}", h.magic));
    }
    if h.format_version != FORMAT_VERSION {
        return Some(format!("format version {}", h.format_version));
    }
    if h.length as usize != SEGMENT_SIZE {
        return Some(format!("length {}", h.length));
    }
    let count = h.resource_count as usize;
    if count > MAX_RESOURCES || h.pool_size as usize != 3 * count {
        return Some(format!(
            "counts {} resources / {} nodes",
            h.resource_count, h.pool_size
        ));
    }
    let checksum = resource_checksum(&table.resources);
    if checksum != h.checksum {
        return Some(format!(
            "checksum {:#010x} != {:#010x}",
            checksum, h.checksum
        ));
    }
    None
}

fn count_anomalies(table: &StateTable) -> usize {
    let pool = table.pool_size() as i32;
    let count = table.live_resources().len() as i32;
    let in_pool = |v: i32| v == NO_INDEX || (0..pool).contains(&v);
    let mut anomalies = 0;

    if !in_pool(table.header.free_head) {
        tracing::warn!("free list head {} out of range", table.header.free_head);
        anomalies += 1;
    }
    for (i, record) in table.live_resources().iter().enumerate() {
        if !in_pool(record.pending_head) {
            tracing::warn!("resource {} pending head {} out of range", i, record.pending_head);
            anomalies += 1;
        }
    }
    for (i, node) in table.nodes[..table.pool_size()].iter().enumerate() {
        let resource_ok = node.resource == NO_INDEX || (0..count).contains(&node.resource);
        if node.index != i as i32 || !in_pool(node.next) || !in_pool(node.prev) || !resource_ok {
            tracing::warn!(
                "node {} has bad links (index {}, next {}, prev {}, resource {})",
                i,
                node.index,
                node.next,
                node.prev,
                node.resource
            );
            anomalies += 1;
        }
    }
    anomalies
}

/// Reinitialize every table and semaphore from `config`.
pub fn initialize(table: &mut StateTable, signals: &SignalTable, config: &Config) {
    let count = config.resources.len().min(MAX_RESOURCES);
    let pool = 3 * count;

    table.header = SegmentHeader {
        magic: SEGMENT_MAGIC,
        format_version: FORMAT_VERSION,
        length: SEGMENT_SIZE as u32,
        content_version: table.header.content_version.wrapping_add(1),
        checksum: 0,
        next_request_id: 1,
        resource_count: count as u32,
        pool_size: pool as u32,
        free_head: if pool > 0 { 0 } else { NO_INDEX },
        request_holder: 0,
        generation: table.header.generation.wrapping_add(1),
        reserved: [0; 5],
    };

    for record in table.resources.iter_mut() {
        *record = ResourceRecord {
            pending_head: NO_INDEX,
            ..ResourceRecord::default()
        };
    }
    for (record, spec) in table.resources.iter_mut().zip(&config.resources) {
        record.kind = spec.resource_type as u32;
        record.caps = spec.caps.capabilities.bits();
        record.max_width = spec.caps.max_width;
        record.max_height = spec.caps.max_height;
    }

    for i in 0..MAX_QUEUE_NODES {
        let next = if i + 1 < pool { (i + 1) as i32 } else { NO_INDEX };
        table.nodes[i] = QueueNode {
            index: i as i32,
            next,
            prev: NO_INDEX,
            resource: NO_INDEX,
            ..QueueNode::default()
        };
    }

    table.header.checksum = resource_checksum(&table.resources);
    signals.reset();
}
