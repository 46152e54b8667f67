//! Arbitration scenarios between manager handles.
//!
//! Each handle has its own registry of requests, so two handles opened on the
//! same segment behave like two clients. Callbacks answer revocations by
//! releasing, the way an application is expected to.

use resmgr::caps::{Capabilities, RequestedUsage, ResourceCaps, ResourceType, Usage};
use resmgr::config::{Config, ResourceSpec};
use resmgr::manager::{
    GrantOutcome, Notification, RequestId, ResourceManager, ResourceRequest, Settings,
};
use resmgr::Error;
use resmgr::handshake::{HANDSHAKE_INTERVAL, HANDSHAKE_RETRIES};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::tempdir;

const VIDEO: ResourceType = ResourceType::VideoDecoder;

#[derive(Default)]
struct Counters {
    granted: AtomicUsize,
    revoked: AtomicUsize,
}

impl Counters {
    fn granted(&self) -> usize {
        self.granted.load(Ordering::SeqCst)
    }

    fn revoked(&self) -> usize {
        self.revoked.load(Ordering::SeqCst)
    }
}

/// A client: one manager handle plus the counters its callback feeds.
struct Client {
    manager: ResourceManager,
    counters: Arc<Counters>,
}

impl Client {
    fn open(path: &Path, config: &Config) -> Self {
        let manager = ResourceManager::open_with(Settings {
            segment_path: Some(path.to_path_buf()),
            config: Some(config.clone()),
        })
        .unwrap();
        Self {
            manager,
            counters: Arc::new(Counters::default()),
        }
    }

    fn request_for(&self, priority: i32, usage: RequestedUsage) -> ResourceRequest {
        let counters = Arc::clone(&self.counters);
        let manager = self.manager.clone();
        ResourceRequest::new(VIDEO, usage, priority)
            .with_async(true)
            .with_callback(move |event| match event {
                Notification::Granted { .. } => {
                    counters.granted.fetch_add(1, Ordering::SeqCst);
                }
                Notification::Revoked {
                    resource_type,
                    index,
                    ..
                } => {
                    counters.revoked.fetch_add(1, Ordering::SeqCst);
                    manager.release_resource(*resource_type, *index).unwrap();
                }
            })
    }

    /// Like [`Client::request_for`], but revocations are only counted.
    fn stubborn_request(&self, priority: i32, usage: RequestedUsage) -> ResourceRequest {
        let counters = Arc::clone(&self.counters);
        ResourceRequest::new(VIDEO, usage, priority).with_callback(move |event| {
            if let Notification::Revoked { .. } = event {
                counters.revoked.fetch_add(1, Ordering::SeqCst);
            }
        })
    }

    /// Request with the given priority; an immediate assignment counts as a grant.
    fn request(&self, priority: i32, usage: RequestedUsage) -> resmgr::Result<(RequestId, GrantOutcome)> {
        let grant = self
            .manager
            .request_resource(VIDEO, self.request_for(priority, usage))?;
        if let GrantOutcome::Assigned(_) = grant.outcome {
            self.counters.granted.fetch_add(1, Ordering::SeqCst);
        }
        Ok((grant.request_id, grant.outcome))
    }

    fn owns(&self, index: usize) -> bool {
        self.manager.resource_owner(VIDEO, index).unwrap().is_owned()
    }
}

fn full() -> RequestedUsage {
    RequestedUsage::new(Usage::all())
}

fn video_config(caps: &[ResourceCaps]) -> Config {
    Config::from_specs(
        caps.iter()
            .map(|&caps| ResourceSpec {
                resource_type: VIDEO,
                caps,
            })
            .collect(),
    )
    .unwrap()
}

fn one_decoder() -> Config {
    video_config(&[ResourceCaps::new(Capabilities::HARDWARE)])
}

fn wait_for(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

// ============================================================================
// Priority preemption
// ============================================================================

/// A higher-priority request revokes the owner exactly once.
#[test]
fn test_higher_priority_preempts_owner() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("essrmgr");
    let config = one_decoder();
    let a = Client::open(&path, &config);
    let b = Client::open(&path, &config);

    assert_eq!(a.request(1, full()).unwrap().1, GrantOutcome::Assigned(0));
    assert_eq!(b.request(2, full()).unwrap().1, GrantOutcome::Assigned(0));

    assert_eq!(a.counters.revoked(), 1);
    assert_eq!(b.counters.granted(), 1);
    assert_eq!(b.counters.revoked(), 0);
    let owner = b.manager.resource_owner(VIDEO, 0).unwrap();
    assert_eq!(owner.priority, 2);
}

/// A lower-priority request waits instead of preempting.
#[test]
fn test_lower_priority_waits() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("essrmgr");
    let config = one_decoder();
    let a = Client::open(&path, &config);
    let b = Client::open(&path, &config);

    a.request(2, full()).unwrap();
    assert_eq!(b.request(1, full()).unwrap().1, GrantOutcome::Pending);
    assert_eq!(a.counters.revoked(), 0);

    a.manager.release_resource(VIDEO, 0).unwrap();
    assert!(wait_for(|| b.counters.granted() == 1));
    assert_eq!(a.counters.revoked(), 0);
    assert_eq!(b.manager.resource_owner(VIDEO, 0).unwrap().priority, 1);
}

/// Same priority and usage as the owner: queued, never preempting.
#[test]
fn test_identical_tie_is_pending() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("essrmgr");
    let config = one_decoder();
    let a = Client::open(&path, &config);
    let b = Client::open(&path, &config);

    a.request(3, full()).unwrap();
    assert_eq!(b.request(3, full()).unwrap().1, GrantOutcome::Pending);
    assert_eq!(a.counters.revoked(), 0);
    assert!(a.owns(0));
}

/// Without async, a request that could only wait is denied.
#[test]
fn test_sync_request_denied_when_busy() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("essrmgr");
    let config = one_decoder();
    let a = Client::open(&path, &config);
    let b = Client::open(&path, &config);

    a.request(5, full()).unwrap();
    let request = b.request_for(1, full()).with_async(false);
    let err = b.manager.request_resource(VIDEO, request).unwrap_err();
    assert!(matches!(err, Error::Denied(_)));
}

/// Two clients alternate for ten rounds on a single decoder.
///
/// Each round the priority-1 client takes the decoder, the priority-2 client
/// preempts it, holds briefly and releases.
#[test]
fn test_alternating_rounds() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("essrmgr");
    let config = one_decoder();
    let low = Client::open(&path, &config);
    let high = Client::open(&path, &config);

    for _ in 0..10 {
        assert_eq!(low.request(1, full()).unwrap().1, GrantOutcome::Assigned(0));
        thread::sleep(Duration::from_millis(2));
        assert_eq!(high.request(2, full()).unwrap().1, GrantOutcome::Assigned(0));
        thread::sleep(Duration::from_millis(2));
        high.manager.release_resource(VIDEO, 0).unwrap();
    }

    assert_eq!(low.counters.granted(), 10);
    assert_eq!(low.counters.revoked(), 10);
    assert_eq!(high.counters.granted(), 10);
    assert_eq!(high.counters.revoked(), 0);
    assert!(!low.owns(0));
}

/// Concurrent requesters never end up sharing a decoder.
#[test]
fn test_concurrent_requests_get_distinct_decoders() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("essrmgr");
    let config = video_config(&[ResourceCaps::new(Capabilities::HARDWARE); 4]);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let path = path.clone();
            let config = config.clone();
            thread::spawn(move || {
                let client = Client::open(&path, &config);
                let (_, outcome) = client.request(1, full()).unwrap();
                (client, outcome)
            })
        })
        .collect();

    let mut indices: Vec<usize> = Vec::new();
    let mut clients = Vec::new();
    for h in handles {
        let (client, outcome) = h.join().unwrap();
        match outcome {
            GrantOutcome::Assigned(index) => indices.push(index),
            GrantOutcome::Pending => panic!("four decoders for four clients"),
        }
        clients.push(client);
    }
    indices.sort_unstable();
    assert_eq!(indices, vec![0, 1, 2, 3]);
}

/// An owner that never answers a revoke loses the resource once the
/// handshake runs out, and its late release leaves the new owner alone.
#[test]
fn test_unanswered_revoke_times_out() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("essrmgr");
    let config = one_decoder();
    let a = Client::open(&path, &config);
    let b = Client::open(&path, &config);

    let grant = a
        .manager
        .request_resource(VIDEO, a.stubborn_request(1, full()))
        .unwrap();
    assert_eq!(grant.outcome, GrantOutcome::Assigned(0));

    let start = Instant::now();
    assert_eq!(b.request(2, full()).unwrap().1, GrantOutcome::Assigned(0));
    assert!(start.elapsed() >= HANDSHAKE_INTERVAL * HANDSHAKE_RETRIES);
    assert_eq!(a.counters.revoked(), 1);

    a.manager.release_resource(VIDEO, 0).unwrap();
    assert_eq!(b.manager.resource_owner(VIDEO, 0).unwrap().priority, 2);

    b.manager.release_resource(VIDEO, 0).unwrap();
    assert!(!b.owns(0));
}

// ============================================================================
// Release and cancel
// ============================================================================

/// Only the owning handle can release.
#[test]
fn test_release_by_non_owner_is_ignored() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("essrmgr");
    let config = one_decoder();
    let a = Client::open(&path, &config);
    let b = Client::open(&path, &config);

    a.request(1, full()).unwrap();
    b.manager.release_resource(VIDEO, 0).unwrap();
    assert!(a.owns(0));
}

/// Cancelling an owner releases it and promotes the queue head.
#[test]
fn test_cancel_owner_transfers() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("essrmgr");
    let config = one_decoder();
    let a = Client::open(&path, &config);
    let b = Client::open(&path, &config);

    let (id, _) = a.request(4, full()).unwrap();
    b.request(2, full()).unwrap();
    a.manager.cancel(VIDEO, id).unwrap();
    assert!(wait_for(|| b.counters.granted() == 1));
    assert_eq!(a.counters.revoked(), 0);
}

/// Cancelling a pending request returns its node to the pool.
#[test]
fn test_cancel_pending_frees_node() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("essrmgr");
    let config = one_decoder();
    let a = Client::open(&path, &config);
    let b = Client::open(&path, &config);

    a.request(4, full()).unwrap();
    let (id, outcome) = b.request(2, full()).unwrap();
    assert_eq!(outcome, GrantOutcome::Pending);
    assert!(b.manager.dump_state().unwrap().contains("free nodes 2/3"));

    b.manager.cancel(VIDEO, id).unwrap();
    assert!(b.manager.dump_state().unwrap().contains("free nodes 3/3"));

    a.manager.release_resource(VIDEO, 0).unwrap();
    assert!(!a.owns(0));
    assert_eq!(b.counters.granted(), 0);

    // Cancelling again is a no-op.
    b.manager.cancel(VIDEO, id).unwrap();
}

/// The pending pool holds three nodes per resource.
#[test]
fn test_pending_pool_exhaustion() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("essrmgr");
    let config = one_decoder();
    let owner = Client::open(&path, &config);
    let waiter = Client::open(&path, &config);

    owner.request(9, full()).unwrap();
    for _ in 0..3 {
        assert_eq!(waiter.request(1, full()).unwrap().1, GrantOutcome::Pending);
    }
    let err = waiter.request(1, full()).unwrap_err();
    assert!(matches!(err, Error::Denied(_)));
}

/// Closing a handle releases what it owns and drops what it queued.
#[test]
fn test_close_releases_everything() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("essrmgr");
    let config = video_config(&[ResourceCaps::new(Capabilities::HARDWARE); 2]);
    let a = Client::open(&path, &config);
    let b = Client::open(&path, &config);

    a.request(5, full()).unwrap();
    a.request(5, full()).unwrap();
    b.request(1, full()).unwrap();
    a.request(5, full()).unwrap();

    let Client { manager, counters } = a;
    manager.close();
    assert_eq!(counters.revoked(), 0);
    assert!(wait_for(|| b.counters.granted() == 1));
    assert!(b.manager.dump_state().unwrap().contains("free nodes 6/6"));
}

// ============================================================================
// Priority and usage changes
// ============================================================================

/// Raising a pending request to the owner's priority promotes it.
#[test]
fn test_set_priority_promotes_pending() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("essrmgr");
    let config = one_decoder();
    let a = Client::open(&path, &config);
    let b = Client::open(&path, &config);

    a.request(5, full()).unwrap();
    let (id, outcome) = b.request(3, full()).unwrap();
    assert_eq!(outcome, GrantOutcome::Pending);

    b.manager.set_priority(VIDEO, id, 5).unwrap();
    assert!(wait_for(|| b.counters.granted() == 1));
    assert_eq!(a.counters.revoked(), 1);
    assert_eq!(b.manager.resource_owner(VIDEO, 0).unwrap().priority, 5);
}

/// Lowering the owner's priority does not preempt it.
#[test]
fn test_owner_priority_change_never_self_preempts() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("essrmgr");
    let config = one_decoder();
    let a = Client::open(&path, &config);
    let b = Client::open(&path, &config);

    let (id, _) = a.request(5, full()).unwrap();
    b.request(3, full()).unwrap();
    a.manager.set_priority(VIDEO, id, 1).unwrap();

    assert_eq!(a.counters.revoked(), 0);
    assert_eq!(a.manager.resource_owner(VIDEO, 0).unwrap().priority, 1);
    assert_eq!(b.counters.granted(), 0);
}

/// A new usage the decoder cannot serve revokes the owner.
#[test]
fn test_set_usage_ineligible_self_revokes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("essrmgr");
    let config = video_config(&[ResourceCaps::limited(Capabilities::HARDWARE, 640, 480)]);
    let a = Client::open(&path, &config);

    let small = RequestedUsage::new(Usage::empty()).with_max_size(320, 240);
    let (id, outcome) = a.request(2, small).unwrap();
    assert_eq!(outcome, GrantOutcome::Assigned(0));

    let large = RequestedUsage::new(Usage::empty()).with_max_size(1920, 1080);
    a.manager.set_usage(VIDEO, id, large).unwrap();
    assert_eq!(a.counters.revoked(), 1);
    assert!(!a.owns(0));
}

/// An owner that stops being an exact match gives way to a pending request
/// that is one, even at lower priority.
#[test]
fn test_set_usage_yields_to_better_fit() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("essrmgr");
    let config = video_config(&[ResourceCaps::limited(Capabilities::HARDWARE, 640, 480)]);
    let a = Client::open(&path, &config);
    let b = Client::open(&path, &config);
    let exact = RequestedUsage::new(Usage::FULL_QUALITY | Usage::FULL_PERFORMANCE);

    let (id, _) = a.request(5, exact).unwrap();
    assert_eq!(b.request(3, exact).unwrap().1, GrantOutcome::Pending);

    a.manager
        .set_usage(VIDEO, id, RequestedUsage::new(Usage::FULL_QUALITY))
        .unwrap();
    assert!(wait_for(|| b.counters.granted() == 1));
    assert_eq!(a.counters.revoked(), 1);
}

/// The same change with nobody waiting keeps the owner.
#[test]
fn test_set_usage_keeps_owner_without_better_fit() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("essrmgr");
    let config = video_config(&[ResourceCaps::limited(Capabilities::HARDWARE, 640, 480)]);
    let a = Client::open(&path, &config);
    let exact = RequestedUsage::new(Usage::FULL_QUALITY | Usage::FULL_PERFORMANCE);

    let (id, _) = a.request(5, exact).unwrap();
    a.manager
        .set_usage(VIDEO, id, RequestedUsage::new(Usage::FULL_QUALITY))
        .unwrap();
    assert_eq!(a.counters.revoked(), 0);
    assert!(a.owns(0));
}

/// Changing a pending request's usage requeues it under the same id.
#[test]
fn test_set_usage_requeues_pending() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("essrmgr");
    let config = one_decoder();
    let a = Client::open(&path, &config);
    let b = Client::open(&path, &config);

    a.request(5, full()).unwrap();
    let (id, _) = b.request(1, full()).unwrap();
    b.manager
        .set_usage(VIDEO, id, RequestedUsage::new(Usage::FULL_QUALITY))
        .unwrap();

    let dump = b.manager.dump_state().unwrap();
    assert!(dump.contains(&format!("pending request {}", id.as_raw())));
    assert!(dump.contains("free nodes 2/3"));

    a.manager.release_resource(VIDEO, 0).unwrap();
    assert!(wait_for(|| b.counters.granted() == 1));
}

/// Priority and usage changes on ids this handle never issued fail.
#[test]
fn test_changes_on_foreign_ids_fail() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("essrmgr");
    let config = one_decoder();
    let a = Client::open(&path, &config);
    let b = Client::open(&path, &config);

    let (id, _) = a.request(5, full()).unwrap();
    assert!(matches!(
        b.manager.set_priority(VIDEO, id, 9),
        Err(Error::UnknownRequest(_))
    ));
    assert!(matches!(
        b.manager.set_usage(VIDEO, id, full()),
        Err(Error::UnknownRequest(_))
    ));
    b.manager.cancel(VIDEO, id).unwrap();
    assert!(a.owns(0));
}

// ============================================================================
// Resource kinds
// ============================================================================

/// Kinds are arbitrated independently.
#[test]
fn test_kinds_do_not_interfere() {
    let dir = tempdir().unwrap();
    let manager = ResourceManager::open_with(Settings {
        segment_path: Some(dir.path().join("essrmgr")),
        config: Some(Config::default_topology()),
    })
    .unwrap();

    assert_eq!(manager.resource_count(VIDEO).unwrap(), 2);
    assert_eq!(manager.resource_count(ResourceType::AudioDecoder).unwrap(), 1);
    assert_eq!(manager.resource_count(ResourceType::FrontEnd).unwrap(), 1);

    let audio = ResourceRequest::new(
        ResourceType::AudioDecoder,
        RequestedUsage::new(Usage::all()),
        1,
    )
    .with_callback(|_| {});
    let grant = manager
        .request_resource(ResourceType::AudioDecoder, audio)
        .unwrap();
    assert_eq!(grant.outcome, GrantOutcome::Assigned(0));
    assert!(manager.resource_owner(ResourceType::AudioDecoder, 0).unwrap().is_owned());
    assert!(!manager.resource_owner(VIDEO, 0).unwrap().is_owned());
    assert!(!manager.resource_owner(VIDEO, 1).unwrap().is_owned());

    let front_end = manager.resource_caps(ResourceType::FrontEnd, 0).unwrap();
    assert!(front_end.capabilities.is_empty());
}

/// The limited software decoder takes small streams, the hardware one the rest.
#[test]
fn test_default_topology_routes_by_size() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("essrmgr");
    let config = Config::default_topology();
    let a = Client::open(&path, &config);

    let small = RequestedUsage::new(Usage::FULL_QUALITY).with_max_size(320, 240);
    assert_eq!(a.request(1, small).unwrap().1, GrantOutcome::Assigned(1));

    let hd = RequestedUsage::new(Usage::FULL_QUALITY).with_max_size(1920, 1080);
    assert_eq!(a.request(1, hd).unwrap().1, GrantOutcome::Assigned(0));
}
