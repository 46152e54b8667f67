//! # resmgr
//!
//! Cross-process arbitration of scarce decoder and tuner resources.
//!
//! Cooperating processes on one device share a small memory-mapped segment
//! describing every resource instance, its owner and the requests waiting
//! for it. There is no daemon: each call locks the segment, repairs whatever
//! a crashed process left behind, and applies its change.
//!
//! ## Features
//!
//! - **Priority preemption**: a more important request revokes the current
//!   owner through a synchronous handshake
//! - **Pending queues**: asynchronous requests wait in priority order and are
//!   handed the resource when it frees up
//! - **Capability matching**: usage profiles and resolution ceilings pick the
//!   best-suited instance
//! - **Self-healing**: dead owners and corrupt segments are detected on every
//!   lock acquisition
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use resmgr::prelude::*;
//!
//! let manager = ResourceManager::open()?;
//! let request = ResourceRequest::new(
//!     ResourceType::VideoDecoder,
//!     RequestedUsage::new(Usage::all()).with_max_size(1920, 1080),
//!     10,
//! )
//! .with_async(true)
//! .with_callback(|event| match event {
//!     Notification::Granted { index, .. } => println!("got decoder {index}"),
//!     Notification::Revoked { index, .. } => println!("must give up decoder {index}"),
//! });
//!
//! let grant = manager.request_resource(ResourceType::VideoDecoder, request)?;
//! println!("{:?}", grant.outcome);
//! # Ok::<(), resmgr::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod caps;
pub mod config;
pub mod error;
pub mod handshake;
pub mod logging;
pub mod manager;
pub mod memory;
pub mod select;
pub mod state;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::caps::{Capabilities, RequestedUsage, ResourceCaps, ResourceType, Usage};
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::manager::{
        Grant, GrantOutcome, Notification, NotifyCallback, RequestId, ResourceManager,
        ResourceOwner, ResourceRequest, Settings,
    };
}

pub use error::{Error, Result};
