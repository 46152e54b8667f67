//! Resource kinds, capability bits and usage profiles.
//!
//! Capability and usage masks share bit positions on [`CRITERIA_MASK`]: a
//! record that is `LIMITED_RESOLUTION` cannot serve a request that demands
//! `FULL_RESOLUTION`, and so on. The `HARDWARE`/`SOFTWARE` bits are
//! informational and never take part in eligibility.

use std::fmt;

bitflags::bitflags! {
    /// What a resource instance can (or cannot) do.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Capabilities: u32 {
        /// Bounded by a maximum width/height.
        const LIMITED_RESOLUTION = 0x01;
        /// Reduced output quality.
        const LIMITED_QUALITY = 0x02;
        /// Reduced throughput.
        const LIMITED_PERFORMANCE = 0x04;
        /// Backed by dedicated hardware.
        const HARDWARE = 0x08;
        /// Backed by a software implementation.
        const SOFTWARE = 0x10;
    }
}

bitflags::bitflags! {
    /// What a request demands from the resource it is given.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Usage: u32 {
        /// Needs an instance without a resolution ceiling.
        const FULL_RESOLUTION = 0x01;
        /// Needs full output quality.
        const FULL_QUALITY = 0x02;
        /// Needs full throughput.
        const FULL_PERFORMANCE = 0x04;
    }
}

/// Bits that take part in eligibility and ideal matching.
pub const CRITERIA_MASK: u32 = 0x07;

/// Ceiling applied when a `limitedResolution(W,H)` attribute is malformed.
pub const DEFAULT_LIMITED_WIDTH: i32 = 640;
/// See [`DEFAULT_LIMITED_WIDTH`].
pub const DEFAULT_LIMITED_HEIGHT: i32 = 480;

/// Kind of arbitrated resource.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceType {
    /// Video decoder channel.
    VideoDecoder = 0,
    /// Audio decoder channel.
    AudioDecoder = 1,
    /// Tuner front-end.
    FrontEnd = 2,
}

impl ResourceType {
    /// All kinds, in table order.
    pub const ALL: [ResourceType; 3] = [
        ResourceType::VideoDecoder,
        ResourceType::AudioDecoder,
        ResourceType::FrontEnd,
    ];

    pub(crate) fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(ResourceType::VideoDecoder),
            1 => Some(ResourceType::AudioDecoder),
            2 => Some(ResourceType::FrontEnd),
            _ => None,
        }
    }

    /// Key used for this kind in config files.
    pub fn config_key(&self) -> &'static str {
        match self {
            ResourceType::VideoDecoder => "video",
            ResourceType::AudioDecoder => "audio",
            ResourceType::FrontEnd => "frontend",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceType::VideoDecoder => write!(f, "video decoder"),
            ResourceType::AudioDecoder => write!(f, "audio decoder"),
            ResourceType::FrontEnd => write!(f, "front-end"),
        }
    }
}

/// Capabilities of one resource instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceCaps {
    /// Capability bits.
    pub capabilities: Capabilities,
    /// Maximum width for `LIMITED_RESOLUTION` instances (0 = none).
    pub max_width: i32,
    /// Maximum height for `LIMITED_RESOLUTION` instances (0 = none).
    pub max_height: i32,
}

impl ResourceCaps {
    /// Capabilities without a resolution ceiling.
    pub fn new(capabilities: Capabilities) -> Self {
        Self {
            capabilities,
            max_width: 0,
            max_height: 0,
        }
    }

    /// Capabilities limited to `max_width` x `max_height`.
    pub fn limited(capabilities: Capabilities, max_width: i32, max_height: i32) -> Self {
        Self {
            capabilities: capabilities | Capabilities::LIMITED_RESOLUTION,
            max_width,
            max_height,
        }
    }

    /// Whether this instance has a resolution ceiling.
    pub fn is_size_constrained(&self) -> bool {
        self.capabilities.contains(Capabilities::LIMITED_RESOLUTION)
    }

    /// Ceiling area, `None` when unconstrained.
    pub fn area(&self) -> Option<i64> {
        self.is_size_constrained()
            .then(|| i64::from(self.max_width) * i64::from(self.max_height))
    }

    /// Whether a request with the given size limits fits under the ceiling.
    ///
    /// A request dimension of 0 (or less) is "unspecified" and always fits.
    pub fn fits_size(&self, width: i32, height: i32) -> bool {
        if !self.is_size_constrained() {
            return true;
        }
        let too_wide = width > 0 && width > self.max_width;
        let too_tall = height > 0 && height > self.max_height;
        !(too_wide || too_tall)
    }
}

/// A usage profile together with the largest frame the caller will decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestedUsage {
    /// Demanded usage bits.
    pub usage: Usage,
    /// Largest width the caller will use (0 = unspecified).
    pub max_width: i32,
    /// Largest height the caller will use (0 = unspecified).
    pub max_height: i32,
}

impl RequestedUsage {
    /// A profile without size limits.
    pub fn new(usage: Usage) -> Self {
        Self {
            usage,
            max_width: 0,
            max_height: 0,
        }
    }

    /// Set the largest frame size.
    pub fn with_max_size(mut self, max_width: i32, max_height: i32) -> Self {
        self.max_width = max_width;
        self.max_height = max_height;
        self
    }

    /// The record's limiting bits are all accepted by this profile.
    #[inline]
    pub fn is_eligible(&self, caps: Capabilities) -> bool {
        (self.usage.bits() & caps.bits()) & CRITERIA_MASK == 0
    }

    /// The record is limited in exactly the ways this profile tolerates.
    #[inline]
    pub fn is_ideal(&self, caps: Capabilities) -> bool {
        !(self.usage.bits() ^ caps.bits()) & CRITERIA_MASK == 0
    }

    /// Eligible on criteria and under the record's size ceiling.
    pub fn fits(&self, caps: &ResourceCaps) -> bool {
        self.is_eligible(caps.capabilities) && caps.fits_size(self.max_width, self.max_height)
    }
}
