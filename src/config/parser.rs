//! Resource table parser using winnow.
//!
//! Parses line-oriented capability descriptions:
//!
//! ```text
//! # one entry per resource instance
//! video: hardware
//! video: software,limitedResolution(640,480),limitedPerformance
//! audio: hardware
//! frontend: none
//! ```
//!
//! # Syntax
//!
//! - `<kind>: <attr>[,<attr>...]`, kind is `video`, `audio` or `frontend`
//! - Attributes are `hardware`, `software`, `limitedResolution(W,H)`,
//!   `limitedQuality`, `limitedPerformance` and `none`
//! - Unknown attributes are warned about and ignored
//! - A malformed or non-positive resolution falls back to 640x480
//! - Blank lines and lines starting with `#` are skipped

use crate::caps::{
    Capabilities, DEFAULT_LIMITED_HEIGHT, DEFAULT_LIMITED_WIDTH, ResourceCaps, ResourceType,
};
use crate::error::{Error, Result};
use winnow::Parser;
use winnow::ascii::{alpha1, space0};
use winnow::combinator::{delimited, opt, separated};
use winnow::error::ContextError;
use winnow::token::{take_till, take_while};

type WResult<T> = std::result::Result<T, ContextError>;

/// One configured resource instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceSpec {
    /// Kind of resource.
    pub resource_type: ResourceType,
    /// Its capabilities.
    pub caps: ResourceCaps,
}

/// A raw attribute before interpretation.
#[derive(Debug, Clone, PartialEq)]
struct ParsedAttribute<'a> {
    name: &'a str,
    args: Option<&'a str>,
}

/// Parse a single config line.
///
/// Returns `Ok(None)` for blank lines, comments and unknown resource kinds.
///
/// # Example
///
/// ```rust
/// use resmgr::caps::{Capabilities, ResourceType};
/// use resmgr::config::parse_line;
///
/// let spec = parse_line("video: hardware,limitedResolution(1920,1080)").unwrap().unwrap();
/// assert_eq!(spec.resource_type, ResourceType::VideoDecoder);
/// assert_eq!(spec.caps.max_width, 1920);
/// assert!(spec.caps.capabilities.contains(Capabilities::HARDWARE));
/// ```
pub fn parse_line(line: &str) -> Result<Option<ResourceSpec>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let (kind, attrs) = entry
        .parse(line)
        .map_err(|e| Error::Config(format!("parse error in {line:?}: {e}")))?;

    let resource_type = match kind {
        "video" => ResourceType::VideoDecoder,
        "audio" => ResourceType::AudioDecoder,
        "frontend" => ResourceType::FrontEnd,
        other => {
            tracing::warn!("ignoring config line for unknown resource kind {:?}", other);
            return Ok(None);
        }
    };

    let mut caps = ResourceCaps::default();
    for attr in attrs {
        apply_attribute(&mut caps, &attr);
    }

    Ok(Some(ResourceSpec {
        resource_type,
        caps,
    }))
}

fn apply_attribute(caps: &mut ResourceCaps, attr: &ParsedAttribute<'_>) {
    match attr.name {
        "hardware" => caps.capabilities |= Capabilities::HARDWARE,
        "software" => caps.capabilities |= Capabilities::SOFTWARE,
        "limitedQuality" => caps.capabilities |= Capabilities::LIMITED_QUALITY,
        "limitedPerformance" => caps.capabilities |= Capabilities::LIMITED_PERFORMANCE,
        "limitedResolution" => {
            caps.capabilities |= Capabilities::LIMITED_RESOLUTION;
            let (w, h) = attr
                .args
                .and_then(resolution)
                .unwrap_or_else(|| {
                    tracing::warn!(
                        "bad limitedResolution arguments {:?}, using {}x{}",
                        attr.args,
                        DEFAULT_LIMITED_WIDTH,
                        DEFAULT_LIMITED_HEIGHT
                    );
                    (DEFAULT_LIMITED_WIDTH, DEFAULT_LIMITED_HEIGHT)
                });
            caps.max_width = w;
            caps.max_height = h;
        }
        "none" => {}
        other => tracing::warn!("ignoring unknown resource attribute {:?}", other),
    }
}

/// Interpret `W,H`; both must be positive integers.
fn resolution(args: &str) -> Option<(i32, i32)> {
    let (w, h) = args.split_once(',')?;
    let w: i32 = w.trim().parse().ok()?;
    let h: i32 = h.trim().parse().ok()?;
    (w > 0 && h > 0).then_some((w, h))
}

/// Parse `<kind> : <attr>, <attr>...`.
fn entry<'a>(input: &mut &'a str) -> WResult<(&'a str, Vec<ParsedAttribute<'a>>)> {
    let kind = identifier.parse_next(input)?;
    let _ = space0.parse_next(input)?;
    let _ = ':'.parse_next(input)?;
    let _ = space0.parse_next(input)?;
    let attrs: Vec<ParsedAttribute<'a>> =
        separated(1.., attribute, attr_separator).parse_next(input)?;
    let _ = space0.parse_next(input)?;
    Ok((kind, attrs))
}

fn attr_separator(input: &mut &str) -> WResult<()> {
    let _ = space0.parse_next(input)?;
    let _ = ','.parse_next(input)?;
    let _ = space0.parse_next(input)?;
    Ok(())
}

/// Parse an attribute name with optional parenthesized arguments.
fn attribute<'a>(input: &mut &'a str) -> WResult<ParsedAttribute<'a>> {
    let name = identifier.parse_next(input)?;
    let _ = space0.parse_next(input)?;
    let args = opt(delimited('(', take_till(0.., ')'), ')')).parse_next(input)?;
    Ok(ParsedAttribute { name, args })
}

fn identifier<'a>(input: &mut &'a str) -> WResult<&'a str> {
    (
        alpha1::<_, ContextError>,
        take_while(0.., |c: char| c.is_alphanumeric() || c == '_'),
    )
        .take()
        .parse_next(input)
}
