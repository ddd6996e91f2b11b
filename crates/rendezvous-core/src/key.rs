//! Channel keys.
//!
//! A key names one producer to consumer communication:
//!
//! ```text
//! {src_device};{src_incarnation:016x};{dst_device};{edge_name};{frame_id}:{iter_id}
//! ```
//!
//! [`ParsedKey::create`] builds the string form and [`ParsedKey::parse`] turns it
//! back into the structured form. Parsed keys compare and hash by their
//! structured fields; the string is only an address.

use std::fmt;
use std::hash::{Hash, Hasher};

use crate::{Error, Result};

/// Identifies one activation of a channel inside nested iterative execution.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameAndIter {
    pub frame_id: u64,
    pub iter_id: u64,
}

impl FrameAndIter {
    /// Frame `frame_id`, iteration `iter_id`.
    pub const fn new(frame_id: u64, iter_id: u64) -> Self {
        Self { frame_id, iter_id }
    }
}

impl fmt::Display for FrameAndIter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.frame_id, self.iter_id)
    }
}

/// Structured form of a device name.
///
/// Accepts full names (`/job:worker/replica:0/task:1/device:GPU:0`, any subset
/// of the components in that order) and the legacy short form (`/cpu:0`).
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct DeviceName {
    pub job: Option<String>,
    pub replica: Option<u32>,
    pub task: Option<u32>,
    pub device_type: Option<String>,
    pub id: Option<u32>,
}

impl DeviceName {
    /// Parse a full (`/job:j/replica:r/task:t/device:TYPE:ID`) or legacy (`/cpu:0`) name.
    ///
    /// ```
    /// use rendezvous_core::DeviceName;
    ///
    /// let full = DeviceName::parse("/job:worker/replica:0/task:1/device:GPU:2").unwrap();
    /// assert_eq!(full.task, Some(1));
    /// assert_eq!(full.device_type.as_deref(), Some("GPU"));
    ///
    /// let legacy = DeviceName::parse("/cpu:0").unwrap();
    /// assert_eq!(legacy.device_type.as_deref(), Some("CPU"));
    /// assert!(DeviceName::parse("cpu0").is_err());
    /// ```
    pub fn parse(name: &str) -> Result<Self> {
        let invalid =
            |why: &str| Error::invalid_argument(format!("invalid device name {name:?}: {why}"));

        let rest = name.strip_prefix('/').ok_or_else(|| invalid("must start with '/'"))?;
        if rest.is_empty() {
            return Err(invalid("no components"));
        }

        let mut parsed = DeviceName::default();
        // 0 = job, 1 = replica, 2 = task, 3 = device; components must not go backwards.
        let mut stage = 0u8;

        for component in rest.split('/') {
            let (field, value) = component
                .split_once(':')
                .ok_or_else(|| invalid("component without ':'"))?;
            match field {
                "job" if stage == 0 => {
                    if !is_identifier(value) {
                        return Err(invalid("bad job name"));
                    }
                    parsed.job = Some(value.to_owned());
                    stage = 1;
                }
                "replica" if stage <= 1 => {
                    parsed.replica = Some(parse_u32(value).ok_or_else(|| invalid("bad replica"))?);
                    stage = 2;
                }
                "task" if stage <= 2 => {
                    parsed.task = Some(parse_u32(value).ok_or_else(|| invalid("bad task"))?);
                    stage = 3;
                }
                "device" if stage <= 3 => {
                    let (ty, id) = value
                        .split_once(':')
                        .ok_or_else(|| invalid("device must be TYPE:ID"))?;
                    if !is_identifier(ty) {
                        return Err(invalid("bad device type"));
                    }
                    parsed.device_type = Some(ty.to_owned());
                    parsed.id = Some(parse_u32(id).ok_or_else(|| invalid("bad device id"))?);
                    stage = 4;
                }
                legacy
                    if stage <= 3
                        && !matches!(legacy, "job" | "replica" | "task" | "device")
                        && is_identifier(legacy)
                        && !legacy.chars().any(|c| c.is_ascii_uppercase()) =>
                {
                    parsed.device_type = Some(legacy.to_ascii_uppercase());
                    parsed.id = Some(parse_u32(value).ok_or_else(|| invalid("bad device id"))?);
                    stage = 4;
                }
                _ => return Err(invalid("unexpected or out-of-order component")),
            }
        }

        Ok(parsed)
    }
}

impl fmt::Display for DeviceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(job) = &self.job {
            write!(f, "/job:{job}")?;
        }
        if let Some(replica) = self.replica {
            write!(f, "/replica:{replica}")?;
        }
        if let Some(task) = self.task {
            write!(f, "/task:{task}")?;
        }
        if let (Some(ty), Some(id)) = (&self.device_type, self.id) {
            write!(f, "/device:{ty}:{id}")?;
        }
        Ok(())
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_u32(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

fn parse_u64_dec(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// A channel key, validated and split into its components.
///
/// Fields are private: build keys with [`ParsedKey::create`] +
/// [`ParsedKey::parse`] (or [`ParsedKey::from_parts`]) and read them through
/// the accessors.
#[derive(Clone, Debug)]
pub struct ParsedKey {
    src_device: String,
    src: DeviceName,
    src_incarnation: u64,
    dst_device: String,
    dst: DeviceName,
    edge_name: String,
    frame_iter: FrameAndIter,
    buf: String,
}

impl ParsedKey {
    /// Compose the string form of a key. Pure; performs no validation.
    pub fn create(
        src_device: &str,
        src_incarnation: u64,
        dst_device: &str,
        edge_name: &str,
        frame_iter: FrameAndIter,
    ) -> String {
        format!("{src_device};{src_incarnation:016x};{dst_device};{edge_name};{frame_iter}")
    }

    /// Parse the string form produced by [`ParsedKey::create`].
    pub fn parse(key: &str) -> Result<Self> {
        let invalid =
            |why: &str| Error::invalid_argument(format!("invalid rendezvous key {key:?}: {why}"));

        let parts: Vec<&str> = key.split(';').collect();
        let [src_device, incarnation, dst_device, edge_name, frame_iter] = parts[..] else {
            return Err(invalid("expected 5 ';'-separated fields"));
        };

        let src = DeviceName::parse(src_device).map_err(|e| e.context(format!("key {key:?}")))?;
        let dst = DeviceName::parse(dst_device).map_err(|e| e.context(format!("key {key:?}")))?;

        if incarnation.is_empty()
            || incarnation.len() > 16
            || !incarnation.bytes().all(|b| b.is_ascii_hexdigit())
        {
            return Err(invalid("incarnation must be 1-16 hex digits"));
        }
        let src_incarnation =
            u64::from_str_radix(incarnation, 16).map_err(|_| invalid("bad incarnation"))?;

        if edge_name.is_empty() {
            return Err(invalid("empty edge name"));
        }

        let (frame, iter) = frame_iter
            .split_once(':')
            .ok_or_else(|| invalid("frame/iteration must be FRAME:ITER"))?;
        let frame_iter = FrameAndIter::new(
            parse_u64_dec(frame).ok_or_else(|| invalid("bad frame id"))?,
            parse_u64_dec(iter).ok_or_else(|| invalid("bad iteration id"))?,
        );

        let buf = Self::create(src_device, src_incarnation, dst_device, edge_name, frame_iter);
        Ok(Self {
            src_device: src_device.to_owned(),
            src,
            src_incarnation,
            dst_device: dst_device.to_owned(),
            dst,
            edge_name: edge_name.to_owned(),
            frame_iter,
            buf,
        })
    }

    /// Shorthand for `parse(&create(..))`.
    pub fn from_parts(
        src_device: &str,
        src_incarnation: u64,
        dst_device: &str,
        edge_name: &str,
        frame_iter: FrameAndIter,
    ) -> Result<Self> {
        Self::parse(&Self::create(src_device, src_incarnation, dst_device, edge_name, frame_iter))
    }

    /// The canonical string form of this key.
    pub fn full_key(&self) -> &str {
        &self.buf
    }

    /// Producer device, as written in the key.
    pub fn src_device(&self) -> &str {
        &self.src_device
    }

    /// Producer device, parsed.
    pub fn src(&self) -> &DeviceName {
        &self.src
    }

    /// Incarnation of the producer device.
    pub fn src_incarnation(&self) -> u64 {
        self.src_incarnation
    }

    /// Consumer device, as written in the key.
    pub fn dst_device(&self) -> &str {
        &self.dst_device
    }

    /// Consumer device, parsed.
    pub fn dst(&self) -> &DeviceName {
        &self.dst
    }

    /// Edge (tensor) name, including any transfer suffix.
    pub fn edge_name(&self) -> &str {
        &self.edge_name
    }

    /// Frame and iteration the key belongs to.
    pub fn frame_iter(&self) -> FrameAndIter {
        self.frame_iter
    }

    fn identity(&self) -> (&str, u64, &str, &str, FrameAndIter) {
        (
            &self.src_device,
            self.src_incarnation,
            &self.dst_device,
            &self.edge_name,
            self.frame_iter,
        )
    }
}

impl PartialEq for ParsedKey {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for ParsedKey {}

impl Hash for ParsedKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

impl fmt::Display for ParsedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.buf)
    }
}

impl std::str::FromStr for ParsedKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
