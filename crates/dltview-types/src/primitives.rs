use facet::Facet;
use std::fmt;

/// Engine-assigned stream identifier.
///
/// A stream id is never reused: re-windowing a stream retires the old id and
/// the engine hands out a fresh one.
#[derive(Facet, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[facet(transparent)]
pub struct StreamId(pub(crate) u32);

impl StreamId {
    pub fn new(id: u32) -> Self {
        assert!(id > 0, "invariant violated: stream id must be non-zero");
        Self(id)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Persistent lifecycle identifier, stable across re-windowing.
///
/// Only valid for the session (and sort mode) that produced it.
#[derive(Facet, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[facet(transparent)]
pub struct LifecycleId(pub(crate) u32);

impl LifecycleId {
    pub fn new(id: u32) -> Self {
        assert!(id > 0, "invariant violated: lifecycle id must be non-zero");
        Self(id)
    }

    /// The engine encodes "no lifecycle" as zero.
    pub fn from_wire(raw: u32) -> Option<Self> {
        (raw != 0).then_some(Self(raw))
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for LifecycleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LC#{}", self.0)
    }
}

/// Client-side sequence number tagging each text request.
///
/// The engine does not echo it; it only makes reply pairing checkable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestSeq(u64);

impl RequestSeq {
    pub const ONE: Self = Self(1);

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for RequestSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "REQ#{}", self.0)
    }
}

/// Half-open record-index range `[start, end)` requested from the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Window {
    pub start: u32,
    pub end: u32,
}

impl Window {
    pub fn new(start: u32, end: u32) -> Self {
        assert!(
            start <= end,
            "invariant violated: window start {start} must not exceed end {end}"
        );
        Self { start, end }
    }

    /// The page `[skip, skip + page_size)`.
    pub fn page(skip: u32, page_size: u32) -> Self {
        Self::new(skip, skip.saturating_add(page_size))
    }

    pub fn len(&self) -> u32 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, index: u32) -> bool {
        index >= self.start && index < self.end
    }

    pub fn as_array(&self) -> [u32; 2] {
        [self.start, self.end]
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.start, self.end)
    }
}
