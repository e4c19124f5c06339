use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

/// Display order. Lower is shown first.
pub type Rank = i32;

/// Active window of a slot. A missing bound is unbounded on that side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub starts_at: Option<Ms>,
    pub ends_at: Option<Ms>,
}

impl Window {
    pub fn new(starts_at: Option<Ms>, ends_at: Option<Ms>) -> Self {
        Self { starts_at, ends_at }
    }

    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Start with a null bound read as -infinity.
    pub fn lower(&self) -> Ms {
        self.starts_at.unwrap_or(Ms::MIN)
    }

    /// End with a null bound read as +infinity.
    pub fn upper(&self) -> Ms {
        self.ends_at.unwrap_or(Ms::MAX)
    }

    /// `ends_at >= starts_at` whenever both are set.
    pub fn is_ordered(&self) -> bool {
        match (self.starts_at, self.ends_at) {
            (Some(start), Some(end)) => end >= start,
            _ => true,
        }
    }

    /// Inclusive on both ends: windows that merely touch overlap.
    pub fn overlaps(&self, other: &Window) -> bool {
        self.lower() <= other.upper() && other.lower() <= self.upper()
    }

    /// Half-open `[starts_at, ends_at)`.
    pub fn contains_instant(&self, t: Ms) -> bool {
        self.lower() <= t && t < self.upper()
    }
}

/// A ranked, optionally time-windowed placement of one external event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeaturedSlot {
    pub id: Ulid,
    /// Opaque reference into the external event catalog.
    pub event_id: String,
    pub rank: Rank,
    pub is_active: bool,
    pub window: Window,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl FeaturedSlot {
    /// Active flag set and `now` inside the window.
    pub fn is_effectively_active(&self, now: Ms) -> bool {
        self.is_active && self.window.contains_instant(now)
    }
}

/// Input of `add`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSlot {
    pub event_id: String,
    pub rank: Option<Rank>,
    pub is_active: bool,
    pub window: Window,
}

impl NewSlot {
    pub fn new(event_id: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            rank: None,
            is_active: true,
            window: Window::unbounded(),
        }
    }

    pub fn at_rank(mut self, rank: Rank) -> Self {
        self.rank = Some(rank);
        self
    }

    pub fn active(mut self, is_active: bool) -> Self {
        self.is_active = is_active;
        self
    }

    pub fn window(mut self, starts_at: Option<Ms>, ends_at: Option<Ms>) -> Self {
        self.window = Window::new(starts_at, ends_at);
        self
    }
}

/// Input of `update`. For the window bounds the outer `Option` means
/// "present in the update", the inner one is the nullable column.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotPatch {
    pub rank: Option<Rank>,
    pub is_active: Option<bool>,
    pub starts_at: Option<Option<Ms>>,
    pub ends_at: Option<Option<Ms>>,
}

impl SlotPatch {
    pub fn is_empty(&self) -> bool {
        self.rank.is_none()
            && self.is_active.is_none()
            && self.starts_at.is_none()
            && self.ends_at.is_none()
    }

    /// Effective next state of `current` (rank excluded; rank moves are planned separately).
    pub fn merge_onto(&self, current: &FeaturedSlot) -> (bool, Window) {
        let is_active = self.is_active.unwrap_or(current.is_active);
        let window = Window {
            starts_at: self.starts_at.unwrap_or(current.window.starts_at),
            ends_at: self.ends_at.unwrap_or(current.window.ends_at),
        };
        (is_active, window)
    }
}

/// What `add` did: a fresh row, or an update of the row already holding the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddOutcome {
    pub id: Ulid,
    pub created: bool,
}

/// Change records, flat with no nesting. Published on the change feed and
/// grouped into a [`Commit`] in the WAL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SlotInserted {
        slot: FeaturedSlot,
    },
    SlotUpdated {
        slot: FeaturedSlot,
    },
    /// Neighbor shifted to make room for an insert or move.
    SlotRanked {
        id: Ulid,
        rank: Rank,
        updated_at: Ms,
    },
    SlotRemoved {
        id: Ulid,
    },
}

impl Event {
    pub fn slot_id(&self) -> Ulid {
        match self {
            Event::SlotInserted { slot } | Event::SlotUpdated { slot } => slot.id,
            Event::SlotRanked { id, .. } | Event::SlotRemoved { id } => *id,
        }
    }
}

/// One transaction. The WAL record format: replayed all-or-nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub events: Vec<Event>,
}
