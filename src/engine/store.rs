use std::collections::{HashMap, HashSet};
use std::ops::RangeBounds;

use ulid::Ulid;

use crate::model::*;

use super::error::{Constraint, StoreError};

/// The persisted slot collection of one tenant, held in memory and rebuilt
/// from the WAL on open.
#[derive(Debug, Default)]
pub struct SlotTable {
    slots: HashMap<Ulid, FeaturedSlot>,
    /// Unique index: event id → slot id.
    by_event: HashMap<String, Ulid>,
}

impl SlotTable {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Selects ──────────────────────────────────────────────

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, id: &Ulid) -> Option<&FeaturedSlot> {
        self.slots.get(id)
    }

    pub fn find_by_event(&self, event_id: &str) -> Option<&FeaturedSlot> {
        self.by_event.get(event_id).and_then(|id| self.slots.get(id))
    }

    /// All `(id, rank)` pairs, rank ascending.
    pub fn ranks(&self) -> Vec<(Ulid, Rank)> {
        let mut ranks: Vec<(Ulid, Rank)> = self.slots.values().map(|s| (s.id, s.rank)).collect();
        ranks.sort_by_key(|&(id, rank)| (rank, id));
        ranks
    }

    /// Ids and ranks of rows whose rank falls in `range`, rank ascending.
    pub fn ranks_in(&self, range: impl RangeBounds<Rank>) -> Vec<(Ulid, Rank)> {
        self.ranks()
            .into_iter()
            .filter(|(_, rank)| range.contains(rank))
            .collect()
    }

    pub fn max_rank(&self) -> Option<Rank> {
        self.slots.values().map(|s| s.rank).max()
    }

    /// Rows in display order.
    pub fn ordered(&self) -> Vec<&FeaturedSlot> {
        let mut rows: Vec<&FeaturedSlot> = self.slots.values().collect();
        rows.sort_by_key(|s| (s.rank, s.id));
        rows
    }

    /// Active rows whose window overlaps `window`, skipping `exclude`.
    pub fn active_overlapping<'a>(
        &'a self,
        window: &'a Window,
        exclude: Option<Ulid>,
    ) -> impl Iterator<Item = &'a FeaturedSlot> + 'a {
        self.slots
            .values()
            .filter(move |s| s.is_active && Some(s.id) != exclude && s.window.overlaps(window))
    }

    /// First rank held by more than one row, if any.
    pub fn rank_collision(&self) -> Option<Rank> {
        let mut seen = HashSet::with_capacity(self.slots.len());
        self.slots
            .values()
            .map(|s| s.rank)
            .find(|rank| !seen.insert(*rank))
    }

    /// The whole table as one commit, for WAL compaction.
    pub fn snapshot(&self) -> Commit {
        Commit {
            events: self
                .ordered()
                .into_iter()
                .map(|slot| Event::SlotInserted { slot: slot.clone() })
                .collect(),
        }
    }

    // ── Raw writes (no constraint checks) ────────────────────

    fn put(&mut self, slot: FeaturedSlot) {
        if let Some(prev) = self.slots.get(&slot.id)
            && prev.event_id != slot.event_id
        {
            self.by_event.remove(&prev.event_id);
        }
        self.by_event.insert(slot.event_id.clone(), slot.id);
        self.slots.insert(slot.id, slot);
    }

    fn take(&mut self, id: &Ulid) -> Option<FeaturedSlot> {
        let slot = self.slots.remove(id)?;
        self.by_event.remove(&slot.event_id);
        Some(slot)
    }

    /// Apply a committed event (WAL replay).
    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::SlotInserted { slot } | Event::SlotUpdated { slot } => self.put(slot.clone()),
            Event::SlotRanked {
                id,
                rank,
                updated_at,
            } => {
                if let Some(slot) = self.slots.get_mut(id) {
                    slot.rank = *rank;
                    slot.updated_at = *updated_at;
                }
            }
            Event::SlotRemoved { id } => {
                self.take(id);
            }
        }
    }
}

// ── Transactions ─────────────────────────────────────────────

enum Undo {
    Inserted(Ulid),
    Replaced(FeaturedSlot),
    Removed(FeaturedSlot),
}

#[derive(Debug, Clone, Copy)]
pub struct Savepoint {
    events: usize,
    undo: usize,
}

/// Writes against a [`SlotTable`] the caller holds exclusively.
///
/// Writes land in the table immediately and are undone if the transaction is
/// dropped without [`Txn::finish`]. `event_id` uniqueness is checked on every
/// write; rank uniqueness is deferred to [`Txn::check_deferred`].
pub struct Txn<'a> {
    table: &'a mut SlotTable,
    events: Vec<Event>,
    undo: Vec<Undo>,
    done: bool,
}

impl<'a> Txn<'a> {
    pub fn begin(table: &'a mut SlotTable) -> Self {
        Self {
            table,
            events: Vec::new(),
            undo: Vec::new(),
            done: false,
        }
    }

    /// Current view, including this transaction's own writes.
    pub fn table(&self) -> &SlotTable {
        &*self.table
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn savepoint(&self) -> Savepoint {
        Savepoint {
            events: self.events.len(),
            undo: self.undo.len(),
        }
    }

    pub fn rollback_to(&mut self, savepoint: Savepoint) {
        while self.undo.len() > savepoint.undo {
            match self.undo.pop() {
                Some(Undo::Inserted(id)) => {
                    self.table.take(&id);
                }
                Some(Undo::Replaced(prev)) | Some(Undo::Removed(prev)) => self.table.put(prev),
                None => break,
            }
        }
        self.events.truncate(savepoint.events);
    }

    pub fn insert(&mut self, slot: FeaturedSlot) -> Result<(), StoreError> {
        if let Some(existing) = self.table.find_by_event(&slot.event_id) {
            return Err(StoreError::UniqueViolation(Constraint::EventId {
                existing: existing.id,
            }));
        }
        self.undo.push(Undo::Inserted(slot.id));
        self.events.push(Event::SlotInserted { slot: slot.clone() });
        self.table.put(slot);
        Ok(())
    }

    /// Replace the full row.
    pub fn update(&mut self, slot: FeaturedSlot) -> Result<(), StoreError> {
        let prev = self
            .table
            .get(&slot.id)
            .cloned()
            .ok_or(StoreError::MissingRow(slot.id))?;
        if let Some(holder) = self.table.find_by_event(&slot.event_id)
            && holder.id != slot.id
        {
            return Err(StoreError::UniqueViolation(Constraint::EventId {
                existing: holder.id,
            }));
        }
        self.undo.push(Undo::Replaced(prev));
        self.events.push(Event::SlotUpdated { slot: slot.clone() });
        self.table.put(slot);
        Ok(())
    }

    pub fn set_rank(&mut self, id: Ulid, rank: Rank, now: Ms) -> Result<(), StoreError> {
        let prev = self
            .table
            .get(&id)
            .cloned()
            .ok_or(StoreError::MissingRow(id))?;
        let mut next = prev.clone();
        next.rank = rank;
        next.updated_at = now;
        self.undo.push(Undo::Replaced(prev));
        self.events.push(Event::SlotRanked {
            id,
            rank,
            updated_at: now,
        });
        self.table.put(next);
        Ok(())
    }

    pub fn delete(&mut self, id: Ulid) -> Result<FeaturedSlot, StoreError> {
        let prev = self.table.take(&id).ok_or(StoreError::MissingRow(id))?;
        self.undo.push(Undo::Removed(prev.clone()));
        self.events.push(Event::SlotRemoved { id });
        Ok(prev)
    }

    /// Deferred constraints: no two rows share a rank.
    pub fn check_deferred(&self) -> Result<(), StoreError> {
        match self.table.rank_collision() {
            Some(rank) => Err(StoreError::UniqueViolation(Constraint::Rank(rank))),
            None => Ok(()),
        }
    }

    /// Keep every write and hand back the staged events.
    pub fn finish(mut self) -> Vec<Event> {
        self.done = true;
        std::mem::take(&mut self.events)
    }
}

impl Drop for Txn<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.rollback_to(Savepoint { events: 0, undo: 0 });
        }
    }
}
