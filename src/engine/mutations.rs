use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::error::{Constraint, StoreError};
use super::guard::{check_capacity, now_ms, validate_event_id, validate_rank, validate_window, Candidate};
use super::rank::{plan_insert, plan_move, Shift};
use super::store::Txn;
use super::{Engine, EngineError};

fn apply_shifts(txn: &mut Txn<'_>, shifts: &[Shift], now: Ms) -> Result<(), EngineError> {
    for shift in shifts {
        txn.set_rank(shift.id, shift.to, now)?;
    }
    metrics::histogram!(crate::observability::RANK_SHIFTS_PER_WRITE).record(shifts.len() as f64);
    Ok(())
}

fn record_outcome<T>(op: &'static str, result: &Result<T, EngineError>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(EngineError::InvalidInput(_) | EngineError::InvalidWindow { .. }) => "invalid",
        Err(EngineError::CapacityExceeded { .. }) => "capacity_exceeded",
        Err(EngineError::NotFound(_)) => "not_found",
        Err(EngineError::LimitExceeded(_)) => "limit_exceeded",
        Err(EngineError::Store(_)) => "store_error",
    };
    metrics::counter!(crate::observability::SLOT_OPERATIONS_TOTAL, "op" => op, "outcome" => outcome)
        .increment(1);
}

impl Engine {
    /// Feature an event. Inserts a new slot, or, when the event is already
    /// featured, moves and rewrites the existing slot instead.
    pub async fn add(&self, new: NewSlot) -> Result<AddOutcome, EngineError> {
        let result = self.add_inner(new).await;
        record_outcome("add", &result);
        result
    }

    async fn add_inner(&self, new: NewSlot) -> Result<AddOutcome, EngineError> {
        validate_event_id(&new.event_id)?;
        validate_rank(new.rank)?;
        validate_window(&new.window)?;

        let mut table = self.table.write().await;
        let mut txn = Txn::begin(&mut table);
        let now = now_ms();

        // A re-add of an already featured event must not be blocked by its own row.
        let holder = txn.table().find_by_event(&new.event_id).map(|s| s.id);
        if holder.is_none() && txn.table().len() >= MAX_SLOTS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many featured slots"));
        }
        check_capacity(
            txn.table(),
            &Candidate {
                exclude: holder,
                is_active: new.is_active,
                window: new.window,
            },
            self.settings.max_active,
        )?;

        let plan = plan_insert(&txn.table().ranks(), new.rank, self.settings.seed_rank)?;
        debug!(
            "add {}: rank {} with {} shifts",
            new.event_id,
            plan.rank,
            plan.shifts.len()
        );

        let savepoint = txn.savepoint();
        apply_shifts(&mut txn, &plan.shifts, now)?;

        let id = Ulid::new();
        let slot = FeaturedSlot {
            id,
            event_id: new.event_id.clone(),
            rank: plan.rank,
            is_active: new.is_active,
            window: new.window,
            created_at: now,
            updated_at: now,
        };
        let outcome = match txn.insert(slot) {
            Ok(()) => AddOutcome { id, created: true },
            Err(StoreError::UniqueViolation(Constraint::EventId { existing })) => {
                txn.rollback_to(savepoint);
                self.readd_in_place(&mut txn, existing, &new, now)?;
                AddOutcome {
                    id: existing,
                    created: false,
                }
            }
            Err(e) => return Err(e.into()),
        };

        self.commit(txn).await?;
        info!(
            "featured {} as slot {} ({})",
            new.event_id,
            outcome.id,
            if outcome.created { "created" } else { "updated" }
        );
        Ok(outcome)
    }

    /// Duplicate-add fallback: the event already has a slot, so move it to the
    /// requested rank and take the requested activity and window.
    fn readd_in_place(
        &self,
        txn: &mut Txn<'_>,
        existing: Ulid,
        new: &NewSlot,
        now: Ms,
    ) -> Result<(), EngineError> {
        let current = txn
            .table()
            .get(&existing)
            .cloned()
            .ok_or(EngineError::NotFound(existing))?;

        check_capacity(
            txn.table(),
            &Candidate {
                exclude: Some(existing),
                is_active: new.is_active,
                window: new.window,
            },
            self.settings.max_active,
        )?;

        let rank = new.rank.unwrap_or(current.rank);
        let shifts = plan_move(&txn.table().ranks(), existing, current.rank, rank)?;
        apply_shifts(txn, &shifts, now)?;

        txn.update(FeaturedSlot {
            rank,
            is_active: new.is_active,
            window: new.window,
            updated_at: now,
            ..current
        })?;
        Ok(())
    }

    /// Apply a partial change. A present `rank` moves the slot and shifts the
    /// neighbors in between.
    pub async fn update(&self, id: Ulid, patch: SlotPatch) -> Result<FeaturedSlot, EngineError> {
        let result = self.update_inner(id, patch).await;
        record_outcome("update", &result);
        result
    }

    async fn update_inner(&self, id: Ulid, patch: SlotPatch) -> Result<FeaturedSlot, EngineError> {
        validate_rank(patch.rank)?;
        if patch.is_empty() {
            return self.get_slot(id).await;
        }

        let mut table = self.table.write().await;
        let mut txn = Txn::begin(&mut table);
        let now = now_ms();

        let current = txn
            .table()
            .get(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        let (is_active, window) = patch.merge_onto(&current);
        validate_window(&window)?;
        check_capacity(
            txn.table(),
            &Candidate {
                exclude: Some(id),
                is_active,
                window,
            },
            self.settings.max_active,
        )?;

        let rank = match patch.rank {
            Some(rank) => {
                let shifts = plan_move(&txn.table().ranks(), id, current.rank, rank)?;
                debug!("move {id}: {} -> {rank} with {} shifts", current.rank, shifts.len());
                apply_shifts(&mut txn, &shifts, now)?;
                rank
            }
            None => current.rank,
        };

        let next = FeaturedSlot {
            rank,
            is_active,
            window,
            updated_at: now,
            ..current
        };
        txn.update(next.clone())?;

        self.commit(txn).await?;
        info!("updated slot {id}");
        Ok(next)
    }

    /// Delete a slot. Survivors keep their ranks; the gap is legal.
    pub async fn remove(&self, id: Ulid) -> Result<FeaturedSlot, EngineError> {
        let result = self.remove_inner(id).await;
        record_outcome("remove", &result);
        result
    }

    async fn remove_inner(&self, id: Ulid) -> Result<FeaturedSlot, EngineError> {
        let mut table = self.table.write().await;
        let mut txn = Txn::begin(&mut table);
        let removed = match txn.delete(id) {
            Ok(slot) => slot,
            Err(StoreError::MissingRow(_)) => return Err(EngineError::NotFound(id)),
            Err(e) => return Err(e.into()),
        };
        self.commit(txn).await?;
        info!("removed slot {id} (event {})", removed.event_id);
        Ok(removed)
    }
}
