use ulid::Ulid;

use crate::model::Rank;

use super::EngineError;

/// One neighbor rank change, written before the target row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shift {
    pub id: Ulid,
    pub from: Rank,
    pub to: Rank,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertPlan {
    pub rank: Rank,
    pub shifts: Vec<Shift>,
}

fn bump(rank: Rank, by: Rank) -> Result<Rank, EngineError> {
    rank.checked_add(by)
        .ok_or(EngineError::InvalidInput("rank out of range"))
}

/// Plan the rank of a new row.
///
/// Without a target the row goes after the current maximum (or at `seed` on
/// an empty table). With a target, every row at or above it moves up by one.
/// `ranks` must be sorted ascending; shifts come back highest first so that
/// no two neighbors ever swap through the same rank.
pub fn plan_insert(
    ranks: &[(Ulid, Rank)],
    target: Option<Rank>,
    seed: Rank,
) -> Result<InsertPlan, EngineError> {
    let Some(target) = target else {
        let rank = match ranks.last() {
            Some(&(_, max)) => bump(max, 1)?,
            None => seed,
        };
        return Ok(InsertPlan { rank, shifts: Vec::new() });
    };

    let shifts = ranks
        .iter()
        .rev()
        .take_while(|&&(_, rank)| rank >= target)
        .map(|&(id, rank)| Ok(Shift { id, from: rank, to: bump(rank, 1)? }))
        .collect::<Result<Vec<_>, EngineError>>()?;

    Ok(InsertPlan { rank: target, shifts })
}

/// Plan the neighbor shifts for moving `id` from `old_rank` to `new_rank`.
///
/// Moving up the list (to a lower rank) pushes `[new, old)` up by one;
/// moving down pulls `(old, new]` down by one. The moved row itself is not
/// part of the plan; the caller writes it last.
pub fn plan_move(
    ranks: &[(Ulid, Rank)],
    id: Ulid,
    old_rank: Rank,
    new_rank: Rank,
) -> Result<Vec<Shift>, EngineError> {
    if new_rank == old_rank {
        return Ok(Vec::new());
    }

    let neighbors = ranks.iter().filter(|&&(other, _)| other != id);

    if new_rank < old_rank {
        neighbors
            .rev()
            .filter(|&&(_, rank)| rank >= new_rank && rank < old_rank)
            .map(|&(id, rank)| Ok(Shift { id, from: rank, to: bump(rank, 1)? }))
            .collect()
    } else {
        neighbors
            .filter(|&&(_, rank)| rank > old_rank && rank <= new_rank)
            .map(|&(id, rank)| Ok(Shift { id, from: rank, to: bump(rank, -1)? }))
            .collect()
    }
}
