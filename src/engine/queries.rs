use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    pub async fn get_slot(&self, id: Ulid) -> Result<FeaturedSlot, EngineError> {
        self.table
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))
    }

    pub async fn find_by_event(&self, event_id: &str) -> Option<FeaturedSlot> {
        self.table.read().await.find_by_event(event_id).cloned()
    }

    /// Every slot, display order.
    pub async fn list_slots(&self) -> Vec<FeaturedSlot> {
        self.table
            .read()
            .await
            .ordered()
            .into_iter()
            .cloned()
            .collect()
    }

    /// Slots effectively active at `now`, display order.
    pub async fn featured_at(&self, now: Ms) -> Vec<FeaturedSlot> {
        self.table
            .read()
            .await
            .ordered()
            .into_iter()
            .filter(|s| s.is_effectively_active(now))
            .cloned()
            .collect()
    }

    pub async fn slot_count(&self) -> usize {
        self.table.read().await.len()
    }
}
