//! Domain events published to the outbox by committed units of work.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use lonerp_core::{
    ActorId, CycleCountId, GuaranteeAccountId, GuaranteeEntryId, ItemId, LocationId, MovementId,
    Mrn, Quantity,
};
use lonerp_customs::EntryType;
use lonerp_events::Event;
use lonerp_inventory::{BalanceKey, MovementKind, QualityStatus};
use lonerp_traceability::TraceNode;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    MovementRecorded {
        movement_id: MovementId,
        number: u64,
        kind: MovementKind,
        item_id: ItemId,
        from_location: Option<LocationId>,
        to_location: Option<LocationId>,
        quantity: Quantity,
        occurred_at: DateTime<Utc>,
    },
    QualityStatusChanged {
        key: BalanceKey,
        to: QualityStatus,
        quantity: Quantity,
        actor: ActorId,
        movement_number: u64,
        occurred_at: DateTime<Utc>,
    },
    MrnRegistered {
        mrn: Mrn,
        total: Quantity,
        occurred_at: DateTime<Utc>,
    },
    MrnConsumed {
        mrn: Mrn,
        quantity: Quantity,
        used: Quantity,
        /// Movement that consumed the quantity, if any.
        movement_number: Option<u64>,
        occurred_at: DateTime<Utc>,
    },
    MrnReleased {
        mrn: Mrn,
        quantity: Quantity,
        used: Quantity,
        occurred_at: DateTime<Utc>,
    },
    MrnDeactivated {
        mrn: Mrn,
        occurred_at: DateTime<Utc>,
    },
    TraceLinkRecorded {
        source: TraceNode,
        target: TraceNode,
        item_id: ItemId,
        quantity: Quantity,
        occurred_at: DateTime<Utc>,
    },
    GuaranteeAccountOpened {
        account_id: GuaranteeAccountId,
        account_number: String,
        total_limit: Decimal,
        occurred_at: DateTime<Utc>,
    },
    GuaranteeEntryPosted {
        account_id: GuaranteeAccountId,
        entry_id: GuaranteeEntryId,
        entry_type: EntryType,
        amount: Decimal,
        balance: Decimal,
        occurred_at: DateTime<Utc>,
    },
    GuaranteeEntryReleased {
        account_id: GuaranteeAccountId,
        entry_id: GuaranteeEntryId,
        credit_id: GuaranteeEntryId,
        balance: Decimal,
        occurred_at: DateTime<Utc>,
    },
    CycleCountStarted {
        cycle_count_id: CycleCountId,
        location_id: LocationId,
        lines: usize,
        occurred_at: DateTime<Utc>,
    },
    CycleCountCompleted {
        cycle_count_id: CycleCountId,
        location_id: LocationId,
        variance_movements: Vec<u64>,
        occurred_at: DateTime<Utc>,
    },
    CycleCountCancelled {
        cycle_count_id: CycleCountId,
        occurred_at: DateTime<Utc>,
    },
}

impl Event for LedgerEvent {
    fn event_type(&self) -> &'static str {
        match self {
            LedgerEvent::MovementRecorded { .. } => "movement.recorded",
            LedgerEvent::QualityStatusChanged { .. } => "quality.status_changed",
            LedgerEvent::MrnRegistered { .. } => "mrn.registered",
            LedgerEvent::MrnConsumed { .. } => "mrn.consumed",
            LedgerEvent::MrnReleased { .. } => "mrn.released",
            LedgerEvent::MrnDeactivated { .. } => "mrn.deactivated",
            LedgerEvent::TraceLinkRecorded { .. } => "trace.link_recorded",
            LedgerEvent::GuaranteeAccountOpened { .. } => "guarantee.account_opened",
            LedgerEvent::GuaranteeEntryPosted { .. } => "guarantee.entry_posted",
            LedgerEvent::GuaranteeEntryReleased { .. } => "guarantee.entry_released",
            LedgerEvent::CycleCountStarted { .. } => "cycle_count.started",
            LedgerEvent::CycleCountCompleted { .. } => "cycle_count.completed",
            LedgerEvent::CycleCountCancelled { .. } => "cycle_count.cancelled",
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            LedgerEvent::MovementRecorded { occurred_at, .. }
            | LedgerEvent::QualityStatusChanged { occurred_at, .. }
            | LedgerEvent::MrnRegistered { occurred_at, .. }
            | LedgerEvent::MrnConsumed { occurred_at, .. }
            | LedgerEvent::MrnReleased { occurred_at, .. }
            | LedgerEvent::MrnDeactivated { occurred_at, .. }
            | LedgerEvent::TraceLinkRecorded { occurred_at, .. }
            | LedgerEvent::GuaranteeAccountOpened { occurred_at, .. }
            | LedgerEvent::GuaranteeEntryPosted { occurred_at, .. }
            | LedgerEvent::GuaranteeEntryReleased { occurred_at, .. }
            | LedgerEvent::CycleCountStarted { occurred_at, .. }
            | LedgerEvent::CycleCountCompleted { occurred_at, .. }
            | LedgerEvent::CycleCountCancelled { occurred_at, .. } => *occurred_at,
        }
    }

    /// Routing key: the entity the event is about.
    fn subject(&self) -> String {
        match self {
            LedgerEvent::MovementRecorded { item_id, .. } => format!("item/{item_id}"),
            LedgerEvent::QualityStatusChanged { key, .. } => format!("item/{}", key.item_id),
            LedgerEvent::MrnRegistered { mrn, .. }
            | LedgerEvent::MrnConsumed { mrn, .. }
            | LedgerEvent::MrnReleased { mrn, .. }
            | LedgerEvent::MrnDeactivated { mrn, .. } => format!("mrn/{mrn}"),
            LedgerEvent::TraceLinkRecorded { source, .. } => format!("trace/{source}"),
            LedgerEvent::GuaranteeAccountOpened { account_id, .. }
            | LedgerEvent::GuaranteeEntryPosted { account_id, .. }
            | LedgerEvent::GuaranteeEntryReleased { account_id, .. } => {
                format!("guarantee/{account_id}")
            }
            LedgerEvent::CycleCountStarted { cycle_count_id, .. }
            | LedgerEvent::CycleCountCompleted { cycle_count_id, .. }
            | LedgerEvent::CycleCountCancelled { cycle_count_id, .. } => {
                format!("cycle_count/{cycle_count_id}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_metadata_names_the_subject() {
        let mrn = Mrn::new("24MK0001").unwrap();
        let event = LedgerEvent::MrnConsumed {
            mrn,
            quantity: Quantity::units(5),
            used: Quantity::units(5),
            movement_number: Some(3),
            occurred_at: Utc::now(),
        };
        assert_eq!(event.event_type(), "mrn.consumed");
        assert_eq!(event.subject(), "mrn/24MK0001");
        assert_eq!(event.version(), 1);
    }

    #[test]
    fn serializes_with_a_type_tag() {
        let event = LedgerEvent::CycleCountCancelled {
            cycle_count_id: CycleCountId::new(),
            occurred_at: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "cycle_count_cancelled");
    }
}
