//! The inventory & customs ledger engine.
//!
//! `InventoryLedger` composes the pure domain crates into one transactional
//! service. Every business operation runs as a **unit of work**:
//!
//! ```text
//! command
//!   ↓
//! 1. Validate the command and check the reference catalog (no locks, no state)
//!   ↓
//! 2. Claim the key locks it touches (balance rows, MRNs, accounts, counts)
//!   ↓
//! 3. Plan under a read snapshot: build movement lines, stage balance rows,
//!    MRN usage and trace links (nothing is published yet)
//!   ↓
//! 4. Commit under one short write latch: refuse links that would close a
//!    genealogy cycle, then number the movements, publish the staged rows,
//!    MRN entries, links, audit records and outbox events
//! ```
//!
//! A rejection at any step leaves the ledger exactly as it was. Readers take
//! the read latch, so they see a unit of work entirely or not at all.
//!
//! Key locks are the only serialization point for business decisions: units
//! of work on disjoint keys plan in parallel and only meet at the commit
//! latch. Lock contention is retried per [`RetryPolicy`]; the business logic
//! itself is never retried.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use lonerp_core::{
    ActorId, BatchNumber, CycleCountId, DocumentRef, ErrorKind, GuaranteeAccountId,
    GuaranteeEntryId, ItemId, LedgerError, LedgerResult, LocationId, MovementId, Mrn, Quantity,
    UomId,
};
use lonerp_customs::{
    GuaranteeAccount, GuaranteeExposure, GuaranteeLedger, GuaranteeLedgerEntry, GuaranteePosting,
    MrnRegistry, MrnRegistryEntry, MrnUtilization,
};
use lonerp_events::{EventEnvelope, InMemoryOutbox, Outbox, Subscription};
use lonerp_inventory::{
    BalanceFilter, BalanceKey, BalanceMismatch, BalanceStore, CycleCount, CycleCountSummary,
    InventoryBalance, InventoryMovement, MovementFilter, MovementKind, MovementLine,
    QualityStatus, StatusTransition, validate_transition,
};
use lonerp_traceability::{
    CancelToken, Direction, TraceEndpoint, TraceGraph, TraceLink, TraceNode,
};

use crate::catalog::{OpenCatalog, ReferenceCatalog};
use crate::config::{LedgerConfig, RetryPolicy};
use crate::events::LedgerEvent;
use crate::locks::{KeyLocks, LockKey};

/// Request to re-classify stock from `key.quality` to `target`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChangeRequest {
    pub key: BalanceKey,
    pub target: QualityStatus,
    /// Defaults to the whole row.
    pub quantity: Option<Quantity>,
    pub reason: String,
    pub actor: ActorId,
    pub at: DateTime<Utc>,
}

impl StatusChangeRequest {
    pub fn new(
        key: BalanceKey,
        target: QualityStatus,
        reason: impl Into<String>,
        actor: ActorId,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            key,
            target,
            quantity: None,
            reason: reason.into(),
            actor,
            at,
        }
    }

    pub fn partial(mut self, quantity: Quantity) -> Self {
        self.quantity = Some(quantity);
        self
    }
}

/// A production order: inputs issued, one output batch received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductionRun {
    pub order: DocumentRef,
    /// `ProductionIssue` lines.
    pub consumed: Vec<MovementLine>,
    /// `ProductionReceipt` line carrying the output batch.
    pub produced: MovementLine,
}

/// A node reached by a trace query, with its distance from the start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracedNode {
    pub node: TraceNode,
    pub depth: usize,
}

#[derive(Debug, Default)]
struct LedgerState {
    journal: Vec<InventoryMovement>,
    balances: BalanceStore,
    mrns: MrnRegistry,
    trace: TraceGraph,
    guarantees: GuaranteeLedger,
    transitions: Vec<StatusTransition>,
    cycle_counts: HashMap<CycleCountId, CycleCount>,
}

#[derive(Debug)]
struct PendingTransition {
    key: BalanceKey,
    to: QualityStatus,
    quantity: Quantity,
    reason: String,
    actor: ActorId,
    at: DateTime<Utc>,
}

/// Everything one business operation wants to record.
#[derive(Debug, Default)]
struct UnitOfWork {
    lines: Vec<MovementLine>,
    links: Vec<TraceLink>,
    transition: Option<PendingTransition>,
    /// Cycle count to store in its new state.
    cycle_count: Option<CycleCount>,
}

#[derive(Debug)]
struct MrnConsumption {
    line: usize,
    mrn: Mrn,
    quantity: Quantity,
    used: Quantity,
}

/// Output of planning: validated, not yet visible.
#[derive(Debug)]
struct Staged {
    rows: Vec<InventoryBalance>,
    mrns: Vec<MrnRegistryEntry>,
    consumptions: Vec<MrnConsumption>,
    link_nodes: Vec<(TraceNode, TraceNode)>,
}

#[derive(Debug)]
struct Committed {
    movements: Vec<InventoryMovement>,
    transition: Option<StatusTransition>,
}

pub struct InventoryLedger<C: ReferenceCatalog = OpenCatalog> {
    config: LedgerConfig,
    retry: RetryPolicy,
    locks: KeyLocks,
    state: RwLock<LedgerState>,
    outbox: Arc<InMemoryOutbox<LedgerEvent>>,
    catalog: C,
}

impl InventoryLedger<OpenCatalog> {
    pub fn new() -> Self {
        Self::with_config(LedgerConfig::default())
    }

    pub fn with_config(config: LedgerConfig) -> Self {
        Self::with_catalog(config, OpenCatalog)
    }
}

impl Default for InventoryLedger<OpenCatalog> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: ReferenceCatalog> core::fmt::Debug for InventoryLedger<C> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InventoryLedger")
            .field("config", &self.config)
            .field("held_keys", &self.locks.held())
            .finish_non_exhaustive()
    }
}

impl<C: ReferenceCatalog> InventoryLedger<C> {
    pub fn with_catalog(config: LedgerConfig, catalog: C) -> Self {
        let retry = config.retry_policy();
        let outbox = Arc::new(InMemoryOutbox::with_capacity(config.outbox_capacity));
        Self {
            config,
            retry,
            locks: KeyLocks::new(),
            state: RwLock::new(LedgerState::default()),
            outbox,
            catalog,
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn catalog(&self) -> &C {
        &self.catalog
    }

    // ---------------------------------------------------------------------
    // Movements
    // ---------------------------------------------------------------------

    /// Record one movement and its balance update atomically.
    ///
    /// Outbound lines carrying an MRN consume it in the same unit of work;
    /// receipts of an MRN-tagged batch and referenced shipments add trace links.
    pub fn append(&self, line: MovementLine) -> LedgerResult<InventoryMovement> {
        self.append_lines(vec![line])
            .and_then(|mut movements| {
                movements
                    .pop()
                    .ok_or_else(|| LedgerError::storage("unit of work recorded no movement"))
            })
            .inspect_err(log_rejection("append"))
    }

    /// Record several movements as one unit of work: all or none.
    pub fn append_all(&self, lines: Vec<MovementLine>) -> LedgerResult<Vec<InventoryMovement>> {
        self.append_lines(lines).inspect_err(log_rejection("append_all"))
    }

    fn append_lines(&self, lines: Vec<MovementLine>) -> LedgerResult<Vec<InventoryMovement>> {
        if lines.is_empty() {
            return Err(LedgerError::validation("no movements to append"));
        }
        for line in &lines {
            if matches!(
                line.kind,
                MovementKind::StatusChange | MovementKind::CycleCountVariance
            ) {
                return Err(LedgerError::validation(format!(
                    "{} movements are recorded by their own workflow",
                    line.kind.label()
                )));
            }
            self.prepare(line)?;
        }

        let keys = lines.iter().flat_map(line_lock_keys).collect();
        let links = lines.iter().flat_map(automatic_links).collect();
        let work = UnitOfWork {
            lines,
            links,
            ..UnitOfWork::default()
        };
        Ok(self.execute(keys, |_| Ok(work))?.movements)
    }

    /// Issue the inputs and receive the output of a production order in one
    /// unit of work, linking every consumed batch/MRN to the output batch.
    pub fn record_production_run(&self, run: ProductionRun) -> LedgerResult<Vec<InventoryMovement>> {
        self.production_run(run)
            .inspect_err(log_rejection("record_production_run"))
    }

    fn production_run(&self, run: ProductionRun) -> LedgerResult<Vec<InventoryMovement>> {
        let ProductionRun {
            order,
            consumed,
            produced,
        } = run;

        if consumed.is_empty() {
            return Err(LedgerError::validation("production run consumes nothing"));
        }
        if let Some(line) = consumed
            .iter()
            .find(|l| l.kind != MovementKind::ProductionIssue)
        {
            return Err(LedgerError::validation(format!(
                "production inputs must be production issues, got {}",
                line.kind.label()
            )));
        }
        if produced.kind != MovementKind::ProductionReceipt {
            return Err(LedgerError::validation(format!(
                "production output must be a production receipt, got {}",
                produced.kind.label()
            )));
        }
        let output = produced
            .batch
            .clone()
            .ok_or_else(|| LedgerError::validation("production output requires a batch"))?;
        if consumed.iter().any(|l| l.batch.as_ref() == Some(&output)) {
            return Err(LedgerError::validation(format!(
                "production output batch {output} is also one of its inputs"
            )));
        }

        let target = TraceEndpoint {
            document: Some(order.clone()),
            batch: Some(output),
            mrn: produced.mrn.clone(),
        };
        let links: Vec<TraceLink> = consumed
            .iter()
            .filter(|l| l.batch.is_some() || l.mrn.is_some())
            .map(|l| {
                TraceLink::new(
                    TraceEndpoint {
                        document: Some(order.clone()),
                        batch: l.batch.clone(),
                        mrn: l.mrn.clone(),
                    },
                    target.clone(),
                    l.item_id,
                    l.quantity,
                    l.occurred_at,
                )
            })
            .collect();

        let lines: Vec<MovementLine> = consumed
            .into_iter()
            .chain(std::iter::once(produced))
            .map(|mut line| {
                if line.reference.is_none() {
                    line.reference = Some(order.clone());
                }
                line
            })
            .collect();
        for line in &lines {
            self.prepare(line)?;
        }

        let keys = lines.iter().flat_map(line_lock_keys).collect();
        let work = UnitOfWork {
            lines,
            links,
            ..UnitOfWork::default()
        };
        Ok(self.execute(keys, |_| Ok(work))?.movements)
    }

    pub fn get_movement(&self, number: u64) -> LedgerResult<InventoryMovement> {
        let state = self.read()?;
        usize::try_from(number)
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|index| state.journal.get(index))
            .cloned()
            .ok_or_else(|| LedgerError::not_found("movement", number))
    }

    /// Matching movements, ordered by movement number.
    pub fn list_movements(&self, filter: &MovementFilter) -> LedgerResult<Vec<InventoryMovement>> {
        let state = self.read()?;
        Ok(state
            .journal
            .iter()
            .filter(|m| filter.matches(m))
            .cloned()
            .collect())
    }

    pub fn movement_count(&self) -> LedgerResult<usize> {
        Ok(self.read()?.journal.len())
    }

    /// Display form of a movement number, e.g. `MOV-00000042`.
    pub fn display_number(&self, movement: &InventoryMovement) -> String {
        movement.display_number(&self.config.movement_prefix)
    }

    // ---------------------------------------------------------------------
    // Balances
    // ---------------------------------------------------------------------

    pub fn balance(&self, key: &BalanceKey) -> LedgerResult<Option<InventoryBalance>> {
        Ok(self.read()?.balances.get(key).cloned())
    }

    pub fn list_balances(&self, filter: &BalanceFilter) -> LedgerResult<Vec<InventoryBalance>> {
        Ok(self.read()?.balances.list(filter))
    }

    /// Total across every quality status.
    pub fn on_hand(&self, item_id: ItemId, location_id: Option<LocationId>) -> LedgerResult<Quantity> {
        Ok(self.read()?.balances.on_hand(item_id, location_id))
    }

    /// OK stock only.
    pub fn available(
        &self,
        item_id: ItemId,
        location_id: Option<LocationId>,
    ) -> LedgerResult<Quantity> {
        Ok(self.read()?.balances.available(item_id, location_id))
    }

    pub fn totals_by_batch(&self, item_id: ItemId) -> LedgerResult<BTreeMap<BatchNumber, Quantity>> {
        Ok(self.read()?.balances.totals_by_batch(item_id))
    }

    pub fn totals_by_mrn(&self) -> LedgerResult<BTreeMap<Mrn, Quantity>> {
        Ok(self.read()?.balances.totals_by_mrn())
    }

    /// Blocked and quarantined rows holding stock.
    pub fn non_eligible(&self) -> LedgerResult<Vec<InventoryBalance>> {
        Ok(self.read()?.balances.non_eligible())
    }

    // ---------------------------------------------------------------------
    // Quality status
    // ---------------------------------------------------------------------

    /// Re-classify stock as a `StatusChange` movement plus an audit record.
    pub fn change_quality_status(
        &self,
        request: StatusChangeRequest,
    ) -> LedgerResult<StatusTransition> {
        self.quality_change(request)
            .inspect_err(log_rejection("change_quality_status"))
    }

    fn quality_change(&self, request: StatusChangeRequest) -> LedgerResult<StatusTransition> {
        let StatusChangeRequest {
            key,
            target,
            quantity,
            reason,
            actor,
            at,
        } = request;

        validate_transition(key.quality, target, &reason)?;
        self.catalog.require_item(key.item_id)?;
        self.catalog.require_location(key.location_id)?;
        if quantity.is_some_and(|q| !q.is_positive()) {
            return Err(LedgerError::validation(
                "status change quantity must be positive",
            ));
        }

        let keys = vec![
            LockKey::Balance(key.clone()),
            LockKey::Balance(key.clone().with_quality(target)),
        ];
        let committed = self.execute(keys, |state| {
            let row = state
                .balances
                .get(&key)
                .ok_or_else(|| LedgerError::not_found("balance", &key))?;
            let quantity = quantity.unwrap_or(row.quantity);
            if quantity.is_zero() {
                return Err(LedgerError::validation(format!(
                    "no stock to re-classify at {key}"
                )));
            }

            let mut line = MovementLine::status_change(
                key.item_id,
                key.location_id,
                key.quality,
                target,
                quantity,
                row.uom_id,
                at,
            )
            .with_notes(reason.clone());
            line.batch = key.batch.clone();
            line.mrn = key.mrn.clone();
            line.validate()?;

            Ok(UnitOfWork {
                lines: vec![line],
                transition: Some(PendingTransition {
                    key: key.clone(),
                    to: target,
                    quantity,
                    reason: reason.clone(),
                    actor,
                    at,
                }),
                ..UnitOfWork::default()
            })
        })?;

        committed
            .transition
            .ok_or_else(|| LedgerError::storage("status change committed without an audit record"))
    }

    /// Audit records, oldest first, optionally narrowed to an item and/or location.
    pub fn list_transitions(
        &self,
        item_id: Option<ItemId>,
        location_id: Option<LocationId>,
    ) -> LedgerResult<Vec<StatusTransition>> {
        let state = self.read()?;
        Ok(state
            .transitions
            .iter()
            .filter(|t| item_id.is_none_or(|id| t.key.item_id == id))
            .filter(|t| location_id.is_none_or(|loc| t.key.location_id == loc))
            .cloned()
            .collect())
    }

    // ---------------------------------------------------------------------
    // MRN registry
    // ---------------------------------------------------------------------

    /// Register a customs lot. Re-registering identical values is a no-op.
    pub fn register_mrn(
        &self,
        mrn: Mrn,
        total: Quantity,
        expiry_date: Option<NaiveDate>,
        at: DateTime<Utc>,
    ) -> LedgerResult<MrnRegistryEntry> {
        self.mutate(vec![LockKey::Mrn(mrn.clone())], |state| {
            match state.mrns.plan_register(mrn.clone(), total, expiry_date, at)? {
                Some(entry) => {
                    let entry = state.mrns.upsert(entry).clone();
                    let event = LedgerEvent::MrnRegistered {
                        mrn: entry.mrn.clone(),
                        total: entry.total,
                        occurred_at: at,
                    };
                    Ok((entry, vec![event]))
                }
                None => Ok((state.mrns.require(&mrn)?.clone(), Vec::new())),
            }
        })
        .inspect_err(log_rejection("register_mrn"))
    }

    /// Consume MRN quantity outside a movement (e.g. a customs declaration).
    pub fn consume_mrn(
        &self,
        mrn: &Mrn,
        quantity: Quantity,
        at: DateTime<Utc>,
        override_expiry: bool,
    ) -> LedgerResult<MrnRegistryEntry> {
        self.mutate(vec![LockKey::Mrn(mrn.clone())], |state| {
            let entry = state
                .mrns
                .consume(mrn, quantity, at.date_naive(), override_expiry)?
                .clone();
            let event = LedgerEvent::MrnConsumed {
                mrn: mrn.clone(),
                quantity,
                used: entry.used,
                movement_number: None,
                occurred_at: at,
            };
            Ok((entry, vec![event]))
        })
        .inspect_err(log_rejection("consume_mrn"))
    }

    /// Give back consumed quantity; usage is floored at zero.
    pub fn release_mrn(
        &self,
        mrn: &Mrn,
        quantity: Quantity,
        at: DateTime<Utc>,
    ) -> LedgerResult<MrnRegistryEntry> {
        self.mutate(vec![LockKey::Mrn(mrn.clone())], |state| {
            let entry = state.mrns.release(mrn, quantity)?.clone();
            let event = LedgerEvent::MrnReleased {
                mrn: mrn.clone(),
                quantity,
                used: entry.used,
                occurred_at: at,
            };
            Ok((entry, vec![event]))
        })
        .inspect_err(log_rejection("release_mrn"))
    }

    pub fn deactivate_mrn(&self, mrn: &Mrn, at: DateTime<Utc>) -> LedgerResult<MrnRegistryEntry> {
        self.mutate(vec![LockKey::Mrn(mrn.clone())], |state| {
            let entry = state.mrns.deactivate(mrn)?.clone();
            let event = LedgerEvent::MrnDeactivated {
                mrn: mrn.clone(),
                occurred_at: at,
            };
            Ok((entry, vec![event]))
        })
        .inspect_err(log_rejection("deactivate_mrn"))
    }

    pub fn mrn(&self, mrn: &Mrn) -> LedgerResult<MrnRegistryEntry> {
        Ok(self.read()?.mrns.require(mrn)?.clone())
    }

    pub fn mrn_utilization(&self, mrn: &Mrn) -> LedgerResult<MrnUtilization> {
        self.read()?.mrns.utilization(mrn)
    }

    /// Every registered MRN, ordered by MRN.
    pub fn list_mrns(&self) -> LedgerResult<Vec<MrnRegistryEntry>> {
        Ok(self.read()?.mrns.list())
    }

    // ---------------------------------------------------------------------
    // Traceability
    // ---------------------------------------------------------------------

    /// Run `f` against the genealogy graph under the read latch.
    ///
    /// Lets callers consume a lazy walk without collecting it first; writers
    /// wait until `f` returns.
    pub fn with_trace<R>(&self, f: impl FnOnce(&TraceGraph) -> R) -> LedgerResult<R> {
        Ok(f(&self.read()?.trace))
    }

    /// Everything downstream of `start`, breadth first.
    pub fn trace_forward(
        &self,
        start: &TraceNode,
        cancel: &CancelToken,
    ) -> LedgerResult<Vec<TracedNode>> {
        self.trace(start, Direction::Forward, cancel)
    }

    /// Everything upstream of `start`, breadth first.
    pub fn trace_backward(
        &self,
        start: &TraceNode,
        cancel: &CancelToken,
    ) -> LedgerResult<Vec<TracedNode>> {
        self.trace(start, Direction::Backward, cancel)
    }

    fn trace(
        &self,
        start: &TraceNode,
        direction: Direction,
        cancel: &CancelToken,
    ) -> LedgerResult<Vec<TracedNode>> {
        let state = self.read()?;
        let walk = state.trace.walk(start, direction, cancel).inspect_err(|e| {
            if let LedgerError::GraphCycle { node } = e {
                error!(start = %start, node = %node, "genealogy graph contains a cycle");
            }
        })?;
        let nodes: Vec<TracedNode> = walk
            .map(|step| TracedNode {
                node: step.node.clone(),
                depth: step.depth,
            })
            .collect();
        if cancel.is_cancelled() {
            debug!(start = %start, reached = nodes.len(), "trace cancelled");
        }
        Ok(nodes)
    }

    pub fn quantity_between(&self, source: &TraceNode, target: &TraceNode) -> LedgerResult<Quantity> {
        Ok(self.read()?.trace.quantity_between(source, target))
    }

    pub fn links_from(&self, node: &TraceNode) -> LedgerResult<Vec<TraceLink>> {
        Ok(self
            .read()?
            .trace
            .links_from(node)
            .into_iter()
            .cloned()
            .collect())
    }

    pub fn links_to(&self, node: &TraceNode) -> LedgerResult<Vec<TraceLink>> {
        Ok(self
            .read()?
            .trace
            .links_to(node)
            .into_iter()
            .cloned()
            .collect())
    }

    /// Record a provenance link that no movement carries (e.g. a customs
    /// declaration tying an MRN to a document).
    pub fn record_trace_link(&self, link: TraceLink) -> LedgerResult<TraceLink> {
        self.catalog
            .require_item(link.item_id)
            .and_then(|()| {
                if !link.quantity.is_positive() || !link.quantity.is_within_bounds() {
                    return Err(LedgerError::validation(format!(
                        "trace link quantity {} must be positive and within bounds",
                        link.quantity
                    )));
                }
                // The graph is append-only: no key to lock, the write latch orders links.
                self.mutate(Vec::new(), |state| {
                    let (source, target) = TraceGraph::check_link(&link)?;
                    state
                        .trace
                        .check_acyclic(&[(source.clone(), target.clone())])?;
                    let recorded = state.trace.record_link(link)?.clone();
                    let event = LedgerEvent::TraceLinkRecorded {
                        source,
                        target,
                        item_id: recorded.item_id,
                        quantity: recorded.quantity,
                        occurred_at: recorded.link_date,
                    };
                    Ok((recorded, vec![event]))
                })
            })
            .inspect_err(log_rejection("record_trace_link"))
    }

    // ---------------------------------------------------------------------
    // Guarantee ledger
    // ---------------------------------------------------------------------

    pub fn open_guarantee_account(
        &self,
        account_number: impl Into<String>,
        account_name: impl Into<String>,
        total_limit: Decimal,
        currency: impl Into<String>,
        at: DateTime<Utc>,
    ) -> LedgerResult<GuaranteeAccount> {
        let (number, name, currency) = (account_number.into(), account_name.into(), currency.into());
        // New account: nothing to lock, uniqueness is checked under the write latch.
        self.mutate(Vec::new(), |state| {
            let account = state
                .guarantees
                .open_account(number, name, total_limit, currency, at)?
                .clone();
            let event = LedgerEvent::GuaranteeAccountOpened {
                account_id: account.id,
                account_number: account.account_number.clone(),
                total_limit: account.total_limit,
                occurred_at: at,
            };
            Ok((account, vec![event]))
        })
        .inspect_err(log_rejection("open_guarantee_account"))
    }

    pub fn set_guarantee_account_active(
        &self,
        account_id: GuaranteeAccountId,
        active: bool,
    ) -> LedgerResult<()> {
        self.mutate(vec![LockKey::Account(account_id)], |state| {
            state.guarantees.set_active(account_id, active)?;
            Ok(((), Vec::new()))
        })
        .inspect_err(log_rejection("set_guarantee_account_active"))
    }

    /// Post a debit or credit; a debit over the limit leaves the balance unchanged.
    pub fn post_guarantee(
        &self,
        account_id: GuaranteeAccountId,
        posting: GuaranteePosting,
        at: DateTime<Utc>,
    ) -> LedgerResult<GuaranteeLedgerEntry> {
        self.mutate(vec![LockKey::Account(account_id)], |state| {
            let entry = state.guarantees.post(account_id, posting, at)?;
            let balance = state.guarantees.account(account_id)?.current_balance;
            let event = LedgerEvent::GuaranteeEntryPosted {
                account_id,
                entry_id: entry.id,
                entry_type: entry.entry_type,
                amount: entry.amount,
                balance,
                occurred_at: at,
            };
            Ok((entry, vec![event]))
        })
        .inspect_err(log_rejection("post_guarantee"))
    }

    /// Release an open debit; returns the offsetting credit.
    pub fn release_guarantee(
        &self,
        entry_id: GuaranteeEntryId,
        at: DateTime<Utc>,
    ) -> LedgerResult<GuaranteeLedgerEntry> {
        let released = self.read().and_then(|state| {
            Ok(state.guarantees.entry(entry_id)?.account_id)
        });
        released
            .and_then(|account_id| {
                self.mutate(vec![LockKey::Account(account_id)], |state| {
                    let credit = state.guarantees.release(entry_id, at)?;
                    let balance = state.guarantees.account(account_id)?.current_balance;
                    let event = LedgerEvent::GuaranteeEntryReleased {
                        account_id,
                        entry_id,
                        credit_id: credit.id,
                        balance,
                        occurred_at: at,
                    };
                    Ok((credit, vec![event]))
                })
            })
            .inspect_err(log_rejection("release_guarantee"))
    }

    pub fn guarantee_account(&self, account_id: GuaranteeAccountId) -> LedgerResult<GuaranteeAccount> {
        Ok(self.read()?.guarantees.account(account_id)?.clone())
    }

    pub fn guarantee_entries(
        &self,
        account_id: GuaranteeAccountId,
    ) -> LedgerResult<Vec<GuaranteeLedgerEntry>> {
        Ok(self.read()?.guarantees.entries(account_id))
    }

    pub fn guarantee_exposure(
        &self,
        account_id: GuaranteeAccountId,
    ) -> LedgerResult<GuaranteeExposure> {
        self.read()?.guarantees.exposure(account_id)
    }

    pub fn overdue_debits(
        &self,
        account_id: GuaranteeAccountId,
        as_of: NaiveDate,
    ) -> LedgerResult<Vec<GuaranteeLedgerEntry>> {
        self.read()?.guarantees.overdue_debits(account_id, as_of)
    }

    /// Balance re-derived from the entries, for comparison with the cached one.
    pub fn recompute_guarantee(&self, account_id: GuaranteeAccountId) -> LedgerResult<Decimal> {
        self.read()?.guarantees.recompute(account_id)
    }

    // ---------------------------------------------------------------------
    // Cycle counts
    // ---------------------------------------------------------------------

    pub fn create_cycle_count(
        &self,
        location_id: LocationId,
        at: DateTime<Utc>,
    ) -> LedgerResult<CycleCount> {
        self.catalog
            .require_location(location_id)
            .and_then(|()| {
                self.mutate(Vec::new(), |state| {
                    let count = CycleCount::new(location_id, at);
                    state.cycle_counts.insert(count.id, count.clone());
                    Ok((count, Vec::new()))
                })
            })
            .inspect_err(log_rejection("create_cycle_count"))
    }

    /// Freeze the location's current balances as the count baseline.
    pub fn start_cycle_count(&self, id: CycleCountId, at: DateTime<Utc>) -> LedgerResult<CycleCount> {
        self.update_count(id, "start_cycle_count", |count, balances| {
            let snapshot = balances.location_snapshot(count.location_id);
            count.start_counting(snapshot, at)?;
            Ok(vec![LedgerEvent::CycleCountStarted {
                cycle_count_id: count.id,
                location_id: count.location_id,
                lines: count.lines.len(),
                occurred_at: at,
            }])
        })
    }

    pub fn record_count(
        &self,
        id: CycleCountId,
        key: &BalanceKey,
        counted: Quantity,
    ) -> LedgerResult<CycleCount> {
        self.update_count(id, "record_count", |count, _| {
            count.record_count(key, counted)?;
            Ok(Vec::new())
        })
    }

    /// Count stock the snapshot did not list.
    pub fn add_found_line(
        &self,
        id: CycleCountId,
        key: BalanceKey,
        uom_id: UomId,
        counted: Quantity,
    ) -> LedgerResult<CycleCount> {
        if let Err(e) = self.catalog.require_item(key.item_id) {
            log_rejection("add_found_line")(&e);
            return Err(e);
        }
        self.update_count(id, "add_found_line", |count, _| {
            count.add_found_line(key, uom_id, counted)?;
            Ok(Vec::new())
        })
    }

    pub fn submit_cycle_count(&self, id: CycleCountId) -> LedgerResult<CycleCount> {
        self.update_count(id, "submit_cycle_count", |count, _| {
            count.submit_for_review()?;
            Ok(Vec::new())
        })
    }

    pub fn cancel_cycle_count(&self, id: CycleCountId, at: DateTime<Utc>) -> LedgerResult<CycleCount> {
        self.update_count(id, "cancel_cycle_count", |count, _| {
            count.cancel(at)?;
            Ok(vec![LedgerEvent::CycleCountCancelled {
                cycle_count_id: count.id,
                occurred_at: at,
            }])
        })
    }

    /// Apply every variance against the live balances and close the count.
    ///
    /// If any variance cannot be applied nothing is recorded and the count
    /// stays in review.
    pub fn complete_cycle_count(
        &self,
        id: CycleCountId,
        at: DateTime<Utc>,
    ) -> LedgerResult<Vec<InventoryMovement>> {
        self.complete_count(id, at)
            .inspect_err(log_rejection("complete_cycle_count"))
    }

    fn complete_count(&self, id: CycleCountId, at: DateTime<Utc>) -> LedgerResult<Vec<InventoryMovement>> {
        let planned = self.cycle_count(id)?.variance_lines(at)?;

        let mut keys: Vec<LockKey> = planned.iter().flat_map(line_lock_keys).collect();
        keys.push(LockKey::CycleCount(id));

        let committed = self.execute(keys, |state| {
            let mut count = state
                .cycle_counts
                .get(&id)
                .cloned()
                .ok_or_else(|| LedgerError::not_found("cycle count", id))?;
            let lines = count.variance_lines(at)?;
            count.complete(at)?;
            Ok(UnitOfWork {
                lines,
                cycle_count: Some(count),
                ..UnitOfWork::default()
            })
        })?;
        Ok(committed.movements)
    }

    pub fn cycle_count(&self, id: CycleCountId) -> LedgerResult<CycleCount> {
        self.read()?
            .cycle_counts
            .get(&id)
            .cloned()
            .ok_or_else(|| LedgerError::not_found("cycle count", id))
    }

    pub fn cycle_count_summary(&self, id: CycleCountId) -> LedgerResult<CycleCountSummary> {
        Ok(self.cycle_count(id)?.summary())
    }

    // ---------------------------------------------------------------------
    // Maintenance
    // ---------------------------------------------------------------------

    /// Replay the journal and report every key whose cached balance differs.
    pub fn verify_consistency(&self) -> LedgerResult<Vec<BalanceMismatch>> {
        let state = self.read()?;
        let replayed = BalanceStore::replay(&state.journal)?;
        let mismatches = state.balances.diff(&replayed);
        if mismatches.is_empty() {
            debug!(movements = state.journal.len(), "balances match the journal");
        } else {
            warn!(mismatches = mismatches.len(), "balances diverge from the journal");
        }
        Ok(mismatches)
    }

    /// The movement journal as JSON, in movement-number order.
    pub fn export_journal(&self) -> LedgerResult<String> {
        let state = self.read()?;
        serde_json::to_string_pretty(&state.journal)
            .map_err(|e| LedgerError::storage(format!("journal export failed: {e}")))
    }

    // ---------------------------------------------------------------------
    // Outbox
    // ---------------------------------------------------------------------

    /// Live feed of events committed after this call.
    pub fn subscribe(&self) -> Subscription<EventEnvelope<LedgerEvent>> {
        self.outbox.subscribe()
    }

    pub fn outbox(&self) -> Arc<InMemoryOutbox<LedgerEvent>> {
        self.outbox.clone()
    }

    // ---------------------------------------------------------------------
    // Unit of work plumbing
    // ---------------------------------------------------------------------

    fn read(&self) -> LedgerResult<RwLockReadGuard<'_, LedgerState>> {
        self.state
            .read()
            .map_err(|_| LedgerError::storage("ledger state latch poisoned"))
    }

    fn write(&self) -> LedgerResult<RwLockWriteGuard<'_, LedgerState>> {
        self.state
            .write()
            .map_err(|_| LedgerError::storage("ledger state latch poisoned"))
    }

    /// Shape checks and reference data, before any lock is taken.
    fn prepare(&self, line: &MovementLine) -> LedgerResult<()> {
        line.validate()?;
        self.catalog.require_item(line.item_id)?;
        for location in [line.from_location, line.to_location].into_iter().flatten() {
            self.catalog.require_location(location)?;
        }
        Ok(())
    }

    /// Lock `keys`, plan with `build` against a read snapshot, then commit.
    fn execute<F>(&self, keys: Vec<LockKey>, build: F) -> LedgerResult<Committed>
    where
        F: FnOnce(&LedgerState) -> LedgerResult<UnitOfWork>,
    {
        let guard = self.locks.acquire(keys, &self.retry)?;

        let (work, staged) = {
            let snapshot = self.read()?;
            let state: &LedgerState = &snapshot;
            let work = build(state)?;
            if let Some(missing) = work
                .lines
                .iter()
                .flat_map(line_lock_keys)
                .find(|key| !guard.covers(key))
            {
                return Err(LedgerError::storage(format!(
                    "unit of work touches unlocked key {missing:?}"
                )));
            }
            let staged = stage(state, &work)?;
            (work, staged)
        };

        let mut latch = self.write()?;
        let (committed, events) = commit(&mut latch, work, staged)?;
        self.publish(events);
        drop(latch);

        if let (Some(first), Some(last)) = (committed.movements.first(), committed.movements.last()) {
            info!(
                movements = committed.movements.len(),
                first = %self.display_number(first),
                last = %self.display_number(last),
                "unit of work committed"
            );
        }
        Ok(committed)
    }

    /// Lock `keys` and run an operation that validates before it mutates.
    fn mutate<T>(
        &self,
        keys: Vec<LockKey>,
        op: impl FnOnce(&mut LedgerState) -> LedgerResult<(T, Vec<LedgerEvent>)>,
    ) -> LedgerResult<T> {
        let _guard = self.locks.acquire(keys, &self.retry)?;
        let mut latch = self.write()?;
        let state: &mut LedgerState = &mut latch;
        let (value, events) = op(state)?;
        self.publish(events);
        Ok(value)
    }

    /// Cycle count transition that does not move stock.
    fn update_count(
        &self,
        id: CycleCountId,
        operation: &'static str,
        apply: impl FnOnce(&mut CycleCount, &BalanceStore) -> LedgerResult<Vec<LedgerEvent>>,
    ) -> LedgerResult<CycleCount> {
        self.mutate(vec![LockKey::CycleCount(id)], |state| {
            let mut count = state
                .cycle_counts
                .get(&id)
                .cloned()
                .ok_or_else(|| LedgerError::not_found("cycle count", id))?;
            let events = apply(&mut count, &state.balances)?;
            state.cycle_counts.insert(id, count.clone());
            Ok((count, events))
        })
        .inspect_err(log_rejection(operation))
    }

    /// Called with the write latch held, so consumers see events in commit
    /// order. Cannot fail: state is already mutated when it runs.
    fn publish(&self, events: Vec<LedgerEvent>) {
        self.outbox.publish(events);
    }
}

/// Stage balance rows, MRN usage and trace links without touching `state`.
fn stage(state: &LedgerState, work: &UnitOfWork) -> LedgerResult<Staged> {
    let mut draft = state.balances.stage();
    let mut mrns: BTreeMap<Mrn, MrnRegistryEntry> = BTreeMap::new();
    let mut consumptions = Vec::new();

    for (index, line) in work.lines.iter().enumerate() {
        draft.apply(line)?;

        if let (true, Some(mrn)) = (line.kind.is_outbound(), &line.mrn) {
            let entry = match mrns.entry(mrn.clone()) {
                Entry::Occupied(slot) => slot.into_mut(),
                Entry::Vacant(slot) => slot.insert(state.mrns.require(mrn)?.clone()),
            };
            entry.consume(
                line.quantity,
                line.occurred_at.date_naive(),
                line.override_mrn_expiry,
            )?;
            consumptions.push(MrnConsumption {
                line: index,
                mrn: mrn.clone(),
                quantity: line.quantity,
                used: entry.used,
            });
        }
    }

    let link_nodes = work
        .links
        .iter()
        .map(TraceGraph::check_link)
        .collect::<LedgerResult<Vec<_>>>()?;

    Ok(Staged {
        rows: draft.into_rows(),
        mrns: mrns.into_values().collect(),
        consumptions,
        link_nodes,
    })
}

/// Publish a staged unit of work. Runs under the write latch.
fn commit(
    state: &mut LedgerState,
    work: UnitOfWork,
    staged: Staged,
) -> LedgerResult<(Committed, Vec<LedgerEvent>)> {
    // Another unit of work may have linked nodes since staging; check against
    // the graph as it is now, before anything is written.
    state.trace.check_acyclic(&staged.link_nodes)?;

    let mut events = Vec::new();

    // Links were checked while staging, so recording cannot fail halfway.
    for (link, (source, target)) in work.links.into_iter().zip(staged.link_nodes) {
        events.push(LedgerEvent::TraceLinkRecorded {
            source,
            target,
            item_id: link.item_id,
            quantity: link.quantity,
            occurred_at: link.link_date,
        });
        state.trace.record_link(link)?;
    }

    let first = state.journal.len() as u64 + 1;
    let movements: Vec<InventoryMovement> = work
        .lines
        .into_iter()
        .enumerate()
        .map(|(index, line)| InventoryMovement {
            id: MovementId::new(),
            number: first + index as u64,
            line,
        })
        .collect();

    for movement in &movements {
        let line = &movement.line;
        events.push(LedgerEvent::MovementRecorded {
            movement_id: movement.id,
            number: movement.number,
            kind: line.kind,
            item_id: line.item_id,
            from_location: line.from_location,
            to_location: line.to_location,
            quantity: line.quantity,
            occurred_at: line.occurred_at,
        });
    }
    for consumption in staged.consumptions {
        let occurred_at = movements[consumption.line].line.occurred_at;
        events.push(LedgerEvent::MrnConsumed {
            mrn: consumption.mrn,
            quantity: consumption.quantity,
            used: consumption.used,
            movement_number: Some(first + consumption.line as u64),
            occurred_at,
        });
    }

    let transition = work.transition.map(|pending| StatusTransition {
        from: pending.key.quality,
        key: pending.key,
        to: pending.to,
        quantity: pending.quantity,
        reason: pending.reason,
        actor: pending.actor,
        at: pending.at,
        movement_number: first,
    });
    if let Some(transition) = &transition {
        events.push(LedgerEvent::QualityStatusChanged {
            key: transition.key.clone(),
            to: transition.to,
            quantity: transition.quantity,
            actor: transition.actor,
            movement_number: transition.movement_number,
            occurred_at: transition.at,
        });
        state.transitions.push(transition.clone());
    }

    if let Some(count) = work.cycle_count {
        if let Some(closed_at) = count.closed_at {
            events.push(LedgerEvent::CycleCountCompleted {
                cycle_count_id: count.id,
                location_id: count.location_id,
                variance_movements: movements.iter().map(|m| m.number).collect(),
                occurred_at: closed_at,
            });
        }
        state.cycle_counts.insert(count.id, count);
    }

    state.balances.commit(staged.rows);
    for entry in staged.mrns {
        state.mrns.upsert(entry);
    }
    state.journal.extend(movements.iter().cloned());

    Ok((
        Committed {
            movements,
            transition,
        },
        events,
    ))
}

/// Keys a line must hold: every balance row it touches, plus the MRN it consumes.
fn line_lock_keys(line: &MovementLine) -> Vec<LockKey> {
    let mut keys: Vec<LockKey> = line
        .balance_keys()
        .into_iter()
        .map(LockKey::Balance)
        .collect();
    if let (true, Some(mrn)) = (line.kind.is_outbound(), &line.mrn) {
        keys.push(LockKey::Mrn(mrn.clone()));
    }
    keys
}

/// Provenance links recorded alongside a plain movement.
fn automatic_links(line: &MovementLine) -> Vec<TraceLink> {
    match line.kind {
        MovementKind::Receipt | MovementKind::Return => match (&line.mrn, &line.batch) {
            (Some(mrn), Some(batch)) => {
                let mut source = TraceEndpoint::mrn(mrn.clone());
                let mut target = TraceEndpoint::batch(batch.clone()).with_mrn(mrn.clone());
                if let Some(reference) = &line.reference {
                    source = source.with_document(reference.clone());
                    target = target.with_document(reference.clone());
                }
                vec![TraceLink::new(
                    source,
                    target,
                    line.item_id,
                    line.quantity,
                    line.occurred_at,
                )]
            }
            _ => Vec::new(),
        },
        MovementKind::Shipment if line.batch.is_some() || line.mrn.is_some() => {
            let Some(reference) = &line.reference else {
                return Vec::new();
            };
            let source = TraceEndpoint {
                document: None,
                batch: line.batch.clone(),
                mrn: line.mrn.clone(),
            };
            vec![TraceLink::new(
                source,
                TraceEndpoint::document(reference.clone()),
                line.item_id,
                line.quantity,
                line.occurred_at,
            )]
        }
        _ => Vec::new(),
    }
}

fn log_rejection(operation: &'static str) -> impl Fn(&LedgerError) {
    move |error: &LedgerError| match error.kind() {
        ErrorKind::ConcurrencyConflict | ErrorKind::Infrastructure => {
            warn!(operation, %error, "ledger operation failed")
        }
        ErrorKind::GraphCycle => error!(operation, %error, "ledger operation hit a genealogy cycle"),
        _ => debug!(operation, %error, "ledger operation rejected"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, 9, 0, 0).unwrap()
    }

    fn batch(code: &str) -> BatchNumber {
        BatchNumber::new(code).unwrap()
    }

    fn mrn(code: &str) -> Mrn {
        Mrn::new(code).unwrap()
    }

    struct Setup {
        ledger: InventoryLedger,
        item: ItemId,
        wh: LocationId,
        uom: UomId,
    }

    fn setup() -> Setup {
        Setup {
            ledger: InventoryLedger::new(),
            item: ItemId::new(),
            wh: LocationId::new(),
            uom: UomId::new(),
        }
    }

    #[test]
    fn movements_are_numbered_gap_free_from_one() {
        let s = setup();
        let first = s
            .ledger
            .append(MovementLine::receipt(s.item, s.wh, Quantity::units(10), s.uom, at(1)))
            .unwrap();
        let second = s
            .ledger
            .append(MovementLine::shipment(s.item, s.wh, Quantity::units(4), s.uom, at(2)))
            .unwrap();

        assert_eq!((first.number, second.number), (1, 2));
        assert_eq!(s.ledger.display_number(&second), "MOV-00000002");
        assert_eq!(s.ledger.get_movement(2).unwrap(), second);
        assert!(matches!(
            s.ledger.get_movement(0),
            Err(LedgerError::NotFound { entity: "movement", .. })
        ));
        assert_eq!(s.ledger.on_hand(s.item, None).unwrap(), Quantity::units(6));
    }

    #[test]
    fn workflow_kinds_cannot_be_appended_directly() {
        let s = setup();
        let line = MovementLine::cycle_count_variance(
            s.item,
            s.wh,
            Quantity::units(-2),
            s.uom,
            at(1),
        );
        assert!(matches!(s.ledger.append(line), Err(LedgerError::Validation(_))));
        assert!(matches!(
            s.ledger.append_all(Vec::new()),
            Err(LedgerError::Validation(_))
        ));
    }

    #[test]
    fn append_all_is_all_or_nothing() {
        let s = setup();
        let other = LocationId::new();
        s.ledger
            .append(MovementLine::receipt(s.item, s.wh, Quantity::units(5), s.uom, at(1)))
            .unwrap();

        let err = s
            .ledger
            .append_all(vec![
                MovementLine::transfer(s.item, s.wh, other, Quantity::units(5), s.uom, at(2)),
                MovementLine::shipment(s.item, s.wh, Quantity::units(1), s.uom, at(2)),
            ])
            .unwrap_err();

        assert!(matches!(err, LedgerError::InsufficientStock { .. }));
        assert_eq!(s.ledger.movement_count().unwrap(), 1);
        assert_eq!(s.ledger.on_hand(s.item, Some(s.wh)).unwrap(), Quantity::units(5));
        assert_eq!(s.ledger.on_hand(s.item, Some(other)).unwrap(), Quantity::ZERO);
    }

    #[test]
    fn receipt_with_mrn_and_batch_links_them() {
        let s = setup();
        s.ledger
            .append(
                MovementLine::receipt(s.item, s.wh, Quantity::units(50), s.uom, at(1))
                    .with_batch(batch("B1"))
                    .with_mrn(mrn("MRN-001")),
            )
            .unwrap();

        let links = s.ledger.links_from(&TraceNode::Mrn(mrn("MRN-001"))).unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(
            s.ledger
                .quantity_between(&TraceNode::Mrn(mrn("MRN-001")), &TraceNode::Batch(batch("B1")))
                .unwrap(),
            Quantity::units(50)
        );
    }

    #[test]
    fn outbound_mrn_stock_consumes_the_registry() {
        let s = setup();
        let code = mrn("MRN-7");
        s.ledger
            .register_mrn(code.clone(), Quantity::units(30), None, at(1))
            .unwrap();
        s.ledger
            .append(
                MovementLine::receipt(s.item, s.wh, Quantity::units(30), s.uom, at(1))
                    .with_mrn(code.clone()),
            )
            .unwrap();
        s.ledger
            .append(
                MovementLine::shipment(s.item, s.wh, Quantity::units(12), s.uom, at(2))
                    .with_mrn(code.clone()),
            )
            .unwrap();

        assert_eq!(s.ledger.mrn(&code).unwrap().used, Quantity::units(12));
    }

    #[test]
    fn shipping_an_unregistered_mrn_is_not_found() {
        let s = setup();
        let code = mrn("MRN-X");
        s.ledger
            .append(
                MovementLine::receipt(s.item, s.wh, Quantity::units(3), s.uom, at(1))
                    .with_mrn(code.clone()),
            )
            .unwrap();

        let err = s
            .ledger
            .append(
                MovementLine::shipment(s.item, s.wh, Quantity::units(1), s.uom, at(2))
                    .with_mrn(code),
            )
            .unwrap_err();
        assert!(matches!(err, LedgerError::NotFound { entity: "MRN", .. }));
        assert_eq!(s.ledger.movement_count().unwrap(), 1);
    }

    #[test]
    fn quality_change_defaults_to_the_whole_row_and_audits() {
        let s = setup();
        let actor = ActorId::new();
        s.ledger
            .append(MovementLine::receipt(s.item, s.wh, Quantity::units(8), s.uom, at(1)))
            .unwrap();
        let key = BalanceKey::new(s.item, s.wh);

        let transition = s
            .ledger
            .change_quality_status(StatusChangeRequest::new(
                key.clone(),
                QualityStatus::Blocked,
                "damaged packaging",
                actor,
                at(2),
            ))
            .unwrap();

        assert_eq!(transition.quantity, Quantity::units(8));
        assert_eq!(transition.movement_number, 2);
        assert_eq!(s.ledger.available(s.item, None).unwrap(), Quantity::ZERO);
        assert_eq!(s.ledger.on_hand(s.item, None).unwrap(), Quantity::units(8));
        assert_eq!(s.ledger.list_transitions(Some(s.item), None).unwrap().len(), 1);
        assert_eq!(s.ledger.non_eligible().unwrap().len(), 1);
    }

    #[test]
    fn quality_change_rejections() {
        let s = setup();
        let key = BalanceKey::new(s.item, s.wh);
        let request =
            |target, reason: &str| StatusChangeRequest::new(key.clone(), target, reason, ActorId::new(), at(2));

        assert!(matches!(
            s.ledger.change_quality_status(request(QualityStatus::Ok, "again")),
            Err(LedgerError::IdempotentChange { .. })
        ));
        assert!(matches!(
            s.ledger.change_quality_status(request(QualityStatus::Blocked, "  ")),
            Err(LedgerError::Validation(_))
        ));
        assert!(matches!(
            s.ledger.change_quality_status(request(QualityStatus::Blocked, "qa hold")),
            Err(LedgerError::NotFound { entity: "balance", .. })
        ));
    }

    #[test]
    fn blocked_stock_cannot_ship() {
        let s = setup();
        s.ledger
            .append(
                MovementLine::receipt(s.item, s.wh, Quantity::units(4), s.uom, at(1))
                    .with_quality(QualityStatus::Quarantine),
            )
            .unwrap();
        let err = s
            .ledger
            .append(
                MovementLine::shipment(s.item, s.wh, Quantity::units(1), s.uom, at(2))
                    .with_quality(QualityStatus::Quarantine),
            )
            .unwrap_err();
        assert!(matches!(err, LedgerError::QualityNotEligible { .. }));
    }

    #[test]
    fn guarantee_release_goes_through_the_account_lock() {
        let s = setup();
        let account = s
            .ledger
            .open_guarantee_account("GA-1", "Customs bond", dec!(1000), "EUR", at(1))
            .unwrap();
        let debit = s
            .ledger
            .post_guarantee(account.id, GuaranteePosting::debit(dec!(400)), at(1))
            .unwrap();

        let credit = s.ledger.release_guarantee(debit.id, at(5)).unwrap();
        assert_eq!(credit.amount, dec!(400));
        assert_eq!(s.ledger.guarantee_account(account.id).unwrap().current_balance, dec!(0));
        assert!(matches!(
            s.ledger.release_guarantee(debit.id, at(6)),
            Err(LedgerError::AlreadyReleased(_))
        ));
        assert!(matches!(
            s.ledger.release_guarantee(GuaranteeEntryId::new(), at(6)),
            Err(LedgerError::NotFound { .. })
        ));
    }

    #[test]
    fn every_commit_reaches_the_outbox() {
        let s = setup();
        let feed = s.ledger.subscribe();
        s.ledger
            .append(
                MovementLine::receipt(s.item, s.wh, Quantity::units(1), s.uom, at(1))
                    .with_batch(batch("B9"))
                    .with_mrn(mrn("MRN-9")),
            )
            .unwrap();

        let types: Vec<String> = feed.drain().iter().map(|e| e.event_type().to_string()).collect();
        assert_eq!(types, ["trace.link_recorded", "movement.recorded"]);
        assert_eq!(s.ledger.outbox().last_sequence(), 2);
    }

    #[test]
    fn manual_links_join_the_genealogy() {
        let s = setup();
        let declaration = DocumentRef::new("customs_declaration", *MovementId::new().as_uuid());
        s.ledger
            .record_trace_link(TraceLink::new(
                TraceEndpoint::mrn(mrn("MRN-7")),
                TraceEndpoint::document(declaration.clone()),
                s.item,
                Quantity::units(12),
                at(1),
            ))
            .unwrap();

        let reached = s
            .ledger
            .trace_forward(&TraceNode::Mrn(mrn("MRN-7")), &CancelToken::new())
            .unwrap();
        assert_eq!(reached, vec![TracedNode { node: TraceNode::Document(declaration.clone()), depth: 1 }]);
        assert!(matches!(
            s.ledger.trace_forward(&TraceNode::Mrn(mrn("MRN-8")), &CancelToken::new()),
            Err(LedgerError::NotFound { .. })
        ));
        assert!(matches!(
            s.ledger.record_trace_link(TraceLink::new(
                TraceEndpoint::mrn(mrn("MRN-7")),
                TraceEndpoint::mrn(mrn("MRN-7")),
                s.item,
                Quantity::units(1),
                at(1),
            )),
            Err(LedgerError::Validation(_))
        ));

        // Pointing the declaration back at its MRN would close a loop.
        let before = s.ledger.outbox().last_sequence();
        assert!(matches!(
            s.ledger.record_trace_link(TraceLink::new(
                TraceEndpoint::document(declaration.clone()),
                TraceEndpoint::mrn(mrn("MRN-7")),
                s.item,
                Quantity::units(1),
                at(2),
            )),
            Err(LedgerError::Validation(_))
        ));
        assert_eq!(s.ledger.with_trace(|g| g.link_count()).unwrap(), 1);
        assert_eq!(s.ledger.outbox().last_sequence(), before);
        assert!(s
            .ledger
            .trace_backward(&TraceNode::Document(declaration), &CancelToken::new())
            .is_ok());
    }

    #[test]
    fn fresh_ledger_is_consistent_and_exports_an_empty_journal() {
        let s = setup();
        assert!(s.ledger.verify_consistency().unwrap().is_empty());
        assert_eq!(s.ledger.export_journal().unwrap(), "[]");
    }
}
