//! Per-topic bid ledger.
//!
//! The ledger is the authoritative local copy of every bid on one crop
//! listing. All changes go through [`BidLedger::apply_event`] (broadcasts,
//! command acknowledgements) or the action hooks used by the negotiation
//! layer. After each change the aggregates are recomputed from the full bid
//! set and published on a watch channel; there is no incremental
//! "is this higher than the last max" shortcut, so delivery order within a
//! tick cannot leave a stale highest-bid flag behind.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::models::{ActionKind, Bid, BidValidationError, TopicSummary};
use crate::state_machine::{
    apply_transition, provisional_counter_id, IllegalTransitionError, Transition,
};

/// Number of explicit event ids remembered for duplicate detection.
const SEEN_EVENT_WINDOW: usize = 4096;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransitionError),

    #[error(transparent)]
    InvalidBid(#[from] BidValidationError),

    #[error("Bid {0} is not tracked")]
    UnknownBid(String),

    #[error("Event for topic {event_topic} does not belong to ledger {ledger_topic}")]
    WrongTopic {
        event_topic: String,
        ledger_topic: String,
    },

    #[error("Bid {0} already has an action in flight")]
    ActionInFlight(String),
}

/// A bid-affecting event, local or broadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct BidEvent {
    /// Idempotency key
    pub id: String,
    pub topic_id: String,
    pub kind: BidEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BidEventKind {
    /// A new bid was observed
    Created(Bid),
    /// Status change of a tracked bid
    Transitioned { bid_id: String, transition: Transition },
    /// Authoritative server record, overrides local state
    Replaced(Bid),
}

/// Result of applying an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    Duplicate,
}

/// Local bookkeeping for a command awaiting the server.
#[derive(Debug, Clone)]
struct InFlight {
    kind: ActionKind,
    /// Record before the optimistic guess; `None` once the server has spoken
    baseline: Option<Bid>,
    /// Counter bid inserted by the optimistic guess
    provisional_counter: Option<String>,
}

/// Compute the aggregates of a bid set.
///
/// The highest pending bid is the one with the largest amount; ties go to
/// the earliest `created_at`, then the smallest id.
pub fn summarize<'a>(
    topic_id: &str,
    bids: impl IntoIterator<Item = &'a Bid>,
    listed_price: Option<Decimal>,
) -> TopicSummary {
    let mut total_bids = 0;
    let mut pending_bids = 0;
    let mut pending_sum = Decimal::ZERO;
    let mut highest: Option<&Bid> = None;

    for bid in bids {
        total_bids += 1;
        if !bid.is_pending() {
            continue;
        }
        pending_bids += 1;
        pending_sum += bid.amount;

        highest = match highest {
            None => Some(bid),
            Some(current) => {
                let outranks = bid.amount > current.amount
                    || (bid.amount == current.amount
                        && (bid.created_at, &bid.id) < (current.created_at, &current.id));
                Some(if outranks { bid } else { current })
            }
        };
    }

    let average_pending_amount = if pending_bids > 0 {
        Some((pending_sum / Decimal::from(pending_bids)).round_dp(2))
    } else {
        None
    };

    TopicSummary {
        topic_id: topic_id.to_string(),
        total_bids,
        pending_bids,
        highest_pending_amount: highest.map(|b| b.amount),
        highest_bid_id: highest.map(|b| b.id.clone()),
        average_pending_amount,
        listed_price,
    }
}

/// Authoritative bid set for one topic plus its derived aggregates.
#[derive(Debug)]
pub struct BidLedger {
    topic_id: String,
    bids: HashMap<String, Bid>,
    /// Arrival order of bid ids
    order: Vec<String>,
    listed_price: Option<Decimal>,
    seen_events: HashSet<String>,
    seen_order: VecDeque<String>,
    in_flight: HashMap<String, InFlight>,
    summary: TopicSummary,
    summary_tx: watch::Sender<TopicSummary>,
    closed: bool,
}

impl BidLedger {
    pub fn new(topic_id: &str) -> Self {
        let summary = summarize(topic_id, std::iter::empty(), None);
        let (summary_tx, _) = watch::channel(summary.clone());
        Self {
            topic_id: topic_id.to_string(),
            bids: HashMap::new(),
            order: Vec::new(),
            listed_price: None,
            seen_events: HashSet::new(),
            seen_order: VecDeque::new(),
            in_flight: HashMap::new(),
            summary,
            summary_tx,
            closed: false,
        }
    }

    pub fn topic_id(&self) -> &str {
        &self.topic_id
    }

    /// Apply a bid event. Re-delivery of the same event is a no-op.
    ///
    /// Overdue pending bids are expired first so the event is validated
    /// against the current lifecycle state. On error nothing changes.
    pub fn apply_event(
        &mut self,
        event: BidEvent,
        now: DateTime<Utc>,
    ) -> Result<ApplyOutcome, LedgerError> {
        if event.topic_id != self.topic_id {
            return Err(LedgerError::WrongTopic {
                event_topic: event.topic_id,
                ledger_topic: self.topic_id.clone(),
            });
        }

        let expired = self.expire_overdue(now);

        if self.seen_events.contains(&event.id) {
            debug!("[LEDGER] {} duplicate event {}", self.topic_id, event.id);
            if expired > 0 {
                self.recompute();
            }
            return Ok(ApplyOutcome::Duplicate);
        }

        let result = match event.kind {
            BidEventKind::Created(bid) => self.apply_created(bid),
            BidEventKind::Transitioned { bid_id, transition } => {
                self.apply_transitioned(&bid_id, &transition)
            }
            BidEventKind::Replaced(bid) => self.apply_replaced(bid),
        };

        match result {
            Ok(outcome) => {
                self.remember(event.id);
                if outcome == ApplyOutcome::Applied || expired > 0 {
                    self.recompute();
                }
                Ok(outcome)
            }
            Err(e) => {
                if expired > 0 {
                    self.recompute();
                }
                Err(e)
            }
        }
    }

    fn apply_created(&mut self, bid: Bid) -> Result<ApplyOutcome, LedgerError> {
        bid.validate()?;
        if self.bids.contains_key(&bid.id) {
            return Ok(ApplyOutcome::Duplicate);
        }
        debug!(
            "[LEDGER] {} new bid {} amount={} qty={}",
            self.topic_id, bid.id, bid.amount, bid.quantity
        );
        self.upsert_authoritative(bid);
        Ok(ApplyOutcome::Applied)
    }

    fn apply_transitioned(
        &mut self,
        bid_id: &str,
        transition: &Transition,
    ) -> Result<ApplyOutcome, LedgerError> {
        // With an optimistic guess outstanding, judge the broadcast against
        // the record the guess replaced: the server supersedes the guess.
        let baseline = self
            .in_flight
            .get(bid_id)
            .and_then(|pending| pending.baseline.clone());
        let superseding = baseline.is_some();

        let current = match baseline {
            Some(bid) => bid,
            None => self
                .bids
                .get(bid_id)
                .cloned()
                .ok_or_else(|| LedgerError::UnknownBid(bid_id.to_string()))?,
        };

        if !superseding && current.status == transition.to {
            return Ok(ApplyOutcome::Duplicate);
        }

        let mut updated = current;
        let spawned = apply_transition(&mut updated, transition)?;
        if let Some(counter) = &spawned {
            counter.validate()?;
        }

        let provisional = self.in_flight.get_mut(bid_id).and_then(|pending| {
            pending.baseline = None;
            pending.provisional_counter.take()
        });
        if let Some(provisional) = provisional {
            self.remove(&provisional);
        }

        debug!(
            "[LEDGER] {} bid {} -> {}",
            self.topic_id, bid_id, transition.to
        );
        self.upsert(updated);
        if let Some(counter) = spawned {
            if !self.bids.contains_key(&counter.id) && !self.has_server_counter(&counter) {
                self.upsert(counter);
            }
        }
        Ok(ApplyOutcome::Applied)
    }

    fn apply_replaced(&mut self, bid: Bid) -> Result<ApplyOutcome, LedgerError> {
        bid.validate()?;
        if let Some(existing) = self.bids.get(&bid.id) {
            if same_record(existing, &bid) {
                return Ok(ApplyOutcome::Duplicate);
            }
        }
        self.upsert_authoritative(bid);
        Ok(ApplyOutcome::Applied)
    }

    /// Merge a server snapshot: server records win, local-only bids stay.
    ///
    /// Returns how many records were merged.
    pub fn load_snapshot(
        &mut self,
        bids: Vec<Bid>,
        listed_price: Option<Decimal>,
        now: DateTime<Utc>,
    ) -> usize {
        let mut merged = 0;
        for bid in bids {
            if bid.topic_id != self.topic_id {
                warn!(
                    "[LEDGER] {} snapshot contains bid {} of topic {}, skipping",
                    self.topic_id, bid.id, bid.topic_id
                );
                continue;
            }
            if let Err(e) = bid.validate() {
                warn!("[LEDGER] {} skipping invalid snapshot record: {}", self.topic_id, e);
                continue;
            }
            match self.in_flight.get_mut(&bid.id) {
                // Keep the optimistic guess visible, refresh what a rollback restores
                Some(pending) if pending.baseline.is_some() => pending.baseline = Some(bid),
                _ => self.upsert_authoritative(bid),
            }
            merged += 1;
        }

        if listed_price.is_some() {
            self.listed_price = listed_price;
        }

        self.expire_overdue(now);
        self.recompute();
        info!(
            "[LEDGER] {} snapshot merged {} bids ({} tracked)",
            self.topic_id,
            merged,
            self.bids.len()
        );
        merged
    }

    /// Expire overdue pending bids. Call before reading aggregates.
    pub fn refresh(&mut self, now: DateTime<Utc>) -> usize {
        let expired = self.expire_overdue(now);
        if expired > 0 {
            self.recompute();
        }
        expired
    }

    fn expire_overdue(&mut self, now: DateTime<Utc>) -> usize {
        let overdue: Vec<String> = self
            .bids
            .values()
            .filter(|b| b.is_overdue(now) && !self.in_flight.contains_key(&b.id))
            .map(|b| b.id.clone())
            .collect();

        let mut expired = 0;
        for id in overdue {
            if let Some(bid) = self.bids.get_mut(&id) {
                let at = bid.expires_at;
                if apply_transition(bid, &Transition::expire(at)).is_ok() {
                    debug!("[LEDGER] {} bid {} expired", self.topic_id, id);
                    expired += 1;
                }
            }
        }
        expired
    }

    /// Mark a pending bid as processing a farmer action.
    ///
    /// With `guess` set the transition is applied tentatively and undone by
    /// [`rollback_action`](Self::rollback_action).
    pub fn begin_action(
        &mut self,
        bid_id: &str,
        kind: ActionKind,
        guess: Option<Transition>,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        if self.refresh(now) > 0 {
            debug!("[LEDGER] {} expired bids before action", self.topic_id);
        }
        if self.in_flight.contains_key(bid_id) {
            return Err(LedgerError::ActionInFlight(bid_id.to_string()));
        }

        let bid = self
            .bids
            .get(bid_id)
            .ok_or_else(|| LedgerError::UnknownBid(bid_id.to_string()))?;
        if !bid.is_pending() {
            return Err(IllegalTransitionError {
                bid_id: bid_id.to_string(),
                from: bid.status,
                to: kind.target_status(),
            }
            .into());
        }

        let mut pending = InFlight {
            kind,
            baseline: None,
            provisional_counter: None,
        };

        if let Some(transition) = guess {
            let original = bid.clone();
            let mut tentative = original.clone();
            let spawned = apply_transition(&mut tentative, &transition)?;
            if let Some(counter) = &spawned {
                counter.validate()?;
            }
            pending.baseline = Some(original);
            self.upsert(tentative);
            if let Some(counter) = spawned {
                if !self.bids.contains_key(&counter.id) {
                    pending.provisional_counter = Some(counter.id.clone());
                    self.upsert(counter);
                }
            }
        }

        self.in_flight.insert(bid_id.to_string(), pending);
        self.recompute();
        Ok(())
    }

    /// Settle an action with the server's authoritative records.
    pub fn complete_action(
        &mut self,
        bid_id: &str,
        record: Bid,
        counter: Option<Bid>,
    ) -> Result<(), LedgerError> {
        record.validate()?;
        if let Some(counter) = &counter {
            counter.validate()?;
        }

        if let Some(pending) = self.in_flight.remove(bid_id) {
            if let Some(provisional) = pending.provisional_counter {
                let replaced = counter.as_ref().is_some_and(|c| c.id == provisional);
                if counter.is_some() && !replaced {
                    self.remove(&provisional);
                }
            }
            debug!(
                "[LEDGER] {} {} on bid {} confirmed as {}",
                self.topic_id,
                pending.kind.as_str(),
                bid_id,
                record.status
            );
        }

        self.upsert_authoritative(record);
        if let Some(counter) = counter {
            self.upsert_authoritative(counter);
        }
        self.recompute();
        Ok(())
    }

    /// Undo an action's optimistic guess and clear the processing marker.
    ///
    /// Returns false when there was nothing in flight for the bid.
    pub fn rollback_action(&mut self, bid_id: &str) -> bool {
        let Some(pending) = self.in_flight.remove(bid_id) else {
            return false;
        };

        if let Some(provisional) = pending.provisional_counter {
            self.remove(&provisional);
        }
        if let Some(baseline) = pending.baseline {
            self.upsert(baseline);
        }
        debug!(
            "[LEDGER] {} rolled back {} on bid {}",
            self.topic_id,
            pending.kind.as_str(),
            bid_id
        );
        self.recompute();
        true
    }

    /// Action currently processing for a bid, if any.
    pub fn processing(&self, bid_id: &str) -> Option<ActionKind> {
        self.in_flight.get(bid_id).map(|p| p.kind)
    }

    pub fn get(&self, bid_id: &str) -> Option<&Bid> {
        self.bids.get(bid_id)
    }

    pub fn contains(&self, bid_id: &str) -> bool {
        self.bids.contains_key(bid_id)
    }

    /// All bids, newest first.
    pub fn bids(&self) -> Vec<Bid> {
        let mut bids: Vec<Bid> = self
            .order
            .iter()
            .filter_map(|id| self.bids.get(id))
            .cloned()
            .collect();
        bids.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        bids
    }

    /// Pending bids, best offer first.
    pub fn pending_bids(&self) -> Vec<Bid> {
        let mut pending: Vec<Bid> = self
            .order
            .iter()
            .filter_map(|id| self.bids.get(id))
            .filter(|b| b.is_pending())
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            b.amount
                .cmp(&a.amount)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        pending
    }

    pub fn highest_bid(&self) -> Option<&Bid> {
        self.summary
            .highest_bid_id
            .as_ref()
            .and_then(|id| self.bids.get(id))
    }

    pub fn summary(&self) -> &TopicSummary {
        &self.summary
    }

    pub fn listed_price(&self) -> Option<Decimal> {
        self.listed_price
    }

    /// Receive every recomputed summary.
    pub fn subscribe(&self) -> watch::Receiver<TopicSummary> {
        self.summary_tx.subscribe()
    }

    pub fn len(&self) -> usize {
        self.bids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty()
    }

    /// Mark the ledger as discarded; late results are dropped by callers.
    pub fn close(&mut self) {
        self.closed = true;
        self.in_flight.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn upsert(&mut self, mut bid: Bid) {
        bid.is_highest = false;
        if !self.bids.contains_key(&bid.id) {
            self.order.push(bid.id.clone());
        }
        self.bids.insert(bid.id.clone(), bid);
    }

    /// Store a server record. A server counter bid replaces the locally
    /// spawned placeholder of the same counter-offer.
    fn upsert_authoritative(&mut self, bid: Bid) {
        if let Some(parent) = &bid.parent_bid_id {
            let placeholder = provisional_counter_id(parent);
            if placeholder != bid.id && self.bids.contains_key(&placeholder) {
                debug!(
                    "[LEDGER] {} counter {} replaces placeholder {}",
                    self.topic_id, bid.id, placeholder
                );
                self.remove(&placeholder);
                for pending in self.in_flight.values_mut() {
                    if pending.provisional_counter.as_deref() == Some(placeholder.as_str()) {
                        pending.provisional_counter = None;
                    }
                }
            }
        }
        self.upsert(bid);
    }

    /// Whether the server's own bid for this placeholder's counter-offer is already tracked.
    fn has_server_counter(&self, counter: &Bid) -> bool {
        let Some(parent) = &counter.parent_bid_id else {
            return false;
        };
        counter.id == provisional_counter_id(parent)
            && self
                .bids
                .values()
                .any(|b| b.parent_bid_id.as_ref() == Some(parent) && b.id != counter.id)
    }

    fn remove(&mut self, bid_id: &str) {
        if self.bids.remove(bid_id).is_some() {
            self.order.retain(|id| id != bid_id);
        }
    }

    fn remember(&mut self, event_id: String) {
        if self.seen_events.insert(event_id.clone()) {
            self.seen_order.push_back(event_id);
            if self.seen_order.len() > SEEN_EVENT_WINDOW {
                if let Some(oldest) = self.seen_order.pop_front() {
                    self.seen_events.remove(&oldest);
                }
            }
        }
    }

    fn recompute(&mut self) {
        let summary = summarize(&self.topic_id, self.bids.values(), self.listed_price);
        for bid in self.bids.values_mut() {
            bid.is_highest = summary.highest_bid_id.as_deref() == Some(bid.id.as_str());
        }
        self.summary = summary.clone();
        self.summary_tx.send_replace(summary);
    }
}

/// Field-wise equality ignoring the derived highest flag.
fn same_record(a: &Bid, b: &Bid) -> bool {
    Bid {
        is_highest: false,
        ..a.clone()
    } == Bid {
        is_highest: false,
        ..b.clone()
    }
}
