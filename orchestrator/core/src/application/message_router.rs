// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Message Router
//!
//! Resolves each [`Message`] to one or more concrete agents and hands it to
//! the [`DeliveryQueue`].
//!
//! - Direct: the named agent, which must be Active. Capacity is not enforced.
//! - CapabilityRouted: the least-loaded Active agent advertising the tag.
//! - Broadcast: every Active agent (optionally filtered by capability) except
//!   the sender. Partial failures are reported on the decision.
//!
//! Every target holds one reservation (one unit of `inflight_count`) from
//! selection until its ack, reject or ack timeout. A reservation that never
//! reaches the queue is released when its guard drops, which also covers a
//! route abandoned at its deadline or cancelled by the caller. An envelope
//! already queued for an abandoned route is rejected again, so a broadcast
//! cut short never leaves deliveries nobody can acknowledge.
//!
//! A message id seen again while its deliveries are outstanding returns the
//! cached decision without reserving anything. Direct messages from one
//! sender to one recipient are routed one at a time, in arrival order.

use std::collections::{HashMap, HashSet};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use scopeguard::ScopeGuard;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::load_balancer::{LoadBalancer, Selection};
use crate::domain::agent::{AgentDescriptor, AgentId, AgentState, Capability, NodeId};
use crate::domain::delivery::{DeliveryQueue, DeliveryToken};
use crate::domain::events::RoutingEvent;
use crate::domain::mesh_config::RoutingConfig;
use crate::domain::message::{DeliveryMode, Message, MessageError, MessageId, MessageStatus};
use crate::domain::registry::{AgentRegistry, ReserveOutcome};
use crate::domain::routing::{FailedTarget, Reservation, RouteTarget, RoutingDecision, RoutingError, RoutingPolicy};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::metrics;

const SETTLE_POLL_INTERVAL: Duration = Duration::from_millis(20);
const ABANDONED_REASON: &str = "route abandoned before commit";

/// Deadline and cancellation for one `route` call.
#[derive(Debug, Clone)]
pub struct RouteContext {
    pub deadline: Instant,
    pub cancel: Option<CancellationToken>,
}

impl RouteContext {
    pub fn with_deadline(deadline: Instant) -> Self {
        Self { deadline, cancel: None }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Counters since the router was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RouterStats {
    pub routed: u64,
    pub failed: u64,
    pub duplicates: u64,
    pub acknowledged: u64,
    pub rejected: u64,
    pub expired: u64,
    /// Deliveries awaiting ack or reject.
    pub pending: usize,
}

impl RouterStats {
    pub fn failure_rate(&self) -> f64 {
        let total = self.routed + self.failed;
        if total == 0 {
            0.0
        } else {
            self.failed as f64 / total as f64
        }
    }
}

/// Outstanding deliveries of one message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingRoute {
    pub message_id: MessageId,
    pub status: MessageStatus,
    pub policy: Option<RoutingPolicy>,
    pub attempts: u32,
    pub outstanding: Vec<AgentId>,
}

/// Result of [`MessageRouter::reject`].
#[derive(Debug, Clone)]
pub enum RejectOutcome {
    /// The delivery was settled and nothing was re-routed.
    Settled,
    /// The message went to another agent.
    Rerouted(RoutingDecision),
    /// Re-routing was attempted and failed; the rejected delivery is settled regardless.
    RerouteFailed(RoutingError),
}

#[derive(Default)]
struct Counters {
    routed: AtomicU64,
    failed: AtomicU64,
    duplicates: AtomicU64,
    acknowledged: AtomicU64,
    rejected: AtomicU64,
    expired: AtomicU64,
}

type ReleaseFn = Box<dyn FnOnce(Reservation) + Send + Sync>;

/// A reservation released on drop unless taken with `ScopeGuard::into_inner`.
type ReservationGuard = ScopeGuard<Reservation, ReleaseFn>;

type AbandonFn = Box<dyn FnOnce((RouteTarget, Reservation)) + Send + Sync>;

/// A target whose handoff completed. Dropped before commit, it releases the
/// reservation and rejects the queued envelope.
type Hold = ScopeGuard<(RouteTarget, Reservation), AbandonFn>;

struct Dispatch {
    policy: RoutingPolicy,
    holds: Vec<Hold>,
    failed: Vec<FailedTarget>,
}

struct Delivery {
    reservation: Reservation,
    token: DeliveryToken,
    dispatched_at: Instant,
}

struct InflightRoute {
    message: Message,
    decision: RoutingDecision,
    deliveries: HashMap<AgentId, Delivery>,
}

type RouteSlot = Arc<Mutex<Option<InflightRoute>>>;

enum Routed {
    Fresh(RoutingDecision),
    Cached(RoutingDecision),
}

/// Exclusive access to one message's slot. An empty slot is removed from
/// the cache on drop unless another caller is waiting on it.
struct SlotLease<'a> {
    routes: &'a DashMap<MessageId, RouteSlot>,
    message_id: MessageId,
    slot: RouteSlot,
    guard: OwnedMutexGuard<Option<InflightRoute>>,
}

impl Deref for SlotLease<'_> {
    type Target = Option<InflightRoute>;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl DerefMut for SlotLease<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

impl Drop for SlotLease<'_> {
    fn drop(&mut self) {
        if self.guard.is_none() {
            // Map, lease and guard hold one reference each
            self.routes.remove_if(&self.message_id, |_, slot| {
                Arc::ptr_eq(slot, &self.slot) && Arc::strong_count(slot) <= 3
            });
        }
    }
}

pub struct MessageRouter {
    registry: Arc<dyn AgentRegistry>,
    balancer: LoadBalancer,
    queue: Arc<dyn DeliveryQueue>,
    event_bus: EventBus,
    config: RoutingConfig,
    routes: DashMap<MessageId, RouteSlot>,
    order_locks: DashMap<(AgentId, AgentId), Arc<Mutex<()>>>,
    closed: AtomicBool,
    active_routes: AtomicUsize,
    outstanding: AtomicUsize,
    counters: Counters,
}

impl MessageRouter {
    pub fn new(
        registry: Arc<dyn AgentRegistry>,
        queue: Arc<dyn DeliveryQueue>,
        event_bus: EventBus,
        config: RoutingConfig,
    ) -> Self {
        Self {
            balancer: LoadBalancer::new(registry.clone()),
            registry,
            queue,
            event_bus,
            config,
            routes: DashMap::new(),
            order_locks: DashMap::new(),
            closed: AtomicBool::new(false),
            active_routes: AtomicUsize::new(0),
            outstanding: AtomicUsize::new(0),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    pub fn balancer(&self) -> &LoadBalancer {
        &self.balancer
    }

    /// A context bounded by the configured route deadline.
    pub fn default_context(&self) -> RouteContext {
        RouteContext::with_timeout(self.config.route_deadline)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn max_attempts(&self) -> u32 {
        self.config.max_route_attempts.max(1)
    }

    /// Route `message` and hand it to the delivery queue.
    ///
    /// Returns once every target's handoff completed. The reservations then
    /// stay held until [`acknowledge`](Self::acknowledge),
    /// [`reject`](Self::reject) or the ack timeout settles them.
    pub async fn route(&self, message: Message, ctx: RouteContext) -> Result<RoutingDecision, RoutingError> {
        if self.is_closed() {
            return Err(RoutingError::ShuttingDown);
        }
        let mode = message.delivery_mode;
        let message_id = message.message_id;
        let started = Instant::now();

        self.active_routes.fetch_add(1, Ordering::SeqCst);
        let _active = scopeguard::guard((), |_| {
            self.active_routes.fetch_sub(1, Ordering::SeqCst);
        });

        let result = match message.validate() {
            Err(e) => Err(RoutingError::from(e)),
            Ok(()) => {
                let work = tokio::time::timeout_at(ctx.deadline, self.resolve(message));
                match &ctx.cancel {
                    Some(cancel) => tokio::select! {
                        biased;
                        _ = cancel.cancelled() => Err(RoutingError::Timeout),
                        outcome = work => outcome.unwrap_or(Err(RoutingError::Timeout)),
                    },
                    None => work.await.unwrap_or(Err(RoutingError::Timeout)),
                }
            }
        };

        ::metrics::histogram!(metrics::ROUTE_LATENCY_SECONDS, "mode" => mode.as_str())
            .record(started.elapsed().as_secs_f64());

        match result {
            Ok(Routed::Fresh(decision)) => {
                self.record_routed(&decision, mode);
                Ok(decision)
            }
            Ok(Routed::Cached(decision)) => {
                self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                ::metrics::counter!(metrics::DUPLICATE_MESSAGES_TOTAL).increment(1);
                debug!(message_id = %message_id, "Duplicate message, returning cached decision");
                Ok(decision)
            }
            Err(e) => {
                self.record_failure(message_id, mode, &e);
                Err(e)
            }
        }
    }

    async fn resolve(&self, message: Message) -> Result<Routed, RoutingError> {
        let _order = match (message.delivery_mode, &message.to_agent_id) {
            (DeliveryMode::Direct, Some(to)) => Some(self.order_lock(&message.from_agent_id, to).await),
            _ => None,
        };

        let mut lease = self.lease(message.message_id).await;
        if let Some(existing) = lease.as_ref() {
            return Ok(Routed::Cached(existing.decision.clone()));
        }

        let (outgoing, dispatch, attempts) = self
            .dispatch_with_retry(&message, &HashSet::new(), self.max_attempts())
            .await?;
        let (route, decision) = self.commit(outgoing, dispatch, attempts);
        *lease = Some(route);
        Ok(Routed::Fresh(decision))
    }

    /// Serialize direct messages between one sender and one recipient.
    async fn order_lock(
        &self,
        from: &AgentId,
        to: &AgentId,
    ) -> ScopeGuard<OwnedMutexGuard<()>, impl FnOnce(OwnedMutexGuard<()>) + '_> {
        let key = (from.clone(), to.clone());
        let lock = self.order_locks.entry(key.clone()).or_default().value().clone();
        let guard = lock.lock_owned().await;
        scopeguard::guard(guard, move |guard| {
            drop(guard);
            self.order_locks.remove_if(&key, |_, lock| Arc::strong_count(lock) == 1);
        })
    }

    async fn lease(&self, message_id: MessageId) -> SlotLease<'_> {
        let slot = self.routes.entry(message_id).or_default().value().clone();
        let guard = slot.clone().lock_owned().await;
        SlotLease {
            routes: &self.routes,
            message_id,
            slot,
            guard,
        }
    }

    async fn existing_lease(&self, message_id: MessageId) -> Option<SlotLease<'_>> {
        let slot = self.routes.get(&message_id)?.value().clone();
        let guard = slot.clone().lock_owned().await;
        Some(SlotLease {
            routes: &self.routes,
            message_id,
            slot,
            guard,
        })
    }

    /// Dispatch with bounded exponential backoff on transient failures.
    async fn dispatch_with_retry(
        &self,
        message: &Message,
        excluded: &HashSet<AgentId>,
        max_attempts: u32,
    ) -> Result<(Message, Dispatch, u32), RoutingError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let mut outgoing = message.clone();
            outgoing.attempt_count = message.attempt_count.saturating_add(attempt);

            match self.dispatch_once(&outgoing, excluded).await {
                Ok(dispatch) => return Ok((outgoing, dispatch, attempt)),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.config.backoff_for(attempt);
                    debug!(
                        message_id = %message.message_id,
                        attempt,
                        delay = ?delay,
                        error = %e,
                        "Transient routing failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_transient() => {
                    return Err(RoutingError::RoutingFailed {
                        attempts: attempt,
                        last_cause: Box::new(e),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn dispatch_once(&self, message: &Message, excluded: &HashSet<AgentId>) -> Result<Dispatch, RoutingError> {
        match message.delivery_mode {
            DeliveryMode::Direct => {
                let to = message
                    .to_agent_id
                    .as_ref()
                    .ok_or(RoutingError::InvalidMessage(MessageError::DirectAddressing))?;
                let record = self
                    .registry
                    .lookup(to)
                    .map_err(|_| RoutingError::NotFound(to.clone()))?;
                if record.state != AgentState::Active {
                    return Err(RoutingError::AgentUnavailable {
                        agent_id: to.clone(),
                        state: record.state,
                    });
                }
                let hold = self.dispatch_to(&record, message).await?;
                Ok(Dispatch {
                    policy: RoutingPolicy::DirectLookup,
                    holds: vec![hold],
                    failed: Vec::new(),
                })
            }
            DeliveryMode::CapabilityRouted => {
                let capability = message
                    .capability
                    .as_ref()
                    .ok_or(RoutingError::InvalidMessage(MessageError::CapabilityAddressing))?;
                let Selection {
                    agent_id,
                    node_id,
                    reservation,
                } = self.select(capability, excluded)?;
                let guard = self.hold(reservation);
                let token = self.handoff(&node_id, &agent_id, message).await?;
                let target = RouteTarget {
                    agent_id,
                    node_id,
                    token,
                };
                Ok(Dispatch {
                    policy: RoutingPolicy::LeastLoaded,
                    holds: vec![self.handed_off(target, guard)],
                    failed: Vec::new(),
                })
            }
            DeliveryMode::Broadcast => self.broadcast(message).await,
        }
    }

    fn select(&self, capability: &Capability, excluded: &HashSet<AgentId>) -> Result<Selection, RoutingError> {
        if excluded.is_empty() {
            return self.balancer.select_for(capability);
        }
        let relabel = |e: RoutingError| match e {
            RoutingError::NoCapableAgent(_) => RoutingError::NoCapableAgent(capability.to_string()),
            other => other,
        };

        let candidates = self.registry.find_by_capability(capability);
        if candidates.iter().all(|c| excluded.contains(&c.agent_id)) {
            // Only excluded agents can serve it; fall back to them
            return self.balancer.select(&candidates).map_err(relabel);
        }
        self.balancer.select_excluding(&candidates, excluded).map_err(relabel)
    }

    async fn broadcast(&self, message: &Message) -> Result<Dispatch, RoutingError> {
        let mut recipients = match &message.capability {
            Some(capability) => self.registry.find_by_capability(capability),
            None => self
                .registry
                .list()
                .into_iter()
                .filter(|d| d.state == AgentState::Active)
                .collect(),
        };
        recipients.retain(|d| d.agent_id != message.from_agent_id);

        let label = || {
            message
                .capability
                .as_ref()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "broadcast".to_string())
        };
        if recipients.is_empty() {
            return Err(RoutingError::NoCapableAgent(label()));
        }

        let outcomes = join_all(recipients.iter().map(|recipient| async move {
            self.dispatch_to(recipient, message)
                .await
                .map_err(|e| (recipient.agent_id.clone(), e))
        }))
        .await;

        let mut holds = Vec::new();
        let mut failed = Vec::new();
        let mut first_error = None;
        for outcome in outcomes {
            match outcome {
                Ok(hold) => holds.push(hold),
                Err((agent_id, e)) => {
                    debug!(message_id = %message.message_id, agent_id = %agent_id, error = %e, "Broadcast target failed");
                    failed.push(FailedTarget {
                        agent_id,
                        reason: e.to_string(),
                    });
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        if holds.is_empty() {
            return Err(first_error.unwrap_or_else(|| RoutingError::NoCapableAgent(label())));
        }
        Ok(Dispatch {
            policy: RoutingPolicy::Broadcast,
            holds,
            failed,
        })
    }

    /// Reserve `record` without a capacity check and hand the message over.
    async fn dispatch_to(&self, record: &AgentDescriptor, message: &Message) -> Result<Hold, RoutingError> {
        let agent_id = &record.agent_id;
        let reservation = match self.registry.try_reserve(agent_id, false) {
            Ok(ReserveOutcome::Reserved(reservation)) => reservation,
            Ok(ReserveOutcome::NotEligible(state)) => {
                return Err(RoutingError::AgentUnavailable {
                    agent_id: agent_id.clone(),
                    state,
                })
            }
            Ok(ReserveOutcome::AtCapacity) => return Err(RoutingError::Overloaded { candidates: 1 }),
            Err(_) => return Err(RoutingError::NotFound(agent_id.clone())),
        };
        let guard = self.hold(reservation);

        let node_id = if guard.instance == record.instance {
            record.node_id.clone()
        } else {
            // Re-registered between lookup and reservation
            match self.registry.lookup(agent_id) {
                Ok(current) if current.instance == guard.instance => current.node_id,
                Ok(current) => {
                    return Err(RoutingError::AgentUnavailable {
                        agent_id: agent_id.clone(),
                        state: current.state,
                    })
                }
                Err(_) => return Err(RoutingError::NotFound(agent_id.clone())),
            }
        };

        let token = self.handoff(&node_id, agent_id, message).await?;
        let target = RouteTarget {
            agent_id: agent_id.clone(),
            node_id,
            token,
        };
        Ok(self.handed_off(target, guard))
    }

    async fn handoff(&self, node_id: &NodeId, agent_id: &AgentId, message: &Message) -> Result<DeliveryToken, RoutingError> {
        match tokio::time::timeout(self.config.handoff_timeout, self.queue.enqueue(node_id, agent_id, message)).await {
            Ok(Ok(token)) => Ok(token),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                warn!(message_id = %message.message_id, node_id = %node_id, "Delivery handoff timed out");
                Err(RoutingError::Timeout)
            }
        }
    }

    fn hold(&self, reservation: Reservation) -> ReservationGuard {
        let registry = self.registry.clone();
        let release: ReleaseFn = Box::new(move |reservation: Reservation| {
            debug!(agent_id = %reservation.agent_id, "Releasing uncommitted reservation");
            if let Err(e) = registry.release(&reservation) {
                debug!(agent_id = %reservation.agent_id, error = %e, "Release skipped");
            }
        });
        scopeguard::guard(reservation, release)
    }

    /// Widen a reservation guard to cover the envelope it was handed off as.
    fn handed_off(&self, target: RouteTarget, guard: ReservationGuard) -> Hold {
        let reservation = ScopeGuard::into_inner(guard);
        let registry = self.registry.clone();
        let queue = self.queue.clone();
        let abandon: AbandonFn = Box::new(move |(target, reservation): (RouteTarget, Reservation)| {
            debug!(agent_id = %target.agent_id, token = %target.token, "Withdrawing uncommitted delivery");
            if let Err(e) = registry.release(&reservation) {
                debug!(agent_id = %reservation.agent_id, error = %e, "Release skipped");
            }
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(e) = queue.reject(target.token, ABANDONED_REASON).await {
                            warn!(agent_id = %target.agent_id, token = %target.token, error = %e, "Withdrawing delivery failed");
                        }
                    });
                }
                Err(_) => warn!(
                    agent_id = %target.agent_id,
                    token = %target.token,
                    "No runtime to withdraw uncommitted delivery"
                ),
            }
        });
        scopeguard::guard((target, reservation), abandon)
    }

    /// Turn held reservations into tracked deliveries. No await points.
    fn commit(&self, message: Message, dispatch: Dispatch, attempts: u32) -> (InflightRoute, RoutingDecision) {
        let now = Instant::now();
        let mut deliveries = HashMap::with_capacity(dispatch.holds.len());
        let mut targets = Vec::with_capacity(dispatch.holds.len());
        for hold in dispatch.holds {
            let (target, reservation) = ScopeGuard::into_inner(hold);
            deliveries.insert(
                target.agent_id.clone(),
                Delivery {
                    reservation,
                    token: target.token,
                    dispatched_at: now,
                },
            );
            targets.push(target);
        }
        self.outstanding.fetch_add(deliveries.len(), Ordering::SeqCst);

        let mut decision = RoutingDecision::new(message.message_id, dispatch.policy, targets, attempts);
        decision.failed = dispatch.failed;
        let route = InflightRoute {
            message,
            decision: decision.clone(),
            deliveries,
        };
        (route, decision)
    }

    fn settle(&self, delivery: &Delivery) {
        if let Err(e) = self.registry.release(&delivery.reservation) {
            debug!(agent_id = %delivery.reservation.agent_id, error = %e, "Release skipped");
        }
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }

    /// The recipient processed the message.
    pub async fn acknowledge(&self, message_id: MessageId, agent_id: &AgentId) -> Result<(), RoutingError> {
        let unknown = || RoutingError::UnknownDelivery {
            message_id,
            agent_id: agent_id.clone(),
        };
        let mut lease = self.existing_lease(message_id).await.ok_or_else(unknown)?;
        let route = lease.as_mut().ok_or_else(unknown)?;
        let delivery = route.deliveries.remove(agent_id).ok_or_else(unknown)?;
        self.settle(&delivery);
        if route.deliveries.is_empty() {
            *lease = None;
        }
        drop(lease);

        if let Err(e) = self.queue.acknowledge(delivery.token).await {
            warn!(message_id = %message_id, agent_id = %agent_id, error = %e, "Queue acknowledge failed");
        }
        self.counters.acknowledged.fetch_add(1, Ordering::Relaxed);
        debug!(message_id = %message_id, agent_id = %agent_id, "Delivery acknowledged");
        self.event_bus.publish_routing_event(RoutingEvent::MessageAcknowledged {
            message_id,
            agent_id: agent_id.clone(),
            acknowledged_at: Utc::now(),
        });
        Ok(())
    }

    /// The recipient failed to process the message. With `retry`, a
    /// capability-routed message with attempts left goes to another agent.
    pub async fn reject(
        &self,
        message_id: MessageId,
        agent_id: &AgentId,
        reason: &str,
        retry: bool,
    ) -> Result<RejectOutcome, RoutingError> {
        let unknown = || RoutingError::UnknownDelivery {
            message_id,
            agent_id: agent_id.clone(),
        };
        let mut lease = self.existing_lease(message_id).await.ok_or_else(unknown)?;
        let route = lease.as_mut().ok_or_else(unknown)?;
        let delivery = route.deliveries.remove(agent_id).ok_or_else(unknown)?;
        self.settle(&delivery);

        let message = route.message.clone();
        let reroute = retry
            && !self.is_closed()
            && message.delivery_mode == DeliveryMode::CapabilityRouted
            && route.deliveries.is_empty()
            && message.attempt_count < self.max_attempts();
        if route.deliveries.is_empty() {
            *lease = None;
        }

        if let Err(e) = self.queue.reject(delivery.token, reason).await {
            warn!(message_id = %message_id, agent_id = %agent_id, error = %e, "Queue reject failed");
        }
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        info!(message_id = %message_id, agent_id = %agent_id, reason, retry, "Delivery rejected");
        self.event_bus.publish_routing_event(RoutingEvent::MessageRejected {
            message_id,
            agent_id: agent_id.clone(),
            reason: reason.to_string(),
            rejected_at: Utc::now(),
        });

        if !reroute {
            return Ok(RejectOutcome::Settled);
        }

        let remaining = self.max_attempts() - message.attempt_count;
        let excluded = HashSet::from([agent_id.clone()]);
        let outcome = tokio::time::timeout(
            self.config.route_deadline,
            self.dispatch_with_retry(&message, &excluded, remaining),
        )
        .await
        .unwrap_or(Err(RoutingError::Timeout));

        match outcome {
            Ok((outgoing, dispatch, attempts)) => {
                let (route, decision) = self.commit(outgoing, dispatch, attempts);
                *lease = Some(route);
                self.record_routed(&decision, message.delivery_mode);
                Ok(RejectOutcome::Rerouted(decision))
            }
            Err(e) => {
                self.record_failure(message_id, message.delivery_mode, &e);
                Ok(RejectOutcome::RerouteFailed(e))
            }
        }
    }

    /// Release deliveries that have waited longer than the ack timeout.
    /// Slots busy with another operation are left for the next pass.
    pub async fn reap_expired(&self, now: Instant) -> usize {
        let slots: Vec<(MessageId, RouteSlot)> = self
            .routes
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        let mut reaped = 0;
        for (message_id, slot) in slots {
            let Ok(guard) = slot.clone().try_lock_owned() else {
                continue;
            };
            let mut lease = SlotLease {
                routes: &self.routes,
                message_id,
                slot,
                guard,
            };
            let Some(route) = lease.as_mut() else {
                continue;
            };

            let expired: Vec<AgentId> = route
                .deliveries
                .iter()
                .filter(|(_, d)| now.saturating_duration_since(d.dispatched_at) >= self.config.ack_timeout)
                .map(|(agent_id, _)| agent_id.clone())
                .collect();
            let mut tokens = Vec::with_capacity(expired.len());
            for agent_id in expired {
                if let Some(delivery) = route.deliveries.remove(&agent_id) {
                    self.settle(&delivery);
                    tokens.push((agent_id, delivery.token));
                }
            }
            if route.deliveries.is_empty() {
                *lease = None;
            }
            drop(lease);

            for (agent_id, token) in tokens {
                if let Err(e) = self.queue.reject(token, "ack timeout").await {
                    debug!(message_id = %message_id, error = %e, "Expired delivery already settled in queue");
                }
                warn!(message_id = %message_id, agent_id = %agent_id, "Delivery expired without acknowledgement");
                self.counters.expired.fetch_add(1, Ordering::Relaxed);
                ::metrics::counter!(metrics::DELIVERIES_EXPIRED_TOTAL).increment(1);
                self.event_bus.publish_routing_event(RoutingEvent::DeliveryExpired {
                    message_id,
                    agent_id,
                    expired_at: Utc::now(),
                });
                reaped += 1;
            }
        }
        reaped
    }

    /// Reap expired deliveries every `interval` until `cancel` fires.
    pub async fn run_reaper(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.reap_expired(Instant::now()).await;
                }
            }
        }
        debug!("Delivery reaper stopped");
    }

    /// Router view of a message; `None` once it is fully settled or unknown.
    pub fn pending(&self, message_id: MessageId) -> Option<PendingRoute> {
        let slot = self.routes.get(&message_id)?.value().clone();
        let Ok(guard) = slot.try_lock() else {
            return Some(PendingRoute {
                message_id,
                status: MessageStatus::Pending,
                policy: None,
                attempts: 0,
                outstanding: Vec::new(),
            });
        };
        let route = (*guard).as_ref()?;
        let mut outstanding: Vec<AgentId> = route.deliveries.keys().cloned().collect();
        outstanding.sort();
        Some(PendingRoute {
            message_id,
            status: MessageStatus::Dispatched,
            policy: Some(route.decision.policy),
            attempts: route.decision.attempts,
            outstanding,
        })
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            routed: self.counters.routed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            duplicates: self.counters.duplicates.load(Ordering::Relaxed),
            acknowledged: self.counters.acknowledged.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            pending: self.outstanding.load(Ordering::SeqCst),
        }
    }

    /// Stop accepting messages, give in-flight work up to `grace` to settle,
    /// then release whatever is still outstanding. Returns the number of
    /// deliveries released.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(grace = ?grace, "Message router shutting down");
        }

        let settled = async {
            while self.active_routes.load(Ordering::SeqCst) > 0 || self.outstanding.load(Ordering::SeqCst) > 0 {
                tokio::time::sleep(SETTLE_POLL_INTERVAL).await;
            }
        };
        if tokio::time::timeout(grace, settled).await.is_err() {
            warn!(
                routes = self.active_routes.load(Ordering::SeqCst),
                deliveries = self.outstanding.load(Ordering::SeqCst),
                "Grace period elapsed with work outstanding"
            );
        }

        let slots: Vec<(MessageId, RouteSlot)> = self
            .routes
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        let mut released = 0;
        for (message_id, slot) in slots {
            let Ok(guard) = slot.clone().try_lock_owned() else {
                continue;
            };
            let mut lease = SlotLease {
                routes: &self.routes,
                message_id,
                slot,
                guard,
            };
            let Some(route) = lease.take() else {
                continue;
            };
            drop(lease);

            for (agent_id, delivery) in route.deliveries {
                self.settle(&delivery);
                if let Err(e) = self.queue.reject(delivery.token, "router shutting down").await {
                    debug!(message_id = %message_id, agent_id = %agent_id, error = %e, "Queue reject failed");
                }
                released += 1;
            }
        }

        if released > 0 {
            warn!(released, "Released unacknowledged deliveries at shutdown");
        }
        released
    }

    fn record_routed(&self, decision: &RoutingDecision, mode: DeliveryMode) {
        self.counters.routed.fetch_add(1, Ordering::Relaxed);
        ::metrics::counter!(metrics::MESSAGES_ROUTED_TOTAL, "mode" => mode.as_str()).increment(1);

        if !decision.failed.is_empty() {
            warn!(
                message_id = %decision.message_id,
                delivered = decision.targets.len(),
                failed = decision.failed.len(),
                "Broadcast partially delivered"
            );
        }
        debug!(
            message_id = %decision.message_id,
            policy = ?decision.policy,
            targets = ?decision.agent_ids(),
            attempts = decision.attempts,
            "Message routed"
        );
        self.event_bus.publish_routing_event(RoutingEvent::MessageRouted {
            message_id: decision.message_id,
            policy: decision.policy,
            targets: decision.agent_ids(),
            attempts: decision.attempts,
            routed_at: decision.decided_at_utc,
        });
    }

    fn record_failure(&self, message_id: MessageId, mode: DeliveryMode, error: &RoutingError) {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        ::metrics::counter!(
            metrics::ROUTING_FAILURES_TOTAL,
            "mode" => mode.as_str(),
            "error" => error.root_cause().kind()
        )
        .increment(1);
        warn!(message_id = %message_id, mode = mode.as_str(), error = %error, "Routing failed");
        self.event_bus.publish_routing_event(RoutingEvent::RoutingFailed {
            message_id,
            error: error.to_string(),
            failed_at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::agent::AgentKind;
    use crate::infrastructure::delivery::InMemoryDeliveryQueue;
    use crate::infrastructure::registry::InMemoryAgentRegistry;
    use serde_json::json;

    fn setup(agents: &[&str]) -> (Arc<InMemoryAgentRegistry>, Arc<InMemoryDeliveryQueue>, MessageRouter) {
        let registry = Arc::new(InMemoryAgentRegistry::default());
        for id in agents {
            let descriptor = AgentDescriptor::new(AgentId::from(*id), AgentKind::Researcher, vec![], NodeId::from("node-a"));
            registry.register(descriptor, false).unwrap();
            registry
                .transition_if(&AgentId::from(*id), AgentState::Active, Utc::now(), &|_| true)
                .unwrap();
        }
        let queue = Arc::new(InMemoryDeliveryQueue::new(64));
        let router = MessageRouter::new(registry.clone(), queue.clone(), EventBus::new(64), RoutingConfig::default());
        (registry, queue, router)
    }

    fn inflight(registry: &InMemoryAgentRegistry, id: &str) -> u32 {
        registry.lookup(&AgentId::from(id)).unwrap().inflight_count
    }

    #[tokio::test]
    async fn test_ack_releases_reservation_and_clears_slot() {
        let (registry, queue, router) = setup(&["r1"]);
        let message = Message::capability_routed(AgentId::from("c1"), Capability::new("research"), json!({}));
        let id = message.message_id;

        let decision = router.route(message, router.default_context()).await.unwrap();
        assert_eq!(decision.policy, RoutingPolicy::LeastLoaded);
        assert_eq!(inflight(&registry, "r1"), 1);
        assert_eq!(router.pending(id).unwrap().status, MessageStatus::Dispatched);

        router.acknowledge(id, &AgentId::from("r1")).await.unwrap();
        assert_eq!(inflight(&registry, "r1"), 0);
        assert_eq!(queue.depth(), 0);
        assert!(router.pending(id).is_none());
        assert!(matches!(
            router.acknowledge(id, &AgentId::from("r1")).await,
            Err(RoutingError::UnknownDelivery { .. })
        ));
    }

    #[tokio::test]
    async fn test_duplicate_message_id_does_not_reserve_twice() {
        let (registry, _queue, router) = setup(&["r1", "r2"]);
        let message = Message::capability_routed(AgentId::from("c1"), Capability::new("research"), json!({}));

        let first = router.route(message.clone(), router.default_context()).await.unwrap();
        let second = router.route(message, router.default_context()).await.unwrap();

        assert_eq!(first.agent_ids(), second.agent_ids());
        assert_eq!(inflight(&registry, "r1") + inflight(&registry, "r2"), 1);
        assert_eq!(router.stats().duplicates, 1);
    }

    #[tokio::test]
    async fn test_reject_with_retry_goes_to_another_agent() {
        let (registry, _queue, router) = setup(&["r1", "r2"]);
        let message = Message::capability_routed(AgentId::from("c1"), Capability::new("research"), json!({}));
        let id = message.message_id;

        let first = router.route(message, router.default_context()).await.unwrap();
        let rejecting = first.agent_ids()[0].clone();

        let outcome = router.reject(id, &rejecting, "busy", true).await.unwrap();
        let RejectOutcome::Rerouted(second) = outcome else {
            panic!("expected reroute, got {:?}", outcome);
        };
        assert_ne!(second.agent_ids()[0], rejecting);
        assert_eq!(inflight(&registry, rejecting.as_str()), 0);
        assert_eq!(router.stats().pending, 1);
    }

    #[tokio::test]
    async fn test_validation_failure_is_counted() {
        let (_registry, _queue, router) = setup(&["r1"]);
        let mut message = Message::direct(AgentId::from("c1"), AgentId::from("r1"), json!({}));
        message.capability = Some(Capability::new("research"));

        let err = router.route(message, router.default_context()).await.unwrap_err();
        assert_eq!(err, RoutingError::InvalidMessage(MessageError::DirectAddressing));
        assert_eq!(router.stats().failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_releases_unacknowledged_deliveries() {
        let (registry, queue, router) = setup(&["r1"]);
        let message = Message::direct(AgentId::from("c1"), AgentId::from("r1"), json!({}));
        router.route(message, router.default_context()).await.unwrap();

        assert_eq!(router.reap_expired(Instant::now()).await, 0);
        tokio::time::advance(router.config().ack_timeout).await;
        assert_eq!(router.reap_expired(Instant::now()).await, 1);

        assert_eq!(inflight(&registry, "r1"), 0);
        assert_eq!(queue.depth(), 0);
        assert_eq!(router.stats().expired, 1);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_routes_and_releases_outstanding() {
        let (registry, _queue, router) = setup(&["r1"]);
        let message = Message::direct(AgentId::from("c1"), AgentId::from("r1"), json!({}));
        router.route(message, router.default_context()).await.unwrap();

        let released = router.shutdown(Duration::from_millis(50)).await;
        assert_eq!(released, 1);
        assert_eq!(inflight(&registry, "r1"), 0);

        let next = Message::direct(AgentId::from("c1"), AgentId::from("r1"), json!({}));
        assert_eq!(
            router.route(next, router.default_context()).await.unwrap_err(),
            RoutingError::ShuttingDown
        );
    }
}
