/*!
# Conflict Resolver

Pluggable strategies for resource and task contention. Strategies register
into a small table keyed by name; resolutions append to a bounded history
for audit.
*/

use crate::error::{CoordinationError, Result};
use crate::events::{CoordinationEvent, EventBus};
use crate::metrics::RingBuffer;
use crate::optimistic::OptimisticLockManager;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::info;
use uuid::Uuid;

/// What is being contended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictKind {
    /// Multiple workers want the same resource
    Resource,
    /// Multiple workers claim the same task
    Task,
}

/// A reported contention
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    /// Conflict id
    pub id: Uuid,
    /// Kind of contention
    pub kind: ConflictKind,
    /// Contended resource or task id
    pub target_id: String,
    /// Workers contending
    pub contenders: Vec<String>,
    /// Whether a resolution exists
    pub resolved: bool,
    /// The resolution, once made
    pub resolution: Option<Resolution>,
    /// Report timestamp
    pub reported_at: DateTime<Utc>,
}

impl Conflict {
    /// Report a new conflict
    pub fn new(kind: ConflictKind, target_id: impl Into<String>, contenders: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            target_id: target_id.into(),
            contenders,
            resolved: false,
            resolution: None,
            reported_at: Utc::now(),
        }
    }
}

/// The outcome of a resolution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resolution {
    /// Worker that wins the target
    pub winner: String,
    /// Workers that back off
    pub losers: Vec<String>,
    /// Strategy reasoning
    pub reason: String,
    /// Resolution timestamp
    pub timestamp: DateTime<Utc>,
}

/// Per-contender facts a strategy may consult
#[derive(Debug, Clone, Default)]
pub struct ResolutionContext {
    /// Worker selection priorities
    pub priorities: HashMap<String, i32>,
    /// When each contender first asked for the target
    pub request_times: HashMap<String, DateTime<Utc>>,
    /// Votes cast per contender
    pub votes: HashMap<String, usize>,
}

impl ResolutionContext {
    /// Empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a contender's priority
    pub fn with_priority(mut self, worker: impl Into<String>, priority: i32) -> Self {
        self.priorities.insert(worker.into(), priority);
        self
    }

    /// Record a contender's request time
    pub fn with_request_time(mut self, worker: impl Into<String>, at: DateTime<Utc>) -> Self {
        self.request_times.insert(worker.into(), at);
        self
    }

    /// Record votes for a contender
    pub fn with_votes(mut self, worker: impl Into<String>, votes: usize) -> Self {
        self.votes.insert(worker.into(), votes);
        self
    }
}

/// A conflict-resolution rule
pub trait ConflictStrategy: Send + Sync {
    /// Registry key
    fn name(&self) -> &'static str;

    /// Pick a winner among the contenders
    fn resolve(&self, conflict: &Conflict, ctx: &ResolutionContext) -> Result<Resolution>;
}

fn resolution(winner: &str, conflict: &Conflict, reason: String) -> Resolution {
    Resolution {
        winner: winner.to_string(),
        losers: conflict
            .contenders
            .iter()
            .filter(|c| c.as_str() != winner)
            .cloned()
            .collect(),
        reason,
        timestamp: Utc::now(),
    }
}

/// Highest worker priority wins
pub struct PriorityStrategy;

impl ConflictStrategy for PriorityStrategy {
    fn name(&self) -> &'static str {
        "priority"
    }

    fn resolve(&self, conflict: &Conflict, ctx: &ResolutionContext) -> Result<Resolution> {
        let winner = conflict
            .contenders
            .iter()
            .max_by_key(|c| (ctx.priorities.get(*c).copied().unwrap_or(0), std::cmp::Reverse((*c).clone())))
            .ok_or_else(|| CoordinationError::system("conflict has no contenders"))?;
        let priority = ctx.priorities.get(winner).copied().unwrap_or(0);
        Ok(resolution(
            winner,
            conflict,
            format!("highest priority ({priority})"),
        ))
    }
}

/// Earliest request wins
pub struct TimestampStrategy;

impl ConflictStrategy for TimestampStrategy {
    fn name(&self) -> &'static str {
        "timestamp"
    }

    fn resolve(&self, conflict: &Conflict, ctx: &ResolutionContext) -> Result<Resolution> {
        let winner = conflict
            .contenders
            .iter()
            .min_by_key(|c| {
                (
                    ctx.request_times
                        .get(*c)
                        .copied()
                        .unwrap_or_else(Utc::now),
                    (*c).clone(),
                )
            })
            .ok_or_else(|| CoordinationError::system("conflict has no contenders"))?;
        Ok(resolution(winner, conflict, "earliest request".to_string()))
    }
}

/// Most votes wins
pub struct VoteStrategy;

impl ConflictStrategy for VoteStrategy {
    fn name(&self) -> &'static str {
        "vote"
    }

    fn resolve(&self, conflict: &Conflict, ctx: &ResolutionContext) -> Result<Resolution> {
        let winner = conflict
            .contenders
            .iter()
            .max_by_key(|c| (ctx.votes.get(*c).copied().unwrap_or(0), std::cmp::Reverse((*c).clone())))
            .ok_or_else(|| CoordinationError::system("conflict has no contenders"))?;
        let votes = ctx.votes.get(winner).copied().unwrap_or(0);
        Ok(resolution(winner, conflict, format!("{votes} votes")))
    }
}

/// The latest optimistic acquirer of the target wins; falls back to the
/// earliest request when nobody holds a version stamp
pub struct OptimisticStrategy {
    locks: Arc<OptimisticLockManager>,
}

impl OptimisticStrategy {
    /// Create a strategy over the given optimistic lock manager
    pub fn new(locks: Arc<OptimisticLockManager>) -> Self {
        Self { locks }
    }
}

impl ConflictStrategy for OptimisticStrategy {
    fn name(&self) -> &'static str {
        "optimistic"
    }

    fn resolve(&self, conflict: &Conflict, ctx: &ResolutionContext) -> Result<Resolution> {
        if let Some(holder) = self.locks.latest_acquirer(&conflict.target_id) {
            if conflict.contenders.contains(&holder) {
                let version = self.locks.version(&conflict.target_id).unwrap_or(0);
                return Ok(resolution(
                    &holder,
                    conflict,
                    format!("latest acquirer at version {version}"),
                ));
            }
        }
        TimestampStrategy.resolve(conflict, ctx)
    }
}

/// Registry plus audit trail
pub struct ConflictResolver {
    strategies: HashMap<String, Arc<dyn ConflictStrategy>>,
    default_strategy: String,
    conflicts: Mutex<HashMap<Uuid, Conflict>>,
    history: Mutex<RingBuffer<Resolution>>,
    events: EventBus,
}

impl ConflictResolver {
    /// Create a resolver with the four stock strategies registered
    pub fn new(
        default_strategy: impl Into<String>,
        optimistic: Arc<OptimisticLockManager>,
        history_capacity: usize,
        events: EventBus,
    ) -> Self {
        let mut resolver = Self {
            strategies: HashMap::new(),
            default_strategy: default_strategy.into(),
            conflicts: Mutex::new(HashMap::new()),
            history: Mutex::new(RingBuffer::new(history_capacity)),
            events,
        };
        resolver.register(Arc::new(PriorityStrategy));
        resolver.register(Arc::new(TimestampStrategy));
        resolver.register(Arc::new(VoteStrategy));
        resolver.register(Arc::new(OptimisticStrategy::new(optimistic)));
        resolver
    }

    /// Register a strategy under its name
    pub fn register(&mut self, strategy: Arc<dyn ConflictStrategy>) {
        self.strategies
            .insert(strategy.name().to_string(), strategy);
    }

    /// Record a conflict without resolving it
    pub fn report(&self, conflict: Conflict) {
        self.conflicts
            .lock()
            .unwrap()
            .entry(conflict.id)
            .or_insert(conflict);
    }

    /// Resolve a conflict, idempotently: a second call for the same conflict
    /// id returns the recorded resolution.
    pub fn resolve(
        &self,
        conflict: Conflict,
        ctx: &ResolutionContext,
        strategy: Option<&str>,
    ) -> Result<Resolution> {
        {
            let conflicts = self.conflicts.lock().unwrap();
            if let Some(existing) = conflicts.get(&conflict.id) {
                if let Some(resolution) = &existing.resolution {
                    return Ok(resolution.clone());
                }
            }
        }

        let name = strategy.unwrap_or(&self.default_strategy);
        let strategy = self
            .strategies
            .get(name)
            .ok_or_else(|| CoordinationError::system(format!("unknown conflict strategy '{name}'")))?
            .clone();

        let resolution = strategy.resolve(&conflict, ctx)?;
        info!(
            conflict = %conflict.id,
            target = %conflict.target_id,
            winner = %resolution.winner,
            strategy = name,
            "conflict resolved"
        );

        let mut stored = conflict;
        stored.resolved = true;
        stored.resolution = Some(resolution.clone());
        self.events.emit(CoordinationEvent::ConflictResolved {
            conflict_id: stored.id.to_string(),
            winner: resolution.winner.clone(),
        });
        self.conflicts.lock().unwrap().insert(stored.id, stored);
        self.history.lock().unwrap().push(resolution.clone());

        Ok(resolution)
    }

    /// A conflict by id
    pub fn get(&self, id: Uuid) -> Option<Conflict> {
        self.conflicts.lock().unwrap().get(&id).cloned()
    }

    /// Recent resolutions, oldest first
    pub fn history(&self) -> Vec<Resolution> {
        self.history.lock().unwrap().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn resolver() -> ConflictResolver {
        ConflictResolver::new(
            "priority",
            Arc::new(OptimisticLockManager::new(60_000)),
            100,
            EventBus::new(),
        )
    }

    fn contenders() -> Vec<String> {
        vec!["w1".to_string(), "w2".to_string()]
    }

    #[test]
    fn test_priority_strategy() {
        let resolver = resolver();
        let conflict = Conflict::new(ConflictKind::Resource, "r1", contenders());
        let ctx = ResolutionContext::new()
            .with_priority("w1", 3)
            .with_priority("w2", 7);

        let resolution = resolver.resolve(conflict, &ctx, None).unwrap();
        assert_eq!(resolution.winner, "w2");
        assert_eq!(resolution.losers, vec!["w1".to_string()]);
    }

    #[test]
    fn test_timestamp_strategy() {
        let resolver = resolver();
        let conflict = Conflict::new(ConflictKind::Task, "t1", contenders());
        let now = Utc::now();
        let ctx = ResolutionContext::new()
            .with_request_time("w1", now)
            .with_request_time("w2", now - ChronoDuration::seconds(10));

        let resolution = resolver
            .resolve(conflict, &ctx, Some("timestamp"))
            .unwrap();
        assert_eq!(resolution.winner, "w2");
    }

    #[test]
    fn test_vote_strategy() {
        let resolver = resolver();
        let conflict = Conflict::new(ConflictKind::Resource, "r1", contenders());
        let ctx = ResolutionContext::new().with_votes("w1", 5).with_votes("w2", 2);

        let resolution = resolver.resolve(conflict, &ctx, Some("vote")).unwrap();
        assert_eq!(resolution.winner, "w1");
    }

    #[test]
    fn test_optimistic_strategy_prefers_latest_acquirer() {
        let olm = Arc::new(OptimisticLockManager::new(60_000));
        olm.acquire("r1", "w2");

        let resolver =
            ConflictResolver::new("optimistic", olm, 100, EventBus::new());
        let conflict = Conflict::new(ConflictKind::Resource, "r1", contenders());
        let resolution = resolver
            .resolve(conflict, &ResolutionContext::new(), None)
            .unwrap();
        assert_eq!(resolution.winner, "w2");
    }

    #[test]
    fn test_resolution_idempotent() {
        let resolver = resolver();
        let conflict = Conflict::new(ConflictKind::Resource, "r1", contenders());
        let ctx = ResolutionContext::new()
            .with_priority("w1", 3)
            .with_priority("w2", 7);

        let first = resolver.resolve(conflict.clone(), &ctx, None).unwrap();
        // Re-resolving with a different context must not change the outcome
        let again = resolver
            .resolve(conflict, &ResolutionContext::new().with_priority("w1", 99), None)
            .unwrap();
        assert_eq!(first.winner, again.winner);
        assert_eq!(resolver.history().len(), 1);
    }

    #[test]
    fn test_unknown_strategy() {
        let resolver = resolver();
        let conflict = Conflict::new(ConflictKind::Resource, "r1", contenders());
        let err = resolver
            .resolve(conflict, &ResolutionContext::new(), Some("nope"))
            .unwrap_err();
        assert!(matches!(err, CoordinationError::System(_)));
    }
}
