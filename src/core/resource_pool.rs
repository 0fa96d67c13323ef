//! Token-bucket resource pool.
//!
//! Each resource type owns one [`ResourceBucket`] behind its own
//! `parking_lot::Mutex`, so checks against unrelated resource types never
//! contend. The map of buckets sits behind an `RwLock` that is only written
//! by [`ResourcePool::configure`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::core::SchedulerError;
use crate::util::clock::Clock;
use crate::util::types::ResourceType;

/// Slack for float comparisons on token counts.
const EPSILON: f64 = 1e-9;

/// Token bucket for one resource type.
///
/// `tokens` is what can be handed out now, `granted` is what active
/// reservations hold. Refill never raises `tokens` above
/// `capacity - granted`, so reservations and refill cannot double count.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceBucket {
    resource: ResourceType,
    capacity: f64,
    tokens: f64,
    granted: f64,
    refill_rate: f64,
    #[serde(skip)]
    last_refill: Duration,
}

impl ResourceBucket {
    /// Create a full bucket.
    pub fn new(resource: ResourceType, capacity: f64, refill_rate: f64, now: Duration) -> Self {
        Self {
            resource,
            capacity,
            tokens: capacity,
            granted: 0.0,
            refill_rate,
            last_refill: now,
        }
    }

    /// Resource this bucket tracks.
    pub const fn resource(&self) -> &ResourceType {
        &self.resource
    }

    /// Maximum tokens.
    pub const fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Tokens available right now (as of the last refill).
    pub const fn tokens(&self) -> f64 {
        self.tokens
    }

    /// Tokens held by active reservations.
    pub const fn granted(&self) -> f64 {
        self.granted
    }

    /// Tokens restored per second.
    pub const fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// Apply continuous refill up to `now`.
    pub fn refill(&mut self, now: Duration) {
        let elapsed = now.saturating_sub(self.last_refill).as_secs_f64();
        if now > self.last_refill {
            self.last_refill = now;
        }
        if elapsed > 0.0 && self.refill_rate > 0.0 {
            let ceiling = (self.capacity - self.granted).max(0.0);
            self.tokens = (elapsed.mul_add(self.refill_rate, self.tokens)).min(ceiling);
        }
    }

    /// Spend `amount` tokens if available after refill. No state change on failure.
    pub fn consume(&mut self, amount: f64, now: Duration) -> bool {
        if amount <= 0.0 {
            return true;
        }
        self.refill(now);
        if self.tokens + EPSILON >= amount {
            self.tokens = (self.tokens - amount).max(0.0);
            true
        } else {
            false
        }
    }

    fn can_reserve(&self, amount: f64) -> bool {
        self.tokens + EPSILON >= amount
    }

    fn reserve(&mut self, amount: f64) {
        self.tokens = (self.tokens - amount).max(0.0);
        self.granted += amount;
    }

    /// Return a reservation. Amounts beyond what is granted are ignored.
    pub fn release(&mut self, amount: f64) {
        if amount <= 0.0 {
            return;
        }
        let returned = amount.min(self.granted);
        self.granted -= returned;
        if self.granted < EPSILON {
            self.granted = 0.0;
        }
        self.tokens = (self.tokens + returned).min(self.capacity - self.granted);
    }

    fn shortfall(&self, requested: f64) -> Shortfall {
        Shortfall {
            resource: self.resource.clone(),
            requested,
            available: self.tokens,
            capacity: self.capacity,
            refill_rate: self.refill_rate,
        }
    }

    fn snapshot(&self) -> BucketSnapshot {
        BucketSnapshot {
            resource: self.resource.clone(),
            capacity: self.capacity,
            available: self.tokens,
            granted: self.granted,
            refill_rate: self.refill_rate,
        }
    }
}

/// Point-in-time view of one bucket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketSnapshot {
    /// Resource type.
    pub resource: ResourceType,
    /// Maximum tokens.
    pub capacity: f64,
    /// Tokens available.
    pub available: f64,
    /// Tokens held by active reservations.
    pub granted: f64,
    /// Tokens restored per second.
    pub refill_rate: f64,
}

/// Why a reservation could not be satisfied for one resource type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Shortfall {
    /// Resource that is short.
    pub resource: ResourceType,
    /// Amount requested.
    pub requested: f64,
    /// Amount available at the check.
    pub available: f64,
    /// Bucket capacity.
    pub capacity: f64,
    /// Bucket refill rate.
    pub refill_rate: f64,
}

impl Shortfall {
    /// Missing amount.
    pub fn missing(&self) -> f64 {
        (self.requested - self.available).max(0.0)
    }

    /// Estimated wait for refill to cover the gap; `None` when the bucket does
    /// not refill and only a release can help.
    pub fn wait_time(&self) -> Option<Duration> {
        let missing = self.missing();
        if missing <= 0.0 {
            return Some(Duration::ZERO);
        }
        if self.refill_rate <= 0.0 {
            return None;
        }
        Duration::try_from_secs_f64(missing / self.refill_rate).ok()
    }

    /// Error describing this shortfall.
    pub fn to_error(&self) -> SchedulerError {
        SchedulerError::InsufficientResources {
            resource: self.resource.clone(),
            requested: self.requested,
            available: self.available,
        }
    }
}

/// Collection of token buckets keyed by resource type.
pub struct ResourcePool {
    clock: Arc<dyn Clock>,
    buckets: RwLock<HashMap<ResourceType, Arc<Mutex<ResourceBucket>>>>,
}

impl ResourcePool {
    /// Create an empty pool reading time from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    /// Clock used for refill.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Create or reconfigure the bucket for `resource`.
    ///
    /// Reconfiguring keeps outstanding reservations and refills the rest of
    /// the new capacity.
    pub fn configure(
        &self,
        resource: ResourceType,
        capacity: f64,
        refill_rate: f64,
    ) -> Result<(), SchedulerError> {
        let resource = resource.normalized();
        if !capacity.is_finite() || capacity <= 0.0 {
            return Err(SchedulerError::InvalidConfig(format!(
                "capacity for {resource} must be a positive number"
            )));
        }
        if !refill_rate.is_finite() || refill_rate < 0.0 {
            return Err(SchedulerError::InvalidConfig(format!(
                "refill rate for {resource} must be non-negative"
            )));
        }
        let now = self.clock.now();
        let mut buckets = self.buckets.write();
        if let Some(existing) = buckets.get(&resource) {
            let mut bucket = existing.lock();
            let granted = bucket.granted;
            *bucket = ResourceBucket::new(resource.clone(), capacity, refill_rate, now);
            bucket.granted = granted.min(capacity);
            bucket.tokens = capacity - bucket.granted;
        } else {
            tracing::debug!(%resource, capacity, refill_rate, "configured resource bucket");
            buckets.insert(
                resource.clone(),
                Arc::new(Mutex::new(ResourceBucket::new(
                    resource, capacity, refill_rate, now,
                ))),
            );
        }
        Ok(())
    }

    fn bucket(&self, resource: &ResourceType) -> Result<Arc<Mutex<ResourceBucket>>, SchedulerError> {
        self.buckets
            .read()
            .get(resource)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownResource(resource.clone()))
    }

    /// Spend `amount` tokens of `resource`.
    ///
    /// Zero amounts always succeed. Spent tokens come back only through refill.
    pub fn consume(&self, resource: &ResourceType, amount: f64) -> Result<bool, SchedulerError> {
        if amount <= 0.0 {
            return Ok(true);
        }
        let bucket = self.bucket(resource)?;
        let now = self.clock.now();
        let consumed = bucket.lock().consume(amount, now);
        Ok(consumed)
    }

    /// Tokens available for `resource` after refill.
    pub fn available(&self, resource: &ResourceType) -> Result<f64, SchedulerError> {
        let bucket = self.bucket(resource)?;
        let now = self.clock.now();
        let mut bucket = bucket.lock();
        bucket.refill(now);
        Ok(bucket.tokens)
    }

    /// Tokens of `resource` held by active reservations.
    pub fn granted(&self, resource: &ResourceType) -> Result<f64, SchedulerError> {
        Ok(self.bucket(resource)?.lock().granted)
    }

    /// Capacity of `resource`.
    pub fn capacity(&self, resource: &ResourceType) -> Result<f64, SchedulerError> {
        Ok(self.bucket(resource)?.lock().capacity)
    }

    /// Configured resource types, sorted.
    pub fn resources(&self) -> Vec<ResourceType> {
        let mut resources: Vec<_> = self.buckets.read().keys().cloned().collect();
        resources.sort();
        resources
    }

    /// Refilled snapshot of every bucket, sorted by resource type.
    pub fn snapshot(&self) -> Vec<BucketSnapshot> {
        let now = self.clock.now();
        let handles: Vec<_> = self.buckets.read().values().cloned().collect();
        let mut snapshots: Vec<_> = handles
            .iter()
            .map(|handle| {
                let mut bucket = handle.lock();
                bucket.refill(now);
                bucket.snapshot()
            })
            .collect();
        snapshots.sort_by(|a, b| a.resource.cmp(&b.resource));
        snapshots
    }

    /// Reject requests that name unknown resources or can never fit.
    pub(crate) fn check_capacity(
        &self,
        needs: &BTreeMap<ResourceType, f64>,
    ) -> Result<(), SchedulerError> {
        for (resource, amount) in needs {
            let capacity = self.capacity(resource)?;
            if *amount > capacity + EPSILON {
                return Err(SchedulerError::BudgetExceeded {
                    resource: resource.clone(),
                    requested: *amount,
                    capacity,
                });
            }
        }
        Ok(())
    }

    /// Reserve every need or none of them.
    ///
    /// Buckets are locked in `BTreeMap` order, which is the same for every
    /// caller. Returns the shortfalls; empty means the reservation was made.
    pub(crate) fn try_reserve_all(
        &self,
        needs: &BTreeMap<ResourceType, f64>,
    ) -> Result<Vec<Shortfall>, SchedulerError> {
        let mut handles = Vec::with_capacity(needs.len());
        for (resource, amount) in needs {
            if *amount > 0.0 {
                handles.push((*amount, self.bucket(resource)?));
            }
        }
        let now = self.clock.now();
        let mut guards: Vec<_> = handles
            .iter()
            .map(|(amount, handle)| (*amount, handle.lock()))
            .collect();

        let mut shortfalls = Vec::new();
        for (amount, bucket) in &mut guards {
            bucket.refill(now);
            if !bucket.can_reserve(*amount) {
                shortfalls.push(bucket.shortfall(*amount));
            }
        }
        if shortfalls.is_empty() {
            for (amount, bucket) in &mut guards {
                bucket.reserve(*amount);
            }
        }
        Ok(shortfalls)
    }

    /// Return `released` and reserve `needs` under one set of bucket locks,
    /// so no other caller can take the returned tokens in between.
    ///
    /// The release always happens. The reservation is all-or-nothing as in
    /// [`Self::try_reserve_all`].
    pub(crate) fn release_and_reserve(
        &self,
        released: &BTreeMap<ResourceType, f64>,
        needs: &BTreeMap<ResourceType, f64>,
    ) -> Result<Vec<Shortfall>, SchedulerError> {
        let mut touched: BTreeMap<&ResourceType, (f64, f64)> = BTreeMap::new();
        for (resource, amount) in released {
            touched.entry(resource).or_default().0 += *amount;
        }
        for (resource, amount) in needs.iter().filter(|(_, amount)| **amount > 0.0) {
            touched.entry(resource).or_default().1 += *amount;
        }

        let mut missing = None;
        let mut handles = Vec::with_capacity(touched.len());
        for (resource, (give, take)) in touched {
            match self.bucket(resource) {
                Ok(handle) => handles.push((give, take, handle)),
                Err(err) if take > 0.0 => {
                    missing.get_or_insert(err);
                }
                Err(err) => tracing::error!("failed to release {give} of {resource}: {err}"),
            }
        }

        let now = self.clock.now();
        let mut guards: Vec<_> = handles
            .iter()
            .map(|(give, take, handle)| (*give, *take, handle.lock()))
            .collect();
        let mut shortfalls = Vec::new();
        for (give, take, bucket) in &mut guards {
            bucket.refill(now);
            bucket.release(*give);
            if *take > 0.0 && !bucket.can_reserve(*take) {
                shortfalls.push(bucket.shortfall(*take));
            }
        }
        if let Some(err) = missing {
            return Err(err);
        }
        if shortfalls.is_empty() {
            for (_, take, bucket) in &mut guards {
                if *take > 0.0 {
                    bucket.reserve(*take);
                }
            }
        }
        Ok(shortfalls)
    }

    /// Shortfalls the given needs would hit right now, without reserving.
    pub(crate) fn peek_shortfalls(&self, needs: &BTreeMap<ResourceType, f64>) -> Vec<Shortfall> {
        let now = self.clock.now();
        needs
            .iter()
            .filter(|(_, amount)| **amount > 0.0)
            .filter_map(|(resource, amount)| {
                let handle = self.bucket(resource).ok()?;
                let mut bucket = handle.lock();
                bucket.refill(now);
                let short = if bucket.can_reserve(*amount) {
                    None
                } else {
                    Some(bucket.shortfall(*amount))
                };
                short
            })
            .collect()
    }

    /// Return reserved amounts to their buckets.
    pub(crate) fn release_all(&self, resources: &BTreeMap<ResourceType, f64>) {
        for (resource, amount) in resources {
            match self.bucket(resource) {
                Ok(handle) => handle.lock().release(*amount),
                Err(e) => tracing::error!("failed to release {amount} of {resource}: {e}"),
            }
        }
    }
}

impl std::fmt::Debug for ResourcePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourcePool")
            .field("resources", &self.resources())
            .finish()
    }
}
