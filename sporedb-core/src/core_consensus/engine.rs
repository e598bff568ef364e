/*
    engine.rs - the consensus state machine

    Three maps drive the spore flow:

    * `waiting` holds spores that currently conflict with one or more
      staging spores. They are dropped or promoted depending on the fate
      of their conflicting peers.

    * `staging` holds spores that have been validated but still require
      endorsements. They are dropped at their deadline or promoted to
      application once the quorum is reached.

    * `applied` remembers grace-period information about recently applied
      spores, guarding against replays until the grace instant passes.
*/

use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core_encoding::{Float, Timestamp};
use crate::core_keyring::KeyRing;
use crate::core_store::{get_or_empty, SharedStore, Store, StoreError};
use crate::core_version::Version;
use crate::shutdown::ShutdownCoordinator;

use super::error::ConsensusError;
use super::policy::{CompiledPolicy, Policy};
use super::spore::{Catalog, Endorsement, RecoverRequest, Spore};
use super::value::Value;

/// Interval of the applied-memory cleaner.
const CLEAN_INTERVAL: Duration = Duration::from_secs(60);

/// Capacity of the spore hash cache.
const HASH_CACHE_SIZE: usize = 32;

/// Capacity of the consensus output channel.
const MESSAGES_CAPACITY: usize = 16;

/// Output of the consensus algorithm, consumed by the overlay
/// broadcaster.
#[derive(Debug, Clone)]
pub enum EngineMessage {
    Spore(Spore),
    Endorsement(Endorsement),
    Recover(RecoverRequest),
}

/// A spore pending in `waiting` or `staging`, with its accumulated
/// endorsements and (for staging) its expiry timer.
struct Trigger {
    spore: Spore,
    endorsements: Vec<Endorsement>,
    timer: Option<JoinHandle<()>>,
}

impl Drop for Trigger {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Main structure for database management of a node.
pub struct Engine {
    /// Underlying storage engine, behind the exclusive mutation lock.
    pub store: SharedStore,
    /// Identity of the local node; should be unique.
    pub identity: String,
    /// Key management, used to sign and verify endorsements and spores.
    pub keyring: Arc<KeyRing>,

    messages_tx: mpsc::Sender<EngineMessage>,
    policies: RwLock<HashMap<String, Arc<CompiledPolicy>>>,

    waiting: Mutex<HashMap<String, Trigger>>,
    staging: Mutex<HashMap<String, Trigger>>,
    applied: Mutex<HashMap<String, Option<Timestamp>>>,

    hash_cache: Mutex<LruCache<String, Vec<u8>>>,
    gc_tx: mpsc::Sender<String>,
    gc_rx: Mutex<Option<mpsc::Receiver<String>>>,
}

impl Engine {
    /// Instantiate a new engine with clean initialization, returning the
    /// consensus output stream alongside it.
    pub fn new(
        store: SharedStore,
        identity: &str,
        keyring: Arc<KeyRing>,
    ) -> (Arc<Engine>, mpsc::Receiver<EngineMessage>) {
        let (messages_tx, messages_rx) = mpsc::channel(MESSAGES_CAPACITY);
        let (gc_tx, gc_rx) = mpsc::channel(64);

        let engine = Arc::new(Engine {
            store,
            identity: identity.to_string(),
            keyring,
            messages_tx,
            policies: RwLock::new(HashMap::new()),
            waiting: Mutex::new(HashMap::new()),
            staging: Mutex::new(HashMap::new()),
            applied: Mutex::new(HashMap::new()),
            hash_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(HASH_CACHE_SIZE).expect("non-zero cache size"),
            )),
            gc_tx,
            gc_rx: Mutex::new(Some(gc_rx)),
        });

        (engine, messages_rx)
    }

    /// Register a new policy for the database.
    pub fn add_policy(&self, policy: Policy) -> Result<(), ConsensusError> {
        let compiled = policy.compile()?;
        self.policies
            .write()
            .insert(compiled.policy.uuid.clone(), Arc::new(compiled));
        Ok(())
    }

    /// Look up a registered policy.
    pub fn policy(&self, uuid: &str) -> Result<Arc<CompiledPolicy>, ConsensusError> {
        self.policies
            .read()
            .get(uuid)
            .cloned()
            .ok_or_else(|| ConsensusError::UnknownPolicy(uuid.to_string()))
    }

    /// Start the background tasks of the engine: the garbage-collection
    /// consumer and the periodic applied-memory cleaner.
    pub fn start(self: &Arc<Self>, shutdown: &ShutdownCoordinator) {
        let Some(mut gc_rx) = self.gc_rx.lock().take() else {
            warn!("engine already started");
            return;
        };

        let engine = Arc::clone(self);
        let mut shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    uuid = gc_rx.recv() => match uuid {
                        Some(uuid) => engine.collect(&uuid).await,
                        None => break,
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        let engine = Arc::clone(self);
        let mut shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLEAN_INTERVAL);
            ticker.tick().await; // immediate first tick
            loop {
                tokio::select! {
                    _ = ticker.tick() => engine.clean(),
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    /// Currently stored data for the provided key.
    pub fn get(&self, key: &str) -> Result<(Vec<u8>, Version), ConsensusError> {
        self.store.get(key).map_err(Into::into)
    }

    /// Hash of a spore, cached by uuid for efficient repeated
    /// computation.
    pub fn hash_spore(&self, spore: &Spore) -> Result<Vec<u8>, ConsensusError> {
        let mut cache = self.hash_cache.lock();
        if let Some(hash) = cache.get(&spore.uuid) {
            return Ok(hash.clone());
        }

        let hash = spore.hash()?;
        cache.put(spore.uuid.clone(), hash.clone());
        Ok(hash)
    }

    /// Verify the emitter's signature over the given spore. Self-emitted
    /// spores verify under the ring's own key.
    pub fn verify_spore_signature(&self, spore: &Spore) -> Result<(), ConsensusError> {
        let hash = spore.signable_hash()?;
        let emitter = if spore.emitter == self.identity {
            ""
        } else {
            spore.emitter.as_str()
        };

        self.keyring
            .verify(emitter, &hash, &spore.signature)
            .map_err(Into::into)
    }

    /// Sign the spore as the local node, broadcast it to the mycelium,
    /// then try to endorse it with the current state.
    pub async fn submit(&self, mut spore: Spore) -> Result<(), ConsensusError> {
        spore.emitter = self.identity.clone();
        spore.signature = Vec::new(); // cleared before hashing
        spore.signature = self.keyring.sign(&spore.signable_hash()?)?;

        let _ = self
            .messages_tx
            .send(EngineMessage::Spore(spore.clone()))
            .await;
        self.endorse(spore).await
    }

    /// Ask the overlay to resynchronize one key from the peers.
    pub async fn request_recovery(&self, key: &str) {
        let _ = self
            .messages_tx
            .send(EngineMessage::Recover(RecoverRequest {
                key: key.to_string(),
            }))
            .await;
    }

    /// Check whether a spore can be endorsed given the current database
    /// status.
    pub fn can_endorse(&self, spore: &Spore) -> Result<(), ConsensusError> {
        let policy = self.policy(&spore.policy)?;

        // Timeout: check the deadline.
        if spore.deadline_passed() {
            return Err(ConsensusError::DeadlineExpired);
        }

        // Consistency: requirements must match the state and operations
        // must simulate cleanly under the policy. The store lock is held
        // across the whole walk.
        {
            let store = self.store.lock();

            for (key, required) in &spore.requirements {
                let current = match store.get(key) {
                    Ok((_, version)) => version,
                    Err(StoreError::NotFound) => Version::NONE,
                    Err(err) => return Err(err.into()),
                };
                if current.matches(required).is_err() {
                    return Err(ConsensusError::BehindRequirement(key.clone()));
                }
            }

            let (values, old_sizes) = simulate(&**store, &spore.operations, Some(&policy))?;
            check_policy_usage(&**store, &policy, &old_sizes, &values)?;
        }

        // Promise: check for conflicts with the staging list.
        let staging = self.staging.lock();
        for trigger in staging.values() {
            if spore.conflicts_with(&trigger.spore) {
                return Err(ConsensusError::ConflictingWithStaging);
            }
        }

        Ok(())
    }

    /// Try to endorse a spore: either execute the endorsement, park the
    /// spore in `waiting`, or return the validation failure.
    pub async fn endorse(&self, spore: Spore) -> Result<(), ConsensusError> {
        self.verify_spore_signature(&spore)?;

        match self.can_endorse(&spore) {
            Ok(()) => self.execute_endorsement(spore).await,
            Err(ConsensusError::ConflictingWithStaging) => {
                debug!(uuid = %spore.uuid, "spore parked in waiting list");
                self.waiting.lock().insert(
                    spore.uuid.clone(),
                    Trigger {
                        spore,
                        endorsements: Vec::new(),
                        timer: None,
                    },
                );
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn execute_endorsement(&self, spore: Spore) -> Result<(), ConsensusError> {
        let policy = self.policy(&spore.policy)?;

        if policy.policy.quorum == 0 {
            if let Err(err) = self.apply(&spore) {
                warn!(uuid = %spore.uuid, error = %err, "application failure");
            }
            return Ok(());
        }

        let mut endorsements = Vec::new();
        if let Ok((public, _)) = self.keyring.get_public("") {
            if policy.policy.endorser_for(&public).is_some() {
                let hash = self.hash_spore(&spore)?;
                let endorsement = Endorsement {
                    uuid: spore.uuid.clone(),
                    emitter: self.identity.clone(),
                    signature: self.keyring.sign(&hash)?,
                };

                // Broadcast our endorsement for this spore.
                let _ = self
                    .messages_tx
                    .send(EngineMessage::Endorsement(endorsement.clone()))
                    .await;

                // A one-endorsement policy bypasses the staging list.
                if policy.policy.quorum == 1 {
                    if let Err(err) = self.apply(&spore) {
                        warn!(uuid = %spore.uuid, error = %err, "application failure");
                    }
                    return Ok(());
                }

                endorsements.push(endorsement);
            }
        }

        let timer = {
            let gc_tx = self.gc_tx.clone();
            let uuid = spore.uuid.clone();
            let delay = spore.time_until_deadline();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = gc_tx.send(uuid).await;
            })
        };

        self.staging.lock().insert(
            spore.uuid.clone(),
            Trigger {
                spore,
                endorsements,
                timer: Some(timer),
            },
        );
        Ok(())
    }

    /// Register an incoming endorsement against the pending spore it
    /// refers to. Returns `NoRelatedSpore` when the spore is not yet
    /// known locally; the overlay is responsible for re-delivering.
    pub fn add_endorsement(self: &Arc<Self>, endorsement: &Endorsement) -> Result<(), ConsensusError> {
        if let Some((count, quorum)) = self.append_endorsement(&self.staging, endorsement)? {
            if quorum <= count as u64 {
                self.promote_and_apply(&endorsement.uuid);
            }
            return Ok(());
        }

        match self.append_endorsement(&self.waiting, endorsement)? {
            Some(_) => Ok(()),
            None => Err(ConsensusError::NoRelatedSpore),
        }
    }

    /// Validate and append an endorsement to the trigger of one map.
    /// Returns `None` when the spore is not pending in that map.
    fn append_endorsement(
        &self,
        map: &Mutex<HashMap<String, Trigger>>,
        endorsement: &Endorsement,
    ) -> Result<Option<(usize, u64)>, ConsensusError> {
        let mut guard = map.lock();
        let Some(trigger) = guard.get_mut(&endorsement.uuid) else {
            return Ok(None);
        };

        // Already registered endorsement?
        if trigger
            .endorsements
            .iter()
            .any(|existing| existing.emitter == endorsement.emitter)
        {
            return Err(ConsensusError::DuplicatedEndorsement);
        }

        // Known and allowed endorser?
        let emitter = if endorsement.emitter == self.identity {
            "" // local endorsement case
        } else {
            endorsement.emitter.as_str()
        };
        let (public, _) = self.keyring.get_public(emitter)?;

        let policy = self.policy(&trigger.spore.policy)?;
        if policy.policy.endorser_for(&public).is_none() {
            return Err(ConsensusError::UnallowedEndorser);
        }

        // Well-formed signature?
        let hash = self.hash_spore(&trigger.spore)?;
        self.keyring.verify(emitter, &hash, &endorsement.signature)?;

        trigger.endorsements.push(endorsement.clone());
        Ok(Some((trigger.endorsements.len(), policy.policy.quorum)))
    }

    /// Remove a quorate spore from staging and apply it asynchronously.
    fn promote_and_apply(self: &Arc<Self>, uuid: &str) {
        let Some(mut trigger) = self.staging.lock().remove(uuid) else {
            return;
        };
        if let Some(timer) = trigger.timer.take() {
            timer.abort();
        }

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = engine.apply(&trigger.spore) {
                warn!(uuid = %trigger.spore.uuid, error = %err, "application failure");
            }
        });
    }

    /// Directly apply the spore's operations to the store, atomically.
    pub fn apply(&self, spore: &Spore) -> Result<(), ConsensusError> {
        let policy = self.policy(&spore.policy)?;

        let mut store = self.store.lock();
        let mut applied = self.applied.lock();

        let memo = spore.grace_instant(policy.policy.grace_period);
        if let Some(death) = &memo {
            if death.is_past() {
                warn!(uuid = %spore.uuid, "grace period expired");
                return Err(ConsensusError::GracePeriodExpired);
            }
        }

        if applied.contains_key(&spore.uuid) {
            warn!(uuid = %spore.uuid, "double application attempt");
            return Err(ConsensusError::DuplicatedApplication);
        }

        let (mut values, old_sizes) = simulate(&**store, &spore.operations, None)?;

        // Maintain the per-policy usage counter within the same batch.
        let (usage_raw, _) = get_or_empty(&**store, &policy.policy.usage_key())?;
        let usage = Float::from_bytes(&usage_raw)
            .ok()
            .and_then(|f| f.to_u64())
            .unwrap_or(0);
        let old_total: u64 = old_sizes.values().sum();
        let new_total: u64 = values.values().map(|v| v.raw.len() as u64).sum();
        let updated = usage.saturating_sub(old_total) + new_total;
        values.insert(
            policy.policy.usage_key(),
            Value::new(Float::from_u64(updated).to_bytes()),
        );

        // Batch keys in deterministic (sorted) order.
        let mut keys = Vec::with_capacity(values.len());
        let mut raw_values = Vec::with_capacity(values.len());
        let mut versions = Vec::with_capacity(values.len());
        for (key, value) in &values {
            keys.push(key.clone());
            versions.push(Version::of(&value.raw));
            raw_values.push(value.raw.clone());
        }

        info!(uuid = %spore.uuid, keys = keys.len(), "apply");
        store.set_batch(&keys, &raw_values, &versions)?;

        applied.insert(spore.uuid.clone(), memo);
        Ok(())
    }

    /// Handle the expiry of a staging spore, then re-scan the waiting
    /// list for promotions.
    async fn collect(&self, uuid: &str) {
        if self.staging.lock().remove(uuid).is_some() {
            debug!(uuid, "staging spore expired");
        }

        let candidates: Vec<Spore> = self
            .waiting
            .lock()
            .values()
            .map(|trigger| trigger.spore.clone())
            .collect();

        for spore in candidates {
            match self.can_endorse(&spore) {
                Ok(()) => {
                    if self.waiting.lock().remove(&spore.uuid).is_some() {
                        debug!(uuid = %spore.uuid, "waiting spore promoted");
                        if let Err(err) = self.execute_endorsement(spore).await {
                            warn!(error = %err, "promotion failure");
                        }
                    }
                }
                Err(ConsensusError::DeadlineExpired) => {
                    self.waiting.lock().remove(&spore.uuid);
                }
                Err(_) => {} // still conflicting, keep waiting
            }
        }
    }

    /// Periodically called to free memory related to old transactions.
    pub fn clean(&self) {
        self.applied.lock().retain(|_, death| match death {
            Some(death) => !death.is_past(),
            None => true, // "never" sentinel
        });
    }

    /// Serve the full catalog of the store, for full-state transfers.
    pub fn catalog(&self) -> Result<Catalog, ConsensusError> {
        Ok(Catalog {
            keys: self.store.list()?,
        })
    }

    // Introspection used by tests and operators.

    pub fn is_staging(&self, uuid: &str) -> bool {
        self.staging.lock().contains_key(uuid)
    }

    pub fn is_waiting(&self, uuid: &str) -> bool {
        self.waiting.lock().contains_key(uuid)
    }

    pub fn is_applied(&self, uuid: &str) -> bool {
        self.applied.lock().contains_key(uuid)
    }

    pub fn applied_len(&self) -> usize {
        self.applied.lock().len()
    }

    #[cfg(test)]
    pub(crate) fn force_applied(&self, uuid: &str, death: Option<Timestamp>) {
        self.applied.lock().insert(uuid.to_string(), death);
    }
}

/// Load-once per-key accumulator running the operations in list order.
/// When a policy is provided, each operation is also checked against it
/// right after its simulation.
fn simulate(
    store: &dyn Store,
    operations: &[super::operation::Operation],
    policy: Option<&CompiledPolicy>,
) -> Result<(BTreeMap<String, Value>, BTreeMap<String, u64>), ConsensusError> {
    let mut values: BTreeMap<String, Value> = BTreeMap::new();
    let mut old_sizes: BTreeMap<String, u64> = BTreeMap::new();

    for operation in operations {
        if !values.contains_key(&operation.key) {
            let (data, _) = get_or_empty(store, &operation.key)?;
            old_sizes.insert(operation.key.clone(), data.len() as u64);
            values.insert(operation.key.clone(), Value::new(data));
        }

        let value = values
            .get_mut(&operation.key)
            .expect("accumulator entry loaded above");
        operation.exec(value)?;

        if let Some(policy) = policy {
            policy.check_operation(operation, value.raw.len() as u64)?;
        }
    }

    Ok((values, old_sizes))
}

/// Check the policy-wide size quota against the stored usage counter.
fn check_policy_usage(
    store: &dyn Store,
    policy: &CompiledPolicy,
    old_sizes: &BTreeMap<String, u64>,
    values: &BTreeMap<String, Value>,
) -> Result<(), ConsensusError> {
    if policy.policy.max_size == 0 {
        return Ok(());
    }

    let (usage_raw, _) = get_or_empty(store, &policy.policy.usage_key())?;
    let usage = Float::from_bytes(&usage_raw)
        .ok()
        .and_then(|f| f.to_u64())
        .unwrap_or(0);

    let old_total: u64 = old_sizes.values().sum();
    let new_total: u64 = values.values().map(|v| v.raw.len() as u64).sum();

    if usage.saturating_sub(old_total) + new_total > policy.policy.max_size {
        return Err(ConsensusError::PolicyQuotaExceeded);
    }

    Ok(())
}
