//! Sandbox network addressing.
//!
//! One strategy is chosen per deployment so the proxy and the provisioning
//! path always agree on where a sandbox lives.

use std::net::Ipv4Addr;
use std::sync::{mpsc, Arc};
use std::thread;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::identity::{CanonicalId, UnitNamer};
use super::store::{address_key, last_access_key, request_count_key, sandbox_keys, KvStore};
use crate::runtime::Runtime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressingStrategy {
    /// Hash the canonical id onto the private subnet. No I/O.
    #[default]
    Deterministic,
    /// Ask the runtime, caching the answer in the shared store.
    Queried,
}

/// Private IPv4 subnet that deterministic addresses are drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    base: u32,
    prefix_len: u8,
}

impl Subnet {
    /// `prefix_len` must leave room for at least two usable hosts.
    pub fn new(base: Ipv4Addr, prefix_len: u8) -> Option<Self> {
        if !(8..=30).contains(&prefix_len) {
            return None;
        }
        let mask = u32::MAX << (32 - prefix_len);
        Some(Self {
            base: u32::from(base) & mask,
            prefix_len,
        })
    }

    fn size(&self) -> u32 {
        1u32 << (32 - self.prefix_len)
    }

    /// Map a digest onto the subnet, skipping the network address, the
    /// gateway (`.1`) and broadcast.
    fn host_from_digest(&self, digest: &[u8]) -> Ipv4Addr {
        let seed = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        let usable = self.size() - 3;
        Ipv4Addr::from(self.base + 2 + seed % usable)
    }
}

impl Default for Subnet {
    fn default() -> Self {
        Self {
            base: u32::from(Ipv4Addr::new(10, 200, 0, 0)),
            prefix_len: 16,
        }
    }
}

/// Pure deterministic address for a canonical id.
pub fn deterministic_address(id: &CanonicalId, subnet: &Subnet) -> Ipv4Addr {
    let digest = Sha256::digest(id.as_str().as_bytes());
    subnet.host_from_digest(&digest)
}

enum AccessJob {
    Touch(String),
    Evict(String, mpsc::Sender<Result<bool, String>>),
    Flush(mpsc::Sender<()>),
}

/// Records access metrics off the request path; failures are only logged.
///
/// Writes and evictions go through one worker in submission order, so an
/// eviction always lands after every access recorded before it.
#[derive(Clone)]
pub struct AccessRecorder {
    store: Arc<dyn KvStore>,
    jobs: mpsc::Sender<AccessJob>,
}

impl AccessRecorder {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        let (jobs, queue) = mpsc::channel::<AccessJob>();
        let worker_store = Arc::clone(&store);
        let spawned = thread::Builder::new()
            .name("access-recorder".to_string())
            .spawn(move || {
                for job in queue {
                    match job {
                        AccessJob::Touch(id) => write_access(worker_store.as_ref(), &id),
                        AccessJob::Evict(id, reply) => {
                            let _ = reply.send(evict_keys(worker_store.as_ref(), &id));
                        }
                        AccessJob::Flush(reply) => {
                            let _ = reply.send(());
                        }
                    }
                }
            });
        if let Err(e) = spawned {
            warn!("Access recorder worker unavailable, writing inline: {}", e);
        }
        Self { store, jobs }
    }

    /// Queue an access for `id`. Never fails.
    pub fn record(&self, id: &CanonicalId) {
        if let Err(mpsc::SendError(AccessJob::Touch(id))) =
            self.jobs.send(AccessJob::Touch(id.as_str().to_string()))
        {
            write_access(self.store.as_ref(), &id);
        }
    }

    /// Delete every key held for `id` once earlier accesses have landed.
    /// Returns whether any key existed.
    pub fn evict(&self, id: &CanonicalId) -> Result<bool, String> {
        let (reply, answer) = mpsc::channel();
        if self
            .jobs
            .send(AccessJob::Evict(id.as_str().to_string(), reply))
            .is_err()
        {
            return evict_keys(self.store.as_ref(), id.as_str());
        }
        answer
            .recv()
            .unwrap_or_else(|_| evict_keys(self.store.as_ref(), id.as_str()))
    }

    /// Wait until every queued access has been written.
    pub fn flush(&self) {
        let (reply, answer) = mpsc::channel();
        if self.jobs.send(AccessJob::Flush(reply)).is_ok() {
            let _ = answer.recv();
        }
    }
}

fn write_access(store: &dyn KvStore, id: &str) {
    let now = chrono::Utc::now().to_rfc3339();
    if let Err(e) = store.set(&last_access_key(id), &now) {
        warn!("Failed to record last access for {}: {}", id, e);
    }
    if let Err(e) = store.incr(&request_count_key(id)) {
        warn!("Failed to count request for {}: {}", id, e);
    }
}

fn evict_keys(store: &dyn KvStore, id: &str) -> Result<bool, String> {
    let mut removed = false;
    let mut errors = Vec::new();
    for key in sandbox_keys(id) {
        match store.delete(&key) {
            Ok(existed) => removed |= existed,
            Err(e) => errors.push(format!("{}: {}", key, e)),
        }
    }
    if errors.is_empty() {
        Ok(removed)
    } else {
        Err(errors.join("; "))
    }
}

/// Resolves sandbox addresses with the configured strategy.
#[derive(Clone)]
pub struct AddressResolver {
    strategy: AddressingStrategy,
    subnet: Subnet,
    store: Arc<dyn KvStore>,
    runtime: Arc<dyn Runtime>,
    namer: UnitNamer,
    recorder: AccessRecorder,
}

impl AddressResolver {
    pub fn new(
        strategy: AddressingStrategy,
        subnet: Subnet,
        store: Arc<dyn KvStore>,
        runtime: Arc<dyn Runtime>,
        namer: UnitNamer,
    ) -> Self {
        let recorder = AccessRecorder::new(Arc::clone(&store));
        Self {
            strategy,
            subnet,
            store,
            runtime,
            namer,
            recorder,
        }
    }

    pub fn strategy(&self) -> AddressingStrategy {
        self.strategy
    }

    /// Shared with the registry so teardown evictions stay ordered after
    /// recorded accesses.
    pub fn recorder(&self) -> &AccessRecorder {
        &self.recorder
    }

    /// Resolve an address. Deterministic resolution always succeeds; the
    /// queried strategy returns `None` when the runtime has no address yet.
    pub fn resolve(&self, id: &CanonicalId) -> Option<Ipv4Addr> {
        self.recorder.record(id);
        match self.strategy {
            AddressingStrategy::Deterministic => Some(deterministic_address(id, &self.subnet)),
            AddressingStrategy::Queried => self.resolve_queried(id),
        }
    }

    fn resolve_queried(&self, id: &CanonicalId) -> Option<Ipv4Addr> {
        let key = address_key(id.as_str());
        match self.store.get(&key) {
            Ok(Some(cached)) => match cached.parse::<Ipv4Addr>() {
                Ok(addr) => return Some(addr),
                Err(_) => debug!("Ignoring malformed cached address for {}", id),
            },
            Ok(None) => {}
            Err(e) => debug!("Address cache read failed for {}: {}", id, e),
        }

        let unit = self.namer.unit_name(id);
        let addr = match self.runtime.address(&unit) {
            Ok(Some(addr)) => addr,
            Ok(None) => return None,
            Err(e) => {
                warn!("Address lookup for {} failed: {}", unit, e);
                return None;
            }
        };
        if let Err(e) = self.store.set(&key, &addr.to_string()) {
            warn!("Failed to cache address for {}: {}", id, e);
        }
        Some(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::fake::FakeRuntime;
    use crate::sandbox::identity::NamingScheme;
    use crate::sandbox::store::{MemoryStore, StoreError};

    struct FailingStore;

    impl KvStore for FailingStore {
        fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Unavailable("down".to_string()))
        }
        fn set(&self, _key: &str, _value: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".to_string()))
        }
        fn delete(&self, _key: &str) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("down".to_string()))
        }
        fn incr(&self, _key: &str) -> Result<i64, StoreError> {
            Err(StoreError::Unavailable("down".to_string()))
        }
    }

    fn resolver(
        strategy: AddressingStrategy,
        store: Arc<dyn KvStore>,
        runtime: Arc<FakeRuntime>,
    ) -> AddressResolver {
        AddressResolver::new(
            strategy,
            Subnet::default(),
            store,
            runtime,
            UnitNamer::new("pg-", NamingScheme::Canonical),
        )
    }

    #[test]
    fn test_deterministic_is_pure_and_in_subnet() {
        let subnet = Subnet::new(Ipv4Addr::new(10, 200, 0, 0), 16).unwrap();
        for raw in ["a", "user-42", "zzz", "0"] {
            let id = CanonicalId::new(raw);
            let first = deterministic_address(&id, &subnet);
            let second = deterministic_address(&id, &subnet);
            assert_eq!(first, second);
            let octets = first.octets();
            assert_eq!(&octets[..2], &[10, 200]);
            assert_ne!(first, Ipv4Addr::new(10, 200, 0, 0));
            assert_ne!(first, Ipv4Addr::new(10, 200, 0, 1));
            assert_ne!(first, Ipv4Addr::new(10, 200, 255, 255));
        }
    }

    #[test]
    fn test_subnet_rejects_tiny_prefix() {
        assert!(Subnet::new(Ipv4Addr::new(10, 0, 0, 0), 31).is_none());
        assert!(Subnet::new(Ipv4Addr::new(10, 0, 0, 0), 4).is_none());
        assert!(Subnet::new(Ipv4Addr::new(10, 0, 0, 0), 30).is_some());
    }

    #[test]
    fn test_deterministic_survives_broken_store() {
        let r = resolver(
            AddressingStrategy::Deterministic,
            Arc::new(FailingStore),
            Arc::new(FakeRuntime { broken: true, ..FakeRuntime::new() }),
        );
        let id = CanonicalId::new("alice");
        assert_eq!(r.resolve(&id), Some(deterministic_address(&id, &Subnet::default())));
    }

    #[test]
    fn test_queried_caches_runtime_answer() {
        let store = Arc::new(MemoryStore::new());
        let runtime = Arc::new(FakeRuntime::new());
        runtime
            .addresses
            .lock()
            .unwrap()
            .insert("pg-bob".to_string(), Ipv4Addr::new(10, 1, 2, 3));
        let r = resolver(AddressingStrategy::Queried, store.clone(), runtime.clone());
        let id = CanonicalId::new("bob");

        assert_eq!(r.resolve(&id), Some(Ipv4Addr::new(10, 1, 2, 3)));
        assert_eq!(store.get("sandbox:bob").unwrap().as_deref(), Some("10.1.2.3"));

        runtime.addresses.lock().unwrap().clear();
        assert_eq!(r.resolve(&id), Some(Ipv4Addr::new(10, 1, 2, 3)));
    }

    #[test]
    fn test_queried_cache_failure_falls_back_to_live_query() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime
            .addresses
            .lock()
            .unwrap()
            .insert("pg-bob".to_string(), Ipv4Addr::new(10, 9, 9, 9));
        let r = resolver(AddressingStrategy::Queried, Arc::new(FailingStore), runtime);
        assert_eq!(r.resolve(&CanonicalId::new("bob")), Some(Ipv4Addr::new(10, 9, 9, 9)));
    }

    #[test]
    fn test_resolution_records_metrics() {
        let store = Arc::new(MemoryStore::new());
        let r = resolver(
            AddressingStrategy::Deterministic,
            store.clone(),
            Arc::new(FakeRuntime::new()),
        );
        let id = CanonicalId::new("carol");
        r.resolve(&id);
        r.resolve(&id);
        r.recorder().flush();
        assert_eq!(store.get("agent:carol:requests").unwrap().as_deref(), Some("2"));
        assert!(store.get("agent:carol:last").unwrap().is_some());
    }

    #[test]
    fn test_eviction_waits_for_queued_accesses() {
        let store = Arc::new(MemoryStore::new());
        let r = resolver(
            AddressingStrategy::Deterministic,
            store.clone(),
            Arc::new(FakeRuntime::new()),
        );
        let id = CanonicalId::new("dave");
        for _ in 0..20 {
            r.resolve(&id);
        }
        assert_eq!(r.recorder().evict(&id), Ok(true));
        assert_eq!(r.recorder().evict(&id), Ok(false));
        r.recorder().flush();
        assert_eq!(store.get("agent:dave:requests").unwrap(), None);
        assert_eq!(store.get("agent:dave:last").unwrap(), None);
    }

    #[test]
    fn test_eviction_reports_store_failures() {
        let recorder = AccessRecorder::new(Arc::new(FailingStore));
        let err = recorder.evict(&CanonicalId::new("erin")).unwrap_err();
        assert!(err.contains("sandbox:erin"));
    }
}
