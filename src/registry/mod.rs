use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::MutexGuard;
use tracing::{info, warn};

use crate::namespace::NamespaceTree;
use crate::net::protocol::{ControlReply, ControlRequest, StorageAddress};
use crate::net::ControlChannel;
use crate::{Result, ShardError};

/// Number of address buckets in the registry.
pub const REGISTRY_BUCKETS: usize = 10;

/// Bucket for a storage node's identity `(ip, control_port)`.
pub fn address_bucket(ip: &IpAddr, control_port: u16) -> usize {
    let hash = ip
        .to_string()
        .bytes()
        .fold(0u32, |h, b| h.wrapping_mul(31).wrapping_add(b as u32));
    let hash = hash.wrapping_mul(31).wrapping_add(control_port as u32);
    hash as usize % REGISTRY_BUCKETS
}

/// Everything about a storage node that is guarded by its record mutex.
#[derive(Debug)]
pub struct RecordState {
    address: StorageAddress,
    active: bool,
    pub mirror: NamespaceTree,
    channel: ControlChannel,
}

impl RecordState {
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Mark the node as gone and hang up on it. The record stays in the
    /// registry; the node sees its control connection close.
    pub fn tombstone(&mut self) {
        if self.active {
            self.active = false;
            warn!(storage = %self.address, "Storage server marked inactive");
        }
        self.channel.close();
    }

    fn ensure_active(&self) -> Result<()> {
        if self.active {
            Ok(())
        } else {
            Err(ShardError::ServerInactive(self.address.to_string()))
        }
    }

    fn channel_failed(&mut self, err: ShardError) -> ShardError {
        warn!(storage = %self.address, error = %err, "Control channel failed");
        self.tombstone();
        match err {
            ShardError::ProtocolDesync(_) => err,
            other => ShardError::ProtocolDesync(other.to_string()),
        }
    }

    /// A reply that does not fit the exchange in progress. The channel can no
    /// longer be trusted.
    pub fn unexpected(&mut self, reply: ControlReply) -> ShardError {
        let err = ShardError::ProtocolDesync(format!("unexpected reply {:?}", reply));
        self.channel_failed(err)
    }

    /// One request, one reply. A transport failure leaves the node's state
    /// unknown, so the record is tombstoned and the error reported as a
    /// desync.
    pub async fn call(&mut self, request: &ControlRequest) -> Result<ControlReply> {
        self.ensure_active()?;
        match self.channel.round_trip(request).await {
            Ok(reply) => Ok(reply),
            Err(e) => Err(self.channel_failed(e)),
        }
    }

    pub async fn send(&mut self, request: &ControlRequest) -> Result<()> {
        self.ensure_active()?;
        match self.channel.send(request).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.channel_failed(e)),
        }
    }

    pub async fn recv(&mut self) -> Result<ControlReply> {
        self.ensure_active()?;
        match self.channel.recv().await {
            Ok(reply) => Ok(reply),
            Err(e) => Err(self.channel_failed(e)),
        }
    }
}

/// One registered storage node. Never removed once added.
#[derive(Debug)]
pub struct StorageServerRecord {
    pub name: String,
    pub address: StorageAddress,
    /// Registration order; lower wins when several nodes claim a path.
    pub sequence: u64,
    state: tokio::sync::Mutex<RecordState>,
}

impl StorageServerRecord {
    /// Lock the record for a mirror read or a full control round trip.
    pub async fn lock(&self) -> MutexGuard<'_, RecordState> {
        self.state.lock().await
    }

    /// `None` while another caller holds the record.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, RecordState>> {
        self.state.try_lock().ok()
    }

    pub async fn is_active(&self) -> bool {
        self.state.lock().await.active
    }
}

/// All storage nodes known to the naming server.
pub struct ServerRegistry {
    buckets: [Mutex<Vec<Arc<StorageServerRecord>>>; REGISTRY_BUCKETS],
    count: AtomicUsize,
    next_sequence: AtomicU64,
}

impl Default for ServerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| Mutex::new(Vec::new())),
            count: AtomicUsize::new(0),
            next_sequence: AtomicU64::new(0),
        }
    }

    /// Build a record for a newly registered node. It is not reachable until
    /// passed to [`ServerRegistry::add`].
    pub fn new_record(
        &self,
        name: String,
        address: StorageAddress,
        mirror: NamespaceTree,
        channel: ControlChannel,
    ) -> Arc<StorageServerRecord> {
        Arc::new(StorageServerRecord {
            name,
            address,
            sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed),
            state: tokio::sync::Mutex::new(RecordState {
                address,
                active: true,
                mirror,
                channel,
            }),
        })
    }

    /// Prepend a record to its address bucket.
    pub fn add(&self, record: Arc<StorageServerRecord>) {
        let bucket = address_bucket(&record.address.ip, record.address.control_port);
        info!(
            storage = %record.address,
            name = %record.name,
            sequence = record.sequence,
            bucket,
            "Storage server registered"
        );
        self.buckets[bucket].lock().insert(0, record);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of records ever added, tombstones included.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Most recently added record for an address, active or not.
    pub fn find_by_address(&self, ip: IpAddr, control_port: u16) -> Option<Arc<StorageServerRecord>> {
        self.buckets[address_bucket(&ip, control_port)]
            .lock()
            .iter()
            .find(|r| r.address.ip == ip && r.address.control_port == control_port)
            .cloned()
    }

    /// Every record in bucket-scan order. Each bucket lock is held only while
    /// its chain is cloned.
    pub fn snapshot(&self) -> Vec<Arc<StorageServerRecord>> {
        let mut out = Vec::with_capacity(self.len());
        for bucket in &self.buckets {
            out.extend(bucket.lock().iter().cloned());
        }
        out
    }

    /// Active records whose mirror resolves `path`, lowest sequence first.
    ///
    /// Takes each record's lock in turn, so the caller must not already hold
    /// one.
    pub async fn find_owners_of_path(&self, path: &str) -> Vec<Arc<StorageServerRecord>> {
        let mut owners = Vec::new();
        for record in self.snapshot() {
            let state = record.lock().await;
            if state.active && state.mirror.contains_path(path) {
                drop(state);
                owners.push(record);
            }
        }
        owners.sort_by_key(|r| r.sequence);
        owners
    }

    pub async fn find_owner_of_path(&self, path: &str) -> Option<Arc<StorageServerRecord>> {
        self.find_owners_of_path(path).await.into_iter().next()
    }

    /// The n-th (1-based) active record in bucket-scan order.
    pub async fn select_by_ordinal(&self, n: usize) -> Result<Arc<StorageServerRecord>> {
        if n == 0 {
            return Err(ShardError::NoSuchServer(n));
        }
        let mut seen = 0;
        for record in self.snapshot() {
            if record.is_active().await {
                seen += 1;
                if seen == n {
                    return Ok(record);
                }
            }
        }
        Err(ShardError::NoSuchServer(n))
    }

    pub async fn active_records(&self) -> Vec<Arc<StorageServerRecord>> {
        let mut out = Vec::new();
        for record in self.snapshot() {
            if record.is_active().await {
                out.push(record);
            }
        }
        out
    }
}
