//! In-process rendezvous and communicator.
//!
//! Groups are keyed by `(host, port)` exactly like a TCP store would be,
//! but every participant lives in the same process. The local engine,
//! the server binary, and the tests all form their groups through here.

use crate::comm::communicator::{Communicator, Rendezvous};
use crate::core::{Error, Rank, RendezvousSpec, Result};
use crate::tensor::{TensorBuffer, TensorSpec};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;

type GroupKey = (String, u16);
type Registry = Arc<Mutex<HashMap<GroupKey, Arc<LocalGroup>>>>;

/// Default time allowed for joins, broadcasts and barriers.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// A payload posted by a broadcast source.
struct Published {
    payload: Arc<Vec<u8>>,
    spec: TensorSpec,
    src: Rank,
    /// Receivers that have not copied the payload yet
    remaining: u32,
}

/// Barrier progress. `generation` advances each time every rank arrives.
#[derive(Default)]
struct BarrierState {
    arrived: u32,
    generation: u64,
}

/// Shared state of one communication group.
struct LocalGroup {
    world_size: u32,
    members: Mutex<HashSet<Rank>>,
    arrivals: watch::Sender<u32>,
    published: watch::Sender<HashMap<u64, Published>>,
    barrier: watch::Sender<BarrierState>,
    /// Set by the first failed collective; the group is unusable afterwards
    fault: Mutex<Option<String>>,
    /// Communicators still holding the group
    live: AtomicU32,
}

impl LocalGroup {
    fn new(world_size: u32) -> Self {
        let (arrivals, _) = watch::channel(0);
        let (published, _) = watch::channel(HashMap::new());
        let (barrier, _) = watch::channel(BarrierState::default());
        Self {
            world_size,
            members: Mutex::new(HashSet::new()),
            arrivals,
            published,
            barrier,
            fault: Mutex::new(None),
            live: AtomicU32::new(0),
        }
    }

    fn is_formed(&self) -> bool {
        *self.arrivals.borrow() >= self.world_size
    }

    fn is_faulted(&self) -> bool {
        self.fault.lock().is_some()
    }

    /// Error for a waiter woken without its value.
    fn failure(&self) -> Error {
        match self.fault.lock().as_deref() {
            Some(reason) => Error::Collective(format!(
                "communication group unusable after an earlier failure ({reason}); re-initialize it"
            )),
            None => Error::Collective("communication group dissolved".into()),
        }
    }

    /// Fail fast once an earlier collective has failed.
    fn check(&self) -> Result<()> {
        if self.is_faulted() {
            return Err(self.failure());
        }
        Ok(())
    }

    /// Mark the group failed, discard pending payloads and wake every waiter.
    ///
    /// Broadcast sequence numbers and barrier arrivals can no longer be
    /// trusted to line up across ranks after a failure.
    fn poison(&self, reason: &Error) {
        {
            let mut fault = self.fault.lock();
            if fault.is_some() {
                return;
            }
            *fault = Some(reason.to_string());
        }
        tracing::warn!(error = %reason, "local communication group poisoned");
        self.published.send_modify(|m| m.clear());
        self.barrier.send_modify(|_| {});
    }
}

/// One rank waiting at the barrier. Dropping it before the barrier
/// completes takes the arrival back, so a cancelled or timed-out wait
/// does not count towards a later barrier.
struct Arrival<'a> {
    group: &'a LocalGroup,
    generation: u64,
    completed: bool,
}

impl Drop for Arrival<'_> {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        let generation = self.generation;
        self.group.barrier.send_if_modified(|s| {
            if s.generation == generation && s.arrived > 0 {
                s.arrived -= 1;
            }
            false
        });
    }
}

/// Drop one reference to `group`, removing it from the registry when it was
/// the last one.
fn release(registry: &Registry, key: &GroupKey, group: &Arc<LocalGroup>) {
    if group.live.fetch_sub(1, Ordering::SeqCst) == 1 {
        let mut groups = registry.lock();
        if groups.get(key).is_some_and(|g| Arc::ptr_eq(g, group)) {
            groups.remove(key);
        }
    }
}

/// In-process rendezvous service.
#[derive(Clone)]
pub struct LocalRendezvous {
    groups: Registry,
    timeout: Duration,
}

impl LocalRendezvous {
    /// Create a rendezvous with the default timeout.
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    /// Create a rendezvous whose joins and collectives give up after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            groups: Arc::new(Mutex::new(HashMap::new())),
            timeout,
        }
    }

    /// Number of groups currently registered.
    pub fn group_count(&self) -> usize {
        self.groups.lock().len()
    }

    fn register(&self, spec: &RendezvousSpec, rank: Rank) -> Result<Arc<LocalGroup>> {
        let mut groups = self.groups.lock();
        let group = groups
            .entry(spec.key())
            .or_insert_with(|| Arc::new(LocalGroup::new(spec.world_size)))
            .clone();

        if group.world_size != spec.world_size {
            return Err(Error::RendezvousFailure(format!(
                "group at {}:{} has world_size {}, requested {}",
                spec.host, spec.port, group.world_size, spec.world_size
            )));
        }
        if group.is_formed() {
            return Err(Error::RendezvousFailure(format!(
                "group at {}:{} is already formed",
                spec.host, spec.port
            )));
        }
        if !group.members.lock().insert(rank) {
            return Err(Error::RendezvousFailure(format!(
                "rank {} already joined {}:{}",
                rank, spec.host, spec.port
            )));
        }

        group.live.fetch_add(1, Ordering::SeqCst);
        group.arrivals.send_modify(|n| *n += 1);
        Ok(group)
    }
}

impl Default for LocalRendezvous {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Rendezvous for LocalRendezvous {
    async fn join(&self, spec: &RendezvousSpec, rank: Rank) -> Result<Box<dyn Communicator>> {
        if rank >= spec.world_size {
            return Err(Error::RendezvousFailure(format!(
                "rank {} outside world_size {}",
                rank, spec.world_size
            )));
        }

        let key = spec.key();
        let group = self.register(spec, rank)?;

        let world_size = spec.world_size;
        let mut arrivals = group.arrivals.subscribe();
        let formed = timeout(self.timeout, arrivals.wait_for(|n| *n >= world_size))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false);

        if !formed {
            group.members.lock().remove(&rank);
            group.arrivals.send_modify(|n| *n = n.saturating_sub(1));
            release(&self.groups, &key, &group);
            return Err(Error::RendezvousFailure(format!(
                "timed out after {:?} waiting for {} participants at {}",
                self.timeout, world_size, spec
            )));
        }

        tracing::debug!(rank, %spec, "joined local communication group");

        Ok(Box::new(LocalCommunicator {
            group,
            rank,
            seq: AtomicU64::new(0),
            registry: self.groups.clone(),
            key,
            timeout: self.timeout,
        }))
    }
}

/// Communicator over a [`LocalGroup`].
pub struct LocalCommunicator {
    group: Arc<LocalGroup>,
    rank: Rank,
    /// Index of the next broadcast issued by this rank
    seq: AtomicU64,
    registry: Registry,
    key: GroupKey,
    timeout: Duration,
}

#[async_trait]
impl Communicator for LocalCommunicator {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> u32 {
        self.group.world_size
    }

    async fn broadcast(&self, buffer: &mut TensorBuffer, src: Rank) -> Result<()> {
        if src >= self.group.world_size {
            return Err(Error::Collective(format!(
                "broadcast source {} outside world_size {}",
                src, self.group.world_size
            )));
        }
        self.group.check()?;
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);

        if self.rank == src {
            let receivers = self.group.world_size - 1;
            if receivers > 0 {
                let mut published = Some(Published {
                    payload: Arc::new(buffer.as_bytes().to_vec()),
                    spec: buffer.spec().clone(),
                    src,
                    remaining: receivers,
                });
                let group = &self.group;
                self.group.published.send_if_modified(|m| {
                    if group.is_faulted() {
                        return false;
                    }
                    published.take().map(|p| m.insert(seq, p)).is_some()
                });
                if published.is_some() {
                    return self.group.check();
                }
            }
            return Ok(());
        }

        let group = &self.group;
        let mut rx = self.group.published.subscribe();
        let fetched = timeout(self.timeout, async {
            rx.wait_for(|m| m.contains_key(&seq) || group.is_faulted())
                .await
                .map(|m| m.get(&seq).map(|p| (p.payload.clone(), p.spec.clone(), p.src)))
        })
        .await;

        let (payload, spec, sent_from) = match fetched {
            Ok(Ok(Some(entry))) => entry,
            Ok(Ok(None)) | Ok(Err(_)) => return Err(self.group.failure()),
            Err(_) => {
                let err = Error::Collective(format!(
                    "timed out after {:?} waiting for broadcast #{} from rank {}",
                    self.timeout, seq, src
                ));
                self.group.poison(&err);
                return Err(err);
            }
        };

        self.group.published.send_modify(|m| {
            if let Some(p) = m.get_mut(&seq) {
                p.remaining -= 1;
                if p.remaining == 0 {
                    m.remove(&seq);
                }
            }
        });

        let mismatch = if sent_from != src {
            Some(format!(
                "broadcast #{} expected from rank {}, was sent by rank {}",
                seq, src, sent_from
            ))
        } else if payload.len() != buffer.as_bytes().len() {
            Some(format!(
                "received {} ({} bytes) into a buffer for {}",
                spec,
                payload.len(),
                buffer.spec()
            ))
        } else {
            None
        };
        if let Some(message) = mismatch {
            let err = Error::Collective(message);
            self.group.poison(&err);
            return Err(err);
        }

        buffer.as_bytes_mut().copy_from_slice(&payload);
        Ok(())
    }

    async fn barrier(&self) -> Result<()> {
        self.group.check()?;
        let world_size = self.group.world_size;

        let mut rx = self.group.barrier.subscribe();
        let mut entered = 0;
        let mut released = false;
        self.group.barrier.send_if_modified(|s| {
            entered = s.generation;
            s.arrived += 1;
            if s.arrived >= world_size {
                s.arrived = 0;
                s.generation += 1;
                released = true;
            }
            released
        });
        if released {
            return Ok(());
        }

        let mut arrival = Arrival {
            group: &self.group,
            generation: entered,
            completed: false,
        };
        let group = &self.group;
        let waited = timeout(
            self.timeout,
            rx.wait_for(|s| s.generation > entered || group.is_faulted()),
        )
        .await
        .map(|r| r.map(|s| s.generation > entered));

        match waited {
            Ok(Ok(true)) => {
                arrival.completed = true;
                Ok(())
            }
            Ok(Ok(false)) | Ok(Err(_)) => Err(self.group.failure()),
            Err(_) => {
                drop(arrival);
                let err = Error::Collective(format!("barrier timed out after {:?}", self.timeout));
                self.group.poison(&err);
                Err(err)
            }
        }
    }
}

impl Drop for LocalCommunicator {
    fn drop(&mut self) {
        release(&self.registry, &self.key, &self.group);
    }
}
