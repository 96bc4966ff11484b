//! Distributed storage
//!
//! Implements the graph storage interface by routing every record
//! operation to its primary owner (`hash(loc) mod |members|` over the
//! name-ordered ring). The primary writes locally and forwards copies
//! to the next `replication_factor - 1` live members; acknowledgement
//! requires the primary only. Reads rotate to the next live member
//! when the primary is in the failed set.
//!
//! On each member the actual bytes live in persistent maps inside the
//! member's local graph storage, keyed by the cluster-wide location.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use quiver_graph::storage::GraphStorage;
use quiver_storage::{stable_hash, PersistentMap, StorageManager};

use crate::error::{ClusterError, Result};
use crate::member::{MemberManager, StorageHandler};
use crate::rpc::{call, Request, Response};

/// Reserved record manager holding the replicated main db.
const MAIN_DB_MANAGER: &str = "_main";

/// Reserved record manager holding the set of known storage names.
const NAMES_MANAGER: &str = "_names";

fn record_key(loc: u64) -> String {
    format!("rec:{loc}")
}

fn root_key(id: u8) -> String {
    format!("root:{id}")
}

const COUNTER_KEY: &str = "meta:counter";

/// Member-local record store: per distributed manager name one
/// persistent map inside the member's own graph storage.
pub struct LocalRecordStore {
    gs: Arc<dyn GraphStorage>,
}

impl LocalRecordStore {
    fn map(&self, manager: &str) -> Result<PersistentMap> {
        let sm = self
            .gs
            .storage_manager(manager, true)?
            .ok_or_else(|| ClusterError::Protocol(format!("cannot open storage {manager}")))?;
        Ok(PersistentMap::open(sm, 0)?)
    }

    /// Reserve the next insert counter value for a manager. The
    /// counter is member-local and persisted with the records.
    fn next_counter(&self, manager: &str) -> Result<u64> {
        let mut map = self.map(manager)?;
        let current: u64 = match map.get(COUNTER_KEY)? {
            Some(data) => bincode::deserialize(&data)?,
            None => 1,
        };
        map.put(COUNTER_KEY, bincode::serialize(&(current + 1))?)?;
        Ok(current)
    }
}

impl StorageHandler for LocalRecordStore {
    fn store(&self, manager: &str, loc: u64, data: &[u8]) -> Result<()> {
        let mut map = self.map(manager)?;
        map.put(&record_key(loc), data.to_vec())?;
        Ok(())
    }

    fn fetch(&self, manager: &str, loc: u64) -> Result<Option<Vec<u8>>> {
        Ok(self.map(manager)?.get(&record_key(loc))?)
    }

    fn free(&self, manager: &str, loc: u64) -> Result<()> {
        self.map(manager)?.remove(&record_key(loc))?;
        Ok(())
    }

    fn flush(&self, manager: &str) -> Result<()> {
        if manager.is_empty() {
            self.gs.flush_all()?;
            return Ok(());
        }
        if let Some(sm) = self.gs.storage_manager(manager, false)? {
            sm.flush()?;
        }
        Ok(())
    }

    fn root(&self, manager: &str, id: u8) -> Result<u64> {
        match self.map(manager)?.get(&root_key(id))? {
            Some(data) => Ok(bincode::deserialize(&data)?),
            None => Ok(0),
        }
    }

    fn set_root(&self, manager: &str, id: u8, loc: u64) -> Result<()> {
        self.map(manager)?.put(&root_key(id), bincode::serialize(&loc)?)?;
        Ok(())
    }
}

/// Graph storage whose records are spread over the cluster.
pub struct DistributedStorage {
    name: String,
    member: Arc<MemberManager>,
    local: Arc<LocalRecordStore>,
    managers: RwLock<HashMap<String, Arc<DistributedStorageManager>>>,
}

impl DistributedStorage {
    /// Wrap a member's local graph storage. The member's RPC server
    /// starts serving record verbs from it.
    pub fn new(member: Arc<MemberManager>, gs: Arc<dyn GraphStorage>) -> Arc<Self> {
        let local = Arc::new(LocalRecordStore { gs });
        member.set_storage_handler(Arc::clone(&local) as Arc<dyn StorageHandler>);
        Arc::new(DistributedStorage {
            name: format!("cluster:{}", member.name()),
            member,
            local,
            managers: RwLock::new(HashMap::new()),
        })
    }

    fn router(&self) -> Router {
        Router {
            member: Arc::clone(&self.member),
            local: Arc::clone(&self.local),
        }
    }

    fn known_names(&self) -> Result<BTreeSet<String>> {
        match self.router().fetch(NAMES_MANAGER, 0)? {
            Some(data) => Ok(bincode::deserialize(&data)?),
            None => Ok(BTreeSet::new()),
        }
    }

    fn register_name(&self, name: &str) -> Result<()> {
        let mut names = self.known_names()?;
        if names.insert(name.to_string()) {
            self.router()
                .store(NAMES_MANAGER, 0, &bincode::serialize(&names)?)?;
        }
        Ok(())
    }
}

impl GraphStorage for DistributedStorage {
    fn name(&self) -> &str {
        &self.name
    }

    fn main_db(&self) -> quiver_storage::Result<HashMap<String, String>> {
        match self.router().fetch(MAIN_DB_MANAGER, 0)? {
            Some(data) => Ok(bincode::deserialize(&data)
                .map_err(quiver_storage::StorageError::Serialization)?),
            None => Ok(HashMap::new()),
        }
    }

    fn update_main_db(&self, db: HashMap<String, String>) -> quiver_storage::Result<()> {
        let data =
            bincode::serialize(&db).map_err(quiver_storage::StorageError::Serialization)?;
        self.router().store(MAIN_DB_MANAGER, 0, &data)?;
        Ok(())
    }

    fn storage_manager(
        &self,
        name: &str,
        create: bool,
    ) -> quiver_storage::Result<Option<Arc<dyn StorageManager>>> {
        {
            let managers = self.managers.read().unwrap();
            if let Some(dsm) = managers.get(name) {
                return Ok(Some(Arc::clone(dsm) as Arc<dyn StorageManager>));
            }
        }

        if !create && !self.known_names()?.contains(name) {
            return Ok(None);
        }
        if create {
            self.register_name(name)?;
        }

        let dsm = Arc::new(DistributedStorageManager {
            name: name.to_string(),
            member: Arc::clone(&self.member),
            local: Arc::clone(&self.local),
            cache: Mutex::new(HashMap::new()),
        });
        let mut managers = self.managers.write().unwrap();
        let dsm = managers.entry(name.to_string()).or_insert(dsm);
        Ok(Some(Arc::clone(dsm) as Arc<dyn StorageManager>))
    }

    fn storage_names(&self) -> quiver_storage::Result<Vec<String>> {
        Ok(self.known_names()?.into_iter().collect())
    }

    fn flush_all(&self) -> quiver_storage::Result<()> {
        self.local.flush("")?;
        // Best effort: ask the other live members to flush too.
        let failed: BTreeSet<String> = self.member.failed().into_iter().collect();
        for (name, addr) in self.member.members() {
            if name == self.member.name() || failed.contains(&name) {
                continue;
            }
            let _ = call(
                &addr,
                &self.member.config().secret,
                self.member.config().rpc_timeout(),
                &Request::FlushStorage {
                    manager: String::new(),
                },
            );
        }
        Ok(())
    }

    fn rollback_all(&self) -> quiver_storage::Result<()> {
        // Remote writes are not recalled; only the local state reverts.
        for dsm in self.managers.read().unwrap().values() {
            dsm.cache.lock().unwrap().clear();
        }
        Ok(())
    }

    fn close(&self) -> quiver_storage::Result<()> {
        self.flush_all()?;
        self.member.shutdown();
        Ok(())
    }
}

/// Routes record operations to their primary owner.
struct Router {
    member: Arc<MemberManager>,
    local: Arc<LocalRecordStore>,
}

impl Router {
    /// The ring with the failed members marked, and the primary index
    /// for a location.
    fn ring_and_owner(&self, manager: &str, loc: u64) -> (Vec<(String, String)>, BTreeSet<String>, usize) {
        let ring = self.member.ring();
        let failed: BTreeSet<String> = self.member.failed().into_iter().collect();
        let mut hash_input = Vec::with_capacity(manager.len() + 8);
        hash_input.extend_from_slice(manager.as_bytes());
        hash_input.extend_from_slice(&loc.to_le_bytes());
        let owner = (stable_hash(&hash_input) % ring.len() as u64) as usize;
        (ring, failed, owner)
    }

    /// Run a request against the owner of `loc`, rotating past failed
    /// members for reads and retrying once on a transient error.
    fn route(
        &self,
        manager: &str,
        loc: u64,
        request: &Request,
        rotate: bool,
    ) -> Result<Response> {
        let (ring, failed, owner) = self.ring_and_owner(manager, loc);

        let candidates: Vec<usize> = if rotate {
            (0..ring.len())
                .map(|i| (owner + i) % ring.len())
                .filter(|i| !failed.contains(&ring[*i].0))
                .collect()
        } else {
            vec![owner]
        };

        let mut last_err =
            ClusterError::Member("no live member owns the record".to_string());
        for idx in candidates {
            let (name, addr) = &ring[idx];
            match self.dispatch(name, addr, request) {
                Ok(response) => return Ok(response),
                Err(err) if err.is_transient() => {
                    // One transparent retry per member.
                    match self.dispatch(name, addr, request) {
                        Ok(response) => return Ok(response),
                        Err(retry_err) => last_err = retry_err,
                    }
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err)
    }

    /// Local fast path for requests this member owns itself.
    fn dispatch(&self, name: &str, addr: &str, request: &Request) -> Result<Response> {
        if name == self.member.name() {
            return match request.clone() {
                Request::StoreRecord {
                    manager,
                    loc,
                    data,
                    replicate,
                }
                | Request::UpdateRecord {
                    manager,
                    loc,
                    data,
                    replicate,
                } => {
                    self.local.store(&manager, loc, &data)?;
                    if replicate {
                        self.member.forward_to_replicas(&Request::StoreRecord {
                            manager,
                            loc,
                            data,
                            replicate: false,
                        });
                    }
                    Ok(Response::Ok)
                }
                Request::FetchRecord { manager, loc } => {
                    Ok(Response::Data(self.local.fetch(&manager, loc)?))
                }
                Request::FreeRecord {
                    manager,
                    loc,
                    replicate,
                } => {
                    self.local.free(&manager, loc)?;
                    if replicate {
                        self.member.forward_to_replicas(&Request::FreeRecord {
                            manager,
                            loc,
                            replicate: false,
                        });
                    }
                    Ok(Response::Ok)
                }
                Request::RootGet { manager, id } => {
                    Ok(Response::Loc(self.local.root(&manager, id)?))
                }
                Request::RootSet { manager, id, loc } => {
                    self.local.set_root(&manager, id, loc)?;
                    Ok(Response::Ok)
                }
                other => Err(ClusterError::Protocol(format!(
                    "verb not routable locally: {other:?}"
                ))),
            };
        }

        call(
            addr,
            &self.member.config().secret,
            self.member.config().rpc_timeout(),
            request,
        )
    }

    fn store(&self, manager: &str, loc: u64, data: &[u8]) -> Result<()> {
        let request = Request::StoreRecord {
            manager: manager.to_string(),
            loc,
            data: data.to_vec(),
            replicate: true,
        };
        match self.route(manager, loc, &request, false)? {
            Response::Ok => Ok(()),
            other => Err(ClusterError::Protocol(format!(
                "unexpected store response: {other:?}"
            ))),
        }
    }

    fn fetch(&self, manager: &str, loc: u64) -> Result<Option<Vec<u8>>> {
        let request = Request::FetchRecord {
            manager: manager.to_string(),
            loc,
        };
        match self.route(manager, loc, &request, true)? {
            Response::Data(data) => Ok(data),
            other => Err(ClusterError::Protocol(format!(
                "unexpected fetch response: {other:?}"
            ))),
        }
    }

    fn free(&self, manager: &str, loc: u64) -> Result<()> {
        let request = Request::FreeRecord {
            manager: manager.to_string(),
            loc,
            replicate: true,
        };
        match self.route(manager, loc, &request, false)? {
            Response::Ok => Ok(()),
            other => Err(ClusterError::Protocol(format!(
                "unexpected free response: {other:?}"
            ))),
        }
    }

    fn root(&self, manager: &str, id: u8) -> Result<u64> {
        let request = Request::RootGet {
            manager: manager.to_string(),
            id,
        };
        match self.route(manager, roots_loc(manager), &request, true)? {
            Response::Loc(loc) => Ok(loc),
            other => Err(ClusterError::Protocol(format!(
                "unexpected root response: {other:?}"
            ))),
        }
    }

    fn set_root(&self, manager: &str, id: u8, loc: u64) -> Result<()> {
        let request = Request::RootSet {
            manager: manager.to_string(),
            id,
            loc,
        };
        match self.route(manager, roots_loc(manager), &request, false)? {
            Response::Ok => Ok(()),
            other => Err(ClusterError::Protocol(format!(
                "unexpected root response: {other:?}"
            ))),
        }
    }
}

/// Surrogate location that places all roots of a manager on one owner.
fn roots_loc(manager: &str) -> u64 {
    stable_hash(manager.as_bytes())
}

/// A storage manager whose records live on their primary owners.
pub struct DistributedStorageManager {
    name: String,
    member: Arc<MemberManager>,
    local: Arc<LocalRecordStore>,
    cache: Mutex<HashMap<u64, Vec<u8>>>,
}

impl DistributedStorageManager {
    fn router(&self) -> Router {
        Router {
            member: Arc::clone(&self.member),
            local: Arc::clone(&self.local),
        }
    }

    /// Member-unique fresh location: the high bits carry the member
    /// name hash so concurrent inserters do not collide, the low bits
    /// a persisted member-local counter.
    fn next_loc(&self) -> quiver_storage::Result<u64> {
        let count = self.local.next_counter(&self.name)?;
        let prefix = stable_hash(self.member.name().as_bytes()) & 0xffff;
        Ok((prefix << 48) | (count & 0xffff_ffff_ffff))
    }
}

impl StorageManager for DistributedStorageManager {
    fn name(&self) -> &str {
        &self.name
    }

    fn root(&self, id: u8) -> quiver_storage::Result<u64> {
        Ok(self.router().root(&self.name, id)?)
    }

    fn set_root(&self, id: u8, loc: u64) -> quiver_storage::Result<()> {
        Ok(self.router().set_root(&self.name, id, loc)?)
    }

    fn insert(&self, data: &[u8]) -> quiver_storage::Result<u64> {
        let loc = self.next_loc()?;
        self.router().store(&self.name, loc, data)?;
        self.cache.lock().unwrap().insert(loc, data.to_vec());
        Ok(loc)
    }

    fn update(&self, loc: u64, data: &[u8]) -> quiver_storage::Result<()> {
        self.router().store(&self.name, loc, data)?;
        self.cache.lock().unwrap().insert(loc, data.to_vec());
        Ok(())
    }

    fn fetch(&self, loc: u64) -> quiver_storage::Result<Vec<u8>> {
        if let Some(data) = self.cache.lock().unwrap().get(&loc) {
            return Ok(data.clone());
        }
        match self.router().fetch(&self.name, loc)? {
            Some(data) => {
                self.cache.lock().unwrap().insert(loc, data.clone());
                Ok(data)
            }
            None => Err(quiver_storage::StorageError::SlotNotFound(loc)),
        }
    }

    fn fetch_cached(&self, loc: u64) -> quiver_storage::Result<Vec<u8>> {
        self.cache
            .lock()
            .unwrap()
            .get(&loc)
            .cloned()
            .ok_or(quiver_storage::StorageError::NotInCache(loc))
    }

    fn free(&self, loc: u64) -> quiver_storage::Result<()> {
        self.router().free(&self.name, loc)?;
        self.cache.lock().unwrap().remove(&loc);
        Ok(())
    }

    fn flush(&self) -> quiver_storage::Result<()> {
        self.local.flush(&self.name)?;
        Ok(())
    }

    fn rollback(&self) -> quiver_storage::Result<()> {
        self.cache.lock().unwrap().clear();
        Ok(())
    }

    fn close(&self) -> quiver_storage::Result<()> {
        Ok(())
    }
}
