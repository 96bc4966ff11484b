//! Cluster membership and gossip
//!
//! Every member runs an RPC server and a housekeeping thread. The
//! housekeeping thread gossips state info to the other members on a
//! timer, moves unreachable members to the failed set and logs state
//! divergence. Membership changes bump the member's timestamp: the
//! previous value is kept as `tsold`.

use std::collections::BTreeSet;
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::ClusterConfig;
use crate::error::{ClusterError, Result};
use crate::log::ClusterLog;
use crate::rpc::{call, serve_connection, Request, Response, StateInfo};

/// Number of retained cluster log entries.
const LOG_CAPACITY: usize = 256;

/// Record-level operations the RPC server delegates to the local
/// storage backend. Wired up by the distributed storage layer.
pub trait StorageHandler: Send + Sync {
    fn store(&self, manager: &str, loc: u64, data: &[u8]) -> Result<()>;
    fn fetch(&self, manager: &str, loc: u64) -> Result<Option<Vec<u8>>>;
    fn free(&self, manager: &str, loc: u64) -> Result<()>;
    fn flush(&self, manager: &str) -> Result<()>;
    fn root(&self, manager: &str, id: u8) -> Result<u64>;
    fn set_root(&self, manager: &str, id: u8, loc: u64) -> Result<()>;
}

struct ClusterState {
    /// Alive members `(name, addr)`; self is always first locally.
    members: Vec<(String, String)>,
    failed: BTreeSet<String>,
    ts: (String, u64),
    tsold: (String, u64),
}

/// One cluster member.
pub struct MemberManager {
    config: ClusterConfig,
    /// Address actually bound (config may ask for port 0).
    addr: String,
    state: RwLock<ClusterState>,
    log: Mutex<ClusterLog>,
    handler: RwLock<Option<Arc<dyn StorageHandler>>>,
    stop: Arc<AtomicBool>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl MemberManager {
    /// Bind the RPC listener and start the server and housekeeping
    /// threads.
    pub fn start(config: ClusterConfig) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(&config.addr)?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?.to_string();

        let name = config.name.clone();
        let manager = Arc::new(MemberManager {
            state: RwLock::new(ClusterState {
                members: vec![(name.clone(), addr.clone())],
                failed: BTreeSet::new(),
                ts: (name.clone(), 1),
                tsold: (name, 0),
            }),
            log: Mutex::new(ClusterLog::new(LOG_CAPACITY)),
            handler: RwLock::new(None),
            stop: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
            addr,
            config,
        });

        manager.log_event(format!("member {} listening on {}", manager.name(), manager.addr));

        let server = Arc::clone(&manager);
        let server_thread = thread::spawn(move || Self::accept_loop(server, listener));

        let keeper = Arc::clone(&manager);
        let keeper_thread = thread::spawn(move || keeper.housekeeping_loop());

        manager
            .threads
            .lock()
            .unwrap()
            .extend([server_thread, keeper_thread]);
        Ok(manager)
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The bound RPC address of this member.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Attach the storage backend serving record-level verbs.
    pub fn set_storage_handler(&self, handler: Arc<dyn StorageHandler>) {
        *self.handler.write().unwrap() = Some(handler);
    }

    pub(crate) fn storage_handler(&self) -> Option<Arc<dyn StorageHandler>> {
        self.handler.read().unwrap().clone()
    }

    /// Stop the server and housekeeping threads.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let threads: Vec<_> = self.threads.lock().unwrap().drain(..).collect();
        for handle in threads {
            let _ = handle.join();
        }
    }

    // === Membership ===

    /// Alive members `(name, addr)`, self first.
    pub fn members(&self) -> Vec<(String, String)> {
        self.state.read().unwrap().members.clone()
    }

    /// Names of members considered failed.
    pub fn failed(&self) -> Vec<String> {
        self.state.read().unwrap().failed.iter().cloned().collect()
    }

    /// Members in name order; the routing ring every member agrees on.
    pub fn ring(&self) -> Vec<(String, String)> {
        let mut ring = self.members();
        ring.sort();
        ring
    }

    /// Current gossip snapshot.
    pub fn state_info(&self) -> StateInfo {
        let state = self.state.read().unwrap();
        StateInfo {
            members: state.members.clone(),
            failed: state.failed.iter().cloned().collect(),
            replication: self.config.replication_factor,
            ts: state.ts.clone(),
            tsold: state.tsold.clone(),
        }
    }

    /// Retained cluster log entries, oldest first.
    pub fn log_entries(&self) -> Vec<String> {
        self.log.lock().unwrap().entries()
    }

    fn log_event(&self, entry: String) {
        debug!(member = %self.config.name, "{entry}");
        self.log.lock().unwrap().add(entry);
    }

    fn bump_state(&self) {
        let mut state = self.state.write().unwrap();
        state.tsold = state.ts.clone();
        state.ts.1 += 1;
    }

    /// Check that a member answers a ping.
    pub fn ping(&self, addr: &str) -> Result<()> {
        match call(
            addr,
            &self.config.secret,
            self.config.rpc_timeout(),
            &Request::Ping,
        )? {
            Response::Pong => Ok(()),
            other => Err(ClusterError::Protocol(format!(
                "unexpected ping response: {other:?}"
            ))),
        }
    }

    /// Join the cluster that `addr` belongs to and adopt its member
    /// list.
    pub fn join_cluster(&self, addr: &str) -> Result<()> {
        let response = call(
            addr,
            &self.config.secret,
            self.config.rpc_timeout(),
            &Request::JoinCluster {
                name: self.config.name.clone(),
                addr: self.addr.clone(),
            },
        )?;

        let Response::Members(list) = response else {
            return Err(ClusterError::Protocol(format!(
                "unexpected join response: {response:?}"
            )));
        };

        {
            let mut state = self.state.write().unwrap();
            let mut members = vec![(self.config.name.clone(), self.addr.clone())];
            for (name, addr) in list {
                if name != self.config.name {
                    members.push((name, addr));
                }
            }
            state.members = members;
        }
        self.bump_state();
        self.log_event(format!("joined cluster via {addr}"));
        Ok(())
    }

    /// Remove a member (self included) from the member table.
    pub fn eject_member(&self, name: &str) -> Result<()> {
        {
            let mut state = self.state.write().unwrap();
            let before = state.members.len();
            state.members.retain(|(n, _)| n != name);
            if state.members.len() == before {
                return Err(ClusterError::Member("Unknown target member".to_string()));
            }
            state.failed.remove(name);
        }
        self.bump_state();
        self.log_event(format!("ejected member {name}"));
        Ok(())
    }

    // === Server side ===

    fn accept_loop(manager: Arc<Self>, listener: TcpListener) {
        while !manager.stop.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, _)) => {
                    let _ = stream.set_nonblocking(false);
                    let conn_manager = Arc::clone(&manager);
                    thread::spawn(move || {
                        let timeout = conn_manager.config.rpc_timeout();
                        let secret = conn_manager.config.secret.clone();
                        serve_connection(stream, &secret, timeout, |request| {
                            conn_manager.handle_request(request)
                        });
                    });
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(20));
                }
                Err(_) => thread::sleep(Duration::from_millis(20)),
            }
        }
    }

    fn handle_request(&self, request: Request) -> Response {
        match request {
            Request::Ping => Response::Pong,

            Request::JoinCluster { name, addr } => {
                {
                    let mut state = self.state.write().unwrap();
                    state.members.retain(|(n, _)| *n != name);
                    state.members.push((name.clone(), addr));
                    state.failed.remove(&name);
                }
                self.bump_state();
                self.log_event(format!("member {name} joined"));
                Response::Members(self.members())
            }

            Request::EjectMember { name } => match self.eject_member(&name) {
                Ok(()) => Response::Ok,
                Err(err) => Response::Error(err.to_string()),
            },

            Request::StateInfo => Response::State(self.state_info()),

            Request::MemberInfoCluster => Response::Members(self.members()),

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
            } => match self.storage_handler() {
                Some(handler) => match handler.store(&manager, loc, &data) {
                    Ok(()) => {
                        if replicate {
                            self.forward_to_replicas(&Request::StoreRecord {
                                manager,
                                loc,
                                data,
                                replicate: false,
                            });
                        }
                        Response::Ok
                    }
                    Err(err) => Response::Error(err.to_string()),
                },
                None => Response::Error("no storage attached".to_string()),
            },

            Request::FetchRecord { manager, loc } => match self.storage_handler() {
                Some(handler) => match handler.fetch(&manager, loc) {
                    Ok(data) => Response::Data(data),
                    Err(err) => Response::Error(err.to_string()),
                },
                None => Response::Error("no storage attached".to_string()),
            },

            Request::FreeRecord {
                manager,
                loc,
                replicate,
            } => match self.storage_handler() {
                Some(handler) => match handler.free(&manager, loc) {
                    Ok(()) => {
                        if replicate {
                            self.forward_to_replicas(&Request::FreeRecord {
                                manager,
                                loc,
                                replicate: false,
                            });
                        }
                        Response::Ok
                    }
                    Err(err) => Response::Error(err.to_string()),
                },
                None => Response::Error("no storage attached".to_string()),
            },

            Request::FlushStorage { manager } => match self.storage_handler() {
                Some(handler) => match handler.flush(&manager) {
                    Ok(()) => Response::Ok,
                    Err(err) => Response::Error(err.to_string()),
                },
                None => Response::Error("no storage attached".to_string()),
            },

            Request::RootGet { manager, id } => match self.storage_handler() {
                Some(handler) => match handler.root(&manager, id) {
                    Ok(loc) => Response::Loc(loc),
                    Err(err) => Response::Error(err.to_string()),
                },
                None => Response::Error("no storage attached".to_string()),
            },

            Request::RootSet { manager, id, loc } => match self.storage_handler() {
                Some(handler) => match handler.set_root(&manager, id, loc) {
                    Ok(()) => Response::Ok,
                    Err(err) => Response::Error(err.to_string()),
                },
                None => Response::Error("no storage attached".to_string()),
            },
        }
    }

    /// Best-effort copies to the next `replication_factor - 1` live
    /// ring members. Acknowledgement never waits for replicas; their
    /// failures are only logged.
    pub(crate) fn forward_to_replicas(&self, request: &Request) {
        let replicas = self.replica_addrs();
        for (name, addr) in replicas {
            if let Err(err) = call(
                &addr,
                &self.config.secret,
                self.config.rpc_timeout(),
                request,
            ) {
                warn!(member = %self.config.name, replica = %name, "replica write failed: {err}");
                self.log_event(format!("replica write to {name} failed: {err}"));
            }
        }
    }

    /// The next `replication_factor - 1` live members after self in
    /// ring order.
    fn replica_addrs(&self) -> Vec<(String, String)> {
        let ring = self.ring();
        let failed: BTreeSet<String> = self.failed().into_iter().collect();
        let Some(self_idx) = ring.iter().position(|(n, _)| n == self.name()) else {
            return Vec::new();
        };

        let mut replicas = Vec::new();
        let wanted = self.config.replication_factor.saturating_sub(1);
        for offset in 1..ring.len() {
            if replicas.len() == wanted {
                break;
            }
            let (name, addr) = &ring[(self_idx + offset) % ring.len()];
            if !failed.contains(name) {
                replicas.push((name.clone(), addr.clone()));
            }
        }
        replicas
    }

    // === Housekeeping ===

    fn housekeeping_loop(&self) {
        let interval = self.config.gossip_interval();
        loop {
            let mut waited = Duration::ZERO;
            while waited < interval {
                if self.stop.load(Ordering::SeqCst) {
                    return;
                }
                let step = Duration::from_millis(20).min(interval - waited);
                thread::sleep(step);
                waited += step;
            }
            self.gossip();
        }
    }

    /// One gossip round: exchange state info with every other member,
    /// merge member tables and maintain the failed set.
    fn gossip(&self) {
        let peers: Vec<(String, String)> = self
            .members()
            .into_iter()
            .filter(|(n, _)| n != self.name())
            .collect();

        for (name, addr) in peers {
            match call(
                &addr,
                &self.config.secret,
                self.config.rpc_timeout(),
                &Request::StateInfo,
            ) {
                Ok(Response::State(remote)) => self.merge_state(&name, remote),
                Ok(other) => {
                    self.log_event(format!("unexpected gossip response from {name}: {other:?}"))
                }
                Err(err) => {
                    let newly_failed = {
                        let mut state = self.state.write().unwrap();
                        state.failed.insert(name.clone())
                    };
                    if newly_failed {
                        self.bump_state();
                        self.log_event(format!("member {name} unreachable: {err}"));
                    }
                }
            }
        }
    }

    fn merge_state(&self, from: &str, remote: StateInfo) {
        let mut divergence = false;
        {
            let mut state = self.state.write().unwrap();

            let known: BTreeSet<String> =
                state.members.iter().map(|(n, _)| n.clone()).collect();
            let remote_names: BTreeSet<String> =
                remote.members.iter().map(|(n, _)| n.clone()).collect();
            if known != remote_names {
                divergence = true;
            }

            for (name, addr) in remote.members {
                if !known.contains(&name) {
                    state.members.push((name, addr));
                }
            }
            for name in remote.failed {
                if name != *self.name() {
                    state.failed.insert(name);
                }
            }
            // The peer answered, so it is alive from our perspective.
            state.failed.remove(from);
        }

        if divergence {
            self.log_event(format!("state divergence detected against {from}"));
        }
    }
}

impl Drop for MemberManager {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}
