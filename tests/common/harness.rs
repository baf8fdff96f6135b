//! tests/common/harness.rs
//!
//! A test harness for driving whole clusters in-process. Instead of real
//! sockets, every node's engine is wired to an in-memory router that moves
//! packets between nodes and can drop them per direction, which makes
//! partitions and crashes cheap to simulate and keeps the protocol timing
//! the only clock in the test.

use anyhow::{bail, Result};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use swim_cluster::{
    members::{MemberInfo, Members},
    packet::Packet,
    transport::TransportCommand,
    Config, Engine,
};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Directed links currently dropping every packet.
type BlockedLinks = Arc<StdMutex<HashSet<(String, String)>>>;
/// Where to deliver inbound packets for each live node.
type Destinations = Arc<StdMutex<HashMap<String, mpsc::Sender<Packet>>>>;

/// A cluster node running its real engine over the in-memory router.
pub struct TestNode {
    pub name: String,
    pub config: Config,
    pub members: Arc<Mutex<Members>>,
    shutdown: CancellationToken,
    engine_task: JoinHandle<()>,
    router_task: JoinHandle<()>,
}

impl TestNode {
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.engine_task.abort();
        self.router_task.abort();
    }
}

/// An in-process cluster of [`TestNode`]s.
pub struct TestCluster {
    nodes: HashMap<String, TestNode>,
    destinations: Destinations,
    blocked: BlockedLinks,
}

/// Protocol timing for tests: fast enough to converge in well under a
/// second, slow enough that an overloaded runner does not produce false
/// suspicion.
pub fn test_config(name: &str, peers: &[&str]) -> Config {
    Config {
        local_name: name.to_string(),
        peers: peers.iter().map(|p| p.to_string()).collect(),
        local_metadata: HashMap::from([("node".to_string(), name.to_string())]),
        ping_interval_ms: 60,
        ping_timeout_ms: 50,
        ping_req_count: 1,
        ping_req_timeout_ms: 150,
        suspect_timeout_ms: 800,
        sync_interval_ms: 50,
        ..Config::default()
    }
}

impl TestCluster {
    /// Starts a fully connected cluster where every node lists every other
    /// node as a peer.
    pub fn start(names: &[&str]) -> Self {
        Self::start_with(names, test_config)
    }

    /// Starts a cluster with a custom per-node configuration.
    pub fn start_with(names: &[&str], config_fn: impl Fn(&str, &[&str]) -> Config) -> Self {
        let destinations: Destinations = Arc::new(StdMutex::new(HashMap::new()));
        let blocked: BlockedLinks = Arc::new(StdMutex::new(HashSet::new()));
        let mut cluster = Self {
            nodes: HashMap::new(),
            destinations,
            blocked,
        };
        for name in names {
            let peers: Vec<&str> = names.iter().filter(|n| *n != name).copied().collect();
            let config = config_fn(name, &peers);
            cluster.spawn_node(config);
        }
        cluster
    }

    /// Spawns (or respawns) one node and registers it with the router.
    fn spawn_node(&mut self, config: Config) {
        let name = config.local_name.clone();
        let (inbound_tx, inbound_rx) = mpsc::channel::<Packet>(256);
        let (command_tx, command_rx) = mpsc::channel::<TransportCommand>(256);
        self.destinations
            .lock()
            .expect("destinations lock")
            .insert(name.clone(), inbound_tx);

        let members = Arc::new(Mutex::new(Members::new(&config)));
        let shutdown = CancellationToken::new();
        let engine = Engine::new(config.clone(), members.clone(), inbound_rx, command_tx);
        let engine_task = tokio::spawn(engine.run(shutdown.clone()));
        let router_task = tokio::spawn(route(
            name.clone(),
            command_rx,
            self.destinations.clone(),
            self.blocked.clone(),
            shutdown.clone(),
        ));

        self.nodes.insert(
            name.clone(),
            TestNode {
                name,
                config,
                members,
                shutdown,
                engine_task,
                router_task,
            },
        );
    }

    pub fn node(&self, name: &str) -> &TestNode {
        self.nodes.get(name).expect("unknown test node")
    }

    /// Drops all packets sent from `from` to `to` until unblocked.
    pub fn block(&self, from: &str, to: &str) {
        self.blocked
            .lock()
            .expect("blocked lock")
            .insert((from.to_string(), to.to_string()));
    }

    /// Drops all packets between `a` and `b` in both directions.
    pub fn block_both(&self, a: &str, b: &str) {
        self.block(a, b);
        self.block(b, a);
    }

    pub fn unblock_both(&self, a: &str, b: &str) {
        let mut blocked = self.blocked.lock().expect("blocked lock");
        blocked.remove(&(a.to_string(), b.to_string()));
        blocked.remove(&(b.to_string(), a.to_string()));
    }

    /// Stops a node and starts a fresh instance under the same name, with a
    /// new registry and therefore new validity bytes.
    pub fn restart(&mut self, name: &str) {
        let node = self.nodes.remove(name).expect("unknown test node");
        node.shutdown();
        let config = node.config.clone();
        self.spawn_node(config);
    }

    /// What `observer` currently believes about `subject`.
    pub async fn view(&self, observer: &str, subject: &str) -> Option<MemberInfo> {
        self.node(observer).members.lock().await.info(subject)
    }

    /// Polls until `observer`'s view of `subject` satisfies the predicate.
    pub async fn wait_for_view<F>(
        &self,
        observer: &str,
        subject: &str,
        timeout: Duration,
        pred: F,
    ) -> Result<MemberInfo>
    where
        F: Fn(&MemberInfo) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(info) = self.view(observer, subject).await {
                if pred(&info) {
                    return Ok(info);
                }
            }
            if Instant::now() >= deadline {
                match self.view(observer, subject).await {
                    Some(info) => bail!(
                        "timed out waiting for {observer}'s view of {subject}; \
                         currently {:?} at clock {}",
                        info.status,
                        info.clock
                    ),
                    None => bail!("timed out; {observer} has never heard of {subject}"),
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub fn shutdown(&self) {
        for node in self.nodes.values() {
            node.shutdown();
        }
    }
}

/// Moves one node's outbound packets to the destination node's inbound
/// queue, honoring the blocked-link set.
async fn route(
    from: String,
    mut command_rx: mpsc::Receiver<TransportCommand>,
    destinations: Destinations,
    blocked: BlockedLinks,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            command = command_rx.recv() => {
                let Some(TransportCommand::SendPacket(to, packet)) = command else {
                    break;
                };
                let dropped = blocked
                    .lock()
                    .expect("blocked lock")
                    .contains(&(from.clone(), to.clone()));
                if dropped {
                    continue;
                }
                let destination = destinations
                    .lock()
                    .expect("destinations lock")
                    .get(&to)
                    .cloned();
                if let Some(destination) = destination {
                    let _ = destination.send(packet).await;
                }
            }
        }
    }
}
