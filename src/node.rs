use futures::stream::{FuturesUnordered, StreamExt};
use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
    time::{Duration, SystemTime},
};
use tokio::sync::RwLock;
use tracing::{debug, info, trace};

use crate::{
    error::{Error, Result},
    identity::Identity,
    key::Key,
    message::{Body, FindValueReply, Message},
    query::ClosestPeersIter,
    routing::{RoutingTable, UpdateResult},
    server::{self, ServerHandle},
    store::RecordStore,
    transport::Transport,
    K_VALUE,
};

#[derive(Debug, Clone)]
pub struct KademliaConfig {
    listen_addr: SocketAddr,
    advertise_ip: Option<IpAddr>,
    local_key: Option<Key>,
    rpc_timeout: Duration,
    record_ttl: Duration,
    replication_interval: Duration,
    refresh_interval: Duration,
    maintenance_interval: Option<Duration>,
    max_connections: Option<usize>,
    logging_enabled: bool,
}

impl Default for KademliaConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            advertise_ip: None,
            local_key: None,
            rpc_timeout: Duration::from_secs(5),
            record_ttl: Duration::from_secs(60 * 60 * 24),
            replication_interval: Duration::from_secs(60 * 60),
            refresh_interval: Duration::from_secs(60 * 60),
            maintenance_interval: Some(Duration::from_secs(60)),
            max_connections: None,
            logging_enabled: false,
        }
    }
}

impl KademliaConfig {
    /// Address the listener binds to. Port 0 lets the OS assign one. Default: `0.0.0.0:0`
    pub fn set_listen_addr(&mut self, addr: SocketAddr) -> &mut Self {
        self.listen_addr = addr;
        self
    }

    /// IP announced to other nodes. `None` uses the listen IP, or loopback when
    /// listening on the unspecified address.
    pub fn set_advertise_ip(&mut self, ip: Option<IpAddr>) -> &mut Self {
        self.advertise_ip = ip;
        self
    }

    /// Fixed node id. `None` draws a random one when the node is created.
    pub fn set_local_key(&mut self, key: Option<Key>) -> &mut Self {
        self.local_key = key;
        self
    }

    /// Bound for each outbound RPC and for reading an inbound request. Default: 5s
    pub fn set_rpc_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.rpc_timeout = timeout;
        self
    }

    /// Lifetime given to records published by this node. Default: 24h
    pub fn set_record_ttl(&mut self, ttl: Duration) -> &mut Self {
        self.record_ttl = ttl;
        self
    }

    /// How often published records are pushed again to the nodes closest to
    /// their key. Default: 1h
    pub fn set_replication_interval(&mut self, interval: Duration) -> &mut Self {
        self.replication_interval = interval;
        self
    }

    /// Buckets untouched for this long are refreshed with a lookup. Default: 1h
    pub fn set_refresh_interval(&mut self, interval: Duration) -> &mut Self {
        self.refresh_interval = interval;
        self
    }

    /// Period of the maintenance job, `None` disables it. Default: 60s
    pub fn set_maintenance_interval(&mut self, interval: Option<Duration>) -> &mut Self {
        self.maintenance_interval = interval;
        self
    }

    /// Cap on inbound connections handled at once, `None` for no limit. Default: `None`
    pub fn set_max_connections(&mut self, max: Option<usize>) -> &mut Self {
        self.max_connections = max;
        self
    }

    /// Per-message logging of the protocol handlers. Default: false
    pub fn set_logging_enabled(&mut self, enabled: bool) -> &mut Self {
        self.logging_enabled = enabled;
        self
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn rpc_timeout(&self) -> Duration {
        self.rpc_timeout
    }

    pub fn record_ttl(&self) -> Duration {
        self.record_ttl
    }

    pub fn replication_interval(&self) -> Duration {
        self.replication_interval
    }

    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    pub fn maintenance_interval(&self) -> Option<Duration> {
        self.maintenance_interval
    }

    pub fn max_connections(&self) -> Option<usize> {
        self.max_connections
    }

    pub fn logging_enabled(&self) -> bool {
        self.logging_enabled
    }

    fn advertised_ip(&self) -> IpAddr {
        match self.advertise_ip {
            Some(ip) => ip,
            None => match self.listen_addr.ip() {
                IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
                ip => ip,
            },
        }
    }
}

#[derive(Debug)]
struct NodeState {
    local: Identity,
    config: KademliaConfig,
    routing_table: RwLock<RoutingTable>,
    store: RwLock<RecordStore>,
}

/// Handle to the local node. Cloning is cheap, every clone shares the same
/// routing table and store.
#[derive(Debug, Clone)]
pub struct KademliaNode {
    state: Arc<NodeState>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupOutcome {
    /// The closest nodes found, closest first.
    Nodes(Vec<Identity>),
    Value { value: Vec<u8>, source: Identity },
}

impl KademliaNode {
    /// Creates a node for `local` without a listener.
    pub fn new(local: Identity, config: KademliaConfig) -> Self {
        Self {
            state: Arc::new(NodeState {
                routing_table: RwLock::new(RoutingTable::new(local.key)),
                store: RwLock::new(RecordStore::new()),
                local,
                config,
            }),
        }
    }

    /// Binds the listener, creates the node and starts serving.
    pub async fn listen(config: KademliaConfig) -> Result<(Self, ServerHandle)> {
        let transport = Transport::listen_on(config.listen_addr)?;
        let local_addr = transport.local_addr();

        let key = config.local_key.unwrap_or_else(Key::random);
        let local = Identity {
            key,
            ip: config.advertised_ip(),
            port: local_addr.port(),
        };

        info!("Local node {local}");
        let node = Self::new(local, config);
        let handle = server::spawn(node.clone(), transport);

        Ok((node, handle))
    }

    pub fn local(&self) -> Identity {
        self.state.local
    }

    pub fn local_key(&self) -> &Key {
        &self.state.local.key
    }

    pub fn config(&self) -> &KademliaConfig {
        &self.state.config
    }

    pub(crate) fn routing_table(&self) -> &RwLock<RoutingTable> {
        &self.state.routing_table
    }

    pub(crate) fn store(&self) -> &RwLock<RecordStore> {
        &self.state.store
    }

    pub async fn add_contact(&self, node: Identity) -> UpdateResult {
        self.state.routing_table.write().await.add_contact(node)
    }

    pub async fn node_count(&self) -> usize {
        self.state.routing_table.read().await.node_count()
    }

    pub async fn closest_to(&self, target: &Key, limit: usize) -> Vec<Identity> {
        self.state
            .routing_table
            .read()
            .await
            .closest_nodes(target, limit)
    }

    /// Value held by this node for `key`, without asking the network.
    pub async fn get_local(&self, key: &Key) -> Result<Vec<u8>> {
        self.state
            .store
            .read()
            .await
            .get(key)
            .map(|record| record.value.clone())
    }

    pub async fn store_local(
        &self,
        key: Key,
        value: Vec<u8>,
        expiration_time: SystemTime,
        replication_interval: Duration,
    ) -> Result<()> {
        self.state
            .store
            .write()
            .await
            .put(key, value, expiration_time, replication_interval)
    }

    /// Sends `body` to `addr` and waits for the matching reply.
    ///
    /// Only a peer that answered correctly is recorded in the routing table.
    async fn call(&self, addr: SocketAddr, body: Body) -> Result<Message> {
        let request = Message::request(self.local(), body);

        let exchange = async {
            let mut stream = Transport::dial(addr).await?;
            stream.write_msg(&request).await?;
            let reply = stream.read_msg().await?;
            let _ = stream.close().await;
            Ok::<_, Error>(reply)
        };

        let reply = match tokio::time::timeout(self.state.config.rpc_timeout, exchange).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(Error::Io(source))) => return Err(Error::UnreachablePeer { addr, source }),
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(Error::UnreachablePeer {
                    addr,
                    source: io::Error::new(io::ErrorKind::TimedOut, "no reply in time"),
                })
            }
        };

        if !request.is_answered_by(&reply) {
            return Err(Error::UnexpectedReply { addr });
        }

        self.add_contact(reply.sender).await;
        Ok(reply)
    }

    /// Pings `addr`, returning the identity of the node that answered.
    pub async fn ping(&self, addr: SocketAddr) -> Result<Identity> {
        let reply = self.call(addr, Body::Ping { pong: false }).await?;
        Ok(reply.sender)
    }

    /// Asks the node at `addr` to store `data` under `key`. Returns the nodes
    /// it knows closest to the key.
    pub async fn store_at(
        &self,
        addr: SocketAddr,
        key: Key,
        data: Vec<u8>,
        expiration_time: SystemTime,
        replication_interval: Duration,
    ) -> Result<Vec<Identity>> {
        let body = Body::Store {
            key,
            data,
            expiration_time,
            replication_interval,
        };

        match self.call(addr, body).await?.body {
            Body::StoreReply { closest } => Ok(closest),
            _ => Err(Error::UnexpectedReply { addr }),
        }
    }

    pub async fn find_node_at(&self, addr: SocketAddr, target: Key) -> Result<Vec<Identity>> {
        match self.call(addr, Body::FindNode { target }).await?.body {
            Body::FindNodeReply { closest } => Ok(closest),
            _ => Err(Error::UnexpectedReply { addr }),
        }
    }

    pub async fn find_value_at(&self, addr: SocketAddr, key: Key) -> Result<FindValueReply> {
        match self.call(addr, Body::FindValue { key }).await?.body {
            Body::FindValueReply(reply) => Ok(reply),
            _ => Err(Error::UnexpectedReply { addr }),
        }
    }

    async fn query_peer(
        &self,
        peer: Identity,
        target: Key,
        find_value: bool,
    ) -> (Identity, Result<FindValueReply>) {
        let addr = peer.socket_addr();
        let result = if find_value {
            self.find_value_at(addr, target).await
        } else {
            self.find_node_at(addr, target)
                .await
                .map(FindValueReply::Nodes)
        };

        (peer, result)
    }

    /// Iterative lookup: rounds of up to α parallel requests against the
    /// closest not yet queried peers until the shortlist stops improving.
    ///
    /// With `find_value` the lookup ends as soon as a peer returns the value.
    pub async fn iterative_lookup(&self, target: Key, find_value: bool) -> LookupOutcome {
        let seeds = self.closest_to(&target, K_VALUE).await;
        let mut iter = ClosestPeersIter::new(*self.local_key(), target, seeds);

        loop {
            let round = iter.next_round();
            if round.is_empty() {
                break;
            }

            trace!(%target, round = iter.rounds(), peers = round.len(), "Lookup round");
            let mut pending = round
                .into_iter()
                .map(|peer| self.query_peer(peer, target, find_value))
                .collect::<FuturesUnordered<_>>();

            while let Some((peer, result)) = pending.next().await {
                match result {
                    Ok(FindValueReply::Value(value)) => {
                        debug!(%target, "Value found at {peer}");
                        return LookupOutcome::Value {
                            value,
                            source: peer,
                        };
                    }
                    Ok(FindValueReply::Nodes(closer)) => iter.on_success(&peer.key, closer),
                    Err(e) => {
                        debug!(%target, "Lookup request to {peer} failed: {e}");
                        iter.on_failure(&peer.key);
                    }
                }
            }

            iter.finish_round();
        }

        debug!(%target, rounds = iter.rounds(), "Lookup converged");
        LookupOutcome::Nodes(iter.into_result())
    }

    /// The k closest nodes to `target` the network knows of.
    pub async fn lookup_nodes(&self, target: &Key) -> Vec<Identity> {
        match self.iterative_lookup(*target, false).await {
            LookupOutcome::Nodes(nodes) => nodes,
            LookupOutcome::Value { .. } => Vec::new(),
        }
    }

    /// Value stored under `key`, locally or anywhere in the network.
    pub async fn lookup_value(&self, key: &Key) -> Result<Vec<u8>> {
        if let Ok(value) = self.get_local(key).await {
            return Ok(value);
        }

        match self.iterative_lookup(*key, true).await {
            LookupOutcome::Value { value, .. } => Ok(value),
            LookupOutcome::Nodes(_) => Err(Error::NotFound),
        }
    }

    /// Publishes `value` under its content key.
    pub async fn put(&self, value: Vec<u8>) -> Result<Key> {
        let key = Key::from_content(value.as_slice());
        self.put_record(key, value).await?;
        Ok(key)
    }

    /// Stores the record locally and on the k closest nodes to `key`.
    /// Returns the nodes that accepted it.
    pub async fn put_record(&self, key: Key, value: Vec<u8>) -> Result<Vec<Identity>> {
        let expiration_time = SystemTime::now() + self.state.config.record_ttl;
        let replication_interval = self.state.config.replication_interval;

        self.store_local(key, value.clone(), expiration_time, replication_interval)
            .await?;

        let peers = self.lookup_nodes(&key).await;
        let stored = self
            .replicate(key, value, expiration_time, replication_interval, peers)
            .await;

        debug!(%key, "Record stored on {} nodes", stored.len());
        Ok(stored)
    }

    /// Sends STORE to every peer in parallel, returning those that accepted.
    pub(crate) async fn replicate(
        &self,
        key: Key,
        value: Vec<u8>,
        expiration_time: SystemTime,
        replication_interval: Duration,
        peers: Vec<Identity>,
    ) -> Vec<Identity> {
        let mut pending = peers
            .into_iter()
            .map(|peer| {
                let value = value.clone();
                async move {
                    let result = self
                        .store_at(
                            peer.socket_addr(),
                            key,
                            value,
                            expiration_time,
                            replication_interval,
                        )
                        .await;
                    (peer, result)
                }
            })
            .collect::<FuturesUnordered<_>>();

        let mut stored = Vec::new();
        while let Some((peer, result)) = pending.next().await {
            match result {
                Ok(_) => stored.push(peer),
                Err(e) => debug!(%key, "Store on {peer} failed: {e}"),
            }
        }
        stored
    }

    /// Joins the network through the node at `bootstrap`: one PING, then a
    /// lookup of the local id to fill the routing table.
    pub async fn join(&self, bootstrap: SocketAddr) -> Result<Vec<Identity>> {
        let peer = self.ping(bootstrap).await?;
        info!("Bootstrap node {peer} answered");

        let found = self.lookup_nodes(self.local_key()).await;
        info!(
            "Joined the network, {} contacts known",
            self.node_count().await
        );

        Ok(found)
    }

    /// Lookup of a random id inside bucket `index`, populating that range.
    pub async fn refresh_bucket(&self, index: usize) -> Vec<Identity> {
        let target = Key::random_in_bucket(self.local_key(), index);
        let found = self.lookup_nodes(&target).await;

        // Even when the lookup turned up nobody new for this range.
        self.state.routing_table.write().await.mark_refreshed(index);
        found
    }
}
