
// Copyright (c) 2026 Dignode
// Licensed under the Apache License, Version 2.0

// P2P subsystem (libp2p): encrypted transport, gossip discovery topics,
// Kademlia records and the /dig/1.0.0 request/response protocol.

// The swarm runs on its own task and is driven entirely through the
// command channel; `NetClient` is the cheap cloneable handle the rest of
// the node talks to. Transport is TCP + Noise + Yamux only: a dialer that
// cannot complete the authenticated Noise upgrade never reaches the
// protocol layer, which is the mandatory-encryption policy in one line.

use crate::monitoring::metrics::Metrics;
use crate::networking::protocol::{
    encode_request, DigCodec, Request, RequestEnvelope, Response, PROTOCOL_NAME,
};
use crate::networking::server::{ProtocolServer, RelayFetch};
use crate::core::types::StoreId;
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, RwLock},
    time::Duration,
};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use libp2p::{
    core::muxing::StreamMuxerBox,
    core::upgrade,
    gossipsub::{self, IdentTopic, MessageAuthenticity},
    identify,
    kad::{self, store::MemoryStore},
    noise, ping,
    request_response::{self, OutboundRequestId, ProtocolSupport, ResponseChannel},
    swarm::{NetworkBehaviour, Swarm, SwarmEvent},
    tcp, yamux, Multiaddr, PeerId, Transport,
};

use libp2p::futures::StreamExt;
use libp2p::swarm::Config as SwarmConfig;

/// Gossip topics the node joins; fixed protocol constants.
pub const TOPIC_PEER_DISCOVERY: &str = "dig-privacy-peer-discovery";
/// Encrypted address record exchange.
pub const TOPIC_ADDRESS_EXCHANGE: &str = "dig-privacy-address-exchange";
/// Store announcements.
pub const TOPIC_STORE_ANNOUNCEMENTS: &str = "dig-privacy-store-announcements";
/// Capability announcements.
pub const TOPIC_CAPABILITY_ANNOUNCEMENTS: &str = "dig-privacy-capability-announcements";

/// All four discovery topics.
pub const ALL_TOPICS: &[&str] = &[
    TOPIC_PEER_DISCOVERY,
    TOPIC_ADDRESS_EXCHANGE,
    TOPIC_STORE_ANNOUNCEMENTS,
    TOPIC_CAPABILITY_ANNOUNCEMENTS,
];

/// Events emitted by the P2P task.
#[derive(Clone, Debug)]
pub enum P2pEvent {
    /// Peer connected (encrypted session established).
    PeerConnected(PeerId),
    /// Peer disconnected.
    PeerDisconnected(PeerId),
    /// Gossip message received on one of the discovery topics.
    Gossip {
        /// Topic name.
        topic: String,
        /// Propagating peer.
        source: PeerId,
        /// Raw JSON payload.
        data: Vec<u8>,
    },
    /// New listen address.
    Listening(Multiaddr),
}

/// Receiver of P2P events.
pub type EventRx = mpsc::Receiver<P2pEvent>;

#[derive(Debug, Error)]
pub enum P2pError {
    #[error("io")]
    Io,
    #[error("config")]
    Config,
}

/// Failure of an outbound request.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("request timeout")]
    Timeout,
    #[error("peer unreachable")]
    Unreachable,
    #[error("transport closed")]
    Closed,
}

/// Peers whose live connection was opened by dialing a crypto-IPv6
/// resolved address. Those connections get strict handshake verification:
/// a public key that does not hash to the advertised address means the
/// resolution was wrong or spoofed, and the connection is dropped instead
/// of being kept as merely `unverified`.
///
/// Marked when the strict dial is initiated, cleared when the last
/// connection to the peer closes. Shared between the swarm task, the
/// protocol server, and the handshake driver.
#[derive(Clone, Default)]
pub struct StrictDials(Arc<RwLock<HashSet<PeerId>>>);

impl StrictDials {
    /// Mark a peer whose connection is being opened from a resolved
    /// address. Called by the swarm task when it initiates the dial.
    pub fn mark(&self, peer: PeerId) {
        self.0.write().expect("strict dial set lock poisoned").insert(peer);
    }

    fn clear(&self, peer: &PeerId) {
        self.0.write().expect("strict dial set lock poisoned").remove(peer);
    }

    /// Whether the connection to `peer` came from a resolved-address dial.
    pub fn contains(&self, peer: &PeerId) -> bool {
        self.0.read().expect("strict dial set lock poisoned").contains(peer)
    }
}

/// Runtime configuration for the P2P subsystem.
#[derive(Clone, Debug)]
pub struct P2pConfig {
    /// Listen address (e.g. "/ip4/0.0.0.0/tcp/4861").
    pub listen_addr: String,
    /// Peers dialed at startup.
    pub connect_to_peers: Vec<String>,
    /// Join the DHT in server mode.
    pub enable_dht: bool,
    /// Per-request response deadline.
    pub request_timeout: Duration,
    /// Outbound dial deadline.
    pub dial_timeout: Duration,
}

enum NetCommand {
    Dial {
        addr: Multiaddr,
    },
    Request {
        peer: PeerId,
        addr_hint: Option<Multiaddr>,
        /// The hint came from crypto-IPv6 resolution; verify strictly.
        strict: bool,
        request: Request,
        reply: oneshot::Sender<Result<Response, NetError>>,
    },
    Disconnect {
        peer: PeerId,
    },
    Publish {
        topic: String,
        payload: Vec<u8>,
    },
    PutRecord {
        key: String,
        value: Vec<u8>,
    },
    GetRecord {
        key: String,
        reply: oneshot::Sender<Vec<Vec<u8>>>,
    },
    RemoveRecord {
        key: String,
    },
    ConnectedPeers {
        reply: oneshot::Sender<Vec<PeerId>>,
    },
    Shutdown,
}

/// Cloneable handle to the swarm task.
#[derive(Clone)]
pub struct NetClient {
    cmd_tx: mpsc::Sender<NetCommand>,
}

impl NetClient {
    /// Dial a multiaddress (fire and forget; failures surface in events).
    pub async fn dial(&self, addr: Multiaddr) {
        let _ = self.cmd_tx.send(NetCommand::Dial { addr }).await;
    }

    /// Send a request to a connected peer and await the response.
    pub async fn request(&self, peer: PeerId, request: Request) -> Result<Response, NetError> {
        self.request_inner(peer, None, false, request).await
    }

    /// Send a request, dialing `addr` first when no session exists.
    pub async fn request_at(
        &self,
        peer: PeerId,
        addr: Multiaddr,
        request: Request,
    ) -> Result<Response, NetError> {
        self.request_inner(peer, Some(addr), false, request).await
    }

    /// Like [`request_at`](Self::request_at) for an address obtained by
    /// resolving a crypto-IPv6 target: the resulting connection gets
    /// strict handshake verification and is dropped on a key mismatch.
    pub async fn request_resolved(
        &self,
        peer: PeerId,
        addr: Multiaddr,
        request: Request,
    ) -> Result<Response, NetError> {
        self.request_inner(peer, Some(addr), true, request).await
    }

    async fn request_inner(
        &self,
        peer: PeerId,
        addr_hint: Option<Multiaddr>,
        strict: bool,
        request: Request,
    ) -> Result<Response, NetError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(NetCommand::Request { peer, addr_hint, strict, request, reply })
            .await
            .map_err(|_| NetError::Closed)?;
        rx.await.map_err(|_| NetError::Closed)?
    }

    /// Drop every connection to a peer.
    pub async fn disconnect(&self, peer: PeerId) {
        let _ = self.cmd_tx.send(NetCommand::Disconnect { peer }).await;
    }

    /// Publish to a gossip topic.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) {
        let _ = self
            .cmd_tx
            .send(NetCommand::Publish { topic: topic.to_string(), payload })
            .await;
    }

    /// Store a DHT record.
    pub async fn put_record(&self, key: String, value: Vec<u8>) {
        let _ = self.cmd_tx.send(NetCommand::PutRecord { key, value }).await;
    }

    /// Fetch DHT record values for a key (empty when none found).
    pub async fn get_record(&self, key: String) -> Vec<Vec<u8>> {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(NetCommand::GetRecord { key, reply })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Remove one of our own DHT records.
    pub async fn remove_record(&self, key: String) {
        let _ = self.cmd_tx.send(NetCommand::RemoveRecord { key }).await;
    }

    /// Stop the swarm task. Used once at node shutdown; the task also
    /// stops when every client handle is dropped.
    pub async fn close(&self) {
        let _ = self.cmd_tx.send(NetCommand::Shutdown).await;
    }

    /// Currently connected peers.
    pub async fn connected_peers(&self) -> Vec<PeerId> {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(NetCommand::ConnectedPeers { reply })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl RelayFetch for NetClient {
    async fn fetch_store(&self, target: PeerId, store_id: StoreId) -> Option<Vec<u8>> {
        let resp = self
            .request(target, Request::GetStoreContent { store_id: store_id.to_string() })
            .await
            .ok()?;
        resp.header.success.then_some(resp.payload)
    }
}

#[derive(Debug)]
enum BehaviourEvent {
    Gossipsub(gossipsub::Event),
    Kad(kad::Event),
    Rpc(request_response::Event<RequestEnvelope, Response>),
    Identify(Box<identify::Event>),
    Ping(()),
}
impl From<gossipsub::Event> for BehaviourEvent {
    fn from(e: gossipsub::Event) -> Self {
        Self::Gossipsub(e)
    }
}
impl From<kad::Event> for BehaviourEvent {
    fn from(e: kad::Event) -> Self {
        Self::Kad(e)
    }
}
impl From<request_response::Event<RequestEnvelope, Response>> for BehaviourEvent {
    fn from(e: request_response::Event<RequestEnvelope, Response>) -> Self {
        Self::Rpc(e)
    }
}
impl From<identify::Event> for BehaviourEvent {
    fn from(e: identify::Event) -> Self {
        Self::Identify(Box::new(e))
    }
}
impl From<ping::Event> for BehaviourEvent {
    fn from(_e: ping::Event) -> Self {
        Self::Ping(())
    }
}

#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "BehaviourEvent")]
struct Behaviour {
    gossipsub: gossipsub::Behaviour,
    kad: kad::Behaviour<MemoryStore>,
    rpc: request_response::Behaviour<DigCodec>,
    identify: identify::Behaviour,
    ping: ping::Behaviour,
}

/// Spawn the P2P task.
///
/// Inbound requests are dispatched to `server` on their own tasks so that
/// a slow handler (or a relay fetch that loops back through this swarm)
/// never stalls the event loop.
pub fn spawn_p2p(
    cfg: P2pConfig,
    id_keys: libp2p::identity::Keypair,
    server: Arc<ProtocolServer>,
    strict_dials: StrictDials,
    metrics: Arc<Metrics>,
) -> Result<(NetClient, EventRx, tokio::task::JoinHandle<()>), P2pError> {
    let local_peer_id = PeerId::from(id_keys.public());

    let (cmd_tx, mut cmd_rx) = mpsc::channel::<NetCommand>(1024);
    let (ev_tx, ev_rx) = mpsc::channel::<P2pEvent>(1024);
    // Responses come back from handler tasks through this channel.
    let (resp_tx, mut resp_rx) =
        mpsc::channel::<(ResponseChannel<Response>, Option<Response>)>(256);

    let listen_addr = cfg.listen_addr.clone();
    let connect_to = cfg.connect_to_peers.clone();
    let client = NetClient { cmd_tx };

    let join = tokio::spawn(async move {
        // --- Transport (TCP + Noise + Yamux; nothing else) ---
        let noise_keys = match noise::Config::new(&id_keys) {
            Ok(v) => v,
            Err(_) => {
                warn!("failed to build noise config");
                return;
            }
        };

        let encrypted = tcp::tokio::Transport::new(tcp::Config::default().nodelay(true))
            .upgrade(upgrade::Version::V1)
            .authenticate(noise_keys)
            .multiplex(yamux::Config::default());
        // Dial deadline applies to the whole connect + upgrade sequence.
        let transport = libp2p::core::transport::timeout::TransportTimeout::new(
            encrypted,
            cfg.dial_timeout,
        )
        .map(|(p, c), _| (p, StreamMuxerBox::new(c)))
        .boxed();

        // --- Gossipsub: message ids are SHA-256(topic || payload) so a
        // replayed payload dedupes per topic.
        let gcfg = gossipsub::ConfigBuilder::default()
            .validation_mode(gossipsub::ValidationMode::Permissive)
            .heartbeat_interval(Duration::from_secs(1))
            .message_id_fn(|msg: &gossipsub::Message| {
                let mut ctx = ring::digest::Context::new(&ring::digest::SHA256);
                ctx.update(msg.topic.as_str().as_bytes());
                ctx.update(&msg.data);
                gossipsub::MessageId::from(ctx.finish().as_ref().to_vec())
            })
            .build()
            .unwrap_or_default();

        let mut gossipsub =
            match gossipsub::Behaviour::new(MessageAuthenticity::Signed(id_keys.clone()), gcfg) {
                Ok(v) => v,
                Err(_) => {
                    warn!("failed to create gossipsub behaviour");
                    return;
                }
            };
        for name in ALL_TOPICS {
            if let Err(e) = gossipsub.subscribe(&IdentTopic::new(*name)) {
                warn!(topic = name, err = ?e, "failed to subscribe topic");
            }
        }

        // --- Kademlia ---
        let mut kad = kad::Behaviour::new(local_peer_id, MemoryStore::new(local_peer_id));
        if cfg.enable_dht {
            kad.set_mode(Some(kad::Mode::Server));
        }

        // --- Request/response ---
        let rpc = request_response::Behaviour::with_codec(
            DigCodec,
            std::iter::once((PROTOCOL_NAME, ProtocolSupport::Full)),
            request_response::Config::default().with_request_timeout(cfg.request_timeout),
        );

        let identify = identify::Behaviour::new(identify::Config::new(
            "dignode/1.0.0".to_string(),
            id_keys.public(),
        ));

        let ping = ping::Behaviour::new(
            ping::Config::new()
                .with_interval(Duration::from_secs(10))
                .with_timeout(Duration::from_secs(20)),
        );

        let behaviour = Behaviour { gossipsub, kad, rpc, identify, ping };
        let mut swarm =
            Swarm::new(transport, behaviour, local_peer_id, SwarmConfig::with_tokio_executor());

        let listen: Multiaddr = match listen_addr.parse() {
            Ok(v) => v,
            Err(_) => {
                warn!(addr = %listen_addr, "bad listen_addr");
                return;
            }
        };
        if let Err(e) = swarm.listen_on(listen) {
            warn!(err = ?e, "listen_on failed");
            return;
        }

        for b in connect_to.iter().map(|x| x.trim()).filter(|x| !x.is_empty()) {
            match b.parse::<Multiaddr>() {
                Ok(ma) => {
                    if let Err(e) = swarm.dial(ma.clone()) {
                        warn!(peer = %b, err = ?e, "dial bootstrap peer failed");
                    } else {
                        info!(peer = %b, "dialing bootstrap peer");
                    }
                }
                Err(_) => warn!(peer = %b, "bad bootstrap multiaddr; skipping"),
            }
        }

        info!(%local_peer_id, "p2p loop started");
        metrics.p2p_peers.set(0);

        let mut connected: HashSet<PeerId> = HashSet::new();
        let mut pending_requests: HashMap<
            OutboundRequestId,
            oneshot::Sender<Result<Response, NetError>>,
        > = HashMap::new();
        let mut pending_gets: HashMap<kad::QueryId, (oneshot::Sender<Vec<Vec<u8>>>, Vec<Vec<u8>>)> =
            HashMap::new();

        loop {
            tokio::select! {
                maybe_cmd = cmd_rx.recv() => {
                    let Some(cmd) = maybe_cmd else {
                        info!("command channel closed; stopping p2p task");
                        break;
                    };
                    match cmd {
                        NetCommand::Dial { addr } => {
                            if let Err(e) = swarm.dial(addr.clone()) {
                                debug!(%addr, err = ?e, "dial failed");
                            }
                        }
                        NetCommand::Request { peer, addr_hint, strict, request, reply } => {
                            if let Some(addr) = addr_hint {
                                if !connected.contains(&peer) {
                                    if strict {
                                        strict_dials.mark(peer);
                                    }
                                    // Feed the address book so the pending
                                    // request's own dial can succeed too.
                                    swarm.behaviour_mut().kad.add_address(&peer, addr.clone());
                                    let _ = swarm.dial(addr);
                                }
                            }
                            let envelope = RequestEnvelope(encode_request(&request));
                            let id = swarm.behaviour_mut().rpc.send_request(&peer, envelope);
                            pending_requests.insert(id, reply);
                        }
                        NetCommand::Disconnect { peer } => {
                            let _ = swarm.disconnect_peer_id(peer);
                        }
                        NetCommand::Publish { topic, payload } => {
                            let t = IdentTopic::new(topic);
                            if let Err(e) = swarm.behaviour_mut().gossipsub.publish(t, payload) {
                                debug!(err = ?e, "gossipsub publish failed");
                            }
                        }
                        NetCommand::PutRecord { key, value } => {
                            let record = kad::Record::new(key.into_bytes(), value);
                            if let Err(e) = swarm
                                .behaviour_mut()
                                .kad
                                .put_record(record, kad::Quorum::One)
                            {
                                debug!(err = ?e, "kad put_record failed");
                            }
                        }
                        NetCommand::GetRecord { key, reply } => {
                            let qid = swarm
                                .behaviour_mut()
                                .kad
                                .get_record(kad::RecordKey::new(&key));
                            pending_gets.insert(qid, (reply, Vec::new()));
                        }
                        NetCommand::RemoveRecord { key } => {
                            swarm
                                .behaviour_mut()
                                .kad
                                .remove_record(&kad::RecordKey::new(&key));
                        }
                        NetCommand::ConnectedPeers { reply } => {
                            let _ = reply.send(connected.iter().copied().collect());
                        }
                        NetCommand::Shutdown => {
                            info!("p2p task stopping");
                            break;
                        }
                    }
                }

                maybe_resp = resp_rx.recv() => {
                    if let Some((channel, resp)) = maybe_resp {
                        match resp {
                            Some(resp) => {
                                if swarm.behaviour_mut().rpc.send_response(channel, resp).is_err() {
                                    debug!("response channel gone before send");
                                }
                            }
                            // Rate limited: close the stream without a body.
                            None => drop(channel),
                        }
                    }
                }

                ev = swarm.select_next_some() => {
                    match ev {
                        SwarmEvent::NewListenAddr { address, .. } => {
                            info!(addr = %address, "listening");
                            let _ = ev_tx.send(P2pEvent::Listening(address)).await;
                        }

                        SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                            if connected.insert(peer_id) {
                                metrics.p2p_peers.set(connected.len() as i64);
                                let _ = ev_tx.send(P2pEvent::PeerConnected(peer_id)).await;
                                info!(%peer_id, "peer connected");
                            }
                        }

                        SwarmEvent::ConnectionClosed { peer_id, num_established, .. } => {
                            if num_established == 0 {
                                strict_dials.clear(&peer_id);
                                if connected.remove(&peer_id) {
                                    metrics.p2p_peers.set(connected.len() as i64);
                                    let _ = ev_tx.send(P2pEvent::PeerDisconnected(peer_id)).await;
                                    info!(%peer_id, "peer disconnected");
                                }
                            }
                        }

                        SwarmEvent::Behaviour(BehaviourEvent::Gossipsub(gossipsub::Event::Message {
                            propagation_source,
                            message,
                            ..
                        })) => {
                            let _ = ev_tx
                                .send(P2pEvent::Gossip {
                                    topic: message.topic.to_string(),
                                    source: propagation_source,
                                    data: message.data,
                                })
                                .await;
                        }

                        SwarmEvent::Behaviour(BehaviourEvent::Rpc(ev)) => {
                            handle_rpc_event(
                                ev,
                                &server,
                                &resp_tx,
                                &mut pending_requests,
                                &metrics,
                            );
                        }

                        SwarmEvent::Behaviour(BehaviourEvent::Kad(ev)) => {
                            handle_kad_event(ev, &mut pending_gets);
                        }

                        SwarmEvent::Behaviour(BehaviourEvent::Identify(ev)) => {
                            if let identify::Event::Received { peer_id, info } = *ev {
                                for addr in info.listen_addrs {
                                    swarm.behaviour_mut().kad.add_address(&peer_id, addr);
                                }
                            }
                        }

                        SwarmEvent::Behaviour(BehaviourEvent::Gossipsub(_)) => {}
                        SwarmEvent::Behaviour(BehaviourEvent::Ping(_)) => {}

                        _ => {}
                    }
                }
            }
        }
    });

    Ok((client, ev_rx, join))
}

fn handle_rpc_event(
    ev: request_response::Event<RequestEnvelope, Response>,
    server: &Arc<ProtocolServer>,
    resp_tx: &mpsc::Sender<(ResponseChannel<Response>, Option<Response>)>,
    pending: &mut HashMap<OutboundRequestId, oneshot::Sender<Result<Response, NetError>>>,
    metrics: &Arc<Metrics>,
) {
    match ev {
        request_response::Event::Message { peer, message } => match message {
            request_response::Message::Request { request, channel, .. } => {
                let server = Arc::clone(server);
                let resp_tx = resp_tx.clone();
                tokio::spawn(async move {
                    let resp = server.handle(peer, request).await;
                    let _ = resp_tx.send((channel, resp)).await;
                });
            }
            request_response::Message::Response { request_id, response } => {
                if let Some(reply) = pending.remove(&request_id) {
                    let _ = reply.send(Ok(response));
                }
            }
        },
        request_response::Event::OutboundFailure { request_id, error, peer } => {
            debug!(%peer, err = %error, "outbound request failed");
            if let Some(reply) = pending.remove(&request_id) {
                let err = match error {
                    request_response::OutboundFailure::Timeout => NetError::Timeout,
                    request_response::OutboundFailure::DialFailure => NetError::Unreachable,
                    _ => NetError::Closed,
                };
                let _ = reply.send(Err(err));
            }
        }
        request_response::Event::InboundFailure { peer, error, .. } => {
            metrics.invalid_msg_total.inc();
            debug!(%peer, err = %error, "inbound request failed");
        }
        request_response::Event::ResponseSent { .. } => {}
    }
}

fn handle_kad_event(
    ev: kad::Event,
    pending_gets: &mut HashMap<kad::QueryId, (oneshot::Sender<Vec<Vec<u8>>>, Vec<Vec<u8>>)>,
) {
    if let kad::Event::OutboundQueryProgressed { id, result, step, .. } = ev {
        match result {
            kad::QueryResult::GetRecord(Ok(kad::GetRecordOk::FoundRecord(rec))) => {
                if let Some((_, values)) = pending_gets.get_mut(&id) {
                    values.push(rec.record.value);
                }
                if step.last {
                    if let Some((reply, values)) = pending_gets.remove(&id) {
                        let _ = reply.send(values);
                    }
                }
            }
            kad::QueryResult::GetRecord(Ok(kad::GetRecordOk::FinishedWithNoAdditionalRecord {
                ..
            }))
            | kad::QueryResult::GetRecord(Err(_)) => {
                if let Some((reply, values)) = pending_gets.remove(&id) {
                    let _ = reply.send(values);
                }
            }
            kad::QueryResult::PutRecord(Err(e)) => {
                debug!(err = ?e, "kad put failed");
            }
            _ => {}
        }
    }
}
