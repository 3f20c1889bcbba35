//! Data-transfer publication transport.
//!
//! A libp2p swarm (TCP + Noise + Mplex) with two behaviours: gossipsub,
//! announcing `{head, addrs}` on the configured topic whenever the head
//! advances, and the `/herald/adsync/1.0.0` pull protocol serving the head
//! and DAG blocks to syncing indexers. Every block read goes through the
//! link system, so syncers get content-verified bytes.

use std::collections::HashSet;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use cid::Cid;
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use futures::StreamExt;
use libp2p::swarm::{NetworkBehaviour, SwarmEvent};
use libp2p::{gossipsub, noise, request_response, tcp, Multiaddr, PeerId, StreamProtocol, Swarm, SwarmBuilder};
use libp2p_mplex as mplex;
use prost::Message as ProstMessage;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::link::{LinkError, LinkSystem};
use crate::metrics::Metrics;
use crate::publisher::{PublishError, Publisher};

pub const ADSYNC_PROTOCOL: &str = "/herald/adsync/1.0.0";

/// Upper bound on a sync message, requests included.
const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(300);

/// Gossip message announcing a new chain head.
#[derive(Clone, PartialEq, prost::Message)]
pub struct HeadAnnounce {
    #[prost(bytes = "vec", tag = "1")]
    pub head: Vec<u8>,

    #[prost(string, repeated, tag = "2")]
    pub addrs: Vec<String>,
}

/// Pull request: `cid` absent asks for the current head.
#[derive(Clone, PartialEq, prost::Message)]
pub struct SyncRequest {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub cid: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SyncResponse {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub head: Option<Vec<u8>>,

    #[prost(bytes = "vec", optional, tag = "2")]
    pub block: Option<Vec<u8>>,
}

/// Who may pull the advertisement DAG from this node.
#[derive(Debug, Clone)]
pub struct SyncPolicy {
    /// Base rule: allow everyone (`true`) or no one (`false`).
    pub allow: bool,
    /// Peers exempted from the base rule.
    pub except: HashSet<PeerId>,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            allow: true,
            except: HashSet::new(),
        }
    }
}

impl SyncPolicy {
    pub fn allows(&self, peer: &PeerId) -> bool {
        if self.except.contains(peer) {
            !self.allow
        } else {
            self.allow
        }
    }
}

/// Length-prefixed prost codec for the adsync protocol.
#[derive(Clone, Default)]
struct AdSyncCodec;

async fn read_framed<T>(io: &mut T) -> io::Result<Vec<u8>>
where
    T: AsyncRead + Unpin + Send,
{
    let mut len_bytes = [0u8; 4];
    io.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "adsync message too large",
        ));
    }
    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn write_framed<T>(io: &mut T, bytes: &[u8]) -> io::Result<()>
where
    T: AsyncWrite + Unpin + Send,
{
    let len = u32::try_from(bytes.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "adsync message too large"))?;
    io.write_all(&len.to_be_bytes()).await?;
    io.write_all(bytes).await?;
    io.flush().await
}

#[async_trait]
impl request_response::Codec for AdSyncCodec {
    type Protocol = StreamProtocol;
    type Request = SyncRequest;
    type Response = SyncResponse;

    async fn read_request<T>(&mut self, _: &Self::Protocol, io: &mut T) -> io::Result<Self::Request>
    where
        T: AsyncRead + Unpin + Send,
    {
        let buf = read_framed(io).await?;
        SyncRequest::decode(buf.as_slice())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    async fn read_response<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
    ) -> io::Result<Self::Response>
    where
        T: AsyncRead + Unpin + Send,
    {
        let buf = read_framed(io).await?;
        SyncResponse::decode(buf.as_slice())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    async fn write_request<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
        req: Self::Request,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_framed(io, &req.encode_to_vec()).await
    }

    async fn write_response<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
        resp: Self::Response,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_framed(io, &resp.encode_to_vec()).await
    }
}

#[derive(NetworkBehaviour)]
struct Behaviour {
    gossipsub: gossipsub::Behaviour,
    adsync: request_response::Behaviour<AdSyncCodec>,
}

enum Command {
    UpdateHead {
        head: Cid,
        done: oneshot::Sender<Result<(), PublishError>>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Gossip + pull-channel publisher.
pub struct DtSyncPublisher {
    cmd_tx: mpsc::Sender<Command>,
    local_peer_id: PeerId,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DtSyncPublisher {
    pub async fn new(
        key: libp2p::identity::Keypair,
        links: LinkSystem,
        topic: String,
        listen_addrs: Vec<Multiaddr>,
        announce_addrs: Vec<String>,
        policy: SyncPolicy,
        metrics: Metrics,
    ) -> Result<Self, PublishError> {
        let local_peer_id = PeerId::from(key.public());

        let mplex_config = || {
            let mut cfg = mplex::MplexConfig::default();
            cfg.set_max_buffer_size(usize::MAX);
            cfg.set_split_send_size(16 * 1024);
            cfg
        };

        let mut swarm = SwarmBuilder::with_existing_identity(key.clone())
            .with_tokio()
            .with_tcp(
                tcp::Config::default().nodelay(true),
                noise::Config::new,
                mplex_config,
            )
            .map_err(|e| PublishError::Transport(e.to_string()))?
            .with_behaviour(|key| {
                let gossipsub = gossipsub::Behaviour::new(
                    gossipsub::MessageAuthenticity::Signed(key.clone()),
                    gossipsub::Config::default(),
                )?;
                let adsync = request_response::Behaviour::with_codec(
                    AdSyncCodec,
                    std::iter::once((
                        StreamProtocol::new(ADSYNC_PROTOCOL),
                        request_response::ProtocolSupport::Full,
                    )),
                    request_response::Config::default(),
                );
                Ok(Behaviour { gossipsub, adsync })
            })
            .map_err(|e| PublishError::Transport(e.to_string()))?
            .with_swarm_config(|c| c.with_idle_connection_timeout(IDLE_CONNECTION_TIMEOUT))
            .build();

        let ident_topic = gossipsub::IdentTopic::new(topic.clone());
        swarm
            .behaviour_mut()
            .gossipsub
            .subscribe(&ident_topic)
            .map_err(|e| PublishError::Gossip(e.to_string()))?;

        for addr in &listen_addrs {
            swarm
                .listen_on(addr.clone())
                .map_err(|e| PublishError::Transport(e.to_string()))?;
        }

        info!(
            "dtsync publisher on topic {} with peer ID {}",
            topic, local_peer_id
        );

        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let server = SyncServer {
            swarm,
            links,
            topic: ident_topic,
            head: None,
            announce_addrs,
            policy,
            metrics,
            cmd_rx,
        };
        let task = tokio::spawn(server.run());

        Ok(Self {
            cmd_tx,
            local_peer_id,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }
}

#[async_trait]
impl Publisher for DtSyncPublisher {
    async fn update_head(&self, head: Cid) -> Result<(), PublishError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::UpdateHead {
                head,
                done: done_tx,
            })
            .await
            .map_err(|_| PublishError::NotRunning)?;
        done_rx.await.map_err(|_| PublishError::NotRunning)?
    }

    async fn shutdown(&self) -> Result<(), PublishError> {
        let mut task = self.task.lock().await;
        if let Some(handle) = task.take() {
            let (done_tx, done_rx) = oneshot::channel();
            if self
                .cmd_tx
                .send(Command::Shutdown { done: done_tx })
                .await
                .is_ok()
            {
                let _ = done_rx.await;
            }
            handle.abort();
        }
        Ok(())
    }
}

/// Owns the swarm; the only task that touches it.
struct SyncServer {
    swarm: Swarm<Behaviour>,
    links: LinkSystem,
    topic: gossipsub::IdentTopic,
    head: Option<Cid>,
    announce_addrs: Vec<String>,
    policy: SyncPolicy,
    metrics: Metrics,
    cmd_rx: mpsc::Receiver<Command>,
}

impl SyncServer {
    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(Command::UpdateHead { head, done }) => {
                            let result = self.publish_head(head);
                            let _ = done.send(result);
                        }
                        Some(Command::Shutdown { done }) => {
                            let _ = done.send(());
                            break;
                        }
                        None => break,
                    }
                }
                event = self.swarm.select_next_some() => {
                    self.handle_swarm_event(event).await;
                }
            }
        }
        debug!("dtsync publisher stopped");
    }

    fn publish_head(&mut self, head: Cid) -> Result<(), PublishError> {
        self.head = Some(head);
        let announce = HeadAnnounce {
            head: head.to_bytes(),
            addrs: self.announce_addrs.clone(),
        };
        match self
            .swarm
            .behaviour_mut()
            .gossipsub
            .publish(self.topic.clone(), announce.encode_to_vec())
        {
            Ok(_) => {
                debug!("announced head {} on {}", head, self.topic);
                Ok(())
            }
            // Nobody subscribed yet: indexers will still find the head via
            // direct announcements or a pull.
            Err(gossipsub::PublishError::InsufficientPeers) => {
                debug!("no gossip peers for head {}", head);
                Ok(())
            }
            Err(err) => Err(PublishError::Gossip(err.to_string())),
        }
    }

    async fn handle_swarm_event(&mut self, event: SwarmEvent<BehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!("dtsync listening on {}", address);
            }
            SwarmEvent::Behaviour(BehaviourEvent::Adsync(request_response::Event::Message {
                peer,
                message: request_response::Message::Request { request, channel, .. },
            })) => {
                let response = self.serve(&peer, request).await;
                if self
                    .swarm
                    .behaviour_mut()
                    .adsync
                    .send_response(channel, response)
                    .is_err()
                {
                    debug!("sync peer {} went away before response", peer);
                }
            }
            SwarmEvent::Behaviour(BehaviourEvent::Gossipsub(gossipsub::Event::Subscribed {
                peer_id,
                topic,
            })) => {
                debug!("peer {} subscribed to {}", peer_id, topic);
            }
            SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                debug!("connected to {}", peer_id);
            }
            SwarmEvent::ConnectionClosed { peer_id, cause, .. } => {
                debug!("connection closed with {}: {:?}", peer_id, cause);
            }
            _ => {}
        }
    }

    async fn serve(&mut self, peer: &PeerId, request: SyncRequest) -> SyncResponse {
        if !self.policy.allows(peer) {
            warn!("sync policy rejected pull from {}", peer);
            return SyncResponse {
                head: None,
                block: None,
            };
        }

        match request.cid {
            None => {
                self.metrics.head_request();
                SyncResponse {
                    head: self.head.map(|c| c.to_bytes()),
                    block: None,
                }
            }
            Some(cid_bytes) => {
                let cid = match Cid::try_from(cid_bytes.as_slice()) {
                    Ok(cid) => cid,
                    Err(_) => {
                        return SyncResponse {
                            head: None,
                            block: None,
                        }
                    }
                };
                match self.links.load(&cid).await {
                    Ok(bytes) => {
                        self.metrics.block_served();
                        SyncResponse {
                            head: None,
                            block: Some(bytes),
                        }
                    }
                    Err(LinkError::NotFound(_)) => SyncResponse {
                        head: None,
                        block: None,
                    },
                    Err(err) => {
                        warn!("failed to serve {} to {}: {}", cid, peer, err);
                        SyncResponse {
                            head: None,
                            block: None,
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::MemDatastore;

    #[test]
    fn test_sync_policy_allow_all() {
        let policy = SyncPolicy::default();
        assert!(policy.allows(&PeerId::random()));
    }

    #[test]
    fn test_sync_policy_except_inverts_base_rule() {
        let blocked = PeerId::random();
        let policy = SyncPolicy {
            allow: true,
            except: [blocked].into_iter().collect(),
        };
        assert!(!policy.allows(&blocked));
        assert!(policy.allows(&PeerId::random()));

        let allowed = PeerId::random();
        let policy = SyncPolicy {
            allow: false,
            except: [allowed].into_iter().collect(),
        };
        assert!(policy.allows(&allowed));
        assert!(!policy.allows(&PeerId::random()));
    }

    #[test]
    fn test_sync_messages_roundtrip() {
        let req = SyncRequest {
            cid: Some(b"some cid bytes".to_vec()),
        };
        let decoded = SyncRequest::decode(req.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded, req);

        let resp = SyncResponse {
            head: None,
            block: Some(b"block".to_vec()),
        };
        let decoded = SyncResponse::decode(resp.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded, resp);
    }

    #[tokio::test]
    async fn test_publisher_starts_and_updates_head() {
        let links = LinkSystem::new(MemDatastore::shared());
        let key = libp2p::identity::Keypair::generate_ed25519();
        let publisher = DtSyncPublisher::new(
            key,
            links.clone(),
            "/herald/test".to_string(),
            vec!["/ip4/127.0.0.1/tcp/0".parse().unwrap()],
            vec!["/ip4/127.0.0.1/tcp/9000".to_string()],
            SyncPolicy::default(),
            Metrics::new(),
        )
        .await
        .unwrap();

        let head = links.store(crate::link::AD_CODEC, b"an ad").await.unwrap();
        publisher.update_head(head).await.unwrap();

        publisher.shutdown().await.unwrap();
    }
}
