use anyhow::{Result, bail};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time;
use tracing::{debug, info, warn};

use crate::node::wire;
use crate::protocol::engine::Engine;
use crate::protocol::types::{Event, NodeId, Outgoing};

const TICK_AVERAGE: Duration = Duration::from_secs(1);
const PING_TIMEOUT: Duration = Duration::from_millis(200);
const N_PING_REQS: usize = 2;
const MAX_MSGS: usize = 6;
const MEMO_LIMIT: usize = 500;

/// Protocol tunables. The defaults match the reference timings; tests dial
/// the timers down to run scenarios in milliseconds.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to bind the UDP socket on; port 0 takes a system-assigned
    /// port.
    pub bind_addr: SocketAddr,
    /// Average protocol period. Each period is drawn uniformly within 10%
    /// of this to desynchronize the nodes.
    pub tick_average: Duration,
    /// How long to wait for an ack before falling back to indirect probes.
    pub ping_timeout: Duration,
    /// Number of members asked to probe an unresponsive target on our
    /// behalf.
    pub n_ping_reqs: usize,
    /// Maximum messages piggybacked per outgoing packet.
    pub max_msgs: usize,
    /// Maximum memo body size, chosen to keep dissemination single-datagram.
    pub memo_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            tick_average: TICK_AVERAGE,
            ping_timeout: PING_TIMEOUT,
            n_ping_reqs: N_PING_REQS,
            max_msgs: MAX_MSGS,
            memo_limit: MEMO_LIMIT,
        }
    }
}

type JoinHandler = Arc<dyn Fn(NodeId, SocketAddr) + Send + Sync>;
type MemoHandler = Arc<dyn Fn(NodeId, SocketAddr, Vec<u8>) + Send + Sync>;
type FailHandler = Arc<dyn Fn(NodeId) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    join: StdMutex<Option<JoinHandler>>,
    memo: StdMutex<Option<MemoHandler>>,
    fail: StdMutex<Option<FailHandler>>,
}

/// A network node running the SWIM protocol.
///
/// The node owns a UDP socket and two background loops: a receive loop
/// blocked on the socket and a tick loop driven by the period and ping
/// timers. Both feed the protocol engine, which is serialized behind a
/// mutex and performs no I/O of its own. Membership events are delivered to
/// the registered handlers on a dedicated dispatcher task, so per peer, a
/// join is observed before any of its memos, which are observed before its
/// failure.
pub struct Node {
    engine: Mutex<Engine<StdRng>>,
    socket: UdpSocket,
    id: NodeId,
    local_addr: SocketAddr,
    config: Config,
    events: StdMutex<Option<mpsc::UnboundedSender<Event>>>,
    handlers: Handlers,
    shutdown_tx: watch::Sender<bool>,
}

impl Node {
    /// Creates a node on a system-assigned UDP port and starts running the
    /// protocol.
    pub async fn start() -> Result<Arc<Node>> {
        Self::start_with_config(Config::default()).await
    }

    pub async fn start_with_config(config: Config) -> Result<Arc<Node>> {
        let socket = UdpSocket::bind(config.bind_addr).await?;
        let local_addr = socket.local_addr()?;
        let id = NodeId::mint();
        info!(id = %id, addr = %local_addr, "starting node");

        let engine = Engine::new(
            id.clone(),
            config.n_ping_reqs,
            config.max_msgs,
            StdRng::from_entropy(),
        );
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let node = Arc::new(Node {
            engine: Mutex::new(engine),
            socket,
            id,
            local_addr,
            config,
            events: StdMutex::new(Some(events_tx)),
            handlers: Handlers::default(),
            shutdown_tx,
        });

        tokio::spawn(node.clone().run_receive(shutdown_rx.clone()));
        tokio::spawn(node.clone().run_tick(shutdown_rx));
        tokio::spawn(dispatch(events_rx, node.clone()));

        Ok(node)
    }

    /// Connects to a remote node by sending a single ping carrying an
    /// introductory alive message about ourselves. This is how a new node
    /// enters an existing network.
    pub async fn join(&self, remote: SocketAddr) -> Result<()> {
        let packet = {
            let mut engine = self.engine.lock().await;
            engine.join_packet()
        };
        let bytes = wire::encode(&self.id, &packet)?;
        self.socket.send_to(&bytes, remote).await?;
        info!(%remote, "sent join ping");
        Ok(())
    }

    /// Queues an application memo for dissemination to every node in the
    /// network. Bodies above the memo limit are rejected.
    pub async fn post_memo(&self, body: impl Into<Vec<u8>>) -> Result<()> {
        let body = body.into();
        if body.len() > self.config.memo_limit {
            bail!(
                "memo body of {} bytes exceeds the {}-byte limit",
                body.len(),
                self.config.memo_limit
            );
        }
        self.engine.lock().await.post_memo(body);
        Ok(())
    }

    /// This node's id on the network.
    pub fn id(&self) -> NodeId {
        self.id.clone()
    }

    /// The bound UDP address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The current view of the live membership, excluding this node.
    pub async fn members(&self) -> Vec<(NodeId, SocketAddr)> {
        self.engine.lock().await.members()
    }

    /// Registers the handler called when a node joins the network,
    /// replacing any previous handler.
    pub fn on_join(&self, handler: impl Fn(NodeId, SocketAddr) + Send + Sync + 'static) {
        if let Ok(mut guard) = self.handlers.join.lock() {
            *guard = Some(Arc::new(handler));
        }
    }

    /// Registers the handler called when a node sends a memo, replacing any
    /// previous handler.
    pub fn on_memo(&self, handler: impl Fn(NodeId, SocketAddr, Vec<u8>) + Send + Sync + 'static) {
        if let Ok(mut guard) = self.handlers.memo.lock() {
            *guard = Some(Arc::new(handler));
        }
    }

    /// Registers the handler called when a node is declared failed,
    /// replacing any previous handler.
    pub fn on_fail(&self, handler: impl Fn(NodeId) + Send + Sync + 'static) {
        if let Ok(mut guard) = self.handlers.fail.lock() {
            *guard = Some(Arc::new(handler));
        }
    }

    /// Stops participating in the protocol. Peers will detect the departure
    /// through the failure detector; there is no goodbye message. The event
    /// stream closes after any already-queued events are dispatched.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Ok(mut events) = self.events.lock() {
            events.take();
        }
    }

    async fn run_receive(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut buf = vec![0u8; 65536];
        loop {
            let received = tokio::select! {
                _ = shutdown.changed() => return,
                received = self.socket.recv_from(&mut buf) => received,
            };
            match received {
                Ok((len, src)) => {
                    let (from, packet) = match wire::decode(&buf[..len]) {
                        Ok(decoded) => decoded,
                        Err(e) => {
                            debug!(%src, error = %e, "discarding malformed datagram");
                            continue;
                        }
                    };
                    let step = {
                        let mut engine = self.engine.lock().await;
                        engine.receive(&from, src, packet)
                    };
                    self.deliver(step.events);
                    self.transmit(step.packets).await;
                    if step.terminal {
                        info!("observed own failure notice, leaving the network");
                        self.shutdown();
                        return;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "failed to receive UDP packet");
                    time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn run_tick(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            let step = {
                let mut engine = self.engine.lock().await;
                engine.tick()
            };
            self.deliver(step.events);
            self.transmit(step.packets).await;

            let period = jittered(self.config.tick_average);

            // Single-shot ping timer; a no-op inside the engine if the ack
            // already arrived.
            tokio::select! {
                _ = time::sleep(self.config.ping_timeout) => {
                    let packets = {
                        let mut engine = self.engine.lock().await;
                        engine.timeout()
                    };
                    self.transmit(packets).await;
                }
                _ = shutdown.changed() => return,
            }
            tokio::select! {
                _ = time::sleep(period.saturating_sub(self.config.ping_timeout)) => {}
                _ = shutdown.changed() => return,
            }
        }
    }

    fn deliver(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        if let Ok(guard) = self.events.lock()
            && let Some(tx) = guard.as_ref()
        {
            for event in events {
                let _ = tx.send(event);
            }
        }
    }

    async fn transmit(&self, packets: Vec<Outgoing>) {
        for outgoing in packets {
            let bytes = match wire::encode(&self.id, &outgoing.packet) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(error = %e, "failed to encode packet");
                    continue;
                }
            };
            if let Err(e) = self.socket.send_to(&bytes, outgoing.addr).await {
                warn!(addr = %outgoing.addr, error = %e, "failed to send packet");
            }
        }
    }
}

async fn dispatch(mut events: mpsc::UnboundedReceiver<Event>, node: Arc<Node>) {
    while let Some(event) = events.recv().await {
        match event {
            Event::Joined { id, addr } => {
                let handler = node.handlers.join.lock().ok().and_then(|g| g.clone());
                if let Some(f) = handler {
                    f(id, addr);
                }
            }
            Event::Memo { id, addr, body } => {
                let handler = node.handlers.memo.lock().ok().and_then(|g| g.clone());
                if let Some(f) = handler {
                    f(id, addr, body);
                }
            }
            Event::Failed { id } => {
                let handler = node.handlers.fail.lock().ok().and_then(|g| g.clone());
                if let Some(f) = handler {
                    f(id);
                }
            }
        }
    }
}

// A tick period within 10% of the average, so the nodes' periods drift
// apart.
fn jittered(average: Duration) -> Duration {
    average.mul_f64(rand::thread_rng().gen_range(0.9..1.1))
}
