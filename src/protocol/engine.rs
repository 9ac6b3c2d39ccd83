use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use tracing::debug;

use crate::protocol::members::MemberTable;
use crate::protocol::types::{
    Event, Memo, MemoId, Message, NodeId, Outgoing, Packet, PacketKind, Status,
};
use crate::queue::RecurrentQueue;

/// Dissemination scaling constant. A message is popped ⌈λ·ln n⌉ times before
/// eviction, and a suspect survives that many periods before being declared
/// failed; both ride the Θ(log n) epidemic-spread timescale.
const LAMBDA: f64 = 2.0;

/// Everything an engine operation produced: packets to transmit, events to
/// deliver to the host, and whether the engine has observed its own death
/// notice and refuses further participation.
#[derive(Debug, Default)]
pub struct Step {
    pub packets: Vec<Outgoing>,
    pub events: Vec<Event>,
    pub terminal: bool,
}

/// The SWIM protocol state machine. Pure: a function of its prior state, its
/// inputs, and the injected random generator. All I/O and timing live in the
/// driver.
#[derive(Debug)]
pub struct Engine<R: Rng> {
    id: NodeId,
    incarnation: u64,

    table: MemberTable,
    msg_queue: RecurrentQueue<NodeId, Message>,
    memo_queue: RecurrentQueue<MemoId, Message>,
    seen_memos: HashSet<MemoId>,

    ping_target: Option<NodeId>,
    got_ack: bool,
    ping_reqs: HashMap<NodeId, NodeId>,

    n_ping_reqs: usize,
    max_msgs: usize,
    period: u64,
    rng: R,
}

impl<R: Rng> Engine<R> {
    pub fn new(id: NodeId, n_ping_reqs: usize, max_msgs: usize, rng: R) -> Self {
        Engine {
            id,
            incarnation: 0,
            table: MemberTable::new(),
            msg_queue: RecurrentQueue::new(),
            memo_queue: RecurrentQueue::new(),
            seen_memos: HashSet::new(),
            ping_target: None,
            got_ack: false,
            ping_reqs: HashMap::new(),
            n_ping_reqs,
            max_msgs,
            period: 0,
            rng,
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn incarnation(&self) -> u64 {
        self.incarnation
    }

    pub fn member_count(&self) -> usize {
        self.table.len()
    }

    /// Snapshot of the current live membership (excluding ourselves).
    pub fn members(&self) -> Vec<(NodeId, SocketAddr)> {
        self.table.snapshot()
    }

    /// The dissemination factor D(n) = ⌈λ·ln n⌉ with n counting ourselves.
    /// Serves as both the queue quota and the suspicion timeout.
    fn dissemination_factor(&self) -> u32 {
        let n = (self.table.len() + 1) as f64;
        (LAMBDA * n.ln()).ceil() as u32
    }

    // ============================================================
    // PROTOCOL PERIOD
    // ============================================================

    /// Begins a new protocol period: settles suspicion timeouts and the
    /// previous period's probe, then selects and pings the next target.
    pub fn tick(&mut self) -> Step {
        let mut step = Step::default();
        self.period += 1;
        self.table.expire_dismissed(self.period);

        // Suspicion timeouts.
        let timeout = self.dissemination_factor();
        for id in self.table.advance_suspects(timeout) {
            debug!(node = %id, "suspicion timed out, declaring failed");
            let msg = self.failed_message(&id);
            self.msg_queue.upsert(Some(id.clone()), msg.clone());
            if let Some(profile) = self.table.profile(&id) {
                step.packets.push(message_ping(profile.addr, msg));
            }
            self.table.remove(&id, self.period);
            step.events.push(Event::Failed { id });
        }

        // The previous period's target never acked.
        if !self.got_ack
            && let Some(target) = self.ping_target.clone()
            && self.table.is_member(&target)
        {
            debug!(node = %target, "probe expired, suspecting");
            self.table.mark_suspect_if_new(&target);
            let msg = self.suspected_message(&target);
            self.msg_queue.upsert(Some(target.clone()), msg.clone());
            if let Some(profile) = self.table.profile(&target) {
                step.packets.push(message_ping(profile.addr, msg));
            }
        }

        self.got_ack = false;
        self.ping_reqs.clear();

        self.ping_target = self.table.next_target(&mut self.rng);
        if let Some(target) = self.ping_target.clone()
            && let Some(addr) = self.table.profile(&target).map(|p| p.addr)
        {
            let packet = self.assemble(PacketKind::Ping, &target, None);
            step.packets.push(Outgoing { addr, packet });
        }
        step
    }

    /// Produces indirect probes if the current target has not acked by the
    /// ping timeout; otherwise nothing.
    pub fn timeout(&mut self) -> Vec<Outgoing> {
        if self.got_ack {
            return Vec::new();
        }
        let Some(target) = self.ping_target.clone() else {
            return Vec::new();
        };
        let Some(target_addr) = self.table.profile(&target).map(|p| p.addr) else {
            return Vec::new();
        };
        let proxies = self.table.sample(self.n_ping_reqs, &target, &mut self.rng);
        let mut out = Vec::new();
        for proxy in proxies {
            let Some(addr) = self.table.profile(&proxy).map(|p| p.addr) else {
                continue;
            };
            let packet = self.assemble(
                PacketKind::PingReq,
                &proxy,
                Some((target.clone(), target_addr)),
            );
            out.push(Outgoing { addr, packet });
        }
        out
    }

    // ============================================================
    // PACKET ARRIVAL
    // ============================================================

    /// Processes an incoming packet: applies its piggybacked messages, then
    /// answers according to the packet kind.
    pub fn receive(&mut self, from: &NodeId, src: SocketAddr, mut packet: Packet) -> Step {
        let mut step = Step::default();
        if self.table.is_dismissed(from) {
            debug!(node = %from, "dropping packet from dismissed sender");
            return step;
        }

        for msg in &mut packet.msgs {
            if msg.addr.is_none() {
                msg.addr = Some(src);
            }
        }

        for msg in &packet.msgs {
            if msg.node == self.id {
                match msg.status {
                    Status::Suspected if msg.incarnation == self.incarnation => {
                        // Refute: only we may advance our incarnation.
                        self.incarnation = self.incarnation.saturating_add(1);
                        debug!(incarnation = self.incarnation, "refuting suspicion");
                        let alive = self.alive_message();
                        self.msg_queue.upsert(Some(self.id.clone()), alive);
                    }
                    Status::Failed => {
                        step.terminal = true;
                        return step;
                    }
                    _ => {}
                }
                continue;
            }

            if self.is_news(msg) {
                self.msg_queue.upsert(Some(msg.node.clone()), msg.stripped());
                if let Some(event) = self.apply(msg) {
                    step.events.push(event);
                }
            }

            // Memos are accepted independently of membership news, but only
            // from current members, and only once.
            if let Some(memo) = &msg.memo
                && !self.seen_memos.contains(&memo.id)
                && let Some(addr) = self.table.profile(&msg.node).map(|p| p.addr)
            {
                self.seen_memos.insert(memo.id.clone());
                self.memo_queue.upsert(Some(memo.id.clone()), msg.clone());
                step.events.push(Event::Memo {
                    id: msg.node.clone(),
                    addr,
                    body: memo.body.clone(),
                });
            }
        }

        step.packets = self.respond(from, src, &packet);
        step
    }

    fn respond(&mut self, from: &NodeId, src: SocketAddr, packet: &Packet) -> Vec<Outgoing> {
        match packet.kind {
            PacketKind::Ping => {
                // Reply to the UDP source: a brand-new peer has no profile yet.
                let reply = self.assemble(PacketKind::Ack, from, None);
                vec![Outgoing {
                    addr: src,
                    packet: reply,
                }]
            }
            PacketKind::PingReq => {
                let Some(target) = packet.target.clone() else {
                    return Vec::new();
                };
                let addr = self
                    .table
                    .profile(&target)
                    .map(|p| p.addr)
                    .or(packet.target_addr);
                let Some(addr) = addr else {
                    return Vec::new();
                };
                self.ping_reqs.insert(from.clone(), target.clone());
                let packet = self.assemble(PacketKind::Ping, &target, None);
                vec![Outgoing { addr, packet }]
            }
            PacketKind::Ack => {
                if let Some(current) = &self.ping_target
                    && (current == from || packet.target.as_ref() == Some(current))
                {
                    self.got_ack = true;
                }
                // Forward the ack to anyone who asked us to probe this sender.
                let requestors: Vec<NodeId> = self
                    .ping_reqs
                    .iter()
                    .filter(|&(_, target)| target == from)
                    .map(|(requestor, _)| requestor.clone())
                    .collect();
                let mut out = Vec::new();
                for requestor in requestors {
                    self.ping_reqs.remove(&requestor);
                    let Some(addr) = self.table.profile(&requestor).map(|p| p.addr) else {
                        continue;
                    };
                    let target_addr = self
                        .table
                        .profile(from)
                        .map(|p| p.addr)
                        .unwrap_or(src);
                    let packet = self.assemble(
                        PacketKind::Ack,
                        &requestor,
                        Some((from.clone(), target_addr)),
                    );
                    out.push(Outgoing { addr, packet });
                }
                out
            }
        }
    }

    // ============================================================
    // NEWS & UPDATE APPLICATION
    // ============================================================

    /// Reports whether a message strictly supersedes our current knowledge
    /// of its subject.
    fn is_news(&self, msg: &Message) -> bool {
        if msg.node == self.id {
            return false;
        }
        if self.table.is_dismissed(&msg.node) {
            return false;
        }
        let Some(profile) = self.table.profile(&msg.node) else {
            return true;
        };
        match msg.status {
            Status::Failed => true,
            _ if msg.incarnation > profile.incarnation => true,
            Status::Suspected => {
                msg.incarnation == profile.incarnation && !self.table.is_suspect(&msg.node)
            }
            Status::Alive => false,
        }
    }

    /// Applies a news message to the member table and returns the resulting
    /// membership event, if any.
    fn apply(&mut self, msg: &Message) -> Option<Event> {
        let id = &msg.node;
        match msg.status {
            Status::Failed => {
                // An unknown subject is propagated but not admitted: no
                // table change and no event.
                self.table.remove(id, self.period).map(|_| {
                    debug!(node = %id, "peer reported failed");
                    Event::Failed { id: id.clone() }
                })
            }
            Status::Alive | Status::Suspected => {
                let addr = msg.addr?;
                let joined = if self.table.is_member(id) {
                    None
                } else {
                    debug!(node = %id, %addr, "peer joined");
                    self.table
                        .insert(id.clone(), msg.incarnation, addr, &mut self.rng);
                    Some(Event::Joined {
                        id: id.clone(),
                        addr,
                    })
                };
                if let Some(profile) = self.table.profile_mut(id) {
                    profile.incarnation = msg.incarnation;
                    profile.addr = addr;
                }
                match msg.status {
                    Status::Alive => self.table.clear_suspect(id),
                    _ => self.table.set_suspect(id),
                }
                joined
            }
        }
    }

    // ============================================================
    // LOCAL INPUTS
    // ============================================================

    /// Builds the introductory ping sent to a remote address when joining a
    /// network. The alive message carries no address; the receiver fills it
    /// in from the UDP source.
    pub fn join_packet(&mut self) -> Packet {
        Packet {
            kind: PacketKind::Ping,
            target: None,
            target_addr: None,
            msgs: vec![self.alive_message()],
        }
    }

    /// Queues a memo for dissemination on subsequent probe traffic.
    pub fn post_memo(&mut self, body: Vec<u8>) -> MemoId {
        let memo_id = MemoId::mint();
        self.seen_memos.insert(memo_id.clone());
        let mut msg = self.alive_message();
        msg.memo = Some(Memo {
            id: memo_id.clone(),
            body,
        });
        self.memo_queue.upsert(Some(memo_id.clone()), msg);
        memo_id
    }

    // ============================================================
    // PACKET ASSEMBLY
    // ============================================================

    /// Assembles an outgoing packet: an introductory alive on first contact,
    /// the top memo if one is queued, then membership news up to the
    /// per-packet message budget.
    fn assemble(
        &mut self,
        kind: PacketKind,
        dst: &NodeId,
        target: Option<(NodeId, SocketAddr)>,
    ) -> Packet {
        let mut msgs = Vec::new();
        let introduce = match self.table.profile_mut(dst) {
            Some(profile) if !profile.contacted => {
                profile.contacted = true;
                true
            }
            _ => false,
        };
        if introduce {
            msgs.push(self.alive_message());
        }
        let quota = self.dissemination_factor();
        if let Some(memo) = self.memo_queue.pop(quota) {
            msgs.push(memo);
        }
        let remaining = self.max_msgs.saturating_sub(msgs.len());
        msgs.extend(self.msg_queue.pop_n(remaining, quota));

        let (target, target_addr) = match target {
            Some((id, addr)) => (Some(id), Some(addr)),
            None => (None, None),
        };
        Packet {
            kind,
            target,
            target_addr,
            msgs,
        }
    }

    /// A message reporting ourselves alive at our current incarnation.
    fn alive_message(&self) -> Message {
        Message {
            status: Status::Alive,
            node: self.id.clone(),
            incarnation: self.incarnation,
            addr: None,
            memo: None,
        }
    }

    /// A message reporting a member as suspected at its recorded incarnation.
    fn suspected_message(&self, id: &NodeId) -> Message {
        Message {
            status: Status::Suspected,
            node: id.clone(),
            incarnation: self.table.profile(id).map_or(0, |p| p.incarnation),
            addr: self.table.profile(id).map(|p| p.addr),
            memo: None,
        }
    }

    /// A message reporting an id as failed. Incarnation is irrelevant:
    /// nothing supersedes a failure notice.
    fn failed_message(&self, id: &NodeId) -> Message {
        Message {
            status: Status::Failed,
            node: id.clone(),
            incarnation: 0,
            addr: self.table.profile(id).map(|p| p.addr),
            memo: None,
        }
    }

    #[cfg(test)]
    pub fn table(&self) -> &MemberTable {
        &self.table
    }

    #[cfg(test)]
    pub fn assert_invariants(&self) {
        self.table.assert_invariants(&self.id);
    }

    #[cfg(test)]
    pub fn ping_target(&self) -> Option<&NodeId> {
        self.ping_target.as_ref()
    }

    #[cfg(test)]
    pub fn quota(&self) -> u32 {
        self.dissemination_factor()
    }
}

/// A ping that exists to deliver a single message straight to its subject,
/// outside the normal assembly path.
fn message_ping(addr: SocketAddr, msg: Message) -> Outgoing {
    Outgoing {
        addr,
        packet: Packet {
            kind: PacketKind::Ping,
            target: None,
            target_addr: None,
            msgs: vec![msg],
        },
    }
}
