//! The pure, synchronous core of the protocol: one `SessionState` per
//! session, mutated in place by each operation, which returns the side
//! effects (`Effect`) the caller should run once the mutation is done. This
//! is the "transaction" half of the actor described in `session::actor` —
//! grounded in `haysel::dispatch::transport::ClientInterface::handle`, which
//! takes the same shape (`fn handle(&mut self, Packet) -> Vec<DispatchEvent>`).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::codec::{ConnectionHead, Frame, SessionId};
use crate::config::Config;
use crate::connection::{Connection, UnconfirmedPacket};
use crate::error::{HandshakeError, ProtocolError, SessionError};
use crate::sendqueue::{PendingPacket, SendRotation, SendingQueue};

/// A side effect the pure engine decided on but cannot perform itself (it
/// never touches a socket, a timer, or a callback directly).
#[derive(Debug, Clone)]
pub enum Effect {
    WriteFrame(u32, Frame),
    DetachConnectionIo(u32),
    Deliver(Vec<Vec<u8>>),
    ConnectionBusy(u32),
    ConnectionIdle(u32),
    Available,
    Unavailable,
    ShutDown,
    Interrupted,
}

/// outcome of resolving the connection id a retransmission frame addresses.
enum GhostOutcome {
    /// the connection is present (pre-existing or freshly synthesized).
    Ready,
    /// behind `lastConnectionId` and not tracked — already drained, ignore.
    AlreadyDrained,
    /// filling the gap up to this id would exceed `MaxConnectionsPerSession`.
    CapExceeded,
}

pub struct SessionState {
    session_id: SessionId,
    connections: HashMap<u32, Connection>,
    last_connection_id: Option<u32>,
    queue: SendingQueue,
    local_shutdown_requested: bool,
    shut_down: bool,
    interrupted: bool,
    config: Arc<Config>,
}

impl SessionState {
    pub fn new(session_id: SessionId, config: Arc<Config>) -> Self {
        Self {
            session_id,
            connections: HashMap::new(),
            last_connection_id: None,
            queue: SendingQueue::new_offline(),
            local_shutdown_requested: false,
            shut_down: false,
            interrupted: false,
            config,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn connection(&self, id: u32) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn open_connection_count(&self) -> usize {
        self.connections.values().filter(|c| c.attached).count()
    }

    pub fn connection_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.connections.keys().copied()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted
    }

    /// the id the client side should assign to the next connection it opens.
    pub fn next_connection_id(&self) -> u32 {
        self.last_connection_id.map_or(0, |last| last.wrapping_add(1))
    }

    fn bump_last_connection_id(&mut self, id: u32) {
        self.last_connection_id = Some(self.last_connection_id.map_or(id, |last| last.max(id)));
    }

    /// application-level `send()`: queues a message for delivery, picking an
    /// open connection to carry it or buffering it offline.
    pub fn enqueue(&mut self, buffers: Vec<Vec<u8>>) -> Vec<Effect> {
        self.enqueue_pending(PendingPacket::Data(buffers))
    }

    fn enqueue_pending(&mut self, pending: PendingPacket) -> Vec<Effect> {
        match &mut self.queue {
            SendingQueue::Online(rotation) => {
                if let Some(target) = rotation.pick() {
                    let conn = self.connections.get_mut(&target).expect("rotation entry implies connection");
                    let pack_id = conn.next_send_pack_id;
                    conn.next_send_pack_id += 1;
                    let packet = match pending {
                        PendingPacket::Data(buffers) => UnconfirmedPacket::Data {
                            origin_conn: target,
                            pack_id,
                            buffers,
                        },
                        PendingPacket::Finish => UnconfirmedPacket::Finish {
                            origin_conn: target,
                            pack_id,
                        },
                    };
                    let was_idle = conn.unconfirmed.is_empty();
                    conn.unconfirmed.push_back(packet.clone());
                    rotation.set_all_confirmed(target, false);
                    let mut effects = vec![Effect::WriteFrame(target, packet.to_frame(target))];
                    if was_idle {
                        effects.push(Effect::ConnectionBusy(target));
                    }
                    effects
                } else {
                    self.queue = SendingQueue::Offline(VecDeque::from([pending]));
                    vec![Effect::Unavailable]
                }
            }
            SendingQueue::Offline(pending_queue) => {
                pending_queue.push_back(pending);
                if pending_queue.len() > self.config.max_offline_pack {
                    let err = SessionError::OfflineQueueOverflow(self.config.max_offline_pack);
                    warn!(session = %self.session_id, %err, "escalating to internal_interrupt");
                    return self.internal_interrupt();
                }
                Vec::new()
            }
        }
    }

    /// discards every connection, counter and pending send this session
    /// holds, as if it had just been constructed — the full restart
    /// `isRenew=true` instructs. Returns effects detaching the io task of any
    /// connection that still had a live stream.
    fn renew(&mut self) -> Vec<Effect> {
        let effects = self
            .connections
            .values()
            .filter(|c| c.attached)
            .map(|c| Effect::DetachConnectionIo(c.id))
            .collect();
        self.connections.clear();
        self.last_connection_id = None;
        self.queue = SendingQueue::new_offline();
        effects
    }

    /// attaches a physical stream (fresh handshake or a renew) to this
    /// session, flushing any offline-buffered sends onto it. Implements the
    /// server-side `addStream` safeguards: a handshake for a slot already
    /// backed by a live stream, or one that would overflow the connection
    /// caps, rejects just this stream; a connection id behind
    /// `lastConnectionId` is trusted to never happen from a well-behaved
    /// peer and escalates to a whole-session interrupt; a forward gap is
    /// filled with ghost connections the same way an out-of-order
    /// retransmission would.
    pub fn add_stream(&mut self, head: ConnectionHead) -> Result<(Vec<Effect>, u32), HandshakeError> {
        let conn_id = head.connection_id;
        let mut reset_effects = Vec::new();
        if head.is_renew {
            reset_effects = self.renew();
            self.connections.insert(conn_id, Connection::new(conn_id));
        } else if let Some(existing) = self.connections.get(&conn_id) {
            if existing.attached {
                return Err(HandshakeError::DuplicateConnection(conn_id));
            }
            // ghost slot waiting for exactly this handshake: reuse it in place.
        } else {
            if self.last_connection_id.is_some_and(|last| conn_id <= last) {
                return Err(SessionError::ConnectionIdRegression(conn_id, self.last_connection_id.unwrap_or(0)).into());
            }
            if self.connections.len() >= self.config.max_connections_per_session as usize {
                return Err(HandshakeError::TooManyConnections(self.config.max_connections_per_session));
            }
            let active = self.connections.values().filter(|c| c.attached).count();
            if active >= self.config.max_active_connections_per_session as usize {
                return Err(HandshakeError::TooManyActiveConnections(
                    self.config.max_active_connections_per_session,
                ));
            }
            if let Some(last) = self.last_connection_id {
                for gap_id in last.wrapping_add(1)..conn_id {
                    self.connections.entry(gap_id).or_insert_with(|| Connection::new(gap_id));
                }
            }
            self.connections.insert(conn_id, Connection::new(conn_id));
        }
        self.bump_last_connection_id(conn_id);

        let conn = self.connections.get_mut(&conn_id).expect("just inserted or confirmed present above");
        conn.attached = true;

        if let SendingQueue::Offline(pending) = &mut self.queue {
            for item in pending.drain(..) {
                let pack_id = conn.next_send_pack_id;
                conn.next_send_pack_id += 1;
                let packet = match item {
                    PendingPacket::Data(buffers) => UnconfirmedPacket::Data {
                        origin_conn: conn_id,
                        pack_id,
                        buffers,
                    },
                    PendingPacket::Finish => UnconfirmedPacket::Finish {
                        origin_conn: conn_id,
                        pack_id,
                    },
                };
                conn.unconfirmed.push_back(packet);
            }
            let mut rotation = SendRotation::new();
            rotation.insert(conn_id, conn.unconfirmed.is_empty());
            self.queue = SendingQueue::Online(rotation);
        } else if let SendingQueue::Online(rotation) = &mut self.queue {
            rotation.insert(conn_id, conn.unconfirmed.is_empty());
        }

        let mut effects = reset_effects;
        effects.extend(conn.unconfirmed.iter().map(|p| Effect::WriteFrame(conn_id, p.to_frame(conn_id))));
        if !conn.unconfirmed.is_empty() {
            effects.push(Effect::ConnectionBusy(conn_id));
        }
        effects.push(Effect::Available);
        Ok((effects, conn_id))
    }

    /// dispatches one received frame. Every `AcknowledgeRequired` kind
    /// (`Frame::requires_ack`) gets its `Acknowledge` written back as the
    /// very first effect, ahead of whatever the per-kind handler decides —
    /// spec.md §4.1/§4.3: ack latency must never be coupled to
    /// application-level processing (`Effect::Deliver` awaits the
    /// `received()` callback; `cleanup` can cascade into retransmissions).
    pub fn handle_frame_received(&mut self, arrival_conn_id: u32, frame: Frame) -> Vec<Effect> {
        let mut effects = if frame.requires_ack() {
            self.ack_arrival(arrival_conn_id)
        } else {
            Vec::new()
        };
        effects.extend(match frame {
            Frame::HeartBeat => Vec::new(),
            Frame::Data(buffers) => self.handle_data(arrival_conn_id, buffers),
            Frame::Acknowledge => self.handle_acknowledge(arrival_conn_id),
            Frame::Finish => self.handle_finish(arrival_conn_id),
            Frame::RetransmissionData(origin, pack_id, buffers) => {
                self.handle_retransmission_data(origin, pack_id, buffers)
            }
            Frame::RetransmissionFinish(origin, pack_id) => self.handle_retransmission_finish(origin, pack_id),
            Frame::ShutDown => self.handle_remote_shutdown(),
        });
        effects
    }

    /// the `Acknowledge` for whatever physical connection a frame arrived
    /// on; `Vec::new()` if that connection is somehow no longer tracked.
    fn ack_arrival(&self, arrival_conn_id: u32) -> Vec<Effect> {
        if self.connections.contains_key(&arrival_conn_id) {
            vec![Effect::WriteFrame(arrival_conn_id, Frame::Acknowledge)]
        } else {
            Vec::new()
        }
    }

    fn handle_data(&mut self, conn_id: u32, buffers: Vec<Vec<u8>>) -> Vec<Effect> {
        let Some(conn) = self.connections.get_mut(&conn_id) else {
            return Vec::new();
        };
        let id = conn.num_data_received;
        conn.num_data_received += 1;
        let is_new = !conn.receive_id_set.contains(id);
        conn.receive_id_set.add(id);
        let mut effects = Vec::new();
        if is_new {
            effects.push(Effect::Deliver(buffers));
        }
        effects.extend(self.check_shutdown());
        effects
    }

    fn handle_acknowledge(&mut self, conn_id: u32) -> Vec<Effect> {
        let Some(conn) = self.connections.get_mut(&conn_id) else {
            return Vec::new();
        };
        let was_empty = conn.unconfirmed.is_empty();
        conn.unconfirmed.pop_front();
        let mut effects = Vec::new();
        if was_empty {
            let err = ProtocolError::UnexpectedAcknowledge;
            debug!(conn_id, %err, "ignoring");
        } else if conn.unconfirmed.is_empty() {
            if let SendingQueue::Online(rotation) = &mut self.queue {
                rotation.set_all_confirmed(conn_id, true);
            }
            effects.push(Effect::ConnectionIdle(conn_id));
        }
        effects.extend(self.check_shutdown());
        self.maybe_drop_connection(conn_id);
        effects
    }

    fn handle_finish(&mut self, conn_id: u32) -> Vec<Effect> {
        if !self.connections.contains_key(&conn_id) {
            return Vec::new();
        }
        let mut effects = Vec::new();
        let conn = self.connections.get_mut(&conn_id).expect("checked above");
        if conn.finish_id_received.is_some() {
            effects.extend(self.cleanup(conn_id));
            return effects;
        }
        conn.finish_id_received = Some(conn.num_data_received);
        let needs_local_finish = !conn.is_finish_sent;
        if needs_local_finish {
            effects.extend(self.send_finish_on(conn_id));
        }
        effects.extend(self.check_shutdown());
        self.maybe_drop_connection(conn_id);
        effects
    }

    fn handle_retransmission_data(&mut self, origin: u32, pack_id: u32, buffers: Vec<Vec<u8>>) -> Vec<Effect> {
        let mut effects = Vec::new();
        match self.ensure_ghost(origin) {
            GhostOutcome::AlreadyDrained => return effects,
            GhostOutcome::CapExceeded => {
                let err = SessionError::TooManyConnections(self.config.max_connections_per_session);
                warn!(session = %self.session_id, %err, "ghost connection would exceed the cap, escalating to internal_interrupt");
                effects.extend(self.internal_interrupt());
                return effects;
            }
            GhostOutcome::Ready => {}
        }
        let conn = self.connections.get_mut(&origin).expect("ensure_ghost guarantees presence");
        let is_new = !conn.receive_id_set.contains(pack_id);
        conn.receive_id_set.add(pack_id);
        if is_new {
            effects.push(Effect::Deliver(buffers));
        }
        effects.extend(self.check_shutdown());
        self.maybe_drop_connection(origin);
        effects
    }

    fn handle_retransmission_finish(&mut self, origin: u32, pack_id: u32) -> Vec<Effect> {
        let mut effects = Vec::new();
        match self.ensure_ghost(origin) {
            GhostOutcome::AlreadyDrained => return effects,
            GhostOutcome::CapExceeded => {
                let err = SessionError::TooManyConnections(self.config.max_connections_per_session);
                warn!(session = %self.session_id, %err, "ghost connection would exceed the cap, escalating to internal_interrupt");
                effects.extend(self.internal_interrupt());
                return effects;
            }
            GhostOutcome::Ready => {}
        }
        let conn = self.connections.get_mut(&origin).expect("ensure_ghost guarantees presence");
        match conn.finish_id_received {
            // AlreadyReceivedFinish: a second, differing RetransmissionFinish
            // for a connection already marked finished is a protocol error
            // scoped to that connection (spec.md §9 Open Question); an exact
            // repeat of the same one is treated as an idempotent no-op since
            // it was already fully handled by the first delivery.
            Some(existing) if existing != pack_id => {
                let err = ProtocolError::AlreadyReceivedFinish;
                warn!(conn_id = origin, %err, existing, pack_id, "conflicting finish id, cleaning up connection");
                effects.extend(self.cleanup(origin));
                return effects;
            }
            Some(_) => return effects,
            None => conn.finish_id_received = Some(pack_id),
        }
        // the peer only retransmits a Finish once it has given up on this
        // connection's original stream — run the same teardown a locally
        // detected failure would (spec.md §4.3's "cleanup that connection").
        effects.extend(self.cleanup(origin));
        effects
    }

    /// fills every id in `(lastConnectionId, id]` with a ghost `Connection`
    /// record, the way a retransmission referencing a connection whose
    /// handshake never arrived needs (spec.md §4.4). An id at or behind
    /// `lastConnectionId` that isn't already tracked was already fully
    /// drained and removed — safe to ignore rather than resurrect.
    fn ensure_ghost(&mut self, id: u32) -> GhostOutcome {
        if self.connections.contains_key(&id) {
            return GhostOutcome::Ready;
        }
        if self.last_connection_id.is_some_and(|last| id <= last) {
            return GhostOutcome::AlreadyDrained;
        }
        let gap_start = self.last_connection_id.map_or(0, |last| last.wrapping_add(1));
        let new_count = id.wrapping_sub(gap_start).wrapping_add(1) as usize;
        if new_count + self.connections.len() >= self.config.max_connections_per_session as usize {
            return GhostOutcome::CapExceeded;
        }
        for gap_id in gap_start..id {
            self.connections.entry(gap_id).or_insert_with(|| Connection::new(gap_id));
        }
        self.connections.insert(id, Connection::new(id));
        self.bump_last_connection_id(id);
        GhostOutcome::Ready
    }

    pub fn handle_connection_failed(&mut self, conn_id: u32) -> Vec<Effect> {
        self.cleanup(conn_id)
    }

    /// a connection's physical stream died (or a protocol error scoped to
    /// just that connection occurred): re-home its unconfirmed packets onto
    /// another connection (or offline) and drop its IO task. Per spec.md
    /// §4.5 step 2, a connection that dies before ever sending its own
    /// `Finish` gets one synthesized now — otherwise it could never satisfy
    /// C1 and would linger in `connections` forever.
    fn cleanup(&mut self, dead_id: u32) -> Vec<Effect> {
        let mut effects = vec![Effect::DetachConnectionIo(dead_id)];
        let carried: Vec<UnconfirmedPacket> = match self.connections.get_mut(&dead_id) {
            Some(conn) => {
                conn.attached = false;
                if !conn.is_finish_sent {
                    let pack_id = conn.next_send_pack_id;
                    conn.next_send_pack_id += 1;
                    conn.is_finish_sent = true;
                    conn.unconfirmed.push_back(UnconfirmedPacket::Finish {
                        origin_conn: dead_id,
                        pack_id,
                    });
                }
                conn.unconfirmed.drain(..).collect()
            }
            None => Vec::new(),
        };
        if let SendingQueue::Online(rotation) = &mut self.queue {
            rotation.remove(dead_id);
            if rotation.is_empty() {
                self.queue = SendingQueue::Offline(VecDeque::new());
                effects.push(Effect::Unavailable);
            }
        }
        effects.extend(self.redistribute(carried));
        effects.extend(self.check_shutdown());
        self.maybe_drop_connection(dead_id);
        effects
    }

    fn redistribute(&mut self, packets: Vec<UnconfirmedPacket>) -> Vec<Effect> {
        let mut effects = Vec::new();
        for packet in packets {
            let target = match &mut self.queue {
                SendingQueue::Online(rotation) => rotation.pick(),
                SendingQueue::Offline(_) => None,
            };
            match target {
                Some(target) => {
                    let conn = self
                        .connections
                        .get_mut(&target)
                        .expect("rotation entry implies connection");
                    let was_idle = conn.unconfirmed.is_empty();
                    conn.unconfirmed.push_back(packet.clone());
                    if let SendingQueue::Online(rotation) = &mut self.queue {
                        rotation.set_all_confirmed(target, false);
                    }
                    effects.push(Effect::WriteFrame(target, packet.to_frame(target)));
                    if was_idle {
                        effects.push(Effect::ConnectionBusy(target));
                    }
                }
                None => {
                    if matches!(self.queue, SendingQueue::Online(_)) {
                        self.queue = SendingQueue::Offline(VecDeque::new());
                        effects.push(Effect::Unavailable);
                    }
                    if let SendingQueue::Offline(pending) = &mut self.queue {
                        pending.push_back(match packet {
                            UnconfirmedPacket::Data { buffers, .. } => PendingPacket::Data(buffers),
                            UnconfirmedPacket::Finish { .. } => PendingPacket::Finish,
                        });
                    }
                }
            }
        }
        effects
    }

    fn maybe_drop_connection(&mut self, id: u32) {
        if self.connections.get(&id).map(|c| c.is_drainable()).unwrap_or(false) {
            self.connections.remove(&id);
            if let SendingQueue::Online(rotation) = &mut self.queue {
                rotation.remove(id);
                if rotation.is_empty() {
                    self.queue = SendingQueue::Offline(VecDeque::new());
                }
            }
        }
    }

    /// graceful shutdown: send `Finish` on every open connection and wait
    /// for drainage; fires `Effect::ShutDown` once every connection has
    /// drained.
    pub fn shut_down(&mut self) -> Vec<Effect> {
        if self.local_shutdown_requested {
            return Vec::new();
        }
        self.local_shutdown_requested = true;
        let mut effects = Vec::new();
        let ids: Vec<u32> = self.connections.keys().copied().collect();
        for id in ids {
            let needs_finish = self.connections.get(&id).is_some_and(|c| c.attached && !c.is_finish_sent);
            if needs_finish {
                effects.extend(self.send_finish_on(id));
            }
        }
        effects.extend(self.check_shutdown());
        effects
    }

    fn send_finish_on(&mut self, conn_id: u32) -> Vec<Effect> {
        let conn = self.connections.get_mut(&conn_id).expect("caller checked presence");
        let pack_id = conn.next_send_pack_id;
        conn.next_send_pack_id += 1;
        conn.is_finish_sent = true;
        let packet = UnconfirmedPacket::Finish {
            origin_conn: conn_id,
            pack_id,
        };
        conn.unconfirmed.push_back(packet.clone());
        if let SendingQueue::Online(rotation) = &mut self.queue {
            rotation.set_all_confirmed(conn_id, false);
        }
        vec![Effect::WriteFrame(conn_id, packet.to_frame(conn_id))]
    }

    /// called before `maybe_drop_connection` at every call site so that,
    /// the moment every connection has drained, at least the one just
    /// updated is still present here to carry the final `ShutDown` frame
    /// (spec.md §4.6) — once it's removed there is nothing left to write to.
    fn check_shutdown(&mut self) -> Vec<Effect> {
        if self.shut_down || self.interrupted || !self.local_shutdown_requested {
            return Vec::new();
        }
        if self.connections.values().all(|c| c.is_drainable()) {
            self.shut_down = true;
            let mut effects = Vec::new();
            let notify = self.connections.iter().find(|(_, c)| c.attached).map(|(&id, _)| id);
            if let Some(id) = notify {
                effects.push(Effect::WriteFrame(id, Frame::ShutDown));
            }
            effects.push(Effect::ShutDown);
            effects
        } else {
            Vec::new()
        }
    }

    /// client-side idle trim: gracefully retires one excess connection by
    /// sending `Finish` on it, as long as it isn't the session's last open
    /// connection and has nothing outstanding. A no-op otherwise — the
    /// normal Acknowledge/Finish handling drains it once the peer responds.
    pub fn retire_connection(&mut self, conn_id: u32) -> Vec<Effect> {
        if self.open_connection_count() <= 1 {
            return Vec::new();
        }
        let retirable = self
            .connections
            .get(&conn_id)
            .is_some_and(|c| c.attached && !c.is_finish_sent && c.unconfirmed.is_empty());
        if retirable {
            self.send_finish_on(conn_id)
        } else {
            Vec::new()
        }
    }

    /// abrupt teardown: drop everything without notifying the peer (spec.md
    /// §4.6 — `internalInterrupt` skips sending `ShutDown`). Also the
    /// escalation path for unrecoverable `SessionError`s (too many
    /// connections, offline queue overflow).
    pub fn internal_interrupt(&mut self) -> Vec<Effect> {
        if self.interrupted || self.shut_down {
            return Vec::new();
        }
        self.interrupted = true;
        let ids: Vec<u32> = self.connections.keys().copied().collect();
        let mut effects = Vec::new();
        for &id in &ids {
            effects.push(Effect::DetachConnectionIo(id));
        }
        effects.push(Effect::Interrupted);
        effects
    }

    /// the peer's own `checkShutDown` has already succeeded and sent us its
    /// `ShutDown` frame — that frame is never sent by `internal_interrupt`,
    /// so receiving it means the remote side shut down cleanly. Mirror that
    /// locally with a graceful `Effect::ShutDown` rather than escalating to
    /// `interrupted()`; no frame is written back, there's nothing left for
    /// the peer to hear it on.
    fn handle_remote_shutdown(&mut self) -> Vec<Effect> {
        if self.shut_down || self.interrupted {
            return Vec::new();
        }
        self.shut_down = true;
        let ids: Vec<u32> = self.connections.keys().copied().collect();
        let mut effects = Vec::new();
        for &id in &ids {
            effects.push(Effect::DetachConnectionIo(id));
        }
        self.connections.clear();
        if matches!(self.queue, SendingQueue::Online(_)) {
            effects.push(Effect::Unavailable);
        }
        self.queue = SendingQueue::Offline(VecDeque::new());
        effects.push(Effect::ShutDown);
        effects
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(conn_id: u32, is_renew: bool) -> ConnectionHead {
        ConnectionHead {
            session_id: SessionId::new_random(),
            is_renew,
            connection_id: conn_id,
        }
    }

    fn new_state() -> SessionState {
        SessionState::new(SessionId::new_random(), Arc::new(Config::default()))
    }

    #[test]
    fn send_before_any_connection_buffers_offline_and_flushes_on_attach() {
        let mut state = new_state();
        let effects = state.enqueue(vec![b"hi".to_vec()]);
        assert!(matches!(effects.as_slice(), [Effect::Unavailable]));

        let (effects, conn_id) = state.add_stream(head(0, false)).unwrap();
        assert_eq!(conn_id, 0);
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::WriteFrame(0, Frame::Data(buffers)) if buffers == &vec![b"hi".to_vec()])));
        // the flushed send leaves this brand new connection with something
        // outstanding, so the overlay needs the same busy transition a
        // direct enqueue on an already-open connection would get.
        assert!(effects.iter().any(|e| matches!(e, Effect::ConnectionBusy(0))));
    }

    #[test]
    fn acknowledge_drains_the_unconfirmed_queue_and_fires_idle() {
        let mut state = new_state();
        state.add_stream(head(0, false)).unwrap();
        state.enqueue(vec![b"hi".to_vec()]);
        let effects = state.handle_frame_received(0, Frame::Acknowledge);
        assert!(effects.iter().any(|e| matches!(e, Effect::ConnectionIdle(0))));
    }

    #[test]
    fn acknowledge_with_nothing_outstanding_does_not_refire_idle() {
        let mut state = new_state();
        state.add_stream(head(0, false)).unwrap();
        // nothing was ever enqueued on this connection, so there is no
        // unconfirmed packet for this Acknowledge to correspond to.
        let effects = state.handle_frame_received(0, Frame::Acknowledge);
        assert!(!effects.iter().any(|e| matches!(e, Effect::ConnectionIdle(0))));
    }

    #[test]
    fn redistributed_retransmission_wakes_an_idle_survivor() {
        let mut state = new_state();
        state.add_stream(head(0, false)).unwrap();
        state.add_stream(head(1, false)).unwrap();
        state.enqueue(vec![b"unacked".to_vec()]);
        let carrier = state
            .connection_ids()
            .find(|&id| !state.connection(id).unwrap().unconfirmed.is_empty())
            .unwrap();
        let survivor = if carrier == 0 { 1 } else { 0 };
        // the survivor has nothing outstanding before the carrier dies.
        assert!(state.connection(survivor).unwrap().unconfirmed.is_empty());
        let effects = state.handle_connection_failed(carrier);
        assert!(effects.iter().any(|e| matches!(e, Effect::ConnectionBusy(id) if *id == survivor)));
    }

    #[test]
    fn duplicate_data_is_acked_but_not_redelivered() {
        let mut state = new_state();
        state.add_stream(head(0, false)).unwrap();
        let first = state.handle_frame_received(0, Frame::Data(vec![b"a".to_vec()]));
        assert!(first.iter().any(|e| matches!(e, Effect::Deliver(_))));

        // simulate a second physical connection replaying the same origin/pack_id
        let second = state.handle_frame_received(0, Frame::RetransmissionData(0, 0, vec![b"a".to_vec()]));
        assert!(!second.iter().any(|e| matches!(e, Effect::Deliver(_))));
    }

    #[test]
    fn retransmission_referencing_an_unseen_connection_creates_a_ghost() {
        let mut state = new_state();
        state.add_stream(head(0, false)).unwrap();
        let effects = state.handle_frame_received(0, Frame::RetransmissionData(5, 0, vec![b"x".to_vec()]));
        assert!(effects.iter().any(|e| matches!(e, Effect::Deliver(_))));
        assert!(state.connection(5).is_some());
    }

    #[test]
    fn retransmission_data_acks_the_arrival_connection_before_delivering() {
        let mut state = new_state();
        state.add_stream(head(0, false)).unwrap();
        let effects = state.handle_frame_received(0, Frame::RetransmissionData(5, 0, vec![b"x".to_vec()]));
        // the ack must be written back immediately, never behind Deliver —
        // spec.md §4.1/§4.3: ack latency must not depend on application
        // processing of the delivered message.
        let ack_pos = effects
            .iter()
            .position(|e| matches!(e, Effect::WriteFrame(0, Frame::Acknowledge)))
            .expect("arrival connection should be acked");
        let deliver_pos = effects
            .iter()
            .position(|e| matches!(e, Effect::Deliver(_)))
            .expect("new data should be delivered");
        assert!(ack_pos < deliver_pos);
    }

    #[test]
    fn retransmission_finish_acks_the_arrival_connection_before_cleanup_effects() {
        let mut state = new_state();
        state.add_stream(head(0, false)).unwrap();
        state.add_stream(head(1, false)).unwrap();
        let effects = state.handle_frame_received(0, Frame::RetransmissionFinish(1, 0));
        // cleanup(1) synthesizes a Finish and retransmits it, which writes
        // to some other connection — that must still follow the ack to the
        // stream the RetransmissionFinish actually arrived on.
        let ack_pos = effects
            .iter()
            .position(|e| matches!(e, Effect::WriteFrame(0, Frame::Acknowledge)))
            .expect("arrival connection should be acked");
        assert_eq!(ack_pos, 0);
    }

    #[test]
    fn retransmission_fills_every_id_in_the_gap_not_just_the_one_referenced() {
        let mut state = new_state();
        state.add_stream(head(0, false)).unwrap();
        state.handle_frame_received(0, Frame::RetransmissionData(3, 0, vec![b"x".to_vec()]));
        assert!(state.connection(1).is_some());
        assert!(state.connection(2).is_some());
        assert!(state.connection(3).is_some());
        assert_eq!(state.next_connection_id(), 4);
    }

    #[test]
    fn retransmission_behind_last_connection_id_with_no_record_is_ignored() {
        let mut state = new_state();
        state.add_stream(head(0, false)).unwrap();
        // a RetransmissionFinish for a connection that never sent any Data
        // fully drains it immediately (nothing to wait for below id 0).
        state.handle_frame_received(0, Frame::RetransmissionFinish(5, 0));
        assert!(state.connection(5).is_none());

        // a stray retransmission addressed to that same, now-drained
        // connection id arrives late off the wire — safely ignored, not
        // resurrected and not escalated.
        let effects = state.handle_frame_received(0, Frame::RetransmissionData(5, 0, vec![b"late".to_vec()]));
        assert!(!effects.iter().any(|e| matches!(e, Effect::Deliver(_))));
        assert!(state.connection(5).is_none());
        assert!(!state.is_interrupted());
    }

    #[test]
    fn cleanup_synthesizes_a_finish_for_a_connection_that_never_sent_one() {
        let mut state = new_state();
        state.add_stream(head(0, false)).unwrap();
        state.add_stream(head(1, false)).unwrap();
        state.enqueue(vec![b"unacked".to_vec()]);
        // whichever connection the rotation picked for the send dies before
        // ever sending a Finish of its own.
        let carrier = state.connection_ids().find(|&id| !state.connection(id).unwrap().unconfirmed.is_empty()).unwrap();
        let effects = state.handle_connection_failed(carrier);
        // the dead connection's outstanding Data gets retransmitted, and its
        // own Finish is synthesized and retransmitted too, onto the survivor.
        let survivor = if carrier == 0 { 1 } else { 0 };
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::WriteFrame(id, Frame::RetransmissionFinish(origin, _)) if *id == survivor && *origin == carrier)));
        assert!(state.connection(carrier).unwrap().is_drainable() || state.connection(carrier).is_none());
    }

    #[test]
    fn connection_regression_is_rejected() {
        let mut state = new_state();
        state.add_stream(head(5, false)).unwrap();
        let err = state.add_stream(head(3, false)).unwrap_err();
        assert!(matches!(
            err,
            HandshakeError::Session(SessionError::ConnectionIdRegression(3, 5))
        ));
    }

    #[test]
    fn renew_reattaches_the_same_connection_id() {
        let mut state = new_state();
        state.add_stream(head(0, false)).unwrap();
        state.handle_connection_failed(0);
        assert!(!state.connection(0).unwrap().attached);
        let (_, conn_id) = state.add_stream(head(0, true)).unwrap();
        assert_eq!(conn_id, 0);
        assert!(state.connection(0).unwrap().attached);
    }

    #[test]
    fn renew_clears_unrelated_connections_and_last_connection_id() {
        let mut state = new_state();
        state.add_stream(head(0, false)).unwrap();
        state.add_stream(head(1, false)).unwrap();
        assert_eq!(state.connection_ids().count(), 2);

        let (_, conn_id) = state.add_stream(head(7, true)).unwrap();
        assert_eq!(conn_id, 7);
        assert_eq!(state.connection_ids().count(), 1);
        assert!(state.connection(0).is_none());
        assert!(state.connection(1).is_none());
        assert_eq!(state.next_connection_id(), 8);
    }

    #[test]
    fn handshake_ahead_of_last_connection_id_fills_ghosts() {
        let mut state = new_state();
        state.add_stream(head(0, false)).unwrap();
        let (_, conn_id) = state.add_stream(head(3, false)).unwrap();
        assert_eq!(conn_id, 3);
        assert!(!state.connection(1).unwrap().attached);
        assert!(!state.connection(2).unwrap().attached);
        assert!(state.connection(3).unwrap().attached);
    }

    #[test]
    fn handshake_reattaches_a_ghost_created_by_retransmission() {
        let mut state = new_state();
        state.add_stream(head(0, false)).unwrap();
        state.handle_frame_received(0, Frame::RetransmissionData(2, 0, vec![b"x".to_vec()]));
        assert!(!state.connection(2).unwrap().attached);

        let (_, conn_id) = state.add_stream(head(2, false)).unwrap();
        assert_eq!(conn_id, 2);
        assert!(state.connection(2).unwrap().attached);
    }

    #[test]
    fn duplicate_handshake_on_a_live_connection_is_rejected() {
        let mut state = new_state();
        state.add_stream(head(0, false)).unwrap();
        let err = state.add_stream(head(0, false)).unwrap_err();
        assert!(matches!(err, HandshakeError::DuplicateConnection(0)));
    }

    #[test]
    fn graceful_shutdown_fires_once_every_connection_drains() {
        let mut state = new_state();
        state.add_stream(head(0, false)).unwrap();
        let effects = state.shut_down();
        assert!(effects.iter().any(|e| matches!(e, Effect::WriteFrame(0, Frame::Finish))));
        assert!(!state.is_shut_down());

        state.handle_frame_received(0, Frame::Acknowledge); // our Finish got acked
        let effects = state.handle_frame_received(0, Frame::Finish); // peer's Finish arrives
        // spec.md §4.6: checkShutDown sends ShutDown on one connection before
        // firing shutedDown() — the draining connection is still present to
        // carry it, even though it's removed from `connections` right after.
        assert!(effects.iter().any(|e| matches!(e, Effect::WriteFrame(0, Frame::ShutDown))));
        assert!(effects.iter().any(|e| matches!(e, Effect::ShutDown)));
        assert!(state.is_shut_down());
    }

    #[test]
    fn internal_interrupt_never_sends_a_shutdown_frame() {
        let mut state = new_state();
        state.add_stream(head(0, false)).unwrap();
        let effects = state.internal_interrupt();
        assert!(!effects
            .iter()
            .any(|e| matches!(e, Effect::WriteFrame(_, Frame::ShutDown))));
        assert!(effects.iter().any(|e| matches!(e, Effect::DetachConnectionIo(0))));
        assert!(effects.iter().any(|e| matches!(e, Effect::Interrupted)));
        assert!(state.is_interrupted());
    }

    #[test]
    fn receiving_a_remote_shutdown_frame_tears_down_gracefully_not_as_an_interruption() {
        let mut state = new_state();
        state.add_stream(head(0, false)).unwrap();
        let effects = state.handle_frame_received(0, Frame::ShutDown);
        assert!(effects.iter().any(|e| matches!(e, Effect::DetachConnectionIo(0))));
        assert!(effects.iter().any(|e| matches!(e, Effect::ShutDown)));
        assert!(!effects.iter().any(|e| matches!(e, Effect::Interrupted)));
        assert!(!effects
            .iter()
            .any(|e| matches!(e, Effect::WriteFrame(_, Frame::ShutDown))));
        assert!(state.is_shut_down());
        assert!(!state.is_interrupted());
    }

    #[test]
    fn losing_the_only_connection_re_offlines_unconfirmed_sends() {
        let mut state = new_state();
        state.add_stream(head(0, false)).unwrap();
        state.enqueue(vec![b"hi".to_vec()]);
        let effects = state.handle_connection_failed(0);
        assert!(effects.iter().any(|e| matches!(e, Effect::Unavailable)));
        assert!(state.queue_is_offline());
    }

    #[test]
    fn offline_queue_overflow_escalates_to_internal_interrupt() {
        let mut config = Config::default();
        config.max_offline_pack = 2;
        let mut state = SessionState::new(SessionId::new_random(), Arc::new(config));

        // no connection has ever been attached, so every send buffers offline.
        assert!(state.enqueue(vec![b"one".to_vec()]).is_empty());
        assert!(state.enqueue(vec![b"two".to_vec()]).is_empty());
        let effects = state.enqueue(vec![b"three".to_vec()]);
        assert!(effects.iter().any(|e| matches!(e, Effect::Interrupted)));
        assert!(state.is_interrupted());
    }

    impl SessionState {
        fn queue_is_offline(&self) -> bool {
            self.queue.is_offline()
        }
    }
}
