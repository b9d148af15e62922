//! Per-connection record: one physical TCP stream's worth of protocol state,
//! owned by the session engine. Mirrors the bookkeeping
//! `squirrel::transport::server::ClientInterface` kept per peer, adapted
//! from a single UDP "peer" to one stream among many multiplexed into a
//! session.

use std::collections::VecDeque;
use std::time::Instant;

use crate::codec::Frame;
use crate::idset::IdSet;

/// An outgoing packet that required acknowledgement and hasn't gotten one
/// yet, tagged with the connection it was originally assigned to and the
/// packet id within that connection's send sequence. Kept so it can be
/// replayed on a different physical connection if the one carrying it dies:
/// `to_frame` chooses plain framing when it's still riding its original
/// connection, or the `Retransmission*` wire form when it's been moved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnconfirmedPacket {
    Data {
        origin_conn: u32,
        pack_id: u32,
        buffers: Vec<Vec<u8>>,
    },
    Finish {
        origin_conn: u32,
        pack_id: u32,
    },
}

impl UnconfirmedPacket {
    pub fn to_frame(&self, sending_on: u32) -> Frame {
        match self {
            UnconfirmedPacket::Data {
                origin_conn,
                pack_id,
                buffers,
            } => {
                if *origin_conn == sending_on {
                    Frame::Data(buffers.clone())
                } else {
                    Frame::RetransmissionData(*origin_conn, *pack_id, buffers.clone())
                }
            }
            UnconfirmedPacket::Finish { origin_conn, pack_id } => {
                if *origin_conn == sending_on {
                    Frame::Finish
                } else {
                    Frame::RetransmissionFinish(*origin_conn, *pack_id)
                }
            }
        }
    }
}

#[derive(Debug)]
pub struct Connection {
    pub id: u32,
    /// false while the connection is a ghost (referenced by a retransmission
    /// before its own handshake arrived) or after its stream has died.
    pub attached: bool,
    /// next packet id this connection will assign when it originates a send.
    pub next_send_pack_id: u32,
    /// count of plain (non-retransmitted) Data frames received directly on
    /// this connection's own stream; doubles as the implicit id of the next
    /// one, since a single TCP stream delivers frames in send order.
    pub num_data_received: u32,
    pub receive_id_set: IdSet,
    pub finish_id_received: Option<u32>,
    pub is_finish_sent: bool,
    pub unconfirmed: VecDeque<UnconfirmedPacket>,
    pub created_at: Instant,
}

impl Connection {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            attached: false,
            next_send_pack_id: 0,
            num_data_received: 0,
            receive_id_set: IdSet::new(),
            finish_id_received: None,
            is_finish_sent: false,
            unconfirmed: VecDeque::new(),
            created_at: Instant::now(),
        }
    }

    pub fn describe(&self) -> String {
        format!(
            "connection#{} (attached={}, sent={}, received={}, unconfirmed={})",
            self.id,
            self.attached,
            self.next_send_pack_id,
            self.num_data_received,
            self.unconfirmed.len()
        )
    }

    /// A connection may be dropped from the session once its Finish has
    /// been sent and acknowledged-for, its peer's Finish has been received,
    /// every id below that Finish id has arrived, and nothing is still
    /// waiting on an acknowledgement.
    pub fn is_drainable(&self) -> bool {
        self.is_finish_sent
            && self.unconfirmed.is_empty()
            && self
                .finish_id_received
                .is_some_and(|fid| self.receive_id_set.all_received_below(fid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_connection_is_not_drainable() {
        assert!(!Connection::new(0).is_drainable());
    }

    #[test]
    fn drainable_once_both_sides_have_finished_cleanly() {
        let mut conn = Connection::new(0);
        conn.is_finish_sent = true;
        conn.finish_id_received = Some(3);
        conn.receive_id_set.add(0);
        conn.receive_id_set.add(1);
        conn.receive_id_set.add(2);
        assert!(conn.is_drainable());
    }

    #[test]
    fn not_drainable_while_unconfirmed_packets_remain() {
        let mut conn = Connection::new(0);
        conn.is_finish_sent = true;
        conn.finish_id_received = Some(0);
        conn.unconfirmed.push_back(UnconfirmedPacket::Finish {
            origin_conn: 0,
            pack_id: 0,
        });
        assert!(!conn.is_drainable());
    }

    #[test]
    fn to_frame_uses_plain_framing_on_its_origin_connection() {
        let packet = UnconfirmedPacket::Data {
            origin_conn: 3,
            pack_id: 7,
            buffers: vec![b"hi".to_vec()],
        };
        assert_eq!(packet.to_frame(3), Frame::Data(vec![b"hi".to_vec()]));
        assert_eq!(
            packet.to_frame(9),
            Frame::RetransmissionData(3, 7, vec![b"hi".to_vec()])
        );
    }
}
