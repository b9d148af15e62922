//! Per-connection I/O: one task per physical TCP stream that cooperatively
//! reads, writes, and heartbeats. Combines the "background read loop
//! reporting back to its owner" pattern from `haysel::ipc`'s `bg_spawn`
//! with the retry-on-timeout shape of `squirrel::transport::shared`'s
//! `send_and_wait`, folded into a single `tokio::select!` loop instead of
//! three separate tasks since all three suspension points (read, write,
//! heartbeat tick) are already expressed as futures the runtime can
//! multiplex.

use std::sync::Arc;

use flume::{Receiver, Sender};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::codec::{self, Frame};
use crate::config::Config;
use crate::error::TransportError;
use crate::session::SessionEventSender;

pub async fn run_connection_io(
    conn_id: u32,
    mut read_half: OwnedReadHalf,
    mut write_half: OwnedWriteHalf,
    outgoing_rx: Receiver<Frame>,
    events_tx: SessionEventSender,
    config: Arc<Config>,
) {
    let mut heartbeat = tokio::time::interval(config.heart_beat_delay());
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = tokio::time::timeout(config.reading_timeout(), codec::read_frame(&mut read_half, config.max_data_size)) => {
                match frame {
                    Ok(Ok(frame)) => {
                        trace!(conn_id, ?frame, "received frame");
                        events_tx.frame_received(conn_id, frame).await;
                    }
                    Ok(Err(err)) => {
                        events_tx.connection_failed(conn_id, TransportError::from(err)).await;
                        break;
                    }
                    Err(_elapsed) => {
                        events_tx.connection_failed(conn_id, TransportError::ReadTimeout).await;
                        break;
                    }
                }
            }
            outgoing = outgoing_rx.recv_async() => {
                match outgoing {
                    Ok(frame) => {
                        let write = tokio::time::timeout(config.writing_timeout(), codec::write_frame(&mut write_half, &frame)).await;
                        match write {
                            Ok(Ok(())) => {}
                            Ok(Err(err)) => {
                                events_tx.connection_failed(conn_id, TransportError::from(err)).await;
                                break;
                            }
                            Err(_elapsed) => {
                                events_tx.connection_failed(conn_id, TransportError::WriteTimeout).await;
                                break;
                            }
                        }
                    }
                    Err(_disconnected) => break,
                }
            }
            _ = heartbeat.tick() => {
                if codec::write_frame(&mut write_half, &Frame::HeartBeat).await.is_err() {
                    events_tx.connection_failed(conn_id, TransportError::Closed).await;
                    break;
                }
            }
        }
    }
}
