use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use iris_core::qos::QoS;
use iris_packets::connect::ConnectPacket;
use iris_packets::publish::PublishPacket;

/// Will message to be published on abnormal client disconnect.
#[derive(Debug, Clone)]
pub(crate) struct WillMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

impl WillMessage {
    /// Extract the will message from a ConnectPacket if the will flag is set.
    pub(crate) fn from_connect(packet: &ConnectPacket) -> Option<Self> {
        if !packet.flags.will {
            return None;
        }

        let topic = packet.will_topic.as_ref()?;

        Some(WillMessage {
            topic: topic.clone(),
            payload: packet.will_payload.clone().unwrap_or_default(),
            qos: packet.flags.will_qos,
            retain: packet.flags.will_retain,
        })
    }

    /// Build the PUBLISH the fan-out delivers for this will.
    ///
    /// The packet id is left unset; the fan-out assigns one per subscriber
    /// when the effective QoS calls for it.
    pub(crate) fn to_publish(&self) -> PublishPacket {
        PublishPacket {
            dup: false,
            qos: self.qos,
            retain: self.retain,
            topic: self.topic.clone(),
            packet_id: None,
            payload: self.payload.clone(),
        }
    }
}

/// Ack the broker is still owed for an outbound QoS > 0 PUBLISH.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AckState {
    /// QoS 1: PUBLISH sent, waiting for PUBACK.
    AwaitPubAck,
    /// QoS 2: PUBLISH sent, waiting for PUBREC.
    AwaitPubRec,
    /// QoS 2: PUBREL sent, waiting for PUBCOMP.
    AwaitPubComp,
}

#[derive(Debug)]
pub(crate) struct InflightPublish {
    pub packet: PublishPacket,
    pub sent_at: Instant,
}

#[derive(Debug)]
pub(crate) struct InflightAck {
    pub state: AckState,
    pub sent_at: Instant,
}

/// Per-client broker state, keyed by client id in the session table.
///
/// A session outlives its network connection when `clean_session` is false;
/// while offline, `outbound` is `None` and QoS > 0 traffic accumulates in
/// `outgoing`.
pub(crate) struct Session {
    client_id: String,
    pub clean_session: bool,
    pub online: bool,
    /// Handle to the owning connection task's writer. Sending on it stages
    /// bytes and arms the connection for flushing.
    outbound: Option<mpsc::UnboundedSender<Bytes>>,
    /// Normalised names of every topic this client is installed under.
    pub subscriptions: Vec<String>,
    /// PUBLISHes buffered while offline, flushed FIFO on resume.
    outgoing: VecDeque<PublishPacket>,
    /// Outbound QoS > 0 PUBLISHes awaiting their terminal ack.
    out_msgs: HashMap<u16, InflightPublish>,
    /// Acks this broker is owed, keyed by the same packet ids as `out_msgs`.
    out_acks: HashMap<u16, InflightAck>,
    /// Inbound QoS 2 PUBLISH ids awaiting the publisher's PUBREL.
    in_acks: HashMap<u16, Instant>,
    pub lwt: Option<WillMessage>,
    next_mid: u16,
}

impl Session {
    pub(crate) fn new(client_id: &str, clean_session: bool) -> Session {
        Session {
            client_id: client_id.to_string(),
            clean_session,
            online: false,
            outbound: None,
            subscriptions: Vec::new(),
            outgoing: VecDeque::new(),
            out_msgs: HashMap::new(),
            out_acks: HashMap::new(),
            in_acks: HashMap::new(),
            lwt: None,
            next_mid: 0,
        }
    }

    /// Attach a connection's outbound queue and mark the session online.
    pub(crate) fn bind(&mut self, outbound: mpsc::UnboundedSender<Bytes>) {
        self.outbound = Some(outbound);
        self.online = true;
    }

    /// Detach the connection on disconnect.
    pub(crate) fn unbind(&mut self) {
        self.outbound = None;
        self.online = false;
    }

    /// Stage pre-encoded bytes for delivery to the client.
    ///
    /// Returns false when the session is offline or the connection task has
    /// already gone away.
    pub(crate) fn stage(&mut self, bytes: Bytes) -> bool {
        match &self.outbound {
            Some(tx) => tx.send(bytes).is_ok(),
            None => false,
        }
    }

    pub(crate) fn queue_offline(&mut self, packet: PublishPacket) {
        self.outgoing.push_back(packet);
    }

    pub(crate) fn drain_offline(&mut self) -> VecDeque<PublishPacket> {
        std::mem::take(&mut self.outgoing)
    }

    pub(crate) fn offline_queue_len(&self) -> usize {
        self.outgoing.len()
    }

    /// Reset subscriptions, the offline queue and all inflight state.
    ///
    /// Called when the client reconnects with `clean_session = true`.
    pub(crate) fn reset(&mut self) {
        self.subscriptions.clear();
        self.outgoing.clear();
        self.out_msgs.clear();
        self.out_acks.clear();
        self.in_acks.clear();
    }

    pub(crate) fn add_subscription(&mut self, name: &str) {
        if !self.subscriptions.iter().any(|s| s == name) {
            self.subscriptions.push(name.to_string());
        }
    }

    pub(crate) fn remove_subscription(&mut self, name: &str) {
        self.subscriptions.retain(|s| s != name);
    }

    /// Allocate a packet id not currently in use by either outbound table.
    ///
    /// The cursor wraps around the full 16-bit space, skipping zero and any
    /// id with an outstanding flow; returns `None` when every id is taken.
    pub(crate) fn next_free_mid(&mut self) -> Option<u16> {
        for _ in 0..u16::MAX {
            self.next_mid = self.next_mid.wrapping_add(1);
            if self.next_mid == 0 {
                self.next_mid = 1;
            }

            let mid = self.next_mid;
            if !self.out_msgs.contains_key(&mid) && !self.out_acks.contains_key(&mid) {
                return Some(mid);
            }
        }

        None
    }

    /// Record an outbound QoS > 0 PUBLISH and the ack owed for it.
    pub(crate) fn register_outbound(&mut self, mid: u16, packet: PublishPacket, state: AckState) {
        let now = Instant::now();
        self.out_msgs.insert(mid, InflightPublish {
            packet,
            sent_at: now,
        });
        self.out_acks.insert(mid, InflightAck {
            state,
            sent_at: now,
        });
    }

    /// Release both outbound slots for a packet id.
    ///
    /// Idempotent: a second release for the same id is a no-op, so a faulty
    /// peer repeating an ack cannot free a slot twice.
    pub(crate) fn release_outbound(&mut self, mid: u16) -> bool {
        let msg = self.out_msgs.remove(&mid);
        let ack = self.out_acks.remove(&mid);

        match (&msg, &ack) {
            (None, None) => {
                debug!(
                    client_id = %self.client_id,
                    packet_id = mid,
                    "ack for a packet id that is not inflight"
                );
            }
            (Some(msg), ack) => {
                debug!(
                    client_id = %self.client_id,
                    packet_id = mid,
                    topic = %msg.packet.topic,
                    elapsed = ?msg.sent_at.elapsed(),
                    state = ?ack.as_ref().map(|a| a.state),
                    "outbound flow complete"
                );
            }
            _ => {}
        }

        msg.is_some() || ack.is_some()
    }

    /// Advance an outbound QoS 2 flow on receipt of PUBREC.
    pub(crate) fn pubrec_received(&mut self, mid: u16) -> bool {
        match self.out_acks.get_mut(&mid) {
            Some(ack) => {
                debug!(
                    client_id = %self.client_id,
                    packet_id = mid,
                    awaited = ?ack.sent_at.elapsed(),
                    "PUBREC received, sending PUBREL"
                );
                ack.state = AckState::AwaitPubComp;
                ack.sent_at = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Record an inbound QoS 2 PUBLISH id until its PUBREL arrives.
    pub(crate) fn inbound_qos2_start(&mut self, mid: u16) {
        self.in_acks.insert(mid, Instant::now());
    }

    /// Complete an inbound QoS 2 flow on receipt of PUBREL.
    pub(crate) fn inbound_qos2_release(&mut self, mid: u16) -> bool {
        self.in_acks.remove(&mid).is_some()
    }

    pub(crate) fn inbound_qos2_pending(&self, mid: u16) -> bool {
        self.in_acks.contains_key(&mid)
    }

    pub(crate) fn has_inflight(&self) -> bool {
        !self.out_msgs.is_empty() || !self.out_acks.is_empty() || !self.in_acks.is_empty()
    }

    pub(crate) fn outbound_state(&self, mid: u16) -> Option<AckState> {
        self.out_acks.get(&mid).map(|ack| ack.state)
    }

    pub(crate) fn outbound_publish(&self, mid: u16) -> Option<&InflightPublish> {
        self.out_msgs.get(&mid)
    }
}
