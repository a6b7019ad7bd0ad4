//! The protocol command engine.
//!
//! One [`Broker`] holds the whole of the mutable broker state: the session
//! table and the topic tree (subscriber sets plus retained messages). Every
//! decoded inbound packet is routed through [`Broker::dispatch`] to the
//! handler for its control type; handlers run to completion under the state
//! mutex, never await, and stage fully encoded outbound packets onto the
//! target clients' queues.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use iris_core::codec::Encoder;
use iris_core::qos::QoS;
use iris_core::return_code::ConnectReturnCode;
use iris_core::topic::{self, Filter};
use iris_packets::connack::ConnAckPacket;
use iris_packets::connect::{ConnectPacket, PROTOCOL_LEVEL};
use iris_packets::pingresp::PingRespPacket;
use iris_packets::puback::PubAckPacket;
use iris_packets::pubcomp::PubCompPacket;
use iris_packets::publish::PublishPacket;
use iris_packets::pubrec::PubRecPacket;
use iris_packets::pubrel::PubRelPacket;
use iris_packets::suback::SubAckPacket;
use iris_packets::subscribe::SubscribePacket;
use iris_packets::unsuback::UnsubAckPacket;
use iris_packets::unsubscribe::UnsubscribePacket;
use iris_packets::ControlPacket;

use crate::auth::CredentialValidator;
use crate::session::{AckState, Session, WillMessage};
use crate::topic_tree::{Subscriber, Topic, TopicTree};

/// Broker-wide configuration consumed by the command engine.
#[derive(Clone)]
pub struct BrokerConfig {
    /// Accept CONNECTs that carry no credentials.
    pub allow_anonymous: bool,
    /// Validator for CONNECT username/password pairs.
    pub credential_validator: Option<Arc<dyn CredentialValidator>>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            allow_anonymous: true,
            credential_validator: None,
        }
    }
}

/// What the connection task must do after a handler ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Bytes were staged on the client's queue; the writer will flush them.
    Reply,
    /// The packet required no response.
    NoReply,
    /// Protocol violation; tear the transport down.
    Disconnect,
}

/// Result of processing a CONNECT.
pub enum ConnectOutcome {
    /// The session is bound to this connection; serve it.
    Accepted { client_id: String },
    /// A CONNACK with the reject code was staged; close after flushing.
    Rejected(ConnectReturnCode),
    /// Protocol violation; close without responding.
    Violation,
}

/// Process-wide counters maintained by the engine.
#[derive(Debug, Default)]
pub struct BrokerStats {
    connected_clients: AtomicU64,
    messages_received: AtomicU64,
    messages_sent: AtomicU64,
}

impl BrokerStats {
    pub fn connected_clients(&self) -> u64 {
        self.connected_clients.load(Ordering::Relaxed)
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }
}

/// The command engine. Cheap to clone; clones share one state.
#[derive(Clone)]
pub struct Broker {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<State>,
    config: BrokerConfig,
    stats: BrokerStats,
}

struct State {
    sessions: HashMap<String, Session>,
    topics: TopicTree,
}

fn pack(packet: &impl Encoder) -> Bytes {
    let mut buffer = BytesMut::new();
    packet.encode(&mut buffer);
    buffer.freeze()
}

fn connack(return_code: ConnectReturnCode) -> Bytes {
    pack(&ConnAckPacket {
        session_present: false,
        return_code,
    })
}

fn synthesize_client_id() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("sol-{}", now.as_nanos())
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Broker {
        Broker {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    sessions: HashMap::new(),
                    topics: TopicTree::new(),
                }),
                config,
                stats: BrokerStats::default(),
            }),
        }
    }

    pub fn stats(&self) -> &BrokerStats {
        &self.shared.stats
    }

    /// Process a CONNECT and bind the session to the connection's outbound
    /// queue.
    ///
    /// On rejection the CONNACK carrying the reason is staged on `outbound`
    /// so the peer sees it before the socket closes.
    pub fn connect(
        &self,
        packet: ConnectPacket,
        outbound: mpsc::UnboundedSender<Bytes>,
    ) -> ConnectOutcome {
        if packet.protocol_level != PROTOCOL_LEVEL {
            warn!(level = packet.protocol_level, "unacceptable protocol level");
            let _ = outbound.send(connack(ConnectReturnCode::UnacceptableProtocolVersion));
            return ConnectOutcome::Rejected(ConnectReturnCode::UnacceptableProtocolVersion);
        }

        if !self.shared.config.allow_anonymous && !self.authenticate(&packet) {
            let _ = outbound.send(connack(ConnectReturnCode::BadUserNameOrPassword));
            return ConnectOutcome::Rejected(ConnectReturnCode::BadUserNameOrPassword);
        }

        let client_id = if packet.client_id.is_empty() {
            // An anonymous session cannot be resumed later.
            if !packet.flags.clean_session {
                warn!("empty client id with clean_session = false");
                let _ = outbound.send(connack(ConnectReturnCode::NotAuthorized));
                return ConnectOutcome::Rejected(ConnectReturnCode::NotAuthorized);
            }
            synthesize_client_id()
        } else {
            packet.client_id.clone()
        };

        let mut state = self.shared.state.lock().unwrap();
        let State { sessions, topics } = &mut *state;

        if sessions.get(&client_id).is_some_and(|s| s.online) {
            warn!(client_id = %client_id, "CONNECT for a client that is already online");
            return ConnectOutcome::Violation;
        }

        let session = sessions
            .entry(client_id.clone())
            .or_insert_with(|| Session::new(&client_id, packet.flags.clean_session));
        session.clean_session = packet.flags.clean_session;

        if session.clean_session {
            for name in session.subscriptions.clone() {
                if let Some(topic) = topics.get_mut(&name) {
                    topic.remove(&client_id);
                }
            }
            session.reset();
        }

        session.lwt = WillMessage::from_connect(&packet);

        if let Some(will) = &session.lwt {
            if will.retain {
                let name = topic::normalize(&will.topic);
                let mut retained = will.to_publish();
                retained.topic = name.clone();
                if retained.qos > QoS::AtMostOnce {
                    // Retained blobs replay verbatim; the wire format needs
                    // an id when the QoS is above 0.
                    retained.packet_id = Some(1);
                }
                topics.get_or_create(&name).retained = Some(pack(&retained));
            }
        }

        session.bind(outbound);
        session.stage(connack(ConnectReturnCode::Accepted));

        // Flush the offline queue before any new traffic reaches the client.
        if !session.clean_session {
            for mut queued in session.drain_offline() {
                if queued.qos > QoS::AtMostOnce {
                    let Some(mid) = session.next_free_mid() else {
                        warn!(
                            client_id = %client_id,
                            "packet id space exhausted, dropping queued message"
                        );
                        continue;
                    };
                    queued.packet_id = Some(mid);
                    let ack = if queued.qos == QoS::AtLeastOnce {
                        AckState::AwaitPubAck
                    } else {
                        AckState::AwaitPubRec
                    };
                    session.register_outbound(mid, queued.clone(), ack);
                }
                if session.stage(pack(&queued)) {
                    self.shared.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        self.shared
            .stats
            .connected_clients
            .fetch_add(1, Ordering::Relaxed);
        info!(
            client_id = %client_id,
            clean_session = session.clean_session,
            "client connected"
        );

        ConnectOutcome::Accepted { client_id }
    }

    fn authenticate(&self, packet: &ConnectPacket) -> bool {
        let (Some(username), Some(password)) = (&packet.username, &packet.password) else {
            warn!("credentials required but not provided");
            return false;
        };

        match &self.shared.config.credential_validator {
            Some(validator) => {
                let valid = validator.validate(username, password);
                if !valid {
                    warn!(username = %username, "authentication failed");
                }
                valid
            }
            None => false,
        }
    }

    /// Route a decoded packet to the handler for its control type.
    pub fn dispatch(&self, client_id: &str, packet: ControlPacket) -> HandlerOutcome {
        let mut state = self.shared.state.lock().unwrap();

        if !state.sessions.contains_key(client_id) {
            warn!(client_id = %client_id, "packet for an unknown session");
            return HandlerOutcome::Disconnect;
        }

        match packet {
            ControlPacket::Connect(_) => {
                warn!(client_id = %client_id, "second CONNECT on a live connection");
                HandlerOutcome::Disconnect
            }
            ControlPacket::Publish(p) => self.handle_publish(&mut state, client_id, p),
            ControlPacket::PubAck(p) => self.handle_puback(&mut state, client_id, p.packet_id),
            ControlPacket::PubRec(p) => self.handle_pubrec(&mut state, client_id, p.packet_id),
            ControlPacket::PubRel(p) => self.handle_pubrel(&mut state, client_id, p.packet_id),
            ControlPacket::PubComp(p) => self.handle_pubcomp(&mut state, client_id, p.packet_id),
            ControlPacket::Subscribe(p) => self.handle_subscribe(&mut state, client_id, p),
            ControlPacket::Unsubscribe(p) => self.handle_unsubscribe(&mut state, client_id, p),
            ControlPacket::PingReq(_) => self.handle_pingreq(&mut state, client_id),
            ControlPacket::Disconnect(_) => self.handle_disconnect(&mut state, client_id),
            ControlPacket::ConnAck(_)
            | ControlPacket::SubAck(_)
            | ControlPacket::UnsubAck(_)
            | ControlPacket::PingResp(_) => {
                warn!(client_id = %client_id, "received a server-to-client packet");
                HandlerOutcome::Disconnect
            }
        }
    }

    fn handle_publish(
        &self,
        state: &mut State,
        client_id: &str,
        mut packet: PublishPacket,
    ) -> HandlerOutcome {
        if let Err(err) = topic::validate_publish_topic(&packet.topic) {
            warn!(client_id = %client_id, %err, "invalid PUBLISH topic");
            return HandlerOutcome::Disconnect;
        }

        packet.topic = topic::normalize(&packet.topic);
        self.shared
            .stats
            .messages_received
            .fetch_add(1, Ordering::Relaxed);

        let State { sessions, topics } = &mut *state;
        let topic = topics.get_or_create(&packet.topic);

        if packet.retain {
            if packet.payload.is_empty() {
                // An empty retained PUBLISH clears the retained message.
                topic.retained = None;
            } else {
                topic.retained = Some(pack(&packet));
            }
        }

        publish_message(sessions, topic, &packet, &self.shared.stats);

        let Some(publisher) = sessions.get_mut(client_id) else {
            return HandlerOutcome::Disconnect;
        };

        match packet.qos {
            QoS::AtMostOnce => HandlerOutcome::NoReply,
            QoS::AtLeastOnce => match packet.packet_id {
                Some(id) => {
                    publisher.stage(pack(&PubAckPacket { packet_id: id }));
                    HandlerOutcome::Reply
                }
                None => HandlerOutcome::Disconnect,
            },
            QoS::ExactlyOnce => match packet.packet_id {
                Some(id) => {
                    publisher.inbound_qos2_start(id);
                    publisher.stage(pack(&PubRecPacket { packet_id: id }));
                    HandlerOutcome::Reply
                }
                None => HandlerOutcome::Disconnect,
            },
        }
    }

    fn handle_puback(&self, state: &mut State, client_id: &str, mid: u16) -> HandlerOutcome {
        if let Some(session) = state.sessions.get_mut(client_id) {
            session.release_outbound(mid);
        }
        HandlerOutcome::NoReply
    }

    fn handle_pubrec(&self, state: &mut State, client_id: &str, mid: u16) -> HandlerOutcome {
        let Some(session) = state.sessions.get_mut(client_id) else {
            return HandlerOutcome::Disconnect;
        };

        if !session.pubrec_received(mid) {
            debug!(client_id = %client_id, packet_id = mid, "PUBREC for a packet id that is not inflight");
        }

        session.stage(pack(&PubRelPacket { packet_id: mid }));
        HandlerOutcome::Reply
    }

    fn handle_pubrel(&self, state: &mut State, client_id: &str, mid: u16) -> HandlerOutcome {
        let Some(session) = state.sessions.get_mut(client_id) else {
            return HandlerOutcome::Disconnect;
        };

        if !session.inbound_qos2_release(mid) {
            debug!(client_id = %client_id, packet_id = mid, "PUBREL for a packet id that is not inflight");
        }

        session.stage(pack(&PubCompPacket { packet_id: mid }));
        HandlerOutcome::Reply
    }

    fn handle_pubcomp(&self, state: &mut State, client_id: &str, mid: u16) -> HandlerOutcome {
        if let Some(session) = state.sessions.get_mut(client_id) {
            session.release_outbound(mid);
        }
        HandlerOutcome::NoReply
    }

    fn handle_subscribe(
        &self,
        state: &mut State,
        client_id: &str,
        packet: SubscribePacket,
    ) -> HandlerOutcome {
        let State { sessions, topics } = &mut *state;
        let Some(session) = sessions.get_mut(client_id) else {
            return HandlerOutcome::Disconnect;
        };

        let mut return_codes = Vec::with_capacity(packet.filters.len());

        for request in &packet.filters {
            let filter = match topic::parse_filter(&request.filter) {
                Ok(filter) => filter,
                Err(err) => {
                    warn!(client_id = %client_id, %err, "invalid SUBSCRIBE filter");
                    return HandlerOutcome::Disconnect;
                }
            };

            match filter {
                Filter::Exact(name) => {
                    let topic = topics.get_or_create(&name);
                    topic.install(Subscriber::new(client_id, request.qos));
                    session.add_subscription(&name);
                    if let Some(retained) = topic.retained.clone() {
                        session.stage(retained);
                    }
                }
                Filter::Prefix(prefix) => {
                    // One shared record for every topic under the prefix.
                    let record = Subscriber::new(client_id, request.qos);
                    let mut installed = Vec::new();
                    topics.prefix_map(&prefix, |topic| {
                        topic.install(Arc::clone(&record));
                        installed.push((topic.name.clone(), topic.retained.clone()));
                    });

                    for (name, retained) in installed {
                        session.add_subscription(&name);
                        if let Some(retained) = retained {
                            session.stage(retained);
                        }
                    }
                }
            }

            return_codes.push(request.qos.into());
        }

        session.stage(pack(&SubAckPacket {
            packet_id: packet.packet_id,
            return_codes,
        }));
        HandlerOutcome::Reply
    }

    fn handle_unsubscribe(
        &self,
        state: &mut State,
        client_id: &str,
        packet: UnsubscribePacket,
    ) -> HandlerOutcome {
        let State { sessions, topics } = &mut *state;
        let Some(session) = sessions.get_mut(client_id) else {
            return HandlerOutcome::Disconnect;
        };

        for filter in &packet.filters {
            match topic::parse_filter(filter) {
                Ok(Filter::Exact(name)) => {
                    if let Some(topic) = topics.get_mut(&name) {
                        topic.remove(client_id);
                    }
                    session.remove_subscription(&name);
                }
                Ok(Filter::Prefix(prefix)) => {
                    let mut removed = Vec::new();
                    topics.prefix_map(&prefix, |topic| {
                        if topic.remove(client_id) {
                            removed.push(topic.name.clone());
                        }
                    });
                    for name in removed {
                        session.remove_subscription(&name);
                    }
                }
                Err(err) => {
                    warn!(client_id = %client_id, %err, "invalid UNSUBSCRIBE filter");
                }
            }
        }

        session.stage(pack(&UnsubAckPacket {
            packet_id: packet.packet_id,
        }));
        HandlerOutcome::Reply
    }

    fn handle_pingreq(&self, state: &mut State, client_id: &str) -> HandlerOutcome {
        if let Some(session) = state.sessions.get_mut(client_id) {
            session.stage(pack(&PingRespPacket {}));
        }
        HandlerOutcome::Reply
    }

    fn handle_disconnect(&self, state: &mut State, client_id: &str) -> HandlerOutcome {
        if let Some(session) = state.sessions.get_mut(client_id) {
            // A clean DISCONNECT discards the will.
            session.lwt = None;
        }
        HandlerOutcome::Disconnect
    }

    /// Tear down a connection's binding to its session.
    ///
    /// `clean` is true only when the peer sent a DISCONNECT packet; any other
    /// path (socket loss, keepalive timeout, protocol violation) publishes
    /// the will.
    pub fn connection_closed(&self, client_id: &str, clean: bool) {
        let mut state = self.shared.state.lock().unwrap();
        let State { sessions, topics } = &mut *state;

        let will = match sessions.get_mut(client_id) {
            Some(session) => {
                session.unbind();
                if clean {
                    None
                } else {
                    session.lwt.take()
                }
            }
            None => return,
        };

        self.shared
            .stats
            .connected_clients
            .fetch_sub(1, Ordering::Relaxed);

        if let Some(will) = will {
            info!(client_id = %client_id, topic = %will.topic, "publishing will");
            let name = topic::normalize(&will.topic);
            let mut packet = will.to_publish();
            packet.topic = name.clone();
            let topic = topics.get_or_create(&name);
            publish_message(sessions, topic, &packet, &self.shared.stats);
        }

        if let Some(session) = sessions.get(client_id) {
            if session.clean_session {
                for name in session.subscriptions.clone() {
                    if let Some(topic) = topics.get_mut(&name) {
                        topic.remove(client_id);
                    }
                }
                sessions.remove(client_id);
                debug!(client_id = %client_id, "session destroyed");
            }
        }

        info!(client_id = %client_id, clean, "client disconnected");
    }
}

/// Fan a PUBLISH out to every current subscriber of its topic.
///
/// Each subscriber sees the message at `min(publish QoS, granted QoS)`, with
/// the header re-encoded per subscriber since the packet id field exists only
/// when the effective QoS is above 0. Offline subscribers with a persistent
/// session get the message queued; offline clean sessions drop it.
fn publish_message(
    sessions: &mut HashMap<String, Session>,
    topic: &Topic,
    packet: &PublishPacket,
    stats: &BrokerStats,
) {
    for subscriber in topic.subscribers.values() {
        let Some(session) = sessions.get_mut(&subscriber.client_id) else {
            debug!(client_id = %subscriber.client_id, "subscriber without a session");
            continue;
        };

        let mut out = packet.clone();
        out.dup = false;
        // Deliveries for an established subscription carry retain = 0.
        out.retain = false;
        out.qos = packet.qos.min(subscriber.qos);
        out.packet_id = None;

        if !session.online {
            if !session.clean_session {
                session.queue_offline(out);
            }
            continue;
        }

        if out.qos > QoS::AtMostOnce {
            let Some(mid) = session.next_free_mid() else {
                warn!(
                    client_id = %subscriber.client_id,
                    topic = %topic.name,
                    "packet id space exhausted, dropping delivery"
                );
                continue;
            };
            out.packet_id = Some(mid);
            let ack = if out.qos == QoS::AtLeastOnce {
                AckState::AwaitPubAck
            } else {
                AckState::AwaitPubRec
            };
            session.register_outbound(mid, out.clone(), ack);
        }

        if session.stage(pack(&out)) {
            stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iris_packets::connect::ConnectFlags;
    use iris_packets::subscribe::SubscriptionRequest;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn connect_packet(client_id: &str, clean_session: bool) -> ConnectPacket {
        ConnectPacket {
            protocol_level: PROTOCOL_LEVEL,
            flags: ConnectFlags {
                clean_session,
                ..Default::default()
            },
            keepalive: 60,
            client_id: client_id.to_string(),
            ..Default::default()
        }
    }

    fn connect(broker: &Broker, client_id: &str, clean_session: bool) -> UnboundedReceiver<Bytes> {
        let (tx, rx) = mpsc::unbounded_channel();
        match broker.connect(connect_packet(client_id, clean_session), tx) {
            ConnectOutcome::Accepted { .. } => rx,
            _ => panic!("connect was not accepted"),
        }
    }

    fn recv_packet(rx: &mut UnboundedReceiver<Bytes>) -> ControlPacket {
        let bytes = rx.try_recv().expect("no staged packet");
        let mut buffer = BytesMut::from(&bytes[..]);
        ControlPacket::parse(&mut buffer).expect("staged bytes did not parse")
    }

    fn subscribe(broker: &Broker, client_id: &str, filter: &str, qos: QoS) {
        let outcome = broker.dispatch(
            client_id,
            ControlPacket::Subscribe(SubscribePacket {
                packet_id: 1,
                filters: vec![SubscriptionRequest {
                    filter: filter.to_string(),
                    qos,
                }],
            }),
        );
        assert_eq!(outcome, HandlerOutcome::Reply);
    }

    fn publish(broker: &Broker, client_id: &str, packet: PublishPacket) -> HandlerOutcome {
        broker.dispatch(client_id, ControlPacket::Publish(packet))
    }

    #[test]
    fn test_second_connect_for_online_client_is_violation() {
        let broker = Broker::new(BrokerConfig::default());
        let _rx = connect(&broker, "dup", true);

        let (tx, _rx2) = mpsc::unbounded_channel();
        assert!(matches!(
            broker.connect(connect_packet("dup", true), tx),
            ConnectOutcome::Violation
        ));
    }

    #[test]
    fn test_empty_client_id_with_persistent_session_rejected() {
        let broker = Broker::new(BrokerConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();

        match broker.connect(connect_packet("", false), tx) {
            ConnectOutcome::Rejected(code) => {
                assert_eq!(code, ConnectReturnCode::NotAuthorized)
            }
            _ => panic!("expected rejection"),
        }

        match recv_packet(&mut rx) {
            ControlPacket::ConnAck(ack) => {
                assert_eq!(ack.return_code, ConnectReturnCode::NotAuthorized)
            }
            other => panic!("expected CONNACK, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_client_id_gets_synthesized() {
        let broker = Broker::new(BrokerConfig::default());
        let (tx, _rx) = mpsc::unbounded_channel();

        match broker.connect(connect_packet("", true), tx) {
            ConnectOutcome::Accepted { client_id } => {
                assert!(client_id.starts_with("sol-"));
            }
            _ => panic!("expected acceptance"),
        }
    }

    #[test]
    fn test_anonymous_rejected_when_auth_required() {
        struct DenyAll;
        impl CredentialValidator for DenyAll {
            fn validate(&self, _username: &str, _password: &[u8]) -> bool {
                false
            }
        }

        let broker = Broker::new(BrokerConfig {
            allow_anonymous: false,
            credential_validator: Some(Arc::new(DenyAll)),
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        match broker.connect(connect_packet("c1", true), tx) {
            ConnectOutcome::Rejected(code) => {
                assert_eq!(code, ConnectReturnCode::BadUserNameOrPassword)
            }
            _ => panic!("expected rejection"),
        }

        match recv_packet(&mut rx) {
            ControlPacket::ConnAck(ack) => {
                assert_eq!(ack.return_code, ConnectReturnCode::BadUserNameOrPassword)
            }
            other => panic!("expected CONNACK, got {:?}", other),
        }
    }

    #[test]
    fn test_retained_message_replaced_and_cleared() {
        let broker = Broker::new(BrokerConfig::default());
        let _rx = connect(&broker, "pub", true);

        let mut packet = PublishPacket {
            retain: true,
            topic: "t".to_string(),
            payload: Bytes::from_static(b"p1"),
            ..Default::default()
        };
        publish(&broker, "pub", packet.clone());

        {
            let state = broker.shared.state.lock().unwrap();
            let retained = state.topics.get("t/").unwrap().retained.clone().unwrap();
            let mut buffer = BytesMut::from(&retained[..]);
            match ControlPacket::parse(&mut buffer).unwrap() {
                ControlPacket::Publish(p) => {
                    assert_eq!(p.payload.as_ref(), b"p1");
                    assert_eq!(p.topic, "t/");
                    assert!(p.retain);
                }
                other => panic!("expected PUBLISH, got {:?}", other),
            }
        }

        packet.payload = Bytes::from_static(b"p2");
        publish(&broker, "pub", packet.clone());

        {
            let state = broker.shared.state.lock().unwrap();
            let retained = state.topics.get("t/").unwrap().retained.clone().unwrap();
            let mut buffer = BytesMut::from(&retained[..]);
            match ControlPacket::parse(&mut buffer).unwrap() {
                ControlPacket::Publish(p) => assert_eq!(p.payload.as_ref(), b"p2"),
                other => panic!("expected PUBLISH, got {:?}", other),
            }
        }

        packet.payload = Bytes::new();
        publish(&broker, "pub", packet);

        let state = broker.shared.state.lock().unwrap();
        assert!(state.topics.get("t/").unwrap().retained.is_none());
    }

    #[test]
    fn test_wildcard_subscribe_installs_one_shared_record() {
        let broker = Broker::new(BrokerConfig::default());
        let _pub_rx = connect(&broker, "pub", true);

        for (t, m) in [("a/b", "m1"), ("a/c", "m2")] {
            publish(
                &broker,
                "pub",
                PublishPacket {
                    retain: true,
                    topic: t.to_string(),
                    payload: Bytes::from(m.to_string()),
                    ..Default::default()
                },
            );
        }

        let mut rx = connect(&broker, "sub", true);
        assert!(matches!(recv_packet(&mut rx), ControlPacket::ConnAck(_)));

        subscribe(&broker, "sub", "a/#", QoS::AtLeastOnce);

        {
            let state = broker.shared.state.lock().unwrap();
            let record_b = Arc::clone(&state.topics.get("a/b/").unwrap().subscribers["sub"]);
            let record_c = Arc::clone(&state.topics.get("a/c/").unwrap().subscribers["sub"]);
            assert!(Arc::ptr_eq(&record_b, &record_c));
            assert_eq!(record_b.refs(), 2);
        }

        // Both retained messages precede the SUBACK.
        let mut payloads = Vec::new();
        for _ in 0..2 {
            match recv_packet(&mut rx) {
                ControlPacket::Publish(p) => payloads.push(p.payload),
                other => panic!("expected retained PUBLISH, got {:?}", other),
            }
        }
        payloads.sort();
        assert_eq!(payloads, vec![Bytes::from_static(b"m1"), Bytes::from_static(b"m2")]);
        assert!(matches!(recv_packet(&mut rx), ControlPacket::SubAck(_)));
    }

    #[test]
    fn test_qos2_inbound_flow_tracks_inflight() {
        let broker = Broker::new(BrokerConfig::default());
        let mut rx = connect(&broker, "pub", true);
        assert!(matches!(recv_packet(&mut rx), ControlPacket::ConnAck(_)));

        let outcome = publish(
            &broker,
            "pub",
            PublishPacket {
                qos: QoS::ExactlyOnce,
                topic: "q2".to_string(),
                packet_id: Some(7),
                payload: Bytes::from_static(b"x"),
                ..Default::default()
            },
        );
        assert_eq!(outcome, HandlerOutcome::Reply);

        match recv_packet(&mut rx) {
            ControlPacket::PubRec(p) => assert_eq!(p.packet_id, 7),
            other => panic!("expected PUBREC, got {:?}", other),
        }

        {
            let state = broker.shared.state.lock().unwrap();
            assert!(state.sessions["pub"].inbound_qos2_pending(7));
        }

        let outcome = broker.dispatch(
            "pub",
            ControlPacket::PubRel(PubRelPacket { packet_id: 7 }),
        );
        assert_eq!(outcome, HandlerOutcome::Reply);

        match recv_packet(&mut rx) {
            ControlPacket::PubComp(p) => assert_eq!(p.packet_id, 7),
            other => panic!("expected PUBCOMP, got {:?}", other),
        }

        let state = broker.shared.state.lock().unwrap();
        assert!(!state.sessions["pub"].inbound_qos2_pending(7));
        assert!(!state.sessions["pub"].has_inflight());
    }

    #[test]
    fn test_qos2_outbound_flow_releases_all_slots() {
        let broker = Broker::new(BrokerConfig::default());
        let _pub_rx = connect(&broker, "pub", true);
        let mut rx = connect(&broker, "sub", true);
        assert!(matches!(recv_packet(&mut rx), ControlPacket::ConnAck(_)));

        subscribe(&broker, "sub", "q2", QoS::ExactlyOnce);
        assert!(matches!(recv_packet(&mut rx), ControlPacket::SubAck(_)));

        publish(
            &broker,
            "pub",
            PublishPacket {
                qos: QoS::ExactlyOnce,
                topic: "q2".to_string(),
                packet_id: Some(3),
                payload: Bytes::from_static(b"x"),
                ..Default::default()
            },
        );

        let mid = match recv_packet(&mut rx) {
            ControlPacket::Publish(p) => {
                assert_eq!(p.qos, QoS::ExactlyOnce);
                p.packet_id.expect("QoS 2 delivery must carry a packet id")
            }
            other => panic!("expected PUBLISH, got {:?}", other),
        };

        {
            let state = broker.shared.state.lock().unwrap();
            let session = &state.sessions["sub"];
            assert!(session.outbound_publish(mid).is_some());
            assert_eq!(session.outbound_state(mid), Some(AckState::AwaitPubRec));
        }

        broker.dispatch("sub", ControlPacket::PubRec(PubRecPacket { packet_id: mid }));
        match recv_packet(&mut rx) {
            ControlPacket::PubRel(p) => assert_eq!(p.packet_id, mid),
            other => panic!("expected PUBREL, got {:?}", other),
        }

        {
            let state = broker.shared.state.lock().unwrap();
            assert_eq!(
                state.sessions["sub"].outbound_state(mid),
                Some(AckState::AwaitPubComp)
            );
        }

        broker.dispatch("sub", ControlPacket::PubComp(PubCompPacket { packet_id: mid }));

        let state = broker.shared.state.lock().unwrap();
        assert!(!state.sessions["sub"].has_inflight());
    }

    #[test]
    fn test_double_puback_is_noop() {
        let broker = Broker::new(BrokerConfig::default());
        let _pub_rx = connect(&broker, "pub", true);
        let mut rx = connect(&broker, "sub", true);
        assert!(matches!(recv_packet(&mut rx), ControlPacket::ConnAck(_)));

        subscribe(&broker, "sub", "q1", QoS::AtLeastOnce);
        assert!(matches!(recv_packet(&mut rx), ControlPacket::SubAck(_)));

        publish(
            &broker,
            "pub",
            PublishPacket {
                qos: QoS::AtLeastOnce,
                topic: "q1".to_string(),
                packet_id: Some(11),
                payload: Bytes::from_static(b"x"),
                ..Default::default()
            },
        );

        let mid = match recv_packet(&mut rx) {
            ControlPacket::Publish(p) => p.packet_id.unwrap(),
            other => panic!("expected PUBLISH, got {:?}", other),
        };

        let first = broker.dispatch("sub", ControlPacket::PubAck(PubAckPacket { packet_id: mid }));
        assert_eq!(first, HandlerOutcome::NoReply);
        let second = broker.dispatch("sub", ControlPacket::PubAck(PubAckPacket { packet_id: mid }));
        assert_eq!(second, HandlerOutcome::NoReply);

        let state = broker.shared.state.lock().unwrap();
        assert!(!state.sessions["sub"].has_inflight());
    }

    #[test]
    fn test_will_published_on_abnormal_disconnect() {
        let broker = Broker::new(BrokerConfig::default());

        let mut watcher_rx = connect(&broker, "watcher", true);
        assert!(matches!(recv_packet(&mut watcher_rx), ControlPacket::ConnAck(_)));
        subscribe(&broker, "watcher", "status/dev", QoS::AtMostOnce);
        assert!(matches!(recv_packet(&mut watcher_rx), ControlPacket::SubAck(_)));

        let (tx, _dev_rx) = mpsc::unbounded_channel();
        let packet = ConnectPacket {
            protocol_level: PROTOCOL_LEVEL,
            flags: ConnectFlags {
                clean_session: true,
                will: true,
                will_qos: QoS::AtMostOnce,
                ..Default::default()
            },
            keepalive: 10,
            client_id: "dev".to_string(),
            will_topic: Some("status/dev".to_string()),
            will_payload: Some(Bytes::from_static(b"gone")),
            ..Default::default()
        };
        assert!(matches!(
            broker.connect(packet, tx),
            ConnectOutcome::Accepted { .. }
        ));

        broker.connection_closed("dev", false);

        match recv_packet(&mut watcher_rx) {
            ControlPacket::Publish(p) => {
                assert_eq!(p.topic, "status/dev/");
                assert_eq!(p.payload.as_ref(), b"gone");
            }
            other => panic!("expected will PUBLISH, got {:?}", other),
        }
    }

    #[test]
    fn test_will_discarded_on_clean_disconnect() {
        let broker = Broker::new(BrokerConfig::default());

        let mut watcher_rx = connect(&broker, "watcher", true);
        assert!(matches!(recv_packet(&mut watcher_rx), ControlPacket::ConnAck(_)));
        subscribe(&broker, "watcher", "status/dev", QoS::AtMostOnce);
        assert!(matches!(recv_packet(&mut watcher_rx), ControlPacket::SubAck(_)));

        let (tx, _dev_rx) = mpsc::unbounded_channel();
        let packet = ConnectPacket {
            protocol_level: PROTOCOL_LEVEL,
            flags: ConnectFlags {
                clean_session: true,
                will: true,
                will_qos: QoS::AtMostOnce,
                ..Default::default()
            },
            keepalive: 10,
            client_id: "dev".to_string(),
            will_topic: Some("status/dev".to_string()),
            will_payload: Some(Bytes::from_static(b"gone")),
            ..Default::default()
        };
        broker.connect(packet, tx);

        let outcome = broker.dispatch("dev", ControlPacket::Disconnect(Default::default()));
        assert_eq!(outcome, HandlerOutcome::Disconnect);
        broker.connection_closed("dev", true);

        assert!(watcher_rx.try_recv().is_err());
    }

    #[test]
    fn test_clean_session_teardown_removes_subscriptions() {
        let broker = Broker::new(BrokerConfig::default());
        let _rx = connect(&broker, "c1", true);
        subscribe(&broker, "c1", "a/b", QoS::AtMostOnce);

        broker.dispatch("c1", ControlPacket::Disconnect(Default::default()));
        broker.connection_closed("c1", true);

        let state = broker.shared.state.lock().unwrap();
        assert!(!state.sessions.contains_key("c1"));
        assert!(state.topics.get("a/b/").unwrap().subscribers.is_empty());
    }

    #[test]
    fn test_persistent_session_survives_disconnect() {
        let broker = Broker::new(BrokerConfig::default());
        let _rx = connect(&broker, "c1", false);
        subscribe(&broker, "c1", "a/b", QoS::AtLeastOnce);

        broker.dispatch("c1", ControlPacket::Disconnect(Default::default()));
        broker.connection_closed("c1", true);

        let state = broker.shared.state.lock().unwrap();
        let session = &state.sessions["c1"];
        assert!(!session.online);
        assert_eq!(session.subscriptions, vec!["a/b/".to_string()]);
        assert!(state.topics.get("a/b/").unwrap().subscribers.contains_key("c1"));
    }

    #[test]
    fn test_retained_will_installed_at_connect() {
        let broker = Broker::new(BrokerConfig::default());

        let (tx, _rx) = mpsc::unbounded_channel();
        let packet = ConnectPacket {
            protocol_level: PROTOCOL_LEVEL,
            flags: ConnectFlags {
                clean_session: true,
                will: true,
                will_qos: QoS::AtMostOnce,
                will_retain: true,
                ..Default::default()
            },
            keepalive: 10,
            client_id: "dev".to_string(),
            will_topic: Some("status/dev".to_string()),
            will_payload: Some(Bytes::from_static(b"gone")),
            ..Default::default()
        };
        broker.connect(packet, tx);

        let state = broker.shared.state.lock().unwrap();
        let retained = state.topics.get("status/dev/").unwrap().retained.clone();
        let mut buffer = BytesMut::from(&retained.unwrap()[..]);
        match ControlPacket::parse(&mut buffer).unwrap() {
            ControlPacket::Publish(p) => {
                assert_eq!(p.payload.as_ref(), b"gone");
                assert!(p.retain);
            }
            other => panic!("expected PUBLISH, got {:?}", other),
        }
    }

    #[test]
    fn test_unsubscribe_wildcard_detaches_descendants() {
        let broker = Broker::new(BrokerConfig::default());
        let _pub_rx = connect(&broker, "pub", true);
        publish(
            &broker,
            "pub",
            PublishPacket {
                topic: "a/b".to_string(),
                payload: Bytes::from_static(b"x"),
                ..Default::default()
            },
        );

        let mut rx = connect(&broker, "sub", true);
        assert!(matches!(recv_packet(&mut rx), ControlPacket::ConnAck(_)));
        subscribe(&broker, "sub", "a/#", QoS::AtMostOnce);

        let outcome = broker.dispatch(
            "sub",
            ControlPacket::Unsubscribe(UnsubscribePacket {
                packet_id: 9,
                filters: vec!["a/#".to_string()],
            }),
        );
        assert_eq!(outcome, HandlerOutcome::Reply);

        let state = broker.shared.state.lock().unwrap();
        assert!(state.topics.get("a/b/").unwrap().subscribers.is_empty());
        assert!(state.sessions["sub"].subscriptions.is_empty());
    }

    #[test]
    fn test_stats_count_messages() {
        let broker = Broker::new(BrokerConfig::default());
        let _pub_rx = connect(&broker, "pub", true);
        let mut rx = connect(&broker, "sub", true);
        assert!(matches!(recv_packet(&mut rx), ControlPacket::ConnAck(_)));
        subscribe(&broker, "sub", "t", QoS::AtMostOnce);

        publish(
            &broker,
            "pub",
            PublishPacket {
                topic: "t".to_string(),
                payload: Bytes::from_static(b"x"),
                ..Default::default()
            },
        );

        assert_eq!(broker.stats().messages_received(), 1);
        assert_eq!(broker.stats().messages_sent(), 1);
        assert_eq!(broker.stats().connected_clients(), 2);
    }
}
