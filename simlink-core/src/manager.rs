//! Reliable transport over one simulator circuit: sequence numbers, ACKs, the resend
//! queue and ping handling. Host-driven: call `process_messages` once per frame.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::config::ManagerConfig;
use crate::connection::{ConnectError, ConnectionStats, NetworkConnection};
use crate::message::{FieldValue, InboundMessage, OutboundMessage};
use crate::sequence::{self, ReceivedSequenceSet};
use crate::template::{BlockQuantity, FieldType, MessageDictionary, MessageId, MessageTemplate};
use crate::wire::{self, WireError, MAX_APPENDED_ACKS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// A reliable message ran out of resends without being acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailed {
    pub sequence: u32,
    pub id: MessageId,
    pub name: String,
    /// Times the datagram went out, including the first send.
    pub attempts: u32,
}

/// Receives everything the manager surfaces. One listener at a time.
pub trait NetMessageListener: Send {
    fn on_network_message_received(&mut self, id: MessageId, msg: &InboundMessage);

    fn on_network_message_sent(&mut self, _msg: &OutboundMessage) {}

    fn on_delivery_failed(&mut self, _failure: &DeliveryFailed) {}

    /// The circuit was dropped after repeated send errors.
    fn on_connection_lost(&mut self) {}
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("not connected")]
    NotConnected,
    #[error("unknown message id {0}")]
    UnknownMessageId(MessageId),
    #[error("unknown message {0}")]
    UnknownMessage(String),
    #[error("dictionary lacks a usable {0} template")]
    MissingControlMessage(&'static str),
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManagerStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub duplicates_dropped: u64,
    pub malformed_dropped: u64,
    pub unknown_dropped: u64,
    pub resends: u64,
    pub delivery_failures: u64,
    pub acks_sent: u64,
}

/// Reliable datagram waiting for its ACK.
struct PendingMessage {
    id: MessageId,
    name: String,
    datagram: Vec<u8>,
    order: u64,
    last_sent: Instant,
    resends: u32,
}

/// Templates the manager consumes itself.
struct ControlTemplates {
    packet_ack: Arc<MessageTemplate>,
    start_ping: Arc<MessageTemplate>,
    complete_ping: Arc<MessageTemplate>,
}

impl ControlTemplates {
    fn resolve(dict: &MessageDictionary) -> Result<Self, ManagerError> {
        Ok(Self {
            packet_ack: require(dict, "PacketAck", "Packets", &[FieldType::U32])?,
            start_ping: require(dict, "StartPingCheck", "PingID", &[FieldType::U8, FieldType::U32])?,
            complete_ping: require(dict, "CompletePingCheck", "PingID", &[FieldType::U8])?,
        })
    }
}

fn require(
    dict: &MessageDictionary,
    name: &'static str,
    block: &str,
    fields: &[FieldType],
) -> Result<Arc<MessageTemplate>, ManagerError> {
    let template = dict
        .by_name(name)
        .ok_or(ManagerError::MissingControlMessage(name))?;
    let usable = template.blocks.len() == 1
        && template.blocks[0].name == block
        && template.blocks[0]
            .fields
            .iter()
            .map(|f| f.kind)
            .eq(fields.iter().copied());
    let quantity_ok = match name {
        "PacketAck" => template.blocks.first().map(|b| b.quantity) == Some(BlockQuantity::Variable),
        _ => template.blocks.first().map(|b| b.quantity) == Some(BlockQuantity::Single),
    };
    if !usable || !quantity_ok {
        return Err(ManagerError::MissingControlMessage(name));
    }
    Ok(Arc::clone(template))
}

/// Connection lifecycle, sequencing, ACK protocol, resend queue and ping/pong.
pub struct NetMessageManager {
    dictionary: Arc<MessageDictionary>,
    config: ManagerConfig,
    control: ControlTemplates,
    listener: Option<Box<dyn NetMessageListener>>,
    connection: Option<NetworkConnection>,
    state: ConnectionState,
    next_sequence: u32,
    resend_queue: HashMap<u32, PendingMessage>,
    resend_order: u64,
    received: ReceivedSequenceSet,
    pending_acks: Vec<u32>,
    /// Mirror of `pending_acks` for constant-time dedup.
    pending_ack_set: HashSet<u32>,
    send_failures: u32,
    next_ping_id: u8,
    outstanding_ping: Option<(u8, Instant)>,
    last_ping_sent: Option<Instant>,
    last_ping_rtt: Option<Duration>,
    stats: ManagerStats,
}

impl NetMessageManager {
    /// Starts disconnected. Fails if the dictionary lacks PacketAck, StartPingCheck or CompletePingCheck.
    pub fn new(
        dictionary: Arc<MessageDictionary>,
        config: ManagerConfig,
    ) -> Result<Self, ManagerError> {
        let control = ControlTemplates::resolve(&dictionary)?;
        let received = ReceivedSequenceSet::new(config.received_window);
        Ok(Self {
            dictionary,
            config,
            control,
            listener: None,
            connection: None,
            state: ConnectionState::Disconnected,
            next_sequence: 1,
            resend_queue: HashMap::new(),
            resend_order: 0,
            received,
            pending_acks: Vec::new(),
            pending_ack_set: HashSet::new(),
            send_failures: 0,
            next_ping_id: 0,
            outstanding_ping: None,
            last_ping_sent: None,
            last_ping_rtt: None,
            stats: ManagerStats::default(),
        })
    }

    /// Replace the current listener.
    pub fn register_listener(&mut self, listener: Box<dyn NetMessageListener>) {
        self.listener = Some(listener);
    }

    pub fn unregister_listener(&mut self) -> Option<Box<dyn NetMessageListener>> {
        self.listener.take()
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Local socket address while connected.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.connection.as_ref().and_then(|c| c.local_addr().ok())
    }

    pub fn resend_queue_len(&self) -> usize {
        self.resend_queue.len()
    }

    pub fn is_awaiting_ack(&self, sequence: u32) -> bool {
        self.resend_queue.contains_key(&sequence)
    }

    pub fn last_ping_rtt(&self) -> Option<Duration> {
        self.last_ping_rtt
    }

    pub fn stats(&self) -> ManagerStats {
        self.stats
    }

    pub fn connection_stats(&self) -> Option<ConnectionStats> {
        self.connection.as_ref().map(|c| c.stats())
    }

    /// Open the circuit. Any existing circuit is dropped first; sequence numbers restart at 1.
    pub fn connect_to(&mut self, address: &str, port: u16) -> Result<(), ConnectError> {
        if self.state != ConnectionState::Disconnected {
            self.disconnect();
        }
        self.state = ConnectionState::Connecting;
        match NetworkConnection::open(address, port) {
            Ok(conn) => {
                info!(remote = %conn.remote_addr(), "connected");
                self.connection = Some(conn);
                self.state = ConnectionState::Connected;
                self.next_sequence = 1;
                self.send_failures = 0;
                self.last_ping_sent = Some(Instant::now());
                Ok(())
            }
            Err(e) => {
                warn!(address, port, error = %e, "connect failed");
                self.state = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    /// Close the circuit. Unacknowledged reliable messages are discarded without failure reports.
    pub fn disconnect(&mut self) {
        if let Some(conn) = self.connection.take() {
            conn.close();
        }
        if !self.resend_queue.is_empty() {
            debug!(
                discarded = self.resend_queue.len(),
                "dropping unacknowledged messages"
            );
        }
        self.resend_queue.clear();
        self.pending_acks.clear();
        self.pending_ack_set.clear();
        self.received.clear();
        self.outstanding_ping = None;
        self.last_ping_sent = None;
        self.state = ConnectionState::Disconnected;
    }

    /// Empty message for `id`, reliability taken from its template.
    pub fn start_new_message(&self, id: MessageId) -> Result<OutboundMessage, ManagerError> {
        let template = self
            .dictionary
            .by_id(id)
            .ok_or(ManagerError::UnknownMessageId(id))?;
        Ok(OutboundMessage::new(Arc::clone(template)))
    }

    pub fn start_new_message_by_name(&self, name: &str) -> Result<OutboundMessage, ManagerError> {
        let template = self
            .dictionary
            .by_name(name)
            .ok_or_else(|| ManagerError::UnknownMessage(name.to_string()))?;
        Ok(OutboundMessage::new(Arc::clone(template)))
    }

    /// Assign the next sequence number, send, and queue for resend if reliable.
    /// Returns the sequence number. Encoding errors leave the counter untouched.
    pub fn finish_message(&mut self, mut msg: OutboundMessage) -> Result<u32, ManagerError> {
        if self.state != ConnectionState::Connected {
            return Err(ManagerError::NotConnected);
        }
        let seq = self.next_sequence;
        let datagram =
            wire::encode_datagram(msg.template(), msg.blocks(), seq, msg.is_reliable(), &[])?;
        self.next_sequence = sequence::next(seq);
        msg.set_sequence(seq);

        if msg.is_reliable() {
            self.resend_order += 1;
            self.resend_queue.insert(
                seq,
                PendingMessage {
                    id: msg.id(),
                    name: msg.name().to_string(),
                    datagram: datagram.clone(),
                    order: self.resend_order,
                    last_sent: Instant::now(),
                    resends: 0,
                },
            );
        }
        trace!(seq, message = msg.name(), reliable = msg.is_reliable(), "sending");
        self.transmit(&datagram);
        self.stats.messages_sent += 1;
        if let Some(listener) = self.listener.as_mut() {
            listener.on_network_message_sent(&msg);
        }
        Ok(seq)
    }

    /// Drain inbound datagrams, resend what timed out, ping if due and flush owed ACKs.
    pub fn process_messages(&mut self) {
        if self.state != ConnectionState::Connected {
            return;
        }
        while let Some(datagram) = self.connection.as_mut().and_then(|c| c.try_receive()) {
            self.handle_datagram(&datagram);
            if self.state != ConnectionState::Connected {
                return;
            }
        }
        let now = Instant::now();
        self.process_resend_queue(now);
        self.send_keepalive_ping(now);
        self.flush_acks();
    }

    fn handle_datagram(&mut self, bytes: &[u8]) {
        let (header, raw_body, acks) = match wire::split_datagram(bytes) {
            Ok(parts) => parts,
            Err(e) => {
                self.stats.malformed_dropped += 1;
                warn!(error = %e, len = bytes.len(), "dropping malformed datagram");
                return;
            }
        };
        for ack in acks {
            self.acknowledge(ack);
        }

        if header.is_reliable() && self.received.contains(header.sequence) {
            self.stats.duplicates_dropped += 1;
            trace!(seq = header.sequence, "duplicate reliable message");
            self.queue_ack(header.sequence);
            return;
        }
        // Acknowledged even if the body turns out undecodable, so the peer stops resending it.
        if header.is_reliable() {
            self.received.insert(header.sequence);
            self.queue_ack(header.sequence);
        }

        let msg = match wire::decode_body(&self.dictionary, header, raw_body) {
            Ok(msg) => msg,
            Err(e) => {
                if e.is_malformed() {
                    self.stats.malformed_dropped += 1;
                } else {
                    self.stats.unknown_dropped += 1;
                }
                warn!(seq = header.sequence, error = %e, "dropping undecodable message");
                return;
            }
        };
        self.stats.messages_received += 1;
        trace!(message = %msg, "received");

        let id = msg.id();
        if id == self.control.packet_ack.id {
            for instance in msg.block("Packets") {
                if let Some(seq) = instance.first().and_then(FieldValue::as_u32) {
                    self.acknowledge(seq);
                }
            }
        } else if id == self.control.start_ping.id {
            let ping_id = msg
                .field("PingID", 0, "PingID")
                .and_then(FieldValue::as_u8)
                .unwrap_or(0);
            self.send_complete_ping(ping_id);
        } else if id == self.control.complete_ping.id {
            let ping_id = msg.field("PingID", 0, "PingID").and_then(FieldValue::as_u8);
            if let Some((outstanding, sent)) = self.outstanding_ping {
                if ping_id == Some(outstanding) {
                    self.last_ping_rtt = Some(sent.elapsed());
                    self.outstanding_ping = None;
                }
            }
        } else if let Some(listener) = self.listener.as_mut() {
            listener.on_network_message_received(id, &msg);
        }
    }

    fn acknowledge(&mut self, seq: u32) {
        if let Some(pending) = self.resend_queue.remove(&seq) {
            trace!(seq, message = %pending.name, resends = pending.resends, "acknowledged");
        }
    }

    fn queue_ack(&mut self, seq: u32) {
        if self.pending_ack_set.insert(seq) {
            self.pending_acks.push(seq);
        }
    }

    fn take_pending_acks(&mut self) -> Vec<u32> {
        let n = self.pending_acks.len().min(MAX_APPENDED_ACKS);
        let batch: Vec<u32> = self.pending_acks.drain(..n).collect();
        for seq in &batch {
            self.pending_ack_set.remove(seq);
        }
        batch
    }

    fn process_resend_queue(&mut self, now: Instant) {
        let timeout = self.config.resend_timeout();
        let mut due: Vec<(u64, u32)> = self
            .resend_queue
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.last_sent) >= timeout)
            .map(|(&seq, p)| (p.order, seq))
            .collect();
        due.sort_unstable();

        for (_, seq) in due {
            let exhausted = self
                .resend_queue
                .get(&seq)
                .map_or(false, |p| p.resends >= self.config.max_resends);
            if exhausted {
                if let Some(pending) = self.resend_queue.remove(&seq) {
                    self.stats.delivery_failures += 1;
                    let failure = DeliveryFailed {
                        sequence: seq,
                        id: pending.id,
                        name: pending.name,
                        attempts: pending.resends + 1,
                    };
                    warn!(
                        seq,
                        message = %failure.name,
                        attempts = failure.attempts,
                        "reliable message never acknowledged"
                    );
                    if let Some(listener) = self.listener.as_mut() {
                        listener.on_delivery_failed(&failure);
                    }
                }
                continue;
            }
            let datagram = match self.resend_queue.get_mut(&seq) {
                Some(pending) => {
                    pending.resends += 1;
                    pending.last_sent = now;
                    wire::mark_resent(&mut pending.datagram);
                    pending.datagram.clone()
                }
                None => continue,
            };
            self.stats.resends += 1;
            debug!(seq, "resending");
            self.transmit(&datagram);
            if self.state != ConnectionState::Connected {
                return;
            }
        }
    }

    fn send_complete_ping(&mut self, ping_id: u8) {
        let mut msg = OutboundMessage::new(Arc::clone(&self.control.complete_ping));
        if msg.add_block("PingID", vec![FieldValue::U8(ping_id)]).is_err() {
            return;
        }
        let acks = self.take_pending_acks();
        self.send_control(&msg, acks);
    }

    fn send_keepalive_ping(&mut self, now: Instant) {
        let Some(interval) = self.config.ping_interval() else {
            return;
        };
        let due = self
            .last_ping_sent
            .map_or(true, |t| now.saturating_duration_since(t) >= interval);
        if !due {
            return;
        }
        self.last_ping_sent = Some(now);
        let ping_id = self.next_ping_id;
        self.next_ping_id = self.next_ping_id.wrapping_add(1);
        let oldest = self.oldest_unacked().unwrap_or(self.next_sequence);

        let mut msg = OutboundMessage::new(Arc::clone(&self.control.start_ping));
        if msg
            .add_block("PingID", vec![FieldValue::U8(ping_id), FieldValue::U32(oldest)])
            .is_err()
        {
            return;
        }
        self.outstanding_ping = Some((ping_id, now));
        let acks = self.take_pending_acks();
        self.send_control(&msg, acks);
    }

    fn oldest_unacked(&self) -> Option<u32> {
        self.resend_queue
            .keys()
            .copied()
            .reduce(|a, b| if sequence::is_newer(a, b) { b } else { a })
    }

    /// Send every owed ACK as PacketAck messages of at most 255 ids.
    fn flush_acks(&mut self) {
        while !self.pending_acks.is_empty() && self.state == ConnectionState::Connected {
            let batch = self.take_pending_acks();
            let mut msg = OutboundMessage::new(Arc::clone(&self.control.packet_ack));
            for &seq in &batch {
                if msg.add_block("Packets", vec![FieldValue::U32(seq)]).is_err() {
                    break;
                }
            }
            self.stats.acks_sent += batch.len() as u64;
            self.send_control(&msg, Vec::new());
        }
    }

    /// Unreliable, outside the resend queue, optionally carrying appended ACKs.
    fn send_control(&mut self, msg: &OutboundMessage, acks: Vec<u32>) {
        let seq = self.next_sequence;
        match wire::encode_datagram(msg.template(), msg.blocks(), seq, false, &acks) {
            Ok(datagram) => {
                self.next_sequence = sequence::next(seq);
                self.stats.acks_sent += acks.len() as u64;
                self.transmit(&datagram);
            }
            Err(e) => {
                warn!(message = msg.name(), error = %e, "control message not encodable");
                for seq in acks {
                    self.queue_ack(seq);
                }
            }
        }
    }

    fn transmit(&mut self, datagram: &[u8]) {
        let Some(conn) = self.connection.as_mut() else {
            return;
        };
        let result = conn.send(datagram);
        match result {
            Ok(true) => self.send_failures = 0,
            Ok(false) => debug!("socket buffer full, datagram dropped"),
            Err(e) => {
                self.send_failures += 1;
                warn!(error = %e, failures = self.send_failures, "send failed");
                if self.send_failures >= self.config.max_send_failures {
                    warn!("too many send failures, dropping circuit");
                    self.disconnect();
                    if let Some(listener) = self.listener.as_mut() {
                        listener.on_connection_lost();
                    }
                }
            }
        }
    }
}

impl Drop for NetMessageManager {
    fn drop(&mut self) {
        if self.state != ConnectionState::Disconnected {
            self.disconnect();
        }
    }
}
