//! # MQTT Client Core
//!
//! The network task half of the client. `MqttClient::run` owns the transport,
//! the subscription table and all protocol state, and never returns: it
//! connects, serves the session, and reconnects with backoff when the link
//! drops. Application tasks talk to it exclusively through [`MqttHandle`],
//! so no protocol state is ever shared across tasks.
//!
//! ## Subscription reconciliation
//!
//! Subscriptions are desired state. Each table entry records what the
//! application wants and what the broker currently has; whenever the two
//! disagree and no request is in flight, the client issues a SUBSCRIBE or
//! UNSUBSCRIBE to converge them. Failures arm a per-subscription backoff
//! retry, and a reconnect simply marks every entry out of sync so the fresh
//! session is reconciled from scratch. Wanting and having are updated from
//! one task only, so there are no ordering surprises: the last request
//! processed wins.

use core::cmp::min;

use embassy_futures::select::{select, select3, Either, Either3};
use embassy_time::{Duration, Instant, Timer};
use heapless::Vec;

use crate::backoff::next_delay;
use crate::completion::{CompletionPool, Token};
use crate::error::{ClientError, MqttError, ProtocolError};
use crate::fmt::Debug2Format;
use crate::handle::{MqttHandle, Request, RequestChannel, RequestReceiver, COMPLETION_SLOTS};
use crate::packet::{
    self, ConnAck, Connect, DecodePacket, EncodePacket, MqttPacket, PingReq, PubAck, PubComp,
    PubRec, PubRel, Publish, QoS, SubAck, Subscribe, Unsubscribe,
};
use crate::reassembly::Reassembler;
use crate::subscription::{SubKey, Subscription, SubscriptionTable, TransitionPolicy, MAX_TOPIC_LEN};
use crate::transport::{ErrorPlaceHolder, MqttTransport, TransportError};
use crate::util::parse_fixed_header;

/// Maximum payload size for outgoing publishes and reassembled inbound
/// messages.
pub const MAX_PAYLOAD_LEN: usize = 1024;

/// Transport reads are bounded by this, so large inbound messages arrive as
/// several chunks.
const RECV_BUF_LEN: usize = 256;

/// Staging buffer for packet headers and small control packets. Must hold a
/// full PUBLISH header (topic plus packet id) or any non-PUBLISH packet.
const RX_STAGE_LEN: usize = 192;

const TX_BUF_LEN: usize = MAX_PAYLOAD_LEN + MAX_TOPIC_LEN + 16;

const CONNACK_TIMEOUT: Duration = Duration::from_secs(5);
const PING_RESP_TIMEOUT: Duration = Duration::from_secs(10);

/// A last-will message registered with the broker at connect time.
#[derive(Debug, Clone, Copy)]
pub struct LastWill<'a> {
    pub topic: &'a str,
    pub message: &'a [u8],
    pub qos: QoS,
    pub retain: bool,
}

/// Connection options, borrowed for the life of the client.
#[derive(Debug, Clone)]
pub struct MqttOptions<'a> {
    pub client_id: &'a str,
    pub username: Option<&'a str>,
    pub password: Option<&'a str>,
    /// Keep-alive interval in seconds. Zero disables client pings.
    pub keep_alive: u16,
    pub clean_session: bool,
    pub last_will: Option<LastWill<'a>>,
}

impl<'a> MqttOptions<'a> {
    pub fn new(client_id: &'a str) -> Self {
        Self {
            client_id,
            username: None,
            password: None,
            keep_alive: 60,
            clean_session: true,
            last_will: None,
        }
    }
}

/// The channel and completion pool shared between the client and its handles.
///
/// Lives wherever the application keeps long-lived state (typically a
/// `StaticCell`); [`Self::split`] hands out the two halves.
pub struct MqttState {
    requests: RequestChannel,
    completions: CompletionPool<COMPLETION_SLOTS>,
}

impl MqttState {
    pub fn new() -> Self {
        Self {
            requests: RequestChannel::new(),
            completions: CompletionPool::new(),
        }
    }

    /// Splits into the network-task half and the application-facing handle.
    ///
    /// `MAX_SUBS` bounds how many distinct subscription filters the client
    /// tracks at once.
    pub fn split<'a, T, const MAX_SUBS: usize>(
        &'a self,
        transport: T,
        options: MqttOptions<'a>,
    ) -> (MqttClient<'a, T, MAX_SUBS>, MqttHandle<'a>)
    where
        T: MqttTransport,
        T::Error: TransportError,
    {
        (
            MqttClient::new(transport, options, self.requests.receiver(), &self.completions),
            MqttHandle::new(self.requests.sender(), &self.completions),
        )
    }
}

impl Default for MqttState {
    fn default() -> Self {
        Self::new()
    }
}

/// Inbound byte-stream parser state.
enum RxState {
    /// Staging bytes until a complete header (and for small packets, the
    /// whole packet) is available.
    Collect,
    /// Streaming a PUBLISH payload to the reassembler.
    PublishPayload { remaining: usize },
    /// Discarding the rest of a packet we cannot or need not process.
    Skip { remaining: usize },
}

/// A QoS > 0 publish awaiting its broker acknowledgement.
struct PendingAck {
    packet_id: u16,
    qos: QoS,
    token: Option<Token>,
    /// QoS 2 only: PUBREC seen, waiting for PUBCOMP.
    got_pubrec: bool,
}

/// Control packets queued while parsing a received chunk, sent afterwards.
#[derive(Debug, Clone, Copy)]
enum Outgoing {
    PubAck(u16),
    PubRec(u16),
    PubRel(u16),
    PubComp(u16),
}

// A chunk of RECV_BUF_LEN bytes cannot hold more ack-producing packets than
// this, as each is at least four bytes on the wire.
type AckQueue = Vec<Outgoing, { RECV_BUF_LEN / 4 }>;

/// The network task half of the client. Drive it by awaiting [`Self::run`].
pub struct MqttClient<'a, T: MqttTransport, const MAX_SUBS: usize = 8> {
    transport: T,
    options: MqttOptions<'a>,
    requests: RequestReceiver<'a>,
    completions: &'a CompletionPool<COMPLETION_SLOTS>,
    table: SubscriptionTable<MAX_SUBS>,
    reassembler: Reassembler,
    pending_acks: Vec<PendingAck, COMPLETION_SLOTS>,
    connected: bool,
    next_packet_id: u16,
    rx_state: RxState,
    rx_stage: Vec<u8, RX_STAGE_LEN>,
    /// QoS and packet id of the PUBLISH currently being streamed.
    inbound_pub: Option<(QoS, Option<u16>)>,
    next_ping_at: Instant,
    ping_resp_deadline: Option<Instant>,
    tx_buf: [u8; TX_BUF_LEN],
}

impl<'a, T, const MAX_SUBS: usize> MqttClient<'a, T, MAX_SUBS>
where
    T: MqttTransport,
    T::Error: TransportError,
{
    fn new(
        transport: T,
        options: MqttOptions<'a>,
        requests: RequestReceiver<'a>,
        completions: &'a CompletionPool<COMPLETION_SLOTS>,
    ) -> Self {
        Self {
            transport,
            options,
            requests,
            completions,
            table: SubscriptionTable::new(),
            reassembler: Reassembler::new(),
            pending_acks: Vec::new(),
            connected: false,
            next_packet_id: 1,
            rx_state: RxState::Collect,
            rx_stage: Vec::new(),
            inbound_pub: None,
            next_ping_at: Instant::now(),
            ping_resp_deadline: None,
            tx_buf: [0; TX_BUF_LEN],
        }
    }

    /// Runs the client forever: connect, serve the session, reconnect with
    /// backoff. Requests keep being answered while disconnected (publishes
    /// fail fast, subscription desires are recorded for the next session).
    pub async fn run(&mut self) -> ! {
        let mut attempts: u8 = 0;
        loop {
            match self.connect().await {
                Ok(()) => {
                    info!("connected to broker");
                    attempts = 0;
                    let err = self.session().await;
                    warn!("connection lost: {}", Debug2Format(&err));
                }
                Err(e) => {
                    warn!("connect failed: {}", Debug2Format(&e));
                }
            }
            self.on_disconnected().await;
            let delay = next_delay(&mut attempts);
            debug!("reconnecting in {} ms", delay.as_millis());
            self.idle_until(Instant::now() + delay).await;
        }
    }

    // --- connection lifecycle ---

    async fn connect(&mut self) -> Result<(), MqttError<T::Error>> {
        self.transport.connect().await.map_err(MqttError::Transport)?;

        let connect = Connect {
            clean_session: self.options.clean_session,
            keep_alive: self.options.keep_alive,
            client_id: self.options.client_id,
            username: self.options.username,
            password: self.options.password,
            last_will: self.options.last_will,
        };
        self.send_packet(&connect).await?;

        let ack = self.wait_connack().await?;
        if ack.reason_code != 0 {
            return Err(MqttError::ConnectionRefused(ack.reason_code.into()));
        }

        self.connected = true;
        self.ping_resp_deadline = None;
        self.reset_subscriptions();
        Ok(())
    }

    async fn wait_connack(&mut self) -> Result<ConnAck, MqttError<T::Error>> {
        let deadline = Instant::now() + CONNACK_TIMEOUT;
        loop {
            let mut chunk = [0u8; RECV_BUF_LEN];
            // The broker may coalesce session traffic (a present session
            // redelivering queued messages) right behind the CONNACK, so
            // never read more than the stage can hold.
            let space = min(RX_STAGE_LEN - self.rx_stage.len(), RECV_BUF_LEN);
            let n = match select(self.transport.recv(&mut chunk[..space]), Timer::at(deadline)).await
            {
                Either::First(r) => r.map_err(MqttError::Transport)?,
                Either::Second(()) => return Err(MqttError::Timeout),
            };
            let _ = self.rx_stage.extend_from_slice(&chunk[..n]);

            let Some(header) =
                parse_fixed_header(&self.rx_stage).map_err(MqttError::cast_transport_error)?
            else {
                continue;
            };
            if header.packet_type != 2 {
                return Err(MqttError::Protocol(ProtocolError::InvalidResponse));
            }
            let total = header.header_len + header.remaining_len;
            if self.rx_stage.len() < total {
                continue;
            }
            let ack =
                ConnAck::decode(&self.rx_stage[..total]).map_err(MqttError::cast_transport_error)?;
            self.drain_stage(total);
            return Ok(ack);
        }
    }

    /// A new session starts from scratch: every tracked subscription is
    /// marked out of sync so the reconciler re-issues it, including
    /// unsubscribes for entries the application dropped while offline.
    fn reset_subscriptions(&mut self) {
        let keys: Vec<SubKey, MAX_SUBS> = self.table.keys().collect();
        for key in keys {
            if let Some(sub) = self.table.get_mut(key) {
                sub.is_subscribed = !sub.want_subscribed;
                sub.has_pending_request = false;
                sub.pending_packet_id = None;
                sub.failed_attempts = 0;
                sub.retry_at = None;
            }
        }
    }

    async fn on_disconnected(&mut self) {
        self.connected = false;
        self.transport.close().await;
        self.reassembler.reset();
        self.rx_state = RxState::Collect;
        self.rx_stage.clear();
        self.inbound_pub = None;
        self.ping_resp_deadline = None;

        // Whoever was waiting on a broker ack will never get one.
        for pending in &self.pending_acks {
            if let Some(token) = pending.token {
                self.completions.resolve(token, Err(ClientError::ConnectionLost));
            }
        }
        self.pending_acks.clear();

        let keys: Vec<SubKey, MAX_SUBS> = self.table.keys().collect();
        for key in keys {
            if let Some(sub) = self.table.get_mut(key) {
                sub.has_pending_request = false;
                sub.pending_packet_id = None;
                sub.retry_at = None;
            }
        }
    }

    /// Serves requests while waiting out the reconnect backoff.
    async fn idle_until(&mut self, deadline: Instant) {
        loop {
            // Bind before matching so the select future (and its borrows)
            // is dropped before the arm runs.
            let event = select(self.requests.receive(), Timer::at(deadline)).await;
            match event {
                Either::First(request) => {
                    // Disconnected request handling touches no I/O.
                    if let Err(e) = self.handle_request(request).await {
                        warn!("request failed while disconnected: {}", Debug2Format(&e));
                    }
                }
                Either::Second(()) => return,
            }
        }
    }

    // --- connected session ---

    async fn session(&mut self) -> MqttError<T::Error> {
        if let Err(e) = self.drain_backlog().await {
            return e;
        }
        if let Err(e) = self.reconcile_sweep().await {
            return e;
        }
        loop {
            let deadline = self.next_deadline();
            let mut chunk = [0u8; RECV_BUF_LEN];
            let event = select3(
                self.requests.receive(),
                self.transport.recv(&mut chunk),
                Timer::at(deadline),
            )
            .await;
            let step = match event {
                Either3::First(request) => self.handle_request(request).await,
                Either3::Second(Ok(n)) => self.on_recv(&chunk[..n]).await,
                Either3::Second(Err(e)) => Err(MqttError::Transport(e)),
                Either3::Third(()) => self.on_deadline().await,
            };
            if let Err(e) = step {
                return e;
            }
        }
    }

    fn next_deadline(&self) -> Instant {
        let mut deadline = if self.options.keep_alive == 0 {
            Instant::now() + Duration::from_secs(3600)
        } else {
            self.next_ping_at
        };
        if let Some(t) = self.ping_resp_deadline {
            deadline = min(deadline, t);
        }
        if let Some(t) = self.table.next_retry_at() {
            deadline = min(deadline, t);
        }
        deadline
    }

    async fn on_deadline(&mut self) -> Result<(), MqttError<T::Error>> {
        let now = Instant::now();
        if let Some(t) = self.ping_resp_deadline
            && now >= t
        {
            warn!("broker missed ping response");
            return Err(MqttError::Timeout);
        }
        if self.options.keep_alive != 0 && now >= self.next_ping_at {
            self.send_packet(&PingReq).await?;
            self.ping_resp_deadline = Some(now + PING_RESP_TIMEOUT);
        }

        // Fire due subscription retries.
        let keys: Vec<SubKey, MAX_SUBS> = self.table.keys().collect();
        for key in keys {
            let due = self
                .table
                .get(key)
                .and_then(|sub| sub.retry_at)
                .is_some_and(|t| now >= t);
            if due {
                if let Some(sub) = self.table.get_mut(key) {
                    sub.retry_at = None;
                }
                self.start_transition(key, TransitionPolicy::RetryAllErrors)
                    .await?;
            }
        }
        Ok(())
    }

    async fn on_recv(&mut self, data: &[u8]) -> Result<(), MqttError<T::Error>> {
        let mut out = AckQueue::new();
        self.on_bytes(data, &mut out)?;
        self.send_acks(&out).await?;
        // Acks may have finished transitions whose desired state changed
        // while the request was in flight.
        self.reconcile_sweep().await
    }

    /// Processes bytes the broker coalesced behind the CONNACK, which are
    /// still sitting in the staging buffer when the session starts.
    async fn drain_backlog(&mut self) -> Result<(), MqttError<T::Error>> {
        let mut out = AckQueue::new();
        self.advance_stage(&mut out)?;
        self.send_acks(&out).await
    }

    async fn send_acks(&mut self, out: &AckQueue) -> Result<(), MqttError<T::Error>> {
        for outgoing in out {
            match *outgoing {
                Outgoing::PubAck(id) => self.send_packet(&PubAck { packet_id: id }).await?,
                Outgoing::PubRec(id) => self.send_packet(&PubRec { packet_id: id }).await?,
                Outgoing::PubRel(id) => self.send_packet(&PubRel { packet_id: id }).await?,
                Outgoing::PubComp(id) => self.send_packet(&PubComp { packet_id: id }).await?,
            }
        }
        Ok(())
    }

    // --- inbound byte stream ---

    fn on_bytes(&mut self, mut data: &[u8], out: &mut AckQueue) -> Result<(), MqttError<T::Error>> {
        while !data.is_empty() {
            if matches!(self.rx_state, RxState::PublishPayload { .. }) {
                data = self.feed_payload(data, out);
            } else if let RxState::Skip { remaining } = &mut self.rx_state {
                let take = min(*remaining, data.len());
                *remaining -= take;
                if *remaining == 0 {
                    self.rx_state = RxState::Collect;
                }
                data = &data[take..];
            } else {
                let take = min(data.len(), RX_STAGE_LEN - self.rx_stage.len());
                let _ = self.rx_stage.extend_from_slice(&data[..take]);
                data = &data[take..];
                self.advance_stage(out)?;
                if take == 0 && self.rx_stage.is_full() {
                    // A packet that can never complete in the staging
                    // buffer; the stream is unrecoverable.
                    return Err(MqttError::Protocol(ProtocolError::MalformedPacket));
                }
            }
        }
        Ok(())
    }

    /// Parses as many packets as the staged bytes allow.
    fn advance_stage(&mut self, out: &mut AckQueue) -> Result<(), MqttError<T::Error>> {
        loop {
            if !matches!(self.rx_state, RxState::Collect) {
                return Ok(());
            }
            let Some(header) =
                parse_fixed_header(&self.rx_stage).map_err(MqttError::cast_transport_error)?
            else {
                return Ok(());
            };

            // PUBLISH (type 3) is streamed; everything else is small enough
            // to stage whole.
            if header.packet_type == 3 {
                if !self.begin_publish(header.flags, header.header_len, header.remaining_len)? {
                    return Ok(());
                }
                // Replay staged bytes beyond the publish header through the
                // payload path, then keep parsing whatever follows.
                let consumed = self.publish_head_len(header.header_len);
                let mut tmp = [0u8; RX_STAGE_LEN];
                let n = self.rx_stage.len() - consumed;
                tmp[..n].copy_from_slice(&self.rx_stage[consumed..]);
                self.rx_stage.clear();
                let rest = self.feed_payload(&tmp[..n], out);
                let rest_len = rest.len();
                let _ = self.rx_stage.extend_from_slice(&tmp[n - rest_len..n]);
            } else {
                let total = header.header_len + header.remaining_len;
                if total > RX_STAGE_LEN {
                    return Err(MqttError::Protocol(ProtocolError::MalformedPacket));
                }
                if self.rx_stage.len() < total {
                    return Ok(());
                }
                let mut tmp = [0u8; RX_STAGE_LEN];
                tmp[..total].copy_from_slice(&self.rx_stage[..total]);
                self.drain_stage(total);
                if let Some(packet) = packet::decode::<ErrorPlaceHolder>(&tmp[..total])
                    .map_err(MqttError::cast_transport_error)?
                {
                    self.handle_packet(packet, out);
                }
            }
        }
    }

    /// Number of staged bytes the current publish header occupies, valid
    /// right after [`Self::begin_publish`] returned true.
    fn publish_head_len(&self, header_len: usize) -> usize {
        let body = &self.rx_stage[header_len..];
        let topic_len = u16::from_be_bytes([body[0], body[1]]) as usize;
        let pid_len = match self.inbound_pub {
            Some((QoS::AtMostOnce, _)) => 0,
            _ => 2,
        };
        header_len + 2 + topic_len + pid_len
    }

    /// Tries to parse the PUBLISH variable header out of the staging buffer.
    ///
    /// Returns true once the reassembler has been started and `rx_state`
    /// switched to payload streaming; false when more bytes are needed.
    fn begin_publish(
        &mut self,
        flags: u8,
        header_len: usize,
        remaining_len: usize,
    ) -> Result<bool, MqttError<T::Error>> {
        let qos = match (flags >> 1) & 0x03 {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            _ => return Err(MqttError::Protocol(ProtocolError::MalformedPacket)),
        };
        let retain = (flags & 0x01) != 0;

        let body = &self.rx_stage[header_len..];
        if body.len() < 2 {
            return Ok(false);
        }
        let topic_len = u16::from_be_bytes([body[0], body[1]]) as usize;
        let pid_len = if qos == QoS::AtMostOnce { 0 } else { 2 };
        let head_len = 2 + topic_len + pid_len;
        if head_len > remaining_len {
            return Err(MqttError::Protocol(ProtocolError::MalformedPacket));
        }
        if header_len + head_len > RX_STAGE_LEN {
            // Topic too long to ever match a tracked filter; skip the whole
            // packet instead of tearing the connection down.
            debug!("skipping publish with oversized header");
            let staged_body = self.rx_stage.len() - header_len;
            self.rx_stage.clear();
            self.rx_state = RxState::Skip {
                remaining: remaining_len - staged_body,
            };
            return Ok(false);
        }
        if body.len() < head_len {
            return Ok(false);
        }

        let topic = core::str::from_utf8(&body[2..2 + topic_len])
            .map_err(|_| MqttError::Protocol(ProtocolError::InvalidUtf8String))?;
        let packet_id = (pid_len == 2)
            .then(|| u16::from_be_bytes([body[2 + topic_len], body[3 + topic_len]]));

        self.reassembler.begin(topic, retain, &self.table);
        self.inbound_pub = Some((qos, packet_id));
        self.rx_state = RxState::PublishPayload {
            remaining: remaining_len - head_len,
        };
        Ok(true)
    }

    /// Streams payload bytes to the reassembler, returning whatever part of
    /// `data` belongs to the next packet. On the final chunk, queues the
    /// QoS acknowledgement.
    fn feed_payload<'d>(&mut self, data: &'d [u8], out: &mut AckQueue) -> &'d [u8] {
        let RxState::PublishPayload { ref mut remaining } = self.rx_state else {
            return data;
        };
        let take = min(*remaining, data.len());
        let is_last = take == *remaining;
        self.reassembler.chunk(&data[..take], is_last, &self.table);
        *remaining -= take;

        if is_last {
            self.rx_state = RxState::Collect;
            if let Some((qos, Some(packet_id))) = self.inbound_pub.take() {
                match qos {
                    QoS::AtLeastOnce => {
                        let _ = out.push(Outgoing::PubAck(packet_id));
                    }
                    QoS::ExactlyOnce => {
                        let _ = out.push(Outgoing::PubRec(packet_id));
                    }
                    QoS::AtMostOnce => {}
                }
            }
        }
        &data[take..]
    }

    fn handle_packet(&mut self, packet: MqttPacket<'_>, out: &mut AckQueue) {
        match packet {
            MqttPacket::SubAck(ack) => {
                if let Some(key) = self.table.find_by_packet_id(ack.packet_id) {
                    let granted = ack
                        .reason_codes
                        .first()
                        .is_some_and(|code| *code != SubAck::FAILURE);
                    self.finish_transition(key, granted);
                } else {
                    debug!("suback for unknown packet id {}", ack.packet_id);
                }
            }
            MqttPacket::UnsubAck(ack) => {
                if let Some(key) = self.table.find_by_packet_id(ack.packet_id) {
                    self.finish_transition(key, true);
                }
            }
            MqttPacket::PubAck(ack) => self.settle_puback(ack.packet_id),
            MqttPacket::PubRec(ack) => {
                if let Some(pending) = self
                    .pending_acks
                    .iter_mut()
                    .find(|p| p.packet_id == ack.packet_id && p.qos == QoS::ExactlyOnce)
                {
                    pending.got_pubrec = true;
                    let _ = out.push(Outgoing::PubRel(ack.packet_id));
                }
            }
            MqttPacket::PubComp(ack) => self.settle_pubcomp(ack.packet_id),
            MqttPacket::PubRel(rel) => {
                // Inbound QoS 2 handshake; the message was already delivered
                // on its final chunk.
                let _ = out.push(Outgoing::PubComp(rel.packet_id));
            }
            MqttPacket::PingResp => {
                self.ping_resp_deadline = None;
            }
            MqttPacket::ConnAck(_) => {
                debug!("unexpected connack during session");
            }
            MqttPacket::Publish(_) => {
                // PUBLISH is intercepted before full-packet decoding.
                debug!("unexpected staged publish");
            }
        }
    }

    fn settle_puback(&mut self, packet_id: u16) {
        if let Some(i) = self
            .pending_acks
            .iter()
            .position(|p| p.packet_id == packet_id && p.qos == QoS::AtLeastOnce)
        {
            let pending = self.pending_acks.swap_remove(i);
            if let Some(token) = pending.token {
                self.completions.resolve(token, Ok(()));
            }
        }
    }

    fn settle_pubcomp(&mut self, packet_id: u16) {
        if let Some(i) = self
            .pending_acks
            .iter()
            .position(|p| p.packet_id == packet_id && p.qos == QoS::ExactlyOnce && p.got_pubrec)
        {
            let pending = self.pending_acks.swap_remove(i);
            if let Some(token) = pending.token {
                self.completions.resolve(token, Ok(()));
            }
        }
    }

    fn drain_stage(&mut self, n: usize) {
        let len = self.rx_stage.len();
        self.rx_stage.copy_within(n..len, 0);
        self.rx_stage.truncate(len - n);
    }

    // --- requests from the facade ---

    async fn handle_request(&mut self, request: Request) -> Result<(), MqttError<T::Error>> {
        match request {
            Request::Publish {
                topic,
                payload,
                qos,
                retain,
                token,
            } => self.handle_publish(&topic, &payload, qos, retain, token).await,
            Request::Subscribe {
                filter,
                qos,
                handler,
                token,
            } => {
                if let Some(key) = self.table.find(&filter) {
                    // Repeat subscribe: the newest registration wins, and a
                    // failing entry gets a clean slate.
                    if let Some(sub) = self.table.get_mut(key) {
                        sub.qos = qos;
                        sub.handler = handler;
                        sub.failed_attempts = 0;
                        sub.retry_at = None;
                        sub.want_subscribed = true;
                    }
                    let step = self
                        .start_transition(key, TransitionPolicy::RetryAllErrors)
                        .await;
                    self.completions.resolve(token, Ok(()));
                    return step.map(|_| ());
                }

                if !self.connected {
                    self.completions.resolve(token, Err(ClientError::NotConnected));
                    return Ok(());
                }
                let Some(key) = self.table.insert(Subscription::new(filter, qos, handler)) else {
                    self.completions
                        .resolve(token, Err(ClientError::SubscriptionLimit));
                    return Ok(());
                };
                match self
                    .start_transition(key, TransitionPolicy::AllowPermanentError)
                    .await
                {
                    Ok(Ok(())) => {
                        self.completions.resolve(token, Ok(()));
                        Ok(())
                    }
                    Ok(Err(client_err)) => {
                        self.table.remove(key);
                        self.completions.resolve(token, Err(client_err));
                        Ok(())
                    }
                    Err(e) => {
                        self.table.remove(key);
                        self.completions
                            .resolve(token, Err(ClientError::ConnectionLost));
                        Err(e)
                    }
                }
            }
            Request::Unsubscribe { filter, token } => {
                let Some(key) = self.table.find(&filter) else {
                    // Never subscribed; the desired state already holds.
                    self.completions.resolve(token, Ok(()));
                    return Ok(());
                };
                // Delivery stops immediately; the broker-side removal is the
                // reconciler's problem from here on.
                if let Some(sub) = self.table.get_mut(key) {
                    sub.want_subscribed = false;
                }
                match self
                    .start_transition(key, TransitionPolicy::AllowPermanentError)
                    .await
                {
                    Ok(inner) => {
                        self.gc(key);
                        self.completions.resolve(token, inner);
                        Ok(())
                    }
                    Err(e) => {
                        self.gc(key);
                        self.completions
                            .resolve(token, Err(ClientError::ConnectionLost));
                        Err(e)
                    }
                }
            }
        }
    }

    async fn handle_publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
        token: Option<Token>,
    ) -> Result<(), MqttError<T::Error>> {
        if !self.connected {
            self.resolve_opt(token, Err(ClientError::NotConnected));
            return Ok(());
        }

        if qos == QoS::AtMostOnce {
            let publish = Publish {
                topic,
                qos,
                retain,
                payload,
                packet_id: None,
            };
            return match self.send_packet(&publish).await {
                Ok(()) => {
                    self.resolve_opt(token, Ok(()));
                    Ok(())
                }
                Err(e) => {
                    self.resolve_opt(token, Err(ClientError::ConnectionLost));
                    Err(e)
                }
            };
        }

        if self.pending_acks.is_full() {
            self.resolve_opt(token, Err(ClientError::QueueFull));
            return Ok(());
        }
        let packet_id = self.alloc_packet_id();
        let publish = Publish {
            topic,
            qos,
            retain,
            payload,
            packet_id: Some(packet_id),
        };
        match self.send_packet(&publish).await {
            Ok(()) => {
                let _ = self.pending_acks.push(PendingAck {
                    packet_id,
                    qos,
                    token,
                    got_pubrec: false,
                });
                Ok(())
            }
            Err(e) => {
                self.resolve_opt(token, Err(ClientError::ConnectionLost));
                Err(e)
            }
        }
    }

    fn resolve_opt(&self, token: Option<Token>, result: Result<(), ClientError>) {
        if let Some(token) = token {
            self.completions.resolve(token, result);
        }
    }

    // --- subscription reconciliation ---

    /// Issues the broker request that moves one subscription towards its
    /// desired state, if one is needed and none is in flight.
    ///
    /// The outer error means the link failed and the session must end; the
    /// inner result is what the requesting caller should see.
    async fn start_transition(
        &mut self,
        key: SubKey,
        policy: TransitionPolicy,
    ) -> Result<Result<(), ClientError>, MqttError<T::Error>> {
        let Some(sub) = self.table.get(key) else {
            return Ok(Ok(()));
        };
        if sub.has_pending_request
            || sub.retry_at.is_some()
            || sub.want_subscribed == sub.is_subscribed
        {
            return Ok(Ok(()));
        }
        if !self.connected {
            // The next session reconciles everything; only a brand-new
            // subscribe has nothing recorded yet to repair from.
            return Ok(match policy {
                TransitionPolicy::AllowPermanentError => Err(ClientError::NotConnected),
                TransitionPolicy::RetryAllErrors => Ok(()),
            });
        }

        let want = sub.want_subscribed;
        let qos = sub.qos;
        let filter = sub.filter.clone();
        let packet_id = self.alloc_packet_id();

        if want {
            debug!("subscribing to {}", filter.as_str());
            self.send_packet(&Subscribe::new(packet_id, &filter, qos)).await?;
        } else {
            debug!("unsubscribing from {}", filter.as_str());
            self.send_packet(&Unsubscribe::new(packet_id, &filter)).await?;
        }

        if let Some(sub) = self.table.get_mut(key) {
            sub.has_pending_request = true;
            sub.pending_packet_id = Some(packet_id);
            sub.pending_is_subscribe = want;
        }
        Ok(Ok(()))
    }

    /// Settles an in-flight subscribe or unsubscribe. On failure the retry
    /// deadline is armed with per-subscription backoff.
    fn finish_transition(&mut self, key: SubKey, granted: bool) {
        let now = Instant::now();
        if let Some(sub) = self.table.get_mut(key) {
            sub.has_pending_request = false;
            sub.pending_packet_id = None;
            if granted {
                sub.is_subscribed = sub.pending_is_subscribe;
                sub.failed_attempts = 0;
                sub.retry_at = None;
            } else {
                let delay = next_delay(&mut sub.failed_attempts);
                warn!(
                    "broker rejected request for {}, retrying in {} ms",
                    sub.filter.as_str(),
                    delay.as_millis()
                );
                sub.retry_at = Some(now + delay);
            }
        }
        self.gc(key);
    }

    /// Converges every subscription that is out of sync and idle, and frees
    /// entries nobody wants anymore.
    async fn reconcile_sweep(&mut self) -> Result<(), MqttError<T::Error>> {
        let keys: Vec<SubKey, MAX_SUBS> = self.table.keys().collect();
        for key in keys {
            self.start_transition(key, TransitionPolicy::RetryAllErrors)
                .await?;
            self.gc(key);
        }
        Ok(())
    }

    /// Frees a table entry once it is unwanted, not held by the broker, and
    /// has no request in flight.
    fn gc(&mut self, key: SubKey) {
        let removable = self.table.get(key).is_some_and(|sub| {
            !sub.want_subscribed && !sub.is_subscribed && !sub.has_pending_request
        });
        if removable {
            self.table.remove(key);
        }
    }

    // --- plumbing ---

    fn alloc_packet_id(&mut self) -> u16 {
        let id = self.next_packet_id;
        self.next_packet_id = if id == u16::MAX { 1 } else { id + 1 };
        id
    }

    async fn send_packet(&mut self, packet: &impl EncodePacket) -> Result<(), MqttError<T::Error>> {
        let len = packet
            .encode(&mut self.tx_buf)
            .map_err(MqttError::cast_transport_error)?;
        self.transport
            .send(&self.tx_buf[..len])
            .await
            .map_err(MqttError::Transport)?;
        if self.options.keep_alive != 0 {
            self.next_ping_at =
                Instant::now() + Duration::from_secs(self.options.keep_alive as u64);
        }
        Ok(())
    }
}
