//! The userspace half of TCP.
//!
//! Each flow runs one task owning a [`Machine`]. The task is driven purely by
//! events: packets from the TUN device, payload and close frames from the
//! tunnel, and its own timers. The machine follows RFC 793 for the passive
//! open and teardown paths; there is no congestion control beyond the peer's
//! receive window and no SACK beyond advertising SACK-permitted.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use ip_packet::make::TcpSegment;
use ip_packet::{IpPacket, TcpOptionElement};
use tokio_util::sync::CancellationToken;
use tunnel_proto::{CloseReason, ConnId, Frame};

use crate::RouterConfig;
use crate::mux::Tunnel;
use crate::pool::{HANDLER_QUEUE, Handler, HandlerEvent, Remover};

const RTO_INITIAL: Duration = Duration::from_millis(200);
const RTO_MAX: Duration = Duration::from_secs(3);
/// After this many consecutive expiries of the same segment, the flow is reset.
const MAX_RETRANSMITS: u32 = 5;

const PROBE_INITIAL: Duration = Duration::from_secs(1);
const PROBE_MAX: Duration = Duration::from_secs(30);

/// Our receive buffer capacity; what we advertise minus buffered bytes.
const RECV_WINDOW: u32 = 65535;

const DEFAULT_MSS: usize = 1460;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Waiting for the first packet (the SYN that created us).
    Idle,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
    Closed,
}

/// Spawns the handler task for a fresh flow.
///
/// Only ever called for a packet with SYN set and ACK clear; the SYN itself
/// is delivered as the first [`HandlerEvent::Packet`].
pub(crate) fn spawn(
    id: ConnId,
    cfg: &RouterConfig,
    tun: Arc<dyn tun::Tun>,
    tunnel: Tunnel,
    isn: u32,
    remover: Remover,
) -> Arc<Handler> {
    let (events_tx, events_rx) = tokio::sync::mpsc::channel(HANDLER_QUEUE);
    let cancel = CancellationToken::new();

    let handler = Arc::new(Handler::new(id, events_tx, cancel.clone()));

    let machine = Machine {
        id,
        tun,
        tunnel,
        remover,
        state: State::Idle,
        iss: isn,
        snd_una: isn,
        snd_nxt: isn,
        snd_wnd: 0,
        rcv_nxt: 0,
        mss: usize::from(cfg.mtu.saturating_sub(40)).min(DEFAULT_MSS),
        sack_permitted: false,
        ooo: HashMap::new(),
        ooo_bytes: 0,
        rtx: VecDeque::new(),
        pending: VecDeque::new(),
        probe_deadline: None,
        probe_interval: PROBE_INITIAL,
        time_wait: cfg.tcp_time_wait,
        time_wait_deadline: None,
        opened: false,
        close_sent: false,
        close_reason: CloseReason::Normal,
        fin_sent: false,
        fin_seq: 0,
        want_fin: false,
    };

    tokio::spawn(machine.run(events_rx, cancel));

    handler
}

/// A segment we sent and may have to send again.
struct TxSegment {
    seq: u32,
    data: Bytes,
    syn: bool,
    fin: bool,
    deadline: Instant,
    attempts: u32,
}

impl TxSegment {
    /// First sequence number after this segment.
    fn end(&self) -> u32 {
        self.seq
            .wrapping_add(self.data.len() as u32)
            .wrapping_add(u32::from(self.syn))
            .wrapping_add(u32::from(self.fin))
    }
}

struct Machine {
    id: ConnId,
    tun: Arc<dyn tun::Tun>,
    tunnel: Tunnel,
    remover: Remover,

    state: State,

    iss: u32,
    /// Oldest unacknowledged sequence number of ours.
    snd_una: u32,
    /// Next sequence number we will send.
    snd_nxt: u32,
    /// The peer's receive window.
    snd_wnd: u32,
    /// Next sequence number we expect from the peer.
    rcv_nxt: u32,

    mss: usize,
    sack_permitted: bool,

    /// Received segments ahead of `rcv_nxt`, keyed by their sequence number.
    ooo: HashMap<u32, Bytes>,
    ooo_bytes: usize,

    /// Sent-but-unacknowledged segments, oldest first.
    rtx: VecDeque<TxSegment>,
    /// Tunnel payload waiting for peer window.
    pending: VecDeque<Bytes>,

    probe_deadline: Option<Instant>,
    probe_interval: Duration,

    time_wait: Duration,
    time_wait_deadline: Option<Instant>,

    /// Whether the Open frame went out (set on reaching Established).
    opened: bool,
    /// Whether the Close frame went out; sent exactly once per opened flow.
    close_sent: bool,
    close_reason: CloseReason,

    fin_sent: bool,
    fin_seq: u32,
    /// Our send side should close once everything pending has been sent.
    want_fin: bool,
}

impl Machine {
    async fn run(
        mut self,
        mut events: tokio::sync::mpsc::Receiver<HandlerEvent>,
        cancel: CancellationToken,
    ) {
        while self.state != State::Closed {
            let deadline = self.next_deadline();

            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    // Hard close after the grace period; no more courtesy.
                    self.state = State::Closed;
                }
                event = events.recv() => match event {
                    None => self.state = State::Closed,
                    Some(HandlerEvent::Packet(packet)) => self.on_packet(&packet).await,
                    Some(HandlerEvent::TunnelPayload(payload)) => self.on_tunnel_payload(payload),
                    Some(HandlerEvent::TunnelClose(reason)) => self.on_tunnel_close(reason),
                    Some(HandlerEvent::Shutdown(reason)) => {
                        self.send_rst();
                        self.close_reason = reason;
                        self.state = State::Closed;
                    }
                },
                () = sleep_until(deadline), if deadline.is_some() => {
                    self.on_timer(Instant::now()).await;
                }
            }
        }

        self.remover.remove();

        if self.opened && !self.close_sent {
            let _ = self
                .tunnel
                .send(Frame::Close {
                    id: self.id,
                    reason: self.close_reason,
                })
                .await;
        }

        tracing::debug!(id = %self.id, "TCP flow closed");
    }

    async fn on_packet(&mut self, packet: &IpPacket) {
        let Some(tcp) = packet.as_tcp() else {
            tracing::warn!(id = %self.id, "Dropping non-TCP packet in TCP handler");
            return;
        };

        let seq = tcp.sequence_number();
        let payload = Bytes::copy_from_slice(tcp.payload());

        if self.state == State::Idle {
            if !tcp.syn() || tcp.ack() {
                // The pool only creates us for a SYN; anything else is a stray.
                self.send_rst();
                self.state = State::Closed;
                return;
            }

            self.on_syn(seq, tcp.options_iterator());
            return;
        }

        if tcp.rst() {
            if self.in_receive_window(seq) {
                tracing::debug!(id = %self.id, "Connection reset by peer");
                self.close_reason = CloseReason::Aborted;
                self.state = State::Closed;
            }

            return;
        }

        if tcp.ack() {
            self.on_ack(tcp.acknowledgment_number(), tcp.window_size())
                .await;
        }

        if matches!(self.state, State::Closed | State::TimeWait) {
            return;
        }

        let mut fin_handled = false;

        if !payload.is_empty() {
            self.on_data(seq, payload.clone()).await;
        }

        if tcp.fin() {
            let fin_seq = seq.wrapping_add(payload.len() as u32);
            fin_handled = self.on_fin(fin_seq).await;
        }

        if !payload.is_empty() && !fin_handled {
            self.send_ack();
        }
    }

    fn on_syn(&mut self, seq: u32, options: ip_packet::TcpOptionsIterator) {
        self.rcv_nxt = seq.wrapping_add(1);

        for option in options.flatten() {
            match option {
                TcpOptionElement::MaximumSegmentSize(peer_mss) => {
                    self.mss = self.mss.min(peer_mss as usize);
                }
                TcpOptionElement::SelectiveAcknowledgementPermitted => {
                    self.sack_permitted = true;
                }
                TcpOptionElement::Noop
                | TcpOptionElement::WindowScale(_)
                | TcpOptionElement::SelectiveAcknowledgement(_, _)
                | TcpOptionElement::Timestamp(_, _) => {}
            }
        }

        let syn_ack = TcpSegment {
            seq: self.iss,
            ack: Some(self.rcv_nxt),
            window: self.advertised_window(),
            syn: true,
            options: self.syn_options(),
            ..Default::default()
        };

        self.emit(syn_ack, &[]);

        self.rtx.push_back(TxSegment {
            seq: self.iss,
            data: Bytes::new(),
            syn: true,
            fin: false,
            deadline: Instant::now() + RTO_INITIAL,
            attempts: 0,
        });
        self.snd_nxt = self.iss.wrapping_add(1);

        self.state = State::SynReceived;
    }

    async fn on_ack(&mut self, ack: u32, window: u16) {
        let acceptable = seq_lt(self.snd_una, ack) && seq_le(ack, self.snd_nxt);

        if acceptable || ack == self.snd_una {
            self.snd_wnd = window as u32;
        }

        if !acceptable {
            return;
        }

        self.snd_una = ack;
        self.rtx.retain(|segment| seq_lt(ack, segment.end()));

        // Fresh forward progress restarts the timer for what's left.
        if let Some(head) = self.rtx.front_mut() {
            head.deadline = Instant::now() + RTO_INITIAL;
            head.attempts = 0;
        }

        if self.state == State::SynReceived && seq_le(self.iss.wrapping_add(1), ack) {
            self.establish().await;
        }

        if self.fin_sent && seq_lt(self.fin_seq, ack) {
            match self.state {
                State::FinWait1 => self.state = State::FinWait2,
                State::Closing => self.enter_time_wait(),
                State::LastAck => self.state = State::Closed,
                State::Idle
                | State::SynReceived
                | State::Established
                | State::FinWait2
                | State::CloseWait
                | State::TimeWait
                | State::Closed => {}
            }
        }

        if self.snd_wnd == 0 && (!self.pending.is_empty() || !self.rtx.is_empty()) {
            self.arm_probe();
        } else {
            self.probe_deadline = None;
            self.probe_interval = PROBE_INITIAL;
        }

        self.flush_pending();
        self.maybe_send_fin();
    }

    async fn establish(&mut self) {
        if self.tunnel.send(Frame::Open(self.id)).await.is_err() {
            tracing::debug!(id = %self.id, "Failed to open tunnel stream; resetting flow");

            self.send_rst();
            self.state = State::Closed;
            return;
        }

        self.opened = true;
        self.state = State::Established;

        tracing::debug!(id = %self.id, "TCP flow established");
    }

    async fn on_data(&mut self, seq: u32, payload: Bytes) {
        if !matches!(
            self.state,
            State::Established | State::FinWait1 | State::FinWait2 | State::SynReceived
        ) {
            return;
        }

        let distance = seq.wrapping_sub(self.rcv_nxt);

        if distance == 0 {
            self.deliver(payload).await;
            self.drain_ooo().await;
            return;
        }

        if distance < RECV_WINDOW {
            // Ahead of us; park it until the gap closes.
            if !self.ooo.contains_key(&seq) && self.ooo_bytes + payload.len() <= RECV_WINDOW as usize
            {
                self.ooo_bytes += payload.len();
                self.ooo.insert(seq, payload);
            }

            return;
        }

        // Behind us; deliver whatever part is new.
        let behind = self.rcv_nxt.wrapping_sub(seq) as usize;

        if behind < payload.len() {
            self.deliver(payload.slice(behind..)).await;
            self.drain_ooo().await;
        }
    }

    async fn deliver(&mut self, payload: Bytes) {
        self.rcv_nxt = self.rcv_nxt.wrapping_add(payload.len() as u32);

        if !self.opened {
            return;
        }

        if self
            .tunnel
            .send(Frame::Payload {
                id: self.id,
                payload,
            })
            .await
            .is_err()
        {
            self.send_rst();
            self.close_reason = CloseReason::TunnelBroken;
            self.state = State::Closed;
        }
    }

    async fn drain_ooo(&mut self) {
        while let Some(payload) = self.ooo.remove(&self.rcv_nxt) {
            self.ooo_bytes -= payload.len();
            self.deliver(payload).await;
        }
    }

    /// Handles a FIN claiming sequence number `fin_seq`.
    ///
    /// Returns `true` if our own FIN (which carries the ACK) went out, making
    /// a separate ACK unnecessary.
    async fn on_fin(&mut self, fin_seq: u32) -> bool {
        if fin_seq != self.rcv_nxt {
            // Out of order; the peer will retransmit it.
            return false;
        }

        self.rcv_nxt = self.rcv_nxt.wrapping_add(1);

        match self.state {
            State::SynReceived | State::Established => {
                // The app is done sending; relay that and close our side too.
                self.notify_close(CloseReason::Normal).await;

                self.state = State::CloseWait;
                self.want_fin = true;

                if self.maybe_send_fin() {
                    return true;
                }

                self.send_ack();
            }
            State::FinWait1 => {
                // Simultaneous close.
                self.state = State::Closing;
                self.send_ack();
            }
            State::FinWait2 => {
                self.send_ack();
                self.enter_time_wait();
                self.notify_close(CloseReason::Normal).await;
            }
            State::Idle
            | State::CloseWait
            | State::Closing
            | State::LastAck
            | State::TimeWait
            | State::Closed => {
                self.send_ack();
            }
        }

        true
    }

    fn on_tunnel_payload(&mut self, payload: Bytes) {
        if !matches!(self.state, State::Established | State::CloseWait) {
            tracing::debug!(id = %self.id, state = ?self.state, "Dropping tunnel payload");
            return;
        }

        self.pending.push_back(payload);
        self.flush_pending();
    }

    fn on_tunnel_close(&mut self, reason: CloseReason) {
        match reason {
            CloseReason::Normal => {
                // The remote is done sending; finish our side once drained.
                self.want_fin = true;
                self.maybe_send_fin();
            }
            CloseReason::Aborted | CloseReason::TunnelBroken => {
                self.send_rst();
                self.close_reason = reason;
                self.state = State::Closed;
            }
        }
    }

    async fn on_timer(&mut self, now: Instant) {
        if let Some(deadline) = self.time_wait_deadline
            && deadline <= now
        {
            self.state = State::Closed;
            return;
        }

        if let Some(deadline) = self.probe_deadline
            && deadline <= now
        {
            self.send_window_probe(now);
        }

        let resend = match self.rtx.front_mut() {
            None => return,
            Some(head) if head.deadline > now => return,
            Some(head) => {
                head.attempts += 1;

                if head.attempts > MAX_RETRANSMITS {
                    None
                } else {
                    head.deadline = now + rto_backoff(head.attempts);

                    Some((head.seq, head.data.clone(), head.syn, head.fin))
                }
            }
        };

        let Some((seq, data, syn, fin)) = resend else {
            tracing::debug!(id = %self.id, "Retransmission limit reached; resetting flow");

            self.send_rst();
            self.close_reason = CloseReason::Aborted;
            self.state = State::Closed;
            return;
        };

        let segment = TcpSegment {
            seq,
            ack: Some(self.rcv_nxt),
            window: self.advertised_window(),
            syn,
            fin,
            psh: !data.is_empty(),
            options: if syn { self.syn_options() } else { Vec::new() },
            ..Default::default()
        };

        self.emit(segment, &data);
    }

    /// Sends as much pending payload as the peer's window allows.
    fn flush_pending(&mut self) {
        loop {
            if self.pending.is_empty() {
                return;
            }

            let in_flight = self.snd_nxt.wrapping_sub(self.snd_una);
            let budget = self.snd_wnd.saturating_sub(in_flight) as usize;

            if budget == 0 {
                if self.snd_wnd == 0 {
                    self.arm_probe();
                }

                return;
            }

            let take = budget.min(self.mss);
            let chunk = self.take_pending(take);

            self.send_segment(chunk);
        }
    }

    /// Pops up to `max` bytes off the front of the pending queue.
    fn take_pending(&mut self, max: usize) -> Bytes {
        let mut front = self.pending.pop_front().expect("pending is non-empty");

        if front.len() <= max {
            return front;
        }

        let chunk = front.split_to(max);
        self.pending.push_front(front);

        chunk
    }

    fn send_segment(&mut self, data: Bytes) {
        let seq = self.snd_nxt;

        self.emit(
            TcpSegment {
                seq,
                ack: Some(self.rcv_nxt),
                window: self.advertised_window(),
                psh: true,
                ..Default::default()
            },
            &data,
        );

        self.snd_nxt = seq.wrapping_add(data.len() as u32);
        self.rtx.push_back(TxSegment {
            seq,
            data,
            syn: false,
            fin: false,
            deadline: Instant::now() + RTO_INITIAL,
            attempts: 0,
        });
    }

    /// Sends our FIN if the send side is closing and everything is flushed.
    ///
    /// Returns `true` if the FIN went out.
    fn maybe_send_fin(&mut self) -> bool {
        if !self.want_fin || self.fin_sent || !self.pending.is_empty() {
            return false;
        }

        let seq = self.snd_nxt;

        self.emit(
            TcpSegment {
                seq,
                ack: Some(self.rcv_nxt),
                window: self.advertised_window(),
                fin: true,
                ..Default::default()
            },
            &[],
        );

        self.rtx.push_back(TxSegment {
            seq,
            data: Bytes::new(),
            syn: false,
            fin: true,
            deadline: Instant::now() + RTO_INITIAL,
            attempts: 0,
        });

        self.fin_seq = seq;
        self.fin_sent = true;
        self.snd_nxt = seq.wrapping_add(1);

        match self.state {
            State::Established => self.state = State::FinWait1,
            State::CloseWait => self.state = State::LastAck,
            State::Idle
            | State::SynReceived
            | State::FinWait1
            | State::FinWait2
            | State::Closing
            | State::LastAck
            | State::TimeWait
            | State::Closed => {}
        }

        true
    }

    async fn notify_close(&mut self, reason: CloseReason) {
        if !self.opened || self.close_sent {
            return;
        }

        self.close_sent = true;

        let _ = self
            .tunnel
            .send(Frame::Close {
                id: self.id,
                reason,
            })
            .await;
    }

    fn send_window_probe(&mut self, now: Instant) {
        if let Some(data) = (!self.pending.is_empty()).then(|| self.take_pending(1)) {
            // One byte beyond the window; its ACK tells us the current window.
            self.send_segment(data);
        } else {
            self.send_ack();
        }

        self.probe_interval = (self.probe_interval * 2).min(PROBE_MAX);
        self.probe_deadline = Some(now + self.probe_interval);
    }

    fn arm_probe(&mut self) {
        if self.probe_deadline.is_none() {
            self.probe_deadline = Some(Instant::now() + self.probe_interval);
        }
    }

    fn enter_time_wait(&mut self) {
        self.state = State::TimeWait;
        self.time_wait_deadline = Some(Instant::now() + self.time_wait);
    }

    fn send_ack(&mut self) {
        self.emit(
            TcpSegment {
                seq: self.snd_nxt,
                ack: Some(self.rcv_nxt),
                window: self.advertised_window(),
                ..Default::default()
            },
            &[],
        );
    }

    fn send_rst(&mut self) {
        if self.state == State::Idle || self.state == State::Closed {
            return;
        }

        self.emit(
            TcpSegment {
                seq: self.snd_nxt,
                ack: Some(self.rcv_nxt),
                window: 0,
                rst: true,
                ..Default::default()
            },
            &[],
        );
    }

    /// Builds the app-facing packet and writes it to the TUN device.
    fn emit(&self, segment: TcpSegment, payload: &[u8]) {
        // We impersonate the flow's destination towards its source.
        let packet = match ip_packet::make::tcp_packet(self.id.dst(), self.id.src(), segment, payload)
        {
            Ok(packet) => packet,
            Err(e) => {
                tracing::warn!(id = %self.id, "Failed to build TCP packet: {e:#}");
                return;
            }
        };

        if let Err(e) = self.tun.write(packet.packet()) {
            tracing::debug!(id = %self.id, "Failed to write TCP packet to TUN: {e}");
        }
    }

    /// Options on our SYN-ACK; SACK-permitted is echoed, never initiated.
    fn syn_options(&self) -> Vec<TcpOptionElement> {
        let mut options = vec![TcpOptionElement::MaximumSegmentSize(self.mss as u16)];

        if self.sack_permitted {
            options.push(TcpOptionElement::SelectiveAcknowledgementPermitted);
        }

        options
    }

    fn advertised_window(&self) -> u16 {
        (RECV_WINDOW as usize)
            .saturating_sub(self.ooo_bytes)
            .min(u16::MAX as usize) as u16
    }

    fn in_receive_window(&self, seq: u32) -> bool {
        seq.wrapping_sub(self.rcv_nxt) < RECV_WINDOW || seq == self.rcv_nxt
    }

    fn next_deadline(&self) -> Option<Instant> {
        [
            self.rtx.front().map(|segment| segment.deadline),
            self.probe_deadline,
            self.time_wait_deadline,
        ]
        .into_iter()
        .flatten()
        .min()
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await
        }
        None => std::future::pending().await,
    }
}

fn rto_backoff(attempts: u32) -> Duration {
    RTO_INITIAL
        .checked_mul(1 << attempts.min(16))
        .map_or(RTO_MAX, |rto| rto.min(RTO_MAX))
}

/// `a < b` in sequence space.
fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// `a <= b` in sequence space.
fn seq_le(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) <= 0
}

#[cfg(test)]
mod seq_tests {
    use super::*;

    #[test]
    fn sequence_compare_wraps() {
        assert!(seq_lt(u32::MAX, 0));
        assert!(seq_lt(u32::MAX - 10, 5));
        assert!(!seq_lt(5, u32::MAX - 10));
        assert!(seq_le(7, 7));
    }

    #[test]
    fn backoff_is_capped() {
        assert_eq!(rto_backoff(1), Duration::from_millis(400));
        assert_eq!(rto_backoff(2), Duration::from_millis(800));
        assert_eq!(rto_backoff(10), RTO_MAX);
        assert_eq!(rto_backoff(40), RTO_MAX);
    }
}
