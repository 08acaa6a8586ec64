use crate::frame_info::GameInput;
use crate::network::compression::{decode, encode};
use crate::network::network_stats::NetworkStats;
use crate::network::udp_msg::{
    ConnectionStatus, Input, InputAck, MessageBody, MessageHeader, QualityReply, QualityReport,
    SyncReply, SyncRequest, UdpMessage, UDP_MSG_MAX_PLAYERS,
};
use crate::network::udp_socket::NonBlockingSocket;
use crate::sessions::p2p_session::{
    DEFAULT_DISCONNECT_NOTIFY_START, DEFAULT_DISCONNECT_TIMEOUT, DEFAULT_FPS,
};
use crate::time_sync::TimeSync;
use crate::{Frame, PlayerHandle, NULL_FRAME};

use instant::{Duration, Instant};
use std::collections::vec_deque::Drain;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::ops::Add;
use tracing::{debug, trace, warn};

const UDP_HEADER_SIZE: usize = 28; // Size of IP + UDP headers
const NUM_SYNC_PACKETS: u32 = 5;
const UDP_SHUTDOWN_TIMER: u64 = 5000;
const PENDING_OUTPUT_SIZE: usize = 128;
const SYNC_FIRST_RETRY_INTERVAL: Duration = Duration::from_millis(500);
const SYNC_RETRY_INTERVAL: Duration = Duration::from_millis(2000);
const RUNNING_RETRY_INTERVAL: Duration = Duration::from_millis(200);
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_millis(200);
const QUALITY_REPORT_INTERVAL: Duration = Duration::from_millis(1000);
const NETWORK_STATS_INTERVAL: Duration = Duration::from_millis(1000);
/// Inbound packets whose sequence number lies further than this behind the last accepted
/// one are considered stale and dropped.
const MAX_SEQ_DISTANCE: u16 = 1 << 15;

fn millis_since_epoch() -> u128 {
    #[cfg(not(target_arch = "wasm32"))]
    {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0)
    }
    #[cfg(target_arch = "wasm32")]
    {
        js_sys::Date::new_0().get_time() as u128
    }
}

/// Reads a numeric tuning knob from the environment. Used for the simulated latency and
/// out-of-order packet injection, see `ROLLNET_NETWORK_DELAY` and `ROLLNET_OOP_PERCENT`.
fn config_u64(name: &str) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

#[derive(Debug, PartialEq, Eq)]
enum ProtocolState {
    Initializing,
    Synchronizing,
    Running,
    Disconnected,
    Shutdown,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Event {
    /// The first sync reply from the remote client arrived.
    Connected,
    /// The session is currently synchronizing with the remote client. It will continue until `count` reaches `total`.
    Synchronizing { total: u32, count: u32 },
    /// The session is now synchronized with the remote client.
    Synchronized,
    /// The session has received an input from the remote client.
    Input(GameInput),
    /// The remote client has disconnected.
    Disconnected,
    /// The session has not received packets from the remote client since `disconnect_timeout` ms.
    NetworkInterrupted { disconnect_timeout: u128 },
    /// Sent only after a `NetworkInterrupted` event, if communication has resumed.
    NetworkResumed,
}

/// An outbound packet waiting in the send queue, to honor the simulated send latency.
#[derive(Debug)]
struct QueueEntry {
    queue_time: Instant,
    msg: UdpMessage,
}

/// A packet that was pulled out of the send queue to be delivered late, out of order.
#[derive(Debug)]
struct OoPacket {
    send_time: Instant,
    msg: UdpMessage,
}

#[derive(Debug)]
pub(crate) struct UdpProtocol {
    handle: PlayerHandle,
    magic: u16,
    next_send_seq: u16,
    next_recv_seq: u16,
    send_queue: VecDeque<QueueEntry>,
    event_queue: VecDeque<Event>,

    // fault injection
    send_latency: u64,
    oop_percent: u64,
    oo_packet: Option<OoPacket>,

    // state
    state: ProtocolState,
    sync_remaining_roundtrips: u32,
    sync_random_request: u32,
    connected_event_sent: bool,
    running_last_quality_report: Instant,
    running_last_input_recv: Instant,
    running_last_network_stats: Instant,
    disconnect_notify_sent: bool,
    disconnect_event_sent: bool,

    // constants
    disconnect_timeout: Duration,
    disconnect_notify_start: Duration,
    shutdown_timeout: Instant,
    fps: u32,

    // the other client
    peer_addr: SocketAddr,
    remote_magic: u16,
    peer_connect_status: [ConnectionStatus; UDP_MSG_MAX_PLAYERS],

    // input compression
    pending_output: VecDeque<GameInput>,
    last_sent_input: GameInput,
    last_received_input: GameInput,
    last_acked_input: GameInput,

    // time sync
    time_sync_layer: TimeSync,
    local_frame_advantage: i32,
    remote_frame_advantage: i32,

    // network
    stats_start_time: u128,
    packets_sent: usize,
    bytes_sent: usize,
    kbps_sent: usize,
    round_trip_time: u128,
    last_send_time: Instant,
    last_recv_time: Instant,
}

impl PartialEq for UdpProtocol {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle
    }
}
impl Eq for UdpProtocol {}

impl UdpProtocol {
    pub(crate) fn new(
        handle: PlayerHandle,
        peer_addr: SocketAddr,
        input_size: usize,
    ) -> Self {
        let mut magic = rand::random::<u16>();
        while magic == 0 {
            magic = rand::random::<u16>();
        }

        Self {
            handle,
            magic,
            next_send_seq: 0,
            next_recv_seq: 0,
            send_queue: VecDeque::new(),
            event_queue: VecDeque::new(),

            // fault injection
            send_latency: config_u64("ROLLNET_NETWORK_DELAY"),
            oop_percent: config_u64("ROLLNET_OOP_PERCENT"),
            oo_packet: None,

            // state
            state: ProtocolState::Initializing,
            sync_remaining_roundtrips: NUM_SYNC_PACKETS,
            sync_random_request: rand::random::<u32>(),
            connected_event_sent: false,
            running_last_quality_report: Instant::now(),
            running_last_input_recv: Instant::now(),
            running_last_network_stats: Instant::now(),
            disconnect_notify_sent: false,
            disconnect_event_sent: false,

            // constants
            disconnect_timeout: DEFAULT_DISCONNECT_TIMEOUT,
            disconnect_notify_start: DEFAULT_DISCONNECT_NOTIFY_START,
            shutdown_timeout: Instant::now(),
            fps: DEFAULT_FPS,

            // the other client
            peer_addr,
            remote_magic: 0,
            peer_connect_status: [ConnectionStatus::default(); UDP_MSG_MAX_PLAYERS],

            // input compression
            pending_output: VecDeque::with_capacity(PENDING_OUTPUT_SIZE),
            last_sent_input: GameInput::new(NULL_FRAME, input_size),
            last_received_input: GameInput::new(NULL_FRAME, input_size),
            last_acked_input: GameInput::new(NULL_FRAME, input_size),

            // time sync
            time_sync_layer: TimeSync::new(),
            local_frame_advantage: 0,
            remote_frame_advantage: 0,

            // network
            stats_start_time: 0,
            packets_sent: 0,
            bytes_sent: 0,
            kbps_sent: 0,
            round_trip_time: 0,
            last_send_time: Instant::now(),
            last_recv_time: Instant::now(),
        }
    }

    pub(crate) const fn player_handle(&self) -> PlayerHandle {
        self.handle
    }

    /// Estimates which frame the other client is on by looking at the last frame they gave
    /// us plus some delta for the packet roundtrip time, then derives how many frames we
    /// are behind them. Being behind is an advantage, since they have to predict more often.
    pub(crate) fn update_local_frame_advantage(&mut self, local_frame: Frame) {
        if local_frame == NULL_FRAME || self.last_received_input.frame == NULL_FRAME {
            return;
        }
        let remote_frame = self.last_received_input.frame as i64
            + (self.round_trip_time as i64 * self.fps as i64) / 1000;
        self.local_frame_advantage = (remote_frame - local_frame as i64) as i32;
    }

    pub(crate) fn set_disconnect_timeout(&mut self, timeout: Duration) {
        self.disconnect_timeout = timeout;
    }

    pub(crate) fn set_disconnect_notify_start(&mut self, notify_start: Duration) {
        self.disconnect_notify_start = notify_start;
    }

    pub(crate) fn set_fps(&mut self, fps: u32) {
        assert!(fps > 0);
        self.fps = fps;
    }

    pub(crate) fn network_stats(&self) -> Option<NetworkStats> {
        if self.state != ProtocolState::Synchronizing && self.state != ProtocolState::Running {
            return None;
        }

        Some(NetworkStats {
            ping: self.round_trip_time,
            send_queue_len: self.pending_output.len(),
            kbps_sent: self.kbps_sent,
            local_frames_behind: self.local_frame_advantage,
            remote_frames_behind: self.remote_frame_advantage,
        })
    }

    pub(crate) fn is_synchronized(&self) -> bool {
        self.state == ProtocolState::Running
            || self.state == ProtocolState::Disconnected
            || self.state == ProtocolState::Shutdown
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state == ProtocolState::Running
    }

    pub(crate) fn is_handling_message(&self, addr: &SocketAddr) -> bool {
        self.peer_addr == *addr
    }

    pub(crate) fn peer_connect_status(&self, handle: PlayerHandle) -> ConnectionStatus {
        self.peer_connect_status[handle]
    }

    pub(crate) fn disconnect(&mut self) {
        if self.state == ProtocolState::Shutdown {
            return;
        }

        self.state = ProtocolState::Disconnected;
        // schedule the timeout which will lead to shutdown
        self.shutdown_timeout = Instant::now().add(Duration::from_millis(UDP_SHUTDOWN_TIMER));
    }

    pub(crate) fn synchronize(&mut self) {
        assert_eq!(self.state, ProtocolState::Initializing);
        self.state = ProtocolState::Synchronizing;
        self.sync_remaining_roundtrips = NUM_SYNC_PACKETS;
        self.stats_start_time = millis_since_epoch();
        self.send_sync_request();
    }

    pub(crate) fn recommend_frame_delay(&self, require_idle_input: bool) -> u32 {
        self.time_sync_layer
            .recommend_frame_wait_duration(require_idle_input)
    }

    pub(crate) fn poll(&mut self, connect_status: &[ConnectionStatus]) -> Drain<Event> {
        let now = Instant::now();
        match self.state {
            ProtocolState::Synchronizing => {
                // the first retry comes quickly, later ones wait for the remote to show up
                let next_interval = if self.sync_remaining_roundtrips == NUM_SYNC_PACKETS {
                    SYNC_FIRST_RETRY_INTERVAL
                } else {
                    SYNC_RETRY_INTERVAL
                };
                if self.last_send_time + next_interval < now {
                    debug!(
                        "endpoint {}: no luck syncing, re-queueing sync packet",
                        self.handle
                    );
                    self.send_sync_request();
                }
            }
            ProtocolState::Running => {
                // resend pending inputs, if some time has passed without sending or receiving inputs
                if self.running_last_input_recv + RUNNING_RETRY_INTERVAL < now {
                    trace!(
                        "endpoint {}: haven't exchanged inputs in a while, resending (last received: {}, last sent: {})",
                        self.handle,
                        self.last_received_input.frame,
                        self.last_sent_input.frame
                    );
                    self.send_pending_output(connect_status);
                    self.running_last_input_recv = Instant::now();
                }

                // periodically send a quality report
                if self.running_last_quality_report + QUALITY_REPORT_INTERVAL < now {
                    self.send_quality_report();
                }

                // periodically recompute the bandwidth estimate
                if self.running_last_network_stats + NETWORK_STATS_INTERVAL < now {
                    self.update_network_stats();
                    self.running_last_network_stats = Instant::now();
                }

                // send keep alive packet if we didn't send a packet for some time
                if self.last_send_time + KEEP_ALIVE_INTERVAL < now {
                    trace!("endpoint {}: sending keep alive packet", self.handle);
                    self.send_keep_alive();
                }

                // trigger a NetworkInterrupted event if we didn't receive a packet for some time
                if !self.disconnect_notify_sent
                    && self.last_recv_time + self.disconnect_notify_start < now
                {
                    let duration = self.disconnect_timeout - self.disconnect_notify_start;
                    self.event_queue.push_back(Event::NetworkInterrupted {
                        disconnect_timeout: Duration::as_millis(&duration),
                    });
                    self.disconnect_notify_sent = true;
                }

                // if we pass the disconnect_timeout threshold, send an event to disconnect
                if !self.disconnect_event_sent
                    && self.last_recv_time + self.disconnect_timeout < now
                {
                    debug!(
                        "endpoint {}: stopped receiving packets, disconnecting",
                        self.handle
                    );
                    self.event_queue.push_back(Event::Disconnected);
                    self.disconnect_event_sent = true;
                }
            }
            ProtocolState::Disconnected => {
                if self.shutdown_timeout < Instant::now() {
                    debug!("endpoint {}: shutting down", self.handle);
                    self.state = ProtocolState::Shutdown;
                }
            }
            ProtocolState::Initializing | ProtocolState::Shutdown => (),
        }
        self.event_queue.drain(..)
    }

    fn pop_pending_output(&mut self, ack_frame: Frame) {
        while let Some(input) = self.pending_output.front() {
            if input.frame <= ack_frame {
                trace!(
                    "endpoint {}: throwing away pending output frame {}",
                    self.handle,
                    input.frame
                );
                self.last_acked_input = *input;
                self.pending_output.pop_front();
            } else {
                break;
            }
        }
    }

    /*
     *  SENDING MESSAGES
     */

    pub(crate) fn send_all_messages(&mut self, socket: &NonBlockingSocket) {
        if self.state == ProtocolState::Shutdown {
            self.send_queue.clear();
            self.oo_packet = None;
            return;
        }
        self.pump_send_queue(socket);
    }

    fn pump_send_queue(&mut self, socket: &NonBlockingSocket) {
        while let Some(entry) = self.send_queue.front() {
            // respect the simulated send latency, jittered so packets don't arrive in lockstep
            if self.send_latency > 0 {
                let jitter =
                    (self.send_latency * 2 / 3) + (rand::random::<u64>() % self.send_latency) / 3;
                if Instant::now() < entry.queue_time + Duration::from_millis(jitter) {
                    break;
                }
            }

            let entry = match self.send_queue.pop_front() {
                Some(entry) => entry,
                None => break,
            };

            if self.oop_percent > 0
                && self.oo_packet.is_none()
                && rand::random::<u64>() % 100 < self.oop_percent
            {
                let delay = rand::random::<u64>() % (self.send_latency * 10 + 1000);
                debug!(
                    "endpoint {}: creating rogue oop (seq: {}, delay: {})",
                    self.handle, entry.msg.header.sequence_number, delay
                );
                self.oo_packet = Some(OoPacket {
                    send_time: Instant::now() + Duration::from_millis(delay),
                    msg: entry.msg,
                });
            } else {
                socket.send_to(&entry.msg, self.peer_addr);
            }
        }

        // deliver the detoured packet once its time has come
        if let Some(oo_packet) = &self.oo_packet {
            if oo_packet.send_time < Instant::now() {
                debug!("endpoint {}: sending rogue oop", self.handle);
                socket.send_to(&oo_packet.msg, self.peer_addr);
                self.oo_packet = None;
            }
        }
    }

    pub(crate) fn send_input(&mut self, input: GameInput, connect_status: &[ConnectionStatus]) {
        if self.state != ProtocolState::Running {
            return;
        }

        // register the input and advantages in the time sync layer
        self.time_sync_layer.advance_frame(
            &input,
            self.local_frame_advantage,
            self.remote_frame_advantage,
        );

        self.pending_output.push_back(input);
        if self.pending_output.len() > PENDING_OUTPUT_SIZE {
            if self.handle >= 1000 {
                // if this is a spectator that didn't ack our input, we just disconnect them
                if !self.disconnect_event_sent {
                    self.event_queue.push_back(Event::Disconnected);
                    self.disconnect_event_sent = true;
                }
            } else {
                // we should never have this much pending input for a remote player, the
                // prediction barrier stops the local client way earlier
                assert!(self.pending_output.len() <= PENDING_OUTPUT_SIZE);
            }
        }
        self.send_pending_output(connect_status);
    }

    fn send_pending_output(&mut self, connect_status: &[ConnectionStatus]) {
        let mut body = Input::default();

        if let Some(input) = self.pending_output.front() {
            assert!(
                self.last_acked_input.frame == NULL_FRAME
                    || self.last_acked_input.frame + 1 == input.frame
            );
            body.start_frame = input.frame;
            body.input_size = input.size as u8;

            let (bits, num_bits) = encode(&self.last_acked_input, self.pending_output.iter());
            body.bits = bits;
            body.num_bits = num_bits;

            if let Some(back) = self.pending_output.back() {
                self.last_sent_input = *back;
            }
        }

        body.ack_frame = self.last_received_input.frame;
        body.disconnect_requested = self.state == ProtocolState::Disconnected;
        body.peer_connect_status[..connect_status.len()].copy_from_slice(connect_status);

        self.queue_message(MessageBody::Input(body));
    }

    fn send_input_ack(&mut self) {
        let body = InputAck {
            ack_frame: self.last_received_input.frame,
        };

        self.queue_message(MessageBody::InputAck(body));
    }

    fn send_keep_alive(&mut self) {
        self.queue_message(MessageBody::KeepAlive);
    }

    fn send_sync_request(&mut self) {
        self.sync_random_request = rand::random::<u32>();
        let body = SyncRequest {
            random_request: self.sync_random_request,
            ..Default::default()
        };
        self.queue_message(MessageBody::SyncRequest(body));
    }

    fn send_quality_report(&mut self) {
        self.running_last_quality_report = Instant::now();
        let body = QualityReport {
            frame_advantage: self.local_frame_advantage.clamp(i8::MIN as i32, i8::MAX as i32)
                as i8,
            ping: millis_since_epoch() as u32,
        };

        self.queue_message(MessageBody::QualityReport(body));
    }

    fn queue_message(&mut self, body: MessageBody) {
        let header = MessageHeader {
            magic: self.magic,
            sequence_number: self.next_send_seq,
        };
        self.next_send_seq = self.next_send_seq.wrapping_add(1);
        let msg = UdpMessage { header, body };

        self.packets_sent += 1;
        self.last_send_time = Instant::now();
        self.bytes_sent += msg.packet_size();

        // add the packet to the back of the send queue
        self.send_queue.push_back(QueueEntry {
            queue_time: Instant::now(),
            msg,
        });
    }

    fn update_network_stats(&mut self) {
        let now = millis_since_epoch();
        if self.stats_start_time == 0 {
            self.stats_start_time = now;
        }

        let seconds = (now - self.stats_start_time) / 1000;
        if seconds == 0 {
            return;
        }

        let total_bytes_sent = self.bytes_sent + (self.packets_sent * UDP_HEADER_SIZE);
        let bps = total_bytes_sent / seconds as usize;
        self.kbps_sent = bps / 1024;
    }

    /*
     *  RECEIVING MESSAGES
     */

    pub(crate) fn handle_message(&mut self, msg: &UdpMessage) {
        // don't handle messages if shutdown
        if self.state == ProtocolState::Shutdown {
            return;
        }

        // filter out messages that don't match what we expect; the sync handshake itself
        // is exempt since the remote magic is only known once it completes
        let seq = msg.header.sequence_number;
        if !matches!(
            msg.body,
            MessageBody::SyncRequest(_) | MessageBody::SyncReply(_)
        ) {
            if msg.header.magic != self.remote_magic {
                trace!("endpoint {}: rejecting message with bad magic", self.handle);
                return;
            }

            // filter out out-of-order packets
            let skipped = seq.wrapping_sub(self.next_recv_seq);
            if skipped > MAX_SEQ_DISTANCE {
                trace!(
                    "endpoint {}: dropping out of order packet (seq: {}, last seq: {})",
                    self.handle,
                    seq,
                    self.next_recv_seq
                );
                return;
            }
        }
        self.next_recv_seq = seq;

        let handled = match &msg.body {
            MessageBody::SyncRequest(body) => self.on_sync_request(msg.header, *body),
            MessageBody::SyncReply(body) => self.on_sync_reply(msg.header, *body),
            MessageBody::Input(body) => self.on_input(body),
            MessageBody::InputAck(body) => self.on_input_ack(*body),
            MessageBody::QualityReport(body) => self.on_quality_report(*body),
            MessageBody::QualityReply(body) => self.on_quality_reply(*body),
            MessageBody::KeepAlive => true,
        };

        if handled {
            self.last_recv_time = Instant::now();

            // if the connection has been marked as interrupted, send an event to signal we are receiving again
            if self.disconnect_notify_sent && self.state == ProtocolState::Running {
                self.disconnect_notify_sent = false;
                self.event_queue.push_back(Event::NetworkResumed);
            }
        }
    }

    /// Upon receiving a `SyncRequest`, answer with a `SyncReply` echoing the random data.
    fn on_sync_request(&mut self, header: MessageHeader, body: SyncRequest) -> bool {
        if self.remote_magic != 0 && header.magic != self.remote_magic {
            trace!(
                "endpoint {}: ignoring sync request from unknown endpoint ({} != {})",
                self.handle,
                header.magic,
                self.remote_magic
            );
            return false;
        }
        let reply_body = SyncReply {
            random_reply: body.random_request,
        };
        self.queue_message(MessageBody::SyncReply(reply_body));
        true
    }

    /// Upon receiving a `SyncReply`, check validity and either continue the synchronization process or conclude synchronization.
    fn on_sync_reply(&mut self, header: MessageHeader, body: SyncReply) -> bool {
        // ignore sync replies when not syncing
        if self.state != ProtocolState::Synchronizing {
            return header.magic == self.remote_magic;
        }
        // this is not the correct reply
        if self.sync_random_request != body.random_reply {
            trace!(
                "endpoint {}: sync reply {} != {}, keep looking",
                self.handle,
                body.random_reply,
                self.sync_random_request
            );
            return false;
        }

        // the first valid reply means the remote endpoint is alive
        if !self.connected_event_sent {
            self.event_queue.push_back(Event::Connected);
            self.connected_event_sent = true;
        }

        // the sync reply is good, so we send a sync request again until we have finished
        // the required roundtrips. Then, we can conclude the syncing process.
        self.sync_remaining_roundtrips -= 1;
        if self.sync_remaining_roundtrips > 0 {
            debug!(
                "endpoint {}: checking sync state ({} round trips remaining)",
                self.handle, self.sync_remaining_roundtrips
            );
            let evt = Event::Synchronizing {
                total: NUM_SYNC_PACKETS,
                count: NUM_SYNC_PACKETS - self.sync_remaining_roundtrips,
            };
            self.event_queue.push_back(evt);
            self.send_sync_request();
        } else {
            debug!("endpoint {}: synchronized", self.handle);
            self.event_queue.push_back(Event::Synchronized);
            self.state = ProtocolState::Running;
            self.last_received_input.frame = NULL_FRAME;
            // the remote endpoint is now "authorized"
            self.remote_magic = header.magic;
        }
        true
    }

    fn on_input(&mut self, body: &Input) -> bool {
        // drop pending outputs until the ack frame
        self.pop_pending_output(body.ack_frame);

        if body.disconnect_requested {
            // if a disconnect is requested, disconnect now
            if self.state != ProtocolState::Disconnected && !self.disconnect_event_sent {
                debug!("endpoint {}: disconnecting on remote request", self.handle);
                self.event_queue.push_back(Event::Disconnected);
                self.disconnect_event_sent = true;
            }
        } else {
            // update the peer connection status; remote reports only ever move forward
            for i in 0..self.peer_connect_status.len() {
                self.peer_connect_status[i].disconnected = body.peer_connect_status[i].disconnected
                    || self.peer_connect_status[i].disconnected;
                self.peer_connect_status[i].last_frame = std::cmp::max(
                    self.peer_connect_status[i].last_frame,
                    body.peer_connect_status[i].last_frame,
                );
            }
        }

        // the stream must continue at or before the frame right after the last one we have;
        // anything else has been encoded against inputs we never received
        if self.last_received_input.frame != NULL_FRAME
            && body.start_frame > self.last_received_input.frame + 1
        {
            warn!(
                "endpoint {}: dropping non-contiguous input packet (start frame: {}, last received: {})",
                self.handle, body.start_frame, self.last_received_input.frame
            );
            return true;
        }

        // decode on a copy, so a malformed bitstream cannot corrupt the accumulated state
        let mut last_received = self.last_received_input;
        match decode(
            &mut last_received,
            body.start_frame,
            body.input_size as usize,
            body.num_bits,
            &body.bits,
        ) {
            Ok(recv_inputs) => {
                if !recv_inputs.is_empty() {
                    self.running_last_input_recv = Instant::now();
                }
                self.last_received_input = last_received;
                for game_input in recv_inputs {
                    trace!(
                        "endpoint {}: received input for frame {}",
                        self.handle,
                        game_input.frame
                    );
                    self.event_queue.push_back(Event::Input(game_input));
                }
            }
            Err(err) => {
                warn!(
                    "endpoint {}: dropping input packet with malformed bitstream: {}",
                    self.handle, err
                );
                return true;
            }
        }

        // tell the other side which frame we now have
        self.send_input_ack();
        true
    }

    /// Upon receiving a `InputAck`, discard the acked inputs from the pending output.
    fn on_input_ack(&mut self, body: InputAck) -> bool {
        self.pop_pending_output(body.ack_frame);
        true
    }

    /// Upon receiving a `QualityReport`, update network stats and reply with a `QualityReply`.
    fn on_quality_report(&mut self, body: QualityReport) -> bool {
        self.remote_frame_advantage = body.frame_advantage as i32;
        let reply_body = QualityReply { pong: body.ping };
        self.queue_message(MessageBody::QualityReply(reply_body));
        true
    }

    /// Upon receiving a `QualityReply`, update the round trip time.
    fn on_quality_reply(&mut self, body: QualityReply) -> bool {
        let millis = millis_since_epoch() as u32;
        self.round_trip_time = millis.wrapping_sub(body.pong) as u128;
        true
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod udp_protocol_tests {
    use super::*;

    fn test_addr(port: u16) -> SocketAddr {
        SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST), port)
    }

    fn drain_messages(protocol: &mut UdpProtocol) -> Vec<UdpMessage> {
        protocol.send_queue.drain(..).map(|e| e.msg).collect()
    }

    fn exchange_until_synchronized(a: &mut UdpProtocol, b: &mut UdpProtocol) {
        for _ in 0..2 * NUM_SYNC_PACKETS {
            for msg in drain_messages(a) {
                b.handle_message(&msg);
            }
            for msg in drain_messages(b) {
                a.handle_message(&msg);
            }
        }
    }

    #[test]
    fn test_handshake_completes_after_sync_roundtrips() {
        let mut a = UdpProtocol::new(0, test_addr(8000), 4);
        let mut b = UdpProtocol::new(1, test_addr(8001), 4);
        a.synchronize();
        b.synchronize();

        exchange_until_synchronized(&mut a, &mut b);

        assert!(a.is_running());
        assert!(b.is_running());
        assert_eq!(a.remote_magic, b.magic);
        assert_eq!(b.remote_magic, a.magic);

        let events: Vec<Event> = a.event_queue.drain(..).collect();
        assert_eq!(events[0], Event::Connected);
        let sync_events = events
            .iter()
            .filter(|e| matches!(e, Event::Synchronizing { .. }))
            .count();
        assert_eq!(sync_events, NUM_SYNC_PACKETS as usize - 1);
        assert_eq!(*events.last().unwrap(), Event::Synchronized);
    }

    #[test]
    fn test_wrong_magic_is_dropped_when_running() {
        let mut a = UdpProtocol::new(0, test_addr(8000), 4);
        let mut b = UdpProtocol::new(1, test_addr(8001), 4);
        a.synchronize();
        b.synchronize();
        exchange_until_synchronized(&mut a, &mut b);
        a.event_queue.clear();

        let seq_before = a.next_recv_seq;
        let msg = UdpMessage {
            header: MessageHeader {
                magic: b.magic.wrapping_add(1),
                sequence_number: seq_before.wrapping_add(5),
            },
            body: MessageBody::InputAck(InputAck { ack_frame: 3 }),
        };
        a.handle_message(&msg);
        // an accepted packet would have advanced the expected sequence number
        assert_eq!(a.next_recv_seq, seq_before);
    }

    #[test]
    fn test_stale_sequence_number_is_dropped() {
        let mut a = UdpProtocol::new(0, test_addr(8000), 4);
        let mut b = UdpProtocol::new(1, test_addr(8001), 4);
        a.synchronize();
        b.synchronize();
        exchange_until_synchronized(&mut a, &mut b);

        // a sequence number behind the last accepted one wraps around to the far end of
        // the window and is dropped
        let seq_before = a.next_recv_seq;
        let msg = UdpMessage {
            header: MessageHeader {
                magic: b.magic,
                sequence_number: seq_before.wrapping_sub(1),
            },
            body: MessageBody::KeepAlive,
        };
        a.handle_message(&msg);
        assert_eq!(a.next_recv_seq, seq_before);

        // a packet within the window is accepted
        let msg = UdpMessage {
            header: MessageHeader {
                magic: b.magic,
                sequence_number: seq_before.wrapping_add(2),
            },
            body: MessageBody::KeepAlive,
        };
        a.handle_message(&msg);
        assert_eq!(a.next_recv_seq, seq_before.wrapping_add(2));
    }

    #[test]
    fn test_first_input_packet_fields() {
        let mut a = UdpProtocol::new(0, test_addr(8000), 4);
        let mut b = UdpProtocol::new(1, test_addr(8001), 4);
        a.synchronize();
        b.synchronize();
        exchange_until_synchronized(&mut a, &mut b);
        drain_messages(&mut a);

        let connect_status = vec![ConnectionStatus::default(); 2];
        let mut input = GameInput::new(0, 4);
        input.copy_input(&[1, 2, 3, 4]);
        a.send_input(input, &connect_status);

        let msgs = drain_messages(&mut a);
        assert_eq!(msgs.len(), 1);
        match &msgs[0].body {
            MessageBody::Input(body) => {
                assert_eq!(body.start_frame, 0);
                assert_eq!(body.input_size, 4);
                assert_eq!(body.ack_frame, NULL_FRAME);
                assert!(body.num_bits > 0);
            }
            other => panic!("expected an input message, got {:?}", other),
        }
    }

    #[test]
    fn test_inputs_reach_other_endpoint_and_are_acked() {
        let mut a = UdpProtocol::new(0, test_addr(8000), 4);
        let mut b = UdpProtocol::new(1, test_addr(8001), 4);
        a.synchronize();
        b.synchronize();
        exchange_until_synchronized(&mut a, &mut b);
        drain_messages(&mut a);
        drain_messages(&mut b);
        a.event_queue.clear();
        b.event_queue.clear();

        let connect_status = vec![ConnectionStatus::default(); 2];
        for frame in 0..3 {
            let mut input = GameInput::new(frame, 4);
            input.copy_input(&(frame as u32).to_le_bytes());
            a.send_input(input, &connect_status);
        }
        assert_eq!(a.pending_output.len(), 3);

        for msg in drain_messages(&mut a) {
            b.handle_message(&msg);
        }

        let input_events: Vec<Frame> = b
            .event_queue
            .drain(..)
            .filter_map(|e| match e {
                Event::Input(input) => Some(input.frame),
                _ => None,
            })
            .collect();
        assert_eq!(input_events, vec![0, 1, 2]);
        assert_eq!(b.last_received_input.frame, 2);

        // the ack travels back and clears the pending output
        for msg in drain_messages(&mut b) {
            a.handle_message(&msg);
        }
        assert_eq!(a.pending_output.len(), 0);
        assert_eq!(a.last_acked_input.frame, 2);
    }

    #[test]
    fn test_disconnect_events_fire_once() {
        let mut a = UdpProtocol::new(0, test_addr(8000), 4);
        let mut b = UdpProtocol::new(1, test_addr(8001), 4);
        a.set_disconnect_notify_start(Duration::from_millis(20));
        a.set_disconnect_timeout(Duration::from_millis(60));
        a.synchronize();
        b.synchronize();
        exchange_until_synchronized(&mut a, &mut b);
        a.event_queue.clear();

        let connect_status = vec![ConnectionStatus::default(); 2];

        std::thread::sleep(Duration::from_millis(30));
        let events: Vec<Event> = a.poll(&connect_status).collect();
        assert_eq!(
            events,
            vec![Event::NetworkInterrupted {
                disconnect_timeout: 40
            }]
        );

        std::thread::sleep(Duration::from_millis(40));
        let events: Vec<Event> = a.poll(&connect_status).collect();
        assert_eq!(events, vec![Event::Disconnected]);

        // no duplicate events on further polls
        std::thread::sleep(Duration::from_millis(10));
        let events: Vec<Event> = a.poll(&connect_status).collect();
        assert_eq!(events, Vec::new());
    }

    #[test]
    fn test_receiving_after_interrupt_resumes() {
        let mut a = UdpProtocol::new(0, test_addr(8000), 4);
        let mut b = UdpProtocol::new(1, test_addr(8001), 4);
        a.set_disconnect_notify_start(Duration::from_millis(20));
        a.set_disconnect_timeout(Duration::from_millis(1000));
        a.synchronize();
        b.synchronize();
        exchange_until_synchronized(&mut a, &mut b);
        a.event_queue.clear();

        let connect_status = vec![ConnectionStatus::default(); 2];
        std::thread::sleep(Duration::from_millis(30));
        let events: Vec<Event> = a.poll(&connect_status).collect();
        assert!(matches!(events[0], Event::NetworkInterrupted { .. }));

        let msg = UdpMessage {
            header: MessageHeader {
                magic: b.magic,
                sequence_number: a.next_recv_seq.wrapping_add(1),
            },
            body: MessageBody::KeepAlive,
        };
        a.handle_message(&msg);
        let events: Vec<Event> = a.poll(&connect_status).collect();
        assert_eq!(events, vec![Event::NetworkResumed]);
    }
}
