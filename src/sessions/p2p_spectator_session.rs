use crate::error::RollnetError;
use crate::frame_info::GameInput;
use crate::network::network_stats::NetworkStats;
use crate::network::udp_msg::ConnectionStatus;
use crate::network::udp_protocol::{Event, UdpProtocol};
use crate::network::udp_socket::NonBlockingSocket;
use crate::{
    Frame, PlayerHandle, RollnetEvent, RollnetRequest, SessionState, NULL_FRAME,
};

use std::collections::vec_deque::Drain;
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tracing::trace;

/// The amount of inputs a spectator can buffer (a second worth of inputs).
const SPECTATOR_BUFFER_SIZE: usize = 60;
const MAX_EVENT_QUEUE_SIZE: usize = 100;

/// A `P2PSpectatorSession` provides all functionality to connect to a remote host in a
/// peer-to-peer fashion. The host will broadcast all confirmed inputs to this session.
/// This session can be used to spectate a session without contributing to the game input.
#[derive(Debug)]
pub struct P2PSpectatorSession {
    state: SessionState,
    num_players: u32,
    input_size: usize,
    /// The merged inputs of all players, as received from the host, by frame.
    inputs: Vec<GameInput>,
    host_connect_status: Vec<ConnectionStatus>,
    socket: NonBlockingSocket,
    host: UdpProtocol,
    event_queue: VecDeque<RollnetEvent>,
    current_frame: Frame,
    last_recv_frame: Frame,
}

impl P2PSpectatorSession {
    pub(crate) fn new(
        num_players: u32,
        input_size: usize,
        port: u16,
        host_addr: SocketAddr,
    ) -> Result<Self, std::io::Error> {
        // udp nonblocking socket creation
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), port);
        let socket = NonBlockingSocket::new(addr)?;

        // host connection status
        let mut host_connect_status = Vec::new();
        for _ in 0..num_players {
            host_connect_status.push(ConnectionStatus::default());
        }

        Ok(Self {
            state: SessionState::Initializing,
            num_players,
            input_size,
            inputs: vec![
                GameInput::new(NULL_FRAME, input_size * num_players as usize);
                SPECTATOR_BUFFER_SIZE
            ],
            host_connect_status,
            socket,
            host: UdpProtocol::new(0, host_addr, input_size * num_players as usize),
            event_queue: VecDeque::new(),
            current_frame: NULL_FRAME,
            last_recv_frame: NULL_FRAME,
        })
    }

    /// Starts the session, beginning the synchronization process with the host.
    /// # Errors
    /// - Returns [`RollnetError::InvalidRequest`] if the session has already been started.
    pub fn start_session(&mut self) -> Result<(), RollnetError> {
        if self.state != SessionState::Initializing {
            return Err(RollnetError::InvalidRequest {
                info: "Session already started.".to_owned(),
            });
        }

        self.state = SessionState::Synchronizing;
        self.host.synchronize();
        Ok(())
    }

    /// Returns the current [`SessionState`] of a session.
    pub const fn current_state(&self) -> SessionState {
        self.state
    }

    /// Returns the number of frames the spectator lags behind the inputs received from the host.
    pub fn frames_behind_host(&self) -> u32 {
        let diff = self.last_recv_frame - self.current_frame;
        assert!(diff >= 0);
        diff as u32
    }

    /// Used to fetch some statistics about the quality of the network connection.
    /// # Errors
    /// - Returns [`RollnetError::NotSynchronized`] if the session is not connected to the host yet.
    pub fn network_stats(&self) -> Result<NetworkStats, RollnetError> {
        self.host.network_stats().ok_or(RollnetError::NotSynchronized)
    }

    /// Returns all events that happened since last queried for events. If the number of stored events exceeds `MAX_EVENT_QUEUE_SIZE`, the oldest events will be discarded.
    pub fn events(&mut self) -> Drain<RollnetEvent> {
        self.event_queue.drain(..)
    }

    /// Returns the number of players this session was constructed with.
    pub const fn num_players(&self) -> u32 {
        self.num_players
    }

    /// You should call this to notify rollnet that you are ready to advance your gamestate by a single frame.
    /// Returns an order-sensitive `Vec<RollnetRequest>`. You should fulfill all requests in the exact order they are provided.
    ///
    /// # Errors
    /// - Returns [`RollnetError::NotSynchronized`] if the session is not yet ready.
    /// - Returns [`RollnetError::PredictionThreshold`] if the input for the next frame has not
    ///   arrived from the host yet. Call [`P2PSpectatorSession::poll_remote_clients`] and retry.
    /// - Returns [`RollnetError::SpectatorTooFarBehind`] if the host has overwritten inputs the
    ///   spectator has not yet consumed. Catching up is impossible; the session is unrecoverable.
    pub fn advance_frame(&mut self) -> Result<Vec<RollnetRequest>, RollnetError> {
        // receive info from the host, trigger events and send messages
        self.poll_remote_clients();

        if self.state != SessionState::Running {
            return Err(RollnetError::NotSynchronized);
        }

        // get the merged input for the next frame
        let frame_to_grab = self.current_frame + 1;
        let merged_input = self.inputs[frame_to_grab as usize % SPECTATOR_BUFFER_SIZE];

        // we haven't received the input from the host yet, wait
        if merged_input.frame < frame_to_grab {
            return Err(RollnetError::PredictionThreshold);
        }

        // the host is more than `SPECTATOR_BUFFER_SIZE` frames ahead of the spectator, the input we need is gone forever
        if merged_input.frame > frame_to_grab {
            return Err(RollnetError::SpectatorTooFarBehind);
        }

        // split the merged input into an input for each player
        let mut synced_inputs = Vec::new();
        for i in 0..self.num_players as usize {
            let mut input = GameInput::new(frame_to_grab, self.input_size);
            let start = i * self.input_size;
            let end = (i + 1) * self.input_size;
            input.copy_input(&merged_input.buffer[start..end]);

            // disconnected players are identified by NULL_FRAME
            if self.host_connect_status[i].disconnected
                && self.host_connect_status[i].last_frame < frame_to_grab
            {
                input.frame = NULL_FRAME;
                input.erase_bits();
            }

            synced_inputs.push(input);
        }

        self.current_frame += 1;

        Ok(vec![RollnetRequest::AdvanceFrame {
            inputs: synced_inputs,
        }])
    }

    /// Receive UDP packets, distribute them to the host endpoint, handle all occurring events and send all outgoing UDP packets.
    /// Should be called periodically by your application to give rollnet a chance to do internal work like packet transmissions.
    pub fn poll_remote_clients(&mut self) {
        for (from, msg) in &self.socket.receive_all_messages() {
            if self.host.is_handling_message(from) {
                self.host.handle_message(msg);
            }
        }

        // run host poll and get events. This will trigger additional UDP packets to be sent.
        let mut events = VecDeque::new();
        for event in self.host.poll(&self.host_connect_status) {
            events.push_back(event);
        }

        // handle all events locally
        for event in events.drain(..) {
            self.handle_event(event);
        }

        // send out all pending UDP messages
        self.host.send_all_messages(&self.socket);
    }

    fn handle_event(&mut self, event: Event) {
        let player_handle = 0;
        match event {
            // forward to user
            Event::Connected => {
                self.event_queue
                    .push_back(RollnetEvent::Connected { player_handle });
            }
            // forward to user
            Event::Synchronizing { total, count } => {
                self.event_queue.push_back(RollnetEvent::Synchronizing {
                    player_handle,
                    total,
                    count,
                });
            }
            // forward to user
            Event::NetworkInterrupted { disconnect_timeout } => {
                self.event_queue
                    .push_back(RollnetEvent::NetworkInterrupted {
                        player_handle,
                        disconnect_timeout,
                    });
            }
            // forward to user
            Event::NetworkResumed => {
                self.event_queue
                    .push_back(RollnetEvent::NetworkResumed { player_handle });
            }
            // synced with the host, then forward to user
            Event::Synchronized => {
                self.state = SessionState::Running;
                self.event_queue
                    .push_back(RollnetEvent::Synchronized { player_handle });
                self.event_queue.push_back(RollnetEvent::Running);
            }
            // forward to user
            Event::Disconnected => {
                self.event_queue
                    .push_back(RollnetEvent::Disconnected { player_handle });
            }
            // save the merged input of all players
            Event::Input(input) => {
                trace!("received merged input for frame {}", input.frame);
                assert!(input.frame > self.last_recv_frame);
                self.inputs[input.frame as usize % SPECTATOR_BUFFER_SIZE] = input;
                self.last_recv_frame = input.frame;

                // update the frame advantage, so the host knows if we are drifting behind
                self.host.update_local_frame_advantage(input.frame);

                // update the host connection status
                for i in 0..self.num_players as usize {
                    self.host_connect_status[i] =
                        self.host.peer_connect_status(i as PlayerHandle);
                }
            }
        }

        // check event queue size and discard oldest events if too big
        while self.event_queue.len() > MAX_EVENT_QUEUE_SIZE {
            self.event_queue.pop_front();
        }
    }
}
