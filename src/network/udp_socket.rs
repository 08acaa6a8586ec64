use crate::network::udp_msg::{UdpMessage, MAX_UDP_PACKET_SIZE};
use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use tracing::warn;

#[derive(Debug)]
pub(crate) struct NonBlockingSocket {
    socket: UdpSocket,
    buffer: [u8; MAX_UDP_PACKET_SIZE],
}

impl NonBlockingSocket {
    pub(crate) fn new<A: ToSocketAddrs>(addr: A) -> Result<Self, std::io::Error> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            buffer: [0; MAX_UDP_PACKET_SIZE],
        })
    }

    pub(crate) fn send_to<A: ToSocketAddrs>(&self, msg: &UdpMessage, addr: A) {
        let buf = msg.serialize();
        if let Err(err) = self.socket.send_to(&buf, addr) {
            warn!("sending a datagram failed: {}", err);
        }
    }

    pub(crate) fn receive_all_messages(&mut self) -> Vec<(SocketAddr, UdpMessage)> {
        let mut received_messages = Vec::new();
        loop {
            match self.socket.recv_from(&mut self.buffer) {
                Ok((number_of_bytes, src_addr)) => {
                    assert!(number_of_bytes <= MAX_UDP_PACKET_SIZE);
                    match UdpMessage::deserialize(&self.buffer[0..number_of_bytes]) {
                        Ok(msg) => received_messages.push((src_addr, msg)),
                        // a datagram we cannot parse is not one of ours, drop it
                        Err(err) => warn!("dropping malformed datagram from {}: {}", src_addr, err),
                    }
                }
                // there are no more messages
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => return received_messages,
                // datagram sockets apparently sometimes do this when there are no messages instead of `WouldBlock`
                Err(ref err) if err.kind() == ErrorKind::ConnectionReset => {
                    return received_messages
                }
                Err(err) => {
                    warn!("receiving from {:?} failed: {}", self.socket, err);
                    return received_messages;
                }
            }
        }
    }
}
