//! Non-blocking UDP transport.
//!
//! Every [`Message`] travels in one datagram encoded with the [`codec`]. Datagrams from
//! addresses that were never registered with [`Transport::add_remote`] are dropped.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use crate::network::codec;
use crate::network::messages::Message;
use crate::report_violation;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::{DeviceId, Transport};

const RECV_BUFFER_SIZE: usize = 4096;
const SEND_BUFFER_SIZE: usize = 1024;
/// Largest payload that avoids IP fragmentation on any path.
const IDEAL_MAX_UDP_PACKET_SIZE: usize = 508;

/// A [`Transport`] over a non-blocking [`UdpSocket`].
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    addresses: BTreeMap<DeviceId, SocketAddr>,
    recv_buffer: Box<[u8; RECV_BUFFER_SIZE]>,
    send_buffer: Box<[u8; SEND_BUFFER_SIZE]>,
}

impl UdpTransport {
    /// Binds to `port` on all IPv4 interfaces. Port `0` picks a free port.
    pub fn bind_to_port(port: u16) -> Result<Self, std::io::Error> {
        Self::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))
    }

    /// Binds to `addr`.
    pub fn bind(addr: SocketAddr) -> Result<Self, std::io::Error> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            addresses: BTreeMap::new(),
            recv_buffer: Box::new([0; RECV_BUFFER_SIZE]),
            send_buffer: Box::new([0; SEND_BUFFER_SIZE]),
        })
    }

    /// The address the socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.socket.local_addr()
    }

    fn device_for(&self, addr: SocketAddr) -> Option<DeviceId> {
        self.addresses
            .iter()
            .find(|(_, known)| **known == addr)
            .map(|(id, _)| *id)
    }

    fn send_encoded(&self, buf: &[u8], addr: SocketAddr) -> usize {
        if buf.len() > IDEAL_MAX_UDP_PACKET_SIZE {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::Transport,
                "sending {} byte datagram, larger than the ideal {}",
                buf.len(),
                IDEAL_MAX_UDP_PACKET_SIZE
            );
        }
        match self.socket.send_to(buf, addr) {
            Ok(written) => written,
            Err(e) => {
                report_violation!(
                    ViolationSeverity::Warning,
                    ViolationKind::Transport,
                    "failed to send datagram to {}: {}",
                    addr,
                    e
                );
                0
            }
        }
    }
}

impl Transport for UdpTransport {
    type Address = SocketAddr;

    fn add_remote(&mut self, device_id: DeviceId, address: SocketAddr) {
        self.addresses.insert(device_id, address);
    }

    fn send_to(&mut self, device_id: DeviceId, message: &Message) -> usize {
        let Some(&addr) = self.addresses.get(&device_id) else {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::Transport,
                "no address registered for device {}",
                device_id
            );
            return 0;
        };

        match codec::encode_message_into(message, &mut self.send_buffer[..]) {
            Ok(len) => self.send_encoded(&self.send_buffer[..len], addr),
            Err(codec::CodecError::BufferTooSmall { .. }) => match codec::encode_message(message) {
                Ok(buf) => self.send_encoded(&buf, addr),
                Err(e) => {
                    report_violation!(
                        ViolationSeverity::Error,
                        ViolationKind::Transport,
                        "failed to encode message: {}",
                        e
                    );
                    0
                }
            },
            Err(e) => {
                report_violation!(
                    ViolationSeverity::Error,
                    ViolationKind::Transport,
                    "failed to encode message: {}",
                    e
                );
                0
            }
        }
    }

    fn receive_from(&mut self) -> Vec<(DeviceId, Message)> {
        let mut received = Vec::new();
        loop {
            match self.socket.recv_from(&mut self.recv_buffer[..]) {
                Ok((len, src)) => {
                    let Some(device_id) = self.device_for(src) else {
                        report_violation!(
                            ViolationSeverity::Warning,
                            ViolationKind::Transport,
                            "dropping datagram from unknown address {}",
                            src
                        );
                        continue;
                    };
                    match codec::decode_message(&self.recv_buffer[..len]) {
                        Ok(message) => received.push((device_id, message)),
                        Err(e) => {
                            tracing::trace!(device = %device_id, error = %e, "undecodable datagram dropped");
                        }
                    }
                }
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => return received,
                // ICMP port unreachable from a peer that went away
                Err(ref err) if err.kind() == ErrorKind::ConnectionReset => continue,
                Err(err) => {
                    report_violation!(
                        ViolationSeverity::Error,
                        ViolationKind::Transport,
                        "unexpected socket error: {:?}: {}",
                        err.kind(),
                        err
                    );
                    return received;
                }
            }
        }
    }
}
