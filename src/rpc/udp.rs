//! UDP transport, one JSON message per datagram.

use std::net::{SocketAddr, UdpSocket};
use std::thread;
use std::time::Duration;

use tracing::{debug, trace};

use super::{Transport, TransportError};
use crate::dht::WeakDht;

/// Largest payload of a single UDP datagram.
const MAX_DATAGRAM_SIZE: usize = 65_507;
/// The maximum duration to backoff checking the [UdpSocket] buffer after it is empty.
/// Lower values increases CPU usage, but reduces latency, and drains the buffer faster,
/// reducing the risk of packet loss.
pub const MAX_THREAD_BLOCK_DURATION: Duration = Duration::from_millis(10);

/// Sends messages as UDP datagrams.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub fn new(socket: UdpSocket) -> Self {
        Self { socket }
    }
}

impl Transport for UdpTransport {
    fn send(&self, to: SocketAddr, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.socket.send_to(&bytes, to)?;

        Ok(())
    }
}

/// Spawn the thread receiving datagrams for a node.
///
/// Requests are answered to the datagram's source address. The thread exits
/// once the node is shut down or every handle to it is dropped.
pub(crate) fn listen(socket: UdpSocket, dht: WeakDht) -> std::io::Result<()> {
    socket.set_nonblocking(true)?;

    let local_addr = socket.local_addr()?;

    thread::Builder::new()
        .name(format!("kadnode udp listener {}", local_addr))
        .spawn(move || {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

            loop {
                let node = match dht.upgrade() {
                    Some(node) if !node.is_shutdown() => node,
                    _ => break,
                };

                match socket.recv_from(&mut buf) {
                    Ok((amt, from)) => {
                        if from.port() == 0 {
                            trace!(context = "socket_validation", message = "Datagram from port 0");
                            continue;
                        }

                        if let Some(reply) = node.handle_incoming(&buf[..amt]) {
                            if let Err(error) = socket.send_to(&reply, from) {
                                debug!(?error, ?from, "Error sending response message");
                            }
                        }
                    }
                    Err(ref error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                        drop(node);
                        thread::sleep(MAX_THREAD_BLOCK_DURATION);
                    }
                    Err(error) => {
                        trace!(context = "socket_error", ?error, "recv_from failed unexpectedly");
                    }
                }
            }

            debug!(?local_addr, "UDP listener stopped");
        })?;

    Ok(())
}
