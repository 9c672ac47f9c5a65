use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, TryRecvError, TrySendError, bounded};

use super::protocol::MAX_PACKET_SIZE;

const RECV_BUFFER_SIZE: usize = MAX_PACKET_SIZE * 2;

/// Best-effort datagram delivery, polled once per tick.
pub trait Transport {
    fn send(&mut self, addr: SocketAddr, data: &[u8]) -> io::Result<usize>;

    /// Next available datagram, or `None` when nothing is queued.
    fn poll(&mut self) -> io::Result<Option<(SocketAddr, Vec<u8>)>>;

    fn local_addr(&self) -> SocketAddr;
}

pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
    recv_buffer: Box<[u8; RECV_BUFFER_SIZE]>,
}

impl UdpTransport {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket,
            local_addr,
            recv_buffer: Box::new([0u8; RECV_BUFFER_SIZE]),
        })
    }
}

impl Transport for UdpTransport {
    fn send(&mut self, addr: SocketAddr, data: &[u8]) -> io::Result<usize> {
        self.socket.send_to(data, addr)
    }

    fn poll(&mut self) -> io::Result<Option<(SocketAddr, Vec<u8>)>> {
        match self.socket.recv_from(&mut self.recv_buffer[..]) {
            Ok((size, addr)) => Ok(Some((addr, self.recv_buffer[..size].to_vec()))),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            // ICMP port unreachable from a vanished peer surfaces here on some platforms.
            Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// UDP socket whose receive side runs on its own thread.
///
/// The thread is the single producer of a bounded channel that the simulation
/// drains with `poll`; datagrams arriving while the channel is full are dropped.
pub struct ThreadedUdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
    inbound: Receiver<(SocketAddr, Vec<u8>)>,
    running: Arc<AtomicBool>,
    receiver: Option<JoinHandle<()>>,
}

impl ThreadedUdpTransport {
    pub fn bind<A: ToSocketAddrs>(addr: A, queue_capacity: usize) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        let local_addr = socket.local_addr()?;
        let recv_socket = socket.try_clone()?;
        recv_socket.set_read_timeout(Some(Duration::from_millis(50)))?;

        let (sender, inbound) = bounded(queue_capacity.max(1));
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = Arc::clone(&running);

        let receiver = thread::Builder::new()
            .name("tether-udp-recv".into())
            .spawn(move || {
                let mut buffer = vec![0u8; RECV_BUFFER_SIZE];
                while thread_running.load(Ordering::Relaxed) {
                    match recv_socket.recv_from(&mut buffer) {
                        Ok((size, addr)) => match sender.try_send((addr, buffer[..size].to_vec())) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => {
                                log::debug!("inbound queue full, dropping datagram from {addr}");
                            }
                            Err(TrySendError::Disconnected(_)) => break,
                        },
                        Err(ref e)
                            if matches!(
                                e.kind(),
                                io::ErrorKind::WouldBlock
                                    | io::ErrorKind::TimedOut
                                    | io::ErrorKind::ConnectionReset
                            ) => {}
                        Err(e) => {
                            log::warn!("udp receive failed: {e}");
                            break;
                        }
                    }
                }
            })?;

        Ok(Self {
            socket,
            local_addr,
            inbound,
            running,
            receiver: Some(receiver),
        })
    }

    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.receiver.take() {
            if handle.join().is_err() {
                log::warn!("udp receive thread panicked");
            }
        }
    }
}

impl Drop for ThreadedUdpTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Transport for ThreadedUdpTransport {
    fn send(&mut self, addr: SocketAddr, data: &[u8]) -> io::Result<usize> {
        self.socket.send_to(data, addr)
    }

    fn poll(&mut self) -> io::Result<Option<(SocketAddr, Vec<u8>)>> {
        match self.inbound.try_recv() {
            Ok(datagram) => Ok(Some(datagram)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "udp receive thread stopped",
            )),
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}
