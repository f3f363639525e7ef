//! TCP flow termination over a smoltcp interface
//!
//! Every SYN seen on the TUN creates a listening smoltcp socket for the
//! flow's destination, so the interface completes the handshake with the
//! captured client. The resulting [`TcpConnection`] is relayed to whatever
//! the TCP connector dials for the destination.

use std::{
    collections::BTreeMap,
    io::{self, ErrorKind},
    net::SocketAddr,
    pin::Pin,
    sync::{Arc, Mutex as StdMutex},
    task::{Context, Poll},
    time::Duration as StdDuration,
};

use log::{debug, error, trace};
use smoltcp::{
    iface::{Interface, InterfaceBuilder, Routes, SocketHandle},
    socket::{TcpSocket, TcpSocketBuffer, TcpState},
    time::{Duration, Instant},
    wire::{IpAddress, IpCidr, Ipv4Address, Ipv6Address, TcpPacket},
};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    sync::{mpsc, Notify},
    task::JoinHandle,
    time,
};

use crate::{
    connect::{Network, SharedConnector},
    relay::{socks5::Address, TimeoutConn, Transporter, CONNECT_TIMEOUT, TCP_IO_TIMEOUT},
};

use super::virt_device::VirtDevice;

/// Receive/send buffer size of each flow socket
const SOCKET_BUFFER_SIZE: usize = 0x8000;

struct SocketManager {
    iface: Interface<'static, VirtDevice>,
    notify: Arc<Notify>,
}

type SharedSocketManager = Arc<StdMutex<SocketManager>>;

pub struct TcpStack {
    manager: SharedSocketManager,
    manager_handle: JoinHandle<()>,
    manager_notify: Arc<Notify>,
    iface_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    connector: SharedConnector,
    transporter: Transporter,
}

impl Drop for TcpStack {
    fn drop(&mut self) {
        self.manager_handle.abort();
    }
}

impl TcpStack {
    pub fn new(mtu: u32, connector: SharedConnector, transporter: Transporter) -> TcpStack {
        let (device, iface_rx) = VirtDevice::new(mtu as usize);

        // accept flows toward any destination: unspecific addresses with
        // /0 prefixes plus default routes, and any_ip turned on
        let iface_addrs = [
            IpCidr::new(IpAddress::v4(0, 0, 0, 1), 0),
            IpCidr::new(IpAddress::v6(0, 0, 0, 0, 0, 0, 0, 1), 0),
        ];
        let mut iface_routes = Routes::new(BTreeMap::new());
        iface_routes
            .add_default_ipv4_route(Ipv4Address::new(0, 0, 0, 1))
            .expect("ipv4 default route");
        iface_routes
            .add_default_ipv6_route(Ipv6Address::new(0, 0, 0, 0, 0, 0, 0, 1))
            .expect("ipv6 default route");

        let iface = InterfaceBuilder::new(device, vec![])
            .any_ip(true)
            .ip_addrs(iface_addrs)
            .routes(iface_routes)
            .finalize();

        let manager_notify = Arc::new(Notify::new());
        let manager = Arc::new(StdMutex::new(SocketManager {
            iface,
            notify: manager_notify.clone(),
        }));

        // drive the interface: poll on notification or when smoltcp's own
        // timers (retransmits, delayed ACKs) come due
        let manager_handle = {
            let manager = manager.clone();
            let manager_notify = manager_notify.clone();
            tokio::spawn(async move {
                loop {
                    let next_poll = {
                        let mut manager = manager.lock().unwrap();
                        if let Err(err) = manager.iface.poll(Instant::now()) {
                            trace!("interface poll error: {}", err);
                        }
                        manager
                            .iface
                            .poll_delay(Instant::now())
                            .unwrap_or(Duration::from_millis(50))
                    };

                    tokio::select! {
                        _ = time::sleep(StdDuration::from(next_poll)) => {}
                        _ = manager_notify.notified() => {}
                    }
                }
            })
        };

        TcpStack {
            manager,
            manager_handle,
            manager_notify,
            iface_rx,
            connector,
            transporter,
        }
    }

    /// Handles one TCP packet seen on the TUN. The first SYN of a flow
    /// creates its endpoint and spawns the relay task.
    pub fn handle_packet(&mut self, src_addr: SocketAddr, dst_addr: SocketAddr, packet: &TcpPacket<&[u8]>) {
        if !(packet.syn() && !packet.ack()) {
            return;
        }

        debug!("tcp flow {} -> {}", src_addr, dst_addr);

        let mut socket = TcpSocket::new(
            TcpSocketBuffer::new(vec![0u8; SOCKET_BUFFER_SIZE]),
            TcpSocketBuffer::new(vec![0u8; SOCKET_BUFFER_SIZE]),
        );
        socket.set_ack_delay(None);
        if let Err(err) = socket.listen(dst_addr) {
            // no endpoint: the handshake never completes and the flow dies
            // before any SYN-ACK
            error!("tcp flow {} -> {} endpoint failed: {}", src_addr, dst_addr, err);
            return;
        }

        let connection = TcpConnection::new(socket, self.manager.clone());

        let connector = self.connector.clone();
        let transporter = self.transporter.clone();
        tokio::spawn(async move {
            if let Err(err) = relay_flow(connector, transporter, connection, dst_addr).await {
                error!("tcp flow {} -> {} failed: {}", src_addr, dst_addr, err);
            }
        });

        self.manager_notify.notify_waiters();
    }

    /// Feeds a raw frame into the interface and wakes the poll loop
    pub fn inject_frame(&mut self, frame: &[u8]) {
        let mut manager = self.manager.lock().unwrap();
        manager.iface.device_mut().inject_packet(frame.to_vec());
        drop(manager);
        self.manager_notify.notify_waiters();
    }

    /// Next frame the interface wants written back to the TUN
    pub async fn recv_packet(&mut self) -> Vec<u8> {
        match self.iface_rx.recv().await {
            Some(frame) => frame,
            None => unreachable!("interface channel closed unexpectedly"),
        }
    }
}

async fn relay_flow(
    connector: SharedConnector,
    transporter: Transporter,
    local: TcpConnection,
    dst_addr: SocketAddr,
) -> io::Result<()> {
    // the flow's (local ip, local port) is the destination the child dialed
    let target = Address::from(dst_addr);

    let remote = match time::timeout(CONNECT_TIMEOUT, connector.dial(Network::Tcp, &target)).await {
        Ok(result) => result?,
        Err(..) => return Err(io::Error::new(ErrorKind::TimedOut, "connect timed out")),
    };

    let local = TimeoutConn::new(local, TCP_IO_TIMEOUT);
    let remote = TimeoutConn::new(remote, TCP_IO_TIMEOUT);
    transporter.transport(local, remote).await
}

/// One captured flow endpoint, readable and writable through the shared
/// interface. Dropping the connection closes the smoltcp socket.
pub struct TcpConnection {
    handle: SocketHandle,
    manager: SharedSocketManager,
}

impl TcpConnection {
    fn new(socket: TcpSocket<'static>, manager: SharedSocketManager) -> TcpConnection {
        let handle = {
            let mut manager = manager.lock().unwrap();
            manager.iface.add_socket(socket)
        };
        TcpConnection { handle, manager }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        let mut manager = self.manager.lock().unwrap();
        let socket = manager.iface.get_socket::<TcpSocket>(self.handle);
        socket.close();
        manager.notify.notify_waiters();
    }
}

impl AsyncRead for TcpConnection {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let mut manager = this.manager.lock().unwrap();
        {
            let socket = manager.iface.get_socket::<TcpSocket>(this.handle);
            if !socket.is_open() {
                return Poll::Ready(Ok(()));
            }
            if socket.can_recv() {
                let recv_buf = buf.initialize_unfilled();
                match socket.recv_slice(recv_buf) {
                    Ok(n) => buf.advance(n),
                    Err(err) => return Poll::Ready(Err(io::Error::new(ErrorKind::Other, err))),
                }
            } else {
                socket.register_recv_waker(cx.waker());
                return Poll::Pending;
            }
        }
        manager.notify.notify_waiters();
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for TcpConnection {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let mut manager = this.manager.lock().unwrap();
        let n = {
            let socket = manager.iface.get_socket::<TcpSocket>(this.handle);
            if !socket.is_open() {
                return Poll::Ready(Err(ErrorKind::BrokenPipe.into()));
            }
            if socket.can_send() {
                match socket.send_slice(buf) {
                    Ok(n) => n,
                    Err(err) => return Poll::Ready(Err(io::Error::new(ErrorKind::Other, err))),
                }
            } else {
                socket.register_send_waker(cx.waker());
                return Poll::Pending;
            }
        };
        manager.notify.notify_waiters();
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let mut manager = this.manager.lock().unwrap();
        {
            let socket = manager.iface.get_socket::<TcpSocket>(this.handle);
            if socket.is_open() {
                socket.close();
            }
            if socket.state() != TcpState::Closed {
                socket.register_send_waker(cx.waker());
                return Poll::Pending;
            }
        }
        manager.notify.notify_waiters();
        Poll::Ready(Ok(()))
    }
}
