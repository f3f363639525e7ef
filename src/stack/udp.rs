//! UDP flow termination
//!
//! UDP payloads are lifted straight out of the TUN packets. Each
//! `(source, destination)` pair becomes a flow with its own dialed upstream
//! connection; payloads travel into the flow over a bounded queue and
//! replies are re-synthesized as IP packets and written back to the TUN.
//! A flow ends when its relay times out, which removes the map entry.

use std::{
    collections::HashMap,
    io::{self, ErrorKind},
    net::SocketAddr,
    pin::Pin,
    sync::{Arc, Mutex as StdMutex},
    task::{Context, Poll},
};

use bytes::BufMut;
use etherparse::PacketBuilder;
use log::{debug, error, trace};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    sync::mpsc,
    time,
};

use crate::{
    connect::{Network, SharedConnector},
    relay::{socks5::Address, TimeoutConn, Transporter, CONNECT_TIMEOUT, UDP_IO_TIMEOUT},
};

/// Queued datagrams per flow before drops kick in
const FLOW_QUEUE_SIZE: usize = 64;

type FlowKey = (SocketAddr, SocketAddr);
type FlowMap = Arc<StdMutex<HashMap<FlowKey, mpsc::Sender<Vec<u8>>>>>;

pub struct UdpStack {
    flows: FlowMap,
    reply_tx: mpsc::UnboundedSender<Vec<u8>>,
    reply_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    connector: SharedConnector,
    transporter: Transporter,
}

impl UdpStack {
    pub fn new(connector: SharedConnector, transporter: Transporter) -> UdpStack {
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        UdpStack {
            flows: Arc::new(StdMutex::new(HashMap::new())),
            reply_tx,
            reply_rx,
            connector,
            transporter,
        }
    }

    /// Dispatches one captured datagram into its flow, creating the flow on
    /// first sight
    pub fn handle_packet(&mut self, src_addr: SocketAddr, dst_addr: SocketAddr, payload: &[u8]) {
        let mut datagram = payload.to_vec();

        // one retry: the entry may belong to a flow whose relay just ended
        for _ in 0..2 {
            let tx = self.flow_sender(src_addr, dst_addr);
            match tx.try_send(datagram) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Full(..)) => {
                    trace!("udp flow {} -> {} queue full, dropping datagram", src_addr, dst_addr);
                    return;
                }
                Err(mpsc::error::TrySendError::Closed(returned)) => {
                    datagram = returned;
                    self.flows.lock().unwrap().remove(&(src_addr, dst_addr));
                }
            }
        }
    }

    fn flow_sender(&self, src_addr: SocketAddr, dst_addr: SocketAddr) -> mpsc::Sender<Vec<u8>> {
        let mut flows = self.flows.lock().unwrap();
        if let Some(tx) = flows.get(&(src_addr, dst_addr)) {
            return tx.clone();
        }

        debug!("udp flow {} -> {}", src_addr, dst_addr);

        let (tx, rx) = mpsc::channel(FLOW_QUEUE_SIZE);
        flows.insert((src_addr, dst_addr), tx.clone());

        let flows = self.flows.clone();
        let reply_tx = self.reply_tx.clone();
        let connector = self.connector.clone();
        let transporter = self.transporter.clone();
        tokio::spawn(async move {
            if let Err(err) = relay_flow(connector, transporter, rx, reply_tx, src_addr, dst_addr).await {
                error!("udp flow {} -> {} failed: {}", src_addr, dst_addr, err);
            }
            flows.lock().unwrap().remove(&(src_addr, dst_addr));
        });

        tx
    }

    /// Next reply packet to write back to the TUN
    pub async fn recv_packet(&mut self) -> Vec<u8> {
        match self.reply_rx.recv().await {
            Some(packet) => packet,
            None => unreachable!("reply channel closed unexpectedly"),
        }
    }
}

async fn relay_flow(
    connector: SharedConnector,
    transporter: Transporter,
    rx: mpsc::Receiver<Vec<u8>>,
    reply_tx: mpsc::UnboundedSender<Vec<u8>>,
    src_addr: SocketAddr,
    dst_addr: SocketAddr,
) -> io::Result<()> {
    // the flow's (local ip, local port) is the destination the child sent to
    let target = Address::from(dst_addr);

    let remote = match time::timeout(CONNECT_TIMEOUT, connector.dial(Network::Udp, &target)).await {
        Ok(result) => result?,
        Err(..) => return Err(io::Error::new(ErrorKind::TimedOut, "connect timed out")),
    };

    let local = UdpFlow {
        rx,
        reply_tx,
        src_addr,
        dst_addr,
    };

    let local = TimeoutConn::new(local, UDP_IO_TIMEOUT);
    let remote = TimeoutConn::new(remote, UDP_IO_TIMEOUT);
    transporter.transport(local, remote).await
}

/// The TUN-side endpoint of a UDP flow: reads pop captured payloads off the
/// flow queue, writes wrap upstream payloads into IP/UDP reply packets
/// addressed back to the captured client
struct UdpFlow {
    rx: mpsc::Receiver<Vec<u8>>,
    reply_tx: mpsc::UnboundedSender<Vec<u8>>,
    src_addr: SocketAddr,
    dst_addr: SocketAddr,
}

impl AsyncRead for UdpFlow {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(datagram)) => {
                let n = datagram.len().min(buf.remaining());
                buf.put_slice(&datagram[..n]);
                Poll::Ready(Ok(()))
            }
            // stack dropped the sender: flow is done
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for UdpFlow {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let packet = match build_reply_packet(this.src_addr, this.dst_addr, buf) {
            Some(packet) => packet,
            None => {
                return Poll::Ready(Err(io::Error::new(
                    ErrorKind::InvalidData,
                    "source and destination family mismatch",
                )))
            }
        };
        if this.reply_tx.send(packet).is_err() {
            return Poll::Ready(Err(ErrorKind::BrokenPipe.into()));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Synthesizes the IP/UDP packet carrying `payload` from the flow's
/// destination back to the captured client
fn build_reply_packet(src_addr: SocketAddr, dst_addr: SocketAddr, payload: &[u8]) -> Option<Vec<u8>> {
    const REPLY_TTL: u8 = 20;

    match (src_addr, dst_addr) {
        (SocketAddr::V4(client), SocketAddr::V4(remote)) => {
            let builder = PacketBuilder::ipv4(remote.ip().octets(), client.ip().octets(), REPLY_TTL)
                .udp(remote.port(), client.port());
            let mut packet = Vec::with_capacity(builder.size(payload.len())).writer();
            builder.write(&mut packet, payload).expect("ipv4 packet build");
            Some(packet.into_inner())
        }
        (SocketAddr::V6(client), SocketAddr::V6(remote)) => {
            let builder = PacketBuilder::ipv6(remote.ip().octets(), client.ip().octets(), REPLY_TTL)
                .udp(remote.port(), client.port());
            let mut packet = Vec::with_capacity(builder.size(payload.len())).writer();
            builder.write(&mut packet, payload).expect("ipv6 packet build");
            Some(packet.into_inner())
        }
        _ => None,
    }
}
