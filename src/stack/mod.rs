//! User-space network stack over the received TUN file descriptor
//!
//! IP packets read from the TUN are dispatched per transport: TCP frames
//! feed a smoltcp interface that terminates each flow, UDP payloads feed
//! per-flow sessions, and everything else is dropped. Each flow dials the
//! configured connector and is relayed by the transporter under per-
//! operation timeouts.

use std::{io, net::SocketAddr, os::unix::io::RawFd};

use byte_string::ByteStr;
use log::{error, trace, warn};
use smoltcp::wire::{IpProtocol, TcpPacket, UdpPacket};

use crate::{connect::SharedConnector, relay::Transporter};

mod device;
mod ip_packet;
mod tcp;
mod udp;
mod virt_device;

use self::{device::TunDevice, ip_packet::IpPacket, tcp::TcpStack, udp::UdpStack};

pub struct NetworkStack {
    device: TunDevice,
    mtu: u32,
    tcp: TcpStack,
    udp: UdpStack,
}

impl NetworkStack {
    /// Builds the stack over a TUN fd and its MTU, as delivered by the
    /// bootstrap channel
    pub fn new(
        tun_fd: RawFd,
        mtu: u32,
        tcp_connector: SharedConnector,
        udp_connector: SharedConnector,
        transporter: Transporter,
    ) -> io::Result<NetworkStack> {
        let device = TunDevice::new(tun_fd)?;
        let tcp = TcpStack::new(mtu, tcp_connector, transporter.clone());
        let udp = UdpStack::new(udp_connector, transporter);
        Ok(NetworkStack { device, mtu, tcp, udp })
    }

    /// Packet loop; runs until the TUN fd fails (child teardown)
    pub async fn run(mut self) -> io::Result<()> {
        let mut packet_buffer = vec![0u8; self.mtu as usize].into_boxed_slice();
        loop {
            tokio::select! {
                n = self.device.read_packet(&mut packet_buffer) => {
                    let n = n?;
                    if n == 0 {
                        return Ok(());
                    }
                    self.handle_frame(&packet_buffer[..n]);
                }
                frame = self.tcp.recv_packet() => {
                    if let Err(err) = self.device.write_packet(&frame).await {
                        error!("tun write failed: {}, packet: {:?}", err, ByteStr::new(&frame));
                    }
                }
                packet = self.udp.recv_packet() => {
                    if let Err(err) = self.device.write_packet(&packet).await {
                        error!("tun write failed: {}, packet: {:?}", err, ByteStr::new(&packet));
                    }
                }
            }
        }
    }

    /// Dispatches one IP frame. Only TCP and UDP pass; every other protocol
    /// is dropped, on both v4 and v6.
    fn handle_frame(&mut self, frame: &[u8]) {
        let packet = match IpPacket::new_checked(frame) {
            Some(packet) => packet,
            None => {
                warn!("unrecognized IP packet {:?}", ByteStr::new(frame));
                return;
            }
        };

        match packet.protocol() {
            IpProtocol::Tcp => {
                let tcp_packet = match TcpPacket::new_checked(packet.payload()) {
                    Ok(p) => p,
                    Err(err) => {
                        error!(
                            "invalid TCP packet: {}, src: {}, dst: {}, payload: {:?}",
                            err,
                            packet.src_addr(),
                            packet.dst_addr(),
                            ByteStr::new(packet.payload())
                        );
                        return;
                    }
                };

                let src_addr = SocketAddr::new(packet.src_addr(), tcp_packet.src_port());
                let dst_addr = SocketAddr::new(packet.dst_addr(), tcp_packet.dst_port());

                self.tcp.handle_packet(src_addr, dst_addr, &tcp_packet);
                self.tcp.inject_frame(frame);
            }
            IpProtocol::Udp => {
                let udp_packet = match UdpPacket::new_checked(packet.payload()) {
                    Ok(p) => p,
                    Err(err) => {
                        error!(
                            "invalid UDP packet: {}, src: {}, dst: {}, payload: {:?}",
                            err,
                            packet.src_addr(),
                            packet.dst_addr(),
                            ByteStr::new(packet.payload())
                        );
                        return;
                    }
                };

                let src_addr = SocketAddr::new(packet.src_addr(), udp_packet.src_port());
                let dst_addr = SocketAddr::new(packet.dst_addr(), udp_packet.dst_port());

                self.udp.handle_packet(src_addr, dst_addr, udp_packet.payload());
            }
            protocol => {
                trace!("dropped IP packet (protocol {:?})", protocol);
            }
        }
    }
}
