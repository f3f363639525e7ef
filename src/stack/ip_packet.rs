//! IP packet view over a raw TUN frame

use std::net::IpAddr;

use smoltcp::wire::{IpAddress, IpProtocol, IpVersion, Ipv4Packet, Ipv6Packet};

pub enum IpPacket<T: AsRef<[u8]>> {
    Ipv4(Ipv4Packet<T>),
    Ipv6(Ipv6Packet<T>),
}

impl<T: AsRef<[u8]>> IpPacket<T> {
    pub fn new_checked(packet: T) -> Option<IpPacket<T>> {
        match IpVersion::of_packet(packet.as_ref()).ok()? {
            IpVersion::Ipv4 => Ipv4Packet::new_checked(packet).ok().map(IpPacket::Ipv4),
            IpVersion::Ipv6 => Ipv6Packet::new_checked(packet).ok().map(IpPacket::Ipv6),
            _ => None,
        }
    }

    pub fn src_addr(&self) -> IpAddr {
        match *self {
            IpPacket::Ipv4(ref packet) => IpAddr::from(IpAddress::from(packet.src_addr())),
            IpPacket::Ipv6(ref packet) => IpAddr::from(IpAddress::from(packet.src_addr())),
        }
    }

    pub fn dst_addr(&self) -> IpAddr {
        match *self {
            IpPacket::Ipv4(ref packet) => IpAddr::from(IpAddress::from(packet.dst_addr())),
            IpPacket::Ipv6(ref packet) => IpAddr::from(IpAddress::from(packet.dst_addr())),
        }
    }

    pub fn protocol(&self) -> IpProtocol {
        match *self {
            IpPacket::Ipv4(ref packet) => packet.protocol(),
            IpPacket::Ipv6(ref packet) => packet.next_header(),
        }
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> IpPacket<&'a T> {
    pub fn payload(&self) -> &'a [u8] {
        match *self {
            IpPacket::Ipv4(ref packet) => packet.payload(),
            IpPacket::Ipv6(ref packet) => packet.payload(),
        }
    }
}
