//! Linux namespace, TUN and routing plumbing
//!
//! The parent re-execs itself as the hidden `runc` stage inside new UTS and
//! NET namespaces, adding a USER namespace with 1-entry uid/gid maps when
//! not running as root. The child opens the TUN device, ships it over the
//! bootstrap channel and, once the parent acknowledges, brings up `lo` and
//! `tun0` and routes everything through the TUN gateway.

use std::{
    ffi::CString,
    fs,
    io::{self, Error, ErrorKind},
    mem,
    net::Ipv4Addr,
    os::unix::{
        io::{AsRawFd, FromRawFd, OwnedFd, RawFd},
        process::CommandExt,
    },
    process::{Child, Command, Stdio},
};

use log::debug;
use tun::Device as _;

/// Loopback device inside the container
pub const LO_DEVICE: &str = "lo";

/// TUN device name inside the container
pub const TUN_DEVICE: &str = "tun0";

/// Address assigned to the TUN device; also the container's default gateway
pub const TUN_ADDRESS: Ipv4Addr = Ipv4Addr::new(10, 1, 1, 1);

/// Netmask of the TUN network (10.1.1.1/24)
pub const TUN_NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

/// Re-execs the current binary as the `runc` container stage inside fresh
/// namespaces. `child_fd` is the child end of the bootstrap socket pair and
/// must survive the exec.
pub fn spawn_container(
    child_fd: RawFd,
    privileged: bool,
    uid: u32,
    gid: u32,
    command: &[String],
) -> io::Result<Child> {
    let mut cmd = Command::new("/proc/self/exe");
    cmd.arg("runc")
        .arg("--unix-fd")
        .arg(child_fd.to_string())
        .arg("--uid")
        .arg(uid.to_string())
        .arg("--gid")
        .arg(gid.to_string());
    if privileged {
        cmd.arg("--privileged");
    }
    cmd.arg("--").args(command);
    cmd.stdin(Stdio::inherit()).stdout(Stdio::inherit()).stderr(Stdio::inherit());

    let euid = unsafe { libc::geteuid() };
    let egid = unsafe { libc::getegid() };
    unsafe {
        cmd.pre_exec(move || {
            if privileged {
                unshare(libc::CLONE_NEWUTS | libc::CLONE_NEWNET)
            } else {
                unshare(libc::CLONE_NEWUTS | libc::CLONE_NEWNET | libc::CLONE_NEWUSER)?;
                // a process may map its own ids: root inside the namespace
                // becomes the invoking user outside
                fs::write("/proc/self/setgroups", "deny")?;
                fs::write("/proc/self/gid_map", format!("{gid} {egid} 1"))?;
                fs::write("/proc/self/uid_map", format!("0 {euid} 1"))
            }
        });
    }

    debug!("spawning container stage, privileged: {}", privileged);
    cmd.spawn()
}

/// Replaces the current process with the user command. When unprivileged
/// and a non-root uid is requested, the command gets a nested user
/// namespace mapping that uid onto the container root.
pub fn exec_command(command: &[String], uid: u32, gid: u32, privileged: bool) -> io::Error {
    let mut cmd = Command::new(&command[0]);
    cmd.args(&command[1..]);

    if privileged {
        cmd.uid(uid).gid(gid);
    } else if uid != 0 {
        unsafe {
            cmd.pre_exec(move || {
                unshare(libc::CLONE_NEWUSER)?;
                fs::write("/proc/self/setgroups", "deny")?;
                fs::write("/proc/self/gid_map", format!("{gid} 0 1"))?;
                fs::write("/proc/self/uid_map", format!("{uid} 0 1"))?;
                if libc::setgid(gid) != 0 {
                    return Err(Error::last_os_error());
                }
                if libc::setuid(uid) != 0 {
                    return Err(Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    cmd.exec()
}

fn unshare(flags: libc::c_int) -> io::Result<()> {
    if unsafe { libc::unshare(flags) } != 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

/// Sets the container hostname
pub fn set_hostname(name: &str) -> io::Result<()> {
    let rc = unsafe { libc::sethostname(name.as_ptr() as *const libc::c_char, name.len()) };
    if rc != 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

/// Opens the TUN device inside the container's network namespace. Layer 3,
/// no packet-information prefix. Address assignment happens separately
/// after the parent acknowledges the stack is running.
pub fn create_tun() -> io::Result<tun::platform::Device> {
    let mut config = tun::Configuration::default();
    config.name(TUN_DEVICE).layer(tun::Layer::L3).up();
    config.platform(|platform| {
        platform.packet_information(false);
    });

    match tun::create(&config) {
        Ok(device) => Ok(device),
        Err(tun::Error::Io(err)) => Err(err),
        Err(err) => Err(Error::new(ErrorKind::Other, err)),
    }
}

/// MTU of the TUN device
pub fn tun_mtu(device: &tun::platform::Device) -> io::Result<u32> {
    match device.mtu() {
        Ok(mtu) => Ok(mtu as u32),
        Err(tun::Error::Io(err)) => Err(err),
        Err(err) => Err(Error::new(ErrorKind::Other, err)),
    }
}

/// Brings `lo` and `tun0` up, assigns the TUN address and installs the
/// default route via the TUN gateway
pub fn setup_ip_network() -> io::Result<()> {
    set_link_up(LO_DEVICE)?;
    set_ipv4_address(TUN_DEVICE, TUN_ADDRESS, TUN_NETMASK)?;
    set_link_up(TUN_DEVICE)?;
    add_default_route(TUN_ADDRESS)
}

fn control_socket() -> io::Result<OwnedFd> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn ifreq_for(name: &str) -> io::Result<libc::ifreq> {
    let mut req: libc::ifreq = unsafe { mem::zeroed() };
    let name = CString::new(name).map_err(|_| Error::new(ErrorKind::InvalidInput, "bad interface name"))?;
    let bytes = name.as_bytes_with_nul();
    if bytes.len() > req.ifr_name.len() {
        return Err(Error::new(ErrorKind::InvalidInput, "interface name too long"));
    }
    for (dst, &src) in req.ifr_name.iter_mut().zip(bytes) {
        *dst = src as libc::c_char;
    }
    Ok(req)
}

fn sockaddr_in_for(addr: Ipv4Addr) -> libc::sockaddr {
    let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_addr = libc::in_addr {
        s_addr: u32::from_ne_bytes(addr.octets()),
    };
    unsafe { mem::transmute(sin) }
}

fn set_link_up(name: &str) -> io::Result<()> {
    let sock = control_socket()?;
    let mut req = ifreq_for(name)?;
    unsafe {
        if libc::ioctl(sock.as_raw_fd(), libc::SIOCGIFFLAGS, &mut req) != 0 {
            return Err(Error::last_os_error());
        }
        req.ifr_ifru.ifru_flags |= (libc::IFF_UP | libc::IFF_RUNNING) as libc::c_short;
        if libc::ioctl(sock.as_raw_fd(), libc::SIOCSIFFLAGS, &req) != 0 {
            return Err(Error::last_os_error());
        }
    }
    Ok(())
}

fn set_ipv4_address(name: &str, addr: Ipv4Addr, netmask: Ipv4Addr) -> io::Result<()> {
    let sock = control_socket()?;
    unsafe {
        let mut req = ifreq_for(name)?;
        req.ifr_ifru.ifru_addr = sockaddr_in_for(addr);
        if libc::ioctl(sock.as_raw_fd(), libc::SIOCSIFADDR, &req) != 0 {
            return Err(Error::last_os_error());
        }

        let mut req = ifreq_for(name)?;
        req.ifr_ifru.ifru_netmask = sockaddr_in_for(netmask);
        if libc::ioctl(sock.as_raw_fd(), libc::SIOCSIFNETMASK, &req) != 0 {
            return Err(Error::last_os_error());
        }
    }
    Ok(())
}

fn add_default_route(gateway: Ipv4Addr) -> io::Result<()> {
    let sock = control_socket()?;
    unsafe {
        let mut route: libc::rtentry = mem::zeroed();
        route.rt_dst = sockaddr_in_for(Ipv4Addr::UNSPECIFIED);
        route.rt_genmask = sockaddr_in_for(Ipv4Addr::UNSPECIFIED);
        route.rt_gateway = sockaddr_in_for(gateway);
        route.rt_flags = (libc::RTF_UP | libc::RTF_GATEWAY) as libc::c_ushort;

        if libc::ioctl(sock.as_raw_fd(), libc::SIOCADDRT, &route) != 0 {
            return Err(Error::last_os_error());
        }
    }
    Ok(())
}
