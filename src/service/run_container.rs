//! `runc` subcommand: in-container stage, not user-invoked
//!
//! Runs inside the namespaces the parent created. Opens the TUN device,
//! ships its fd and MTU back over the bootstrap socket, waits for the
//! parent's ACK, configures the container network and execs the user
//! command.

use std::process::ExitCode;

use clap::ArgMatches;

#[cfg(target_os = "linux")]
pub fn main(matches: &ArgMatches) -> ExitCode {
    use std::os::unix::{
        io::{AsRawFd, FromRawFd},
        net::UnixStream,
    };

    use crate::{ipc::BootstrapChannel, sys};

    let hostname = matches.get_one::<String>("HOSTNAME").expect("default");
    let unix_fd = *matches.get_one::<i32>("UNIX_FD").expect("required");
    let privileged = matches.get_flag("PRIVILEGED");
    let uid = *matches.get_one::<u32>("UID").expect("default");
    let gid = *matches.get_one::<u32>("GID").expect("default");
    let command: Vec<String> = matches
        .get_many::<String>("COMMAND")
        .map(|values| values.cloned().collect())
        .unwrap_or_default();

    if command.is_empty() {
        eprintln!("runc: no command given");
        return ExitCode::FAILURE;
    }

    let result = (|| -> std::io::Result<()> {
        sys::set_hostname(hostname)?;

        let stream = unsafe { UnixStream::from_raw_fd(unix_fd) };
        let mut channel = BootstrapChannel::new(stream);

        let device = sys::create_tun()?;
        channel.send_tun_fd(device.as_raw_fd())?;
        channel.send_mtu(sys::tun_mtu(&device)?)?;

        // the parent holds its own duplicate of the tun fd; packets must
        // not flow before its network stack is up
        channel.recv_ack()?;

        sys::setup_ip_network()?;
        drop(device);

        Err(sys::exec_command(&command, uid, gid, privileged))
    })();

    // exec never returns on success, so reaching here is always a failure
    if let Err(err) = result {
        eprintln!("runc: {err}");
    }
    ExitCode::FAILURE
}

#[cfg(not(target_os = "linux"))]
pub fn main(_matches: &ArgMatches) -> ExitCode {
    eprintln!("the runc command is not supported on this OS");
    ExitCode::FAILURE
}
