//! `run` subcommand: transparent proxy container, parent stage

use std::process::ExitCode;

use clap::ArgMatches;

#[cfg(target_os = "linux")]
pub fn main(matches: &ArgMatches) -> ExitCode {
    use log::{debug, error};
    use tokio::{runtime::Builder, task};

    use crate::{
        config::{parse_address_mapper, parse_proxy_urls},
        connect::compose_transparent,
        ipc::BootstrapChannel,
        logging,
        relay::Transporter,
        stack::NetworkStack,
        sys,
    };

    let verbose = matches.get_count("VERBOSE");
    logging::init(verbose);

    let forward: Vec<String> = matches
        .get_many::<String>("FORWARD")
        .map(|values| values.cloned().collect())
        .unwrap_or_default();
    let mappings: Vec<String> = matches
        .get_many::<String>("LOCAL")
        .map(|values| values.cloned().collect())
        .unwrap_or_default();
    let command: Vec<String> = matches
        .get_many::<String>("COMMAND")
        .map(|values| values.cloned().collect())
        .unwrap_or_default();
    let uid = *matches.get_one::<u32>("UID").expect("default");
    let gid = *matches.get_one::<u32>("GID").expect("default");

    if forward.is_empty() {
        error!("forward proxies list is empty");
        return ExitCode::FAILURE;
    }
    if command.is_empty() {
        error!("no command given");
        return ExitCode::FAILURE;
    }
    debug!("forward proxies: {:?}", forward);
    debug!("local address mappings: {:?}", mappings);

    let proxies = match parse_proxy_urls(&forward) {
        Ok(proxies) => proxies,
        Err(err) => {
            error!("{}", err);
            return ExitCode::FAILURE;
        }
    };
    let mapper = match parse_address_mapper(&mappings) {
        Ok(mapper) => mapper,
        Err(err) => {
            error!("{}", err);
            return ExitCode::FAILURE;
        }
    };

    let result = (|| -> std::io::Result<ExitCode> {
        use std::os::unix::io::AsRawFd;

        let (mut channel, child_end) = BootstrapChannel::pair()?;

        let privileged = unsafe { libc::geteuid() } == 0;
        let mut child = sys::spawn_container(child_end.as_raw_fd(), privileged, uid, gid, &command)?;
        drop(child_end);

        let tun_fd = channel.recv_tun_fd()?;
        debug!("got tun device fd {}", tun_fd);
        let mtu = channel.recv_mtu()?;
        debug!("tun mtu {}", mtu);

        let runtime = Builder::new_multi_thread().enable_all().build()?;
        runtime.block_on(async move {
            let (tcp_connector, udp_connector) = compose_transparent(&proxies, mapper);
            let stack = NetworkStack::new(tun_fd, mtu, tcp_connector, udp_connector, Transporter::new())?;

            let stack_handle = tokio::spawn(async move {
                if let Err(err) = stack.run().await {
                    error!("network stack failed: {}", err);
                }
            });

            channel.send_ack()?;

            let status = task::spawn_blocking(move || child.wait())
                .await
                .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))??;
            stack_handle.abort();

            Ok(match status.code() {
                Some(code) => ExitCode::from(code.clamp(0, 255) as u8),
                None => ExitCode::FAILURE,
            })
        })
    })();

    match result {
        Ok(code) => code,
        Err(err) => {
            error!("run failed: {}", err);
            ExitCode::FAILURE
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn main(_matches: &ArgMatches) -> ExitCode {
    eprintln!("the run command is not supported on this OS");
    ExitCode::FAILURE
}
