//! `server` subcommand: SOCKS5 rotator

use std::{fs::File, io::BufReader, process::ExitCode, sync::Arc};

use clap::ArgMatches;
use log::{error, info};
use tokio::{net::TcpListener, runtime::Builder};

use crate::{
    config::{parse_proxy_file, ConfigError, SocksAddr},
    connect::compose_rotation,
    logging, monitor,
    server::Socks5Server,
};

pub fn main(matches: &ArgMatches) -> ExitCode {
    let verbose = matches.get_count("VERBOSE");
    logging::init(verbose);

    let listen_addr = normalize_listen_addr(matches.get_one::<String>("LISTEN_ADDR").expect("default"));
    let proxy_file = matches.get_one::<String>("PROXY_FILE").expect("default");

    let proxies = match load_proxies(proxy_file) {
        Ok(proxies) => proxies,
        Err(err) => {
            error!("failed to load proxies from {}: {}", proxy_file, err);
            return ExitCode::FAILURE;
        }
    };
    if proxies.is_empty() {
        error!("proxy file {} contains no proxies", proxy_file);
        return ExitCode::FAILURE;
    }

    let runtime = match Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("failed to build runtime: {}", err);
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(async move {
        let listener = TcpListener::bind(&listen_addr).await?;
        info!("listening on {}", listener.local_addr()?);

        let (tcp_connector, udp_connector) = compose_rotation(&proxies);
        let server = Arc::new(Socks5Server::new(tcp_connector, udp_connector));

        // a signal wins the select, closing the listener
        tokio::select! {
            result = server.serve(listener) => result,
            result = monitor::create_signal_monitor() => result,
        }
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("server failed: {}", err);
            ExitCode::FAILURE
        }
    }
}

fn load_proxies(path: &str) -> Result<Vec<SocksAddr>, ConfigError> {
    let file = File::open(path)?;
    parse_proxy_file(BufReader::new(file))
}

/// `":1080"` listens on every interface, like a bare port
fn normalize_listen_addr(addr: &str) -> String {
    if let Some(port) = addr.strip_prefix(':') {
        return format!("0.0.0.0:{port}");
    }
    addr.to_owned()
}
