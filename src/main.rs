use std::process::ExitCode;

use clap::{Arg, ArgAction, Command};

use sockspin::service;

fn main() -> ExitCode {
    let app = Command::new("sockspin")
        .version(sockspin::VERSION)
        .about("SOCKS5 proxy rotator")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(server_command())
        .subcommand(run_command())
        .subcommand(run_container_command());

    let matches = app.get_matches();
    match matches.subcommand() {
        Some(("server", matches)) => service::server::main(matches),
        Some(("run", matches)) => service::run::main(matches),
        Some(("runc", matches)) => service::run_container::main(matches),
        _ => unreachable!("subcommand required"),
    }
}

fn server_command() -> Command {
    Command::new("server")
        .about("Start a SOCKS5 server load-balancing requests over the proxy pool")
        .arg(
            Arg::new("LISTEN_ADDR")
                .short('l')
                .long("listen")
                .num_args(1)
                .action(ArgAction::Set)
                .default_value(":1080")
                .help("SOCKS5 server listen address"),
        )
        .arg(
            Arg::new("PROXY_FILE")
                .short('f')
                .long("file")
                .num_args(1)
                .action(ArgAction::Set)
                .default_value("proxies.txt")
                .help("SOCKS5 proxies file, one address per line"),
        )
        .arg(verbose_arg())
}

fn run_command() -> Command {
    Command::new("run")
        .about("Run a command in an unprivileged container that transparently proxies its traffic")
        .arg(
            Arg::new("FORWARD")
                .short('F')
                .long("forward")
                .num_args(1)
                .action(ArgAction::Append)
                .value_name("address")
                .help("SOCKS5 proxy to forward TCP/UDP traffic through, repeatable to build a chain"),
        )
        .arg(
            Arg::new("LOCAL")
                .short('L')
                .long("local")
                .num_args(1)
                .action(ArgAction::Append)
                .value_name("[target_host:]port:host:hostport[/net]")
                .help("Forward connections matching the target directly to the given host and port"),
        )
        .arg(uid_arg())
        .arg(gid_arg())
        .arg(verbose_arg())
        .arg(command_arg())
}

fn run_container_command() -> Command {
    Command::new("runc")
        .about("Internal command running the container stage")
        .hide(true)
        .arg(
            Arg::new("HOSTNAME")
                .long("hostname")
                .num_args(1)
                .action(ArgAction::Set)
                .default_value("sockspin")
                .help("Container hostname"),
        )
        .arg(
            Arg::new("UNIX_FD")
                .long("unix-fd")
                .num_args(1)
                .action(ArgAction::Set)
                .required(true)
                .value_parser(clap::value_parser!(i32))
                .help("Bootstrap socket file descriptor"),
        )
        .arg(
            Arg::new("PRIVILEGED")
                .long("privileged")
                .action(ArgAction::SetTrue)
                .help("Indicates the parent started with root privileges"),
        )
        .arg(uid_arg())
        .arg(gid_arg())
        .arg(command_arg())
}

fn verbose_arg() -> Arg {
    Arg::new("VERBOSE")
        .short('v')
        .long("verbose")
        .action(ArgAction::Count)
        .help("Log verbosity, stacks up to trace")
}

fn uid_arg() -> Arg {
    Arg::new("UID")
        .long("uid")
        .num_args(1)
        .action(ArgAction::Set)
        .value_parser(clap::value_parser!(u32))
        .default_value(current_uid())
        .help("uid of the container process")
}

fn gid_arg() -> Arg {
    Arg::new("GID")
        .long("gid")
        .num_args(1)
        .action(ArgAction::Set)
        .value_parser(clap::value_parser!(u32))
        .default_value(current_gid())
        .help("gid of the container process")
}

fn command_arg() -> Arg {
    Arg::new("COMMAND")
        .num_args(1..)
        .trailing_var_arg(true)
        .allow_hyphen_values(true)
        .value_name("command")
        .help("Command to run inside the container")
}

#[cfg(unix)]
fn current_uid() -> String {
    unsafe { libc::geteuid() }.to_string()
}

#[cfg(unix)]
fn current_gid() -> String {
    unsafe { libc::getegid() }.to_string()
}

#[cfg(not(unix))]
fn current_uid() -> String {
    "0".to_owned()
}

#[cfg(not(unix))]
fn current_gid() -> String {
    "0".to_owned()
}
