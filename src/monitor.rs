//! Shutdown signal monitor

use std::io;

use log::info;

#[cfg(unix)]
/// Resolves when `SIGTERM` or `SIGINT` arrives
pub async fn create_signal_monitor() -> io::Result<()> {
    use futures::future::{self, Either, FutureExt};
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let signal_name = match future::select(sigterm.recv().boxed(), sigint.recv().boxed()).await {
        Either::Left(..) => "SIGTERM",
        Either::Right(..) => "SIGINT",
    };

    info!("received {}, exiting", signal_name);
    Ok(())
}

#[cfg(not(unix))]
/// Resolves on ctrl-c
pub async fn create_signal_monitor() -> io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("received ctrl-c, exiting");
    Ok(())
}
