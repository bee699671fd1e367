//! Stop triggers.
//!
//! Every trigger is just a future that completes when the relay should stop;
//! [`stop_signal`] races the enabled ones and returns on the first.

use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{info, warn};

/// Which stop triggers are armed besides SIGINT / SIGTERM.
#[derive(Debug, Clone, Copy, Default)]
pub struct StopTriggers {
    /// Stop after this long.
    pub duration: Option<Duration>,
    /// Stop on `quit` / `exit` typed on stdin, or stdin EOF.
    pub console: bool,
}

/// Wait until any armed trigger fires.
pub async fn stop_signal(triggers: StopTriggers) {
    let timer = async {
        match triggers.duration {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };
    let console = async {
        if triggers.console {
            info!("type 'quit' to stop");
            console_quit(BufReader::new(tokio::io::stdin())).await;
        } else {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = os_signal() => info!("received shutdown signal"),
        _ = timer => info!("run duration elapsed"),
        _ = console => info!("console stop command"),
    }
}

/// Resolve on a `quit` / `exit` line (any case) or end of input.
async fn console_quit<R>(reader: R)
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let cmd = line.trim();
                if cmd.eq_ignore_ascii_case("quit") || cmd.eq_ignore_ascii_case("exit") {
                    return;
                }
                if !cmd.is_empty() {
                    warn!(command = %cmd, "unknown console command");
                }
            }
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "console read failed");
                return;
            }
        }
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn os_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler, only Ctrl+C stops the relay");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
