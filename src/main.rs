//! `bmi-echo`: a minimal client/server exercising the message-passing
//! shim directly, demonstrating an echo scenario end to end over a real
//! transport method.
//!
//! The client posts an unexpected send carrying its message to the
//! server's address, then posts a recv for the echoed reply. The server
//! polls `testunexpected` for inbound requests and echoes each payload
//! back to its sender via a plain `post_send`. Logging setup is a
//! layered stdout/file subscriber, trimmed to drop any results-streaming
//! machinery this crate has no use for.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{filter::LevelFilter, prelude::*, Layer};

use bmi_core::cli::{Args, Role};
use bmi_core::mp::Mp;
use bmi_core::transport::tcp::TcpTransportMethod;

mod logging;
use logging::ColorizedFormatter;

const ECHO_CLASS: u8 = 0;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging(&args);

    match args.role {
        Role::Server => run_server(&args).await,
        Role::Client => run_client(&args).await,
    }
}

fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = match args.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let (detailed_log_layer, guard) = match args.log_file.as_deref() {
        Some(path) => {
            let log_path = std::path::Path::new(path);
            let log_dir = log_path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let log_filename = log_path
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new("bmi-echo.log"));
            let file_appender = tracing_appender::rolling::daily(log_dir, log_filename);
            let (non_blocking_writer, file_guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking_writer)
                .with_ansi(false)
                .with_filter(log_level)
                .boxed();
            (layer, Some(file_guard))
        }
        None => {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(log_level)
                .boxed();
            (layer, None)
        }
    };

    let stdout_log = if !args.quiet {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .event_format(ColorizedFormatter)
                .with_filter(log_level),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(detailed_log_layer)
        .with(stdout_log)
        .init();

    guard
}

/// Split a `scheme://host:port` address into the `host:port` pair a raw
/// socket bind wants.
fn host_port(address: &str) -> Result<String> {
    let parsed = bmi_core::addr::ParsedAddr::parse(address)
        .map_err(|e| anyhow::anyhow!("invalid address '{address}': {e}"))?;
    Ok(format!("{}:{}", parsed.host, parsed.port))
}

async fn run_server(args: &Args) -> Result<()> {
    let mp = Arc::new(Mp::new_client());

    if args.scheme == "tcp" {
        // The TM contract has no "bind and listen" operation — every TM
        // here is fundamentally a dialer. A TCP server additionally needs
        // its listener bound before any peer can reach it, so the
        // concrete `TcpTransportMethod` is built and started directly,
        // then installed as the shim's active "tcp" method.
        let tcp = Arc::new(TcpTransportMethod::new());
        let listen_addr = host_port(&args.address)?;
        tcp.start_server(&listen_addr)
            .await
            .context("failed to bind tcp listener")?;
        mp.install_method(tcp);
    } else {
        // gm/mx run loopback/simulated; "server" and "client" share the
        // same address space, so no separate bind step is needed.
        mp.addr_lookup(&args.address).await.ok();
    }

    let ctx = mp.open_context().context("failed to open MP context")?;
    info!(address = %args.address, scheme = %args.scheme, "bmi-echo server listening");

    let mut handled = 0u32;
    while handled < args.count {
        let unexpected = mp.testunexpected(1, 200, Some(ECHO_CLASS)).await?;
        if unexpected.is_empty() {
            continue;
        }
        for completion in unexpected {
            let Some(msg) = completion.unexpected else { continue };
            let text = String::from_utf8_lossy(&msg.buffer);
            info!(bytes = msg.buffer.len(), %text, "received request, echoing back");

            let send_op = mp
                .post_send(msg.sender, msg.tag, msg.buffer, ctx, handled as u64)
                .await?;
            wait_for_completion(&mp, send_op, ctx).await?;
            handled += 1;
        }
    }

    info!(handled, "bmi-echo server done");
    Ok(())
}

async fn run_client(args: &Args) -> Result<()> {
    let mp = Arc::new(Mp::new_client());
    let ctx = mp.open_context().context("failed to open MP context")?;
    let server = mp.addr_lookup(&args.address).await.context("addr_lookup failed")?;

    for i in 0..args.count {
        let recv_op = mp
            .post_recv(server, args.tag, args.message.len().max(4096), ctx, i as u64)
            .await?;

        let send_op = mp
            .post_send_unexpected(
                server,
                args.tag,
                ECHO_CLASS,
                args.message.clone().into_bytes(),
                ctx,
                i as u64,
            )
            .await?;
        wait_for_completion(&mp, send_op, ctx).await?;

        let completion = wait_for_completion(&mp, recv_op, ctx).await?;
        info!(
            round = i,
            actual_size = completion.actual_size,
            "echo round trip completed"
        );
    }

    mp.dec_addr_ref(server).await?;
    Ok(())
}

async fn wait_for_completion(mp: &Mp, op_id: u64, context_id: u64) -> Result<bmi_core::mp::Completion> {
    loop {
        if let Some(completion) = mp.test(op_id, context_id, 200).await? {
            if let Some(kind) = completion.error {
                anyhow::bail!("operation {op_id} failed: {kind:?}");
            }
            return Ok(completion);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
