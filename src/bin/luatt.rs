//! `luatt` — host-side bridge and multiplexer for the Lua microcontroller
//! runtime. Wires the CLI to the router/issuer/attach/bus/loader
//! components and drives the REPL or idle-sleep main loop.

use std::io::IsTerminal;
use std::process::ExitCode;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::io::AsyncBufReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use luatt::config::{self, Action, Cli};
use luatt::error::{LuattError, Result};
use luatt::frame::Frame;
use luatt::router::Router;
use luatt::transport::Transport;
use luatt::{attach, bus, issuer, loader};

#[tokio::main]
async fn main() -> ExitCode {
    let cli: Cli = argh::from_env();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::from(e.exit_code())
        }
    }
}

/// Mirrors `original_source/luatt.py`'s `configure_logger`: a per-process
/// log file plus a stable `luatt.log` symlink to the primary process's
/// file, and a terminal layer at `WARN` and above (the original's REPL
/// log handler level). `tracing-appender` has no size-triggered roller
/// like Python's `RotatingFileHandler`, so this uses a single
/// never-rotated file rather than the original's 3x1MB rotation.
///
/// The log file and symlink are only created when attached directly to
/// the serial device (`is_serial`), matching
/// `original_source/luatt.py:804-806`'s `if not Conn['is_socket']:
/// create_log_symlink()` — a downstream socket client shares another
/// process's device and shouldn't spray its own log file into `/tmp`.
fn init_logging(is_serial: bool) -> tracing_appender::non_blocking::WorkerGuard {
    let pid = std::process::id();
    let log_name = format!("luatt.{pid}.log");
    let file_appender = tracing_appender::rolling::never("/tmp", &log_name);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    if is_serial {
        let symlink_path = std::path::Path::new("/tmp/luatt.log");
        let _ = std::fs::remove_file(symlink_path);
        let _ = std::os::unix::fs::symlink(&log_name, symlink_path);
    }

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false);
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(tracing_subscriber::filter::LevelFilter::WARN);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(file_layer)
        .with(stderr_layer)
        .init();

    guard
}

async fn run(cli: Cli) -> Result<()> {
    let cancel = CancellationToken::new();
    let (transport, is_serial) = Transport::open(&cli.device).await?;
    let _log_guard = init_logging(is_serial);

    let (router, mut default_output) = Router::new(transport, cancel.clone());
    let router_task = {
        let router = router.clone();
        tokio::spawn(async move { router.run().await })
    };
    tokio::spawn(async move {
        while let Some(frame) = default_output.recv().await {
            print_unsolicited_frame(&frame);
        }
    });

    let mut attach_task = None;

    if is_serial {
        issuer::wait_for_version(&router).await?;
        set_device_clock(&router).await;

        let (sock_path, link_path) = attach::socket_paths(&cli.device);
        attach_task = Some({
            let router = router.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { attach::serve(&sock_path, &link_path, router, cancel).await })
        });
    } else {
        let ppid = nix::unistd::getppid().as_raw();
        issuer::fire_and_forget(
            &router,
            "reconnect",
            &[Bytes::from(ppid.to_string().into_bytes())],
        )
        .await?;
    }

    for action in config::parse_actions(&cli.rest) {
        match action {
            Action::Mqtt { host, port } => {
                if !is_serial {
                    return Err(LuattError::BadOptions(
                        "cannot proxy MQTT from a downstream luatt process".into(),
                    ));
                }
                bus::spawn(router.clone(), &host, port, cancel.clone()).await;
            }
            Action::Reset => {
                issuer::request(&router, "reset", &[], |f| print_reply_body(f)).await?;
            }
            Action::Eval(expr) => {
                issuer::request(
                    &router,
                    "eval",
                    &[Bytes::from(expr.into_bytes())],
                    |f| print_reply_body(f),
                )
                .await?;
            }
            Action::Load(path) => {
                if let Err(e) = loader::load(&router, &path, false).await {
                    warn!("load {path}: {e}");
                }
            }
        }
    }

    notify_ready();

    if std::io::stdout().is_terminal() {
        repl_loop(&router, &cancel).await;
    } else {
        cancel.cancelled().await;
    }

    cancel.cancel();
    if let Some(task) = attach_task {
        let _ = task.await;
    }
    let _ = router_task.await;
    Ok(())
}

/// Send the device the current wall-clock time right after the version
/// handshake, matching the original's unconditional
/// `Luatt.time.set_unix(...)` eval sent before any CLI actions run.
async fn set_device_clock(router: &Router) {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let expr = format!(
        "Luatt.time.set_unix({},{})",
        now.as_secs(),
        now.subsec_millis()
    );
    if let Err(e) = issuer::fire_and_forget(router, "eval", &[Bytes::from(expr.into_bytes())]).await
    {
        warn!("setting device clock failed: {e}");
    }
}

fn notify_ready() {
    if std::env::var_os("NOTIFY_SOCKET").is_some() {
        if let Err(e) = sd_notify::notify(false, &[sd_notify::NotifyState::Ready]) {
            warn!("sd_notify readiness ping failed: {e}");
        }
    }
}

fn frame_body(frame: &Frame) -> String {
    frame.fields[1..]
        .iter()
        .map(|f| String::from_utf8_lossy(f).into_owned())
        .collect::<Vec<_>>()
        .join("|")
}

/// Print a reply frame's body while blocked on a `request()` call.
fn print_reply_body(frame: &Frame) {
    println!("{}", frame_body(frame));
}

/// Print a frame that arrived on an unrecognized token (the default
/// output queue), clearing the current terminal line first when stdout
/// is a tty so it doesn't interleave with whatever's mid-typed at the
/// `lua>` prompt.
fn print_unsolicited_frame(frame: &Frame) {
    let body = frame_body(frame);
    if std::io::stdout().is_terminal() {
        print!("\x1b[2K\r{body}\n");
        let _ = std::io::Write::flush(&mut std::io::stdout());
    } else {
        println!("{body}");
    }
}

/// Interactive prompt loop with REPL meta-commands. Reads lines from
/// stdin until EOF, an interrupt, cancellation, or `!exit`/`!quit`.
async fn repl_loop(router: &Router, cancel: &CancellationToken) {
    let mut reader = tokio::io::BufReader::new(tokio::io::stdin());

    loop {
        print!("lua> ");
        let _ = std::io::Write::flush(&mut std::io::stdout());

        let mut line = String::new();
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::signal::ctrl_c() => break,
            n = reader.read_line(&mut line) => n,
        };

        match read {
            Ok(0) => break, // EOF (ctrl-D)
            Ok(_) => {
                let line = line.trim_end_matches('\n').trim_end_matches('\r');
                if line.is_empty() {
                    continue;
                }
                if !handle_repl_line(router, line).await {
                    break;
                }
            }
            Err(e) => {
                warn!("stdin read error: {e}");
                break;
            }
        }
    }
}

/// Handle one REPL line. Returns `false` if the session should end.
async fn handle_repl_line(router: &Router, line: &str) -> bool {
    if !line.starts_with('!') {
        if let Err(e) = issuer::request(
            router,
            "eval",
            &[Bytes::from(line.as_bytes().to_vec())],
            |f| print_reply_body(f),
        )
        .await
        {
            warn!("eval failed: {e}");
        }
        return true;
    }

    let Some(args) = shlex::split(line) else {
        warn!("bad command: {line:?}");
        return true;
    };

    match args.first().map(String::as_str) {
        Some("!reset") => {
            if let Err(e) = issuer::request(router, "reset", &[], |f| print_reply_body(f)).await {
                warn!("reset failed: {e}");
            }
            true
        }
        Some(verb @ "!load") | Some(verb @ "!compile") => {
            let compile = verb == "!compile";
            for path in &args[1..] {
                if let Err(e) = loader::load(router, path, compile).await {
                    warn!("load {path}: {e}");
                }
            }
            true
        }
        Some("!exit") | Some("!quit") => false,
        // The original never gave !reload defined semantics; left as a
        // no-op here rather than guessing at a behavior.
        Some("!reload") => true,
        _ => {
            warn!("bad command: {line:?}");
            true
        }
    }
}
