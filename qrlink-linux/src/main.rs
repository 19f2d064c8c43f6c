// QrLink for Linux: send or receive messages over a printed frame stream with a LAN ack back-channel.

mod config;
mod discovery;
mod forward;
mod transport;

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use qrlink_core::{ForwardChannel, Role, SessionController, SessionResult};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use crate::forward::HexLineChannel;
use crate::transport::LanTransport;

/// How often the sender re-shows the current frame.
const REFRESH: Duration = Duration::from_millis(500);

/// Transfer short messages one frame at a time, acknowledged over the LAN.
#[derive(Parser, Debug)]
#[command(name = "qrlink", version, about)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long, env = "QRLINK_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Discovery UDP port (overrides config)
    #[arg(long, value_name = "PORT")]
    discovery_port: Option<u16>,

    /// Back-channel TCP port (overrides config)
    #[arg(long, value_name = "PORT")]
    transport_port: Option<u16>,

    /// Log level used when RUST_LOG is unset
    #[arg(short = 'l', long, env = "QRLINK_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show frames on stdout and wait for acks
    Send {
        /// Messages to send, in order
        messages: Vec<String>,
        /// Read messages from a file, one per line (appended after MESSAGES)
        #[arg(short, long, value_name = "PATH")]
        file: Option<PathBuf>,
    },
    /// Read frames from stdin, ack them and print the messages
    Receive,
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let mut cfg = config::load(cli.config.as_deref())?;
    if let Some(p) = cli.discovery_port {
        cfg.discovery_port = p;
    }
    if let Some(p) = cli.transport_port {
        cfg.transport_port = p;
    }

    let rt = tokio::runtime::Runtime::new()?;
    let result = match cli.command {
        Command::Send { messages, file } => {
            let messages = collect_messages(messages, file.as_deref())?;
            rt.block_on(run_send(&cfg, messages))?
        }
        Command::Receive => rt.block_on(run_receive(&cfg))?,
    };

    Ok(match result {
        SessionResult::Success(_) => ExitCode::SUCCESS,
        SessionResult::Error(e) => {
            error!(error = %e, "transfer failed");
            ExitCode::FAILURE
        }
        SessionResult::Pending => ExitCode::FAILURE,
    })
}

fn init_tracing(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("qrlink_core={level},qrlink={level}"))
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

/// `None` when the user gave neither messages nor a file.
fn collect_messages(
    mut messages: Vec<String>,
    file: Option<&std::path::Path>,
) -> anyhow::Result<Option<Vec<String>>> {
    let Some(path) = file else {
        return Ok((!messages.is_empty()).then_some(messages));
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading messages from {}", path.display()))?;
    messages.extend(text.lines().map(str::to_string));
    Ok(Some(messages))
}

async fn run_send(
    cfg: &config::Config,
    messages: Option<Vec<String>>,
) -> anyhow::Result<SessionResult> {
    let transport = LanTransport::bind(cfg.lan_config(), Role::Sender)
        .await
        .context("binding the back-channel listener")?;
    let port = transport.listen_port();
    let session = SessionController::start(
        Arc::new(transport),
        Role::Sender,
        messages,
        cfg.session_config(),
    );
    info!(session = %session.session_id(), port, "sending");

    let channel = HexLineChannel;
    let mut display = session.display_updates();
    let mut refresh = tokio::time::interval(REFRESH);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        let shown = tokio::select! {
            changed = display.changed() => {
                if changed.is_err() {
                    break;
                }
                show(&mut std::io::stdout().lock(), &channel, &session)
            }
            _ = refresh.tick() => show(&mut std::io::stdout().lock(), &channel, &session),
            r = session.wait() => return Ok(r),
            _ = &mut shutdown => {
                info!("interrupted");
                session.stop();
                break;
            }
        };
        if let Err(e) = shown {
            warn!(error = %e, "frame output closed");
            session.stop();
            break;
        }
    }
    Ok(session.wait().await)
}

/// Print the current frame, if any, as one line.
fn show(
    out: &mut impl Write,
    channel: &HexLineChannel,
    session: &SessionController,
) -> std::io::Result<()> {
    let Some(d) = session.current_display_frame() else {
        return Ok(());
    };
    let line = match channel.encode(&d.frame) {
        Ok(line) => line,
        Err(never) => match never {},
    };
    writeln!(out, "{line}")?;
    out.flush()
}

async fn run_receive(cfg: &config::Config) -> anyhow::Result<SessionResult> {
    let transport = LanTransport::bind(cfg.lan_config(), Role::Receiver).await?;
    let session = SessionController::start(
        Arc::new(transport),
        Role::Receiver,
        None,
        cfg.session_config(),
    );
    info!(session = %session.session_id(), "receiving");

    let input = session.frame_input();
    let scanner = tokio::spawn(async move {
        let channel = HexLineChannel;
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(text) = channel.decode(&line) {
                if !input.submit(text) {
                    break;
                }
            }
        }
    });

    let result = tokio::select! {
        r = session.wait() => r,
        _ = shutdown_signal() => {
            info!("interrupted");
            session.stop();
            session.wait().await
        }
    };
    scanner.abort();
    if let SessionResult::Success(messages) = &result {
        for m in messages {
            println!("{m}");
        }
    }
    Ok(result)
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qrlink_core::transport::memory::MemoryTransport;

    struct ClosedPipe;

    impl Write for ClosedPipe {
        fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
            Err(std::io::ErrorKind::BrokenPipe.into())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Err(std::io::ErrorKind::BrokenPipe.into())
        }
    }

    #[tokio::test]
    async fn show_reports_a_closed_output() {
        let (a, _b) = MemoryTransport::linked();
        let session = SessionController::start(
            Arc::new(a),
            Role::Sender,
            Some(vec!["hello".into()]),
            qrlink_core::SessionConfig::default(),
        );
        let mut screen = session.display_updates();
        let frame = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(d) = session.current_display_frame() {
                    return d;
                }
                screen.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        let err = show(&mut ClosedPipe, &HexLineChannel, &session).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);

        let mut out = Vec::new();
        show(&mut out, &HexLineChannel, &session).unwrap();
        let line = String::from_utf8(out).unwrap();
        assert_eq!(line.trim_end(), HexLineChannel.encode(&frame.frame).unwrap());
    }

    #[test]
    fn cli_parses_send_and_receive() {
        let cli = Cli::try_parse_from(["qrlink", "--transport-port", "9000", "send", "a", "b"])
            .unwrap();
        assert_eq!(cli.transport_port, Some(9000));
        match cli.command {
            Command::Send { messages, file } => {
                assert_eq!(messages, ["a", "b"]);
                assert!(file.is_none());
            }
            Command::Receive => panic!("expected send"),
        }
        let cli = Cli::try_parse_from(["qrlink", "receive"]).unwrap();
        assert!(matches!(cli.command, Command::Receive));
    }

    #[test]
    fn no_messages_means_no_list() {
        assert_eq!(collect_messages(vec![], None).unwrap(), None);
        assert_eq!(
            collect_messages(vec!["x".into()], None).unwrap(),
            Some(vec!["x".to_string()])
        );
    }

    #[test]
    fn file_lines_follow_arguments() {
        let path = std::env::temp_dir().join(format!("qrlink-msgs-{}", std::process::id()));
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "second\nthird").unwrap();
        let got = collect_messages(vec!["first".into()], Some(path.as_path())).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(
            got,
            Some(vec!["first".into(), "second".into(), "third".into()])
        );
    }
}
