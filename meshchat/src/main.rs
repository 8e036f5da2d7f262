//! `meshchat`: host a chat mesh or join one from the terminal.
//!
//! Lines typed at the prompt are sent as chat; lines starting with `/` are
//! commands (`/help` lists them). Configuration via CLI flags, environment
//! variables, or config file (`~/.config/meshchat/config.toml`).
//!
//! ```bash
//! # Host on the default port
//! cargo run --bin meshchat -- host
//!
//! # Join a host
//! cargo run --bin meshchat -- --listen 0.0.0.0:7071 --peer-id 192.168.1.21:7071 \
//!     -u dana join 192.168.1.20:7070
//! ```

use std::io;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;

use meshchat::config::{CliArgs, ClientConfig};
use meshchat::session::{self, SessionHandle, SessionNotice};
use meshchat::transfer::{SinkTarget, format_size};
use meshchat::transport::tcp::TcpConnector;
use meshchat_proto::message::{ChatMessage, ChatMode, FileMsgId, PeerId, Timestamp};

const HELP: &str = "\
commands:
  /name <name>         change your display name
  /file <path>         offer a file
  /files               list offered files
  /get <id> [path]     download a file
  /cancel <id>         cancel a download
  /peers               list peers
  /mode normal|coview  choose which log your chat goes to
  /view <source>       start a viewing session (host)
  /unview              end the viewing session (host)
  /quit                leave";

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!(role = ?config.role, listen = %config.listen, "meshchat starting");

    let connector = TcpConnector::new(
        config.listen,
        config.peer_id.clone().map(PeerId::new),
        config.connect_timeout,
    );
    let (handle, notices, task) = match session::spawn(&config, Arc::new(connector)) {
        Ok(parts) => parts,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    match &config.role {
        meshchat::config::Role::Host => println!("hosting on {} (type /help)", config.listen),
        meshchat::config::Role::Guest { host } => println!("joining {host} (type /help)"),
    }

    let result = console(&handle, notices).await;

    let _ = handle.shutdown().await;
    let _ = task.await;
    // Give link writers a moment to flush the goodbye.
    tokio::time::sleep(Duration::from_millis(200)).await;
    tracing::info!("meshchat exiting");

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initialize file-based logging.
///
/// Logs go to a file so they never interleave with the console. The
/// returned [`WorkerGuard`] must be held until shutdown.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("meshchat.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

async fn console(
    handle: &SessionHandle,
    mut notices: mpsc::UnboundedReceiver<SessionNotice>,
) -> io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if run_line(handle, line.trim()).await.is_break() {
                    break;
                }
            }
            Some(notice) = notices.recv() => print_notice(&notice),
        }
    }
    Ok(())
}

async fn run_line(handle: &SessionHandle, line: &str) -> ControlFlow<()> {
    if line.is_empty() {
        return ControlFlow::Continue(());
    }
    let Some(command) = line.strip_prefix('/') else {
        report(handle.send_chat(line).await);
        return ControlFlow::Continue(());
    };

    let (verb, rest) = command.split_once(' ').unwrap_or((command, ""));
    let rest = rest.trim();
    match verb {
        "quit" | "exit" => return ControlFlow::Break(()),
        "help" => println!("{HELP}"),
        "name" => report(handle.set_username(rest).await),
        "file" => report(handle.offer_file(rest).await),
        "files" => list_files(handle).await,
        "get" => {
            let (id, path) = rest.split_once(' ').unwrap_or((rest, ""));
            let path = path.trim();
            let target = (!path.is_empty()).then(|| SinkTarget::File(PathBuf::from(path)));
            report(handle.download(FileMsgId::new(id), target).await);
        }
        "cancel" => report(handle.cancel_download(FileMsgId::new(rest)).await),
        "peers" => list_peers(handle).await,
        "mode" => match rest {
            "normal" => report(handle.set_mode(ChatMode::Normal).await),
            "coview" | "co-viewing" => report(handle.set_mode(ChatMode::CoViewing).await),
            _ => println!("usage: /mode normal|coview"),
        },
        "view" => report(handle.start_viewing(rest).await),
        "unview" => report(handle.stop_viewing().await),
        _ => println!("unknown command /{verb}; try /help"),
    }
    ControlFlow::Continue(())
}

fn report(result: Result<(), session::SessionError>) {
    if let Err(e) = result {
        println!("! {e}");
    }
}

async fn list_peers(handle: &SessionHandle) {
    let Ok(snapshot) = handle.snapshot().await else {
        return;
    };
    for peer in &snapshot.peers {
        let me = if peer.peer_id == snapshot.local_id { " (you)" } else { "" };
        let retry = match (peer.reconnect_pending, peer.backoff) {
            (true, Some(delay)) => format!(", retrying within {}s", delay.as_secs()),
            _ => String::new(),
        };
        println!("  {}{me} [{}] {}{retry}", peer.name, peer.peer_id, peer.status);
    }
}

async fn list_files(handle: &SessionHandle) {
    let Ok(snapshot) = handle.snapshot().await else {
        return;
    };
    let mut any = false;
    for offer in snapshot.files() {
        any = true;
        let status = snapshot
            .file_status(&offer.file_msg_id)
            .map_or_else(|| "yours".to_string(), |s| s.to_string());
        println!(
            "  {} {} ({}) from {} [{status}]",
            offer.file_msg_id,
            offer.file_name,
            format_size(offer.file_size),
            offer.username
        );
    }
    if !any {
        println!("  no files offered");
    }
}

fn clock(ts: Timestamp) -> String {
    i64::try_from(ts.as_millis())
        .ok()
        .and_then(chrono::DateTime::from_timestamp_millis)
        .map(|t| t.with_timezone(&chrono::Local).format("%H:%M").to_string())
        .unwrap_or_else(|| "--:--".to_string())
}

fn print_chat(msg: &ChatMessage) {
    let tag = match msg.chat_mode {
        ChatMode::Normal => "",
        ChatMode::CoViewing => "(viewing) ",
    };
    println!("[{}] {tag}{}: {}", clock(msg.timestamp), msg.username, msg.text);
}

fn print_notice(notice: &SessionNotice) {
    match notice {
        SessionNotice::PeersChanged(peers) => {
            let line: Vec<String> = peers
                .iter()
                .map(|p| format!("{} ({})", p.name, p.status))
                .collect();
            println!("* peers: {}", line.join(", "));
        }
        SessionNotice::UsernameChanged(name) => println!("* you are now {name}"),
        SessionNotice::ChatReceived(msg) => print_chat(msg),
        SessionNotice::FileOffered(offer) => println!(
            "[{}] {} offered {} ({}), /get {}",
            clock(offer.timestamp),
            offer.username,
            offer.file_name,
            format_size(offer.file_size),
            offer.file_msg_id
        ),
        SessionNotice::HistoryMerged {
            normal_added,
            co_viewing_added,
        } => println!("* history: {normal_added} entries, {co_viewing_added} viewing messages"),
        SessionNotice::TransferProgress {
            file_msg_id,
            received,
            total,
        } => {
            let percent = if *total == 0 {
                100
            } else {
                received.saturating_mul(100) / total
            };
            println!("* {file_msg_id}: {percent}% ({})", format_size(*received));
        }
        SessionNotice::TransferFinished {
            file_msg_id,
            status,
        } => println!("* {file_msg_id}: {status}"),
        SessionNotice::UploadFinished {
            file_msg_id,
            peer,
            outcome,
        } => println!("* upload of {file_msg_id} to {peer}: {outcome:?}"),
        SessionNotice::ViewingChanged(Some(viewing)) => {
            println!("* viewing session started: {}", viewing.source);
        }
        SessionNotice::ViewingChanged(None) => println!("* viewing session ended"),
        SessionNotice::CoViewing { from, frame } => {
            tracing::debug!(peer = %from, kind = %frame.kind, "co-viewing frame");
        }
        SessionNotice::SessionEnded => println!("* session ended: host disconnected"),
        SessionNotice::CommandFailed(e) => println!("! {e}"),
    }
}
