//! Per-connection lifecycle: authenticate, register, process commands, clean up.
//!
//! Reads go through a newline-delimited [`AnyDelimiterCodec`], so a protocol
//! line is independent of how the bytes arrive on the socket. Lines are decoded
//! lossily; bytes that are not UTF-8 become U+FFFD.
//!
//! Writes are queued on the connection's [`ConnectionHandle`] and drained by a
//! dedicated writer task that owns the socket's write half.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use futures::StreamExt;
use tokio::{
    io::AsyncWriteExt,
    net::{TcpStream, tcp::OwnedReadHalf, tcp::OwnedWriteHalf},
    sync::mpsc,
};
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead};
use tracing::{debug, info, warn};

use crate::{
    credentials::CredentialStore,
    dispatcher::{Dispatcher, Flow},
    registry::{ConnectionHandle, ConnectionId},
    server::ChatState,
};

/// Longest accepted input line in bytes, excluding the newline.
pub const MAX_LINE_LENGTH: usize = 1024;

pub const USERNAME_PROMPT: &str = "Enter username: ";
pub const PASSWORD_PROMPT: &str = "Enter password: ";
pub const WELCOME: &str = "Welcome to the chat server!";
pub const AUTH_FAILED: &str = "Authentication failed.";
pub const LINE_TOO_LONG: &str = "Line too long.";

type LineReader = FramedRead<OwnedReadHalf, AnyDelimiterCodec>;

/// Runs one client session to completion.
///
/// Returns once the session is closed and everything queued for the client
/// has been written out.
pub async fn run(stream: TcpStream, id: ConnectionId, state: &ChatState) -> Result<()> {
    let peer = stream.peer_addr().ok();
    let (reader, writer) = stream.into_split();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(write_outbound(writer, outbound_rx, peer));

    let handle = ConnectionHandle::new(id, outbound_tx);
    let codec =
        AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), b"\n".to_vec(), MAX_LINE_LENGTH);
    let mut lines = FramedRead::new(reader, codec);

    let result = drive(state, handle, &mut lines, peer).await;

    if let Err(error) = writer_task.await {
        warn!(?peer, ?error, "writer task failed");
    }
    result
}

async fn drive(
    state: &ChatState,
    handle: ConnectionHandle,
    lines: &mut LineReader,
    peer: Option<SocketAddr>,
) -> Result<()> {
    let Some(username) = authenticate(state.credentials(), &handle, lines).await else {
        info!(?peer, "authentication failed");
        handle.send_line(AUTH_FAILED);
        return Ok(());
    };

    let join_notice = format!("{username} has joined the chat");
    let admitted = state
        .connections()
        .register(handle.clone(), &username, &join_notice, |online| {
            handle.send_line(WELCOME);
            if !online.is_empty() {
                handle.send_line(&format!("Currently online users: {}", online.join(", ")));
            }
        });
    if let Err(error) = admitted {
        info!(?peer, %username, %error, "login rejected");
        handle.send_line(AUTH_FAILED);
        return Ok(());
    }

    info!(?peer, %username, "user authenticated");
    let registration = Registration::new(state, handle.id(), username);
    run_commands(state, &handle, &registration.username, lines).await
}

/// Prompts for credentials and checks them. `None` means the client failed
/// authentication, including hanging up or a failed read mid-way.
async fn authenticate(
    credentials: &CredentialStore,
    handle: &ConnectionHandle,
    lines: &mut LineReader,
) -> Option<String> {
    handle.send(USERNAME_PROMPT);
    let username = next_auth_line(lines).await?;

    handle.send(PASSWORD_PROMPT);
    let password = next_auth_line(lines).await?;

    if credentials.verify(&username, &password) {
        Some(username)
    } else {
        debug!(%username, "credentials did not match");
        None
    }
}

async fn next_auth_line(lines: &mut LineReader) -> Option<String> {
    match next_line(lines).await? {
        Ok(line) => Some(line),
        Err(AnyDelimiterCodecError::MaxChunkLengthExceeded) => {
            debug!("oversized line during login");
            None
        }
        Err(AnyDelimiterCodecError::Io(error)) => {
            debug!(?error, "failed to read credentials from client");
            None
        }
    }
}

/// Next newline-terminated line with any trailing `\r` removed.
async fn next_line(lines: &mut LineReader) -> Option<Result<String, AnyDelimiterCodecError>> {
    let chunk = lines.next().await?;
    Some(chunk.map(|bytes| decode_line(&bytes)))
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

async fn run_commands(
    state: &ChatState,
    handle: &ConnectionHandle,
    username: &str,
    lines: &mut LineReader,
) -> Result<()> {
    let dispatcher = Dispatcher::new(state.connections(), state.groups());

    while let Some(line) = next_line(lines).await {
        let line = match line {
            Ok(line) => line,
            Err(AnyDelimiterCodecError::MaxChunkLengthExceeded) => {
                warn!(%username, "closing session after oversized line");
                handle.send_line(LINE_TOO_LONG);
                return Ok(());
            }
            Err(AnyDelimiterCodecError::Io(error)) => {
                return Err(error).context("failed to read from client");
            }
        };

        if line.is_empty() {
            continue;
        }

        if dispatcher.dispatch(handle, username, &line) == Flow::Exit {
            debug!(%username, "client requested exit");
            break;
        }
    }

    Ok(())
}

/// Keeps a session's registry entry alive and tears it down exactly once,
/// whichever way the session ends (exit, hang-up, read error, abort).
struct Registration<'a> {
    state: &'a ChatState,
    id: ConnectionId,
    username: String,
    released: bool,
}

impl<'a> Registration<'a> {
    fn new(state: &'a ChatState, id: ConnectionId, username: String) -> Self {
        Self {
            state,
            id,
            username,
            released: false,
        }
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let groups = self.state.groups().remove_member(self.id);
        if !groups.is_empty() {
            debug!(username = %self.username, ?groups, "removed from groups");
        }

        if let Some(username) = self.state.connections().remove(self.id) {
            info!(%username, "user left");
            self.state
                .connections()
                .broadcast_except(self.id, &format!("{username} has left the chat"));
        }
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

async fn write_outbound(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<String>,
    peer: Option<SocketAddr>,
) {
    while let Some(text) = outbound.recv().await {
        if let Err(error) = writer.write_all(text.as_bytes()).await {
            debug!(?peer, ?error, "failed to deliver message to client");
            return;
        }
    }

    if let Err(error) = writer.shutdown().await {
        debug!(?peer, ?error, "failed to shut down client writer");
    }
}
