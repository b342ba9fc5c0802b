use anyhow::{Context, Result};
use tokio::{
    io::{
        self, AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt,
        BufReader,
    },
    net::TcpStream,
    select,
};
use tracing::{info, warn};

use crate::cli::ClientArgs;

const READ_BUFFER_SIZE: usize = 1024;
const EXIT_COMMAND: &str = "/exit";

pub async fn run(args: ClientArgs) -> Result<()> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;
    info!("connected to {}", args.server);

    let (mut reader, mut writer) = stream.into_split();
    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();

    run_client_loop(&mut reader, &mut writer, &mut stdin, &mut stdout).await?;
    shutdown_connection(&mut writer).await;

    Ok(())
}

/// Relays server output to `output` verbatim and input lines to the server
/// until either side closes or the user types `/exit`.
pub async fn run_client_loop<R, W, I, O>(
    server_reader: &mut R,
    server_writer: &mut W,
    input: &mut I,
    output: &mut O,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    I: AsyncBufRead + Unpin,
    O: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    let mut line = String::new();

    loop {
        line.clear();
        select! {
            bytes_read = server_reader.read(&mut buffer) => {
                if !handle_server_output(bytes_read, &buffer, output).await? {
                    break;
                }
            }
            bytes_read = input.read_line(&mut line) => {
                if !handle_input_line(bytes_read, &line, server_writer).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_server_output<O>(
    bytes_read: io::Result<usize>,
    buffer: &[u8],
    output: &mut O,
) -> Result<bool>
where
    O: AsyncWrite + Unpin,
{
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        output.write_all(b"Disconnected from server.\n").await?;
        output.flush().await?;
        return Ok(false);
    }

    output.write_all(&buffer[..bytes_read]).await?;
    output.flush().await?;
    Ok(true)
}

async fn handle_input_line<W>(
    bytes_read: io::Result<usize>,
    line: &str,
    server_writer: &mut W,
) -> Result<bool>
where
    W: AsyncWrite + Unpin,
{
    if bytes_read? == 0 {
        return Ok(false);
    }

    let text = line.trim_end_matches(['\r', '\n']);
    if text.is_empty() {
        return Ok(true);
    }

    server_writer.write_all(text.as_bytes()).await?;
    server_writer.write_all(b"\n").await?;
    server_writer.flush().await?;

    Ok(text != EXIT_COMMAND)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection<W>(writer: &mut W)
where
    W: AsyncWrite + Unpin,
{
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}
