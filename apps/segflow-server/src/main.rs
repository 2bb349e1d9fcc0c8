#![forbid(unsafe_code)]

use std::net::SocketAddr;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use segflow_network::{DEFAULT_CHUNK_BYTES, MAX_REQUEST_LEN, REQUEST_DELIMITER, ServeSession};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpListener,
};
use tracing::{debug, info, warn};

#[derive(Debug, Parser, Clone)]
#[command(
    name = "segflow-server",
    version,
    about = "Serves zero-filled segments of the requested size"
)]
struct Args {
    #[arg(long, default_value = "0.0.0.0:8080", help = "TCP address to listen on")]
    listen: SocketAddr,

    #[arg(long, help = "Per-connection rate limit in kbit/s (unlimited when unset)")]
    max_kbps: Option<u64>,

    #[arg(long, default_value_t = DEFAULT_CHUNK_BYTES, help = "Largest write per response chunk")]
    chunk_bytes: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("bind segment server failed: {}", args.listen))?;
    info!("segment server listening on {}", args.listen);

    serve(listener, args.chunk_bytes, args.max_kbps).await
}

async fn serve(listener: TcpListener, chunk_bytes: usize, max_kbps: Option<u64>) -> Result<()> {
    let zeros = Bytes::from(vec![0_u8; chunk_bytes.max(1)]);
    loop {
        let (stream, peer) = listener
            .accept()
            .await
            .context("accept segment connection failed")?;
        let zeros = zeros.clone();
        tokio::spawn(async move {
            let session = ServeSession::new(chunk_bytes, max_kbps);
            match handle_connection(stream, session, zeros).await {
                Ok(session) => info!(
                    %peer,
                    requests = session.requests_served(),
                    bytes = session.bytes_served(),
                    "connection closed"
                ),
                Err(err) => warn!(%peer, "connection ended with error: {err:#}"),
            }
        });
    }
}

async fn handle_connection<S>(
    stream: S,
    mut session: ServeSession,
    zeros: Bytes,
) -> Result<ServeSession>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = BufReader::new(stream);
    let mut line = Vec::with_capacity(MAX_REQUEST_LEN);
    loop {
        line.clear();
        let read = (&mut stream)
            .take(MAX_REQUEST_LEN as u64)
            .read_until(REQUEST_DELIMITER, &mut line)
            .await
            .context("read segment request failed")?;
        if read == 0 {
            return Ok(session);
        }
        let requested = session
            .begin(&line)
            .context("malformed segment request")?;
        debug!(bytes = requested, "serving segment");

        while let Some(chunk) = session.next_chunk() {
            stream
                .get_mut()
                .write_all(&zeros[..chunk.len])
                .await
                .context("write segment chunk failed")?;
            if let Some(pace) = chunk.pace {
                tokio::time::sleep(pace).await;
            }
        }
        stream.get_mut().flush().await.context("flush segment failed")?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use segflow_network::encode_request;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn streams_requested_byte_counts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, 1_000, None));

        let mut client = TcpStream::connect(addr).await.unwrap();
        for size in [2_500_u64, 7] {
            client.write_all(&encode_request(size)).await.unwrap();
            let mut body = vec![1_u8; size as usize];
            client.read_exact(&mut body).await.unwrap();
            assert!(body.iter().all(|b| *b == 0));
        }
    }

    #[tokio::test]
    async fn malformed_request_closes_connection() {
        let (mut client, server) = tokio::io::duplex(4_096);
        let zeros = Bytes::from(vec![0; 16]);
        let task = tokio::spawn(handle_connection(server, ServeSession::default(), zeros));

        client.write_all(b"abc\n").await.unwrap();
        let err = task.await.unwrap().unwrap_err();
        assert!(format!("{err:#}").contains("malformed segment request"));

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn eof_ends_connection_cleanly() {
        let (mut client, server) = tokio::io::duplex(4_096);
        let zeros = Bytes::from(vec![0; 4]);
        let task = tokio::spawn(handle_connection(server, ServeSession::new(4, None), zeros));

        client.write_all(&encode_request(10)).await.unwrap();
        let mut body = [1_u8; 10];
        client.read_exact(&mut body).await.unwrap();
        drop(client);

        let session = task.await.unwrap().unwrap();
        assert_eq!(session.requests_served(), 1);
        assert_eq!(session.bytes_served(), 10);
    }
}
