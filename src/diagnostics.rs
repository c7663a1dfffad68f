// ABOUTME: The 14 four-letter diagnostic responders
// ABOUTME: Each is a straight-line synchronous-style handler that writes then closes

use crate::config::ServerConfig;
use crate::connection::ConnectionHandle;
use crate::contracts::RequestProcessor;
use crate::error::ConnectionError;
use crate::four_letter::FourLetterWord;
use crate::registry::ConnectionRegistry;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;

const NOT_SERVING: &str = "This instance is not currently serving requests";

/// Read exactly `n` bytes, preferring whatever the frame codec already
/// buffered in `read_buf` over a fresh socket read. A probe token and its
/// payload (e.g. `stmk`'s 8-byte mask) can arrive in the same read as the
/// token itself, and the codec only consumes the token's 4 bytes — the rest
/// is still sitting in `read_buf` when a probe is dispatched here.
async fn read_exact_buffered(
    read_half: &mut ReadHalf<TcpStream>,
    read_buf: &mut BytesMut,
    n: usize,
) -> std::io::Result<BytesMut> {
    while read_buf.len() < n {
        if 0 == read_half.read_buf(read_buf).await? {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "peer closed before sending the expected payload",
            ));
        }
    }
    Ok(read_buf.split_to(n))
}

/// Accumulates text and flushes at 2 KiB or on explicit flush. Each
/// responder is a straight-line handler: the connection's task does
/// nothing else while it runs, so there is no interleaving to worry
/// about.
struct ChunkedWriter<'a, W> {
    sink: &'a mut W,
    buf: BytesMut,
}

const FLUSH_THRESHOLD: usize = 2 * 1024;

impl<'a, W: AsyncWrite + Unpin> ChunkedWriter<'a, W> {
    fn new(sink: &'a mut W) -> Self {
        ChunkedWriter {
            sink,
            buf: BytesMut::with_capacity(FLUSH_THRESHOLD),
        }
    }

    async fn write(&mut self, s: &str) -> std::io::Result<()> {
        self.buf.extend_from_slice(s.as_bytes());
        if self.buf.len() >= FLUSH_THRESHOLD {
            self.flush().await?;
        }
        Ok(())
    }

    async fn line(&mut self, s: &str) -> std::io::Result<()> {
        self.write(s).await?;
        self.write("\n").await
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        if !self.buf.is_empty() {
            self.sink.write_all(&self.buf).await?;
            self.buf.clear();
        }
        self.sink.flush().await
    }
}

/// Dispatch a recognised probe. This is the only pending operation on the
/// connection's task at this point — there is no concurrent `read_frame`
/// racing the write. Always ends with the connection closing.
#[allow(clippy::too_many_arguments)]
pub async fn respond<P>(
    word: FourLetterWord,
    read_half: &mut ReadHalf<TcpStream>,
    read_buf: &mut BytesMut,
    write_half: &mut WriteHalf<TcpStream>,
    self_handle: &ConnectionHandle,
    processor: &P,
    registry: &ConnectionRegistry,
    config: &ServerConfig,
) -> Result<(), ConnectionError>
where
    P: RequestProcessor,
{
    let mut out = ChunkedWriter::new(write_half);

    match word {
        FourLetterWord::Ruok => {
            out.write("imok").await?;
        }
        FourLetterWord::Envi => {
            write_environment(&mut out, config).await?;
        }
        FourLetterWord::Gtmk => {
            out.write(&registry.trace_mask().to_string()).await?;
        }
        FourLetterWord::Stmk => {
            let raw = read_exact_buffered(read_half, read_buf, 8).await?;
            let mask = i64::from_be_bytes(raw.as_ref().try_into().unwrap());
            registry.set_trace_mask(mask);
            out.write(&mask.to_string()).await?;
        }
        FourLetterWord::Crst => {
            self_handle.reset_stats();
            out.write("Connection stats reset.\n").await?;
        }
        _ if !processor.is_serving() => {
            out.write(NOT_SERVING).await?;
        }
        FourLetterWord::Conf => {
            out.write(&processor.dump_conf()).await?;
        }
        FourLetterWord::Srvr => {
            write_server_report(&mut out, processor).await?;
        }
        FourLetterWord::Stat => {
            write_server_report(&mut out, processor).await?;
            out.line("Connections:").await?;
            write_connection_list(&mut out, registry, false).await?;
        }
        FourLetterWord::Cons => {
            write_connection_list(&mut out, registry, true).await?;
        }
        FourLetterWord::Dump => {
            out.write(&processor.dump_session_tracker()).await?;
            out.write(&processor.dump_ephemerals()).await?;
        }
        FourLetterWord::Wchs => {
            out.write(&processor.dump_watch_summary()).await?;
        }
        FourLetterWord::Wchc => {
            out.write(&processor.dump_watches_by_session()).await?;
        }
        FourLetterWord::Wchp => {
            out.write(&processor.dump_watches_by_path()).await?;
        }
        FourLetterWord::Srst => {
            processor.reset_server_stats();
            out.write("Server stats reset.\n").await?;
        }
        // Ruok, Envi, Gtmk, Stmk, Crst are handled above, before the
        // is_serving gate; unreachable here.
        FourLetterWord::Ruok | FourLetterWord::Envi | FourLetterWord::Gtmk
        | FourLetterWord::Stmk | FourLetterWord::Crst => unreachable!(),
    }

    out.flush().await?;
    Ok(())
}

async fn write_environment<W: AsyncWrite + Unpin>(
    out: &mut ChunkedWriter<'_, W>,
    config: &ServerConfig,
) -> std::io::Result<()> {
    out.line("Environment:").await?;
    out.line(&format!("server.version={}", env!("CARGO_PKG_VERSION"))).await?;
    out.line(&format!("server.bind_addr={}", config.bind_addr)).await?;
    out.line(&format!("server.max_client_cnxns={}", config.max_client_cnxns)).await?;
    for (key, value) in std::env::vars() {
        out.line(&format!("env.{key}={value}")).await?;
    }
    Ok(())
}

async fn write_server_report<W: AsyncWrite + Unpin, P: RequestProcessor>(
    out: &mut ChunkedWriter<'_, W>,
    processor: &P,
) -> std::io::Result<()> {
    let stats = processor.server_stats();
    out.line(&format!("{}", stats.version)).await?;
    out.line(&format!("Uptime: {:?}", stats.uptime())).await?;
    out.line(&format!("Packets sent: {}", stats.packets_sent)).await?;
    out.line(&format!("Packets received: {}", stats.packets_received)).await?;
    out.line(&format!("Node count: {}", processor.node_count())).await?;
    Ok(())
}

async fn write_connection_list<W: AsyncWrite + Unpin>(
    out: &mut ChunkedWriter<'_, W>,
    registry: &ConnectionRegistry,
    detailed: bool,
) -> std::io::Result<()> {
    for handle in registry.snapshot() {
        let stats = handle.stats_snapshot();
        if detailed {
            out.line(&format!(
                "{} sid:0x{:x} sent:{} recv:{} min_lat:{:?} avg_lat:{:?} max_lat:{:?}",
                handle.remote_addr(),
                handle.session_id(),
                stats.packets_sent,
                stats.packets_received,
                stats.min_latency(),
                stats.avg_latency(),
                stats.max_latency(),
            ))
            .await?;
        } else {
            out.line(&format!(
                "{} sid:0x{:x} sent:{} recv:{}",
                handle.remote_addr(),
                handle.session_id(),
                stats.packets_sent,
                stats.packets_received,
            ))
            .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn chunked_writer_flushes_past_threshold() {
        let mut sink: Vec<u8> = Vec::new();
        {
            let mut out = ChunkedWriter::new(&mut sink);
            out.write(&"x".repeat(FLUSH_THRESHOLD + 1)).await.unwrap();
            out.flush().await.unwrap();
        }
        assert_eq!(sink.len(), FLUSH_THRESHOLD + 1);
    }

    #[tokio::test]
    async fn read_exact_buffered_drains_already_buffered_bytes_first() {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let (mut server_read, _) = tokio::io::split(server);

        // Simulates a probe token and its payload arriving in one read: by
        // the time the codec recognises the 4-byte token, the 8-byte mask
        // is already sitting in the shared read_buf alongside it.
        client.write_all(&[1, 2, 3, 4, 5, 6, 7, 8]).await.unwrap();
        let mut read_buf = BytesMut::new();
        // Give the kernel a moment to deliver both writes as one segment;
        // a single read_buf call below pulls whatever has arrived so far.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        server_read.read_buf(&mut read_buf).await.unwrap();
        assert_eq!(read_buf.len(), 8);

        let got = read_exact_buffered(&mut server_read, &mut read_buf, 8).await.unwrap();
        assert_eq!(got.as_ref(), &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(read_buf.is_empty());
    }

    #[tokio::test]
    async fn read_exact_buffered_falls_back_to_a_fresh_read_for_the_shortfall() {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let (mut server_read, _) = tokio::io::split(server);

        let mut read_buf = BytesMut::from(&[1u8, 2, 3][..]);
        client.write_all(&[4, 5, 6, 7, 8]).await.unwrap();

        let got = read_exact_buffered(&mut server_read, &mut read_buf, 8).await.unwrap();
        assert_eq!(got.as_ref(), &[1, 2, 3, 4, 5, 6, 7, 8]);
    }
}
