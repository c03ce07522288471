// Socket transport
//
// Accepts or opens the debugger connection, exchanges the handshake, and runs a
// packet pump: inbound packets are framed off the socket onto a channel for the
// command loop, outbound packets arrive on another channel from any thread.

use crate::engine::PacketSink;
use crate::packet::Packet;
use crate::protocol::{JdwpError, JdwpResult, HEADER_SIZE, JDWP_HANDSHAKE, MAX_PACKET_SIZE};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long a closing connection may take to flush its last packets.
const WRITER_DRAIN: Duration = Duration::from_secs(2);

/// Where to listen or connect: `port` or `host:port`.
pub fn parse_address(address: &str) -> JdwpResult<(String, u16)> {
    let (host, port) = match address.rsplit_once(':') {
        Some((host, port)) => (host, port),
        None => ("localhost", address),
    };
    let port = port
        .parse::<u16>()
        .map_err(|_| JdwpError::Protocol(format!("Invalid port in address: {}", address)))?;
    let host = if host.is_empty() || host == "*" { "0.0.0.0" } else { host };
    Ok((host.to_string(), port))
}

async fn with_timeout<T>(
    timeout: Option<Duration>,
    fut: impl std::future::Future<Output = JdwpResult<T>>,
) -> JdwpResult<T> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
            JdwpError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "transport timeout"))
        })?,
        None => fut.await,
    }
}

pub async fn listen(address: &str) -> JdwpResult<TcpListener> {
    let (host, port) = parse_address(address)?;
    let listener = TcpListener::bind((host.as_str(), port)).await?;
    info!("Listening for transport dt_socket at address: {}", listener.local_addr()?);
    Ok(listener)
}

/// Wait for a debugger and shake hands with it.
pub async fn accept(listener: &TcpListener, timeout: Option<Duration>) -> JdwpResult<(TcpStream, SocketAddr)> {
    with_timeout(timeout, async {
        let (mut stream, peer) = listener.accept().await?;
        info!("Debugger connected from {}", peer);
        // The debugger speaks first.
        expect_handshake(&mut stream).await?;
        send_handshake(&mut stream).await?;
        Ok((stream, peer))
    })
    .await
}

/// Connect out to a listening debugger.
pub async fn attach(address: &str, timeout: Option<Duration>) -> JdwpResult<TcpStream> {
    let (host, port) = parse_address(address)?;
    with_timeout(timeout, async {
        info!("Attaching to debugger at {}:{}", host, port);
        let mut stream = TcpStream::connect((host.as_str(), port)).await?;
        send_handshake(&mut stream).await?;
        expect_handshake(&mut stream).await?;
        Ok(stream)
    })
    .await
}

async fn send_handshake<S: AsyncWrite + Unpin>(stream: &mut S) -> JdwpResult<()> {
    stream.write_all(JDWP_HANDSHAKE).await?;
    stream.flush().await?;
    Ok(())
}

async fn expect_handshake<S: AsyncRead + Unpin>(stream: &mut S) -> JdwpResult<()> {
    let mut buf = vec![0u8; JDWP_HANDSHAKE.len()];
    stream.read_exact(&mut buf).await?;
    if buf != JDWP_HANDSHAKE {
        warn!("Invalid handshake: {:?}", buf);
        return Err(JdwpError::InvalidHandshake);
    }
    debug!("JDWP handshake successful");
    Ok(())
}

/// Read one framed packet.
pub async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R) -> JdwpResult<Packet> {
    let mut header = BytesMut::with_capacity(HEADER_SIZE);
    header.resize(HEADER_SIZE, 0);
    reader.read_exact(&mut header).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            JdwpError::ConnectionClosed
        } else {
            JdwpError::Io(e)
        }
    })?;

    let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if length < HEADER_SIZE {
        return Err(JdwpError::Protocol(format!("Invalid packet length: {}", length)));
    }
    if length > MAX_PACKET_SIZE {
        return Err(JdwpError::Protocol(format!(
            "Packet too large: {} bytes (max: {} bytes)",
            length, MAX_PACKET_SIZE
        )));
    }

    let mut full = header.to_vec();
    let data_len = length - HEADER_SIZE;
    if data_len > 0 {
        let mut data = vec![0u8; data_len];
        reader.read_exact(&mut data).await?;
        full.extend_from_slice(&data);
    }
    Packet::decode(&full)
}

/// Outbound half of a connection, usable from any thread.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Packet>,
}

impl PacketSink for ChannelSink {
    fn send_packet(&self, packet: Packet) -> JdwpResult<()> {
        self.tx.send(packet).map_err(|_| JdwpError::ConnectionClosed)
    }
}

/// A live debugger connection.
pub struct Connection {
    pub sink: ChannelSink,
    /// Inbound packets; closes when the socket does.
    pub inbound: mpsc::Receiver<Packet>,
    pub pump: PacketPump,
}

impl Connection {
    pub fn close(self) {
        self.pump.close();
    }
}

/// The reader and writer tasks behind a connection.
pub struct PacketPump {
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl PacketPump {
    pub fn close(self) {
        self.reader.abort();
        self.writer.abort();
    }

    /// Stop reading and let the writer flush what is queued. The writer ends
    /// once every sink clone is dropped.
    pub async fn shutdown(self) {
        self.reader.abort();
        let mut writer = self.writer;
        if tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
            warn!("packet writer did not drain, aborting");
            writer.abort();
        }
    }
}

/// Start the packet pump over an established stream.
///
/// Reading and writing run as separate tasks so that a partially read packet
/// is never abandoned to service an outbound one.
pub fn spawn_packet_pump<S>(stream: S) -> Connection
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::channel(64);
    Connection {
        sink: ChannelSink { tx: out_tx },
        inbound: in_rx,
        pump: PacketPump {
            reader: tokio::spawn(read_task(reader, in_tx)),
            writer: tokio::spawn(write_task(writer, out_rx)),
        },
    }
}

async fn read_task<R: AsyncRead + Unpin>(mut reader: R, in_tx: mpsc::Sender<Packet>) {
    info!("Packet reader started");
    loop {
        match read_packet(&mut reader).await {
            Ok(packet) => {
                debug!(id = packet.id, len = packet.data_len(), "received packet");
                if in_tx.send(packet).await.is_err() {
                    warn!("Command loop gone, closing connection");
                    break;
                }
            }
            Err(JdwpError::ConnectionClosed) => {
                info!("Debugger closed the connection");
                break;
            }
            Err(e) => {
                error!("Failed to read packet: {}", e);
                break;
            }
        }
    }
    info!("Packet reader shutting down");
}

async fn write_task<W: AsyncWrite + Unpin>(mut writer: W, mut out_rx: mpsc::UnboundedReceiver<Packet>) {
    while let Some(packet) = out_rx.recv().await {
        debug!(id = packet.id, reply = packet.is_reply(), "sending packet");
        let encoded = packet.encode();
        if let Err(e) = writer.write_all(&encoded).await {
            error!("Failed to write packet: {}", e);
            break;
        }
        if let Err(e) = writer.flush().await {
            error!("Failed to flush packet: {}", e);
            break;
        }
    }
    let _ = writer.shutdown().await;
    debug!("Packet writer shutting down");
}
