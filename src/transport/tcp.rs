// MIT License - Copyright (c) 2021 TJForc

//! TCP adapter for panels reached through a serial-to-ethernet bridge.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::{Result, VisonicError};
use crate::transport::{ChannelSink, SinkMessage};

/// A TCP connection split into a writer task and a reader task.
pub struct TcpTransport {
    sink: Option<ChannelSink>,
    inbound: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    reader_handle: Option<JoinHandle<()>>,
    writer_handle: Option<JoinHandle<()>>,
}

impl TcpTransport {
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        info!("Connecting to panel at {}:{}", host, port);
        let stream = TcpStream::connect(format!("{host}:{port}")).await.map_err(|e| {
            error!("TCP connect failed: {}", e);
            VisonicError::Io(e)
        })?;
        // Panel PDUs are tiny; do not batch them
        stream.set_nodelay(true)?;
        debug!("TCP socket connected");

        let (reader, writer) = stream.into_split();
        let (sink, sink_rx) = ChannelSink::new();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();

        Ok(Self {
            sink: Some(sink),
            inbound: Some(inbound),
            reader_handle: Some(spawn_reader_task(reader, inbound_tx)),
            writer_handle: Some(spawn_writer_task(writer, sink_rx)),
        })
    }

    /// The outbound sink. Can be taken once.
    pub fn take_sink(&mut self) -> Option<ChannelSink> {
        self.sink.take()
    }

    /// Inbound byte chunks. The channel closes with the socket. Can be taken once.
    pub fn take_inbound(&mut self) -> Option<mpsc::UnboundedReceiver<Vec<u8>>> {
        self.inbound.take()
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if let Some(handle) = self.reader_handle.take() {
            handle.abort();
        }
        if let Some(handle) = self.writer_handle.take() {
            handle.abort();
        }
    }
}

fn spawn_reader_task(
    mut reader: OwnedReadHalf,
    inbound: mpsc::UnboundedSender<Vec<u8>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 1024];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    debug!("Reader: connection closed");
                    break;
                }
                Ok(n) => {
                    if inbound.send(buf[..n].to_vec()).is_err() {
                        debug!("Reader: receiver dropped");
                        break;
                    }
                }
                Err(e) => {
                    error!("Reader: socket error: {}", e);
                    break;
                }
            }
        }
    })
}

fn spawn_writer_task(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<SinkMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = outbound.recv().await {
            match msg {
                SinkMessage::Data(data) => {
                    if let Err(e) = writer.write_all(&data).await {
                        error!("Writer: socket error: {}", e);
                        break;
                    }
                }
                SinkMessage::Close => {
                    debug!("Writer: closing connection");
                    let _ = writer.shutdown().await;
                    break;
                }
            }
        }
    })
}
