// MIT License - Copyright (c) 2021 TJForc

pub mod framer;
pub mod queue;
pub mod tcp;

use tokio::sync::mpsc;

use crate::error::{Result, VisonicError};

/// Outbound half of the duplex byte stream to the panel.
///
/// The protocol engine never opens sockets itself; whoever owns the
/// connection supplies a sink and feeds inbound bytes to `receive`.
pub trait ByteSink: Send {
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Release the connection. Further writes may fail.
    fn close(&mut self);
}

impl<T: ByteSink + ?Sized> ByteSink for Box<T> {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        (**self).write(data)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// Messages carried by a [`ChannelSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkMessage {
    Data(Vec<u8>),
    Close,
}

/// Sink that forwards writes to a writer task over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkMessage>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SinkMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ByteSink for ChannelSink {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.tx
            .send(SinkMessage::Data(data.to_vec()))
            .map_err(|_| VisonicError::ChannelClosed)
    }

    fn close(&mut self) {
        let _ = self.tx.send(SinkMessage::Close);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_sink_forwards() {
        let (mut sink, mut rx) = ChannelSink::new();
        sink.write(&[0x0D, 0x02, 0xFD, 0x0A]).unwrap();
        sink.close();
        assert_eq!(rx.try_recv().unwrap(), SinkMessage::Data(vec![0x0D, 0x02, 0xFD, 0x0A]));
        assert_eq!(rx.try_recv().unwrap(), SinkMessage::Close);
    }

    #[test]
    fn test_channel_sink_closed_receiver() {
        let (mut sink, rx) = ChannelSink::new();
        drop(rx);
        assert!(matches!(sink.write(&[0x02]), Err(VisonicError::ChannelClosed)));
    }
}
