// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Duplex socket connections to peers, over tcp, tls, ws or wss.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;

use crate::error::{Error, ErrorKind};

/// Each Stream represents a duplex socket connection to a peer.
#[derive(Debug)]
pub enum Stream {
    Mqtt(TcpStream),
    Mqtts(Box<TlsStream<TcpStream>>),
    Ws(Box<WebSocketStream<TcpStream>>),
    Wss(Box<WebSocketStream<TlsStream<TcpStream>>>),
}

impl Stream {
    /// Open a plain tcp connection to a broker, client side.
    ///
    /// # Errors
    ///
    /// Returns error if the peer is unreachable.
    pub async fn connect_tcp(address: &str) -> Result<Self, Error> {
        let tcp_stream = TcpStream::connect(address).await?;
        Ok(Self::Mqtt(tcp_stream))
    }

    /// Open a websocket connection to a broker, client side.
    ///
    /// `url` is like `ws://localhost:8083/mqtt`.
    ///
    /// # Errors
    ///
    /// Returns error if the peer is unreachable or the websocket
    /// handshake fails.
    pub async fn connect_ws(url: &str, address: &str) -> Result<Self, Error> {
        let tcp_stream = TcpStream::connect(address).await?;
        let (ws_stream, _response) = tokio_tungstenite::client_async(url, tcp_stream).await?;
        Ok(Self::Ws(Box::new(ws_stream)))
    }

    /// Split into independently owned reader and writer halves.
    ///
    /// The handler gives the reader half to the reader task and keeps the
    /// writer half behind its writer mutex.
    #[must_use]
    pub fn split(self) -> (StreamReader, StreamWriter) {
        match self {
            Self::Mqtt(tcp_stream) => {
                let (reader, writer) = tcp_stream.into_split();
                (StreamReader::Mqtt(reader), StreamWriter::Mqtt(writer))
            }
            Self::Mqtts(tls_stream) => {
                let (reader, writer) = tokio::io::split(*tls_stream);
                (StreamReader::Mqtts(reader), StreamWriter::Mqtts(writer))
            }
            Self::Ws(ws_stream) => {
                let (sink, stream) = (*ws_stream).split();
                (StreamReader::Ws(stream), StreamWriter::Ws(sink))
            }
            Self::Wss(wss_stream) => {
                let (sink, stream) = (*wss_stream).split();
                (StreamReader::Wss(stream), StreamWriter::Wss(sink))
            }
        }
    }
}

/// Reading half of a peer connection.
#[allow(clippy::module_name_repetitions)]
pub enum StreamReader {
    Mqtt(OwnedReadHalf),
    Mqtts(ReadHalf<TlsStream<TcpStream>>),
    Ws(SplitStream<WebSocketStream<TcpStream>>),
    Wss(SplitStream<WebSocketStream<TlsStream<TcpStream>>>),
}

impl StreamReader {
    /// Read some bytes from the stream into `buf`.
    ///
    /// Returns 0 when the peer closed the connection.
    ///
    /// # Errors
    ///
    /// Returns error if the socket fails.
    pub async fn read_buf(&mut self, buf: &mut Vec<u8>) -> Result<usize, Error> {
        match self {
            Self::Mqtt(reader) => Ok(reader.read_buf(buf).await?),
            Self::Mqtts(reader) => Ok(reader.read_buf(buf).await?),
            Self::Ws(reader) => read_ws_stream(reader, buf).await,
            Self::Wss(reader) => read_ws_stream(reader, buf).await,
        }
    }
}

async fn read_ws_stream<S>(reader: &mut S, buf: &mut Vec<u8>) -> Result<usize, Error>
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    loop {
        match reader.next().await {
            None | Some(Ok(Message::Close(_))) => return Ok(0),
            Some(Ok(Message::Binary(data))) => {
                buf.extend_from_slice(&data);
                return Ok(data.len());
            }
            Some(Ok(Message::Text(text))) => {
                buf.extend_from_slice(text.as_bytes());
                return Ok(text.len());
            }
            // Ping/pong frames only keep the socket alive.
            Some(Ok(_)) => {}
            Some(Err(err)) => return Err(err.into()),
        }
    }
}

/// Writing half of a peer connection.
#[allow(clippy::module_name_repetitions)]
pub enum StreamWriter {
    Mqtt(OwnedWriteHalf),
    Mqtts(WriteHalf<TlsStream<TcpStream>>),
    Ws(SplitSink<WebSocketStream<TcpStream>, Message>),
    Wss(SplitSink<WebSocketStream<TlsStream<TcpStream>>, Message>),
}

impl StreamWriter {
    /// Write the whole buffer to the stream.
    ///
    /// # Errors
    ///
    /// Returns error if the socket fails.
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<(), Error> {
        match self {
            Self::Mqtt(writer) => {
                writer.write_all(buf).await?;
                writer.flush().await?;
                Ok(())
            }
            Self::Mqtts(writer) => {
                writer.write_all(buf).await?;
                writer.flush().await?;
                Ok(())
            }
            Self::Ws(writer) => {
                writer.send(Message::binary(buf.to_vec())).await?;
                Ok(())
            }
            Self::Wss(writer) => {
                writer.send(Message::binary(buf.to_vec())).await?;
                Ok(())
            }
        }
    }

    /// Shut the write side down, telling the peer no more packets follow.
    pub async fn shutdown(&mut self) {
        let result: Result<(), Error> = match self {
            Self::Mqtt(writer) => writer.shutdown().await.map_err(Into::into),
            Self::Mqtts(writer) => writer.shutdown().await.map_err(Into::into),
            Self::Ws(writer) => writer.close().await.map_err(Into::into),
            Self::Wss(writer) => writer.close().await.map_err(Into::into),
        };
        if let Err(err) = result {
            log::debug!("stream: Failed to shutdown writer: {err}");
        }
    }
}

impl std::fmt::Debug for StreamReader {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            Self::Mqtt(..) => "Mqtt",
            Self::Mqtts(..) => "Mqtts",
            Self::Ws(..) => "Ws",
            Self::Wss(..) => "Wss",
        };
        write!(f, "StreamReader::{name}")
    }
}

impl std::fmt::Debug for StreamWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            Self::Mqtt(..) => "Mqtt",
            Self::Mqtts(..) => "Mqtts",
            Self::Ws(..) => "Ws",
            Self::Wss(..) => "Wss",
        };
        write!(f, "StreamWriter::{name}")
    }
}

// Used by the `ErrorKind::SocketError` paths in the handlers.
pub(crate) fn connection_closed_error() -> Error {
    Error::new(ErrorKind::SocketError, "Connection closed by peer")
}
