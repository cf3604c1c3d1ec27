//! Transport layer - Byte-level exchange with the language server process
//!
//! This module moves raw byte chunks in both directions. It has no knowledge
//! of LSP framing; `Content-Length` parsing lives in [`crate::lsp::framing`]
//! because header lengths are counted in bytes, not characters.

use async_trait::async_trait;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{error, trace};

// ============================================================================
// Constants
// ============================================================================

/// Size of the read buffer for stdout reading operations
const READ_BUFFER_SIZE: usize = 8192;

/// Core transport trait for bidirectional byte exchange
#[async_trait]
pub trait Transport: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Send a chunk of bytes. Chunks are written whole and in call order.
    async fn send(&mut self, data: &[u8]) -> Result<(), Self::Error>;

    /// Receive the next chunk of bytes
    async fn receive(&mut self) -> Result<Vec<u8>, Self::Error>;

    /// Close the transport
    async fn close(&mut self) -> Result<(), Self::Error>;

    /// Check if transport is still active
    fn is_connected(&self) -> bool;
}

// ============================================================================
// Stdio Transport Implementation
// ============================================================================

/// Error types for stdio transport
#[derive(Debug, thiserror::Error)]
pub enum StdioTransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Transport is disconnected")]
    Disconnected,

    #[error("Channel error: {0}")]
    Channel(String),
}

/// Transport over a pair of async byte streams (child stdin/stdout in production)
///
/// A single writer task owns the output stream, so concurrent senders queue
/// on the channel and never interleave bytes of different messages.
#[derive(Debug)]
pub struct StdioTransport {
    /// Channel for sending chunks to the writer task
    stdin_sender: Option<mpsc::UnboundedSender<Vec<u8>>>,

    /// Channel for receiving chunks from the reader task
    stdout_receiver: Option<mpsc::UnboundedReceiver<Vec<u8>>>,

    /// Connection status
    connected: bool,
}

impl StdioTransport {
    /// Create a transport from any writer/reader pair
    pub fn new<W, R>(writer: W, reader: R) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (stdin_sender, stdin_receiver) = mpsc::unbounded_channel();
        let (stdout_sender, stdout_receiver) = mpsc::unbounded_channel();

        tokio::spawn(Self::writer_task(writer, stdin_receiver));
        tokio::spawn(Self::reader_task(reader, stdout_sender));

        Self {
            stdin_sender: Some(stdin_sender),
            stdout_receiver: Some(stdout_receiver),
            connected: true,
        }
    }

    /// Background task that writes chunks to the process input
    async fn writer_task<W>(mut writer: W, mut receiver: mpsc::UnboundedReceiver<Vec<u8>>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        while let Some(chunk) = receiver.recv().await {
            trace!("StdioTransport: Writing chunk ({} bytes)", chunk.len());

            if let Err(e) = writer.write_all(&chunk).await {
                error!("Failed to write to language server stdin: {}", e);
                break;
            }

            if let Err(e) = writer.flush().await {
                error!("Failed to flush language server stdin: {}", e);
                break;
            }
        }

        let _ = writer.shutdown().await;
        trace!("StdioTransport: writer task finished");
    }

    /// Background task that reads raw chunks from the process output
    async fn reader_task<R>(mut reader: R, sender: mpsc::UnboundedSender<Vec<u8>>)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let mut read_buffer = vec![0u8; READ_BUFFER_SIZE];

        loop {
            match reader.read(&mut read_buffer).await {
                Ok(0) => {
                    trace!("StdioTransport: reader reached EOF");
                    break;
                }
                Ok(n) => {
                    if sender.send(read_buffer[..n].to_vec()).is_err() {
                        trace!("StdioTransport: receiver dropped, stopping reader");
                        break;
                    }
                }
                Err(e) => {
                    error!("Failed to read from language server stdout: {}", e);
                    break;
                }
            }
        }

        trace!("StdioTransport: reader task finished");
    }
}

#[async_trait]
impl Transport for StdioTransport {
    type Error = StdioTransportError;

    async fn send(&mut self, data: &[u8]) -> Result<(), Self::Error> {
        if !self.connected {
            return Err(StdioTransportError::Disconnected);
        }

        let sender = self
            .stdin_sender
            .as_ref()
            .ok_or(StdioTransportError::Disconnected)?;

        sender
            .send(data.to_vec())
            .map_err(|e| StdioTransportError::Channel(e.to_string()))
    }

    async fn receive(&mut self) -> Result<Vec<u8>, Self::Error> {
        if !self.connected {
            return Err(StdioTransportError::Disconnected);
        }

        let receiver = self
            .stdout_receiver
            .as_mut()
            .ok_or(StdioTransportError::Disconnected)?;

        match receiver.recv().await {
            Some(chunk) => Ok(chunk),
            None => {
                self.connected = false;
                Err(StdioTransportError::Disconnected)
            }
        }
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.connected = false;
        self.stdin_sender.take();
        self.stdout_receiver.take();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

// ============================================================================
// Mock Transport Implementation
// ============================================================================

/// Error type for mock transport
#[derive(Debug, thiserror::Error)]
pub enum MockTransportError {
    #[error("Transport is disconnected")]
    Disconnected,
}

/// Mock transport for testing
///
/// Outgoing chunks are recorded; incoming chunks are pushed through the
/// paired [`MockTransportHandle`] at any time, so a test can answer a
/// request after seeing its id.
pub struct MockTransport {
    sent_messages: Arc<Mutex<Vec<Vec<u8>>>>,
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    connected: bool,
}

/// Test-side handle to a [`MockTransport`]
#[derive(Clone)]
pub struct MockTransportHandle {
    sent_messages: Arc<Mutex<Vec<Vec<u8>>>>,
    inbound: mpsc::UnboundedSender<Vec<u8>>,
}

impl MockTransport {
    /// Create a mock transport and the handle that drives it
    pub fn new() -> (Self, MockTransportHandle) {
        let sent_messages = Arc::new(Mutex::new(Vec::new()));
        let (sender, receiver) = mpsc::unbounded_channel();

        let transport = Self {
            sent_messages: Arc::clone(&sent_messages),
            inbound: receiver,
            connected: true,
        };
        let handle = MockTransportHandle {
            sent_messages,
            inbound: sender,
        };

        (transport, handle)
    }
}

impl MockTransportHandle {
    /// Queue bytes that the transport will return from `receive()`
    pub fn push_inbound(&self, data: impl Into<Vec<u8>>) {
        let _ = self.inbound.send(data.into());
    }

    /// All chunks sent through the transport so far
    pub fn sent_messages(&self) -> Vec<Vec<u8>> {
        self.sent_messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of chunks sent through the transport so far
    pub fn sent_count(&self) -> usize {
        self.sent_messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Error = MockTransportError;

    async fn send(&mut self, data: &[u8]) -> Result<(), Self::Error> {
        if !self.connected {
            return Err(MockTransportError::Disconnected);
        }

        self.sent_messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(data.to_vec());
        Ok(())
    }

    async fn receive(&mut self) -> Result<Vec<u8>, Self::Error> {
        if !self.connected {
            return Err(MockTransportError::Disconnected);
        }

        self.inbound
            .recv()
            .await
            .ok_or(MockTransportError::Disconnected)
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    #[tokio::test]
    async fn test_stdio_transport_echo() {
        let mut child = Command::new("echo")
            .arg("hello world")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .expect("Failed to spawn echo command");

        let stdin = child.stdin.take().unwrap();
        let stdout = child.stdout.take().unwrap();

        let mut transport = StdioTransport::new(stdin, stdout);

        let output = transport.receive().await.unwrap();
        assert_eq!(String::from_utf8(output).unwrap().trim(), "hello world");
        assert!(transport.is_connected());

        transport.close().await.unwrap();
        let _ = child.wait().await;
    }

    #[tokio::test]
    async fn test_stdio_transport_over_duplex() {
        let (client_side, server_side) = tokio::io::duplex(1024);
        let (client_read, client_write) = tokio::io::split(client_side);
        let (mut server_read, mut server_write) = tokio::io::split(server_side);

        let mut transport = StdioTransport::new(client_write, client_read);

        transport.send(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server_write.write_all(b"pong").await.unwrap();
        let received = transport.receive().await.unwrap();
        assert_eq!(received, b"pong");
    }

    #[tokio::test]
    async fn test_stdio_transport_reports_disconnect_on_eof() {
        let (client_side, server_side) = tokio::io::duplex(64);
        let (client_read, client_write) = tokio::io::split(client_side);
        let mut transport = StdioTransport::new(client_write, client_read);

        drop(server_side);

        let result = transport.receive().await;
        assert!(matches!(result, Err(StdioTransportError::Disconnected)));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_mock_transport_send_receive() {
        let (mut transport, handle) = MockTransport::new();

        transport.send(b"message1").await.unwrap();
        transport.send(b"message2").await.unwrap();

        handle.push_inbound("response1");
        assert_eq!(transport.receive().await.unwrap(), b"response1");

        let sent = handle.sent_messages();
        assert_eq!(sent, vec![b"message1".to_vec(), b"message2".to_vec()]);
        assert_eq!(handle.sent_count(), 2);
    }

    #[tokio::test]
    async fn test_mock_transport_disconnect() {
        let (mut transport, handle) = MockTransport::new();
        assert!(transport.is_connected());

        transport.close().await.unwrap();

        assert!(!transport.is_connected());
        assert!(transport.send(b"test").await.is_err());
        assert!(transport.receive().await.is_err());
        drop(handle);
    }

    #[tokio::test]
    async fn test_mock_transport_ends_when_handle_dropped() {
        let (mut transport, handle) = MockTransport::new();
        drop(handle);
        assert!(matches!(
            transport.receive().await,
            Err(MockTransportError::Disconnected)
        ));
    }
}
