use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

pub const FRAME_MAGIC: [u8; 4] = *b"VGF1";

/// Upper bound on a single frame payload. Anything larger is treated as a
/// desynchronized stream, not a frame.
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// A decoded frame as handed to the pipeline. The payload bytes are opaque
/// here; only the detector interprets them.
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("unsupported source scheme: {0}")]
    UnsupportedScheme(String),
    #[error("source disconnected")]
    Disconnected,
    #[error("timeout")]
    Timeout,
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("io error: {0}")]
    Io(String),
}

#[async_trait]
pub trait CameraSource: Send {
    async fn connect(&mut self) -> Result<(), SourceError>;
    async fn read_frame(&mut self) -> Result<Frame, SourceError>;
    async fn disconnect(&mut self) -> Result<(), SourceError>;
    fn is_connected(&self) -> bool;
}

/// Length-prefixed raw-frame transport over TCP.
///
/// Wire format per frame: 4-byte magic, then width, height and payload
/// length as big-endian u32, then the payload.
pub struct TcpCameraSource {
    source: String,
    connect_timeout: Duration,
    read_timeout: Duration,
    stream: Option<TcpStream>,
}

impl TcpCameraSource {
    pub fn new(source: impl Into<String>, connect_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            source: source.into(),
            connect_timeout,
            read_timeout,
            stream: None,
        }
    }
}

fn target_addr(source: &str) -> Result<&str, SourceError> {
    if let Some(rest) = source.strip_prefix("tcp://") {
        return Ok(rest);
    }
    if source.contains("://") {
        return Err(SourceError::UnsupportedScheme(source.to_string()));
    }
    Ok(source)
}

async fn read_exact_frame(stream: &mut TcpStream) -> Result<Frame, SourceError> {
    let mut header = [0_u8; 16];
    read_all(stream, &mut header).await?;

    if header[..4] != FRAME_MAGIC {
        return Err(SourceError::MalformedFrame(format!(
            "bad magic {:02X?}",
            &header[..4]
        )));
    }

    let width = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    let height = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);
    let len = u32::from_be_bytes([header[12], header[13], header[14], header[15]]) as usize;

    if len == 0 || len > MAX_FRAME_BYTES {
        return Err(SourceError::MalformedFrame(format!(
            "declared payload of {len} bytes"
        )));
    }

    let mut data = vec![0_u8; len];
    read_all(stream, &mut data).await?;

    Ok(Frame {
        width,
        height,
        data,
        captured_at: Utc::now(),
    })
}

async fn read_all(stream: &mut TcpStream, buf: &mut [u8]) -> Result<(), SourceError> {
    match stream.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => Err(SourceError::Disconnected),
        Err(err) => Err(SourceError::Io(err.to_string())),
    }
}

#[async_trait]
impl CameraSource for TcpCameraSource {
    async fn connect(&mut self) -> Result<(), SourceError> {
        self.stream = None;
        let addr = target_addr(&self.source)?;

        let stream = timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| SourceError::Timeout)?
            .map_err(|err| SourceError::Io(format!("connect to {addr} failed: {err}")))?;

        self.stream = Some(stream);
        Ok(())
    }

    async fn read_frame(&mut self) -> Result<Frame, SourceError> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(SourceError::Disconnected);
        };

        match timeout(self.read_timeout, read_exact_frame(stream)).await {
            Ok(result) => result,
            Err(_) => Err(SourceError::Timeout),
        }
    }

    async fn disconnect(&mut self) -> Result<(), SourceError> {
        self.stream = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn encode_frame(magic: &[u8; 4], width: u32, height: u32, payload: &[u8]) -> Vec<u8> {
        let mut msg = Vec::new();
        msg.extend_from_slice(magic);
        msg.extend_from_slice(&width.to_be_bytes());
        msg.extend_from_slice(&height.to_be_bytes());
        msg.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        msg.extend_from_slice(payload);
        msg
    }

    #[test]
    fn target_addr_accepts_tcp_and_bare_addresses() {
        assert_eq!(target_addr("tcp://10.0.0.1:7001").expect("tcp"), "10.0.0.1:7001");
        assert_eq!(target_addr("10.0.0.1:7001").expect("bare"), "10.0.0.1:7001");
        assert!(matches!(
            target_addr("rtsp://10.0.0.1/stream"),
            Err(SourceError::UnsupportedScheme(_))
        ));
    }

    #[tokio::test]
    async fn reads_length_prefixed_frame() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let payload = vec![7_u8; 32];
            let msg = encode_frame(&FRAME_MAGIC, 4, 2, &payload);
            socket.write_all(&msg).await.expect("write frame");
        });

        let mut source = TcpCameraSource::new(
            format!("tcp://{addr}"),
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        source.connect().await.expect("connect");
        assert!(source.is_connected());

        let frame = source.read_frame().await.expect("frame");
        assert_eq!((frame.width, frame.height), (4, 2));
        assert_eq!(frame.data, vec![7_u8; 32]);

        server.await.expect("server");
    }

    #[tokio::test]
    async fn rejects_bad_magic() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let msg = encode_frame(b"XXXX", 4, 2, &[0_u8; 8]);
            socket.write_all(&msg).await.expect("write frame");
        });

        let mut source = TcpCameraSource::new(
            addr.to_string(),
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        source.connect().await.expect("connect");

        let err = source.read_frame().await.expect_err("must reject");
        assert!(matches!(err, SourceError::MalformedFrame(_)));

        server.await.expect("server");
    }

    #[tokio::test]
    async fn read_without_connect_is_disconnected() {
        let mut source = TcpCameraSource::new(
            "127.0.0.1:1",
            Duration::from_millis(100),
            Duration::from_millis(100),
        );
        assert!(!source.is_connected());
        assert!(matches!(
            source.read_frame().await,
            Err(SourceError::Disconnected)
        ));
    }
}
