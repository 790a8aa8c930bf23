//! Framed request/response connection to a peer service.
//!
//! Wire format: length-prefixed (u32 big-endian) JSON envelopes over TCP.
//! One request is in flight per connection at a time; the stream is
//! serialized behind an async mutex. Any I/O failure marks the connection
//! broken, and broken connections are never reused: the client manager
//! evicts them and dials fresh on the next use.

use crate::error::{CommsError, Result};
use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Upper bound on a single frame
const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Request envelope sent to a peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: u64,
    pub method: String,
    pub params: Value,
}

/// Response envelope returned by a peer. Exactly one of `result` and
/// `error` is populated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: u64,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

struct StreamState {
    stream: TcpStream,
    read_buffer: BytesMut,
}

/// A pooled outbound connection to one peer service.
pub struct RpcConnection {
    service_name: String,
    peer_addr: SocketAddr,
    created_at: Instant,
    inner: Mutex<StreamState>,
    next_id: AtomicU64,
    broken: AtomicBool,
}

impl fmt::Debug for RpcConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcConnection")
            .field("service_name", &self.service_name)
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}

impl RpcConnection {
    /// Dial a peer, blocking until the connection is established or the
    /// timeout elapses.
    pub async fn connect(service_name: &str, endpoint: &str, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(endpoint))
            .await
            .map_err(|_| CommsError::timeout("connect", timeout.as_millis() as u64))?
            .map_err(|e| {
                CommsError::transport_with_source(
                    format!("failed to connect to {service_name} at {endpoint}"),
                    e,
                )
            })?;

        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "failed to set TCP_NODELAY");
        }

        let peer_addr = stream
            .peer_addr()
            .map_err(|e| CommsError::transport_with_source("failed to get peer address", e))?;

        debug!(service = service_name, peer = %peer_addr, "peer connection established");

        Ok(Self {
            service_name: service_name.to_string(),
            peer_addr,
            created_at: Instant::now(),
            inner: Mutex::new(StreamState {
                stream,
                read_buffer: BytesMut::with_capacity(64 * 1024),
            }),
            next_id: AtomicU64::new(1),
            broken: AtomicBool::new(false),
        })
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Whether the transport is still usable
    pub fn is_healthy(&self) -> bool {
        !self.broken.load(Ordering::Acquire)
    }

    /// Issue one request and wait for the matching response. A peer-side
    /// failure comes back as [`CommsError::Rpc`]; an I/O failure marks the
    /// connection broken.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        if !self.is_healthy() {
            return Err(CommsError::transport(format!(
                "connection to {} is broken",
                self.service_name
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = serde_json::to_vec(&RpcRequest {
            id,
            method: method.to_string(),
            params,
        })?;
        if frame.len() > MAX_FRAME_SIZE {
            return Err(CommsError::protocol(format!(
                "request frame of {} bytes exceeds maximum {MAX_FRAME_SIZE}",
                frame.len()
            )));
        }

        let mut state = self.inner.lock().await;

        self.write_frame(&mut state, &frame).await?;
        let payload = self.read_frame(&mut state).await?;

        let response: RpcResponse = serde_json::from_slice(&payload)?;
        if response.id != id {
            // Stream is desynchronized; nothing on it can be trusted.
            self.broken.store(true, Ordering::Release);
            return Err(CommsError::protocol(format!(
                "response id {} does not match request id {id}",
                response.id
            )));
        }

        if let Some(message) = response.error {
            return Err(CommsError::Rpc {
                method: method.to_string(),
                message,
            });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    async fn write_frame(&self, state: &mut StreamState, frame: &[u8]) -> Result<()> {
        let len = (frame.len() as u32).to_be_bytes();
        let write = async {
            state.stream.write_all(&len).await?;
            state.stream.write_all(frame).await?;
            state.stream.flush().await
        };
        write.await.map_err(|e| {
            self.broken.store(true, Ordering::Release);
            CommsError::transport_with_source("failed to write frame", e)
        })
    }

    async fn read_frame(&self, state: &mut StreamState) -> Result<BytesMut> {
        let mut len_bytes = [0u8; 4];
        state.stream.read_exact(&mut len_bytes).await.map_err(|e| {
            self.broken.store(true, Ordering::Release);
            CommsError::transport_with_source("failed to read frame length", e)
        })?;

        let frame_len = u32::from_be_bytes(len_bytes) as usize;
        if frame_len > MAX_FRAME_SIZE {
            self.broken.store(true, Ordering::Release);
            return Err(CommsError::protocol(format!(
                "frame of {frame_len} bytes exceeds maximum {MAX_FRAME_SIZE}"
            )));
        }

        state.read_buffer.resize(frame_len, 0);
        state
            .stream
            .read_exact(&mut state.read_buffer)
            .await
            .map_err(|e| {
                self.broken.store(true, Ordering::Release);
                CommsError::transport_with_source("failed to read frame body", e)
            })?;

        Ok(state.read_buffer.split_to(frame_len))
    }

    /// Shut the transport down. Errors are logged; the connection is
    /// unusable afterwards either way.
    pub async fn shutdown(&self) {
        self.broken.store(true, Ordering::Release);
        let mut state = self.inner.lock().await;
        if let Err(e) = state.stream.shutdown().await {
            warn!(service = %self.service_name, error = %e, "error shutting down connection");
        }
        debug!(service = %self.service_name, peer = %self.peer_addr, "connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;

    /// Echo server speaking the frame protocol: responds to every request
    /// with its params as the result.
    async fn spawn_echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    loop {
                        let mut len_bytes = [0u8; 4];
                        if stream.read_exact(&mut len_bytes).await.is_err() {
                            return;
                        }
                        let len = u32::from_be_bytes(len_bytes) as usize;
                        let mut payload = vec![0u8; len];
                        if stream.read_exact(&mut payload).await.is_err() {
                            return;
                        }
                        let request: RpcRequest = serde_json::from_slice(&payload).unwrap();
                        let response = if request.method == "fail.me" {
                            RpcResponse {
                                id: request.id,
                                result: None,
                                error: Some("induced failure".to_string()),
                            }
                        } else {
                            RpcResponse {
                                id: request.id,
                                result: Some(request.params),
                                error: None,
                            }
                        };
                        let frame = serde_json::to_vec(&response).unwrap();
                        let len = (frame.len() as u32).to_be_bytes();
                        if stream.write_all(&len).await.is_err() {
                            return;
                        }
                        if stream.write_all(&frame).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn request_response_roundtrip() {
        let addr = spawn_echo_server().await;
        let conn = RpcConnection::connect("peer", &addr.to_string(), Duration::from_secs(5))
            .await
            .unwrap();

        let result = conn
            .call("echo", json!({"hello": "world"}))
            .await
            .unwrap();
        assert_eq!(result, json!({"hello": "world"}));
        assert!(conn.is_healthy());

        // Sequential calls reuse the same stream with fresh ids.
        let again = conn.call("echo", json!(2)).await.unwrap();
        assert_eq!(again, json!(2));
    }

    #[tokio::test]
    async fn remote_error_does_not_break_the_connection() {
        let addr = spawn_echo_server().await;
        let conn = RpcConnection::connect("peer", &addr.to_string(), Duration::from_secs(5))
            .await
            .unwrap();

        let err = conn.call("fail.me", json!({})).await.unwrap_err();
        assert!(matches!(err, CommsError::Rpc { .. }));
        assert!(conn.is_healthy(), "application errors are not transport faults");

        let ok = conn.call("echo", json!(1)).await.unwrap();
        assert_eq!(ok, json!(1));
    }

    #[tokio::test]
    async fn peer_hangup_marks_connection_broken() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // Accept and immediately drop the socket.
            let _ = listener.accept().await;
        });

        let conn = RpcConnection::connect("peer", &addr.to_string(), Duration::from_secs(5))
            .await
            .unwrap();

        let err = conn.call("echo", json!(null)).await.unwrap_err();
        assert!(matches!(err, CommsError::Transport { .. }));
        assert!(!conn.is_healthy());

        // A broken connection refuses further calls outright.
        let err = conn.call("echo", json!(null)).await.unwrap_err();
        assert!(matches!(err, CommsError::Transport { .. }));
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        // Bind then drop to get a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = RpcConnection::connect("peer", &addr.to_string(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CommsError::Transport { .. } | CommsError::Timeout { .. }
        ));
    }
}
