//! `TunnelService` over HTTP

use async_trait::async_trait;
use burrow_proto::{
    ConnectRequest, ConnectResponse, ConnectionId, ConnectionRequest, KillConnectionRequest,
    KillSessionRequest, LoginRequest, LoginResponse, MonitorResponse, ReadResponse,
    SessionId, SessionInfo, SessionRequest, TunnelError, TunnelResult, TunnelService,
    VersionInfo, WriteRequest,
};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::trace;

use crate::error::ErrorResponse;
use crate::routes;

/// HTTP client for a remote tunnel registry
///
/// Non-2xx responses are decoded back into the `TunnelError` the registry
/// raised. A request that never got a connection is `TunnelError::NotSent`;
/// anything that fails after the request may have gone out (timed out,
/// reset, garbled) is `TunnelError::Transport`.
#[derive(Debug, Clone)]
pub struct HttpTunnelClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpTunnelClient {
    pub fn new(base_url: &str, request_timeout: Duration) -> TunnelResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| TunnelError::transport(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(response: reqwest::Response) -> TunnelResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| TunnelError::transport(e.to_string()))?;
        match serde_json::from_slice::<ErrorResponse>(&body) {
            Ok(error) => Err(error.detail),
            Err(_) => Err(TunnelError::Protocol {
                message: format!(
                    "HTTP {}: {}",
                    status,
                    String::from_utf8_lossy(&body)
                ),
            }),
        }
    }

    async fn send<Req: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &Req,
    ) -> TunnelResult<reqwest::Response> {
        trace!("POST {}", path);
        let response = self
            .http
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(request_error)?;
        Self::check(response).await
    }

    async fn post<Req: Serialize + ?Sized, Resp: DeserializeOwned>(
        &self,
        path: &str,
        body: &Req,
    ) -> TunnelResult<Resp> {
        let response = self.send(path, body).await?;
        decode(response).await
    }

    async fn get(&self, path: &str) -> TunnelResult<reqwest::Response> {
        trace!("GET {}", path);
        let response = self
            .http
            .get(self.url(path))
            .send()
            .await
            .map_err(request_error)?;
        Self::check(response).await
    }
}

fn request_error(e: reqwest::Error) -> TunnelError {
    if e.is_connect() {
        TunnelError::not_sent(e.to_string())
    } else {
        TunnelError::transport(e.to_string())
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> TunnelResult<T> {
    let body = response
        .bytes()
        .await
        .map_err(|e| TunnelError::transport(e.to_string()))?;
    serde_json::from_slice(&body).map_err(|e| TunnelError::Protocol {
        message: format!("invalid response body: {}", e),
    })
}

fn session(session_id: &str) -> SessionRequest {
    SessionRequest {
        session_id: session_id.to_string(),
    }
}

fn connection(session_id: &str, connection_id: ConnectionId) -> ConnectionRequest {
    ConnectionRequest {
        session_id: session_id.to_string(),
        connection_id,
    }
}

#[async_trait]
impl TunnelService for HttpTunnelClient {
    async fn login(&self, username: &str, password: &str) -> TunnelResult<SessionId> {
        let req = LoginRequest {
            username: username.to_string(),
            password: password.to_string(),
        };
        let resp: LoginResponse = self.post(routes::LOGIN, &req).await?;
        Ok(resp.session_id)
    }

    async fn logout(&self, session_id: &str) -> TunnelResult<()> {
        self.send(routes::LOGOUT, &session(session_id)).await?;
        Ok(())
    }

    async fn version(&self) -> TunnelResult<VersionInfo> {
        decode(self.get(routes::VERSION).await?).await
    }

    async fn ping(&self) -> TunnelResult<()> {
        self.get(routes::PING).await?;
        Ok(())
    }

    async fn connect(&self, session_id: &str, target: &str) -> TunnelResult<ConnectionId> {
        let req = ConnectRequest {
            session_id: session_id.to_string(),
            target: target.to_string(),
        };
        let resp: ConnectResponse = self.post(routes::CONNECT, &req).await?;
        Ok(resp.connection_id)
    }

    async fn disconnect(&self, session_id: &str, connection_id: ConnectionId) -> TunnelResult<()> {
        self.send(routes::DISCONNECT, &connection(session_id, connection_id))
            .await?;
        Ok(())
    }

    async fn read(
        &self,
        session_id: &str,
        connection_id: ConnectionId,
    ) -> TunnelResult<ReadResponse> {
        self.post(routes::READ, &connection(session_id, connection_id))
            .await
    }

    async fn write(
        &self,
        session_id: &str,
        connection_id: ConnectionId,
        data: Bytes,
    ) -> TunnelResult<()> {
        let req = WriteRequest {
            session_id: session_id.to_string(),
            connection_id,
            data,
        };
        self.send(routes::WRITE, &req).await?;
        Ok(())
    }

    async fn monitor(&self, session_id: &str) -> TunnelResult<Vec<SessionInfo>> {
        let resp: MonitorResponse = self.post(routes::MONITOR, &session(session_id)).await?;
        Ok(resp.sessions)
    }

    async fn kill_session(&self, session_id: &str, target_session_id: &str) -> TunnelResult<()> {
        let req = KillSessionRequest {
            session_id: session_id.to_string(),
            target_session_id: target_session_id.to_string(),
        };
        self.send(routes::KILL_SESSION, &req).await?;
        Ok(())
    }

    async fn kill_connection(
        &self,
        session_id: &str,
        target_session_id: &str,
        connection_id: ConnectionId,
    ) -> TunnelResult<()> {
        let req = KillConnectionRequest {
            session_id: session_id.to_string(),
            target_session_id: target_session_id.to_string(),
            connection_id,
        };
        self.send(routes::KILL_CONNECTION, &req).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = HttpTunnelClient::new("http://127.0.0.1:8080/", Duration::from_secs(5)).unwrap();
        assert_eq!(client.base_url(), "http://127.0.0.1:8080");
        assert_eq!(client.url(routes::PING), "http://127.0.0.1:8080/rpc/ping");
    }

    #[tokio::test]
    async fn test_refused_connection_is_not_sent() {
        let client = HttpTunnelClient::new("http://127.0.0.1:1", Duration::from_secs(2)).unwrap();
        let err = client.ping().await.unwrap_err();
        assert!(matches!(err, TunnelError::NotSent { .. }));
        assert!(err.is_safe_to_repeat());
    }

    #[tokio::test]
    async fn test_timeout_after_send_is_transport_error() {
        // Accepts and reads the request but never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let client =
            HttpTunnelClient::new(&format!("http://{}", addr), Duration::from_millis(200)).unwrap();
        let err = client.read("s1", 1).await.unwrap_err();
        assert!(matches!(err, TunnelError::Transport { .. }));
        assert!(!err.is_safe_to_repeat());
    }
}
