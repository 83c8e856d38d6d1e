use base64::Engine;
use fabric_protocol::Envelope;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::http::Request;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::MaybeTlsStream;

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// A hand-rolled WebSocket test client that can authenticate either via a
/// bearer header or via the `jwt.<token>` subprotocol, matching the two
/// handshake paths the gateway accepts.
pub struct MockWsClient {
    write: futures_util::stream::SplitSink<WsStream, Message>,
    read: futures_util::stream::SplitStream<WsStream>,
}

impl MockWsClient {
    /// Connect with no `Authorization` header at all (exercises the
    /// unauthenticated-rejection path).
    pub async fn connect(url: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url).await?;
        let (write, read) = ws_stream.split();
        Ok(Self { write, read })
    }

    /// Connect with `Authorization: Bearer <token>`.
    pub async fn connect_with_bearer(
        url: &str,
        token: &str,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let request = Self::upgrade_request(url, |builder| {
            builder.header("Authorization", format!("Bearer {token}"))
        })?;
        let (ws_stream, _response) = tokio_tungstenite::connect_async(request).await?;
        let (write, read) = ws_stream.split();
        Ok(Self { write, read })
    }

    /// Connect with `Authorization: Bearer <token>` and an
    /// `X-Reconnect-Token` header, for exercising session resumption.
    pub async fn connect_with_bearer_and_reconnect_token(
        url: &str,
        token: &str,
        reconnect_token: &str,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let request = Self::upgrade_request(url, |builder| {
            builder
                .header("Authorization", format!("Bearer {token}"))
                .header("X-Reconnect-Token", reconnect_token)
        })?;
        let (ws_stream, _response) = tokio_tungstenite::connect_async(request).await?;
        let (write, read) = ws_stream.split();
        Ok(Self { write, read })
    }

    /// Connect using the `jwt-auth` / `jwt.<base64url(token)>` subprotocol
    /// pair instead of a header, for clients that can't set custom headers
    /// on a browser WebSocket handshake.
    pub async fn connect_with_subprotocol(
        url: &str,
        token: &str,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(token);
        let subprotocols = format!("jwt-auth, jwt.{encoded}");
        let request = Self::upgrade_request(url, |builder| {
            builder.header("Sec-WebSocket-Protocol", subprotocols)
        })?;
        let (ws_stream, _response) = tokio_tungstenite::connect_async(request).await?;
        let (write, read) = ws_stream.split();
        Ok(Self { write, read })
    }

    fn upgrade_request(
        url: &str,
        decorate: impl FnOnce(
            tokio_tungstenite::tungstenite::http::request::Builder,
        ) -> tokio_tungstenite::tungstenite::http::request::Builder,
    ) -> Result<Request<()>, Box<dyn std::error::Error>> {
        use tokio_tungstenite::tungstenite::handshake::client::generate_key;
        let uri: tokio_tungstenite::tungstenite::http::Uri = url.parse()?;
        let host = uri.host().unwrap_or("localhost").to_owned();
        let host_header = match uri.port_u16() {
            Some(p) => format!("{host}:{p}"),
            None => host,
        };
        let builder = Request::builder()
            .uri(url)
            .header("Host", host_header)
            .header("Upgrade", "websocket")
            .header("Connection", "Upgrade")
            .header("Sec-WebSocket-Version", "13")
            .header("Sec-WebSocket-Key", generate_key());
        Ok(decorate(builder).body(())?)
    }

    pub async fn send_envelope(&mut self, env: &Envelope) -> Result<(), Box<dyn std::error::Error>> {
        let json = serde_json::to_string(env)?;
        self.write.send(Message::Text(json.into())).await?;
        Ok(())
    }

    /// Send an arbitrary JSON value, bypassing the typed envelope entirely —
    /// used to exercise the lenient/strict unknown-type validation paths.
    pub async fn send_raw(&mut self, value: &serde_json::Value) -> Result<(), Box<dyn std::error::Error>> {
        let json = serde_json::to_string(value)?;
        self.write.send(Message::Text(json.into())).await?;
        Ok(())
    }

    pub async fn recv_envelope(&mut self) -> Result<Envelope, Box<dyn std::error::Error>> {
        let text = self.recv_text().await?;
        Ok(serde_json::from_str(&text)?)
    }

    pub async fn recv_raw(&mut self) -> Result<serde_json::Value, Box<dyn std::error::Error>> {
        let text = self.recv_text().await?;
        Ok(serde_json::from_str(&text)?)
    }

    async fn recv_text(&mut self) -> Result<String, Box<dyn std::error::Error>> {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => return Ok(text.to_string()),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) => return Err("connection closed by server".into()),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Err("connection stream ended".into()),
            }
        }
    }

    pub async fn close(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.write.send(Message::Close(None)).await?;
        Ok(())
    }
}
