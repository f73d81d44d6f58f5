use futures_util::{SinkExt, StreamExt};
use omni_proto::WsMessage;
use std::time::Duration;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::MaybeTlsStream;

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// A typed test client for the dashboard WebSocket protocol.
pub struct WsTestClient {
    write: futures_util::stream::SplitSink<WsStream, Message>,
    read: futures_util::stream::SplitStream<WsStream>,
}

impl WsTestClient {
    pub async fn connect(url: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url).await?;
        let (write, read) = ws_stream.split();
        Ok(Self { write, read })
    }

    pub async fn send_message(&mut self, msg: &WsMessage) -> Result<(), Box<dyn std::error::Error>> {
        let json = serde_json::to_string(msg)?;
        self.write.send(Message::Text(json.into())).await?;
        Ok(())
    }

    /// Send a raw text frame (for malformed-input tests).
    pub async fn send_text(&mut self, text: &str) -> Result<(), Box<dyn std::error::Error>> {
        self.write.send(Message::Text(text.to_owned().into())).await?;
        Ok(())
    }

    /// Send a binary frame (the protocol rejects these).
    pub async fn send_binary(&mut self, bytes: &[u8]) -> Result<(), Box<dyn std::error::Error>> {
        self.write.send(Message::Binary(bytes.to_vec().into())).await?;
        Ok(())
    }

    /// Receive the next typed frame, skipping transport ping/pong.
    pub async fn recv_message(&mut self) -> Result<WsMessage, Box<dyn std::error::Error>> {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => {
                    let msg: WsMessage = serde_json::from_str(&text)?;
                    return Ok(msg);
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) => return Err("connection closed by server".into()),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Err("connection stream ended".into()),
            }
        }
    }

    /// Like [`Self::recv_message`] but bounded; `Ok(None)` means no frame
    /// arrived within `timeout` (useful for asserting silence).
    pub async fn recv_message_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<WsMessage>, Box<dyn std::error::Error>> {
        match tokio::time::timeout(timeout, self.recv_message()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    pub async fn close(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.write.send(Message::Close(None)).await?;
        Ok(())
    }
}
