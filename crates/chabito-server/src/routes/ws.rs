//! WebSocket transports.
//!
//! Both endpoints validate every text frame the same way and keep the
//! connection open after a bad frame. `/ws/echo` answers with the decoded
//! payload, `/ws/chat` runs a turn per frame.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::payload::{parse_payload, InputMessage, PayloadError};
use crate::state::AppState;

async fn echo_handler(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(|socket| serve(socket, |input| async move { Ok::<_, ApiError>(echo(input)) }))
}

async fn chat_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        serve(socket, move |input| {
            let state = state.clone();
            async move { answer(&state, input).await }
        })
    })
}

fn echo(input: InputMessage) -> Value {
    json!({ "type": "echo", "payload": input })
}

async fn answer(state: &AppState, input: InputMessage) -> Result<Value, ApiError> {
    let contact = input.contact();
    let reply = state
        .chat
        .reply(&input.user_id, input.to_human_message(), Some(&contact))
        .await?;
    Ok(json!({
        "type": "answer",
        "user_id": input.user_id,
        "answer": reply.text(),
    }))
}

/// Read frames until the client goes away, answering each valid payload with `handle`
async fn serve<F, Fut>(socket: WebSocket, handle: F)
where
    F: Fn(InputMessage) -> Fut,
    Fut: std::future::Future<Output = Result<Value, ApiError>>,
{
    let (mut sender, mut receiver) = socket.split();

    while let Some(frame) = receiver.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    if send_json(&mut sender, PayloadError::InvalidJson.to_json())
                        .await
                        .is_err()
                    {
                        break;
                    }
                    continue;
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!("websocket receive error: {}", e);
                break;
            }
        };

        let response = match parse_payload(&text) {
            Ok(input) => match handle(input).await {
                Ok(value) => value,
                Err(e) => e.to_json(),
            },
            Err(e) => {
                tracing::debug!(error = e.code(), "rejected websocket frame");
                e.to_json()
            }
        };

        if send_json(&mut sender, response).await.is_err() {
            break;
        }
    }
}

async fn send_json<S>(sender: &mut S, value: Value) -> Result<(), axum::Error>
where
    S: SinkExt<Message, Error = axum::Error> + Unpin,
{
    sender.send(Message::Text(value.to_string())).await
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/ws/echo", get(echo_handler))
        .route("/ws/chat", get(chat_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::test_support::{replying, state_with};
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

    struct TestServer {
        addr: SocketAddr,
        handle: tokio::task::JoinHandle<()>,
    }

    impl Drop for TestServer {
        fn drop(&mut self) {
            self.handle.abort();
        }
    }

    async fn start_test_server(state: AppState) -> TestServer {
        let app = routes(state);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        TestServer { addr, handle }
    }

    async fn exchange<S>(ws: &mut S, text: &str) -> Value
    where
        S: SinkExt<WsMessage, Error = tokio_tungstenite::tungstenite::Error>
            + StreamExt<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        ws.send(WsMessage::Text(text.to_string())).await.unwrap();
        loop {
            match timeout(Duration::from_secs(5), ws.next()).await {
                Ok(Some(Ok(WsMessage::Text(text)))) => return serde_json::from_str(&text).unwrap(),
                Ok(Some(Ok(WsMessage::Close(_)))) => panic!("Connection closed"),
                Ok(Some(Ok(_))) => continue,
                Ok(Some(Err(e))) => panic!("Frame error: {e:?}"),
                Ok(None) => panic!("Stream ended"),
                Err(_) => panic!("Timeout waiting for frame"),
            }
        }
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        let server = start_test_server(state_with(replying(&[]))).await;
        let (mut ws, _) = connect_async(format!("ws://{}/ws/echo", server.addr))
            .await
            .unwrap();

        let response = exchange(
            &mut ws,
            r#"{"message": "hola", "user_id": "u1", "sender_nickname": "Ana"}"#,
        )
        .await;
        assert_eq!(response["type"], "echo");
        assert_eq!(response["payload"]["message"], "hola");
        assert_eq!(response["payload"]["user_id"], "u1");
        assert_eq!(response["payload"]["sender_nickname"], "Ana");
        assert_eq!(response["payload"]["file_base64"], Value::Null);
    }

    #[tokio::test]
    async fn test_echo_invalid_json_keeps_connection() {
        let server = start_test_server(state_with(replying(&[]))).await;
        let (mut ws, _) = connect_async(format!("ws://{}/ws/echo", server.addr))
            .await
            .unwrap();

        let response = exchange(&mut ws, "not-json").await;
        assert_eq!(
            response,
            json!({"error": "invalid_json", "detail": "Payload must be valid JSON"})
        );

        let response = exchange(&mut ws, r#"{"message": "sigo aquí", "user_id": "u1"}"#).await;
        assert_eq!(response["type"], "echo");
    }

    #[tokio::test]
    async fn test_echo_invalid_payload_keeps_connection() {
        let server = start_test_server(state_with(replying(&[]))).await;
        let (mut ws, _) = connect_async(format!("ws://{}/ws/echo", server.addr))
            .await
            .unwrap();

        let response = exchange(&mut ws, r#"{"message": 123}"#).await;
        assert_eq!(response["error"], "invalid_payload");
        assert_eq!(response["validation_errors"][0]["loc"], json!(["message"]));

        let response = exchange(&mut ws, r#"{"message": "hola", "user_id": "u1"}"#).await;
        assert_eq!(response["type"], "echo");
        assert_eq!(response["payload"]["message"], "hola");
    }

    #[tokio::test]
    async fn test_chat_over_websocket() {
        let state = state_with(replying(&["Hola Ana", "Adiós Ana"]));
        let server = start_test_server(state.clone()).await;
        let (mut ws, _) = connect_async(format!("ws://{}/ws/chat", server.addr))
            .await
            .unwrap();

        let response = exchange(&mut ws, r#"{"message": "Hola", "user_id": "u1"}"#).await;
        assert_eq!(
            response,
            json!({"type": "answer", "user_id": "u1", "answer": "Hola Ana"})
        );

        let response = exchange(&mut ws, r#"{"message": 1}"#).await;
        assert_eq!(response["error"], "invalid_payload");

        let response = exchange(&mut ws, r#"{"message": "Adiós", "user_id": "u1"}"#).await;
        assert_eq!(response["answer"], "Adiós Ana");

        let history = state.chat.store().snapshot("u1").await.unwrap();
        assert_eq!(history.len(), 5);
    }
}
