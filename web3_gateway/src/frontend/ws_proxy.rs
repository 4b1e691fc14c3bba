//! Bidirectional pump between a client websocket and a backend websocket.

use crate::errors::{Web3GatewayError, Web3GatewayResult};
use crate::jsonrpc::{JsonRpcForwardedResponse, JsonRpcRequest};
use crate::rpcs::one::{BackendWsStream, WsConnGuard};
use crate::stats::ProxyMetrics;
use axum::extract::ws::{CloseFrame as AxumCloseFrame, Message as AxumMessage, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use hashbrown::HashSet;
use serde_json::json;
use std::borrow::Cow;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as TsCloseFrame;
use tokio_tungstenite::tungstenite::Message as TsMessage;
use tracing::{debug, trace};

const WS_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

type ClientSink = Arc<Mutex<SplitSink<WebSocket, AxumMessage>>>;
type BackendSink = SplitSink<BackendWsStream, TsMessage>;

pub struct WsProxier {
    client: WebSocket,
    backend: BackendWsStream,
    backend_name: String,
    /// methods a client may call. None allows everything
    whitelist: Option<Arc<HashSet<String>>>,
    metrics: Arc<ProxyMetrics>,
    /// releases the backend's connection slot when the pump ends
    _guard: WsConnGuard,
}

impl WsProxier {
    pub fn new(
        client: WebSocket,
        backend: BackendWsStream,
        backend_name: String,
        whitelist: Option<Arc<HashSet<String>>>,
        metrics: Arc<ProxyMetrics>,
        guard: WsConnGuard,
    ) -> Self {
        Self {
            client,
            backend,
            backend_name,
            whitelist,
            metrics,
            _guard: guard,
        }
    }

    /// run both pumps until either side closes or errors
    pub async fn run(self) -> Web3GatewayResult<()> {
        let (client_sink, client_stream) = self.client.split();
        let (backend_sink, backend_stream) = self.backend.split();

        // the client sink is written by both pumps, so writes serialize here
        let client_sink: ClientSink = Arc::new(Mutex::new(client_sink));

        let backend_name = self.backend_name.clone();

        let client_to_backend = pump_client(
            client_stream,
            backend_sink,
            client_sink.clone(),
            self.whitelist.clone(),
            self.metrics.clone(),
        );

        let backend_to_client = pump_backend(
            backend_stream,
            client_sink,
            backend_name,
            self.metrics.clone(),
        );

        // when one direction ends the other is dropped, closing its socket
        tokio::select! {
            x = client_to_backend => x,
            x = backend_to_client => x,
        }
    }
}

async fn send_backend(sink: &mut BackendSink, msg: TsMessage) -> Web3GatewayResult<()> {
    timeout(WS_WRITE_TIMEOUT, sink.send(msg))
        .await?
        .map_err(Web3GatewayError::WsUpstream)
}

async fn send_client(sink: &ClientSink, msg: AxumMessage) -> Web3GatewayResult<()> {
    let mut sink = sink.lock().await;

    timeout(WS_WRITE_TIMEOUT, sink.send(msg))
        .await?
        .map_err(|err| Web3GatewayError::Anyhow(anyhow::anyhow!(err)))
}

/// client -> backend. the allow-list is enforced here so disallowed methods
/// never leave the proxy
async fn pump_client(
    mut client_stream: SplitStream<WebSocket>,
    mut backend_sink: BackendSink,
    client_sink: ClientSink,
    whitelist: Option<Arc<HashSet<String>>>,
    metrics: Arc<ProxyMetrics>,
) -> Web3GatewayResult<()> {
    loop {
        let msg = match client_stream.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(err)) => {
                // synthesize a close so the backend isn't left hanging
                let _ = send_backend(&mut backend_sink, TsMessage::Close(None)).await;
                return Err(Web3GatewayError::Anyhow(anyhow::anyhow!(err)));
            }
            None => {
                let _ = send_backend(&mut backend_sink, TsMessage::Close(None)).await;
                return Ok(());
            }
        };

        metrics.ws_message(true);

        match msg {
            AxumMessage::Text(text) => {
                match screen_payload(text.as_bytes(), &whitelist) {
                    Screened::Forward => {
                        send_backend(&mut backend_sink, TsMessage::Text(text)).await?
                    }
                    Screened::Reply(reply) => send_client(&client_sink, reply).await?,
                }
            }
            AxumMessage::Binary(bytes) => match screen_payload(&bytes, &whitelist) {
                Screened::Forward => {
                    send_backend(&mut backend_sink, TsMessage::Binary(bytes)).await?
                }
                Screened::Reply(reply) => send_client(&client_sink, reply).await?,
            },
            AxumMessage::Ping(payload) => {
                send_backend(&mut backend_sink, TsMessage::Ping(payload)).await?
            }
            AxumMessage::Pong(payload) => {
                send_backend(&mut backend_sink, TsMessage::Pong(payload)).await?
            }
            AxumMessage::Close(frame) => {
                trace!("client closed");
                let _ = send_backend(&mut backend_sink, TsMessage::Close(axum_close_to_ts(frame)))
                    .await;
                return Ok(());
            }
        }
    }
}

enum Screened {
    Forward,
    Reply(AxumMessage),
}

fn screen_payload(payload: &[u8], whitelist: &Option<Arc<HashSet<String>>>) -> Screened {
    let req: JsonRpcRequest = match serde_json::from_slice(payload) {
        Ok(req) => req,
        Err(_) => {
            return Screened::Reply(Web3GatewayError::ParseError.into_message(None));
        }
    };

    // answered locally, same as over http
    if req.method == "eth_accounts" {
        let res = JsonRpcForwardedResponse::from_value(json!([]), req.id);

        let msg = serde_json::to_string(&res).expect("this should always serialize");

        return Screened::Reply(AxumMessage::Text(msg));
    }

    if let Some(whitelist) = whitelist {
        if !whitelist.contains(&req.method) {
            debug!(method=%req.method, "ws method not allowed");

            return Screened::Reply(
                Web3GatewayError::MethodNotWhitelisted(req.method.into())
                    .into_message(Some(req.id)),
            );
        }
    }

    Screened::Forward
}

/// backend -> client. frames are parsed only to count rpc errors
async fn pump_backend(
    mut backend_stream: SplitStream<BackendWsStream>,
    client_sink: ClientSink,
    backend_name: String,
    metrics: Arc<ProxyMetrics>,
) -> Web3GatewayResult<()> {
    loop {
        let msg = match backend_stream.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(err)) => {
                let _ = send_client(&client_sink, AxumMessage::Close(None)).await;
                return Err(Web3GatewayError::WsUpstream(err));
            }
            None => {
                let _ = send_client(&client_sink, AxumMessage::Close(None)).await;
                return Ok(());
            }
        };

        metrics.ws_message(false);

        match msg {
            TsMessage::Text(text) => {
                if let Ok(res) = serde_json::from_str::<JsonRpcForwardedResponse>(&text) {
                    if let Some(err) = &res.error {
                        metrics.rpc_error(&backend_name, err.code);
                    }
                }

                send_client(&client_sink, AxumMessage::Text(text)).await?;
            }
            TsMessage::Binary(bytes) => {
                send_client(&client_sink, AxumMessage::Binary(bytes)).await?;
            }
            TsMessage::Ping(payload) => {
                send_client(&client_sink, AxumMessage::Ping(payload)).await?;
            }
            TsMessage::Pong(payload) => {
                send_client(&client_sink, AxumMessage::Pong(payload)).await?;
            }
            TsMessage::Close(frame) => {
                trace!("backend closed");
                let _ = send_client(&client_sink, AxumMessage::Close(ts_close_to_axum(frame)))
                    .await;
                return Ok(());
            }
            // raw frames never come out of a read
            TsMessage::Frame(_) => {}
        }
    }
}

fn ts_close_to_axum(frame: Option<TsCloseFrame>) -> Option<AxumCloseFrame<'static>> {
    frame.map(|frame| AxumCloseFrame {
        code: frame.code.into(),
        reason: Cow::Owned(frame.reason.into_owned()),
    })
}

fn axum_close_to_ts(frame: Option<AxumCloseFrame>) -> Option<TsCloseFrame<'static>> {
    frame.map(|frame| TsCloseFrame {
        code: CloseCode::from(frame.code),
        reason: Cow::Owned(frame.reason.into_owned()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn whitelist(methods: &[&str]) -> Option<Arc<HashSet<String>>> {
        Some(Arc::new(methods.iter().map(|m| m.to_string()).collect()))
    }

    #[test]
    fn allowed_methods_forward() {
        let payload = br#"{"jsonrpc":"2.0","id":1,"method":"eth_subscribe","params":["newHeads"]}"#;

        assert!(matches!(
            screen_payload(payload, &whitelist(&["eth_subscribe"])),
            Screened::Forward
        ));
    }

    #[test]
    fn disallowed_methods_get_a_local_error_frame() {
        let payload = br#"{"jsonrpc":"2.0","id":7,"method":"debug_traceCall","params":[]}"#;

        match screen_payload(payload, &whitelist(&["eth_subscribe"])) {
            Screened::Reply(AxumMessage::Text(text)) => {
                assert!(text.contains("not whitelisted"));
                assert!(text.contains(r#""id":7"#));
            }
            other => panic!("expected a reply, got {:?}", matches!(other, Screened::Forward)),
        }
    }

    #[test]
    fn eth_accounts_is_answered_locally() {
        let payload = br#"{"jsonrpc":"2.0","id":2,"method":"eth_accounts","params":[]}"#;

        match screen_payload(payload, &None) {
            Screened::Reply(AxumMessage::Text(text)) => {
                assert!(text.contains(r#""result":[]"#));
            }
            _ => panic!("expected a reply"),
        }
    }

    #[test]
    fn unparseable_frames_get_a_parse_error() {
        match screen_payload(b"not json", &None) {
            Screened::Reply(AxumMessage::Text(text)) => {
                assert!(text.contains("-32700"));
            }
            _ => panic!("expected a reply"),
        }
    }
}
