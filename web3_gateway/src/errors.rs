//! Utilities for logging errors for admins and displaying errors to users.

use crate::jsonrpc::{JsonRpcErrorData, JsonRpcForwardedResponse};
use axum::extract::ws::Message;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use derive_more::{Display, Error, From};
use redis_rate_limiter::redis::RedisError;
use redis_rate_limiter::RedisPoolError;
use serde_json::value::RawValue;
use std::borrow::Cow;
use std::sync::Arc;
use tokio::sync::AcquireError;
use tokio::task::JoinError;
use tracing::{debug, error, trace, warn};

pub type Web3GatewayResult<T> = Result<T, Web3GatewayError>;

/// The closed set of errors the proxy can hand to a client, plus the
/// infrastructure errors that get collapsed into them.
#[derive(Debug, Display, Error, From)]
pub enum Web3GatewayError {
    #[error(ignore)]
    Anyhow(anyhow::Error),
    Arc(Arc<Self>),
    #[error(ignore)]
    #[from(ignore)]
    BackendBadResponse(Cow<'static, str>),
    BackendOffline,
    BackendOverCapacity,
    #[display(fmt = "backend response larger than {} bytes", max)]
    #[error(ignore)]
    #[from(ignore)]
    BackendResponseTooLarge {
        max: u64,
    },
    #[error(ignore)]
    #[from(ignore)]
    BlockOutOfRange(Cow<'static, str>),
    #[display(fmt = "block range greater than {} max", max)]
    #[error(ignore)]
    #[from(ignore)]
    BlockRangeTooLarge {
        max: u64,
    },
    ConsensusGetReceiptsCantBeBatched,
    #[error(ignore)]
    #[from(ignore)]
    ConsensusGetReceiptsInvalidTarget(Cow<'static, str>),
    ContextCanceled,
    GatewayTimeout,
    #[error(ignore)]
    #[from(ignore)]
    InvalidParams(Cow<'static, str>),
    #[error(ignore)]
    #[from(ignore)]
    InvalidRequest(Cow<'static, str>),
    #[error(ignore)]
    #[from(ignore)]
    InvalidSender(Cow<'static, str>),
    Io(std::io::Error),
    JoinError(JoinError),
    #[display(fmt = "{:?}", _0)]
    #[error(ignore)]
    JsonRpcErrorData(JsonRpcErrorData),
    #[error(ignore)]
    #[from(ignore)]
    MethodNotWhitelisted(Cow<'static, str>),
    NoBackends,
    NotHealthy,
    ParseError,
    Redis(RedisError),
    RedisDeadpool(RedisPoolError),
    #[display(fmt = "request body larger than {} bytes", max)]
    #[error(ignore)]
    #[from(ignore)]
    RequestBodyTooLarge {
        max: usize,
    },
    Reqwest(reqwest::Error),
    OverRateLimit,
    OverSenderRateLimit,
    SemaphoreAcquireError(AcquireError),
    SerdeJson(serde_json::Error),
    /// simple way to return an error message to the user and an anyhow to our logs
    #[display(fmt = "{}, {}, {:?}", _0, _1, _2)]
    StatusCode(StatusCode, Cow<'static, str>, Option<anyhow::Error>),
    #[display(fmt = "{:?}", _0)]
    #[error(ignore)]
    Timeout(Option<tokio::time::error::Elapsed>),
    #[display(fmt = "batch has more than {} requests", max)]
    #[error(ignore)]
    #[from(ignore)]
    TooManyBatchRequests {
        max: usize,
    },
    TooManyRequests,
    Unauthorized,
    /// a single json object came back for a batched request. some vendors do
    /// this on partial errors and it must not be treated as a response
    UnexpectedJsonRpc,
    WsUpstream(tokio_tungstenite::tungstenite::Error),
    #[display(fmt = "{:?}, {}", _0, _1)]
    #[error(ignore)]
    WithContext(Option<Box<Web3GatewayError>>, Cow<'static, str>),
}

/// nginx-style code for "client closed the connection before we answered"
fn client_closed_request() -> StatusCode {
    StatusCode::from_u16(499).expect("499 is in range")
}

impl Web3GatewayError {
    pub fn as_response_parts(&self) -> (StatusCode, JsonRpcErrorData) {
        match self {
            Self::Anyhow(err) => {
                warn!(?err, "anyhow");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    JsonRpcErrorData::new(-32000, "internal error"),
                )
            }
            Self::Arc(err) => {
                // recurse
                err.as_response_parts()
            }
            Self::BackendBadResponse(msg) => {
                debug!(%msg, "BackendBadResponse");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    JsonRpcErrorData::new(-32013, "backend returned an invalid response"),
                )
            }
            Self::BackendOffline => {
                trace!("BackendOffline");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    JsonRpcErrorData::new(-32011, "backend offline"),
                )
            }
            Self::BackendOverCapacity => {
                trace!("BackendOverCapacity");
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    JsonRpcErrorData::new(-32012, "backend is over capacity"),
                )
            }
            Self::BackendResponseTooLarge { max } => {
                debug!(%max, "BackendResponseTooLarge");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    JsonRpcErrorData::new(-32020, "backend response too large"),
                )
            }
            Self::BlockOutOfRange(msg) => {
                trace!(%msg, "BlockOutOfRange");
                (
                    StatusCode::BAD_REQUEST,
                    JsonRpcErrorData::new(-32019, format!("block is out of range: {}", msg)),
                )
            }
            Self::BlockRangeTooLarge { max } => {
                trace!(%max, "BlockRangeTooLarge");
                (
                    StatusCode::BAD_REQUEST,
                    JsonRpcErrorData::new(-32019, format!("block range greater than {} max", max)),
                )
            }
            Self::ConsensusGetReceiptsCantBeBatched => {
                trace!("ConsensusGetReceiptsCantBeBatched");
                (
                    StatusCode::BAD_REQUEST,
                    JsonRpcErrorData::new(-32024, "consensus_getReceipts can't be batched"),
                )
            }
            Self::ConsensusGetReceiptsInvalidTarget(target) => {
                error!(%target, "ConsensusGetReceiptsInvalidTarget");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    JsonRpcErrorData::new(-32025, "unsupported consensus_getReceipts target"),
                )
            }
            Self::ContextCanceled => {
                trace!("ContextCanceled");
                (
                    client_closed_request(),
                    JsonRpcErrorData::new(-32023, "context canceled"),
                )
            }
            Self::GatewayTimeout => {
                debug!("GatewayTimeout");
                (
                    StatusCode::GATEWAY_TIMEOUT,
                    JsonRpcErrorData::new(-32015, "gateway timeout"),
                )
            }
            Self::InvalidParams(msg) => {
                trace!(%msg, "InvalidParams");
                (
                    StatusCode::BAD_REQUEST,
                    JsonRpcErrorData::new(-32602, format!("invalid params: {}", msg)),
                )
            }
            Self::InvalidRequest(msg) => {
                trace!(%msg, "InvalidRequest");
                (
                    StatusCode::BAD_REQUEST,
                    JsonRpcErrorData::new(-32600, format!("invalid request: {}", msg)),
                )
            }
            Self::InvalidSender(msg) => {
                trace!(%msg, "InvalidSender");
                (
                    StatusCode::BAD_REQUEST,
                    JsonRpcErrorData::new(-32602, format!("invalid sender: {}", msg)),
                )
            }
            Self::Io(err) => {
                warn!(?err, "io");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    JsonRpcErrorData::new(-32000, "io error"),
                )
            }
            Self::JoinError(err) => {
                let code = if err.is_cancelled() {
                    trace!(?err, "JoinError. likely shutting down");
                    StatusCode::BAD_GATEWAY
                } else {
                    warn!(?err, "JoinError");
                    StatusCode::INTERNAL_SERVER_ERROR
                };

                (
                    code,
                    JsonRpcErrorData::new(code.as_u16().into(), "unable to complete request"),
                )
            }
            Self::JsonRpcErrorData(err) => (StatusCode::OK, err.clone()),
            Self::MethodNotWhitelisted(method) => {
                trace!(%method, "MethodNotWhitelisted");
                (
                    StatusCode::FORBIDDEN,
                    JsonRpcErrorData::new(-32001, "rpc method is not whitelisted"),
                )
            }
            Self::NoBackends => {
                warn!("NoBackends");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    JsonRpcErrorData::new(-32010, "no backends available for method"),
                )
            }
            Self::NotHealthy => {
                warn!("NotHealthy");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    JsonRpcErrorData::new(-32018, "backend group is not healthy"),
                )
            }
            Self::ParseError => {
                trace!("ParseError");
                (
                    StatusCode::BAD_REQUEST,
                    JsonRpcErrorData::new(-32700, "parse error"),
                )
            }
            Self::Redis(err) => {
                warn!(?err, "redis");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    JsonRpcErrorData::new(-32000, "redis error"),
                )
            }
            Self::RedisDeadpool(err) => {
                warn!(?err, "redis deadpool");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    JsonRpcErrorData::new(-32000, "redis pool error"),
                )
            }
            Self::RequestBodyTooLarge { max } => {
                trace!(%max, "RequestBodyTooLarge");
                (
                    StatusCode::PAYLOAD_TOO_LARGE,
                    JsonRpcErrorData::new(-32021, "request body too large"),
                )
            }
            Self::Reqwest(err) => {
                debug!(?err, "reqwest");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    JsonRpcErrorData::new(-32000, "error connecting to backend"),
                )
            }
            Self::OverRateLimit => {
                trace!("OverRateLimit");
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    JsonRpcErrorData::new(-32016, "over rate limit"),
                )
            }
            Self::OverSenderRateLimit => {
                trace!("OverSenderRateLimit");
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    JsonRpcErrorData::new(-32017, "sender is over rate limit"),
                )
            }
            Self::SemaphoreAcquireError(err) => {
                warn!(?err, "semaphore acquire");
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    JsonRpcErrorData::new(-32022, "too many concurrent requests"),
                )
            }
            Self::SerdeJson(err) => {
                trace!(?err, "serde json");
                (
                    StatusCode::BAD_REQUEST,
                    JsonRpcErrorData::new(-32700, "parse error"),
                )
            }
            Self::StatusCode(status_code, err_msg, err) => {
                let code = status_code.as_u16();
                if (500..600).contains(&code) {
                    warn!(%err_msg, ?err, "server error {}", code);
                } else {
                    trace!(%err_msg, ?err, "user error {}", code);
                }

                (
                    *status_code,
                    JsonRpcErrorData::new(code.into(), err_msg.clone()),
                )
            }
            Self::Timeout(x) => {
                debug!(?x, "timeout");
                (
                    StatusCode::REQUEST_TIMEOUT,
                    JsonRpcErrorData::new(-32015, "request timed out"),
                )
            }
            Self::TooManyBatchRequests { max } => {
                trace!(%max, "TooManyBatchRequests");
                (
                    StatusCode::BAD_REQUEST,
                    JsonRpcErrorData::new(-32014, "too many RPC calls in batch request"),
                )
            }
            Self::TooManyRequests => {
                trace!("TooManyRequests");
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    JsonRpcErrorData::new(-32022, "too many concurrent requests"),
                )
            }
            Self::Unauthorized => {
                trace!("Unauthorized");
                (
                    StatusCode::UNAUTHORIZED,
                    JsonRpcErrorData::new(-32000, "unauthorized"),
                )
            }
            Self::UnexpectedJsonRpc => {
                debug!("UnexpectedJsonRpc");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    JsonRpcErrorData::new(-32013, "backend returned an invalid response"),
                )
            }
            Self::WsUpstream(err) => {
                debug!(?err, "ws upstream");
                (
                    StatusCode::BAD_GATEWAY,
                    JsonRpcErrorData::new(-32000, "websocket backend error"),
                )
            }
            Self::WithContext(err, msg) => match err {
                Some(err) => {
                    warn!(?err, %msg, "error w/ context");
                    err.as_response_parts()
                }
                None => {
                    warn!(%msg, "error w/ context");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        JsonRpcErrorData::new(-32000, msg.clone()),
                    )
                }
            },
        }
    }

    /// errors a backend may recover from on a later attempt
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::ContextCanceled
                | Self::BackendResponseTooLarge { .. }
                | Self::MethodNotWhitelisted(_)
                | Self::UnexpectedJsonRpc
                | Self::ConsensusGetReceiptsCantBeBatched
                | Self::ConsensusGetReceiptsInvalidTarget(_)
        )
    }

    /// errors where trying another backend cannot make progress
    pub fn is_short_circuit(&self) -> bool {
        matches!(
            self,
            Self::BackendResponseTooLarge { .. }
                | Self::MethodNotWhitelisted(_)
                | Self::RequestBodyTooLarge { .. }
                | Self::ContextCanceled
                | Self::ConsensusGetReceiptsCantBeBatched
                | Self::ConsensusGetReceiptsInvalidTarget(_)
        )
    }

    #[inline]
    pub fn into_response_with_id(self, id: Option<Box<RawValue>>) -> Response {
        let (status_code, response_data) = self.as_response_parts();

        let id = id.unwrap_or_else(crate::jsonrpc::null_id);

        let response = JsonRpcForwardedResponse::from_response_data(response_data, id);

        (status_code, Json(response)).into_response()
    }

    pub fn into_message(self, id: Option<Box<RawValue>>) -> Message {
        let (_, err) = self.as_response_parts();

        let id = id.unwrap_or_else(crate::jsonrpc::null_id);

        let err = JsonRpcForwardedResponse::from_response_data(err, id);

        let msg = serde_json::to_string(&err).expect("errors should always serialize to json");

        Message::Text(msg)
    }
}

impl From<tokio::time::error::Elapsed> for Web3GatewayError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        Self::Timeout(Some(err))
    }
}

impl IntoResponse for Web3GatewayError {
    #[inline]
    fn into_response(self) -> Response {
        self.into_response_with_id(Default::default())
    }
}

pub trait Web3GatewayErrorContext<T> {
    fn gateway_context<S: Into<Cow<'static, str>>>(self, msg: S) -> Result<T, Web3GatewayError>;
}

impl<T> Web3GatewayErrorContext<T> for Option<T> {
    fn gateway_context<S: Into<Cow<'static, str>>>(self, msg: S) -> Result<T, Web3GatewayError> {
        self.ok_or(Web3GatewayError::WithContext(None, msg.into()))
    }
}

impl<T, E> Web3GatewayErrorContext<T> for Result<T, E>
where
    E: Into<Web3GatewayError>,
{
    fn gateway_context<S: Into<Cow<'static, str>>>(self, msg: S) -> Result<T, Web3GatewayError> {
        self.map_err(|err| Web3GatewayError::WithContext(Some(Box::new(err.into())), msg.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_codes_are_stable() {
        let cases = [
            (Web3GatewayError::ParseError, -32700, 400),
            (
                Web3GatewayError::InvalidRequest("x".into()),
                -32600,
                400,
            ),
            (Web3GatewayError::InvalidParams("x".into()), -32602, 400),
            (
                Web3GatewayError::MethodNotWhitelisted("eth_foo".into()),
                -32001,
                403,
            ),
            (Web3GatewayError::NoBackends, -32010, 503),
            (Web3GatewayError::BackendOffline, -32011, 503),
            (Web3GatewayError::BackendOverCapacity, -32012, 429),
            (
                Web3GatewayError::BackendBadResponse("x".into()),
                -32013,
                500,
            ),
            (
                Web3GatewayError::TooManyBatchRequests { max: 100 },
                -32014,
                400,
            ),
            (Web3GatewayError::GatewayTimeout, -32015, 504),
            (Web3GatewayError::OverRateLimit, -32016, 429),
            (Web3GatewayError::OverSenderRateLimit, -32017, 429),
            (Web3GatewayError::NotHealthy, -32018, 503),
            (
                Web3GatewayError::BlockOutOfRange("too new".into()),
                -32019,
                400,
            ),
            (
                Web3GatewayError::BackendResponseTooLarge { max: 1024 },
                -32020,
                500,
            ),
            (
                Web3GatewayError::RequestBodyTooLarge { max: 1024 },
                -32021,
                413,
            ),
            (Web3GatewayError::TooManyRequests, -32022, 429),
            (Web3GatewayError::ContextCanceled, -32023, 499),
        ];

        for (err, rpc_code, http_code) in cases {
            let (status, data) = err.as_response_parts();
            assert_eq!(data.code, rpc_code);
            assert_eq!(status.as_u16(), http_code);
        }
    }

    #[test]
    fn block_range_message_includes_the_limit() {
        let err = Web3GatewayError::BlockRangeTooLarge { max: 10 };

        let (_, data) = err.as_response_parts();

        assert!(data.message.contains("block range greater than 10"));
    }

    #[test]
    fn short_circuit_set_matches_retry_set() {
        // everything that short-circuits a group is also not worth retrying on one backend
        let errs = [
            Web3GatewayError::BackendResponseTooLarge { max: 1 },
            Web3GatewayError::MethodNotWhitelisted("m".into()),
            Web3GatewayError::ContextCanceled,
            Web3GatewayError::ConsensusGetReceiptsCantBeBatched,
        ];

        for err in errs {
            assert!(err.is_short_circuit());
            assert!(!err.is_retryable());
        }

        assert!(Web3GatewayError::BackendOffline.is_retryable());
        assert!(!Web3GatewayError::BackendOffline.is_short_circuit());
    }
}
