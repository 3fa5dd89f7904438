use std::collections::HashMap;
use std::io::{Error as IoError, ErrorKind};
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::TryStreamExt;
use reqwest::{Client, Response, StatusCode, Url};
use tokio_util::io::StreamReader;

use crate::config::{BackoffConfig, BackoffState};
use crate::error::{transport_failure, TransferError, TransferResult};
use crate::runtime;

use super::info::{is_retry_status_code, RequestBody, RequestInfo};

#[derive(Clone, Debug)]
pub struct ResponsePayload {
    pub status: StatusCode,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl ResponsePayload {
    async fn from_response(response: Response) -> TransferResult<Self> {
        let status = response.status();
        let mut headers = HashMap::new();
        for (key, value) in response.headers().iter() {
            if let Ok(val) = value.to_str() {
                headers.insert(key.as_str().to_owned(), val.to_owned());
            }
        }
        let body = response
            .bytes()
            .await
            .map_err(|err| transport_failure(format!("failed to read response body: {err}")))?
            .to_vec();
        Ok(Self { status, headers, body })
    }
}

type DynByteStream = Pin<Box<dyn futures::stream::Stream<Item = Result<Bytes, IoError>> + Send>>;
pub type ByteStream = StreamReader<DynByteStream, Bytes>;

pub struct StreamingResponse {
    pub status: StatusCode,
    pub headers: HashMap<String, String>,
    pub reader: ByteStream,
}

#[derive(Debug)]
enum RequestError {
    Network(String),
    Timeout,
    Fatal(TransferError),
}

/// Executes the four primitive HTTP operations a transfer engine needs against a block-blob
/// style endpoint: probing remote size, ranged download, uploading one block, and committing
/// the final block list. A concrete type rather than a trait, matching the teacher's
/// `HttpClient`: `execute`'s per-call response type can't be made object-safe, so callers hold
/// an `Arc<ReqwestTransport>` directly instead of a `dyn` transport.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
    backoff: BackoffConfig,
}

impl ReqwestTransport {
    pub fn new(backoff: BackoffConfig) -> TransferResult<Self> {
        let client = Client::builder()
            .build()
            .map_err(|err| transport_failure(format!("failed to build HTTP client: {err}")))?;
        Ok(Self { client, backoff })
    }

    async fn try_once<O>(&self, info: &RequestInfo<O>) -> Result<ResponsePayload, RequestError> {
        let url = self.prepare_url(&info.url).map_err(RequestError::Fatal)?;
        let mut request_builder = self.client.request(info.method.clone(), url);

        for (header, value) in &info.headers {
            request_builder = request_builder.header(header, value);
        }
        request_builder = apply_body(request_builder, &info.body);

        let response = send_with_timeout(request_builder, info.timeout).await?;
        ResponsePayload::from_response(response)
            .await
            .map_err(RequestError::Fatal)
    }

    async fn try_stream_once<O>(
        &self,
        info: &RequestInfo<O>,
    ) -> Result<StreamingResponse, RequestError> {
        let url = self.prepare_url(&info.url).map_err(RequestError::Fatal)?;
        let mut request_builder = self.client.request(info.method.clone(), url);

        for (header, value) in &info.headers {
            request_builder = request_builder.header(header, value);
        }
        request_builder = apply_body(request_builder, &info.body);

        let response = send_with_timeout(request_builder, info.timeout).await?;
        let status = response.status();

        if !info.success_codes.contains(&status.as_u16()) {
            let payload = ResponsePayload::from_response(response)
                .await
                .map_err(RequestError::Fatal)?;
            return Err(RequestError::Fatal(map_failure(payload, info)));
        }

        let mut headers = HashMap::new();
        for (key, value) in response.headers().iter() {
            if let Ok(val) = value.to_str() {
                headers.insert(key.as_str().to_owned(), val.to_owned());
            }
        }

        let stream = response
            .bytes_stream()
            .map_err(|err| IoError::new(ErrorKind::Other, err));
        let stream: DynByteStream = Box::pin(stream);
        let reader = StreamReader::new(stream);

        Ok(StreamingResponse {
            status,
            headers,
            reader,
        })
    }

    fn prepare_url(&self, raw: &str) -> TransferResult<Url> {
        Url::parse(raw).map_err(|err| transport_failure(format!("invalid endpoint URL: {err}")))
    }

    pub async fn execute<O: Send + 'static>(&self, info: RequestInfo<O>) -> TransferResult<O> {
        let mut backoff = BackoffState::new(self.backoff.clone());

        loop {
            if !backoff.has_time_remaining() {
                return Err(transport_failure("request timed out"));
            }

            let delay = backoff.next_delay();
            if delay > Duration::from_millis(0) {
                runtime::sleep(delay).await;
            }

            match self.try_once(&info).await {
                Ok(payload) => {
                    if info.success_codes.contains(&payload.status.as_u16()) {
                        return (info.response_handler)(payload);
                    }

                    if is_retry_status_code(payload.status.as_u16(), &info.additional_retry_codes)
                        && backoff.can_retry()
                    {
                        continue;
                    }

                    return Err(map_failure(payload, &info));
                }
                Err(RequestError::Fatal(err)) => return Err(err),
                Err(RequestError::Timeout) => {
                    return Err(transport_failure("request timed out"));
                }
                Err(RequestError::Network(reason)) => {
                    if backoff.can_retry() {
                        continue;
                    }
                    return Err(transport_failure(format!(
                        "network failure after retries: {reason}"
                    )));
                }
            }
        }
    }

    pub async fn execute_streaming<O: Send + Sync + 'static>(
        &self,
        info: RequestInfo<O>,
    ) -> TransferResult<StreamingResponse> {
        let mut backoff = BackoffState::new(self.backoff.clone());

        loop {
            if !backoff.has_time_remaining() {
                return Err(transport_failure("request timed out"));
            }

            let delay = backoff.next_delay();
            if delay > Duration::from_millis(0) {
                runtime::sleep(delay).await;
            }

            match self.try_stream_once(&info).await {
                Ok(response) => return Ok(response),
                Err(RequestError::Fatal(err)) => return Err(err),
                Err(RequestError::Timeout) => {
                    return Err(transport_failure("request timed out"));
                }
                Err(RequestError::Network(reason)) => {
                    if backoff.can_retry() {
                        continue;
                    }
                    return Err(transport_failure(format!(
                        "network failure after retries: {reason}"
                    )));
                }
            }
        }
    }
}

fn apply_body(
    mut builder: reqwest::RequestBuilder,
    body: &RequestBody,
) -> reqwest::RequestBuilder {
    match body {
        RequestBody::Bytes(bytes) => {
            if !bytes.is_empty() {
                builder = builder.body(bytes.clone());
            }
        }
        RequestBody::Text(text) => {
            if !text.is_empty() {
                builder = builder.body(text.clone());
            }
        }
        RequestBody::Empty => {}
    }
    builder
}

async fn send_with_timeout(
    builder: reqwest::RequestBuilder,
    timeout: Duration,
) -> Result<Response, RequestError> {
    let send_future = builder.timeout(timeout).send();
    match runtime::with_timeout(send_future, timeout).await {
        Ok(result) => result.map_err(map_reqwest_error),
        Err(runtime::TimeoutError) => Err(RequestError::Timeout),
    }
}

fn map_reqwest_error(err: reqwest::Error) -> RequestError {
    if err.is_timeout() {
        RequestError::Timeout
    } else {
        RequestError::Network(err.to_string())
    }
}

fn map_failure<O>(payload: ResponsePayload, info: &RequestInfo<O>) -> TransferError {
    let base_error = transport_failure(format!(
        "request failed with status {}",
        payload.status
    ))
    .with_status(payload.status.as_u16())
    .with_server_response(String::from_utf8_lossy(&payload.body).to_string());

    if let Some(handler) = &info.error_handler {
        handler(payload, base_error)
    } else {
        base_error
    }
}
