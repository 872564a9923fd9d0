use anyhow::Context;
use futures::TryFutureExt;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt::Debug;
use url::Url;

/// JSON-RPC 1.0 client as spoken by bitcoind.
#[derive(Clone, Debug)]
pub struct Client {
    inner: reqwest::Client,
    url: Url,
}

impl Client {
    pub fn new(url: Url) -> Self {
        Self {
            inner: reqwest::Client::new(),
            url,
        }
    }

    pub async fn send<Req, Res>(&self, request: Request<Req>) -> anyhow::Result<Res>
    where
        Req: Debug + Serialize,
        Res: Debug + DeserializeOwned,
    {
        let mut url = self.url.clone();
        let username = url.username().to_owned();
        let password = url.password().map(ToOwned::to_owned);
        let _ = url.set_username("");
        let _ = url.set_password(None);

        let mut builder = self.inner.post(url).json(&request);
        if !username.is_empty() {
            builder = builder.basic_auth(username, password);
        }

        let response = builder
            .send()
            .map_err(ConnectionFailed)
            .await?
            .json::<Response<Res>>()
            .await
            .context("failed to deserialize JSON response as JSON-RPC response")?
            .into_result()
            .with_context(|| format!("JSON-RPC request {} failed", request.method))?;

        Ok(response)
    }
}

#[derive(Serialize, Debug, Clone)]
pub struct Request<T> {
    id: String,
    jsonrpc: String,
    method: String,
    params: T,
}

impl<T> Request<T> {
    pub fn new(method: &str, params: T) -> Self {
        Self {
            id: "court".to_owned(),
            jsonrpc: "1.0".to_owned(),
            method: method.to_owned(),
            params,
        }
    }
}

/// bitcoind always sends both fields, one of them `null`.
#[derive(Deserialize, Debug, PartialEq)]
struct Response<R> {
    result: Option<R>,
    error: Option<JsonRpcError>,
}

impl<R> Response<R> {
    fn into_result(self) -> Result<R, JsonRpcError> {
        match (self.result, self.error) {
            (_, Some(error)) => Err(error),
            (Some(result), None) => Ok(result),
            (None, None) => Err(JsonRpcError {
                code: 0,
                message: "response carries neither result nor error".to_owned(),
            }),
        }
    }
}

#[derive(Debug, Deserialize, thiserror::Error, PartialEq)]
#[error("JSON-RPC request failed with code {code}: {message}")]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
#[error("connection error: {0}")]
pub struct ConnectionFailed(#[from] reqwest::Error);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_successful_response() {
        let response = r#"{"result":"ok","error":null,"id":"court"}"#;

        let response = serde_json::from_str::<Response<String>>(response).unwrap();

        assert_eq!(response.into_result(), Ok("ok".to_owned()));
    }

    #[test]
    fn deserializes_error_response() {
        let response = r#"{"result":null,"error":{"code":-26,"message":"min relay fee not met"},"id":"court"}"#;

        let response = serde_json::from_str::<Response<String>>(response).unwrap();

        assert_eq!(
            response.into_result(),
            Err(JsonRpcError {
                code: -26,
                message: "min relay fee not met".to_owned()
            })
        );
    }
}
