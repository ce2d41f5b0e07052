use crate::error::{CfError, CfResult};
use anyhow::Result;
use log::debug;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, USER_AGENT};
use reqwest::{Client, Method, Request, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::error::Error;
use std::time::Duration;

#[derive(Clone)]
pub struct JsonApi {
    client: Client,
    base: Url,
}

impl JsonApi {
    pub fn token(base: &str, token: &str, allow_invalid_certs: bool) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, "bg-change-stack/1.0".parse()?);
        headers.insert(AUTHORIZATION, token.parse()?);
        headers.insert(ACCEPT, "application/json; charset=utf-8".parse()?);

        let client = Client::builder()
            .danger_accept_invalid_certs(allow_invalid_certs)
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base: base.parse()?,
        })
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> CfResult<T> {
        self.req::<T, ()>(Method::GET, path, None).await
    }

    pub async fn post<T: DeserializeOwned, R: Serialize>(&self, path: &str, body: R) -> CfResult<T> {
        self.req(Method::POST, path, Some(body)).await
    }

    pub async fn patch<T: DeserializeOwned, R: Serialize>(
        &self,
        path: &str,
        body: R,
    ) -> CfResult<T> {
        self.req(Method::PATCH, path, Some(body)).await
    }

    pub fn build_req(
        &self,
        method: Method,
        path: &str,
        body: Option<impl Serialize>,
    ) -> CfResult<Request> {
        let url = self
            .base
            .join(path)
            .map_err(|e| CfError::Transport(format!("invalid path {}: {}", path, e)))?;
        let req = self.client.request(method.clone(), url);
        let req = if let Some(body) = body {
            let body = serde_json::to_string(&body).map_err(|e| CfError::Encode {
                path: path.to_string(),
                message: e.to_string(),
            })?;
            debug!(">> {} {}: {}", method, path, &body);
            req.header(CONTENT_TYPE, "application/json; charset=utf-8")
                .body(body)
        } else {
            debug!(">> {} {}", method, path);
            req
        };
        req.build()
            .map_err(|e| CfError::Transport(format!("failed to build request: {}", e)))
    }

    pub async fn req<T: DeserializeOwned, R: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<R>,
    ) -> CfResult<T> {
        let req = self.build_req(method.clone(), path, body)?;
        let rsp = self.client.execute(req).await.map_err(|e| {
            CfError::Transport(format!(
                "Failed to send request: {} source={}",
                e,
                e.source()
                    .map(|x| x.to_string())
                    .unwrap_or_else(|| "None".to_owned())
            ))
        })?;

        let status = rsp.status();
        let text = rsp
            .text()
            .await
            .map_err(|e| CfError::Transport(format!("Failed to read response: {}", e)))?;
        #[cfg(debug_assertions)]
        debug!("<< {}", text);
        if status.is_success() {
            serde_json::from_str(&text).map_err(|e| CfError::Decode {
                path: path.to_string(),
                message: format!("{}: {}", e, text),
            })
        } else {
            Err(CfError::Remote {
                method: method.to_string(),
                path: path.to_string(),
                status: status.as_u16(),
                body: text,
            })
        }
    }
}
