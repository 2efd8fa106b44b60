//! Upstream HTTP transport (spec §4.4 implementation note): one
//! `wreq::Client` per (outbound-proxy, skip-tls-verify) setting,
//! cached so flipping either setting doesn't rebuild every client.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use wreq::Client;

pub struct UpstreamResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body_stream: tokio::sync::mpsc::Receiver<Bytes>,
}

type ClientKey = (Option<String>, bool);

pub struct UpstreamClient {
    connect_timeout: Duration,
    read_timeout: Duration,
    clients: Mutex<HashMap<ClientKey, Client>>,
}

impl UpstreamClient {
    pub fn new() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(86400),
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client_for(&self, proxy: Option<&str>, skip_tls_verify: bool) -> Result<Client, wreq::Error> {
        let key: ClientKey = (proxy.map(str::to_string), skip_tls_verify);
        let mut guard = self.clients.lock().unwrap();
        if let Some(client) = guard.get(&key) {
            return Ok(client.clone());
        }
        let mut builder = Client::builder()
            .connect_timeout(self.connect_timeout)
            .read_timeout(self.read_timeout)
            .cert_verification(!skip_tls_verify);
        if let Some(proxy) = proxy {
            builder = builder.proxy(wreq::Proxy::all(proxy)?);
        }
        let client = builder.build()?;
        guard.insert(key, client.clone());
        Ok(client)
    }

    /// Sends one request, always in streaming mode: non-streaming
    /// callers simply drain the channel to completion themselves
    /// before inspecting the body (spec §4.4 non-streaming copy).
    pub async fn send(
        &self,
        method: http::Method,
        url: &str,
        headers: &[(String, String)],
        body: Option<Bytes>,
        proxy: Option<&str>,
        skip_tls_verify: bool,
    ) -> Result<UpstreamResponse, wreq::Error> {
        let client = self.client_for(proxy, skip_tls_verify)?;
        let method = wreq_method(method);
        let mut builder = client.request(method, url);
        for (k, v) in headers {
            builder = builder.header(k, v);
        }
        if let Some(body) = body {
            builder = builder.body(body);
        }
        let resp = builder.send().await?;
        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
            .collect();

        let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(16);
        tokio::spawn(async move {
            let mut stream = resp.bytes_stream();
            while let Some(item) = stream.next().await {
                let Ok(chunk) = item else { break };
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
        });

        Ok(UpstreamResponse {
            status,
            headers,
            body_stream: rx,
        })
    }
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}

fn wreq_method(method: http::Method) -> wreq::Method {
    match method {
        http::Method::GET => wreq::Method::GET,
        http::Method::POST => wreq::Method::POST,
        http::Method::PUT => wreq::Method::PUT,
        http::Method::PATCH => wreq::Method::PATCH,
        http::Method::DELETE => wreq::Method::DELETE,
        other => wreq::Method::from_bytes(other.as_str().as_bytes()).unwrap_or(wreq::Method::GET),
    }
}
