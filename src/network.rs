//! Outbound network identity.
//!
//! A [`NetworkContext`] owns one HTTP client bound to one identity. Rotation
//! never mutates it: `rotate()` hands back a fresh context and the caller
//! swaps it in.

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::config::NetworkSettings;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },
    #[error("control port: {0}")]
    Control(String),
    #[error("control port I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// What a successful GET brings back.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: u16,
    /// URL after redirects.
    pub url: String,
    pub body: String,
}

/// The crawler's view of the network: fetch a page, or trade the current
/// identity for a new one.
pub trait Transport: Sized {
    async fn get(&self, url: &str) -> Result<FetchedPage, FetchError>;
    async fn rotate(&self) -> Result<Self, FetchError>;
}

pub struct NetworkContext {
    settings: NetworkSettings,
    client: reqwest::Client,
    generation: u32,
}

impl NetworkContext {
    pub fn new(settings: &NetworkSettings) -> Result<Self, FetchError> {
        Self::build(settings.clone(), 0)
    }

    fn build(settings: NetworkSettings, generation: u32) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .user_agent(&settings.user_agent)
            .timeout(Duration::from_secs(settings.request_timeout_secs));
        if let Some(proxy) = &settings.proxy {
            builder = builder.proxy(reqwest::Proxy::all(isolated_proxy_url(proxy, generation))?);
        }
        Ok(Self {
            client: builder.build()?,
            settings,
            generation,
        })
    }

    /// Ask the proxy's control port for a new circuit.
    async fn signal_new_identity(&self, addr: &str) -> Result<(), FetchError> {
        let stream = TcpStream::connect(addr).await?;
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        let password = self.settings.control_password.as_deref().unwrap_or_default();
        let commands = [
            format!("AUTHENTICATE \"{}\"\r\n", password.replace('"', "\\\"")),
            "SIGNAL NEWNYM\r\n".to_string(),
        ];
        for command in commands {
            write.write_all(command.as_bytes()).await?;
            let reply = lines.next_line().await?.unwrap_or_default();
            if !reply.starts_with("250") {
                return Err(FetchError::Control(reply));
            }
        }
        write.write_all(b"QUIT\r\n").await?;
        Ok(())
    }

    async fn exit_address(&self, echo_url: &str) -> Result<String, FetchError> {
        let page = self.get(echo_url).await?;
        Ok(page.body.trim().to_string())
    }
}

/// Tor builds a separate circuit per SOCKS username, so a new username per
/// generation is a new exit.
fn isolated_proxy_url(proxy: &str, generation: u32) -> String {
    match proxy.split_once("://") {
        Some((scheme, rest)) if scheme.starts_with("socks") && !rest.contains('@') => {
            format!("{}://rotation-{}:x@{}", scheme, generation, rest)
        }
        _ => proxy.to_string(),
    }
}

impl Transport for NetworkContext {
    async fn get(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        let final_url = response.url().to_string();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = response.text().await?;
        Ok(FetchedPage {
            status: status.as_u16(),
            url: final_url,
            body,
        })
    }

    async fn rotate(&self) -> Result<Self, FetchError> {
        if let Some(addr) = &self.settings.control_addr {
            self.signal_new_identity(addr).await?;
        }
        let next = Self::build(self.settings.clone(), self.generation + 1)?;
        match &self.settings.ip_echo_url {
            Some(echo) => match next.exit_address(echo).await {
                Ok(ip) => info!(generation = next.generation, %ip, "network identity rotated"),
                Err(e) => warn!(generation = next.generation, "rotated, exit address unknown: {}", e),
            },
            None => info!(generation = next.generation, "network identity rotated"),
        }
        Ok(next)
    }
}
