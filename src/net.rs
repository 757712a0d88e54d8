//! Network seams: the WiFi station and a one-connection-at-a-time HTTP client.

use std::net::Ipv4Addr;

use crate::clock::Millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl LinkStatus {
    pub fn is_up(self) -> bool {
        self == LinkStatus::Connected
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LinkStatus::Disconnected => "disconnected",
            LinkStatus::Connecting => "connecting",
            LinkStatus::Connected => "connected",
        }
    }
}

/// WiFi station driver.
pub trait WifiLink {
    /// Current station status; must not block.
    fn status(&self) -> LinkStatus;
    fn ip(&self) -> Option<Ipv4Addr>;
    /// Kicks off one reconnect attempt and returns without waiting for it.
    fn request_reconnect(&mut self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone)]
pub struct HttpRequest<'a> {
    pub method: Method,
    pub url: &'a str,
    pub headers: &'a [(&'a str, &'a str)],
    pub body: &'a [u8],
    pub timeout: Millis,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Blocking HTTP client. Each call opens, uses and closes one connection and
/// must give up after `request.timeout`.
pub trait HttpTransport {
    fn request(&mut self, request: &HttpRequest<'_>) -> anyhow::Result<HttpResponse>;
}

/// Appends `key=value` to `url`, percent-encoding the value.
pub fn with_query(url: &str, key: &str, value: &str) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    let mut out = String::with_capacity(url.len() + key.len() + value.len() + 2);
    out.push_str(url);
    out.push(separator);
    out.push_str(key);
    out.push('=');
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}
