use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use pivot_http::RequestHead;

/// Credential check applied to `Proxy-Authorization` before any request is
/// routed. Built once from the configured `user:pass` string.
#[derive(Debug, Clone)]
pub struct BasicAuthGuard {
    expected: String,
}

impl BasicAuthGuard {
    pub fn new(credentials: &str) -> Self {
        Self {
            expected: STANDARD.encode(credentials),
        }
    }

    /// True when the request carries matching Basic credentials.
    pub fn allows(&self, head: &RequestHead) -> bool {
        let Some(value) = head.headers.first("proxy-authorization") else {
            return false;
        };
        let mut parts = value.trim().splitn(2, ' ');
        let scheme = parts.next().unwrap_or("");
        let token = parts.next().unwrap_or("").trim();
        scheme.eq_ignore_ascii_case("basic") && constant_time_eq(token, &self.expected)
    }
}

/// The 407 challenge sent when credentials are missing or wrong.
pub fn basic_auth_challenge() -> Vec<u8> {
    b"HTTP/1.1 407 Proxy Authentication Required\r\n\
      Proxy-Authenticate: Basic realm=\"pivot\"\r\n\
      Connection: close\r\n\
      Content-Length: 0\r\n\r\n"
        .to_vec()
}

fn constant_time_eq(left: &str, right: &str) -> bool {
    let left = left.as_bytes();
    let right = right.as_bytes();
    if left.len() != right.len() {
        return false;
    }
    left.iter()
        .zip(right.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}
