use pivot_http::{Header, RequestHead};
use regex::Regex;
use serde::Deserialize;

use crate::{FlowContext, PluginCapabilities, PluginError, ProxyPlugin, RequestAction};

#[derive(Debug, Deserialize)]
struct UrlFilterRule {
    regex: String,
    #[serde(default = "default_block_status")]
    status: u16,
}

fn default_block_status() -> u16 {
    404
}

#[derive(Debug, Deserialize)]
struct UrlFilterSettings {
    #[serde(default)]
    rules: Vec<UrlFilterRule>,
}

/// Drops traffic whose `host + path` URL matches one of the configured
/// regular expressions; a starting point for ad or tracker filtering.
#[derive(Debug)]
pub struct UrlFilterPlugin {
    rules: Vec<(Regex, u16)>,
}

impl UrlFilterPlugin {
    pub fn from_settings(settings: &serde_json::Value) -> Result<Self, PluginError> {
        let parsed: UrlFilterSettings = serde_json::from_value(settings.clone())
            .map_err(|error| PluginError(format!("invalid url_filter settings: {error}")))?;
        let mut rules = Vec::with_capacity(parsed.rules.len());
        for rule in parsed.rules {
            let regex = Regex::new(&rule.regex).map_err(|error| {
                PluginError(format!("invalid url_filter regex {:?}: {error}", rule.regex))
            })?;
            rules.push((regex, rule.status));
        }
        Ok(Self { rules })
    }
}

impl ProxyPlugin for UrlFilterPlugin {
    fn name(&self) -> &str {
        "url_filter"
    }

    fn capabilities(&self) -> PluginCapabilities {
        PluginCapabilities::CLIENT_REQUEST
    }

    fn on_client_request(
        &self,
        context: &FlowContext,
        request: &mut RequestHead,
    ) -> Result<RequestAction, PluginError> {
        let host = request
            .headers
            .first("host")
            .map(str::to_string)
            .unwrap_or_else(|| context.server_host.clone());
        let url = format!("{host}{}", request.target);

        for (rule_number, (regex, status)) in self.rules.iter().enumerate() {
            if regex.is_match(&url) {
                tracing::info!(
                    url = %url,
                    status = *status,
                    rule = rule_number + 1,
                    "request blocked by url filter"
                );
                return Ok(RequestAction::Reject {
                    status: *status,
                    reason: "Blocked".to_string(),
                });
            }
        }
        Ok(RequestAction::Continue)
    }
}

#[derive(Debug, Deserialize)]
struct AppendHeadersSettings {
    #[serde(default)]
    headers: Vec<(String, String)>,
}

/// Appends fixed headers to every client request before dispatch.
pub struct AppendHeadersPlugin {
    headers: Vec<(String, String)>,
}

impl AppendHeadersPlugin {
    pub fn from_settings(settings: &serde_json::Value) -> Result<Self, PluginError> {
        let parsed: AppendHeadersSettings = serde_json::from_value(settings.clone())
            .map_err(|error| PluginError(format!("invalid append_headers settings: {error}")))?;
        Ok(Self {
            headers: parsed.headers,
        })
    }
}

impl ProxyPlugin for AppendHeadersPlugin {
    fn name(&self) -> &str {
        "append_headers"
    }

    fn capabilities(&self) -> PluginCapabilities {
        PluginCapabilities::CLIENT_REQUEST
    }

    fn on_client_request(
        &self,
        _context: &FlowContext,
        request: &mut RequestHead,
    ) -> Result<RequestAction, PluginError> {
        for (name, value) in &self.headers {
            request.headers.push(Header::new(name.clone(), value.clone()));
        }
        Ok(RequestAction::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pivot_http::{parse_request_head, ParseLimits};
    use serde_json::json;

    fn request(target: &str) -> RequestHead {
        let raw = format!("GET {target} HTTP/1.1\r\nHost: ads.example.test\r\n\r\n");
        parse_request_head(raw.as_bytes(), ParseLimits::default()).expect("parse")
    }

    #[test]
    fn url_filter_blocks_matching_urls_with_configured_status() {
        let plugin = UrlFilterPlugin::from_settings(&json!({
            "rules": [{"regex": "ads\\..*/banner", "status": 403}]
        }))
        .expect("build");

        let mut blocked = request("/banner.png");
        let outcome = plugin
            .on_client_request(&FlowContext::default(), &mut blocked)
            .expect("hook");
        assert!(matches!(outcome, RequestAction::Reject { status: 403, .. }));

        let mut allowed = request("/index.html");
        let outcome = plugin
            .on_client_request(&FlowContext::default(), &mut allowed)
            .expect("hook");
        assert!(matches!(outcome, RequestAction::Continue));
    }

    #[test]
    fn url_filter_rejects_bad_regex_settings() {
        let error = UrlFilterPlugin::from_settings(&json!({
            "rules": [{"regex": "("}]
        }))
        .expect_err("must fail");
        assert!(error.0.contains("invalid url_filter regex"));
    }

    #[test]
    fn append_headers_adds_configured_pairs() {
        let plugin = AppendHeadersPlugin::from_settings(&json!({
            "headers": [["X-Seen", "1"]]
        }))
        .expect("build");

        let mut head = request("/");
        plugin
            .on_client_request(&FlowContext::default(), &mut head)
            .expect("hook");
        assert_eq!(head.headers.first("x-seen"), Some("1"));
    }
}
