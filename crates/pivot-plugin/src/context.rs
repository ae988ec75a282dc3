use std::sync::{Arc, Mutex};

/// Read-only bindings describing one work unit, passed to every hook.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FlowContext {
    pub flow_id: u64,
    pub client_addr: String,
    pub server_host: String,
    pub server_port: u16,
    /// True once the flow runs inside an intercepted TLS tunnel.
    pub intercepted: bool,
}

/// Access log record assembled when a connection closes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AccessLogEntry {
    pub client_addr: String,
    pub method: String,
    pub path: String,
    pub server_host: String,
    pub server_port: u16,
    pub response_code: Option<u16>,
    pub response_reason: String,
    pub response_bytes: u64,
    pub connection_time_ms: u64,
    /// Failure class label when the connection ended in an error.
    pub failure: Option<&'static str>,
}

impl AccessLogEntry {
    /// One-line rendering. CONNECT tunnels have no request path or status
    /// to report, so they get the shorter form.
    pub fn format_line(&self) -> String {
        let failure = match self.failure {
            Some(kind) => format!(" - {kind}"),
            None => String::new(),
        };
        if self.method.eq_ignore_ascii_case("CONNECT") {
            format!(
                "{} - CONNECT {}:{} - {} bytes - {} ms{failure}",
                self.client_addr,
                self.server_host,
                self.server_port,
                self.response_bytes,
                self.connection_time_ms,
            )
        } else {
            format!(
                "{} - {} {}:{}{} - {} {} - {} bytes - {} ms{failure}",
                self.client_addr,
                self.method,
                self.server_host,
                self.server_port,
                self.path,
                self.response_code
                    .map_or_else(|| "-".to_string(), |code| code.to_string()),
                self.response_reason,
                self.response_bytes,
                self.connection_time_ms,
            )
        }
    }
}

/// Destination for access log records once the plugin chain has seen them.
pub trait AccessLogSink: Send + Sync {
    fn emit(&self, entry: &AccessLogEntry);
}

/// Default sink: one `tracing` info line per connection.
#[derive(Debug, Default)]
pub struct TracingAccessLog;

impl AccessLogSink for TracingAccessLog {
    fn emit(&self, entry: &AccessLogEntry) {
        tracing::info!(target: "pivot::access", "{}", entry.format_line());
    }
}

/// Capturing sink for tests.
#[derive(Debug, Default, Clone)]
pub struct VecAccessLog {
    entries: Arc<Mutex<Vec<AccessLogEntry>>>,
}

impl VecAccessLog {
    pub fn snapshot(&self) -> Vec<AccessLogEntry> {
        self.entries.lock().expect("access log lock poisoned").clone()
    }
}

impl AccessLogSink for VecAccessLog {
    fn emit(&self, entry: &AccessLogEntry) {
        self.entries
            .lock()
            .expect("access log lock poisoned")
            .push(entry.clone());
    }
}
