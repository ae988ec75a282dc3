use std::future::Future;
use std::io;
use std::pin::Pin;

use pivot_http::{build_response, RequestHead};
use tokio::io::AsyncWriteExt;

use crate::conn::IoStream;

/// Collaborator for requests whose target is authority-less origin-form,
/// i.e. the client treated the proxy as a direct server. The proxy hands
/// over the parsed request and the client connection and forgets about the
/// work unit.
pub trait OriginResponder: Send + Sync {
    fn handle(
        &self,
        request: RequestHead,
        client: IoStream,
    ) -> Pin<Box<dyn Future<Output = io::Result<()>> + Send>>;
}

/// Default responder when no web server is mounted: a plain 404.
#[derive(Debug, Default)]
pub struct NotFoundResponder;

impl OriginResponder for NotFoundResponder {
    fn handle(
        &self,
        _request: RequestHead,
        mut client: IoStream,
    ) -> Pin<Box<dyn Future<Output = io::Result<()>> + Send>> {
        Box::pin(async move {
            let response = build_response(404, "Not Found", "not found");
            client.write_all(&response).await?;
            client.shutdown().await
        })
    }
}
