//! Tower middleware running every request inside its [`RequestContext`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::http::Request;
use axum::response::{IntoResponse, Response};
use tower::{Layer, Service};
use tracing::warn;

use super::DispatchKind;
use crate::host::HostContext;

/// Wraps services so each request is dispatched inside its request context.
///
/// Requests marked as include or forward pass straight through: they run
/// within a dispatch that already entered the request.
#[derive(Debug, Clone)]
pub struct RequestContextLayer {
    host: Arc<HostContext>,
}

impl RequestContextLayer {
    #[must_use]
    pub fn new(host: Arc<HostContext>) -> Self {
        Self { host }
    }
}

impl<S> Layer<S> for RequestContextLayer {
    type Service = RequestContextService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestContextService {
            inner,
            host: Arc::clone(&self.host),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestContextService<S> {
    inner: S,
    host: Arc<HostContext>,
}

impl<S, B> Service<Request<B>> for RequestContextService<S>
where
    S: Service<Request<B>, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    B: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<B>) -> Self::Future {
        // The ready clone must serve this call.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        if DispatchKind::of(&req).reuses_environment() {
            return Box::pin(inner.call(req));
        }

        let ctx = match self.host.request_context(&mut req) {
            Ok(ctx) => ctx,
            Err(err) => {
                warn!(error = %err, uri = %req.uri(), "cannot build request environment");
                return Box::pin(async move { Ok(err.into_response()) });
            }
        };

        Box::pin(async move {
            match ctx.dispatch(async move { inner.call(req).await }).await {
                Ok(result) => result,
                Err(err) => {
                    warn!(request_id = ctx.request_id(), error = %err, "request dispatch failed");
                    Ok(err.into_response())
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::{Extension, Router};
    use parking_lot::Mutex;
    use tower::ServiceExt;
    use vmrt_core::headers;

    use super::super::{ContextState, RequestContext};
    use super::*;
    use crate::context::dispatch::sub_dispatch;
    use crate::host::HostOptions;

    type Captured = Arc<Mutex<Option<Arc<RequestContext>>>>;

    async fn host() -> Arc<HostContext> {
        HostContext::init(HostOptions::for_tests()).await.unwrap()
    }

    fn app(host: &Arc<HostContext>, captured: &Captured) -> Router {
        let sync_host = Arc::clone(host);
        let sync_captured = Arc::clone(captured);
        let async_captured = Arc::clone(captured);

        Router::new()
            .route(
                "/sync",
                get(move |Extension(ctx): Extension<Arc<RequestContext>>| {
                    let host = Arc::clone(&sync_host);
                    let captured = Arc::clone(&sync_captured);
                    async move {
                        *captured.lock() = Some(Arc::clone(&ctx));
                        let active = host.registry().current();
                        assert!(Arc::ptr_eq(&active, ctx.environment()));
                        active.ticket().to_string()
                    }
                }),
            )
            .route(
                "/async",
                get(move |Extension(ctx): Extension<Arc<RequestContext>>| {
                    let captured = Arc::clone(&async_captured);
                    async move {
                        *captured.lock() = Some(Arc::clone(&ctx));
                        let completion = ctx.start_async().unwrap();
                        tokio::spawn(async move {
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            completion.complete();
                        });
                        "started"
                    }
                }),
            )
            .layer(RequestContextLayer::new(Arc::clone(host)))
    }

    fn request(path: &str) -> Request<Body> {
        Request::builder()
            .uri(path)
            .header(headers::API_TICKET, "ticket-1")
            .header(headers::REQUEST_ID, "req-1")
            .body(Body::empty())
            .unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn synchronous_request_completes_before_response() {
        let host = host().await;
        let captured = Captured::default();

        let response = app(&host, &captured).oneshot(request("/sync")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "ticket-1");

        let ctx = captured.lock().clone().unwrap();
        assert_eq!(ctx.state(), ContextState::Done);
        assert_eq!(ctx.completion_count(), 1);
        assert_eq!(ctx.enter_count(), ctx.exit_count());
        assert!(Arc::ptr_eq(&host.registry().current(), host.default_environment()));
    }

    #[tokio::test]
    async fn async_request_completes_after_signal() {
        let host = host().await;
        let captured = Captured::default();

        let response = app(&host, &captured).oneshot(request("/async")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let ctx = captured.lock().clone().unwrap();
        assert_eq!(ctx.state(), ContextState::AwaitingAsyncCompletion);
        assert_eq!(ctx.completion_count(), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(ctx.state(), ContextState::Done);
        assert_eq!(ctx.completion_count(), 1);
        assert_eq!(ctx.enter_count(), ctx.exit_count());
    }

    #[tokio::test]
    async fn missing_ticket_in_production_is_a_server_error() {
        let mut options = HostOptions::for_tests();
        options
            .env_vars
            .insert("VMRT_PARTITION".to_string(), "s~prod".to_string());
        let host = HostContext::init(options).await.unwrap();

        let response = app(&host, &Captured::default())
            .oneshot(Request::builder().uri("/sync").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn include_reuses_parent_context_without_entering() {
        let host = host().await;
        let captured = Captured::default();

        let mut parent = request("/sync");
        let parent_ctx = host.request_context(&mut parent).unwrap();

        let include = sub_dispatch(
            parent.extensions(),
            DispatchKind::Include,
            Request::builder().uri("/sync").body(Body::empty()).unwrap(),
        );

        // Run the include inside the parent's scope, as a nested dispatch would.
        let router = app(&host, &captured);
        let response = parent_ctx
            .scope(router.oneshot(include))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(body_text(response).await, "ticket-1");

        let seen = captured.lock().clone().unwrap();
        assert!(Arc::ptr_eq(&seen, &parent_ctx));
        assert_eq!(parent_ctx.enter_count(), 1);
        assert_eq!(parent_ctx.completion_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_dispatch_still_cleans_up() {
        let host = host().await;
        let captured = Captured::default();
        let slow_captured = Arc::clone(&captured);

        let router = Router::new()
            .route(
                "/slow",
                get(move |Extension(ctx): Extension<Arc<RequestContext>>| {
                    let captured = Arc::clone(&slow_captured);
                    async move {
                        *captured.lock() = Some(ctx);
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        "late"
                    }
                }),
            )
            .layer(RequestContextLayer::new(Arc::clone(&host)));

        let timed_out =
            tokio::time::timeout(Duration::from_secs(1), router.oneshot(request("/slow"))).await;
        assert!(timed_out.is_err());

        tokio::time::sleep(Duration::from_millis(10)).await;
        let ctx = captured.lock().clone().unwrap();
        assert_eq!(ctx.state(), ContextState::Done);
        assert_eq!(ctx.completion_count(), 1);
        assert_eq!(ctx.enter_count(), ctx.exit_count());
    }
}
