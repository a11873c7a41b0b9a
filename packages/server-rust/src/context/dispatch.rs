//! Dispatch classification carried in request extensions.

use std::sync::Arc;

use axum::http::{Extensions, Request};

use super::RequestContext;

/// Why a request is passing through the handler chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchKind {
    /// First dispatch of an inbound request.
    #[default]
    Request,
    /// Re-dispatch of a request whose async processing is still running.
    Async,
    /// Server-side include of another handler within the same request.
    Include,
    /// Server-side forward to another handler within the same request.
    Forward,
}

impl DispatchKind {
    /// Reads the dispatch kind from `req`, defaulting to [`DispatchKind::Request`].
    #[must_use]
    pub fn of<B>(req: &Request<B>) -> Self {
        req.extensions().get::<Self>().copied().unwrap_or_default()
    }

    /// Include and forward run inside a dispatch that already entered the
    /// request, so they neither enter nor exit.
    #[must_use]
    pub fn reuses_environment(self) -> bool {
        matches!(self, Self::Include | Self::Forward)
    }
}

/// The request context attached to a request, if one was created.
#[must_use]
pub fn request_context(extensions: &Extensions) -> Option<Arc<RequestContext>> {
    extensions.get::<Arc<RequestContext>>().cloned()
}

/// Prepares `req` as a sub-dispatch of the request owning `parent`.
///
/// The parent's request context is carried over so the sub-dispatch shares
/// its environment instead of building a new one.
#[must_use]
pub fn sub_dispatch<B>(parent: &Extensions, kind: DispatchKind, mut req: Request<B>) -> Request<B> {
    if let Some(ctx) = request_context(parent) {
        req.extensions_mut().insert(ctx);
    }
    req.extensions_mut().insert(kind);
    req
}
