//! Request handler serving cached artifacts under `/pkg/<hash>`.
//!
//! Pure function of the request and the cache; binding it to a server or
//! a service worker is left to the embedder.

use crate::cache::ContentCache;
use bytes::Bytes;
use http::{Method, Request, Response, StatusCode, header};
use std::sync::Arc;

pub const PACKAGE_PREFIX: &str = "/pkg/";

pub struct PackageInterceptor {
    cache: Arc<dyn ContentCache>,
    prefix: String,
}

impl PackageInterceptor {
    pub fn new(cache: Arc<dyn ContentCache>) -> Self {
        Self {
            cache,
            prefix: PACKAGE_PREFIX.to_string(),
        }
    }

    /// Serve under a different path prefix (must start and end with `/`)
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Handle a request, or `None` when the path is not ours.
    pub fn handle<B>(&self, request: &Request<B>) -> Option<Response<Bytes>> {
        let hash = self.package_hash(request.uri().path())?;

        if *request.method() != Method::GET {
            return Some(status_only(StatusCode::FORBIDDEN));
        }

        match self.cache.lookup_by_hash(hash) {
            Ok(Some(entry)) => Some(
                Response::builder()
                    .status(StatusCode::OK)
                    .header(header::CONTENT_TYPE, "application/javascript")
                    .body(Bytes::from(entry.text))
                    .unwrap_or_else(|_| status_only(StatusCode::INTERNAL_SERVER_ERROR)),
            ),
            Ok(None) => Some(status_only(StatusCode::NOT_FOUND)),
            Err(e) => {
                tracing::warn!(hash, error = %e, "package lookup failed");
                Some(status_only(StatusCode::INTERNAL_SERVER_ERROR))
            }
        }
    }

    fn package_hash(&self, path: &str) -> Option<u64> {
        let rest = path.strip_prefix(self.prefix.as_str())?;
        if rest.is_empty() || rest.len() > 16 {
            return None;
        }
        u64::from_str_radix(rest, 16).ok()
    }
}

fn status_only(status: StatusCode) -> Response<Bytes> {
    let mut response = Response::new(Bytes::new());
    *response.status_mut() = status;
    response
}
