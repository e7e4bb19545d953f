use crate::http::error::{api_error_handler, route_error_handler, ApiError};
use hyper::http::HeaderValue;
use hyper::{Body, Method, Request, Response};
use routerify::ext::RequestExt;
use routerify::{Middleware, RequestInfo, Router, RouterBuilder, RouterService};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};

use std::future::Future;

static X_REQUEST_ID_HEADER_STR: &str = "x-request-id";

static X_REQUEST_ID_HEADER: hyper::header::HeaderName =
    hyper::header::HeaderName::from_static(X_REQUEST_ID_HEADER_STR);

#[derive(Debug, Default, Clone)]
struct RequestId(String);

/// Adds a tracing `info_span!` around the handler, logging request
/// start/end events (quietly for GETs with 2xx responses).
///
/// Usage: replace `my_handler` with `|r| request_span(r, my_handler)`.
/// Every wrapped handler gets the method, path and unique request id
/// attached to all of its log events.
pub async fn request_span<R, H>(request: Request<Body>, handler: H) -> R::Output
where
    R: Future<Output = Result<Response<Body>, ApiError>> + Send + 'static,
    H: FnOnce(Request<Body>) -> R + Send + Sync + 'static,
{
    let request_id = request.context::<RequestId>().unwrap_or_default().0;
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let request_span = info_span!("request", %method, %path, request_id = %request_id);

    let log_quietly = method == Method::GET;
    async move {
        if log_quietly {
            debug!("Handling request");
        } else {
            info!("Handling request");
        }

        // Errors are converted to responses here, inside the span, so
        // the error log events carry the request information too.
        let res = handler(request).await;

        match res {
            Ok(response) => {
                let response_status = response.status();
                if log_quietly && response_status.is_success() {
                    debug!("Request handled, status: {response_status}");
                } else {
                    info!("Request handled, status: {response_status}");
                }
                Ok(response)
            }
            Err(e) => Ok(api_error_handler(e)),
        }
    }
    .instrument(request_span)
    .await
}

async fn add_request_id_middleware(req: Request<Body>) -> Result<Request<Body>, ApiError> {
    let request_id = match req.headers().get(&X_REQUEST_ID_HEADER) {
        Some(request_id) => request_id
            .to_str()
            .map_err(|_| ApiError::BadRequest(anyhow::anyhow!("malformed x-request-id header")))?
            .to_string(),
        None => uuid::Uuid::new_v4().to_string(),
    };

    req.set_context(RequestId(request_id));

    Ok(req)
}

async fn add_request_id_header_to_response(
    mut res: Response<Body>,
    req_info: RequestInfo,
) -> Result<Response<Body>, ApiError> {
    if let Some(request_id) = req_info.context::<RequestId>() {
        if let Ok(request_header_value) = HeaderValue::from_str(&request_id.0) {
            res.headers_mut()
                .insert(&X_REQUEST_ID_HEADER, request_header_value);
        }
    }

    Ok(res)
}

pub fn make_router() -> RouterBuilder<hyper::Body, ApiError> {
    Router::builder()
        .middleware(Middleware::pre(add_request_id_middleware))
        .middleware(Middleware::post_with_info(
            add_request_id_header_to_response,
        ))
        .err_handler_with_info(|err, _info| route_error_handler(err))
}

/// Serve the built router until the cancellation token fires, then
/// finish in-flight requests and return.
pub async fn serve(
    router_builder: RouterBuilder<hyper::Body, ApiError>,
    listener: std::net::TcpListener,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let router = router_builder
        .build()
        .map_err(|err| anyhow::anyhow!("Failed to build http router: {err}"))?;
    let service = RouterService::new(router)
        .map_err(|err| anyhow::anyhow!("Failed to create http service: {err}"))?;

    listener.set_nonblocking(true)?;
    let server = hyper::Server::from_tcp(listener)?
        .serve(service)
        .with_graceful_shutdown(cancel.cancelled());

    info!("http server listening");
    server.await?;
    info!("http server has shut down");
    Ok(())
}
