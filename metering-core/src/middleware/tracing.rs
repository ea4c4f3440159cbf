use axum::http::{HeaderName, HeaderValue};
use axum::{extract::Request, middleware::Next, response::Response};
use uuid::Uuid;

pub static REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Give every request an id and echo it on the response so callers can
/// correlate their logs with ours. An incoming id is kept as-is; only
/// requests without one get a fresh UUID.
pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let request_id = match req.headers().get(&REQUEST_ID_HEADER) {
        Some(incoming) => incoming.clone(),
        None => {
            let generated = Uuid::new_v4();
            // UUID text is always a valid header value
            let value = HeaderValue::from_str(&generated.to_string())
                .unwrap_or_else(|_| HeaderValue::from_static("unassigned"));
            req.headers_mut().insert(&REQUEST_ID_HEADER, value.clone());
            value
        }
    };

    let mut response = next.run(req).await;
    response.headers_mut().insert(&REQUEST_ID_HEADER, request_id);
    response
}
