#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bulwark::http::{Body, BoxError, HttpService, boxed, empty_body, full_body};
use http::{Request, Response, StatusCode};
use http_body_util::BodyExt;
use tower::{Service, ServiceExt};

/// A handler answering every request with `status`, and the number of
/// requests it has seen.
pub fn counting_handler(status: StatusCode) -> (HttpService, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    let service = boxed(tower::service_fn(move |_req: Request<Body>| {
        seen.fetch_add(1, Ordering::SeqCst);
        async move {
            let mut response = Response::new(full_body("ok"));
            *response.status_mut() = status;
            Ok::<_, BoxError>(response)
        }
    }));
    (service, calls)
}

pub fn ok_handler() -> HttpService {
    counting_handler(StatusCode::OK).0
}

/// A handler that fails every request with a transport error.
pub fn failing_handler() -> HttpService {
    boxed(tower::service_fn(|_req: Request<Body>| async {
        Err::<Response<Body>, BoxError>("upstream connection reset".into())
    }))
}

/// `GET path` from client address `ip`.
pub fn request_from(ip: &str, path: &str) -> Request<Body> {
    Request::builder()
        .uri(path)
        .header("x-forwarded-for", ip)
        .body(empty_body())
        .unwrap()
}

pub fn request(path: &str) -> Request<Body> {
    request_from("203.0.113.10", path)
}

pub async fn send<S>(service: &mut S, req: Request<Body>) -> Response<Body>
where
    S: Service<Request<Body>, Response = Response<Body>, Error = BoxError>,
{
    service.ready().await.unwrap().call(req).await.unwrap()
}

pub fn header<'a>(response: &'a Response<Body>, name: &str) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

pub fn calls(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
}
