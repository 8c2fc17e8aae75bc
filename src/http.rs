use bytes::Bytes;
use http::{Request, Response};
use http_body_util::BodyExt;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type Body = http_body_util::combinators::BoxBody<Bytes, BoxError>;
pub type HttpService = tower::util::BoxService<Request<Body>, Response<Body>, BoxError>;

pub fn full_body(data: impl Into<Bytes>) -> Body {
    http_body_util::Full::new(data.into())
        .map_err(|e| match e {})
        .boxed()
}

pub fn empty_body() -> Body {
    http_body_util::Empty::new().map_err(|e| match e {}).boxed()
}

/// Serialize `value` into a JSON body.
pub fn json_body(value: &serde_json::Value) -> Body {
    full_body(value.to_string())
}

/// Box any compatible tower service into an [`HttpService`].
pub fn boxed<S>(service: S) -> HttpService
where
    S: tower::Service<Request<Body>, Response = Response<Body>, Error = BoxError>
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    tower::util::BoxService::new(service)
}

/// Client address as reported by the fronting proxy: the first entry of
/// `x-forwarded-for`, then `x-real-ip`.
pub fn client_ip<B>(req: &Request<B>) -> Option<&str> {
    let headers = req.headers();
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok())
        && let Some(first) = forwarded.split(',').map(str::trim).find(|s| !s.is_empty())
    {
        return Some(first);
    }
    headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Value of a query-string parameter, undecoded.
pub fn query_param<'a, B>(req: &'a Request<B>, name: &str) -> Option<&'a str> {
    req.uri().query()?.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        (k == name).then_some(v)
    })
}
