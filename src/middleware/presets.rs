//! Ready-made limiters for endpoints with their own abuse profile.

use std::time::Duration;

use http::Request;

use super::RateLimit;
use crate::http::{Body, client_ip, query_param};

/// Login and credential endpoints: 5 attempts per 15 minutes per client
/// address and account. Successful attempts are not counted, so only
/// failures use up the allowance.
pub fn auth() -> RateLimit {
    RateLimit::new(Duration::from_secs(15 * 60), 5)
        .message("Too many authentication attempts, please try again later.")
        .skip_successful_requests(true)
        .key_fn(auth_key)
}

/// `auth:<client ip>:<email query parameter>`.
pub fn auth_key(req: &Request<Body>) -> String {
    let ip = client_ip(req).unwrap_or("unknown");
    let email = query_param(req, "email")
        .filter(|e| !e.is_empty())
        .unwrap_or("unknown");
    format!("auth:{ip}:{email}")
}

/// Uploads: 20 per hour per user.
pub fn file_upload() -> RateLimit {
    RateLimit::new(Duration::from_secs(60 * 60), 20)
        .message("Too many file uploads, please try again later.")
        .key_fn(upload_key)
}

/// `upload:<x-user-id>`, or `upload:anonymous`.
pub fn upload_key(req: &Request<Body>) -> String {
    format!("upload:{}", user_id(req).unwrap_or("anonymous"))
}

pub(crate) fn user_id(req: &Request<Body>) -> Option<&str> {
    req.headers()
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}
