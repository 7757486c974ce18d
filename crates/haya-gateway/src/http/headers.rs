//! Security headers applied to every HTTP response.
//!
//! Each response carries a fresh CSP nonce. Handlers that render inline
//! script/style (the chat UI) set their own CSP with the nonce they
//! embedded; this layer only fills CSP in when the handler did not.

use axum::{
    extract::Request,
    http::{header::HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use rand::RngCore;

pub const CSP_HEADER: &str = "content-security-policy";

/// A fresh base64url nonce for CSP script/style allowances.
pub fn make_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

pub fn csp_value(nonce: &str) -> String {
    format!(
        "default-src 'none'; script-src 'nonce-{nonce}'; \
         connect-src 'self' ws: wss:; style-src 'nonce-{nonce}'"
    )
}

pub async fn security_headers(req: Request, next: Next) -> Response {
    let mut resp = next.run(req).await;
    let headers = resp.headers_mut();

    let set = |headers: &mut axum::http::HeaderMap, name: &'static str, value: &'static str| {
        headers.insert(
            HeaderName::from_static(name),
            HeaderValue::from_static(value),
        );
    };
    set(headers, "x-content-type-options", "nosniff");
    set(headers, "x-frame-options", "DENY");
    set(headers, "x-xss-protection", "0");
    set(headers, "referrer-policy", "strict-origin-when-cross-origin");
    set(
        headers,
        "strict-transport-security",
        "max-age=31536000; includeSubDomains",
    );
    set(
        headers,
        "permissions-policy",
        "camera=(), microphone=(), geolocation=()",
    );

    if !headers.contains_key(CSP_HEADER) {
        let nonce = make_nonce();
        if let Ok(value) = HeaderValue::from_str(&csp_value(&nonce)) {
            headers.insert(HeaderName::from_static(CSP_HEADER), value);
        }
    }
    resp
}
