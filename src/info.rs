//! Read-only endpoints advertising the subscription URI.
//!
//! Responses are pure functions of the `Host` header and the configured
//! identifier.

use base64::{Engine, engine::general_purpose::STANDARD};
use http::{Method, StatusCode};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};

use crate::{
    config::Config,
    parse::{HttpRequest, HttpResponse},
};

/// Port advertised to clients; TLS is terminated in front of the relay on 443.
pub const ADVERTISED_PORT: u16 = 443;

/// Prefix of the URI fragment naming the profile.
pub const PROFILE_PREFIX: &str = "SAP-Direct-";

/// Everything outside the RFC 3986 unreserved set.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

const HTML: &str = "text/html; charset=utf-8";
const PLAIN: &str = "text/plain; charset=utf-8";

/// Which info page a request maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoRoute {
    /// `GET /`
    Landing,
    /// `GET /sub`
    Subscription,
    /// Everything else; answers `OK`.
    Health,
}

impl InfoRoute {
    pub fn for_request(req: &HttpRequest) -> Self {
        let is_get = req.method == Method::GET || req.method == Method::HEAD;
        match req.target.as_str() {
            "/" if is_get => Self::Landing,
            "/sub" if is_get => Self::Subscription,
            _ => Self::Health,
        }
    }
}

/// Builds the subscription URI advertised for `host`.
pub fn subscription_uri(identifier: &str, host: &str, ws_path: &str) -> String {
    format!(
        "vless://{identifier}@{host}:{ADVERTISED_PORT}?encryption=none&security=tls&type=ws&host={host}&path={path}#{PROFILE_PREFIX}{label}",
        path = utf8_percent_encode(ws_path, COMPONENT),
        label = first_label(host),
    )
}

/// The part of `host` before the first dot, or all of it.
pub fn first_label(host: &str) -> &str {
    host.split_once('.').map_or(host, |(label, _)| label)
}

/// Base64 body served on `/sub`.
pub fn subscription_body(uri: &str) -> String {
    STANDARD.encode(uri)
}

/// The HTML landing page.
pub fn landing_page(host: &str, uri: &str) -> String {
    let host = escape_html(host);
    let uri = escape_html(uri);
    format!(
        "<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"><title>{host}</title></head>\n<body>\n<h1>SAP Direct is Running</h1>\n<p>Host: {host}</p>\n<textarea rows=\"4\" cols=\"100\" readonly>{uri}</textarea>\n</body>\n</html>\n"
    )
}

/// Answers a request that was not spliced.
///
/// `/` and `/sub` need a usable `Host` header; without one they answer
/// `400 Bad Request`.
pub fn respond(req: &HttpRequest, config: &Config) -> HttpResponse {
    let route = InfoRoute::for_request(req);
    if route == InfoRoute::Health {
        return HttpResponse::new(StatusCode::OK).with_body(PLAIN, "OK");
    }
    let Some(host) = req.host() else {
        return HttpResponse::new(StatusCode::BAD_REQUEST).with_body(PLAIN, "missing host");
    };
    let uri = subscription_uri(&config.identifier, host, &config.ws_path);
    if route == InfoRoute::Landing {
        HttpResponse::new(StatusCode::OK).with_body(HTML, landing_page(host, &uri))
    } else {
        HttpResponse::new(StatusCode::OK).with_body(PLAIN, subscription_body(&uri))
    }
}

// `&` stays literal so the URI inside the textarea can be copied verbatim.
fn escape_html(s: &str) -> String {
    s.replace('<', "&lt;").replace('>', "&gt;")
}
