//! axum transport for the live-signing OCSP responder (§6): GET with the
//! request base64-encoded into the path, POST with the raw DER body.
//!
//! Grounded on the houseme-acmex certificate endpoint's axum handler
//! shape (state extraction, typed error-to-status mapping), adapted to
//! RFC 6960's quirks: an inbound proxy may have turned a literal `+` in
//! the base64 path segment into a space, so that substitution is
//! reversed before decoding.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use sha2::{Digest, Sha256};

use super::LiveSigningOcspResponder;
use crate::error::CaError;

const MAX_POST_BODY: usize = 10_000;
const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

pub fn router(responder: Arc<LiveSigningOcspResponder>) -> Router {
    Router::new()
        .route("/", get(handle_get_root).post(handle_post))
        .route("/*path", get(handle_get_path).post(handle_post))
        .with_state(responder)
}

async fn handle_get_root(
    State(responder): State<Arc<LiveSigningOcspResponder>>,
    headers: HeaderMap,
) -> Response {
    serve(&responder, "", &headers).await
}

async fn handle_get_path(
    State(responder): State<Arc<LiveSigningOcspResponder>>,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> Response {
    serve(&responder, &path, &headers).await
}

async fn handle_post(
    State(responder): State<Arc<LiveSigningOcspResponder>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if body.len() > MAX_POST_BODY {
        return (StatusCode::BAD_REQUEST, "OCSP request body too large").into_response();
    }
    respond(&responder, body.to_vec(), &headers).await
}

async fn serve(responder: &LiveSigningOcspResponder, path: &str, headers: &HeaderMap) -> Response {
    // Some intermediaries percent-decode `+` into a literal space before
    // this handler ever sees the path; reverse that before base64.
    let unescaped = path.replace(' ', "+");
    let request_der = match BASE64.decode(unescaped.as_bytes()) {
        Ok(bytes) => bytes,
        Err(_) => return (StatusCode::BAD_REQUEST, "malformed base64 OCSP request").into_response(),
    };
    respond(responder, request_der, headers).await
}

async fn respond(responder: &LiveSigningOcspResponder, request_der: Vec<u8>, headers: &HeaderMap) -> Response {
    let cert_id = match super::parse_ocsp_request_cert_id(&request_der) {
        Ok(c) => c,
        Err(e) => return error_response(&e),
    };

    let der = match responder.respond_to_request_der(&request_der).await {
        Ok(der) => der,
        Err(e) => return error_response(&e),
    };

    let parsed = match super::parse_ocsp_response(&der) {
        Ok(p) => p,
        Err(e) => return error_response(&e),
    };

    let etag = format!("\"{}\"", hex::encode_upper(Sha256::digest(&der)));
    let edge_cache_tag = {
        let hex = cert_id.serial.to_hex();
        hex[hex.len() - 2..].to_string()
    };

    if let Some(if_none_match) = headers.get(axum::http::header::IF_NONE_MATCH) {
        if if_none_match.to_str().ok() == Some(etag.as_str()) {
            let mut response = StatusCode::NOT_MODIFIED.into_response();
            apply_cache_headers(response.headers_mut(), &parsed, &etag, &edge_cache_tag);
            return response;
        }
    }

    let max_age = (parsed.next_update - Utc::now()).num_seconds().max(0);
    let mut response = (StatusCode::OK, der).into_response();
    response
        .headers_mut()
        .insert(axum::http::header::CONTENT_TYPE, HeaderValue::from_static("application/ocsp-response"));
    apply_cache_headers(response.headers_mut(), &parsed, &etag, &edge_cache_tag);
    response.headers_mut().insert(
        axum::http::header::CACHE_CONTROL,
        HeaderValue::from_str(&format!("max-age={max_age}, public, no-transform, must-revalidate")).unwrap(),
    );
    response
}

fn apply_cache_headers(headers: &mut HeaderMap, parsed: &super::ParsedOcspResponse, etag: &str, edge_cache_tag: &str) {
    headers.insert(
        axum::http::header::LAST_MODIFIED,
        HeaderValue::from_str(&parsed.this_update.format(HTTP_DATE_FORMAT).to_string()).unwrap(),
    );
    headers.insert(
        axum::http::header::EXPIRES,
        HeaderValue::from_str(&parsed.next_update.format(HTTP_DATE_FORMAT).to_string()).unwrap(),
    );
    headers.insert(axum::http::header::ETAG, HeaderValue::from_str(etag).unwrap());
    headers.insert("Edge-Cache-Tag", HeaderValue::from_str(edge_cache_tag).unwrap());
}

/// Maps a [`CaError`] onto this endpoint's response codes. Unlike the
/// gRPC/generic HTTP mapping in `error.rs`, a lookup miss here is a
/// malformed-request 400, never a 404: this responder has no resource
/// map to 404 against, per the "404 never" rule in §6.
fn error_response(err: &CaError) -> Response {
    let status = if err.kind() == crate::error::ErrorKind::NotFound {
        StatusCode::BAD_REQUEST
    } else {
        err.into()
    };
    (status, err.to_string()).into_response()
}
