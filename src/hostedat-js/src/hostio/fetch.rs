//! Outbound HTTP for the `fetch` binding: SSRF-checked dialing,
//! manual redirect handling with cross-origin auth stripping, and
//! full-body buffering.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use hostedat_js_runtime::host::HttpRequest;

use super::ssrf;

const MAX_REDIRECTS: usize = 20;

/// Runs one logical fetch, following up to 20 redirect hops. Every hop
/// re-resolves and re-validates its target, and the connection dials
/// the validated address so DNS cannot rebind between check and dial.
pub(crate) async fn run_fetch(
    req: HttpRequest,
    max_body_bytes: usize,
) -> Result<serde_json::Value, String> {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(req.timeout_ms.max(1));

    let mut method = req.method.clone();
    let mut url = url::Url::parse(&req.url).map_err(|e| format!("invalid URL: {e}"))?;
    let mut headers = req.headers.clone();
    let mut body = Some(req.body.clone());
    let origin = url.origin();
    let mut redirected = false;

    for _hop in 0..=MAX_REDIRECTS {
        let host = url
            .host_str()
            .ok_or_else(|| "URL has no host".to_string())?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| "URL has no usable port".to_string())?;

        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .ok_or_else(|| "fetch timed out".to_string())?;

        let addr = ssrf::resolve_checked(&host, port).await?;

        // Redirects are followed by hand, so the client itself never
        // chases one.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .resolve(&host, addr)
            .timeout(remaining)
            .build()
            .map_err(|e| format!("failed to build HTTP client: {e}"))?;

        let method_parsed = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| format!("invalid method {method:?}"))?;
        let mut builder = client.request(method_parsed, url.clone());
        for (name, value) in &headers {
            builder = builder.header(name, value);
        }
        if let Some(bytes) = &body {
            if !bytes.is_empty() {
                builder = builder.body(bytes.clone());
            }
        }

        let response = builder
            .send()
            .await
            .map_err(|e| format!("fetch failed: {e}"))?;

        let status = response.status();
        if status.is_redirection() {
            let Some(location) = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
            else {
                // no Location: deliver the 3xx as-is
                return serialise_response(response, &url, redirected, max_body_bytes).await;
            };
            let next = url
                .join(location)
                .map_err(|e| format!("invalid redirect target: {e}"))?;

            // cross-origin hops must not leak credentials
            if next.origin() != origin {
                headers.retain(|(name, _)| !name.eq_ignore_ascii_case("authorization"));
            }
            // 303 (and historical 301/302 on POST) downgrade to GET
            if status == reqwest::StatusCode::SEE_OTHER
                || ((status == reqwest::StatusCode::MOVED_PERMANENTLY
                    || status == reqwest::StatusCode::FOUND)
                    && method.eq_ignore_ascii_case("POST"))
            {
                method = "GET".to_string();
                body = None;
                headers.retain(|(name, _)| {
                    !name.eq_ignore_ascii_case("content-type")
                        && !name.eq_ignore_ascii_case("content-length")
                });
            }
            url = next;
            redirected = true;
            continue;
        }

        return serialise_response(response, &url, redirected, max_body_bytes).await;
    }

    Err(format!("too many redirects (limit is {MAX_REDIRECTS})"))
}

async fn serialise_response(
    response: reqwest::Response,
    url: &url::Url,
    redirected: bool,
    max_body_bytes: usize,
) -> Result<serde_json::Value, String> {
    let status = response.status();
    let headers: Vec<serde_json::Value> = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            let value = value.to_str().ok()?;
            Some(serde_json::json!([name.as_str(), value]))
        })
        .collect();

    let body = response
        .bytes()
        .await
        .map_err(|e| format!("failed to read response body: {e}"))?;
    if body.len() > max_body_bytes {
        return Err(format!(
            "response body of {} bytes exceeds the {} byte limit",
            body.len(),
            max_body_bytes
        ));
    }

    Ok(serde_json::json!({
        "status": status.as_u16(),
        "statusText": status.canonical_reason().unwrap_or(""),
        "headers": headers,
        "body": STANDARD.encode(&body),
        "url": url.to_string(),
        "redirected": redirected,
    }))
}
