//! The `Response` class, including the non-standard `webSocket` init
//! field used for 101 upgrades, and the host-side extraction helper
//! the isolate uses to serialise a handler's return value.

use std::cell::RefCell;
use std::rc::Rc;

use rquickjs::class::Trace;
use rquickjs::prelude::Opt;
use rquickjs::{
    Class, Ctx, Exception, FromJs, JsLifetime, Object, Persistent, Promise, Result, Value,
};

use super::body::{self, BodyCell, SharedBody};
use super::headers::Headers;
use super::support::{self, arg, native_fn, undef};

type SavedVal = Persistent<Value<'static>>;

/// Reason phrases for the statuses workers actually produce; anything
/// else reports an empty statusText, as the fetch spec allows.
fn default_status_text(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        410 => "Gone",
        412 => "Precondition Failed",
        413 => "Payload Too Large",
        415 => "Unsupported Media Type",
        416 => "Range Not Satisfiable",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "",
    }
}

#[rquickjs::class]
#[derive(Trace, JsLifetime)]
pub struct Response {
    pub(crate) status: u16,
    #[qjs(skip_trace)]
    pub(crate) status_text: String,
    #[qjs(skip_trace)]
    headers_value: SavedVal,
    #[qjs(skip_trace)]
    pub(crate) body: SharedBody,
    #[qjs(skip_trace)]
    pub(crate) web_socket: Option<SavedVal>,
    #[qjs(skip_trace)]
    pub(crate) redirected: bool,
    #[qjs(skip_trace)]
    pub(crate) url: String,
}

impl Response {
    /// Builds a response from host-side parts (outbound fetch results,
    /// service bindings, assets, cache hits).
    pub(crate) fn from_parts<'js>(
        ctx: &Ctx<'js>,
        status: u16,
        status_text: Option<String>,
        header_pairs: Vec<(String, String)>,
        body_bytes: Vec<u8>,
        url: &str,
    ) -> Result<Class<'js, Response>> {
        let headers = Class::instance(ctx.clone(), Headers::from_pairs(header_pairs))?;
        let body = if body_bytes.is_empty() {
            BodyCell::none()
        } else {
            BodyCell::from_bytes(body_bytes)
        };
        Class::instance(
            ctx.clone(),
            Response {
                status,
                status_text: status_text
                    .unwrap_or_else(|| default_status_text(status).to_string()),
                headers_value: Persistent::save(ctx, headers.into_value()),
                body,
                web_socket: None,
                redirected: false,
                url: url.to_string(),
            },
        )
    }

    pub(crate) fn headers_class<'js>(&self, ctx: &Ctx<'js>) -> Result<Class<'js, Headers>> {
        let value = self.headers_value.clone().restore(ctx)?;
        Class::<Headers>::from_js(ctx, value)
    }

    fn content_type<'js>(&self, ctx: &Ctx<'js>) -> String {
        self.headers_class(ctx)
            .ok()
            .and_then(|h| h.borrow().first_value("content-type"))
            .unwrap_or_default()
    }
}

#[rquickjs::methods]
impl Response {
    #[qjs(constructor)]
    pub fn new<'js>(ctx: Ctx<'js>, body_init: Opt<Value<'js>>, init: Opt<Object<'js>>) -> Result<Self> {
        let mut status: u16 = 200;
        let mut status_text: Option<String> = None;
        let mut headers = Headers::from_pairs(Vec::new());
        let mut web_socket = None;

        if let Some(init) = init.0 {
            if let Ok(s) = init.get::<_, f64>("status") {
                let s = s as i64;
                if !(100..=599).contains(&s) {
                    return Err(Exception::throw_range(
                        &ctx,
                        "Response status must be an integer between 100 and 599",
                    ));
                }
                status = s as u16;
            }
            if let Ok(t) = init.get::<_, String>("statusText") {
                status_text = Some(t);
            }
            if let Ok(h) = init.get::<_, Value>("headers") {
                if !h.is_undefined() && !h.is_null() {
                    headers = Headers::new(ctx.clone(), Opt(Some(h)))?;
                }
            }
            if let Ok(ws) = init.get::<_, Value>("webSocket") {
                if !ws.is_undefined() && !ws.is_null() {
                    if status != 101 {
                        return Err(Exception::throw_range(
                            &ctx,
                            "a webSocket requires status 101",
                        ));
                    }
                    web_socket = Some(Persistent::save(&ctx, ws));
                }
            }
        }

        let mut body = BodyCell::none();
        if let Some(body_init) = body_init.0 {
            if !body_init.is_undefined() && !body_init.is_null() {
                if status == 204 || status == 205 || status == 304 {
                    return Err(Exception::throw_type(
                        &ctx,
                        "this status must not carry a body",
                    ));
                }
                let (source, implied) = body::extract_body_init(&ctx, body_init)?;
                body = BodyCell::from_source(source);
                if let Some(implied) = implied {
                    if !headers.has("content-type".to_string()) {
                        headers.append("content-type".to_string(), implied);
                    }
                }
            }
        }

        let status_text =
            status_text.unwrap_or_else(|| default_status_text(status).to_string());
        let headers_class = Class::instance(ctx.clone(), headers)?;
        Ok(Self {
            status,
            status_text,
            headers_value: Persistent::save(&ctx, headers_class.into_value()),
            body,
            web_socket,
            redirected: false,
            url: String::new(),
        })
    }

    #[qjs(static)]
    pub fn json<'js>(ctx: Ctx<'js>, value: Value<'js>, init: Opt<Object<'js>>) -> Result<Response> {
        let text = ctx
            .json_stringify(value)?
            .ok_or_else(|| Exception::throw_type(&ctx, "value is not JSON-serialisable"))?
            .to_string()?;
        let body = rquickjs::String::from_str(ctx.clone(), &text)?.into_value();
        let response = Self::new(ctx.clone(), Opt(Some(body)), init)?;
        let headers = response.headers_class(&ctx)?;
        headers
            .borrow()
            .set("content-type".to_string(), "application/json".to_string());
        Ok(response)
    }

    #[qjs(static)]
    pub fn redirect(ctx: Ctx<'_>, url: String, status: Opt<u16>) -> Result<Response> {
        let status = status.0.unwrap_or(302);
        if !matches!(status, 301 | 302 | 303 | 307 | 308) {
            return Err(Exception::throw_range(&ctx, "invalid redirect status"));
        }
        let headers = Headers::from_pairs(vec![("location".to_string(), url)]);
        let headers_class = Class::instance(ctx.clone(), headers)?;
        Ok(Response {
            status,
            status_text: default_status_text(status).to_string(),
            headers_value: Persistent::save(&ctx, headers_class.into_value()),
            body: BodyCell::none(),
            web_socket: None,
            redirected: false,
            url: String::new(),
        })
    }

    #[qjs(static)]
    pub fn error(ctx: Ctx<'_>) -> Result<Response> {
        let headers_class = Class::instance(ctx.clone(), Headers::from_pairs(Vec::new()))?;
        Ok(Response {
            status: 0,
            status_text: String::new(),
            headers_value: Persistent::save(&ctx, headers_class.into_value()),
            body: BodyCell::none(),
            web_socket: None,
            redirected: false,
            url: String::new(),
        })
    }

    #[qjs(get)]
    pub fn status(&self) -> u16 {
        self.status
    }

    #[qjs(get, rename = "statusText")]
    pub fn status_text(&self) -> String {
        self.status_text.clone()
    }

    #[qjs(get)]
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    #[qjs(get)]
    pub fn redirected(&self) -> bool {
        self.redirected
    }

    #[qjs(get)]
    pub fn url(&self) -> String {
        self.url.clone()
    }

    #[qjs(get)]
    pub fn headers<'js>(&self, ctx: Ctx<'js>) -> Result<Value<'js>> {
        self.headers_value.clone().restore(&ctx)
    }

    #[qjs(get, rename = "webSocket")]
    pub fn web_socket<'js>(&self, ctx: Ctx<'js>) -> Result<Value<'js>> {
        match self.web_socket.clone() {
            Some(ws) => ws.restore(&ctx),
            None => Ok(Value::new_null(ctx)),
        }
    }

    #[qjs(get)]
    pub fn body<'js>(&self, ctx: Ctx<'js>) -> Result<Value<'js>> {
        body::body_stream_value(&ctx, &self.body)
    }

    #[qjs(get, rename = "bodyUsed")]
    pub fn body_used(&self, ctx: Ctx<'_>) -> bool {
        body::body_used(&ctx, &self.body)
    }

    pub fn text<'js>(&self, ctx: Ctx<'js>) -> Result<Promise<'js>> {
        let content_type = self.content_type(&ctx);
        body::consume(&ctx, &self.body, body::Convert::Text, content_type)
    }

    #[qjs(rename = "json")]
    pub fn json_body<'js>(&self, ctx: Ctx<'js>) -> Result<Promise<'js>> {
        let content_type = self.content_type(&ctx);
        body::consume(&ctx, &self.body, body::Convert::Json, content_type)
    }

    #[qjs(rename = "arrayBuffer")]
    pub fn array_buffer<'js>(&self, ctx: Ctx<'js>) -> Result<Promise<'js>> {
        let content_type = self.content_type(&ctx);
        body::consume(&ctx, &self.body, body::Convert::ArrayBuffer, content_type)
    }

    pub fn bytes<'js>(&self, ctx: Ctx<'js>) -> Result<Promise<'js>> {
        let content_type = self.content_type(&ctx);
        body::consume(&ctx, &self.body, body::Convert::Bytes, content_type)
    }

    pub fn blob<'js>(&self, ctx: Ctx<'js>) -> Result<Promise<'js>> {
        let content_type = self.content_type(&ctx);
        body::consume(&ctx, &self.body, body::Convert::Blob, content_type)
    }

    #[qjs(rename = "formData")]
    pub fn form_data<'js>(&self, ctx: Ctx<'js>) -> Result<Promise<'js>> {
        let content_type = self.content_type(&ctx);
        body::consume(&ctx, &self.body, body::Convert::FormData, content_type)
    }

    pub fn clone<'js>(&self, ctx: Ctx<'js>) -> Result<Response> {
        let headers = Headers::from_pairs(self.headers_class(&ctx)?.borrow().pairs());
        let headers_class = Class::instance(ctx.clone(), headers)?;
        let body = body::clone_body(&ctx, &self.body)?;
        Ok(Response {
            status: self.status,
            status_text: self.status_text.clone(),
            headers_value: Persistent::save(&ctx, headers_class.into_value()),
            body,
            web_socket: self.web_socket.clone(),
            redirected: self.redirected,
            url: self.url.clone(),
        })
    }
}

/// Host-facing snapshot of a handler's response, body fully buffered.
pub struct ResponseOut {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub has_web_socket: bool,
}

/// Either a finished extraction or one that is waiting on a stream
/// body; the event loop drives until the slot fills.
pub enum Extraction {
    Ready(ResponseOut),
    Draining {
        meta: ResponseOut,
        slot: Rc<RefCell<Option<std::result::Result<Vec<u8>, String>>>>,
    },
}

/// Begins serialising a handler's return value. Stream bodies drain
/// asynchronously into the returned slot; `limit` aborts the drain
/// when the body exceeds the response size cap.
pub(crate) fn begin_extraction<'js>(
    ctx: &Ctx<'js>,
    value: Value<'js>,
    limit: usize,
) -> anyhow::Result<Extraction> {
    let response = Class::<Response>::from_js(ctx, value)
        .map_err(|_| anyhow::anyhow!("the fetch handler did not return a Response"))?;
    let response = response.borrow();

    let meta = ResponseOut {
        status: response.status,
        status_text: response.status_text.clone(),
        headers: response
            .headers_class(ctx)
            .map_err(|e| anyhow::anyhow!("response headers are unreadable: {e}"))?
            .borrow()
            .pairs(),
        body: Vec::new(),
        has_web_socket: response.web_socket.is_some(),
    };

    if response.body.is_none() || body::body_used(ctx, &response.body) {
        return Ok(Extraction::Ready(meta));
    }
    if let Some(bytes) = response.body.bytes() {
        if bytes.len() > limit {
            anyhow::bail!("response body exceeds the configured size limit");
        }
        let mut meta = meta;
        meta.body = bytes.as_ref().clone();
        response.body.mark_used();
        return Ok(Extraction::Ready(meta));
    }

    let saved = response
        .body
        .stream_saved()
        .ok_or_else(|| anyhow::anyhow!("response body is in an unknown state"))?;
    response.body.mark_used();
    let stream = saved
        .restore(ctx)
        .map_err(|e| anyhow::anyhow!("response body stream is unreadable: {e}"))?;
    let inner = super::streams::readable_inner_of(&stream)
        .ok_or_else(|| anyhow::anyhow!("response body is not a ReadableStream"))?;

    let slot: Rc<RefCell<Option<std::result::Result<Vec<u8>, String>>>> =
        Rc::new(RefCell::new(None));
    let done_slot = slot.clone();
    let done = native_fn(ctx, move |ctx, args| {
        let array = arg(&ctx, &args, 0);
        let bytes = support::as_bytes(&array)?;
        *done_slot.borrow_mut() = Some(Ok(bytes));
        Ok(undef(&ctx))
    })
    .map_err(|e| anyhow::anyhow!("failed to build drain callback: {e}"))?;
    let fail_slot = slot.clone();
    let fail = native_fn(ctx, move |ctx, args| {
        let err = arg(&ctx, &args, 0);
        let message = err
            .as_string()
            .and_then(|s| s.to_string().ok())
            .or_else(|| {
                err.as_object()
                    .and_then(|o| o.get::<_, String>("message").ok())
            })
            .unwrap_or_else(|| "response body stream errored".to_string());
        *fail_slot.borrow_mut() = Some(Err(message));
        Ok(undef(&ctx))
    })
    .map_err(|e| anyhow::anyhow!("failed to build drain callback: {e}"))?;

    body::drain_readable(ctx, inner, Some(limit), done, fail)
        .map_err(|e| anyhow::anyhow!("failed to start body drain: {e}"))?;
    Ok(Extraction::Draining { meta, slot })
}

pub fn setup(ctx: &Ctx<'_>) -> Result<()> {
    Class::<Response>::define(&ctx.globals())?;
    Ok(())
}
