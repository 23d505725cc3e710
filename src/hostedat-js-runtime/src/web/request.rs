//! The `Request` class.

use rquickjs::class::Trace;
use rquickjs::prelude::Opt;
use rquickjs::{Class, Ctx, Exception, FromJs, JsLifetime, Object, Persistent, Promise, Result, Value};

use super::body::{self, BodyCell, SharedBody};
use super::events::AbortSignal;
use super::headers::Headers;
use super::url::Url;

type SavedVal = Persistent<Value<'static>>;

const FORBIDDEN_WITH_BODY: &[&str] = &["GET", "HEAD"];

fn normalise_method(method: &str) -> String {
    let upper = method.to_ascii_uppercase();
    match upper.as_str() {
        "DELETE" | "GET" | "HEAD" | "OPTIONS" | "POST" | "PUT" | "PATCH" => upper,
        _ => method.to_string(),
    }
}

#[rquickjs::class]
#[derive(Trace, JsLifetime)]
pub struct Request {
    #[qjs(skip_trace)]
    pub(crate) method: String,
    #[qjs(skip_trace)]
    pub(crate) url: String,
    #[qjs(skip_trace)]
    headers_value: SavedVal,
    #[qjs(skip_trace)]
    pub(crate) body: SharedBody,
    #[qjs(skip_trace)]
    signal_value: Option<SavedVal>,
    #[qjs(skip_trace)]
    pub(crate) redirect: String,
}

impl Request {
    /// Builds a request from host-side parts (the inbound wire request
    /// or a service-binding call).
    pub(crate) fn from_parts<'js>(
        ctx: &Ctx<'js>,
        method: &str,
        url: &str,
        header_pairs: Vec<(String, String)>,
        body_bytes: Vec<u8>,
    ) -> Result<Class<'js, Request>> {
        let headers = Class::instance(ctx.clone(), Headers::from_pairs(header_pairs))?;
        let body = if body_bytes.is_empty() {
            BodyCell::none()
        } else {
            BodyCell::from_bytes(body_bytes)
        };
        Class::instance(
            ctx.clone(),
            Request {
                method: normalise_method(method),
                url: url.to_string(),
                headers_value: Persistent::save(ctx, headers.into_value()),
                body,
                signal_value: None,
                redirect: "follow".to_string(),
            },
        )
    }

    pub(crate) fn headers_class<'js>(&self, ctx: &Ctx<'js>) -> Result<Class<'js, Headers>> {
        let value = self.headers_value.clone().restore(ctx)?;
        Class::<Headers>::from_js(ctx, value)
    }

    pub(crate) fn content_type<'js>(&self, ctx: &Ctx<'js>) -> String {
        self.headers_class(ctx)
            .ok()
            .and_then(|h| h.borrow().first_value("content-type"))
            .unwrap_or_default()
    }

    pub(crate) fn signal_class<'js>(&self, ctx: &Ctx<'js>) -> Option<Class<'js, AbortSignal>> {
        let saved = self.signal_value.clone()?;
        let value = saved.restore(ctx).ok()?;
        Class::<AbortSignal>::from_js(ctx, value).ok()
    }
}

#[rquickjs::methods]
impl Request {
    #[qjs(constructor)]
    pub fn new<'js>(ctx: Ctx<'js>, input: Value<'js>, init: Opt<Object<'js>>) -> Result<Self> {
        // input: URL string, URL object, or another Request
        let (mut method, url, mut headers, mut body, mut signal, mut redirect) =
            if let Ok(other) = Class::<Request>::from_js(&ctx, input.clone()) {
                let other = other.borrow();
                let headers = Headers::from_pairs(other.headers_class(&ctx)?.borrow().pairs());
                let body = body::clone_body(&ctx, &other.body)?;
                (
                    other.method.clone(),
                    other.url.clone(),
                    headers,
                    body,
                    other.signal_value.clone(),
                    other.redirect.clone(),
                )
            } else if let Ok(url) = Class::<Url>::from_js(&ctx, input.clone()) {
                let url = url.borrow().as_str();
                (
                    "GET".to_string(),
                    url,
                    Headers::from_pairs(Vec::new()),
                    BodyCell::none(),
                    None,
                    "follow".to_string(),
                )
            } else if let Some(s) = input.as_string() {
                let raw = s.to_string()?;
                let parsed = Url::parse_str(&ctx, &raw, None)?;
                (
                    "GET".to_string(),
                    parsed.to_string(),
                    Headers::from_pairs(Vec::new()),
                    BodyCell::none(),
                    None,
                    "follow".to_string(),
                )
            } else {
                return Err(Exception::throw_type(
                    &ctx,
                    "Request input must be a string, URL or Request",
                ));
            };

        let mut implied_type: Option<String> = None;
        if let Some(init) = init.0 {
            if let Ok(m) = init.get::<_, String>("method") {
                method = normalise_method(&m);
            }
            if let Ok(h) = init.get::<_, Value>("headers") {
                if !h.is_undefined() && !h.is_null() {
                    headers = Headers::new(ctx.clone(), Opt(Some(h)))?;
                }
            }
            if let Ok(b) = init.get::<_, Value>("body") {
                if !b.is_undefined() && !b.is_null() {
                    if FORBIDDEN_WITH_BODY.contains(&method.as_str()) {
                        return Err(Exception::throw_type(
                            &ctx,
                            "GET and HEAD requests cannot carry a body",
                        ));
                    }
                    let (source, implied) = body::extract_body_init(&ctx, b)?;
                    body = BodyCell::from_source(source);
                    implied_type = implied;
                }
            }
            if let Ok(s) = init.get::<_, Value>("signal") {
                if Class::<AbortSignal>::from_js(&ctx, s.clone()).is_ok() {
                    signal = Some(Persistent::save(&ctx, s));
                }
            }
            if let Ok(r) = init.get::<_, String>("redirect") {
                redirect = r;
            }
        }

        if let Some(implied) = implied_type {
            if !headers.has("content-type".to_string()) {
                headers.append("content-type".to_string(), implied);
            }
        }

        let headers_class = Class::instance(ctx.clone(), headers)?;
        Ok(Self {
            method,
            url,
            headers_value: Persistent::save(&ctx, headers_class.into_value()),
            body,
            signal_value: signal,
            redirect,
        })
    }

    #[qjs(get)]
    pub fn method(&self) -> String {
        self.method.clone()
    }

    #[qjs(get)]
    pub fn url(&self) -> String {
        self.url.clone()
    }

    #[qjs(get)]
    pub fn headers<'js>(&self, ctx: Ctx<'js>) -> Result<Value<'js>> {
        self.headers_value.clone().restore(&ctx)
    }

    #[qjs(get)]
    pub fn redirect(&self) -> String {
        self.redirect.clone()
    }

    #[qjs(get)]
    pub fn signal<'js>(&self, ctx: Ctx<'js>) -> Result<Value<'js>> {
        match self.signal_value.clone() {
            Some(s) => s.restore(&ctx),
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

    pub fn json<'js>(&self, ctx: Ctx<'js>) -> Result<Promise<'js>> {
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

    pub fn clone<'js>(&self, ctx: Ctx<'js>) -> Result<Request> {
        let headers = Headers::from_pairs(self.headers_class(&ctx)?.borrow().pairs());
        let headers_class = Class::instance(ctx.clone(), headers)?;
        let body = body::clone_body(&ctx, &self.body)?;
        Ok(Request {
            method: self.method.clone(),
            url: self.url.clone(),
            headers_value: Persistent::save(&ctx, headers_class.into_value()),
            body,
            signal_value: self.signal_value.clone(),
            redirect: self.redirect.clone(),
        })
    }
}

pub fn setup(ctx: &Ctx<'_>) -> Result<()> {
    Class::<Request>::define(&ctx.globals())?;
    Ok(())
}
