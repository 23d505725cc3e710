//! `URL` / `URLSearchParams` over the WHATWG `url` crate.
//!
//! A `URLSearchParams` obtained from `url.searchParams` is live: reads
//! re-derive from the URL's query and writes serialise straight back
//! into it, so every view stays consistent without object identity
//! tricks.

use std::cell::RefCell;
use std::rc::Rc;

use rquickjs::class::Trace;
use rquickjs::prelude::Opt;
use rquickjs::{Array, Class, Ctx, Exception, Function, JsLifetime, Object, Result, Value};
use url::form_urlencoded;

use super::headers::array_iterator;
use super::support::undef;

type SharedUrl = Rc<RefCell<url::Url>>;

#[rquickjs::class(rename = "URL")]
#[derive(Clone, Trace, JsLifetime)]
pub struct Url {
    #[qjs(skip_trace)]
    inner: SharedUrl,
}

impl Url {
    pub(crate) fn parse_str(ctx: &Ctx<'_>, input: &str, base: Option<&str>) -> Result<url::Url> {
        let parsed = match base {
            Some(base) => {
                let base = url::Url::parse(base)
                    .map_err(|e| Exception::throw_type(ctx, &format!("invalid base URL: {e}")))?;
                base.join(input)
            }
            None => url::Url::parse(input),
        };
        parsed.map_err(|e| Exception::throw_type(ctx, &format!("invalid URL: {e}")))
    }

    pub(crate) fn as_str(&self) -> String {
        self.inner.borrow().as_str().to_string()
    }
}

#[rquickjs::methods]
impl Url {
    #[qjs(constructor)]
    pub fn new(ctx: Ctx<'_>, input: String, base: Opt<String>) -> Result<Self> {
        let parsed = Self::parse_str(&ctx, &input, base.0.as_deref())?;
        Ok(Self {
            inner: Rc::new(RefCell::new(parsed)),
        })
    }

    #[qjs(static, rename = "canParse")]
    pub fn can_parse(input: String, base: Opt<String>) -> bool {
        match base.0 {
            Some(base) => url::Url::parse(&base)
                .and_then(|b| b.join(&input))
                .is_ok(),
            None => url::Url::parse(&input).is_ok(),
        }
    }

    #[qjs(get)]
    pub fn href(&self) -> String {
        self.as_str()
    }

    #[qjs(set, rename = "href")]
    pub fn set_href(&self, ctx: Ctx<'_>, value: String) -> Result<()> {
        let parsed = Self::parse_str(&ctx, &value, None)?;
        *self.inner.borrow_mut() = parsed;
        Ok(())
    }

    #[qjs(get)]
    pub fn origin(&self) -> String {
        self.inner.borrow().origin().ascii_serialization()
    }

    #[qjs(get)]
    pub fn protocol(&self) -> String {
        format!("{}:", self.inner.borrow().scheme())
    }

    #[qjs(set, rename = "protocol")]
    pub fn set_protocol(&self, value: String) {
        let scheme = value.trim_end_matches(':').to_ascii_lowercase();
        // invalid scheme changes are silently ignored, as in browsers
        let _ = self.inner.borrow_mut().set_scheme(&scheme);
    }

    #[qjs(get)]
    pub fn username(&self) -> String {
        self.inner.borrow().username().to_string()
    }

    #[qjs(set, rename = "username")]
    pub fn set_username(&self, value: String) {
        let _ = self.inner.borrow_mut().set_username(&value);
    }

    #[qjs(get)]
    pub fn password(&self) -> String {
        self.inner.borrow().password().unwrap_or_default().to_string()
    }

    #[qjs(set, rename = "password")]
    pub fn set_password(&self, value: String) {
        let password = if value.is_empty() { None } else { Some(value.as_str()) };
        let _ = self.inner.borrow_mut().set_password(password);
    }

    #[qjs(get)]
    pub fn host(&self) -> String {
        let url = self.inner.borrow();
        match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => String::new(),
        }
    }

    #[qjs(set, rename = "host")]
    pub fn set_host(&self, value: String) {
        let mut url = self.inner.borrow_mut();
        let (host, port) = match value.rsplit_once(':') {
            Some((h, p)) if p.chars().all(|c| c.is_ascii_digit()) && !p.is_empty() => {
                (h.to_string(), p.parse::<u16>().ok())
            }
            _ => (value, None),
        };
        let _ = url.set_host(Some(&host));
        if port.is_some() {
            let _ = url.set_port(port);
        }
    }

    #[qjs(get)]
    pub fn hostname(&self) -> String {
        self.inner.borrow().host_str().unwrap_or_default().to_string()
    }

    #[qjs(set, rename = "hostname")]
    pub fn set_hostname(&self, value: String) {
        let _ = self.inner.borrow_mut().set_host(Some(&value));
    }

    #[qjs(get)]
    pub fn port(&self) -> String {
        self.inner
            .borrow()
            .port()
            .map(|p| p.to_string())
            .unwrap_or_default()
    }

    #[qjs(set, rename = "port")]
    pub fn set_port(&self, value: String) {
        let port = if value.is_empty() {
            None
        } else {
            value.parse::<u16>().ok()
        };
        let _ = self.inner.borrow_mut().set_port(port);
    }

    #[qjs(get)]
    pub fn pathname(&self) -> String {
        self.inner.borrow().path().to_string()
    }

    #[qjs(set, rename = "pathname")]
    pub fn set_pathname(&self, value: String) {
        self.inner.borrow_mut().set_path(&value);
    }

    #[qjs(get)]
    pub fn search(&self) -> String {
        match self.inner.borrow().query() {
            Some(q) if !q.is_empty() => format!("?{q}"),
            _ => String::new(),
        }
    }

    #[qjs(set, rename = "search")]
    pub fn set_search(&self, value: String) {
        let q = value.strip_prefix('?').unwrap_or(&value);
        let mut url = self.inner.borrow_mut();
        if q.is_empty() {
            url.set_query(None);
        } else {
            url.set_query(Some(q));
        }
    }

    #[qjs(get)]
    pub fn hash(&self) -> String {
        match self.inner.borrow().fragment() {
            Some(f) if !f.is_empty() => format!("#{f}"),
            _ => String::new(),
        }
    }

    #[qjs(set, rename = "hash")]
    pub fn set_hash(&self, value: String) {
        let f = value.strip_prefix('#').unwrap_or(&value);
        let mut url = self.inner.borrow_mut();
        if f.is_empty() {
            url.set_fragment(None);
        } else {
            url.set_fragment(Some(f));
        }
    }

    #[qjs(get, rename = "searchParams")]
    pub fn search_params(&self) -> UrlSearchParams {
        UrlSearchParams {
            backing: Backing::Url(self.inner.clone()),
        }
    }

    #[qjs(rename = "toString")]
    pub fn to_string_js(&self) -> String {
        self.as_str()
    }

    #[qjs(rename = "toJSON")]
    pub fn to_json(&self) -> String {
        self.as_str()
    }
}

#[derive(Clone)]
enum Backing {
    List(Rc<RefCell<Vec<(String, String)>>>),
    Url(SharedUrl),
}

#[rquickjs::class(rename = "URLSearchParams")]
#[derive(Clone, Trace, JsLifetime)]
pub struct UrlSearchParams {
    #[qjs(skip_trace)]
    backing: Backing,
}

impl UrlSearchParams {
    pub(crate) fn from_pairs(pairs: Vec<(String, String)>) -> Self {
        Self {
            backing: Backing::List(Rc::new(RefCell::new(pairs))),
        }
    }

    pub(crate) fn read(&self) -> Vec<(String, String)> {
        match &self.backing {
            Backing::List(list) => list.borrow().clone(),
            Backing::Url(url) => url
                .borrow()
                .query_pairs()
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect(),
        }
    }

    fn write(&self, pairs: Vec<(String, String)>) {
        match &self.backing {
            Backing::List(list) => *list.borrow_mut() = pairs,
            Backing::Url(url) => {
                let mut url = url.borrow_mut();
                if pairs.is_empty() {
                    url.set_query(None);
                } else {
                    let serialised = serialise(&pairs);
                    url.set_query(Some(&serialised));
                }
            }
        }
    }

    pub(crate) fn serialised(&self) -> String {
        serialise(&self.read())
    }
}

/// application/x-www-form-urlencoded serialisation (space as `+`).
pub(crate) fn serialise(pairs: &[(String, String)]) -> String {
    let mut ser = form_urlencoded::Serializer::new(String::new());
    for (k, v) in pairs {
        ser.append_pair(k, v);
    }
    ser.finish()
}

/// application/x-www-form-urlencoded parsing.
pub(crate) fn parse_query(input: &str) -> Vec<(String, String)> {
    let input = input.strip_prefix('?').unwrap_or(input);
    form_urlencoded::parse(input.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

#[rquickjs::methods]
impl UrlSearchParams {
    #[qjs(constructor)]
    pub fn new<'js>(ctx: Ctx<'js>, init: Opt<Value<'js>>) -> Result<Self> {
        let mut pairs = Vec::new();
        if let Some(init) = init.0 {
            if let Some(s) = init.as_string() {
                pairs = parse_query(&s.to_string()?);
            } else if let Ok(other) = Class::<UrlSearchParams>::from_js(&ctx, init.clone()) {
                pairs = other.borrow().read();
            } else if let Some(obj) = init.as_object() {
                if let Some(array) = obj.as_array() {
                    for pair in array.iter::<Array>() {
                        let pair = pair?;
                        pairs.push((pair.get(0)?, pair.get(1)?));
                    }
                } else {
                    for prop in obj.props::<String, String>() {
                        let (k, v) = prop?;
                        pairs.push((k, v));
                    }
                }
            } else if !init.is_undefined() && !init.is_null() {
                return Err(Exception::throw_type(&ctx, "unsupported URLSearchParams init"));
            }
        }
        Ok(Self::from_pairs(pairs))
    }

    #[qjs(get)]
    pub fn size(&self) -> usize {
        self.read().len()
    }

    pub fn append(&self, name: String, value: String) {
        let mut pairs = self.read();
        pairs.push((name, value));
        self.write(pairs);
    }

    pub fn delete(&self, name: String, value: Opt<String>) {
        let mut pairs = self.read();
        pairs.retain(|(k, v)| {
            if *k != name {
                return true;
            }
            match &value.0 {
                Some(filter) => v != filter,
                None => false,
            }
        });
        self.write(pairs);
    }

    pub fn get(&self, name: String) -> Option<String> {
        self.read().into_iter().find(|(k, _)| *k == name).map(|(_, v)| v)
    }

    #[qjs(rename = "getAll")]
    pub fn get_all(&self, name: String) -> Vec<String> {
        self.read()
            .into_iter()
            .filter(|(k, _)| *k == name)
            .map(|(_, v)| v)
            .collect()
    }

    pub fn has(&self, name: String, value: Opt<String>) -> bool {
        self.read().iter().any(|(k, v)| {
            *k == name
                && match &value.0 {
                    Some(filter) => v == filter,
                    None => true,
                }
        })
    }

    pub fn set(&self, name: String, value: String) {
        let mut pairs = self.read();
        let mut replaced = false;
        pairs.retain_mut(|(k, v)| {
            if *k != name {
                return true;
            }
            if replaced {
                return false;
            }
            *v = value.clone();
            replaced = true;
            true
        });
        if !replaced {
            pairs.push((name, value));
        }
        self.write(pairs);
    }

    pub fn sort(&self) {
        let mut pairs = self.read();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        self.write(pairs);
    }

    #[qjs(rename = "forEach")]
    pub fn for_each<'js>(&self, ctx: Ctx<'js>, callback: Function<'js>) -> Result<()> {
        for (name, value) in self.read() {
            callback.call::<_, ()>((value, name, undef(&ctx)))?;
        }
        Ok(())
    }

    pub fn entries<'js>(&self, ctx: Ctx<'js>) -> Result<Value<'js>> {
        let array = Array::new(ctx.clone())?;
        for (i, (name, value)) in self.read().into_iter().enumerate() {
            let pair = Array::new(ctx.clone())?;
            pair.set(0, name)?;
            pair.set(1, value)?;
            array.set(i, pair)?;
        }
        array_iterator(&ctx, array)
    }

    pub fn keys<'js>(&self, ctx: Ctx<'js>) -> Result<Value<'js>> {
        let array = Array::new(ctx.clone())?;
        for (i, (name, _)) in self.read().into_iter().enumerate() {
            array.set(i, name)?;
        }
        array_iterator(&ctx, array)
    }

    pub fn values<'js>(&self, ctx: Ctx<'js>) -> Result<Value<'js>> {
        let array = Array::new(ctx.clone())?;
        for (i, (_, value)) in self.read().into_iter().enumerate() {
            array.set(i, value)?;
        }
        array_iterator(&ctx, array)
    }

    #[qjs(rename = "toString")]
    pub fn to_string_js(&self) -> String {
        self.serialised()
    }
}

use rquickjs::FromJs;

pub fn setup(ctx: &Ctx<'_>) -> Result<()> {
    let globals = ctx.globals();
    Class::<Url>::define(&globals)?;
    Class::<UrlSearchParams>::define(&globals)?;

    let ctor: Object = globals.get("URLSearchParams")?;
    let proto: Object = ctor.get("prototype")?;
    let entries_fn: Function = proto.get("entries")?;
    proto.set(rquickjs::atom::PredefinedAtom::SymbolIterator, entries_fn)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialise_uses_form_urlencoded_rules() {
        let pairs = vec![("a b".to_string(), "c&d".to_string())];
        assert_eq!(serialise(&pairs), "a+b=c%26d");
    }

    #[test]
    fn parse_round_trips() {
        let pairs = parse_query("?x=1&x=2&y=a+b");
        assert_eq!(pairs, vec![
            ("x".to_string(), "1".to_string()),
            ("x".to_string(), "2".to_string()),
            ("y".to_string(), "a b".to_string()),
        ]);
    }
}
