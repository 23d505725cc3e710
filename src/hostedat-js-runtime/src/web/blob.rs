//! `Blob`, `File` and `FormData`, plus the multipart/form-data codec
//! the body mixin uses.

use std::cell::RefCell;
use std::rc::Rc;

use rand::RngCore;
use rquickjs::class::Trace;
use rquickjs::prelude::Opt;
use rquickjs::{Array, Class, Ctx, Exception, FromJs, Function, JsLifetime, Object, Result, Value};

use super::streams::new_readable_from_bytes;
use super::support::{self, as_bytes, bytes_to_array_buffer, bytes_to_js, undef};

#[rquickjs::class]
#[derive(Clone, Trace, JsLifetime)]
pub struct Blob {
    #[qjs(skip_trace)]
    pub(crate) data: Rc<Vec<u8>>,
    #[qjs(skip_trace)]
    pub(crate) mime: String,
}

impl Blob {
    pub(crate) fn from_bytes(data: Vec<u8>, mime: impl Into<String>) -> Self {
        Self {
            data: Rc::new(data),
            mime: mime.into(),
        }
    }

    fn collect_parts<'js>(ctx: &Ctx<'js>, parts: &Value<'js>) -> Result<Vec<u8>> {
        let Some(array) = parts.as_object().and_then(|o| o.as_array()) else {
            return Err(Exception::throw_type(ctx, "Blob parts must be an array"));
        };
        let mut data = Vec::new();
        for part in array.iter::<Value>() {
            let part = part?;
            if let Ok(blob) = Class::<Blob>::from_js(ctx, part.clone()) {
                data.extend_from_slice(&blob.borrow().data);
            } else if let Ok(file) = Class::<File>::from_js(ctx, part.clone()) {
                data.extend_from_slice(&file.borrow().blob.data);
            } else {
                data.extend_from_slice(&as_bytes(&part)?);
            }
        }
        Ok(data)
    }
}

#[rquickjs::methods]
impl Blob {
    #[qjs(constructor)]
    pub fn new<'js>(ctx: Ctx<'js>, parts: Opt<Value<'js>>, options: Opt<Object<'js>>) -> Result<Self> {
        let data = match parts.0 {
            Some(parts) if !parts.is_undefined() && !parts.is_null() => {
                Self::collect_parts(&ctx, &parts)?
            }
            _ => Vec::new(),
        };
        let mime = options
            .0
            .and_then(|o| o.get::<_, String>("type").ok())
            .unwrap_or_default();
        Ok(Self::from_bytes(data, mime))
    }

    #[qjs(get)]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    #[qjs(get, rename = "type")]
    pub fn mime(&self) -> String {
        self.mime.clone()
    }

    pub fn text<'js>(&self, ctx: Ctx<'js>) -> Result<Value<'js>> {
        let text = String::from_utf8_lossy(&self.data).into_owned();
        let value = rquickjs::String::from_str(ctx.clone(), &text)?.into_value();
        Ok(support::resolved_promise(&ctx, value)?.into_value())
    }

    #[qjs(rename = "arrayBuffer")]
    pub fn array_buffer<'js>(&self, ctx: Ctx<'js>) -> Result<Value<'js>> {
        let buffer = bytes_to_array_buffer(&ctx, &self.data)?;
        Ok(support::resolved_promise(&ctx, buffer.into_value())?.into_value())
    }

    pub fn bytes<'js>(&self, ctx: Ctx<'js>) -> Result<Value<'js>> {
        let array = bytes_to_js(&ctx, &self.data)?;
        Ok(support::resolved_promise(&ctx, array)?.into_value())
    }

    pub fn slice<'js>(
        &self,
        ctx: Ctx<'js>,
        start: Opt<f64>,
        end: Opt<f64>,
        content_type: Opt<String>,
    ) -> Result<Blob> {
        let len = self.data.len() as i64;
        let clamp = |v: f64| -> usize {
            let v = v as i64;
            let v = if v < 0 { (len + v).max(0) } else { v.min(len) };
            v as usize
        };
        let start = clamp(start.0.unwrap_or(0.0));
        let end = clamp(end.0.unwrap_or(len as f64));
        let slice = if start < end {
            self.data[start..end].to_vec()
        } else {
            Vec::new()
        };
        let _ = ctx;
        Ok(Blob::from_bytes(slice, content_type.0.unwrap_or_default()))
    }

    pub fn stream<'js>(&self, ctx: Ctx<'js>) -> Result<Value<'js>> {
        Ok(new_readable_from_bytes(&ctx, &self.data)?.into_value())
    }
}

#[rquickjs::class]
#[derive(Clone, Trace, JsLifetime)]
pub struct File {
    #[qjs(skip_trace)]
    pub(crate) blob: Blob,
    #[qjs(skip_trace)]
    name: String,
    last_modified: f64,
}

impl File {
    pub(crate) fn from_parts(data: Vec<u8>, mime: String, name: String) -> Self {
        Self {
            blob: Blob::from_bytes(data, mime),
            name,
            last_modified: 0.0,
        }
    }
}

#[rquickjs::methods]
impl File {
    #[qjs(constructor)]
    pub fn new<'js>(
        ctx: Ctx<'js>,
        parts: Value<'js>,
        name: String,
        options: Opt<Object<'js>>,
    ) -> Result<Self> {
        let data = Blob::collect_parts(&ctx, &parts)?;
        let mime = options
            .0
            .as_ref()
            .and_then(|o| o.get::<_, String>("type").ok())
            .unwrap_or_default();
        let last_modified = options
            .0
            .and_then(|o| o.get::<_, f64>("lastModified").ok())
            .unwrap_or(0.0);
        Ok(Self {
            blob: Blob::from_bytes(data, mime),
            name,
            last_modified,
        })
    }

    #[qjs(get)]
    pub fn name(&self) -> String {
        self.name.clone()
    }

    #[qjs(get, rename = "lastModified")]
    pub fn last_modified(&self) -> f64 {
        self.last_modified
    }

    #[qjs(get)]
    pub fn size(&self) -> usize {
        self.blob.data.len()
    }

    #[qjs(get, rename = "type")]
    pub fn mime(&self) -> String {
        self.blob.mime.clone()
    }

    pub fn text<'js>(&self, ctx: Ctx<'js>) -> Result<Value<'js>> {
        self.blob.text(ctx)
    }

    #[qjs(rename = "arrayBuffer")]
    pub fn array_buffer<'js>(&self, ctx: Ctx<'js>) -> Result<Value<'js>> {
        self.blob.array_buffer(ctx)
    }

    pub fn stream<'js>(&self, ctx: Ctx<'js>) -> Result<Value<'js>> {
        self.blob.stream(ctx)
    }
}

#[derive(Clone)]
pub(crate) enum FormEntry {
    Text(String),
    File {
        filename: String,
        mime: String,
        data: Rc<Vec<u8>>,
    },
}

#[rquickjs::class]
#[derive(Clone, Trace, JsLifetime)]
pub struct FormData {
    #[qjs(skip_trace)]
    pub(crate) entries: Rc<RefCell<Vec<(String, FormEntry)>>>,
}

impl FormData {
    pub(crate) fn from_entries(entries: Vec<(String, FormEntry)>) -> Self {
        Self {
            entries: Rc::new(RefCell::new(entries)),
        }
    }

    fn entry_to_value<'js>(ctx: &Ctx<'js>, entry: &FormEntry) -> Result<Value<'js>> {
        match entry {
            FormEntry::Text(text) => {
                Ok(rquickjs::String::from_str(ctx.clone(), text)?.into_value())
            }
            FormEntry::File {
                filename,
                mime,
                data,
            } => {
                let file = File {
                    blob: Blob {
                        data: data.clone(),
                        mime: mime.clone(),
                    },
                    name: filename.clone(),
                    last_modified: 0.0,
                };
                Ok(Class::instance(ctx.clone(), file)?.into_value())
            }
        }
    }

    fn value_to_entry<'js>(
        ctx: &Ctx<'js>,
        value: &Value<'js>,
        filename: Option<String>,
    ) -> Result<FormEntry> {
        if let Ok(file) = Class::<File>::from_js(ctx, value.clone()) {
            let file = file.borrow();
            return Ok(FormEntry::File {
                filename: filename.unwrap_or_else(|| file.name.clone()),
                mime: file.blob.mime.clone(),
                data: file.blob.data.clone(),
            });
        }
        if let Ok(blob) = Class::<Blob>::from_js(ctx, value.clone()) {
            let blob = blob.borrow();
            return Ok(FormEntry::File {
                filename: filename.unwrap_or_else(|| "blob".to_string()),
                mime: blob.mime.clone(),
                data: blob.data.clone(),
            });
        }
        let text: String = rquickjs::Coerced::<String>::from_js(ctx, value.clone())?.0;
        Ok(FormEntry::Text(text))
    }
}

#[rquickjs::methods]
impl FormData {
    #[qjs(constructor)]
    pub fn new() -> Self {
        Self::from_entries(Vec::new())
    }

    pub fn append<'js>(
        &self,
        ctx: Ctx<'js>,
        name: String,
        value: Value<'js>,
        filename: Opt<String>,
    ) -> Result<()> {
        let entry = Self::value_to_entry(&ctx, &value, filename.0)?;
        self.entries.borrow_mut().push((name, entry));
        Ok(())
    }

    pub fn set<'js>(
        &self,
        ctx: Ctx<'js>,
        name: String,
        value: Value<'js>,
        filename: Opt<String>,
    ) -> Result<()> {
        let entry = Self::value_to_entry(&ctx, &value, filename.0)?;
        let mut entries = self.entries.borrow_mut();
        let mut replaced = false;
        entries.retain_mut(|(k, v)| {
            if *k != name {
                return true;
            }
            if replaced {
                return false;
            }
            *v = entry.clone();
            replaced = true;
            true
        });
        if !replaced {
            entries.push((name, entry));
        }
        Ok(())
    }

    pub fn get<'js>(&self, ctx: Ctx<'js>, name: String) -> Result<Value<'js>> {
        let entries = self.entries.borrow();
        match entries.iter().find(|(k, _)| *k == name) {
            Some((_, entry)) => Self::entry_to_value(&ctx, entry),
            None => Ok(Value::new_null(ctx)),
        }
    }

    #[qjs(rename = "getAll")]
    pub fn get_all<'js>(&self, ctx: Ctx<'js>, name: String) -> Result<Array<'js>> {
        let array = Array::new(ctx.clone())?;
        let entries = self.entries.borrow();
        for (i, (_, entry)) in entries.iter().filter(|(k, _)| *k == name).enumerate() {
            array.set(i, Self::entry_to_value(&ctx, entry)?)?;
        }
        Ok(array)
    }

    pub fn has(&self, name: String) -> bool {
        self.entries.borrow().iter().any(|(k, _)| *k == name)
    }

    pub fn delete(&self, name: String) {
        self.entries.borrow_mut().retain(|(k, _)| *k != name);
    }

    #[qjs(rename = "forEach")]
    pub fn for_each<'js>(&self, ctx: Ctx<'js>, callback: Function<'js>) -> Result<()> {
        let snapshot = self.entries.borrow().clone();
        for (name, entry) in snapshot {
            let value = Self::entry_to_value(&ctx, &entry)?;
            callback.call::<_, ()>((value, name, undef(&ctx)))?;
        }
        Ok(())
    }

    pub fn entries<'js>(&self, ctx: Ctx<'js>) -> Result<Value<'js>> {
        let array = Array::new(ctx.clone())?;
        for (i, (name, entry)) in self.entries.borrow().iter().enumerate() {
            let pair = Array::new(ctx.clone())?;
            pair.set(0, name.clone())?;
            pair.set(1, Self::entry_to_value(&ctx, entry)?)?;
            array.set(i, pair)?;
        }
        super::headers::array_iterator(&ctx, array)
    }

    pub fn keys<'js>(&self, ctx: Ctx<'js>) -> Result<Value<'js>> {
        let array = Array::new(ctx.clone())?;
        for (i, (name, _)) in self.entries.borrow().iter().enumerate() {
            array.set(i, name.clone())?;
        }
        super::headers::array_iterator(&ctx, array)
    }

    pub fn values<'js>(&self, ctx: Ctx<'js>) -> Result<Value<'js>> {
        let array = Array::new(ctx.clone())?;
        for (i, (_, entry)) in self.entries.borrow().iter().enumerate() {
            array.set(i, Self::entry_to_value(&ctx, entry)?)?;
        }
        super::headers::array_iterator(&ctx, array)
    }
}

/// Picks a boundary that is overwhelmingly unlikely to appear in the
/// payload.
pub(crate) fn make_boundary() -> String {
    let mut noise = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut noise);
    format!("----HostedAtFormBoundary{}", hex::encode(noise))
}

/// Serialises entries as multipart/form-data with the given boundary.
pub(crate) fn to_multipart(entries: &[(String, FormEntry)], boundary: &str) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, entry) in entries {
        out.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        match entry {
            FormEntry::Text(text) => {
                out.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
                );
                out.extend_from_slice(text.as_bytes());
            }
            FormEntry::File {
                filename,
                mime,
                data,
            } => {
                out.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\n"
                    )
                    .as_bytes(),
                );
                let mime = if mime.is_empty() {
                    "application/octet-stream"
                } else {
                    mime
                };
                out.extend_from_slice(format!("Content-Type: {mime}\r\n\r\n").as_bytes());
                out.extend_from_slice(data);
            }
        }
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    out
}

/// Parses a multipart/form-data payload. Tolerates a missing final
/// CRLF; rejects payloads whose parts lack a name.
pub(crate) fn parse_multipart(body: &[u8], boundary: &str) -> std::result::Result<Vec<(String, FormEntry)>, String> {
    let delim = format!("--{boundary}");
    let mut entries = Vec::new();

    let text_sections = split_bytes(body, delim.as_bytes());
    for section in text_sections {
        let section = strip_prefix(section, b"\r\n").unwrap_or(section);
        if section.is_empty() || section.starts_with(b"--") {
            continue;
        }
        let Some(header_end) = find_bytes(section, b"\r\n\r\n") else {
            continue;
        };
        let headers = &section[..header_end];
        let mut content = &section[header_end + 4..];
        if content.ends_with(b"\r\n") {
            content = &content[..content.len() - 2];
        }

        let mut name = None;
        let mut filename = None;
        let mut mime = String::new();
        for line in String::from_utf8_lossy(headers).lines() {
            let lower = line.to_ascii_lowercase();
            if lower.starts_with("content-disposition:") {
                name = extract_param(line, "name");
                filename = extract_param(line, "filename");
            } else if let Some(value) = lower.strip_prefix("content-type:") {
                mime = value.trim().to_string();
            }
        }
        let Some(name) = name else {
            return Err("multipart part is missing a field name".to_string());
        };
        let entry = match filename {
            Some(filename) => FormEntry::File {
                filename,
                mime,
                data: Rc::new(content.to_vec()),
            },
            None => FormEntry::Text(String::from_utf8_lossy(content).into_owned()),
        };
        entries.push((name, entry));
    }
    Ok(entries)
}

fn extract_param(header: &str, param: &str) -> Option<String> {
    let needle = format!("{param}=\"");
    let start = header.find(&needle)? + needle.len();
    let rest = &header[start..];
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}

fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn strip_prefix<'a>(bytes: &'a [u8], prefix: &[u8]) -> Option<&'a [u8]> {
    bytes.strip_prefix(prefix)
}

fn split_bytes<'a>(haystack: &'a [u8], needle: &[u8]) -> Vec<&'a [u8]> {
    let mut sections = Vec::new();
    let mut rest = haystack;
    while let Some(pos) = find_bytes(rest, needle) {
        sections.push(&rest[..pos]);
        rest = &rest[pos + needle.len()..];
    }
    sections.push(rest);
    sections
}

pub fn setup(ctx: &Ctx<'_>) -> Result<()> {
    let globals = ctx.globals();
    Class::<Blob>::define(&globals)?;
    Class::<File>::define(&globals)?;
    Class::<FormData>::define(&globals)?;

    let ctor: Object = globals.get("FormData")?;
    let proto: Object = ctor.get("prototype")?;
    let entries_fn: Function = proto.get("entries")?;
    proto.set(rquickjs::atom::PredefinedAtom::SymbolIterator, entries_fn)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multipart_round_trip() {
        let entries = vec![
            ("field".to_string(), FormEntry::Text("hello world".into())),
            (
                "upload".to_string(),
                FormEntry::File {
                    filename: "a.bin".into(),
                    mime: "application/octet-stream".into(),
                    data: Rc::new(vec![1, 2, 3]),
                },
            ),
        ];
        let boundary = "testBoundary123";
        let bytes = to_multipart(&entries, boundary);
        let parsed = parse_multipart(&bytes, boundary).unwrap();
        assert_eq!(parsed.len(), 2);
        match &parsed[0].1 {
            FormEntry::Text(t) => assert_eq!(t, "hello world"),
            _ => panic!("expected text entry"),
        }
        match &parsed[1].1 {
            FormEntry::File { filename, data, .. } => {
                assert_eq!(filename, "a.bin");
                assert_eq!(data.as_slice(), &[1, 2, 3]);
            }
            _ => panic!("expected file entry"),
        }
    }

    #[test]
    fn multipart_part_without_name_is_rejected() {
        let body = b"--b\r\nContent-Disposition: form-data\r\n\r\nx\r\n--b--\r\n";
        assert!(parse_multipart(body, "b").is_err());
    }
}
