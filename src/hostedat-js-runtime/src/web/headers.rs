//! `Headers`: case-insensitive names, insertion-order iteration,
//! multi-value append with comma-joined `get`.

use std::cell::RefCell;
use std::rc::Rc;

use rquickjs::class::Trace;
use rquickjs::prelude::Opt;
use rquickjs::{Array, Class, Ctx, Exception, Function, JsLifetime, Object, Result, Value};

use super::support::undef;

#[rquickjs::class]
#[derive(Clone, Trace, JsLifetime)]
pub struct Headers {
    #[qjs(skip_trace)]
    entries: Rc<RefCell<Vec<(String, String)>>>,
}

impl Headers {
    pub(crate) fn from_pairs(pairs: Vec<(String, String)>) -> Self {
        let entries = pairs
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();
        Self {
            entries: Rc::new(RefCell::new(entries)),
        }
    }

    pub(crate) fn pairs(&self) -> Vec<(String, String)> {
        self.entries.borrow().clone()
    }

    pub(crate) fn first_value(&self, name: &str) -> Option<String> {
        let name = name.to_ascii_lowercase();
        self.entries
            .borrow()
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.clone())
    }

    fn fill_from_value<'js>(&self, ctx: &Ctx<'js>, init: &Value<'js>) -> Result<()> {
        if let Ok(other) = Class::<Headers>::from_js(ctx, init.clone()) {
            let pairs = other.borrow().pairs();
            self.entries.borrow_mut().extend(pairs);
            return Ok(());
        }
        if let Some(obj) = init.as_object() {
            if let Some(array) = obj.as_array() {
                for pair in array.iter::<Array>() {
                    let pair = pair?;
                    let name: String = pair.get(0)?;
                    let value: String = pair.get(1)?;
                    self.append_pair(&name, &value);
                }
                return Ok(());
            }
            for prop in obj.props::<String, String>() {
                let (name, value) = prop?;
                self.append_pair(&name, &value);
            }
            return Ok(());
        }
        Err(Exception::throw_type(
            ctx,
            "Headers init must be an object, an array of pairs, or a Headers",
        ))
    }

    fn append_pair(&self, name: &str, value: &str) {
        self.entries
            .borrow_mut()
            .push((name.to_ascii_lowercase(), value.trim().to_string()));
    }
}

use rquickjs::FromJs;

#[rquickjs::methods]
impl Headers {
    #[qjs(constructor)]
    pub fn new<'js>(ctx: Ctx<'js>, init: Opt<Value<'js>>) -> Result<Self> {
        let headers = Self {
            entries: Rc::new(RefCell::new(Vec::new())),
        };
        if let Some(init) = init.0 {
            if !init.is_undefined() && !init.is_null() {
                headers.fill_from_value(&ctx, &init)?;
            }
        }
        Ok(headers)
    }

    pub fn append(&self, name: String, value: String) {
        self.append_pair(&name, &value);
    }

    pub fn get(&self, name: String) -> Option<String> {
        let name = name.to_ascii_lowercase();
        let entries = self.entries.borrow();
        let values: Vec<&str> = entries
            .iter()
            .filter(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
            .collect();
        if values.is_empty() {
            None
        } else {
            Some(values.join(", "))
        }
    }

    #[qjs(rename = "getSetCookie")]
    pub fn get_set_cookie(&self) -> Vec<String> {
        self.entries
            .borrow()
            .iter()
            .filter(|(k, _)| k == "set-cookie")
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub fn has(&self, name: String) -> bool {
        let name = name.to_ascii_lowercase();
        self.entries.borrow().iter().any(|(k, _)| *k == name)
    }

    /// Replaces the first occurrence in place and drops the rest, so
    /// the name keeps its original position in iteration order.
    pub fn set(&self, name: String, value: String) {
        let name = name.to_ascii_lowercase();
        let value = value.trim().to_string();
        let mut entries = self.entries.borrow_mut();
        let mut replaced = false;
        entries.retain_mut(|(k, v)| {
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
            entries.push((name, value));
        }
    }

    pub fn delete(&self, name: String) {
        let name = name.to_ascii_lowercase();
        self.entries.borrow_mut().retain(|(k, _)| *k != name);
    }

    #[qjs(rename = "forEach")]
    pub fn for_each<'js>(&self, ctx: Ctx<'js>, callback: Function<'js>) -> Result<()> {
        for (name, value) in self.pairs() {
            callback.call::<_, ()>((value, name, undef(&ctx)))?;
        }
        Ok(())
    }

    pub fn entries<'js>(&self, ctx: Ctx<'js>) -> Result<Value<'js>> {
        let array = Array::new(ctx.clone())?;
        for (i, (name, value)) in self.pairs().into_iter().enumerate() {
            let pair = Array::new(ctx.clone())?;
            pair.set(0, name)?;
            pair.set(1, value)?;
            array.set(i, pair)?;
        }
        array_iterator(&ctx, array)
    }

    pub fn keys<'js>(&self, ctx: Ctx<'js>) -> Result<Value<'js>> {
        let array = Array::new(ctx.clone())?;
        for (i, (name, _)) in self.pairs().into_iter().enumerate() {
            array.set(i, name)?;
        }
        array_iterator(&ctx, array)
    }

    pub fn values<'js>(&self, ctx: Ctx<'js>) -> Result<Value<'js>> {
        let array = Array::new(ctx.clone())?;
        for (i, (_, value)) in self.pairs().into_iter().enumerate() {
            array.set(i, value)?;
        }
        array_iterator(&ctx, array)
    }
}

/// Borrows the standard array iterator for a snapshot array.
pub(crate) fn array_iterator<'js>(ctx: &Ctx<'js>, array: Array<'js>) -> Result<Value<'js>> {
    let obj = array.as_object();
    let values: Function = obj.get("values")?;
    let mut args = rquickjs::function::Args::new(ctx.clone(), 0);
    args.this(obj.clone())?;
    values.call_arg(args)
}

pub fn setup(ctx: &Ctx<'_>) -> Result<()> {
    let globals = ctx.globals();
    Class::<Headers>::define(&globals)?;

    // Symbol.iterator delegates to entries()
    let ctor: Object = globals.get("Headers")?;
    let proto: Object = ctor.get("prototype")?;
    let entries_fn: Function = proto.get("entries")?;
    proto.set(rquickjs::atom::PredefinedAtom::SymbolIterator, entries_fn)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::Headers;

    #[test]
    fn get_joins_multi_values_in_insertion_order() {
        let headers = Headers::from_pairs(vec![
            ("Accept".into(), "text/html".into()),
            ("ACCEPT".into(), "application/json".into()),
        ]);
        assert_eq!(
            headers.get("accept".into()),
            Some("text/html, application/json".into())
        );
    }

    #[test]
    fn set_replaces_in_place() {
        let headers = Headers::from_pairs(vec![
            ("a".into(), "1".into()),
            ("b".into(), "2".into()),
            ("a".into(), "3".into()),
        ]);
        headers.set("A".into(), "9".into());
        assert_eq!(headers.pairs(), vec![
            ("a".to_string(), "9".to_string()),
            ("b".to_string(), "2".to_string()),
        ]);
    }

    #[test]
    fn delete_removes_all_occurrences() {
        let headers = Headers::from_pairs(vec![
            ("x".into(), "1".into()),
            ("x".into(), "2".into()),
        ]);
        headers.delete("X".into());
        assert!(!headers.has("x".into()));
    }
}
