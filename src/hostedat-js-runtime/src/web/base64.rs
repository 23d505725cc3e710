//! `atob` / `btoa` globals. Latin-1 only, per the HTML spec: `btoa`
//! rejects code points above 0xFF, `atob` tolerates ASCII whitespace
//! and missing padding but rejects `length % 4 == 1`, and null bytes
//! survive the round trip.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rquickjs::{Ctx, Exception, Function, Result, String as JsString};

#[rquickjs::function]
fn btoa(ctx: Ctx<'_>, data: String) -> Result<String> {
    let mut bytes = Vec::with_capacity(data.len());
    for ch in data.chars() {
        let cp = ch as u32;
        if cp > 0xFF {
            return Err(Exception::throw_message(
                &ctx,
                "btoa: the string contains characters outside of the Latin1 range",
            ));
        }
        bytes.push(cp as u8);
    }
    Ok(STANDARD.encode(bytes))
}

#[rquickjs::function]
fn atob(ctx: Ctx<'_>, data: String) -> Result<JsString<'_>> {
    let stripped: String = data
        .chars()
        .filter(|c| !matches!(c, ' ' | '\t' | '\n' | '\x0c' | '\r'))
        .collect();

    let mut padded = stripped.trim_end_matches('=').to_string();
    if padded.len() % 4 == 1 {
        return Err(Exception::throw_message(
            &ctx,
            "atob: the string to be decoded is not correctly encoded",
        ));
    }
    while padded.len() % 4 != 0 {
        padded.push('=');
    }

    let bytes = STANDARD
        .decode(padded.as_bytes())
        .map_err(|_| Exception::throw_message(&ctx, "atob: invalid base64 input"))?;

    // Each byte becomes the matching U+0000..U+00FF code point.
    let text: String = bytes.iter().map(|&b| b as char).collect();
    JsString::from_str(ctx, &text)
}

pub fn setup(ctx: &Ctx<'_>) -> Result<()> {
    let globals = ctx.globals();
    globals.set("btoa", Function::new(ctx.clone(), btoa)?.with_name("btoa")?)?;
    globals.set("atob", Function::new(ctx.clone(), atob)?.with_name("atob")?)?;
    Ok(())
}
