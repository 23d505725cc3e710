//! The web-platform globals installed on every isolate.

use rquickjs::{Ctx, Result};

use crate::core::SharedCore;

pub(crate) mod base64;
pub(crate) mod blob;
pub(crate) mod body;
pub(crate) mod cache;
pub(crate) mod console;
pub(crate) mod crypto;
pub(crate) mod encoding;
pub(crate) mod events;
pub(crate) mod fetch;
pub(crate) mod headers;
pub(crate) mod misc;
pub(crate) mod request;
pub(crate) mod response;
pub(crate) mod sockets;
pub(crate) mod streams;
pub(crate) mod support;
pub(crate) mod textstreams;
pub(crate) mod timers;
pub(crate) mod url;
pub(crate) mod websocket;

pub use response::{Extraction, ResponseOut};

/// Installs every global in dependency order. The sequence is fixed:
/// codecs, encoding, streams, the web API classes, abort plumbing,
/// timers, console, fetch, WebSocket, cache, TCP sockets, and finally
/// the text stream classes that sit on top of the transforms.
pub fn install(ctx: &Ctx<'_>, core: &SharedCore) -> Result<()> {
    base64::setup(ctx)?;
    encoding::setup(ctx)?;
    streams::setup(ctx)?;
    headers::setup(ctx)?;
    url::setup(ctx)?;
    blob::setup(ctx)?;
    request::setup(ctx)?;
    response::setup(ctx)?;
    crypto::setup(ctx)?;
    misc::setup(ctx, core)?;
    events::setup(ctx, core)?;
    timers::setup(ctx, core)?;
    console::setup(ctx, core)?;
    fetch::setup(ctx, core)?;
    websocket::setup(ctx)?;
    cache::setup(ctx, core)?;
    sockets::setup(ctx, core)?;
    textstreams::setup(ctx)?;
    Ok(())
}
