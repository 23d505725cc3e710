//! Conformance of the web-platform surface, exercised through full
//! engine executions.

use std::collections::HashMap;
use std::sync::Arc;

use hostedat_js::common::{WorkerRequest, WorkerResult};
use hostedat_js::{Engine, EngineConfig, Env, SourceLoader};

struct StaticSource(String);

impl SourceLoader for StaticSource {
    fn get_worker_script(&self, _site: &str, _deploy: &str) -> Result<String, String> {
        Ok(self.0.clone())
    }
}

fn engine_for(script: &str) -> Engine {
    Engine::new(
        EngineConfig::default(),
        Arc::new(StaticSource(script.to_string())),
    )
}

fn get(url: &str) -> WorkerRequest {
    WorkerRequest {
        method: "GET".into(),
        url: url.into(),
        headers: HashMap::new(),
        body: Vec::new(),
    }
}

fn body_text(result: &WorkerResult) -> String {
    let response = result
        .response
        .as_ref()
        .unwrap_or_else(|| panic!("expected a response, got error {:?}", result.error));
    String::from_utf8_lossy(&response.body).into_owned()
}

/// Runs a script whose fetch handler returns `Response.json(...)` and
/// yields the parsed body.
fn run_json(script: &str) -> serde_json::Value {
    let engine = engine_for(script);
    let result = engine.execute("site", "deploy", Env::default(), get("http://localhost/"));
    assert!(result.is_ok(), "{:?}", result.error);
    serde_json::from_str(&body_text(&result)).expect("handler returned JSON")
}

#[test]
fn stream_tee_branches_see_identical_chunks() {
    let value = run_json(
        r#"
        export default {
            async fetch() {
                const source = new ReadableStream({
                    start(controller) {
                        controller.enqueue("x");
                        controller.enqueue("y");
                        controller.enqueue("z");
                        controller.close();
                    }
                });
                const [a, b] = source.tee();
                async function collect(stream) {
                    const reader = stream.getReader();
                    const out = [];
                    for (;;) {
                        const { value, done } = await reader.read();
                        if (done) break;
                        out.push(value);
                    }
                    return out;
                }
                const left = await collect(a);
                const right = await collect(b);
                return Response.json({ left, right });
            }
        };
        "#,
    );
    assert_eq!(value["left"], serde_json::json!(["x", "y", "z"]));
    assert_eq!(value["right"], serde_json::json!(["x", "y", "z"]));
}

#[test]
fn transform_flush_output_precedes_done() {
    let value = run_json(
        r#"
        export default {
            async fetch() {
                let flushes = 0;
                const transform = new TransformStream({
                    transform(chunk, controller) {
                        controller.enqueue(chunk.toUpperCase());
                    },
                    flush(controller) {
                        flushes += 1;
                        controller.enqueue("END");
                    }
                });
                const writer = transform.writable.getWriter();
                const results = [];
                const reading = (async () => {
                    const reader = transform.readable.getReader();
                    for (;;) {
                        const { value, done } = await reader.read();
                        if (done) break;
                        results.push(value);
                    }
                })();
                await writer.write("a");
                await writer.write("b");
                await writer.close();
                await reading;
                return Response.json({ results, flushes });
            }
        };
        "#,
    );
    assert_eq!(value["results"], serde_json::json!(["A", "B", "END"]));
    assert_eq!(value["flushes"], serde_json::json!(1));
}

#[test]
fn pipe_through_and_async_iteration() {
    let value = run_json(
        r#"
        export default {
            async fetch() {
                const source = ReadableStream.from(["a", "b", "c"]);
                const upper = source.pipeThrough(new TransformStream({
                    transform(chunk, controller) {
                        controller.enqueue(chunk.toUpperCase());
                    }
                }));
                const seen = [];
                for await (const chunk of upper) {
                    seen.push(chunk);
                }
                return Response.json({ seen });
            }
        };
        "#,
    );
    assert_eq!(value["seen"], serde_json::json!(["A", "B", "C"]));
}

#[test]
fn fixed_length_stream_enforces_its_length() {
    let value = run_json(
        r#"
        export default {
            async fetch() {
                const exact = new FixedLengthStream(3);
                const writer = exact.writable.getWriter();
                const read = (async () => {
                    const reader = exact.readable.getReader();
                    let total = 0;
                    for (;;) {
                        const { value, done } = await reader.read();
                        if (done) break;
                        total += value.byteLength;
                    }
                    return total;
                })();
                await writer.write(new Uint8Array([1, 2, 3]));
                await writer.close();
                const total = await read;

                // writing past the declared length must fail
                const overflowing = new FixedLengthStream(1);
                const w2 = overflowing.writable.getWriter();
                let overflowError = null;
                try {
                    await w2.write(new Uint8Array([1, 2]));
                } catch (e) {
                    overflowError = String(e);
                }
                return Response.json({ total, overflowError });
            }
        };
        "#,
    );
    assert_eq!(value["total"], serde_json::json!(3));
    assert!(value["overflowError"]
        .as_str()
        .unwrap()
        .contains("fixed length"));
}

#[test]
fn byob_zero_length_view_throws() {
    let value = run_json(
        r#"
        export default {
            async fetch() {
                const stream = new ReadableStream({
                    start(controller) {
                        controller.enqueue(new Uint8Array([7]));
                        controller.close();
                    }
                });
                const reader = stream.getReader({ mode: "byob" });
                let threw = null;
                try {
                    await reader.read(new Uint8Array(0));
                } catch (e) {
                    threw = e instanceof TypeError;
                }
                const { value } = await reader.read(new Uint8Array(4));
                return Response.json({ threw, first: value[0] });
            }
        };
        "#,
    );
    assert_eq!(value["threw"], serde_json::json!(true));
    assert_eq!(value["first"], serde_json::json!(7));
}

#[test]
fn body_used_flips_on_consumption_and_lock() {
    let value = run_json(
        r#"
        export default {
            async fetch() {
                const fresh = new Response("abc");
                const before = fresh.bodyUsed;
                await fresh.text();
                const after = fresh.bodyUsed;

                const locked = new Response("xyz");
                locked.body.getReader();
                const lockedUsed = locked.bodyUsed;

                let secondReadFailed = false;
                try {
                    await fresh.text();
                } catch (e) {
                    secondReadFailed = e instanceof TypeError;
                }
                return Response.json({ before, after, lockedUsed, secondReadFailed });
            }
        };
        "#,
    );
    assert_eq!(value["before"], serde_json::json!(false));
    assert_eq!(value["after"], serde_json::json!(true));
    assert_eq!(value["lockedUsed"], serde_json::json!(true));
    assert_eq!(value["secondReadFailed"], serde_json::json!(true));
}

#[test]
fn base64_round_trips_latin1_with_nulls() {
    let value = run_json(
        r#"
        export default {
            fetch() {
                const s = "a\u0000bÿ!";
                const roundTrip = atob(btoa(s)) === s && atob(btoa(s)).charCodeAt(1) === 0;

                let rejectsWide = false;
                try { btoa("☃"); } catch (e) { rejectsWide = true; }

                let rejectsBadLength = false;
                try { atob("abcde"); } catch (e) { rejectsBadLength = true; }

                const tolerant = atob(" aGVs\nbG8 ") === "hello";
                return Response.json({ roundTrip, rejectsWide, rejectsBadLength, tolerant });
            }
        };
        "#,
    );
    assert_eq!(value["roundTrip"], serde_json::json!(true));
    assert_eq!(value["rejectsWide"], serde_json::json!(true));
    assert_eq!(value["rejectsBadLength"], serde_json::json!(true));
    assert_eq!(value["tolerant"], serde_json::json!(true));
}

#[test]
fn text_codec_streaming_and_labels() {
    let value = run_json(
        r#"
        export default {
            fetch() {
                const encoder = new TextEncoder();
                const bytes = encoder.encode("héllo");

                const decoder = new TextDecoder("UTF8");
                const label = decoder.encoding;

                // split a two-byte sequence across stream calls
                const streaming = new TextDecoder();
                const partOne = streaming.decode(bytes.slice(0, 2), { stream: true });
                const partTwo = streaming.decode(bytes.slice(2));

                const latin = new TextDecoder("latin1").encoding;

                let fatalThrew = false;
                try {
                    new TextDecoder("utf-8", { fatal: true }).decode(new Uint8Array([0xff]));
                } catch (e) {
                    fatalThrew = true;
                }
                return Response.json({ label, text: partOne + partTwo, latin, fatalThrew });
            }
        };
        "#,
    );
    assert_eq!(value["label"], serde_json::json!("utf-8"));
    assert_eq!(value["text"], serde_json::json!("héllo"));
    assert_eq!(value["latin"], serde_json::json!("windows-1252"));
    assert_eq!(value["fatalThrew"], serde_json::json!(true));
}

#[test]
fn abort_is_idempotent_and_reason_sticks() {
    let value = run_json(
        r#"
        export default {
            fetch() {
                const controller = new AbortController();
                let fired = 0;
                controller.signal.addEventListener("abort", () => { fired += 1; });
                controller.abort("first");
                controller.abort("second");
                const defaulted = AbortSignal.abort();
                return Response.json({
                    fired,
                    reason: controller.signal.reason,
                    aborted: controller.signal.aborted,
                    defaultName: defaulted.reason.name,
                    defaultCode: defaulted.reason.code,
                });
            }
        };
        "#,
    );
    assert_eq!(value["fired"], serde_json::json!(1));
    assert_eq!(value["reason"], serde_json::json!("first"));
    assert_eq!(value["aborted"], serde_json::json!(true));
    assert_eq!(value["defaultName"], serde_json::json!("AbortError"));
    assert_eq!(value["defaultCode"], serde_json::json!(20));
}

#[test]
fn abort_signal_timeout_and_any() {
    let value = run_json(
        r#"
        export default {
            async fetch() {
                const timed = AbortSignal.timeout(5);
                const combined = AbortSignal.any([timed]);
                await new Promise(resolve => setTimeout(resolve, 25));
                return Response.json({
                    timedOut: timed.aborted,
                    combinedAborted: combined.aborted,
                    reasonName: timed.reason.name,
                });
            }
        };
        "#,
    );
    assert_eq!(value["timedOut"], serde_json::json!(true));
    assert_eq!(value["combinedAborted"], serde_json::json!(true));
    assert_eq!(value["reasonName"], serde_json::json!("TimeoutError"));
}

#[test]
fn event_target_once_and_dispatch_result() {
    let value = run_json(
        r#"
        export default {
            fetch() {
                const target = new EventTarget();
                let count = 0;
                target.addEventListener("ping", () => { count += 1; }, { once: true });
                target.dispatchEvent(new Event("ping"));
                target.dispatchEvent(new Event("ping"));

                const cancelable = new Event("stop", { cancelable: true });
                target.addEventListener("stop", event => event.preventDefault());
                const notPrevented = target.dispatchEvent(cancelable);

                const rigid = new Event("stay");
                rigid.preventDefault();
                return Response.json({
                    count,
                    notPrevented,
                    rigidPrevented: rigid.defaultPrevented,
                });
            }
        };
        "#,
    );
    assert_eq!(value["count"], serde_json::json!(1));
    assert_eq!(value["notPrevented"], serde_json::json!(false));
    assert_eq!(value["rigidPrevented"], serde_json::json!(false));
}

#[test]
fn url_parsing_and_search_params() {
    let value = run_json(
        r#"
        export default {
            fetch() {
                const url = new URL("https://User:Pw@Example.COM:8443/a/../b?x=1&x=2#frag");
                const relative = new URL("/path?z=9", "https://base.example/ignored");
                const params = new URLSearchParams("a=1&b=two");
                params.append("a", "3");
                params.set("b", "2");
                url.searchParams.append("y", "space here");
                return Response.json({
                    host: url.host,
                    hostname: url.hostname,
                    pathname: url.pathname,
                    protocol: url.protocol,
                    hash: url.hash,
                    search: url.search,
                    relative: relative.href,
                    getAll: params.getAll("a"),
                    serialised: params.toString(),
                    canParse: URL.canParse("not a url"),
                });
            }
        };
        "#,
    );
    assert_eq!(value["host"], serde_json::json!("example.com:8443"));
    assert_eq!(value["hostname"], serde_json::json!("example.com"));
    assert_eq!(value["pathname"], serde_json::json!("/b"));
    assert_eq!(value["protocol"], serde_json::json!("https:"));
    assert_eq!(value["hash"], serde_json::json!("#frag"));
    assert!(value["search"].as_str().unwrap().contains("space+here"));
    assert_eq!(value["relative"], serde_json::json!("https://base.example/path?z=9"));
    assert_eq!(value["getAll"], serde_json::json!(["1", "3"]));
    assert_eq!(value["serialised"], serde_json::json!("a=1&b=2&a=3"));
    assert_eq!(value["canParse"], serde_json::json!(false));
}

#[test]
fn headers_preserve_insertion_order_and_join_values() {
    let value = run_json(
        r#"
        export default {
            fetch() {
                const headers = new Headers();
                headers.append("b-second", "2");
                headers.append("a-first", "1");
                headers.append("A-First", "3");
                const joined = headers.get("a-first");
                const names = [...headers.keys()];
                headers.set("a-first", "only");
                headers.delete("b-second");
                return Response.json({
                    joined,
                    names,
                    afterSet: headers.get("a-first"),
                    hasDeleted: headers.has("b-second"),
                });
            }
        };
        "#,
    );
    assert_eq!(value["joined"], serde_json::json!("1, 3"));
    assert_eq!(
        value["names"],
        serde_json::json!(["b-second", "a-first", "a-first"])
    );
    assert_eq!(value["afterSet"], serde_json::json!("only"));
    assert_eq!(value["hasDeleted"], serde_json::json!(false));
}

#[test]
fn form_data_and_multipart_round_trip() {
    let value = run_json(
        r#"
        export default {
            async fetch() {
                const form = new FormData();
                form.append("name", "alice");
                form.append("file", new File(["content"], "a.txt", { type: "text/plain" }));

                const request = new Request("http://localhost/upload", {
                    method: "POST",
                    body: form,
                });
                const parsed = await request.formData();
                const file = parsed.get("file");
                return Response.json({
                    name: parsed.get("name"),
                    fileName: file.name,
                    fileText: await file.text(),
                    contentType: request.headers.get("content-type").startsWith("multipart/form-data"),
                });
            }
        };
        "#,
    );
    assert_eq!(value["name"], serde_json::json!("alice"));
    assert_eq!(value["fileName"], serde_json::json!("a.txt"));
    assert_eq!(value["fileText"], serde_json::json!("content"));
    assert_eq!(value["contentType"], serde_json::json!(true));
}

#[test]
fn urlencoded_form_data_parses() {
    let engine = engine_for(
        r#"
        export default {
            async fetch(request) {
                const form = await request.formData();
                return Response.json({ a: form.get("a"), b: form.get("b") });
            }
        };
        "#,
    );
    let request = WorkerRequest {
        method: "POST".into(),
        url: "http://localhost/".into(),
        headers: HashMap::from([(
            "content-type".into(),
            "application/x-www-form-urlencoded".into(),
        )]),
        body: b"a=1&b=two+words".to_vec(),
    };
    let result = engine.execute("site", "deploy", Env::default(), request);
    assert!(result.is_ok(), "{:?}", result.error);
    let value: serde_json::Value = serde_json::from_str(&body_text(&result)).unwrap();
    assert_eq!(value["a"], serde_json::json!("1"));
    assert_eq!(value["b"], serde_json::json!("two words"));
}

#[test]
fn timer_ordering_and_clearing() {
    let value = run_json(
        r#"
        export default {
            async fetch() {
                const order = [];
                await new Promise(resolve => {
                    setTimeout(() => order.push("late"), 20);
                    setTimeout(() => order.push("early-a"), 1);
                    setTimeout(() => order.push("early-b"), 1);
                    const cancelled = setTimeout(() => order.push("never"), 1);
                    clearTimeout(cancelled);
                    queueMicrotask(() => order.push("micro"));
                    setTimeout(resolve, 40);
                });
                return Response.json({ order });
            }
        };
        "#,
    );
    assert_eq!(
        value["order"],
        serde_json::json!(["micro", "early-a", "early-b", "late"])
    );
}

#[test]
fn interval_fires_until_cleared() {
    let value = run_json(
        r#"
        export default {
            async fetch() {
                let ticks = 0;
                await new Promise(resolve => {
                    const id = setInterval(() => {
                        ticks += 1;
                        if (ticks === 3) {
                            clearInterval(id);
                            resolve();
                        }
                    }, 1);
                });
                return Response.json({ ticks });
            }
        };
        "#,
    );
    assert_eq!(value["ticks"], serde_json::json!(3));
}

#[test]
fn crypto_digest_hmac_and_aes() {
    let value = run_json(
        r#"
        export default {
            async fetch() {
                const data = new TextEncoder().encode("abc");
                const digest = new Uint8Array(await crypto.subtle.digest("SHA-256", data));
                const digestHex = [...digest].map(b => b.toString(16).padStart(2, "0")).join("");

                const hmacKey = await crypto.subtle.importKey(
                    "raw", new TextEncoder().encode("key"),
                    { name: "HMAC", hash: "SHA-256" }, false, ["sign", "verify"]);
                const mac = await crypto.subtle.sign("HMAC", hmacKey, data);
                const macOk = await crypto.subtle.verify("HMAC", hmacKey, mac, data);

                const aesKey = await crypto.subtle.generateKey(
                    { name: "AES-GCM", length: 256 }, true, ["encrypt", "decrypt"]);
                const iv = crypto.getRandomValues(new Uint8Array(12));
                const sealed = await crypto.subtle.encrypt({ name: "AES-GCM", iv }, aesKey, data);
                const opened = new Uint8Array(
                    await crypto.subtle.decrypt({ name: "AES-GCM", iv }, aesKey, sealed));

                const uuid = crypto.randomUUID();
                return Response.json({
                    digestHex,
                    macOk,
                    roundTrip: new TextDecoder().decode(opened),
                    uuidShape: /^[0-9a-f]{8}-[0-9a-f]{4}-4[0-9a-f]{3}-[0-9a-f]{4}-[0-9a-f]{12}$/.test(uuid),
                });
            }
        };
        "#,
    );
    assert_eq!(
        value["digestHex"],
        serde_json::json!("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
    );
    assert_eq!(value["macOk"], serde_json::json!(true));
    assert_eq!(value["roundTrip"], serde_json::json!("abc"));
    assert_eq!(value["uuidShape"], serde_json::json!(true));
}

#[test]
fn structured_clone_and_dom_exception() {
    let value = run_json(
        r#"
        export default {
            fetch() {
                const original = { nested: { list: [1, 2, 3] } };
                const clone = structuredClone(original);
                clone.nested.list.push(4);

                let cloneError = null;
                try { structuredClone(() => {}); } catch (e) { cloneError = e.name; }

                const notFound = new DOMException("missing", "NotFoundError");
                const unknown = new DOMException("odd", "TotallyMadeUp");
                return Response.json({
                    originalLen: original.nested.list.length,
                    cloneLen: clone.nested.list.length,
                    cloneError,
                    notFoundCode: notFound.code,
                    unknownCode: unknown.code,
                    isError: notFound instanceof Error,
                });
            }
        };
        "#,
    );
    assert_eq!(value["originalLen"], serde_json::json!(3));
    assert_eq!(value["cloneLen"], serde_json::json!(4));
    assert_eq!(value["cloneError"], serde_json::json!("DataCloneError"));
    assert_eq!(value["notFoundCode"], serde_json::json!(8));
    assert_eq!(value["unknownCode"], serde_json::json!(0));
    assert_eq!(value["isError"], serde_json::json!(true));
}

#[test]
fn response_statics_and_clone() {
    let value = run_json(
        r#"
        export default {
            async fetch() {
                const moved = Response.redirect("https://example.com/next", 301);
                const failed = Response.error();

                const original = new Response("shared body");
                const copy = original.clone();
                const first = await original.text();
                const second = await copy.text();
                return Response.json({
                    movedStatus: moved.status,
                    movedLocation: moved.headers.get("location"),
                    failedStatus: failed.status,
                    bodies: [first, second],
                });
            }
        };
        "#,
    );
    assert_eq!(value["movedStatus"], serde_json::json!(301));
    assert_eq!(
        value["movedLocation"],
        serde_json::json!("https://example.com/next")
    );
    assert_eq!(value["failedStatus"], serde_json::json!(0));
    assert_eq!(
        value["bodies"],
        serde_json::json!(["shared body", "shared body"])
    );
}

#[test]
fn streamed_response_body_is_drained() {
    let engine = engine_for(
        r#"
        export default {
            fetch() {
                const stream = new ReadableStream({
                    start(controller) {
                        controller.enqueue(new TextEncoder().encode("part one, "));
                        setTimeout(() => {
                            controller.enqueue(new TextEncoder().encode("part two"));
                            controller.close();
                        }, 5);
                    }
                });
                return new Response(stream);
            }
        };
        "#,
    );
    let result = engine.execute("site", "deploy", Env::default(), get("http://localhost/"));
    assert_eq!(body_text(&result), "part one, part two");
}
