//! The env bindings, backed by the in-memory reference stores.

use std::collections::HashMap;
use std::sync::Arc;

use hostedat_js::common::memory::{
    MemoryAssets, MemoryCacheStore, MemoryDurableObjectStore, MemoryKvStore, MemoryQueue,
    MemoryR2Store,
};
use hostedat_js::common::{KvStore, WorkerRequest, WorkerResponse, WorkerResult, WsMessage};
use hostedat_js::{
    Engine, EngineConfig, Env, ServiceTarget, SourceLoader, WorkerDispatcher,
};

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

fn json_body(result: &WorkerResult) -> serde_json::Value {
    let response = result
        .response
        .as_ref()
        .unwrap_or_else(|| panic!("expected a response, got error {:?}", result.error));
    serde_json::from_slice(&response.body).expect("handler returned JSON")
}

#[test]
fn kv_round_trip_with_json_metadata() {
    let engine = engine_for(
        r#"
        export default {
            async fetch(request, env) {
                await env.STORE.put("key", "v", { metadata: { tag: "test" } });
                const page = await env.STORE.list({ prefix: "key" });
                return Response.json({
                    metadata: page.keys[0].metadata,
                    complete: page.listComplete,
                });
            }
        };
        "#,
    );
    let kv = MemoryKvStore::new();
    let env = Env {
        kv: HashMap::from([("STORE".to_string(), kv as Arc<dyn KvStore>)]),
        ..Default::default()
    };
    let result = engine.execute("site", "deploy", env, get("http://localhost/"));
    let value = json_body(&result);
    // the metadata is the parsed object, not "[object Object]"
    assert_eq!(value["metadata"], serde_json::json!({ "tag": "test" }));
    assert_eq!(value["complete"], serde_json::json!(true));
}

#[test]
fn kv_cursor_pages_each_key_exactly_once() {
    let engine = engine_for(
        r#"
        export default {
            async fetch(request, env) {
                const seen = [];
                let cursor = undefined;
                for (;;) {
                    const page = await env.STORE.list({ prefix: "key", limit: 3, cursor });
                    for (const key of page.keys) seen.push(key.name);
                    if (page.listComplete) {
                        return Response.json({ seen, trailingCursor: page.cursor ?? null });
                    }
                    cursor = page.cursor;
                }
            }
        };
        "#,
    );
    let kv = MemoryKvStore::new();
    for i in 0..10 {
        kv.put(&format!("key{i:02}"), b"v".to_vec(), None, None)
            .unwrap();
    }
    kv.put("unrelated", b"v".to_vec(), None, None).unwrap();
    let env = Env {
        kv: HashMap::from([("STORE".to_string(), kv as Arc<dyn KvStore>)]),
        ..Default::default()
    };
    let value = json_body(&engine.execute("site", "deploy", env, get("http://localhost/")));
    let expected: Vec<String> = (0..10).map(|i| format!("key{i:02}")).collect();
    assert_eq!(value["seen"], serde_json::json!(expected));
    assert_eq!(value["trailingCursor"], serde_json::Value::Null);
}

#[test]
fn kv_get_types_and_delete() {
    let engine = engine_for(
        r#"
        export default {
            async fetch(request, env) {
                await env.STORE.put("json", JSON.stringify({ n: 7 }));
                const asJson = await env.STORE.get("json", "json");
                const asText = await env.STORE.get("json");
                const buf = await env.STORE.get("json", "arrayBuffer");
                await env.STORE.delete("json");
                const gone = await env.STORE.get("json");
                return Response.json({
                    n: asJson.n,
                    text: asText,
                    bytes: buf.byteLength,
                    gone,
                });
            }
        };
        "#,
    );
    let env = Env {
        kv: HashMap::from([(
            "STORE".to_string(),
            MemoryKvStore::new() as Arc<dyn KvStore>,
        )]),
        ..Default::default()
    };
    let value = json_body(&engine.execute("site", "deploy", env, get("http://localhost/")));
    assert_eq!(value["n"], serde_json::json!(7));
    assert_eq!(value["text"], serde_json::json!(r#"{"n":7}"#));
    assert_eq!(value["bytes"], serde_json::json!(7));
    assert_eq!(value["gone"], serde_json::Value::Null);
}

#[test]
fn r2_put_get_list_and_delete() {
    let engine = engine_for(
        r#"
        export default {
            async fetch(request, env) {
                await env.BUCKET.put("docs/a.txt", "alpha", {
                    customMetadata: { owner: "tests" },
                });
                await env.BUCKET.put("docs/b.txt", "beta");
                const object = await env.BUCKET.get("docs/a.txt");
                const listing = await env.BUCKET.list({ prefix: "docs/" });
                const head = await env.BUCKET.head("docs/b.txt");
                await env.BUCKET.delete(["docs/a.txt", "docs/b.txt"]);
                const afterDelete = await env.BUCKET.get("docs/a.txt");
                return Response.json({
                    text: await object.text(),
                    owner: object.customMetadata.owner,
                    keys: listing.objects.map(o => o.key),
                    headSize: head.size,
                    afterDelete,
                });
            }
        };
        "#,
    );
    let env = Env {
        storage: HashMap::from([(
            "BUCKET".to_string(),
            MemoryR2Store::new() as Arc<dyn hostedat_js::common::R2Store>,
        )]),
        ..Default::default()
    };
    let value = json_body(&engine.execute("site", "deploy", env, get("http://localhost/")));
    assert_eq!(value["text"], serde_json::json!("alpha"));
    assert_eq!(value["owner"], serde_json::json!("tests"));
    assert_eq!(value["keys"], serde_json::json!(["docs/a.txt", "docs/b.txt"]));
    assert_eq!(value["headSize"], serde_json::json!(4));
    assert_eq!(value["afterDelete"], serde_json::Value::Null);
}

#[test]
fn durable_object_storage_round_trip() {
    let engine = engine_for(
        r#"
        export default {
            async fetch(request, env) {
                const id = env.COUNTER.idFromName("main");
                const stub = env.COUNTER.get(id);
                await stub.storage.put("count", 41);
                const before = await stub.storage.get("count");
                await stub.storage.put("count", before + 1);
                const listing = await stub.storage.list({ prefix: "c" });
                const deleted = await stub.storage.delete("missing");
                return Response.json({
                    count: await stub.storage.get("count"),
                    listing,
                    deleted,
                });
            }
        };
        "#,
    );
    let env = Env {
        durable_objects: HashMap::from([(
            "COUNTER".to_string(),
            MemoryDurableObjectStore::new() as Arc<dyn hostedat_js::common::DurableObjectStore>,
        )]),
        ..Default::default()
    };
    let value = json_body(&engine.execute("site", "deploy", env, get("http://localhost/")));
    assert_eq!(value["count"], serde_json::json!(42));
    assert_eq!(value["listing"], serde_json::json!({ "count": 42 }));
    assert_eq!(value["deleted"], serde_json::json!(false));
}

#[test]
fn queue_send_and_send_batch() {
    let engine = engine_for(
        r#"
        export default {
            async fetch(request, env) {
                await env.JOBS.send({ kind: "single" });
                await env.JOBS.sendBatch([
                    { body: "plain text" },
                    { body: { kind: "batched" } },
                ]);
                return new Response("queued");
            }
        };
        "#,
    );
    let queue = MemoryQueue::new();
    let env = Env {
        queues: HashMap::from([(
            "JOBS".to_string(),
            queue.clone() as Arc<dyn hostedat_js::common::QueueSender>,
        )]),
        ..Default::default()
    };
    let result = engine.execute("site", "deploy", env, get("http://localhost/"));
    assert!(result.is_ok(), "{:?}", result.error);

    let messages = queue.messages.lock();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0].body, br#"{"kind":"single"}"#);
    assert_eq!(messages[0].content_type, "json");
    assert_eq!(messages[1].body, b"plain text");
    assert_eq!(messages[1].content_type, "text");
}

#[test]
fn cache_put_match_and_expiry_headers() {
    let engine = engine_for(
        r#"
        export default {
            async fetch(request, env) {
                const key = "http://cache.test/entry";
                const miss = await caches.default.match(key);
                await caches.default.put(key, new Response("cached body", {
                    headers: { "cache-control": "max-age=60", "x-tag": "yes" },
                }));
                const hit = await caches.default.match(key);
                const named = await caches.open("named");
                const namedMiss = await named.match(key);
                const deleted = await caches.default.delete(key);
                return Response.json({
                    missWasUndefined: miss === undefined,
                    hitText: await hit.text(),
                    hitTag: hit.headers.get("x-tag"),
                    namedMissUndefined: namedMiss === undefined,
                    deleted,
                });
            }
        };
        "#,
    );
    let env = Env {
        cache: Some(MemoryCacheStore::new()),
        ..Default::default()
    };
    let value = json_body(&engine.execute("site", "deploy", env, get("http://localhost/")));
    assert_eq!(value["missWasUndefined"], serde_json::json!(true));
    assert_eq!(value["hitText"], serde_json::json!("cached body"));
    assert_eq!(value["hitTag"], serde_json::json!("yes"));
    assert_eq!(value["namedMissUndefined"], serde_json::json!(true));
    assert_eq!(value["deleted"], serde_json::json!(true));
}

#[test]
fn d1_prepare_bind_and_exec() {
    let engine = engine_for(
        r#"
        export default {
            async fetch(request, env) {
                await env.DB.exec(
                    "create table people (name text, age integer);" +
                    "insert into people values ('seed', 1);"
                );
                await env.DB.prepare("insert into people (name, age) values (?, ?)")
                    .bind("alice", 30)
                    .run();
                const all = await env.DB.prepare("select * from people order by age").all();
                const first = await env.DB.prepare(
                    "select name from people where age = ?"
                ).bind(30).first("name");
                return Response.json({ rows: all.results, first });
            }
        };
        "#,
    );
    let env = Env {
        d1_bindings: HashMap::from([("DB".to_string(), "test-db".to_string())]),
        ..Default::default()
    };
    let value = json_body(&engine.execute("site", "deploy", env, get("http://localhost/")));
    assert_eq!(
        value["rows"],
        serde_json::json!([
            { "name": "seed", "age": 1 },
            { "name": "alice", "age": 30 },
        ])
    );
    assert_eq!(value["first"], serde_json::json!("alice"));
}

struct EchoDispatcher;

impl WorkerDispatcher for EchoDispatcher {
    fn execute(
        &self,
        site_id: &str,
        deploy_key: &str,
        _env: Env,
        req: WorkerRequest,
    ) -> WorkerResult {
        WorkerResult {
            response: Some(WorkerResponse {
                status_code: 200,
                headers: HashMap::from([("x-served-by".into(), "dispatcher".into())]),
                body: format!("{site_id}/{deploy_key} saw {} {}", req.method, req.url).into_bytes(),
                has_web_socket: false,
            }),
            ..Default::default()
        }
    }
}

#[test]
fn service_binding_routes_through_the_dispatcher() {
    let engine = engine_for(
        r#"
        export default {
            async fetch(request, env) {
                const upstream = await env.BACKEND.fetch("https://internal/widgets");
                return new Response(
                    (await upstream.text()) + " via " + upstream.headers.get("x-served-by"));
            }
        };
        "#,
    );
    engine.set_dispatcher(Arc::new(EchoDispatcher));
    let env = Env {
        service_bindings: HashMap::from([(
            "BACKEND".to_string(),
            ServiceTarget {
                site_id: "other-site".to_string(),
                deploy_key: "v9".to_string(),
            },
        )]),
        ..Default::default()
    };
    let result = engine.execute("site", "deploy", env, get("http://localhost/"));
    assert!(result.is_ok(), "{:?}", result.error);
    let body = String::from_utf8_lossy(&result.response.as_ref().unwrap().body).into_owned();
    assert_eq!(
        body,
        "other-site/v9 saw GET https://internal/widgets via dispatcher"
    );
}

#[test]
fn assets_binding_serves_files() {
    let engine = engine_for(
        r#"
        export default {
            async fetch(request, env) {
                const asset = await env.ASSETS.fetch(request);
                return new Response(await asset.text(), {
                    status: asset.status,
                    headers: { "content-type": asset.headers.get("content-type") },
                });
            }
        };
        "#,
    );
    let mut assets = MemoryAssets::default();
    assets.files.insert(
        "/hello.txt".to_string(),
        ("text/plain".to_string(), b"hello from assets".to_vec()),
    );
    let env = Env {
        assets: Some(Arc::new(assets)),
        ..Default::default()
    };
    let result = engine.execute("site", "deploy", env, get("http://localhost/hello.txt"));
    assert!(result.is_ok(), "{:?}", result.error);
    let response = result.response.as_ref().unwrap();
    assert_eq!(response.status_code, 200);
    assert_eq!(response.body, b"hello from assets");
}

#[test]
fn custom_bindings_install_opaque_values() {
    let engine = engine_for(
        r#"
        export default {
            fetch(request, env) {
                return Response.json({ answer: env.MAGIC.answer, label: env.MAGIC.label });
            }
        };
        "#,
    );
    let factory: hostedat_js::CustomBinding = Arc::new(|ctx| {
        let object = rquickjs::Object::new(ctx.clone())?;
        object.set("answer", 42)?;
        object.set("label", "from the host")?;
        Ok(object.into_value())
    });
    let env = Env {
        custom: HashMap::from([("MAGIC".to_string(), factory)]),
        ..Default::default()
    };
    let value = json_body(&engine.execute("site", "deploy", env, get("http://localhost/")));
    assert_eq!(value["answer"], serde_json::json!(42));
    assert_eq!(value["label"], serde_json::json!("from the host"));
}

#[test]
fn websocket_upgrade_surfaces_the_server_end() {
    let engine = engine_for(
        r#"
        export default {
            fetch(request) {
                const pair = new WebSocketPair();
                const client = pair[0];
                const server = pair[1];
                server.accept();
                server.send("welcome");
                return new Response(null, { status: 101, webSocket: client });
            }
        };
        "#,
    );
    let result = engine.execute("site", "deploy", Env::default(), get("http://localhost/ws"));
    assert!(result.is_ok(), "{:?}", result.error);
    let response = result.response.as_ref().unwrap();
    assert_eq!(response.status_code, 101);
    assert!(response.has_web_socket);

    let handle = result.web_socket.expect("socket handle on the result");
    assert!(handle.accepted());
    assert_eq!(handle.pop_outgoing(), Some(WsMessage::Text("welcome".into())));
    assert_eq!(handle.pop_outgoing(), None);
}

#[test]
fn websocket_validation_rules() {
    let engine = engine_for(
        r#"
        export default {
            fetch() {
                const pair = new WebSocketPair();
                const server = pair[1];

                let sendBeforeAccept = false;
                try { server.send("early"); } catch (e) { sendBeforeAccept = true; }

                server.accept();

                let badCode = false;
                try { server.close(2999); } catch (e) { badCode = true; }

                let longReason = false;
                try { server.close(1000, "x".repeat(124)); } catch (e) {
                    longReason = e.name === "SyntaxError";
                }

                let badProtocol = false;
                try { new WebSocket("wss://example.com", ["ok", "has space"]); } catch (e) {
                    badProtocol = e.name === "SyntaxError";
                }

                server.close(4000, "done");
                return Response.json({
                    sendBeforeAccept, badCode, longReason, badProtocol,
                    state: server.readyState,
                });
            }
        };
        "#,
    );
    let result = engine.execute("site", "deploy", Env::default(), get("http://localhost/"));
    let value = json_body(&result);
    assert_eq!(value["sendBeforeAccept"], serde_json::json!(true));
    assert_eq!(value["badCode"], serde_json::json!(true));
    assert_eq!(value["longReason"], serde_json::json!(true));
    assert_eq!(value["badProtocol"], serde_json::json!(true));
    assert_eq!(value["state"], serde_json::json!(3));
}

#[test]
fn websocket_pair_echoes_in_vm() {
    let engine = engine_for(
        r#"
        export default {
            async fetch() {
                const pair = new WebSocketPair();
                const client = pair[0];
                const server = pair[1];
                client.accept();
                server.accept();
                const received = [];
                client.addEventListener("message", event => received.push(event.data));
                server.send("one");
                server.send("two");
                return Response.json({ received });
            }
        };
        "#,
    );
    let value = json_body(&engine.execute("site", "deploy", Env::default(), get("http://x/")));
    assert_eq!(value["received"], serde_json::json!(["one", "two"]));
}
