//! Behaviour of the module handlers: fetch, scheduled, tail and
//! arbitrary exports.

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

#[test]
fn echo() {
    let engine = engine_for(
        r#"
        export default {
            fetch(request) {
                return new Response("hello");
            }
        };
        "#,
    );

    let result = engine.execute("site", "deploy", Env::default(), get("http://localhost/"));
    assert!(result.is_ok(), "{:?}", result.error);
    let response = result.response.as_ref().unwrap();
    assert_eq!(response.status_code, 200);
    assert_eq!(body_text(&result), "hello");
}

#[test]
fn json_body_parse() {
    let engine = engine_for(
        r#"
        export default {
            async fetch(request) {
                const data = await request.json();
                return Response.json({ got: data.name });
            }
        };
        "#,
    );

    let request = WorkerRequest {
        method: "POST".into(),
        url: "http://localhost/".into(),
        headers: HashMap::from([("content-type".into(), "application/json".into())]),
        body: br#"{"name":"alice"}"#.to_vec(),
    };
    let result = engine.execute("site", "deploy", Env::default(), request);
    assert!(result.is_ok(), "{:?}", result.error);
    assert_eq!(body_text(&result), r#"{"got":"alice"}"#);
    let content_type = &result.response.as_ref().unwrap().headers["content-type"];
    assert_eq!(content_type, "application/json");
}

#[test]
fn request_properties_are_visible() {
    let engine = engine_for(
        r#"
        export default {
            async fetch(request) {
                const url = new URL(request.url);
                return Response.json({
                    method: request.method,
                    path: url.pathname,
                    q: url.searchParams.get("q"),
                    header: request.headers.get("x-probe"),
                });
            }
        };
        "#,
    );

    let request = WorkerRequest {
        method: "put".into(),
        url: "http://localhost/things?q=42".into(),
        headers: HashMap::from([("x-probe".into(), "yes".into())]),
        body: Vec::new(),
    };
    let result = engine.execute("site", "deploy", Env::default(), request);
    assert!(result.is_ok(), "{:?}", result.error);
    assert_eq!(
        body_text(&result),
        r#"{"method":"PUT","path":"/things","q":"42","header":"yes"}"#
    );
}

#[test]
fn handler_promise_is_awaited() {
    let engine = engine_for(
        r#"
        export default {
            async fetch(request) {
                await new Promise(resolve => setTimeout(resolve, 10));
                return new Response("after timer");
            }
        };
        "#,
    );
    let result = engine.execute("site", "deploy", Env::default(), get("http://localhost/"));
    assert_eq!(body_text(&result), "after timer");
}

#[test]
fn uncaught_exception_is_reported_and_isolate_survives() {
    let engine = engine_for(
        r#"
        export default {
            fetch(request) {
                if (new URL(request.url).pathname === "/boom") {
                    throw new Error("kaboom");
                }
                return new Response("fine");
            }
        };
        "#,
    );

    let failed = engine.execute("site", "deploy", Env::default(), get("http://localhost/boom"));
    let error = failed.error.expect("handler threw");
    assert!(error.contains("kaboom"), "{error}");

    // the isolate stays usable
    let ok = engine.execute("site", "deploy", Env::default(), get("http://localhost/"));
    assert_eq!(body_text(&ok), "fine");
}

#[test]
fn missing_fetch_export_is_an_error() {
    let engine = engine_for(
        r#"
        export default {
            scheduled(controller) {}
        };
        "#,
    );
    let result = engine.execute("site", "deploy", Env::default(), get("http://localhost/"));
    let error = result.error.expect("no fetch export");
    assert!(error.contains("fetch"), "{error}");
}

#[test]
fn non_response_return_is_an_error() {
    let engine = engine_for(
        r#"
        export default {
            fetch(request) {
                return { status: 200 };
            }
        };
        "#,
    );
    let result = engine.execute("site", "deploy", Env::default(), get("http://localhost/"));
    let error = result.error.expect("plain object is not a Response");
    assert!(error.contains("did not return a Response"), "{error}");
}

#[test]
fn console_logs_are_collected_per_request() {
    let engine = engine_for(
        r#"
        export default {
            fetch(request) {
                console.log("first", 1);
                console.warn({ nested: true });
                return new Response("ok");
            }
        };
        "#,
    );

    let result = engine.execute("site", "deploy", Env::default(), get("http://localhost/"));
    assert!(result.is_ok(), "{:?}", result.error);
    assert_eq!(result.logs.len(), 2);
    assert_eq!(result.logs[0].message, "first 1");
    assert_eq!(result.logs[1].message, r#"{"nested":true}"#);

    // a second request starts with an empty log buffer
    let again = engine.execute("site", "deploy", Env::default(), get("http://localhost/"));
    assert_eq!(again.logs.len(), 2);
}

#[test]
fn scheduled_export_runs_with_cron_metadata() {
    let engine = engine_for(
        r#"
        export default {
            async scheduled(controller, env, ctx) {
                console.log("cron", controller.cron, typeof controller.scheduledTime);
            }
        };
        "#,
    );
    let result = engine.execute_scheduled("site", "deploy", Env::default(), "*/5 * * * *");
    assert!(result.is_ok(), "{:?}", result.error);
    assert!(result.response.is_none());
    assert_eq!(result.logs[0].message, "cron */5 * * * * number");
}

#[test]
fn tail_export_receives_events() {
    let engine = engine_for(
        r#"
        export default {
            tail(events) {
                console.log("saw", events.length, "events");
            }
        };
        "#,
    );
    let events = serde_json::json!([{ "outcome": "ok" }, { "outcome": "exception" }]);
    let result = engine.execute_tail("site", "deploy", Env::default(), events);
    assert!(result.is_ok(), "{:?}", result.error);
    assert_eq!(result.logs[0].message, "saw 2 events");
}

#[test]
fn arbitrary_export_returns_json() {
    let engine = engine_for(
        r#"
        export default {
            async add(a, b) {
                return { sum: a + b };
            }
        };
        "#,
    );
    let result = engine.execute_function(
        "site",
        "deploy",
        Env::default(),
        "add",
        &[serde_json::json!(2), serde_json::json!(40)],
    );
    assert!(result.is_ok(), "{:?}", result.error);
    assert_eq!(result.data, Some(serde_json::json!({ "sum": 42 })));
}

#[test]
fn wait_until_runs_after_the_response() {
    let engine = engine_for(
        r#"
        export default {
            fetch(request, env, ctx) {
                ctx.waitUntil((async () => {
                    await new Promise(resolve => setTimeout(resolve, 5));
                    console.log("background done");
                })());
                return new Response("sent");
            }
        };
        "#,
    );
    let result = engine.execute("site", "deploy", Env::default(), get("http://localhost/"));
    assert_eq!(body_text(&result), "sent");
    assert!(result
        .logs
        .iter()
        .any(|l| l.message == "background done"));
}

#[test]
fn wait_until_rejection_is_logged_not_fatal() {
    let engine = engine_for(
        r#"
        export default {
            fetch(request, env, ctx) {
                ctx.waitUntil(Promise.reject(new Error("background boom")));
                return new Response("sent");
            }
        };
        "#,
    );
    let result = engine.execute("site", "deploy", Env::default(), get("http://localhost/"));
    assert!(result.is_ok(), "{:?}", result.error);
    assert!(result
        .logs
        .iter()
        .any(|l| l.message.contains("background boom")));
}

#[test]
fn vars_and_secrets_are_plain_strings() {
    let engine = engine_for(
        r#"
        export default {
            fetch(request, env) {
                return new Response(env.GREETING + " / " + env.API_KEY);
            }
        };
        "#,
    );
    let env = Env {
        vars: HashMap::from([("GREETING".to_string(), "hi".to_string())]),
        secrets: HashMap::from([("API_KEY".to_string(), "s3cret".to_string())]),
        ..Default::default()
    };
    let result = engine.execute("site", "deploy", env, get("http://localhost/"));
    assert_eq!(body_text(&result), "hi / s3cret");
}
