//! Deadlines, resource caps, SSRF refusal and pool lifecycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use hostedat_js::common::WorkerRequest;
use hostedat_js::{Engine, EngineConfig, Env, SourceLoader};

struct StaticSource(String);

impl SourceLoader for StaticSource {
    fn get_worker_script(&self, _site: &str, _deploy: &str) -> Result<String, String> {
        Ok(self.0.clone())
    }
}

fn engine_with(config: EngineConfig, script: &str) -> Engine {
    Engine::new(config, Arc::new(StaticSource(script.to_string())))
}

fn get(url: &str) -> WorkerRequest {
    WorkerRequest {
        method: "GET".into(),
        url: url.into(),
        headers: HashMap::new(),
        body: Vec::new(),
    }
}

#[test]
fn infinite_loop_hits_the_deadline_and_pool_recovers() {
    let config = EngineConfig {
        execution_timeout_ms: 500,
        ..Default::default()
    };
    let engine = engine_with(
        config,
        r#"
        export default {
            fetch(request) {
                if (new URL(request.url).pathname === "/loop") {
                    for (;;) {}
                }
                return new Response("alive");
            }
        };
        "#,
    );

    let started = Instant::now();
    let result = engine.execute("site", "deploy", Env::default(), get("http://localhost/loop"));
    let elapsed = started.elapsed();
    let error = result.error.expect("infinite loop must time out");
    assert!(error.contains("timed out"), "{error}");
    assert!(
        elapsed.as_millis() < 2_000,
        "took {}ms, expected prompt termination",
        elapsed.as_millis()
    );

    // the next request on the same pool succeeds
    let ok = engine.execute("site", "deploy", Env::default(), get("http://localhost/"));
    assert!(ok.is_ok(), "{:?}", ok.error);
    assert_eq!(ok.response.unwrap().body, b"alive");
}

#[test]
fn stalled_promise_hits_the_deadline() {
    let config = EngineConfig {
        execution_timeout_ms: 300,
        ..Default::default()
    };
    let engine = engine_with(
        config,
        r#"
        export default {
            async fetch() {
                await new Promise(() => {});
                return new Response("unreachable");
            }
        };
        "#,
    );
    let result = engine.execute("site", "deploy", Env::default(), get("http://localhost/"));
    let error = result.error.expect("stalled handler must time out");
    assert!(error.contains("timed out"), "{error}");
}

#[test]
fn oversized_response_is_a_hard_error() {
    let config = EngineConfig {
        max_response_bytes: 16,
        ..Default::default()
    };
    let engine = engine_with(
        config,
        r#"
        export default {
            fetch() {
                return new Response("x".repeat(1000));
            }
        };
        "#,
    );
    let result = engine.execute("site", "deploy", Env::default(), get("http://localhost/"));
    let error = result.error.expect("oversized body must fail");
    assert!(error.contains("exceeds"), "{error}");
    assert!(result.response.is_none());
}

#[test]
fn oversized_stream_response_is_a_hard_error() {
    let config = EngineConfig {
        max_response_bytes: 16,
        ..Default::default()
    };
    let engine = engine_with(
        config,
        r#"
        export default {
            fetch() {
                const stream = new ReadableStream({
                    start(controller) {
                        controller.enqueue(new TextEncoder().encode("x".repeat(64)));
                        controller.close();
                    }
                });
                return new Response(stream);
            }
        };
        "#,
    );
    let result = engine.execute("site", "deploy", Env::default(), get("http://localhost/"));
    let error = result.error.expect("oversized stream body must fail");
    assert!(error.contains("limit"), "{error}");
}

#[test]
fn fetch_counter_rejects_over_the_cap() {
    let config = EngineConfig {
        max_fetch_requests: 0,
        ..Default::default()
    };
    let engine = engine_with(
        config,
        r#"
        export default {
            async fetch() {
                try {
                    await fetch("https://example.com/");
                    return new Response("unexpectedly allowed");
                } catch (e) {
                    return new Response(e.message);
                }
            }
        };
        "#,
    );
    let result = engine.execute("site", "deploy", Env::default(), get("http://localhost/"));
    assert!(result.is_ok(), "{:?}", result.error);
    let body = String::from_utf8_lossy(&result.response.unwrap().body).into_owned();
    assert!(body.contains("too many subrequests"), "{body}");
}

#[test]
fn ssrf_guard_refuses_loopback_fetch() {
    let engine = engine_with(
        EngineConfig::default(),
        r#"
        export default {
            async fetch() {
                try {
                    await fetch("http://127.0.0.1/");
                    return new Response("unexpectedly allowed");
                } catch (e) {
                    return new Response(e.message);
                }
            }
        };
        "#,
    );
    let result = engine.execute("site", "deploy", Env::default(), get("http://localhost/"));
    assert!(result.is_ok(), "{:?}", result.error);
    let body = String::from_utf8_lossy(&result.response.unwrap().body).into_owned();
    assert!(body.contains("loopback"), "{body}");
}

#[test]
fn ssrf_guard_refuses_localhost_tcp_connect() {
    let engine = engine_with(
        EngineConfig::default(),
        r#"
        export default {
            async fetch() {
                const socket = connect("localhost:6379");
                try {
                    await socket.opened;
                    return new Response("unexpectedly allowed");
                } catch (e) {
                    return new Response(e.message);
                }
            }
        };
        "#,
    );
    let result = engine.execute("site", "deploy", Env::default(), get("http://localhost/"));
    assert!(result.is_ok(), "{:?}", result.error);
    let body = String::from_utf8_lossy(&result.response.unwrap().body).into_owned();
    assert!(body.contains("localhost"), "{body}");
}

#[test]
fn socket_limit_is_enforced_per_request() {
    let config = EngineConfig {
        max_sockets_per_request: 2,
        ..Default::default()
    };
    let engine = engine_with(
        config,
        r#"
        export default {
            fetch() {
                connect("one.example:443");
                connect("two.example:443");
                try {
                    connect("three.example:443");
                    return new Response("unexpectedly allowed");
                } catch (e) {
                    return new Response(e.message);
                }
            }
        };
        "#,
    );
    let result = engine.execute("site", "deploy", Env::default(), get("http://localhost/"));
    assert!(result.is_ok(), "{:?}", result.error);
    let body = String::from_utf8_lossy(&result.response.unwrap().body).into_owned();
    assert!(body.contains("too many open sockets"), "{body}");
}

struct VersionedSource;

impl SourceLoader for VersionedSource {
    fn get_worker_script(&self, _site: &str, _deploy: &str) -> Result<String, String> {
        Err("this loader only serves explicit compiles".to_string())
    }
}

#[test]
fn invalidate_then_recompile_switches_versions() {
    let engine = Engine::new(EngineConfig::default(), Arc::new(VersionedSource));
    let v1 = r#"export default { fetch() { return new Response("v1"); } };"#;
    let v2 = r#"export default { fetch() { return new Response("v2"); } };"#;

    engine.compile_and_cache("site", "deploy", v1).unwrap();
    let first = engine.execute("site", "deploy", Env::default(), get("http://localhost/"));
    assert_eq!(first.response.unwrap().body, b"v1");

    engine.invalidate_pool("site", "deploy");
    engine.compile_and_cache("site", "deploy", v2).unwrap();

    for _ in 0..3 {
        let result = engine.execute("site", "deploy", Env::default(), get("http://localhost/"));
        assert_eq!(result.response.unwrap().body, b"v2");
    }
}

#[test]
fn compile_errors_are_reported_not_cached() {
    let engine = Engine::new(EngineConfig::default(), Arc::new(VersionedSource));
    let err = engine
        .compile_and_cache("site", "deploy", "export default {{{")
        .unwrap_err();
    assert!(err.to_string().contains("compile error"), "{err}");

    // a good compile afterwards works
    engine
        .compile_and_cache("site", "deploy", r#"export default { fetch() { return new Response("ok"); } };"#)
        .unwrap();
    let result = engine.execute("site", "deploy", Env::default(), get("http://localhost/"));
    assert!(result.is_ok(), "{:?}", result.error);
}

#[test]
fn oversized_script_is_rejected() {
    let config = EngineConfig {
        max_script_size_kb: 1,
        ..Default::default()
    };
    let engine = Engine::new(config, Arc::new(VersionedSource));
    let big = format!(
        "export default {{ fetch() {{ return new Response(\"{}\"); }} }};",
        "x".repeat(4096)
    );
    let err = engine.compile_and_cache("site", "deploy", &big).unwrap_err();
    assert!(err.to_string().contains("exceeds"), "{err}");
}

#[test]
fn shutdown_refuses_new_work() {
    let engine = engine_with(
        EngineConfig::default(),
        r#"export default { fetch() { return new Response("ok"); } };"#,
    );
    let warm = engine.execute("site", "deploy", Env::default(), get("http://localhost/"));
    assert!(warm.is_ok(), "{:?}", warm.error);

    engine.shutdown();
    let result = engine.execute("site", "deploy", Env::default(), get("http://localhost/"));
    let error = result.error.expect("shut-down engine must refuse work");
    assert!(error.contains("shut down"), "{error}");
}

#[test]
fn isolates_are_reused_but_request_state_is_not() {
    let engine = engine_with(
        EngineConfig {
            pool_size: 1,
            ..Default::default()
        },
        r#"
        globalThis.callCount = 0;
        export default {
            fetch() {
                globalThis.callCount += 1;
                console.log("call", globalThis.callCount);
                return new Response(String(globalThis.callCount));
            }
        };
        "#,
    );

    let first = engine.execute("site", "deploy", Env::default(), get("http://localhost/"));
    let second = engine.execute("site", "deploy", Env::default(), get("http://localhost/"));

    // same isolate: module state persists across requests
    assert_eq!(first.response.unwrap().body, b"1");
    assert_eq!(second.response.unwrap().body, b"2");
    // but per-request state does not: each result only carries its own log
    assert_eq!(first.logs.len(), 1);
    assert_eq!(second.logs.len(), 1);
    assert_eq!(second.logs[0].message, "call 2");
}

#[test]
fn concurrent_executions_never_share_an_isolate() {
    let engine = Arc::new(engine_with(
        EngineConfig {
            pool_size: 4,
            ..Default::default()
        },
        r#"
        export default {
            async fetch(request) {
                // interleave across the pool
                await new Promise(resolve => setTimeout(resolve, 10));
                return new Response(new URL(request.url).pathname);
            }
        };
        "#,
    ));

    let mut handles = Vec::new();
    for i in 0..8 {
        let engine = engine.clone();
        handles.push(std::thread::spawn(move || {
            let url = format!("http://localhost/{i}");
            let result = engine.execute("site", "deploy", Env::default(), get(&url));
            assert!(result.is_ok(), "{:?}", result.error);
            assert_eq!(result.response.unwrap().body, format!("/{i}").into_bytes());
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
}
