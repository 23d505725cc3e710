//! D1 database bridges over SQLite.
//!
//! A bridge is opened per binding per request, file-backed under the
//! configured data directory (one database file per database id) or
//! in-memory when no directory is set. Handles are closed at request
//! teardown; `close` is idempotent.

use std::path::Path;

use hostedat_js_runtime::host::D1Database;
use parking_lot::Mutex;
use rusqlite::types::ValueRef;
use rusqlite::Connection;

pub(crate) struct D1Bridge {
    conn: Mutex<Option<Connection>>,
}

impl D1Bridge {
    pub(crate) fn open(data_dir: Option<&Path>, database_id: &str) -> Result<Self, String> {
        let conn = match data_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)
                    .map_err(|e| format!("cannot create D1 data dir: {e}"))?;
                // ids are opaque; keep the file name safe
                let safe: String = database_id
                    .chars()
                    .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
                    .collect();
                let path = dir.join(format!("{safe}.sqlite3"));
                Connection::open(path).map_err(|e| format!("cannot open D1 database: {e}"))?
            }
            None => Connection::open_in_memory()
                .map_err(|e| format!("cannot open in-memory D1 database: {e}"))?,
        };
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }
}

fn bind_param(
    stmt: &mut rusqlite::Statement<'_>,
    index: usize,
    value: &serde_json::Value,
) -> Result<(), String> {
    let result = match value {
        serde_json::Value::Null => stmt.raw_bind_parameter(index, rusqlite::types::Null),
        serde_json::Value::Bool(b) => stmt.raw_bind_parameter(index, i64::from(*b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                stmt.raw_bind_parameter(index, i)
            } else {
                stmt.raw_bind_parameter(index, n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => stmt.raw_bind_parameter(index, s.as_str()),
        other => stmt.raw_bind_parameter(index, other.to_string()),
    };
    result.map_err(|e| format!("cannot bind parameter {index}: {e}"))
}

fn column_to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::json!(i),
        ValueRef::Real(f) => serde_json::json!(f),
        ValueRef::Text(t) => serde_json::Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => serde_json::json!(b.to_vec()),
    }
}

impl D1Database for D1Bridge {
    fn query(&self, sql: &str, params_json: &str) -> Result<String, String> {
        let params: Vec<serde_json::Value> =
            serde_json::from_str(params_json).map_err(|e| format!("invalid parameters: {e}"))?;

        let guard = self.conn.lock();
        let conn = guard.as_ref().ok_or("database handle is closed")?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| format!("SQL prepare failed: {e}"))?;
        for (i, param) in params.iter().enumerate() {
            bind_param(&mut stmt, i + 1, param)?;
        }

        let column_names: Vec<String> =
            stmt.column_names().iter().map(|c| c.to_string()).collect();
        let mut rows = stmt.raw_query();
        let mut results = Vec::new();
        loop {
            match rows.next() {
                Ok(Some(row)) => {
                    let mut object = serde_json::Map::new();
                    for (i, name) in column_names.iter().enumerate() {
                        let value = row
                            .get_ref(i)
                            .map(column_to_json)
                            .unwrap_or(serde_json::Value::Null);
                        object.insert(name.clone(), value);
                    }
                    results.push(serde_json::Value::Object(object));
                }
                Ok(None) => break,
                Err(e) => return Err(format!("SQL query failed: {e}")),
            }
        }

        let payload = serde_json::json!({
            "results": results,
            "meta": { "rows_read": results.len() },
        });
        serde_json::to_string(&payload).map_err(|e| e.to_string())
    }

    fn exec(&self, sql: &str) -> Result<u64, String> {
        let guard = self.conn.lock();
        let conn = guard.as_ref().ok_or("database handle is closed")?;
        conn.execute_batch(sql)
            .map_err(|e| format!("SQL exec failed: {e}"))?;
        let count = sql
            .split(';')
            .filter(|stmt| !stmt.trim().is_empty())
            .count() as u64;
        Ok(count)
    }

    fn close(&self) {
        self.conn.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostedat_js_runtime::host::D1Database as _;

    #[test]
    fn query_round_trips_rows() {
        let db = D1Bridge::open(None, "test").unwrap();
        db.exec("create table people (name text, age integer)")
            .unwrap();
        db.query(
            "insert into people (name, age) values (?, ?)",
            r#"["alice", 30]"#,
        )
        .unwrap();
        let rows = db.query("select * from people", "[]").unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&rows).unwrap();
        assert_eq!(parsed["results"][0]["name"], "alice");
        assert_eq!(parsed["results"][0]["age"], 30);
    }

    #[test]
    fn file_backed_database_persists_within_dir(){
        let dir = tempfile::tempdir().unwrap();
        {
            let db = D1Bridge::open(Some(dir.path()), "db-1").unwrap();
            db.exec("create table t (x)").unwrap();
            db.query("insert into t values (?)", "[42]").unwrap();
            db.close();
        }
        let db = D1Bridge::open(Some(dir.path()), "db-1").unwrap();
        let rows = db.query("select x from t", "[]").unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&rows).unwrap();
        assert_eq!(parsed["results"][0]["x"], 42);
    }

    #[test]
    fn closed_handle_refuses_queries() {
        let db = D1Bridge::open(None, "test").unwrap();
        db.close();
        assert!(db.query("select 1", "[]").is_err());
        db.close(); // idempotent
    }
}
