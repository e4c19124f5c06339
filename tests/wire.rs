use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use featured_slots::engine::Settings;
use featured_slots::tenant::TenantManager;
use featured_slots::wire;

const PASSWORD: &str = "featured";

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server(settings: Settings) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("featured_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, 1000, settings));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, PASSWORD.to_string(), None).await;
            });
        }
    });

    addr
}

async fn connect_to(addr: SocketAddr, dbname: &str, password: &str) -> Result<tokio_postgres::Client, tokio_postgres::Error> {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(dbname)
        .user("featured")
        .password(password);

    let (client, connection) = config.connect(NoTls).await?;
    tokio::spawn(async move {
        let _ = connection.await;
    });
    Ok(client)
}

async fn connect(addr: SocketAddr, dbname: &str) -> tokio_postgres::Client {
    connect_to(addr, dbname, PASSWORD).await.unwrap()
}

async fn rows(client: &tokio_postgres::Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|msg| match msg {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

/// `(event_id, rank)` of every slot, display order.
async fn layout(client: &tokio_postgres::Client) -> Vec<(String, i32)> {
    rows(client, "SELECT * FROM featured_slots")
        .await
        .iter()
        .map(|row| {
            (
                row.get("event_id").unwrap().to_string(),
                row.get("rank").unwrap().parse().unwrap(),
            )
        })
        .collect()
}

async fn insert_returning_id(client: &tokio_postgres::Client, sql: &str) -> String {
    let rows = rows(client, sql).await;
    assert_eq!(rows.len(), 1);
    rows[0].get("id").unwrap().to_string()
}

fn sqlstate(err: &tokio_postgres::Error) -> Option<&SqlState> {
    err.code()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn insert_then_select() {
    let addr = start_test_server(Settings::default()).await;
    let client = connect(addr, "insert_select").await;

    client
        .batch_execute("INSERT INTO featured_slots (event_id, rank) VALUES ('evt_a', 1)")
        .await
        .unwrap();
    client
        .batch_execute("INSERT INTO featured_slots (event_id) VALUES ('evt_b')")
        .await
        .unwrap();

    assert_eq!(
        layout(&client).await,
        vec![("evt_a".to_string(), 1), ("evt_b".to_string(), 2)]
    );

    let all = rows(&client, "SELECT * FROM featured_slots").await;
    assert_eq!(all[0].get("is_active"), Some("t"));
    assert_eq!(all[0].get("starts_at"), None);
}

#[tokio::test]
async fn insert_at_rank_shifts_and_update_moves() {
    let addr = start_test_server(Settings::default()).await;
    let client = connect(addr, "shift_move").await;

    for (event, rank) in [("A", 1), ("B", 2), ("C", 3)] {
        client
            .batch_execute(&format!(
                "INSERT INTO featured_slots (event_id, rank) VALUES ('{event}', {rank})"
            ))
            .await
            .unwrap();
    }
    let d = insert_returning_id(
        &client,
        "INSERT INTO featured_slots (event_id, rank) VALUES ('D', 4) RETURNING id",
    )
    .await;

    client
        .batch_execute(&format!("UPDATE featured_slots SET rank = 2 WHERE id = '{d}'"))
        .await
        .unwrap();
    assert_eq!(
        layout(&client).await,
        vec![
            ("A".to_string(), 1),
            ("D".to_string(), 2),
            ("B".to_string(), 3),
            ("C".to_string(), 4),
        ]
    );

    client
        .batch_execute("INSERT INTO featured_slots (event_id, rank) VALUES ('X', 1)")
        .await
        .unwrap();
    assert_eq!(layout(&client).await[0], ("X".to_string(), 1));
    assert_eq!(layout(&client).await.len(), 5);
}

#[tokio::test]
async fn duplicate_insert_keeps_one_row() {
    let addr = start_test_server(Settings::default()).await;
    let client = connect(addr, "dup").await;

    let first = insert_returning_id(
        &client,
        "INSERT INTO featured_slots (event_id, rank) VALUES ('E', 5) RETURNING id",
    )
    .await;
    let second = insert_returning_id(
        &client,
        "INSERT INTO featured_slots (event_id, rank) VALUES ('E', 2) RETURNING id",
    )
    .await;

    assert_eq!(first, second);
    assert_eq!(layout(&client).await, vec![("E".to_string(), 2)]);
}

#[tokio::test]
async fn capacity_error_has_sqlstate() {
    let settings = Settings {
        max_active: 1,
        ..Settings::default()
    };
    let addr = start_test_server(settings).await;
    let client = connect(addr, "capacity").await;

    client
        .batch_execute("INSERT INTO featured_slots (event_id) VALUES ('a')")
        .await
        .unwrap();
    let err = client
        .batch_execute("INSERT INTO featured_slots (event_id) VALUES ('b')")
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some(&SqlState::PROGRAM_LIMIT_EXCEEDED));

    // Inactive slots are not capped.
    client
        .batch_execute("INSERT INTO featured_slots (event_id, is_active) VALUES ('b', false)")
        .await
        .unwrap();
    assert_eq!(layout(&client).await.len(), 2);
}

#[tokio::test]
async fn invalid_window_and_missing_row_errors() {
    let addr = start_test_server(Settings::default()).await;
    let client = connect(addr, "errors").await;

    let err = client
        .batch_execute(
            "INSERT INTO featured_slots (event_id, starts_at, ends_at) \
             VALUES ('evt', '2025-06-01T00:00:00Z', '2025-05-01T00:00:00Z')",
        )
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some(&SqlState::CHECK_VIOLATION));

    let err = client
        .batch_execute(&format!("DELETE FROM featured_slots WHERE id = '{}'", Ulid::new()))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some(&SqlState::NO_DATA_FOUND));

    let err = client
        .batch_execute("INSERT INTO featured_slots (event_id) VALUES ('')")
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some(&SqlState::INVALID_PARAMETER_VALUE));

    let err = client.batch_execute("DROP TABLE featured_slots").await.unwrap_err();
    assert_eq!(sqlstate(&err), Some(&SqlState::SYNTAX_ERROR));

    assert!(layout(&client).await.is_empty());
}

#[tokio::test]
async fn inverted_window_without_seconds_is_a_check_violation() {
    let addr = start_test_server(Settings::default()).await;
    let client = connect(addr, "window_minutes").await;

    let err = client
        .batch_execute(
            "INSERT INTO featured_slots (event_id, starts_at, ends_at) \
             VALUES ('E', '2025-06-01T00:00Z', '2025-05-01T00:00Z')",
        )
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some(&SqlState::CHECK_VIOLATION));
    assert!(layout(&client).await.is_empty());
}

#[tokio::test]
async fn batch_runs_every_statement() {
    let addr = start_test_server(Settings::default()).await;
    let client = connect(addr, "batch").await;

    client
        .batch_execute(
            "INSERT INTO featured_slots (event_id, rank) VALUES ('a', 1); \
             INSERT INTO featured_slots (event_id, rank) VALUES ('b', 2); \
             INSERT INTO featured_slots (event_id, rank) VALUES ('c', 1)",
        )
        .await
        .unwrap();
    assert_eq!(
        layout(&client).await,
        vec![
            ("c".to_string(), 1),
            ("a".to_string(), 2),
            ("b".to_string(), 3),
        ]
    );

    let messages = client
        .simple_query("SELECT * FROM featured_slots; SELECT * FROM featured_now WHERE at = 0")
        .await
        .unwrap();
    let completions = messages
        .iter()
        .filter(|m| matches!(m, SimpleQueryMessage::CommandComplete(_)))
        .count();
    assert_eq!(completions, 2);
}

#[tokio::test]
async fn batch_stops_at_first_failure() {
    let settings = Settings {
        max_active: 1,
        ..Settings::default()
    };
    let addr = start_test_server(settings).await;
    let client = connect(addr, "batch_failure").await;

    let err = client
        .batch_execute(
            "INSERT INTO featured_slots (event_id) VALUES ('first'); \
             INSERT INTO featured_slots (event_id) VALUES ('over_cap'); \
             INSERT INTO featured_slots (event_id, is_active) VALUES ('never', false)",
        )
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some(&SqlState::PROGRAM_LIMIT_EXCEEDED));
    assert_eq!(layout(&client).await, vec![("first".to_string(), 100)]);

    // One unparseable statement rejects the whole batch before anything runs.
    let err = client
        .batch_execute(
            "INSERT INTO featured_slots (event_id, is_active) VALUES ('x', false); DROP TABLE t",
        )
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some(&SqlState::SYNTAX_ERROR));
    assert_eq!(layout(&client).await.len(), 1);
}

#[tokio::test]
async fn featured_now_filters_by_instant() {
    let addr = start_test_server(Settings::default()).await;
    let client = connect(addr, "featured_now").await;

    client
        .batch_execute(
            "INSERT INTO featured_slots (event_id, rank, starts_at, ends_at) VALUES ('early', 1, 0, 1000); \
             INSERT INTO featured_slots (event_id, rank, starts_at) VALUES ('late', 2, 1000); \
             INSERT INTO featured_slots (event_id, rank, is_active) VALUES ('off', 3, false)",
        )
        .await
        .unwrap();

    let at = |t: i64| format!("SELECT * FROM featured_now WHERE at = {t}");
    let names = |rows: Vec<SimpleQueryRow>| -> Vec<String> {
        rows.iter()
            .map(|r| r.get("event_id").unwrap().to_string())
            .collect()
    };
    assert_eq!(names(rows(&client, &at(500)).await), vec!["early"]);
    assert_eq!(names(rows(&client, &at(1000)).await), vec!["late"]);
}

#[tokio::test]
async fn extended_protocol_with_parameters() {
    let addr = start_test_server(Settings::default()).await;
    let client = connect(addr, "extended").await;

    let id = insert_returning_id(
        &client,
        "INSERT INTO featured_slots (event_id, rank, ends_at) VALUES ('evt', 3, 5000) RETURNING id",
    )
    .await;

    let updated = client
        .execute(
            "UPDATE featured_slots SET rank = $1, ends_at = $2 WHERE id = $3",
            &[&"7", &"2025-06-01T00:00:00Z", &id],
        )
        .await
        .unwrap();
    assert_eq!(updated, 1);

    let rows = client
        .query("SELECT * FROM featured_slots WHERE id = $1", &[&id])
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.get::<_, String>("event_id"), "evt");
    assert_eq!(row.get::<_, i32>("rank"), 7);
    assert!(row.get::<_, bool>("is_active"));
    assert_eq!(row.get::<_, Option<i64>>("starts_at"), None);
    assert_eq!(row.get::<_, Option<i64>>("ends_at"), Some(1_748_736_000_000));
}

#[tokio::test]
async fn bound_value_containing_placeholder_is_stored_verbatim() {
    let addr = start_test_server(Settings::default()).await;
    let client = connect(addr, "bind_dollar").await;

    client
        .execute(
            "INSERT INTO featured_slots (rank, event_id) VALUES ($1, $2)",
            &[&"4", &"promo$1"],
        )
        .await
        .unwrap();
    assert_eq!(layout(&client).await, vec![("promo$1".to_string(), 4)]);
}

#[tokio::test]
async fn tenants_are_isolated_by_database() {
    let addr = start_test_server(Settings::default()).await;
    let a = connect(addr, "tenant_a").await;
    let b = connect(addr, "tenant_b").await;

    a.batch_execute("INSERT INTO featured_slots (event_id) VALUES ('only_a')")
        .await
        .unwrap();

    assert_eq!(layout(&a).await.len(), 1);
    assert!(layout(&b).await.is_empty());
}

#[tokio::test]
async fn wrong_password_is_rejected() {
    let addr = start_test_server(Settings::default()).await;
    assert!(connect_to(addr, "auth", "nope").await.is_err());
}
