use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use holdfast::tenant::TenantManager;
use holdfast::wire;

const PASSWORD: &str = "holdfast";

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<TenantManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("holdfast_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, 1000, Duration::from_secs(5)));

    let tm2 = tm.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, PASSWORD.to_string(), None).await;
            });
        }
    });

    (addr, tm)
}

async fn connect_db(addr: SocketAddr, db: &str, password: &str) -> Result<Client, tokio_postgres::Error> {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(db)
        .user("holdfast")
        .password(password);

    let (client, connection) = config.connect(NoTls).await?;
    tokio::spawn(async move {
        let _ = connection.await;
    });
    Ok(client)
}

async fn connect(addr: SocketAddr) -> Client {
    connect_db(addr, "test", PASSWORD).await.unwrap()
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(r) => Some(r),
            _ => None,
        })
        .collect()
}

/// SQLSTATE of a failed statement.
async fn sqlstate(client: &Client, sql: &str) -> String {
    let err = client.simple_query(sql).await.unwrap_err();
    err.code().map(|c| c.code().to_string()).unwrap_or_default()
}

async fn seed(client: &Client, stock: u32) -> (Ulid, Ulid, String) {
    let rid = Ulid::new();
    let hid = Ulid::new();
    let contact = format!("{hid}@example.com").to_lowercase();
    client
        .batch_execute(&format!(
            "INSERT INTO resources (id, name, description, stock) VALUES ('{rid}', 'lamp', NULL, {stock})"
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!("INSERT INTO holders (id, contact) VALUES ('{hid}', '{contact}')"))
        .await
        .unwrap();
    (rid, hid, contact)
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn reserve_returns_updated_row() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;
    let (rid, hid, _) = seed(&client, 3).await;

    let result = rows(
        &client,
        &format!("INSERT INTO claims (holder, resource_id) VALUES ('{hid}', '{rid}')"),
    )
    .await;
    assert_eq!(result.len(), 1);
    let row = &result[0];
    assert_eq!(row.get("id"), Some(rid.to_string().as_str()));
    assert_eq!(row.get("name"), Some("lamp"));
    assert_eq!(row.get("description"), None);
    assert_eq!(row.get("stock"), Some("2"));
    assert_eq!(row.get("initial_stock"), Some("3"));
    assert_eq!(row.get("popularity"), Some("1"));
}

#[tokio::test]
async fn reserve_and_release_by_contact() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;
    let (rid, hid, contact) = seed(&client, 1).await;

    rows(
        &client,
        &format!("INSERT INTO claims (holder, resource_id) VALUES ('{contact}', '{rid}')"),
    )
    .await;
    client
        .batch_execute(&format!(
            "DELETE FROM claims WHERE holder = '{contact}' AND resource_id = '{rid}'"
        ))
        .await
        .unwrap();

    let history = rows(&client, &format!("SELECT * FROM claims WHERE holder = '{hid}'")).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].get("resource_id"), Some(rid.to_string().as_str()));
    assert!(history[0].get("released_at").is_some());

    let resource = rows(&client, &format!("SELECT * FROM resources WHERE id = '{rid}'")).await;
    assert_eq!(resource[0].get("stock"), Some("1"));
    assert_eq!(resource[0].get("popularity"), Some("1"));
}

#[tokio::test]
async fn business_errors_map_to_sqlstate() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;
    let (rid, hid, _) = seed(&client, 1).await;
    let (other, _, _) = seed(&client, 0).await;

    let reserve = |h: String, r: Ulid| format!("INSERT INTO claims (holder, resource_id) VALUES ('{h}', '{r}')");

    assert_eq!(sqlstate(&client, &reserve(hid.to_string(), other)).await, "P0001");
    rows(&client, &reserve(hid.to_string(), rid)).await;
    assert_eq!(sqlstate(&client, &reserve(hid.to_string(), rid)).await, "P0001");
    assert_eq!(
        sqlstate(&client, &reserve("nobody@example.com".into(), rid)).await,
        "P0002"
    );
    assert_eq!(sqlstate(&client, &reserve(hid.to_string(), Ulid::new())).await, "P0002");
    assert_eq!(
        sqlstate(
            &client,
            &format!("DELETE FROM claims WHERE holder = '{hid}' AND resource_id = '{other}'")
        )
        .await,
        "P0001"
    );
    assert_eq!(
        sqlstate(&client, &format!("INSERT INTO resources (id) VALUES ('{rid}')")).await,
        "23505"
    );
    assert_eq!(sqlstate(&client, "SELECT * FROM nowhere").await, "42601");
    assert_eq!(sqlstate(&client, "UPDATE resources SET stock = 1").await, "42601");
}

#[tokio::test]
async fn catalog_queries() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    assert_eq!(sqlstate(&client, "SELECT * FROM top_resource").await, "P0002");

    let (plenty, hid, _) = seed(&client, 10).await;
    let (low, _, _) = seed(&client, 2).await;
    let (empty, _, _) = seed(&client, 0).await;

    assert_eq!(rows(&client, "SELECT * FROM resources").await.len(), 3);

    let ids = |rs: Vec<SimpleQueryRow>| rs.iter().map(|r| r.get("id").unwrap_or_default().to_string()).collect::<Vec<_>>();
    let available = ids(rows(&client, "SELECT * FROM resources WHERE stock > 0").await);
    assert!(available.contains(&plenty.to_string()));
    assert!(available.contains(&low.to_string()));
    assert!(!available.contains(&empty.to_string()));

    let low_stock = ids(rows(&client, "SELECT * FROM low_stock").await);
    assert_eq!(low_stock.len(), 2);
    assert!(!low_stock.contains(&plenty.to_string()));

    rows(
        &client,
        &format!("INSERT INTO claims (holder, resource_id) VALUES ('{hid}', '{low}')"),
    )
    .await;
    let top = rows(&client, "SELECT * FROM top_resource").await;
    assert_eq!(top[0].get("id"), Some(low.to_string().as_str()));
}

#[tokio::test]
async fn extended_protocol_binds_parameters() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;
    let (rid, hid, _) = seed(&client, 4).await;

    let reserved = client
        .query(
            "INSERT INTO claims (holder, resource_id) VALUES ($1, $2)",
            &[&hid.to_string(), &rid.to_string()],
        )
        .await
        .unwrap();
    assert_eq!(reserved.len(), 1);
    assert_eq!(reserved[0].get::<_, i64>("stock"), 3);

    let row = client
        .query_one("SELECT * FROM resources WHERE id = $1", &[&rid.to_string()])
        .await
        .unwrap();
    assert_eq!(row.get::<_, String>("id"), rid.to_string());
    assert_eq!(row.get::<_, Option<String>>("name").as_deref(), Some("lamp"));
    assert_eq!(row.get::<_, i64>("popularity"), 1);
}

#[tokio::test]
async fn bound_values_containing_placeholders_stay_literal() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;
    let rid = Ulid::new();
    let hid = Ulid::new();
    let contact = "pay$1@example.com";
    client
        .batch_execute(&format!("INSERT INTO resources (id, stock) VALUES ('{rid}', 1)"))
        .await
        .unwrap();
    client
        .execute(
            "INSERT INTO holders (id, contact) VALUES ($1, $2)",
            &[&hid.to_string(), &contact],
        )
        .await
        .unwrap();

    client
        .query(
            "INSERT INTO claims (holder, resource_id) VALUES ($1, $2)",
            &[&contact, &rid.to_string()],
        )
        .await
        .unwrap();
    let history = client
        .query("SELECT * FROM claims WHERE holder = $1", &[&contact])
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].get::<_, String>("holder_id"), hid.to_string());
}

#[tokio::test]
async fn tenants_are_isolated() {
    let (addr, tm) = start_test_server().await;
    let shop_a = connect_db(addr, "shop_a", PASSWORD).await.unwrap();
    let shop_b = connect_db(addr, "shop_b", PASSWORD).await.unwrap();

    seed(&shop_a, 1).await;
    assert_eq!(rows(&shop_a, "SELECT * FROM resources").await.len(), 1);
    assert!(rows(&shop_b, "SELECT * FROM resources").await.is_empty());
    assert_eq!(tm.tenant_count(), 2);
}

#[tokio::test]
async fn wrong_password_rejected() {
    let (addr, _tm) = start_test_server().await;
    assert!(connect_db(addr, "test", "not-the-password").await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_clients_never_oversell() {
    let (addr, _tm) = start_test_server().await;
    let admin = connect(addr).await;
    let rid = Ulid::new();
    admin
        .batch_execute(&format!("INSERT INTO resources (id, stock) VALUES ('{rid}', 3)"))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..12 {
        let hid = Ulid::new();
        admin
            .batch_execute(&format!("INSERT INTO holders (id, contact) VALUES ('{hid}', 'h-{hid}')"))
            .await
            .unwrap();
        handles.push(tokio::spawn(async move {
            let client = connect(addr).await;
            client
                .simple_query(&format!("INSERT INTO claims (holder, resource_id) VALUES ('{hid}', '{rid}')"))
                .await
                .is_ok()
        }));
    }

    let mut ok = 0;
    for h in handles {
        if h.await.unwrap() {
            ok += 1;
        }
    }
    assert_eq!(ok, 3);

    let resource = rows(&admin, &format!("SELECT * FROM resources WHERE id = '{rid}'")).await;
    assert_eq!(resource[0].get("stock"), Some("0"));
    assert_eq!(resource[0].get("popularity"), Some("3"));
}
