use std::time::Duration;

use reqwest::StatusCode;
use serde_json::{json, Value};

use stockline_api::app::{build_app, services::{AppServices, BackgroundTasks}};
use stockline_infra::config::AppConfig;

struct TestServer {
    base_url: String,
    client: reqwest::Client,
    handle: tokio::task::JoinHandle<()>,
    // dropping the handles would stop the webhook worker
    _background: BackgroundTasks,
}

impl TestServer {
    async fn spawn() -> Self {
        // Build app (same router as prod), but bind to an ephemeral port.
        let config = AppConfig {
            sync_interval: None,
            ..AppConfig::default()
        };
        let (services, background) = AppServices::in_memory(&config);
        let app = build_app(services);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            client: reqwest::Client::new(),
            handle,
            _background: background,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post(&self, path: &str, body: Value) -> (StatusCode, Value) {
        let res = self.client.post(self.url(path)).json(&body).send().await.unwrap();
        let status = res.status();
        (status, res.json().await.unwrap_or(Value::Null))
    }

    async fn get(&self, path: &str, tenant_id: &str) -> (StatusCode, Value) {
        let res = self
            .client
            .get(self.url(path))
            .query(&[("tenantId", tenant_id)])
            .send()
            .await
            .unwrap();
        let status = res.status();
        (status, res.json().await.unwrap_or(Value::Null))
    }

    async fn tenant(&self, slug: &str) -> String {
        let (status, body) = self
            .post("/tenants", json!({ "name": slug, "slug": slug }))
            .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        body["id"].as_str().unwrap().to_string()
    }

    async fn location(&self, tenant_id: &str, name: &str, code: &str) -> String {
        let (status, body) = self
            .post(
                "/locations",
                json!({ "tenantId": tenant_id, "name": name, "code": code, "kind": "warehouse" }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        body["id"].as_str().unwrap().to_string()
    }

    async fn product(&self, tenant_id: &str, sku: &str) -> String {
        let (status, body) = self
            .post(
                "/products",
                json!({ "tenantId": tenant_id, "sku": sku, "name": sku }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        body["id"].as_str().unwrap().to_string()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn assert_envelope(body: &Value, status: StatusCode, path: &str) {
    assert_eq!(body["success"], json!(false), "{body}");
    assert_eq!(body["statusCode"], json!(status.as_u16()), "{body}");
    assert_eq!(body["path"], json!(path), "{body}");
    assert!(body["message"].is_string(), "{body}");
    assert!(body["timestamp"].is_string(), "{body}");
    assert!(body["method"].is_string(), "{body}");
}

#[tokio::test]
async fn health_is_public_and_unknown_routes_use_the_envelope() {
    let server = TestServer::spawn().await;

    let res = server.client.get(server.url("/health")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = server.client.get(server.url("/nowhere")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: Value = res.json().await.unwrap();
    assert_envelope(&body, StatusCode::NOT_FOUND, "/nowhere");
}

#[tokio::test]
async fn tenant_scoped_queries_require_a_tenant() {
    let server = TestServer::spawn().await;

    let res = server.client.get(server.url("/balances")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_envelope(&body, StatusCode::BAD_REQUEST, "/balances");

    let (status, body) = server.get("/balances", "not-a-uuid").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_envelope(&body, StatusCode::BAD_REQUEST, "/balances");

    // well-formed but unknown tenant
    let (status, body) = server
        .get("/balances", "01890a5d-ac96-774b-bcce-b302099a8057")
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_envelope(&body, StatusCode::NOT_FOUND, "/balances");
}

#[tokio::test]
async fn movements_update_balances_and_guard_against_overdraw() {
    let server = TestServer::spawn().await;
    let tenant = server.tenant("acme").await;
    let wh1 = server.location(&tenant, "Main", "WH1").await;
    let wh2 = server.location(&tenant, "Overflow", "WH2").await;
    let widget = server.product(&tenant, "SKU-1").await;

    let (status, receipt) = server
        .post(
            "/movements",
            json!({ "tenantId": tenant, "type": "IN", "productId": widget, "toLocationId": wh1, "qty": 100 }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{receipt}");
    assert_eq!(receipt["type"], json!("IN"));

    let (status, _) = server
        .post(
            "/movements",
            json!({ "tenantId": tenant, "type": "TRANSFER", "productId": widget,
                    "fromLocationId": wh1, "toLocationId": wh2, "qty": 30 }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = server
        .post(
            "/movements",
            json!({ "tenantId": tenant, "type": "OUT", "productId": widget, "fromLocationId": wh1, "qty": 80 }),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_envelope(&body, StatusCode::UNPROCESSABLE_ENTITY, "/movements");
    assert_eq!(body["details"]["current"].as_f64(), Some(70.0));
    assert_eq!(body["details"]["requested"].as_f64(), Some(80.0));

    let (status, page) = server.get("/balances", &tenant).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["pagination"]["total"], json!(2));
    let mut quantities: Vec<f64> = page["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|b| b["quantity"].as_f64().unwrap())
        .collect();
    quantities.sort_by(|a, b| a.partial_cmp(b).unwrap());
    assert_eq!(quantities, vec![30.0, 70.0]);
    assert_eq!(page["data"][0]["product"]["sku"], json!("SKU-1"));

    let (status, movements) = server.get("/movements", &tenant).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(movements["pagination"]["total"], json!(2));

    let (status, report) = server
        .post(&format!("/balances/rebuild?tenantId={tenant}"), json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["movementsReplayed"], json!(2));
    assert_eq!(report["drift"], json!([]));
}

#[tokio::test]
async fn replayed_external_references_return_the_recorded_movement() {
    let server = TestServer::spawn().await;
    let tenant = server.tenant("acme").await;
    let wh1 = server.location(&tenant, "Main", "WH1").await;
    let widget = server.product(&tenant, "SKU-1").await;

    let movement = json!({
        "tenantId": tenant, "type": "IN", "productId": widget, "toLocationId": wh1, "qty": 5,
        "externalRef": { "source": "saft", "externalId": "INV-1:1" }
    });
    let (first_status, first) = server.post("/movements", movement.clone()).await;
    let (second_status, second) = server.post("/movements", movement).await;
    assert_eq!(first_status, StatusCode::CREATED);
    assert_eq!(second_status, StatusCode::OK);
    assert_eq!(first["id"], second["id"]);

    let (_, level) = server.get(&format!("/balances/{widget}"), &tenant).await;
    assert_eq!(level["quantity"].as_f64(), Some(5.0));
}

#[tokio::test]
async fn reservations_hold_stock_until_released() {
    let server = TestServer::spawn().await;
    let tenant = server.tenant("acme").await;
    let wh1 = server.location(&tenant, "Main", "WH1").await;
    let widget = server.product(&tenant, "SKU-1").await;
    server
        .post(
            "/movements",
            json!({ "tenantId": tenant, "type": "IN", "productId": widget, "toLocationId": wh1, "qty": 10 }),
        )
        .await;

    let (status, hold) = server
        .post(
            "/reservations",
            json!({ "tenantId": tenant, "productId": widget, "locationId": wh1, "qty": 6, "reference": "SO-7" }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{hold}");
    assert_eq!(hold["status"], json!("ACTIVE"));
    let id = hold["id"].as_str().unwrap().to_string();

    let (status, body) = server
        .post(
            "/reservations",
            json!({ "tenantId": tenant, "productId": widget, "locationId": wh1, "qty": 5 }),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["details"]["current"].as_f64(), Some(4.0));

    let (_, level) = server.get(&format!("/balances/{widget}"), &tenant).await;
    assert_eq!(level["quantity"].as_f64(), Some(10.0));
    assert_eq!(level["reserved"].as_f64(), Some(6.0));
    assert_eq!(level["available"].as_f64(), Some(4.0));

    let (status, released) = server
        .post(
            &format!("/reservations/{id}/release?tenantId={tenant}"),
            json!({ "qty": 6 }),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{released}");
    assert_eq!(released["status"], json!("RELEASED"));

    let (_, page) = server.get("/balances", &tenant).await;
    assert_eq!(page["data"][0]["available"].as_f64(), Some(10.0));

    let (status, _) = server
        .get(&format!("/reservations/{}", uuid_like(&id)), &tenant)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

/// A well-formed id that names nothing.
fn uuid_like(id: &str) -> String {
    let flipped = if id.ends_with('0') { '1' } else { '0' };
    format!("{}{flipped}", &id[..id.len() - 1])
}

#[tokio::test]
async fn catalog_crud_is_tenant_scoped() {
    let server = TestServer::spawn().await;
    let acme = server.tenant("acme").await;
    let globex = server.tenant("globex").await;
    let widget = server.product(&acme, "SKU-1").await;

    let (status, _) = server.get(&format!("/products/{widget}"), &acme).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = server.get(&format!("/products/{widget}"), &globex).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_envelope(&body, StatusCode::NOT_FOUND, &format!("/products/{widget}"));

    let (status, body) = server
        .post("/products", json!({ "tenantId": acme, "sku": "SKU-1", "name": "again" }))
        .await;
    assert_eq!(status, StatusCode::CONFLICT, "{body}");

    let res = server
        .client
        .patch(server.url(&format!("/tenants/{globex}")))
        .json(&json!({ "isActive": false }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let tenant: Value = res.json().await.unwrap();
    assert_eq!(tenant["isActive"], json!(false));
}

#[tokio::test]
async fn sync_triggers_and_unknown_targets() {
    let server = TestServer::spawn().await;
    let tenant = server.tenant("acme").await;

    let (status, body) = server
        .post("/sync/bindings", json!({ "tenantId": tenant, "adapter": "nope" }))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_envelope(&body, StatusCode::NOT_FOUND, "/sync/bindings");

    let (status, body) = server
        .post(&format!("/sync/memory/run?tenantId={tenant}"), json!({}))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND, "{body}");

    let (status, binding) = server
        .post("/sync/bindings", json!({ "tenantId": tenant, "adapter": "memory" }))
        .await;
    assert_eq!(status, StatusCode::CREATED, "{binding}");
    assert!(binding.get("config").is_none());

    let (status, accepted) = server
        .post(&format!("/sync/memory/run?tenantId={tenant}"), json!({}))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED, "{accepted}");

    let mut last_success = Value::Null;
    for _ in 0..200 {
        let (_, statuses) = server.get("/sync/status", &tenant).await;
        last_success = statuses[0]["lastSuccessAt"].clone();
        if !last_success.is_null() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(!last_success.is_null(), "cycle did not finish");

    let (status, history) = server.get("/sync/history", &tenant).await;
    assert_eq!(status, StatusCode::OK);
    assert!(!history.as_array().unwrap().is_empty());

    let res = server.client.get(server.url("/adapters")).send().await.unwrap();
    let adapters: Value = res.json().await.unwrap();
    let names: Vec<&str> = adapters
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|a| a["name"].as_str())
        .collect();
    assert!(names.contains(&"saft"));
    assert!(names.contains(&"memory"));
}

#[tokio::test]
async fn webhooks_are_verified_and_ingested() {
    let server = TestServer::spawn().await;
    let tenant = server.tenant("acme").await;
    let shop = server.location(&tenant, "Shop floor", "default").await;
    let widget = server.product(&tenant, "SKU-1").await;
    let (status, _) = server
        .post(
            "/movements",
            json!({ "tenantId": tenant, "type": "IN", "productId": widget, "toLocationId": shop, "qty": 10 }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);

    let deliver = |provider: &str, tenant: &str, body: &'static str| {
        server
            .client
            .post(server.url(&format!("/webhooks/{provider}")))
            .query(&[("tenantId", tenant)])
            .header("X-Shopify-Topic", "orders/create")
            .header("content-type", "application/json")
            .body(body)
            .send()
    };
    let order = r##"{"id": 1001, "name": "#1001", "line_items": [{"id": 1, "sku": "SKU-1", "quantity": 2}]}"##;

    let res = deliver("bigcommerce", &tenant, order).await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = deliver("shopify", "01890a5d-ac96-774b-bcce-b302099a8057", order)
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = deliver("shopify", &tenant, "{not json").await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = deliver("shopify", &tenant, order).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let ack: Value = res.json().await.unwrap();
    assert_eq!(ack["eventType"], json!("orders/create"));
    assert_eq!(ack["queued"], json!(1));

    let mut quantity = None;
    for _ in 0..200 {
        let (_, level) = server.get(&format!("/balances/{widget}"), &tenant).await;
        quantity = level["quantity"].as_f64();
        if quantity == Some(8.0) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(quantity, Some(8.0));
}
