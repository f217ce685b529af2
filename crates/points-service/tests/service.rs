// Copyright 2026 Primev, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use alloy::primitives::Address;
use points_service::{
    accrual::BLOCKS_PER_MONTH,
    api::{
        app, AddressPoints, ApiConfig, AppState, ErrMsg, LastBlockResponse, ListingEntry,
        ReceiverPoints, StatusResponse,
    },
    cursor::BlockCursor,
    db::LedgerDb,
    events::{EventKind, EventLog, RegistryEvent, RegistryType},
    ingest::{IngestionConfig, IngestionService},
    points::PopulationStats,
    status::IngestionStatus,
    test_utils::{MockEventSource, TestDb},
};
use reqwest::{Client, StatusCode};
use tokio::{net::TcpListener, task::JoinHandle};

const OPEN_BLOCK: u64 = 100;
const AUTH_TOKEN: &str = "test-token";
const NETWORK: &str = "0x9101eda106A443A0fA82375936D0D1680D5a64F5";

fn operator() -> Address {
    Address::repeat_byte(0x0a)
}

fn vault() -> Address {
    Address::repeat_byte(0x0b)
}

fn operator_key() -> String {
    format!("{:#x}", operator())
}

fn val_record_added(identity: &str, block: u64) -> EventLog {
    EventLog::new(
        block,
        0,
        RegistryEvent::OptedIn {
            kind: EventKind::ValRecordAdded,
            registry: RegistryType::Symbiotic,
            identity: identity.to_string(),
            delegate: Some(operator()),
            vault: Some(vault()),
        },
    )
}

fn val_record_deleted(identity: &str, block: u64) -> EventLog {
    EventLog::new(
        block,
        0,
        RegistryEvent::OptedOut {
            kind: EventKind::ValRecordDeleted,
            registry: RegistryType::Symbiotic,
            identity: identity.to_string(),
        },
    )
}

struct TestCtx {
    _test_db: TestDb,
    ingestion: IngestionService<MockEventSource>,
    source: MockEventSource,
    base: String,
    client: Client,
    server: JoinHandle<()>,
}

impl TestCtx {
    async fn new() -> Self {
        let test_db = TestDb::new().await.unwrap();
        let cursor = BlockCursor::new(test_db.db.clone());
        cursor.init(OPEN_BLOCK).await.unwrap();
        let status = IngestionStatus::new();
        let source = MockEventSource::new();

        let ingestion = IngestionService::new(
            source.clone(),
            test_db.db.clone(),
            cursor.clone(),
            status.clone(),
            IngestionConfig { interval: Duration::from_millis(10), batch_size: u64::MAX },
        );

        let state = AppState::new(
            test_db.db.clone(),
            cursor,
            status,
            ApiConfig { auth_token: Some(AUTH_TOKEN.into()), network_address: NETWORK.into() },
        );

        let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, app(state)).await.unwrap();
        });

        Self {
            _test_db: test_db,
            ingestion,
            source,
            base: format!("http://{addr}"),
            client: Client::new(),
            server,
        }
    }

    async fn sync(&self) {
        while self.ingestion.sync_once().await.unwrap().is_some() {}
    }

    async fn get(&self, path: &str) -> reqwest::Response {
        self.client.get(format!("{}{path}", self.base)).send().await.unwrap()
    }

    async fn post_admin(&self, path: &str, token: Option<&str>, body: &str) -> reqwest::Response {
        let mut req = self
            .client
            .post(format!("{}{path}", self.base))
            .header("content-type", "application/json")
            .body(body.to_string());
        if let Some(token) = token {
            req = req.header("authorization", format!("Bearer {token}"));
        }
        req.send().await.unwrap()
    }
}

impl Drop for TestCtx {
    fn drop(&mut self) {
        self.server.abort();
    }
}

#[tokio::test]
async fn early_exit_after_six_months() {
    let ctx = TestCtx::new().await;
    let close_block = OPEN_BLOCK + 6 * BLOCKS_PER_MONTH;
    ctx.source.push(val_record_added("0x01", OPEN_BLOCK));
    ctx.source.push(val_record_deleted("0x01", close_block));
    ctx.sync().await;

    let res = ctx.get(&format!("/operator/{}?block_number={close_block}", operator_key())).await;
    assert_eq!(res.status(), StatusCode::OK);
    let body: ReceiverPoints = res.json().await.unwrap();
    assert_eq!(
        body,
        ReceiverPoints {
            address: operator_key(),
            receiver: "operator".into(),
            block_number: close_block,
            points: 60_000,
        }
    );

    // The identity key resolves to the same interval.
    let res = ctx.get(&format!("/operator/0x01?block_number={close_block}")).await;
    assert_eq!(res.json::<ReceiverPoints>().await.unwrap().points, 60_000);
}

#[tokio::test]
async fn still_registered_after_twelve_months() {
    let ctx = TestCtx::new().await;
    ctx.source.push(val_record_added("0x01", OPEN_BLOCK));
    ctx.source.set_head(OPEN_BLOCK + 12 * BLOCKS_PER_MONTH);
    ctx.sync().await;

    let reference = OPEN_BLOCK + 12 * BLOCKS_PER_MONTH;
    let res = ctx.get(&format!("/operator/{}?block_number={reference}", operator_key())).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.json::<ReceiverPoints>().await.unwrap().points, 300_000);

    let res = ctx.get("/last_block").await;
    assert_eq!(
        res.json::<LastBlockResponse>().await.unwrap(),
        LastBlockResponse { last_block_number: reference }
    );

    let res = ctx.get(&format!("/{}", operator_key())).await;
    let body: AddressPoints = res.json().await.unwrap();
    assert_eq!(body.block_number, reference);
    assert_eq!(body.total_points, 300_000);
}

#[tokio::test]
async fn slashed_vault_stops_accrual() {
    let ctx = TestCtx::new().await;
    let slash_block = OPEN_BLOCK + 6 * BLOCKS_PER_MONTH;
    ctx.source.push(val_record_added("0x01", OPEN_BLOCK));
    ctx.source.push(val_record_added("0x02", OPEN_BLOCK));
    ctx.source.set_middleware_opted_out("0x02");
    ctx.source.push(EventLog::new(slash_block, 0, RegistryEvent::VaultSlashed { vault: vault() }));
    ctx.source.set_head(OPEN_BLOCK + 12 * BLOCKS_PER_MONTH);
    ctx.sync().await;

    let reference = OPEN_BLOCK + 12 * BLOCKS_PER_MONTH;
    let res = ctx.get(&format!("/operator/{}?block_number={reference}", operator_key())).await;
    assert_eq!(res.json::<ReceiverPoints>().await.unwrap().points, 300_000 + 60_000);

    // Heights past the signed 64-bit range still resolve against the full history.
    let res = ctx.get(&format!("/operator/{}?block_number={}", operator_key(), u64::MAX)).await;
    assert_eq!(res.status(), StatusCode::OK);
    let body: ReceiverPoints = res.json().await.unwrap();
    assert_eq!(body.block_number, u64::MAX);
    assert_eq!(body.points, 700_000 + 60_000);
}

#[tokio::test]
async fn reopened_intervals_sum() {
    let ctx = TestCtx::new().await;
    let first_close = OPEN_BLOCK + 6 * BLOCKS_PER_MONTH;
    let reopen = first_close + 1;
    ctx.source.push(val_record_added("0x01", OPEN_BLOCK));
    ctx.source.push(val_record_deleted("0x01", first_close));
    ctx.source.push(val_record_added("0x01", reopen));
    ctx.sync().await;

    let reference = reopen + BLOCKS_PER_MONTH;
    let res = ctx.get(&format!("/operator/{}?block_number={reference}", operator_key())).await;
    assert_eq!(res.json::<ReceiverPoints>().await.unwrap().points, 60_000 + 10_000);

    let res = ctx.get(&format!("/stats?block_number={reference}")).await;
    assert_eq!(
        res.json::<PopulationStats>().await.unwrap(),
        PopulationStats { total_points: 70_000, stakers: 0, networks: 0, operators: 1 }
    );
}

#[tokio::test]
async fn replayed_close_is_noop() {
    let ctx = TestCtx::new().await;
    let close_block = OPEN_BLOCK + 6 * BLOCKS_PER_MONTH;
    ctx.source.push(val_record_added("0x01", OPEN_BLOCK));
    ctx.source.push(val_record_deleted("0x01", close_block));
    ctx.sync().await;

    // Redeliver the whole range, then a stray later close for the same identity.
    ctx.ingestion.process_blocks(OPEN_BLOCK, close_block).await.unwrap();
    ctx.ingestion.apply_event(&val_record_deleted("0x01", close_block + 50)).await.unwrap();

    let rows = ctx.ingestion.db.intervals(RegistryType::Symbiotic, "0x01").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].opted_out_block, Some(close_block));
}

#[tokio::test]
async fn listing() {
    let ctx = TestCtx::new().await;

    let res = ctx.get("/all?offset=0&limit=10&block_number=500").await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await.unwrap(), "[]\n");

    ctx.source.push(val_record_added("0x01", OPEN_BLOCK));
    ctx.source.push(val_record_added("0x02", OPEN_BLOCK + 1));
    ctx.sync().await;

    let reference = OPEN_BLOCK + 1 + BLOCKS_PER_MONTH;
    let res = ctx.get(&format!("/all?offset=0&limit=10&block_number={reference}")).await;
    let entries: Vec<ListingEntry> = res.json().await.unwrap();
    assert_eq!(
        entries,
        vec![ListingEntry {
            address: operator_key(),
            receiver: "operator".into(),
            block_number: reference,
            network_address: NETWORK.into(),
            vault_address: Some(format!("{:#x}", vault())),
            points: 20_000,
        }]
    );

    let res = ctx
        .get(&format!("/all?offset=0&limit=10&block_number={reference}&receiver_type=network"))
        .await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await.unwrap(), "[]\n");

    let res = ctx.get(&format!("/all?offset=1&limit=10&block_number={reference}")).await;
    assert_eq!(res.text().await.unwrap(), "[]\n");
}

#[tokio::test]
async fn invalid_params_are_rejected() {
    let ctx = TestCtx::new().await;
    let addr = operator_key();

    for path in [
        format!("/operator/{addr}?block_number=0"),
        format!("/operator/{addr}"),
        format!("/operator/{addr}?block_number=abc"),
        "/stats".to_string(),
        "/all?offset=0&limit=0&block_number=10".to_string(),
        "/all?offset=-1&limit=10&block_number=10".to_string(),
        "/all?limit=10&block_number=10".to_string(),
        "/not-hex?block_number=10".to_string(),
    ] {
        let res = ctx.get(&path).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST, "{path}");
        let err: ErrMsg = res.json().await.unwrap();
        assert_eq!(err.r#type, "InvalidRequest", "{path}");
    }
}

#[tokio::test]
async fn receiver_fallbacks() {
    let ctx = TestCtx::new().await;
    let addr = operator_key();

    // Unsupported receiver kinds answer with zero points.
    let res = ctx.get(&format!("/network/{addr}?block_number=10")).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.json::<ReceiverPoints>().await.unwrap().points, 0);

    // An operator without points is not found.
    let res = ctx.get(&format!("/operator/{addr}?block_number=10")).await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    assert_eq!(res.json::<ReceiverPoints>().await.unwrap().points, 0);
}

#[tokio::test]
async fn health_follows_ingestion() {
    let ctx = TestCtx::new().await;

    let res = ctx.get("/health").await;
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(res.text().await.unwrap(), "Points routine not running\n");

    ctx.ingestion.status.set_running(true).await;
    ctx.sync().await;
    let res = ctx.get("/health").await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await.unwrap(), "OK\n");

    ctx.source.fail_next(1);
    let err = ctx.ingestion.sync_once().await.unwrap_err();
    ctx.ingestion.status.subscription_down(&err).await;
    let res = ctx.get("/health").await;
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(res.text().await.unwrap().starts_with("Event subscription not active"));
}

#[tokio::test]
async fn admin_endpoints() {
    let ctx = TestCtx::new().await;
    let pubkey = "0xC0FFEE";
    let adder = operator_key();
    let entry = format!(r#"{{"pubkey":"{pubkey}","adder":"{adder}","in_block":100}}"#);

    let res = ctx.post_admin("/admin/add_manual_entry", None, &entry).await;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    let res = ctx.post_admin("/admin/add_manual_entry", Some("wrong"), &entry).await;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = ctx.post_admin("/admin/add_manual_entry", Some(AUTH_TOKEN), r#"{"pubkey":"0x01"}"#).await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let res = ctx.post_admin("/admin/add_manual_entry", Some(AUTH_TOKEN), "not json").await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = ctx.post_admin("/admin/add_manual_entry", Some(AUTH_TOKEN), &entry).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(
        res.json::<StatusResponse>().await.unwrap(),
        StatusResponse { status: "success".into() }
    );

    // A second, different open for the same identity conflicts.
    let conflicting = format!(r#"{{"pubkey":"{pubkey}","adder":"{adder}","in_block":150}}"#);
    let res = ctx.post_admin("/admin/add_manual_entry", Some(AUTH_TOKEN), &conflicting).await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let out_block = 100 + 3 * BLOCKS_PER_MONTH;
    let opt_out = format!(r#"{{"pubkey":"{pubkey}","adder":"{adder}","out_block":{out_block}}}"#);
    let res = ctx.post_admin("/admin/add_manual_opt_out", Some(AUTH_TOKEN), &opt_out).await;
    assert_eq!(res.status(), StatusCode::OK);

    let rows = ctx.ingestion.db.intervals(RegistryType::Vanilla, "0xc0ffee").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].event_type, "ManualEntry");
    assert_eq!(rows[0].delegate.as_deref(), Some(adder.as_str()));
    assert_eq!(rows[0].opted_out_block, Some(out_block));

    let res = ctx.get(&format!("/{adder}?block_number={out_block}")).await;
    assert_eq!(res.json::<AddressPoints>().await.unwrap().total_points, 30_000);

    let unknown = format!(
        r#"{{"pubkey":"0xdead","adder":"{adder}","out_block":10,"registry_type":"eigenlayer"}}"#
    );
    let res = ctx.post_admin("/admin/add_manual_opt_out", Some(AUTH_TOKEN), &unknown).await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn graceful_shutdown() {
    let test_db = TestDb::new().await.unwrap();
    let state = AppState::new(
        test_db.db.clone(),
        BlockCursor::new(test_db.db.clone()),
        IngestionStatus::new(),
        ApiConfig::default(),
    );
    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).await.unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();

    let handle = tokio::spawn(points_service::serve(listener, Arc::clone(&state), async {
        let _ = rx.await;
    }));
    tx.send(()).unwrap();

    tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap().unwrap();
}
