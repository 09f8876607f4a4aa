use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};
use ulid::Ulid;

use dispensd::device::{Direction, SimLog, SimStep, SimulatedDeviceController, StageTimeouts};
use dispensd::dispense::{DispenseService, DispenseSettings, RetryPolicy};
use dispensd::ledger::{Ledger, SlotOrdering};
use dispensd::wire;

// ── Test infrastructure ──────────────────────────────────────

fn fast_timeouts() -> StageTimeouts {
    StageTimeouts {
        ready: Duration::from_millis(50),
        motor_ack: Duration::from_millis(50),
        sensor_confirm: Duration::from_millis(50),
        cycle_complete: Duration::from_millis(50),
    }
}

async fn start_test_server(device: SimulatedDeviceController) -> (SocketAddr, SimLog) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("dispensd_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let ledger = Arc::new(Ledger::open_with(dir.join("ledger.wal"), SlotOrdering::MappingOrder).unwrap());

    let settings = DispenseSettings {
        unit_retry: RetryPolicy::immediate(2),
        ..Default::default()
    };
    let log = device.log();
    let service = Arc::new(DispenseService::new(ledger, Box::new(device), settings));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let service = service.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, service).await;
            });
        }
    });

    (addr, log)
}

fn simulator(script: &[SimStep]) -> SimulatedDeviceController {
    SimulatedDeviceController::new(fast_timeouts(), Direction::Forward).with_script(script.iter().copied())
}

struct Client {
    framed: Framed<TcpStream, LinesCodec>,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self { framed: Framed::new(stream, LinesCodec::new()) }
    }

    async fn send_raw(&mut self, line: &str) -> Value {
        self.framed.send(line.to_string()).await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(10), self.framed.next())
            .await
            .expect("no reply within 10s")
            .expect("connection closed")
            .unwrap();
        serde_json::from_str(&reply).unwrap()
    }

    async fn call(&mut self, req: Value) -> Value {
        self.send_raw(&req.to_string()).await
    }

    async fn stock(&mut self, slot: &str, product: &str, quantity: u32) -> Value {
        self.call(json!({"op": "stock", "slot_id": slot, "product_id": product, "quantity": quantity}))
            .await
    }
}

fn available(slots: &Value, slot: &str) -> u64 {
    slots["slots"]
        .as_array()
        .unwrap()
        .iter()
        .find(|s| s["slot_id"] == slot)
        .map(|s| s["available"].as_u64().unwrap())
        .unwrap()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn stock_and_list_slots() {
    let (addr, _) = start_test_server(simulator(&[])).await;
    let mut c = Client::connect(addr).await;

    let resp = c.stock("11", "cola", 5).await;
    assert_eq!(resp["type"], "slot");
    assert_eq!(resp["slot"]["available"], 5);
    c.stock("12", "water", 2).await;

    let all = c.call(json!({"op": "slots"})).await;
    assert_eq!(all["slots"].as_array().unwrap().len(), 2);
    let cola = c.call(json!({"op": "slots", "product_id": "cola"})).await;
    assert_eq!(cola["slots"].as_array().unwrap().len(), 1);

    let resp = c.call(json!({"op": "remove_slot", "slot_id": "12"})).await;
    assert_eq!(resp, json!({"type": "removed", "slot_id": "12"}));
    let resp = c.call(json!({"op": "remove_slot", "slot_id": "12"})).await;
    assert_eq!(resp["code"], "slot_not_found");
}

#[tokio::test]
async fn dispense_delivers_and_decrements() {
    let (addr, log) = start_test_server(simulator(&[])).await;
    let mut c = Client::connect(addr).await;
    c.stock("11", "cola", 5).await;

    let resp = c
        .call(json!({"op": "dispense", "product_id": "cola", "quantity": 2, "preferred_slot": "11"}))
        .await;
    assert_eq!(resp["type"], "outcome");
    let outcome = &resp["outcome"];
    assert_eq!(outcome["status"], "delivered");
    assert_eq!(outcome["overall_success"], true);
    assert_eq!(outcome["total_confirmed"], 2);
    assert!(outcome["failure_reason"].is_null());

    let slots = c.call(json!({"op": "slots"})).await;
    assert_eq!(available(&slots, "11"), 3);
    assert_eq!(log.motor_commands().len(), 2);
}

#[tokio::test]
async fn partial_delivery_reports_failure_reason() {
    let (addr, _) = start_test_server(simulator(&[SimStep::Ok, SimStep::NoAck, SimStep::NoAck])).await;
    let mut c = Client::connect(addr).await;
    c.stock("A", "cola", 5).await;

    let resp = c.call(json!({"op": "dispense", "product_id": "cola", "quantity": 3})).await;
    let outcome = &resp["outcome"];
    assert_eq!(outcome["status"], "partially_delivered");
    assert_eq!(outcome["total_confirmed"], 1);
    let reason = &outcome["failure_reason"];
    assert_eq!(reason["kind"], "retries_exhausted");
    assert_eq!(reason["cause"], "motor_ack_timeout");
    assert_eq!(reason["unit_index"], 2);

    let attempts = outcome["slots"][0]["attempts"].as_array().unwrap();
    assert_eq!(attempts[0]["outcome"], json!({"result": "confirmed"}));
    assert_eq!(attempts[1]["outcome"], json!({"result": "failed", "kind": "motor_ack_timeout"}));

    let slots = c.call(json!({"op": "slots"})).await;
    assert_eq!(available(&slots, "A"), 4);
}

#[tokio::test]
async fn insufficient_stock_is_an_error() {
    let (addr, log) = start_test_server(simulator(&[])).await;
    let mut c = Client::connect(addr).await;
    c.stock("A", "cola", 2).await;
    c.stock("B", "cola", 3).await;

    let resp = c.call(json!({"op": "dispense", "product_id": "cola", "quantity": 6})).await;
    assert_eq!(resp["type"], "error");
    assert_eq!(resp["code"], "insufficient_stock");
    assert!(log.commands().is_empty());
}

#[tokio::test]
async fn device_not_ready_is_an_error() {
    let (addr, log) = start_test_server(simulator(&[])).await;
    log.set_powered(false);
    let mut c = Client::connect(addr).await;
    c.stock("A", "cola", 2).await;

    let resp = c.call(json!({"op": "dispense", "product_id": "cola", "quantity": 1})).await;
    assert_eq!(resp["code"], "device_not_ready");
    let slots = c.call(json!({"op": "slots"})).await;
    assert_eq!(available(&slots, "A"), 2);
}

#[tokio::test]
async fn malformed_requests_keep_the_connection() {
    let (addr, _) = start_test_server(simulator(&[])).await;
    let mut c = Client::connect(addr).await;

    let resp = c.send_raw("this is not json").await;
    assert_eq!(resp["type"], "error");
    assert_eq!(resp["code"], "bad_request");

    let resp = c.call(json!({"op": "dispense", "product_id": "cola", "quantity": 0})).await;
    assert_eq!(resp["code"], "invalid_request");

    let resp = c.call(json!({"op": "stock", "slot_id": "has space", "product_id": "cola", "quantity": 1})).await;
    assert_eq!(resp["code"], "bad_request");

    // Still usable.
    let resp = c.call(json!({"op": "slots"})).await;
    assert_eq!(resp, json!({"type": "slots", "slots": []}));
}

#[tokio::test]
async fn cancel_from_another_connection() {
    let device = simulator(&[]).with_latency(Duration::from_millis(50));
    let (addr, _) = start_test_server(device).await;
    let mut buyer = Client::connect(addr).await;
    let mut operator = Client::connect(addr).await;
    buyer.stock("A", "cola", 10).await;

    let resp = operator.call(json!({"op": "cancel"})).await;
    assert_eq!(resp, json!({"type": "cancel", "cancelled": false}));

    let pending = tokio::spawn(async move {
        let resp = buyer.call(json!({"op": "dispense", "product_id": "cola", "quantity": 10})).await;
        (buyer, resp)
    });
    tokio::time::sleep(Duration::from_millis(300)).await;
    let resp = operator.call(json!({"op": "cancel"})).await;
    assert_eq!(resp["cancelled"], true);

    let (mut buyer, resp) = pending.await.unwrap();
    let outcome = &resp["outcome"];
    let confirmed = outcome["total_confirmed"].as_u64().unwrap();
    assert!(confirmed < 10);
    assert_eq!(outcome["failure_reason"]["kind"], "cancelled");

    let slots = buyer.call(json!({"op": "slots"})).await;
    assert_eq!(available(&slots, "A"), 10 - confirmed);
}
