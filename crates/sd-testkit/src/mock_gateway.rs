//! Deterministic mock broker gateway.
//!
//! Listens on an ephemeral loopback port and speaks the adapter's framed
//! wire protocol. Behavior is scripted per order arrival index (the Nth
//! `PLACE_ORDER` seen) and per bracket index (arrival index / 3), which
//! keeps scripts independent of the ids the client happens to allocate.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use sd_broker_tws::wire::{read_frame, write_frame, BrokerEvent, Request, WireOrder};

/// Scripted behavior. Everything defaults to "accept and acknowledge".
#[derive(Debug, Clone, Default)]
pub struct MockScript {
    /// First order id the gateway dictates (default 100).
    pub next_valid_id: Option<i64>,
    /// Arrival index → rejection error code. The rejected order gets an
    /// `Error` event instead of a Submitted status.
    pub reject_nth_order: HashMap<usize, i32>,
    /// Bracket indexes whose cancel requests are silently dropped.
    pub ignore_cancel_for_bracket: HashSet<usize>,
    /// Arrival indexes filled immediately on submit (full quantity).
    pub fill_nth_order: HashSet<usize>,
}

#[derive(Default)]
struct Recorded {
    orders: Vec<WireOrder>,
    cancels: Vec<i64>,
    /// order id → arrival index.
    arrival: HashMap<i64, usize>,
}

/// The running mock. Keep the handle alive for the duration of the test;
/// dropping it aborts the accept loop.
pub struct MockGateway {
    addr: SocketAddr,
    recorded: Arc<Mutex<Recorded>>,
    accept_task: tokio::task::JoinHandle<()>,
}

impl MockGateway {
    pub async fn spawn(script: MockScript) -> MockGateway {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("loopback bind");
        let addr = listener.local_addr().expect("local addr");
        let recorded: Arc<Mutex<Recorded>> = Arc::default();

        let rec = Arc::clone(&recorded);
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, peer)) = listener.accept().await else {
                    return;
                };
                debug!(%peer, "mock gateway accepted connection");
                let script = script.clone();
                let rec = Arc::clone(&rec);
                tokio::spawn(async move {
                    let _ = serve_connection(stream, script, rec).await;
                });
            }
        });

        MockGateway {
            addr,
            recorded,
            accept_task,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Orders received so far, in arrival order.
    pub fn placed_orders(&self) -> Vec<WireOrder> {
        self.recorded.lock().orders.clone()
    }

    /// Cancel requests received so far, in arrival order.
    pub fn cancels_received(&self) -> Vec<i64> {
        self.recorded.lock().cancels.clone()
    }
}

impl Drop for MockGateway {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve_connection(
    stream: TcpStream,
    script: MockScript,
    recorded: Arc<Mutex<Recorded>>,
) -> std::io::Result<()> {
    let (mut reader, mut writer) = stream.into_split();

    loop {
        let payload = match read_frame(&mut reader).await {
            Ok(Some(p)) => p,
            Ok(None) | Err(_) => return Ok(()),
        };
        let Ok(req) = Request::decode(&payload) else {
            continue;
        };

        match req {
            Request::Connect { .. } => {
                let id = script.next_valid_id.unwrap_or(100);
                send(&mut writer, &BrokerEvent::Connected).await;
                send(&mut writer, &BrokerEvent::NextValidId(id)).await;
            }

            Request::PlaceOrder(order) => {
                let idx = {
                    let mut rec = recorded.lock();
                    let idx = rec.orders.len();
                    rec.arrival.insert(order.order_id, idx);
                    rec.orders.push(order.clone());
                    idx
                };

                if let Some(code) = script.reject_nth_order.get(&idx) {
                    send(
                        &mut writer,
                        &BrokerEvent::Error {
                            code: *code,
                            message: format!("Order rejected - reason:code {code}"),
                            req_id: order.order_id,
                        },
                    )
                    .await;
                    continue;
                }

                send(
                    &mut writer,
                    &BrokerEvent::OrderStatus {
                        order_id: order.order_id,
                        status: "Submitted".into(),
                        filled: 0,
                        remaining: order.qty,
                        avg_fill_price: 0.0,
                        why_held: String::new(),
                    },
                )
                .await;

                if script.fill_nth_order.contains(&idx) {
                    let price = order.limit_price.unwrap_or(100.0);
                    send(
                        &mut writer,
                        &BrokerEvent::ExecDetails {
                            order_id: order.order_id,
                            exec_id: format!("exec-{idx}"),
                            qty: order.qty,
                            price,
                            side: order.side.clone(),
                            time: String::new(),
                        },
                    )
                    .await;
                    send(
                        &mut writer,
                        &BrokerEvent::CommissionReport {
                            exec_id: format!("exec-{idx}"),
                            commission: 1.0,
                        },
                    )
                    .await;
                }
            }

            Request::CancelOrder { order_id } => {
                recorded.lock().cancels.push(order_id);
                let bracket_idx = recorded
                    .lock()
                    .arrival
                    .get(&order_id)
                    .map(|arrival| arrival / 3);
                if let Some(b) = bracket_idx {
                    if script.ignore_cancel_for_bracket.contains(&b) {
                        debug!(order_id, bracket = b, "mock ignoring cancel");
                        continue;
                    }
                }
                send(
                    &mut writer,
                    &BrokerEvent::OrderStatus {
                        order_id,
                        status: "Cancelled".into(),
                        filled: 0,
                        remaining: 0,
                        avg_fill_price: 0.0,
                        why_held: String::new(),
                    },
                )
                .await;
            }

            Request::ReqAllOpenOrders => {
                let orders = recorded.lock().orders.clone();
                for o in orders {
                    send(
                        &mut writer,
                        &BrokerEvent::OpenOrder {
                            order_id: o.order_id,
                            symbol: o.symbol.clone(),
                            status: "Submitted".into(),
                        },
                    )
                    .await;
                }
            }

            Request::Disconnect => {
                send(&mut writer, &BrokerEvent::Disconnected).await;
                return Ok(());
            }
        }
    }
}

async fn send(writer: &mut (impl tokio::io::AsyncWrite + Unpin), event: &BrokerEvent) {
    let _ = write_frame(writer, &event.encode()).await;
}
