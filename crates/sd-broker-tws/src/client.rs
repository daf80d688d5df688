//! Asynchronous gateway client: connection lifecycle, event demux, and the
//! per-order state the bracket and cancellation flows operate on.
//!
//! One reader task owns the socket's read half and dispatches decoded
//! events into [`Shared`]; request writers share the write half behind an
//! async mutex. Per-order "wait for status" is a oneshot future keyed on
//! `(order_id, target_status)`, fulfilled by the event task — no polling
//! on the hot path.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use sd_schemas::OrderStatus;

use crate::error::BrokerError;
use crate::status::{is_rejection_code, map_broker_status};
use crate::wire::{read_frame, write_frame, BrokerEvent, Request};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TwsConfig {
    pub host: String,
    pub port: u16,
    pub client_id: i32,
    /// Dry-run: log intended actions, open no socket, submit nothing.
    pub dry_run: bool,
    pub connect_timeout: Duration,
    pub ready_timeout: Duration,
    pub ready_poll: Duration,
    /// Post-submit validation delay before inspecting bracket legs.
    pub validation_delay: Duration,
    /// Phase-B confirmation window per cancellation pass.
    pub cancel_confirm_timeout: Duration,
}

impl TwsConfig {
    pub fn new(host: impl Into<String>, port: u16, client_id: i32, dry_run: bool) -> Self {
        Self {
            host: host.into(),
            port,
            client_id,
            dry_run,
            connect_timeout: Duration::from_secs(10),
            ready_timeout: Duration::from_secs(5),
            ready_poll: Duration::from_millis(100),
            validation_delay: Duration::from_secs(2),
            cancel_confirm_timeout: Duration::from_secs(10),
        }
    }
}

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    /// `NextValidId` received; orders may flow.
    Ready,
}

/// A leg we placed and still track.
#[derive(Debug, Clone)]
pub(crate) struct PendingOrder {
    pub symbol: String,
    pub qty: i64,
}

/// Bracket registration: parent id → the three legs.
#[derive(Debug, Clone, PartialEq)]
pub struct BracketLegs {
    pub parent_id: i64,
    pub take_profit_id: i64,
    pub stop_loss_id: i64,
    pub symbol: String,
}

impl BracketLegs {
    pub fn ids(&self) -> [i64; 3] {
        [self.parent_id, self.take_profit_id, self.stop_loss_id]
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct FillAcc {
    pub original_qty: i64,
    pub filled_qty: i64,
    pub notional: f64,
}

impl FillAcc {
    pub fn avg_price(&self) -> Option<f64> {
        (self.filled_qty > 0).then(|| self.notional / self.filled_qty as f64)
    }
}

#[derive(Default)]
pub(crate) struct Session {
    pub conn: Option<ConnState>,
    pub next_order_id: Option<i64>,
    pub statuses: HashMap<i64, OrderStatus>,
    pub pending: HashMap<i64, PendingOrder>,
    pub brackets: HashMap<i64, BracketLegs>,
    pub fills: HashMap<i64, FillAcc>,
    pub rejections: HashMap<i64, (i32, String)>,
    pub commissions: HashMap<String, f64>,
    /// local order id (uuid string) → broker order id.
    pub id_map: HashMap<Uuid, i64>,
}

impl Session {
    fn conn_state(&self) -> ConnState {
        self.conn.unwrap_or(ConnState::Disconnected)
    }
}

type Waiters = HashMap<(i64, OrderStatus), Vec<oneshot::Sender<()>>>;

pub(crate) struct Shared {
    pub session: Mutex<Session>,
    pub waiters: Mutex<Waiters>,
}

impl Shared {
    fn new() -> Self {
        Self {
            session: Mutex::new(Session::default()),
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Apply a projected status and wake matching waiters.
    pub(crate) fn apply_status(&self, order_id: i64, status: OrderStatus) {
        {
            let mut s = self.session.lock();
            s.statuses.insert(order_id, status);
            if status.is_terminal() {
                s.pending.remove(&order_id);
            }
        }
        if let Some(senders) = self.waiters.lock().remove(&(order_id, status)) {
            for tx in senders {
                let _ = tx.send(());
            }
        }
    }
}

/// Per-order view the engine reads each bar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrderSnapshot {
    pub status: OrderStatus,
    pub filled_qty: i64,
    pub avg_fill_price: Option<f64>,
}

/// Status of every leg of a bracket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BracketSnapshot {
    pub entry: OrderSnapshot,
    pub take_profit: OrderSnapshot,
    pub stop_loss: OrderSnapshot,
}

impl BracketSnapshot {
    /// True when every leg has reached a terminal status.
    pub fn is_done(&self) -> bool {
        self.entry.status.is_terminal()
            && self.take_profit.status.is_terminal()
            && self.stop_loss.status.is_terminal()
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct TwsBroker {
    pub(crate) config: TwsConfig,
    pub(crate) shared: Arc<Shared>,
    pub(crate) writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    reader: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl TwsBroker {
    pub fn new(config: TwsConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared::new()),
            writer: tokio::sync::Mutex::new(None),
            reader: Mutex::new(None),
        }
    }

    pub fn conn_state(&self) -> ConnState {
        self.shared.session.lock().conn_state()
    }

    pub fn is_dry_run(&self) -> bool {
        self.config.dry_run
    }

    /// Open the session. Dry-run skips the socket entirely and declares
    /// the session ready with a synthetic id block.
    pub async fn connect(&self) -> Result<(), BrokerError> {
        if self.config.dry_run {
            let mut s = self.shared.session.lock();
            s.conn = Some(ConnState::Ready);
            s.next_order_id.get_or_insert(1_000);
            info!("dry-run broker session ready (no socket)");
            return Ok(());
        }

        self.shared.session.lock().conn = Some(ConnState::Connecting);

        let addr = (self.config.host.as_str(), self.config.port);
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                self.shared.session.lock().conn = Some(ConnState::Disconnected);
                BrokerError::ConnectionTimeout
            })?
            .map_err(|e| {
                self.shared.session.lock().conn = Some(ConnState::Disconnected);
                BrokerError::Unavailable(e.to_string())
            })?;

        let (read_half, write_half) = stream.into_split();
        *self.writer.lock().await = Some(write_half);
        self.shared.session.lock().conn = Some(ConnState::Connected);

        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            let mut reader = read_half;
            loop {
                match read_frame(&mut reader).await {
                    Ok(Some(payload)) => match BrokerEvent::decode(&payload) {
                        Ok(ev) => handle_event(&shared, ev),
                        Err(e) => warn!(error = %e, "undecodable broker frame dropped"),
                    },
                    Ok(None) => {
                        info!("broker closed the connection");
                        shared.session.lock().conn = Some(ConnState::Disconnected);
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, "broker read failed");
                        shared.session.lock().conn = Some(ConnState::Disconnected);
                        return;
                    }
                }
            }
        });
        *self.reader.lock() = Some(handle);

        self.send(Request::Connect {
            client_id: self.config.client_id,
        })
        .await?;
        Ok(())
    }

    /// Wait for `NextValidId`, polling at the configured cadence.
    pub async fn wait_ready(&self) -> Result<(), BrokerError> {
        let deadline = tokio::time::Instant::now() + self.config.ready_timeout;
        loop {
            {
                let s = self.shared.session.lock();
                if s.conn_state() == ConnState::Ready && s.next_order_id.is_some() {
                    return Ok(());
                }
                if s.conn_state() == ConnState::Disconnected {
                    return Err(BrokerError::NotConnected);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(BrokerError::NotReady);
            }
            tokio::time::sleep(self.config.ready_poll).await;
        }
    }

    /// Disconnect, logging (never propagating) cleanup failures.
    pub async fn disconnect(&self) {
        if !self.config.dry_run {
            if let Err(e) = self.send(Request::Disconnect).await {
                debug!(error = %e, "disconnect send failed");
            }
        }
        *self.writer.lock().await = None;
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
        self.shared.session.lock().conn = Some(ConnState::Disconnected);
        info!("broker session closed");
    }

    /// Allocate `count` consecutive order ids.
    pub(crate) fn allocate_ids(&self, count: i64) -> Result<i64, BrokerError> {
        let mut s = self.shared.session.lock();
        let next = s.next_order_id.ok_or(BrokerError::NotReady)?;
        s.next_order_id = Some(next + count);
        Ok(next)
    }

    pub(crate) async fn send(&self, req: Request) -> Result<(), BrokerError> {
        if self.config.dry_run {
            info!(request = ?req, "dry-run: would send");
            return Ok(());
        }
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(BrokerError::NotConnected)?;
        write_frame(writer, &req.encode()).await
    }

    /// Record a local-order → broker-order mapping after persistence.
    pub fn register_local_order(&self, local_id: Uuid, broker_id: i64) {
        self.shared.session.lock().id_map.insert(local_id, broker_id);
    }

    /// Rebuild the id map from persisted pairs after a restart, so
    /// cancellations issued against local ids keep working.
    pub fn recover_order_map(&self, pairs: &[(Uuid, i64)]) {
        let mut s = self.shared.session.lock();
        for (local, broker) in pairs {
            s.id_map.insert(*local, *broker);
        }
        info!(count = pairs.len(), "broker order map recovered");
    }

    pub fn order_status(&self, order_id: i64) -> Option<OrderStatus> {
        self.shared.session.lock().statuses.get(&order_id).copied()
    }

    pub fn order_snapshot(&self, order_id: i64) -> Option<OrderSnapshot> {
        let s = self.shared.session.lock();
        let status = s.statuses.get(&order_id).copied()?;
        let fill = s.fills.get(&order_id).cloned().unwrap_or_default();
        Some(OrderSnapshot {
            status,
            filled_qty: fill.filled_qty,
            avg_fill_price: fill.avg_price(),
        })
    }

    pub fn bracket_snapshot(&self, parent_id: i64) -> Option<BracketSnapshot> {
        let legs = self.shared.session.lock().brackets.get(&parent_id).cloned()?;
        let snap = |id: i64| {
            self.order_snapshot(id).unwrap_or(OrderSnapshot {
                status: OrderStatus::Pending,
                filled_qty: 0,
                avg_fill_price: None,
            })
        };
        Some(BracketSnapshot {
            entry: snap(legs.parent_id),
            take_profit: snap(legs.take_profit_id),
            stop_loss: snap(legs.stop_loss_id),
        })
    }

    pub fn bracket_legs(&self, parent_id: i64) -> Option<BracketLegs> {
        self.shared.session.lock().brackets.get(&parent_id).cloned()
    }

    pub fn commission(&self, exec_id: &str) -> Option<f64> {
        self.shared.session.lock().commissions.get(exec_id).copied()
    }

    /// True while the adapter still tracks the order as live.
    pub fn is_pending(&self, order_id: i64) -> bool {
        self.shared.session.lock().pending.contains_key(&order_id)
    }

    /// Wait until `order_id` reaches `target`, or `timeout` elapses.
    /// Returns whether the status was observed.
    pub async fn wait_for_status(
        &self,
        order_id: i64,
        target: OrderStatus,
        timeout: Duration,
    ) -> bool {
        let rx = {
            // Register the waiter first, then re-check: a status landing
            // between check and registration would otherwise be missed.
            let (tx, rx) = oneshot::channel();
            self.shared
                .waiters
                .lock()
                .entry((order_id, target))
                .or_default()
                .push(tx);
            if self.order_status(order_id) == Some(target) {
                return true;
            }
            rx
        };
        tokio::time::timeout(timeout, rx).await.map(|r| r.is_ok()).unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Event dispatch
// ---------------------------------------------------------------------------

pub(crate) fn handle_event(shared: &Shared, ev: BrokerEvent) {
    match ev {
        BrokerEvent::Connected => {
            shared.session.lock().conn = Some(ConnState::Connected);
        }
        BrokerEvent::NextValidId(id) => {
            let mut s = shared.session.lock();
            // The broker dictates the floor; never move backwards past ids
            // we already allocated this session.
            let next = s.next_order_id.map_or(id, |cur| cur.max(id));
            s.next_order_id = Some(next);
            s.conn = Some(ConnState::Ready);
            debug!(next_valid_id = id, "broker session ready");
        }
        BrokerEvent::Error {
            code,
            message,
            req_id,
        } => {
            if req_id > 0 && is_rejection_code(code) {
                warn!(order_id = req_id, code, %message, "order rejected by broker");
                shared
                    .session
                    .lock()
                    .rejections
                    .insert(req_id, (code, message));
                shared.apply_status(req_id, OrderStatus::Rejected);
            } else {
                debug!(code, %message, req_id, "broker notice");
            }
        }
        BrokerEvent::OpenOrder {
            order_id, status, ..
        } => {
            if let Some(mapped) = map_broker_status(&status) {
                shared.apply_status(order_id, mapped);
            }
        }
        BrokerEvent::OrderStatus {
            order_id,
            status,
            filled,
            avg_fill_price,
            ..
        } => {
            match map_broker_status(&status) {
                Some(mapped) => {
                    // Status frames carry cumulative fill counters; keep the
                    // accumulator consistent even if exec details were lost.
                    {
                        let mut s = shared.session.lock();
                        let original = s.pending.get(&order_id).map(|p| p.qty).unwrap_or(filled);
                        let acc = s.fills.entry(order_id).or_default();
                        if acc.original_qty == 0 {
                            acc.original_qty = original;
                        }
                        if filled > acc.filled_qty {
                            acc.filled_qty = filled;
                            acc.notional = avg_fill_price * filled as f64;
                        }
                    }
                    shared.apply_status(order_id, mapped);
                }
                None => warn!(order_id, %status, "unknown broker status ignored"),
            }
        }
        BrokerEvent::ExecDetails {
            order_id,
            exec_id,
            qty,
            price,
            ..
        } => {
            let status = {
                let mut s = shared.session.lock();
                let original = s.pending.get(&order_id).map(|p| p.qty).unwrap_or(0);
                let acc = s.fills.entry(order_id).or_default();
                if acc.original_qty == 0 {
                    acc.original_qty = original;
                }
                acc.filled_qty += qty;
                acc.notional += price * qty as f64;
                debug!(order_id, %exec_id, qty, price, "execution");
                if acc.original_qty > 0 && acc.filled_qty >= acc.original_qty {
                    Some(OrderStatus::Filled)
                } else {
                    Some(OrderStatus::PartiallyFilled)
                }
            };
            if let Some(st) = status {
                shared.apply_status(order_id, st);
            }
        }
        BrokerEvent::CommissionReport {
            exec_id,
            commission,
        } => {
            shared.session.lock().commissions.insert(exec_id, commission);
        }
        BrokerEvent::Disconnected => {
            shared.session.lock().conn = Some(ConnState::Disconnected);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared() -> Shared {
        Shared::new()
    }

    #[test]
    fn next_valid_id_never_regresses() {
        let sh = shared();
        handle_event(&sh, BrokerEvent::NextValidId(100));
        sh.session.lock().next_order_id = Some(150); // allocated meanwhile
        handle_event(&sh, BrokerEvent::NextValidId(100));
        assert_eq!(sh.session.lock().next_order_id, Some(150));
    }

    #[test]
    fn rejection_code_marks_order_rejected() {
        let sh = shared();
        handle_event(
            &sh,
            BrokerEvent::Error {
                code: 201,
                message: "margin".into(),
                req_id: 42,
            },
        );
        assert_eq!(
            sh.session.lock().statuses.get(&42),
            Some(&OrderStatus::Rejected)
        );
        assert!(sh.session.lock().rejections.contains_key(&42));
    }

    #[test]
    fn informational_error_is_not_rejection() {
        let sh = shared();
        handle_event(
            &sh,
            BrokerEvent::Error {
                code: 2104,
                message: "market data farm ok".into(),
                req_id: -1,
            },
        );
        assert!(sh.session.lock().statuses.is_empty());
    }

    #[test]
    fn exec_details_accumulate_to_filled() {
        let sh = shared();
        sh.session.lock().pending.insert(
            7,
            PendingOrder {
                symbol: "AAPL".into(),
                qty: 100,
            },
        );
        let exec = |qty: i64, price: f64, id: &str| BrokerEvent::ExecDetails {
            order_id: 7,
            exec_id: id.into(),
            qty,
            price,
            side: "BOT".into(),
            time: String::new(),
        };
        handle_event(&sh, exec(60, 101.0, "e1"));
        assert_eq!(
            sh.session.lock().statuses.get(&7),
            Some(&OrderStatus::PartiallyFilled)
        );
        handle_event(&sh, exec(40, 101.5, "e2"));
        let s = sh.session.lock();
        assert_eq!(s.statuses.get(&7), Some(&OrderStatus::Filled));
        let acc = s.fills.get(&7).unwrap();
        assert_eq!(acc.filled_qty, 100);
        let avg = acc.avg_price().unwrap();
        assert!((avg - 101.2).abs() < 1e-9);
    }

    #[test]
    fn terminal_status_prunes_pending() {
        let sh = shared();
        sh.session.lock().pending.insert(
            9,
            PendingOrder {
                symbol: "SPY".into(),
                qty: 10,
            },
        );
        handle_event(
            &sh,
            BrokerEvent::OrderStatus {
                order_id: 9,
                status: "Cancelled".into(),
                filled: 0,
                remaining: 10,
                avg_fill_price: 0.0,
                why_held: String::new(),
            },
        );
        assert!(!sh.session.lock().pending.contains_key(&9));
        assert_eq!(
            sh.session.lock().statuses.get(&9),
            Some(&OrderStatus::Cancelled)
        );
    }

    #[tokio::test]
    async fn wait_for_status_fulfilled_by_event() {
        let broker = TwsBroker::new(TwsConfig::new("127.0.0.1", 0, 1, true));
        let shared = Arc::clone(&broker.shared);
        let waiter = tokio::spawn(async move {
            // Broker handle is not Clone; exercise the waiter map directly.
            let (tx, rx) = oneshot::channel();
            shared
                .waiters
                .lock()
                .entry((5, OrderStatus::Cancelled))
                .or_default()
                .push(tx);
            tokio::time::timeout(Duration::from_secs(1), rx).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.shared.apply_status(5, OrderStatus::Cancelled);
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn wait_for_status_times_out() {
        let broker = TwsBroker::new(TwsConfig::new("127.0.0.1", 0, 1, true));
        let ok = broker
            .wait_for_status(99, OrderStatus::Cancelled, Duration::from_millis(50))
            .await;
        assert!(!ok);
    }
}
