//! Wire codec for the legacy socket gateway.
//!
//! Frames are 4-byte big-endian length prefixes followed by NUL-separated
//! fields; the first field is the message tag. Both directions live here so
//! the test gateway speaks exactly the protocol the client does.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::BrokerError;

/// Frames larger than this are protocol corruption, not data.
const MAX_FRAME_BYTES: u32 = 1 << 20;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// An order as it crosses the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct WireOrder {
    pub order_id: i64,
    pub symbol: String,
    /// `BUY` / `SELL`.
    pub side: String,
    pub qty: i64,
    /// `LMT` / `MKT` / `STP`.
    pub kind: String,
    pub limit_price: Option<f64>,
    /// Stop trigger for `STP` orders.
    pub aux_price: Option<f64>,
    /// 0 marks a root order.
    pub parent_id: i64,
    /// The gateway activates the whole chain when the last child arrives
    /// with `transmit = true`.
    pub transmit: bool,
}

/// Client → gateway.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Connect { client_id: i32 },
    PlaceOrder(WireOrder),
    CancelOrder { order_id: i64 },
    ReqAllOpenOrders,
    Disconnect,
}

/// Gateway → client.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    Connected,
    NextValidId(i64),
    Error {
        code: i32,
        message: String,
        /// Order/request id the error refers to; ≤ 0 means connection-level.
        req_id: i64,
    },
    OpenOrder {
        order_id: i64,
        symbol: String,
        status: String,
    },
    OrderStatus {
        order_id: i64,
        status: String,
        filled: i64,
        remaining: i64,
        avg_fill_price: f64,
        why_held: String,
    },
    ExecDetails {
        order_id: i64,
        exec_id: String,
        qty: i64,
        price: f64,
        side: String,
        time: String,
    },
    CommissionReport {
        exec_id: String,
        commission: f64,
    },
    Disconnected,
}

// ---------------------------------------------------------------------------
// Field-level encode/decode
// ---------------------------------------------------------------------------

fn join(fields: &[String]) -> Vec<u8> {
    fields.join("\0").into_bytes()
}

fn opt_f64(v: Option<f64>) -> String {
    v.map(|p| p.to_string()).unwrap_or_default()
}

fn parse_opt_f64(s: &str) -> Result<Option<f64>, BrokerError> {
    if s.is_empty() {
        return Ok(None);
    }
    s.parse().map(Some).map_err(|_| bad_field("price", s))
}

fn bad_field(what: &str, raw: &str) -> BrokerError {
    BrokerError::Protocol(format!("bad {what} field: {raw:?}"))
}

fn parse<T: std::str::FromStr>(what: &str, s: &str) -> Result<T, BrokerError> {
    s.parse().map_err(|_| bad_field(what, s))
}

impl Request {
    pub fn encode(&self) -> Vec<u8> {
        let fields = match self {
            Request::Connect { client_id } => {
                vec!["CONNECT".into(), client_id.to_string()]
            }
            Request::PlaceOrder(o) => vec![
                "PLACE_ORDER".into(),
                o.order_id.to_string(),
                o.symbol.clone(),
                o.side.clone(),
                o.qty.to_string(),
                o.kind.clone(),
                opt_f64(o.limit_price),
                opt_f64(o.aux_price),
                o.parent_id.to_string(),
                if o.transmit { "1" } else { "0" }.into(),
            ],
            Request::CancelOrder { order_id } => {
                vec!["CANCEL_ORDER".into(), order_id.to_string()]
            }
            Request::ReqAllOpenOrders => vec!["REQ_ALL_OPEN_ORDERS".into()],
            Request::Disconnect => vec!["DISCONNECT".into()],
        };
        join(&fields)
    }

    pub fn decode(payload: &[u8]) -> Result<Request, BrokerError> {
        let text = std::str::from_utf8(payload)
            .map_err(|_| BrokerError::Protocol("frame is not utf-8".into()))?;
        let f: Vec<&str> = text.split('\0').collect();
        let need = |n: usize| -> Result<(), BrokerError> {
            if f.len() < n {
                return Err(BrokerError::Protocol(format!(
                    "truncated {} frame: {} fields",
                    f[0],
                    f.len()
                )));
            }
            Ok(())
        };
        match f[0] {
            "CONNECT" => {
                need(2)?;
                Ok(Request::Connect {
                    client_id: parse("client_id", f[1])?,
                })
            }
            "PLACE_ORDER" => {
                need(10)?;
                Ok(Request::PlaceOrder(WireOrder {
                    order_id: parse("order_id", f[1])?,
                    symbol: f[2].to_string(),
                    side: f[3].to_string(),
                    qty: parse("qty", f[4])?,
                    kind: f[5].to_string(),
                    limit_price: parse_opt_f64(f[6])?,
                    aux_price: parse_opt_f64(f[7])?,
                    parent_id: parse("parent_id", f[8])?,
                    transmit: f[9] == "1",
                }))
            }
            "CANCEL_ORDER" => {
                need(2)?;
                Ok(Request::CancelOrder {
                    order_id: parse("order_id", f[1])?,
                })
            }
            "REQ_ALL_OPEN_ORDERS" => Ok(Request::ReqAllOpenOrders),
            "DISCONNECT" => Ok(Request::Disconnect),
            other => Err(BrokerError::Protocol(format!("unknown request tag {other:?}"))),
        }
    }
}

impl BrokerEvent {
    pub fn encode(&self) -> Vec<u8> {
        let fields = match self {
            BrokerEvent::Connected => vec!["CONNECTED".to_string()],
            BrokerEvent::NextValidId(id) => vec!["NEXT_VALID_ID".into(), id.to_string()],
            BrokerEvent::Error {
                code,
                message,
                req_id,
            } => vec![
                "ERROR".into(),
                code.to_string(),
                message.clone(),
                req_id.to_string(),
            ],
            BrokerEvent::OpenOrder {
                order_id,
                symbol,
                status,
            } => vec![
                "OPEN_ORDER".into(),
                order_id.to_string(),
                symbol.clone(),
                status.clone(),
            ],
            BrokerEvent::OrderStatus {
                order_id,
                status,
                filled,
                remaining,
                avg_fill_price,
                why_held,
            } => vec![
                "ORDER_STATUS".into(),
                order_id.to_string(),
                status.clone(),
                filled.to_string(),
                remaining.to_string(),
                avg_fill_price.to_string(),
                why_held.clone(),
            ],
            BrokerEvent::ExecDetails {
                order_id,
                exec_id,
                qty,
                price,
                side,
                time,
            } => vec![
                "EXEC_DETAILS".into(),
                order_id.to_string(),
                exec_id.clone(),
                qty.to_string(),
                price.to_string(),
                side.clone(),
                time.clone(),
            ],
            BrokerEvent::CommissionReport {
                exec_id,
                commission,
            } => vec![
                "COMMISSION".into(),
                exec_id.clone(),
                commission.to_string(),
            ],
            BrokerEvent::Disconnected => vec!["DISCONNECTED".to_string()],
        };
        join(&fields)
    }

    pub fn decode(payload: &[u8]) -> Result<BrokerEvent, BrokerError> {
        let text = std::str::from_utf8(payload)
            .map_err(|_| BrokerError::Protocol("frame is not utf-8".into()))?;
        let f: Vec<&str> = text.split('\0').collect();
        let need = |n: usize| -> Result<(), BrokerError> {
            if f.len() < n {
                return Err(BrokerError::Protocol(format!(
                    "truncated {} frame: {} fields",
                    f[0],
                    f.len()
                )));
            }
            Ok(())
        };
        match f[0] {
            "CONNECTED" => Ok(BrokerEvent::Connected),
            "NEXT_VALID_ID" => {
                need(2)?;
                Ok(BrokerEvent::NextValidId(parse("next_valid_id", f[1])?))
            }
            "ERROR" => {
                need(4)?;
                Ok(BrokerEvent::Error {
                    code: parse("code", f[1])?,
                    message: f[2].to_string(),
                    req_id: parse("req_id", f[3])?,
                })
            }
            "OPEN_ORDER" => {
                need(4)?;
                Ok(BrokerEvent::OpenOrder {
                    order_id: parse("order_id", f[1])?,
                    symbol: f[2].to_string(),
                    status: f[3].to_string(),
                })
            }
            "ORDER_STATUS" => {
                need(7)?;
                Ok(BrokerEvent::OrderStatus {
                    order_id: parse("order_id", f[1])?,
                    status: f[2].to_string(),
                    filled: parse("filled", f[3])?,
                    remaining: parse("remaining", f[4])?,
                    avg_fill_price: parse("avg_fill_price", f[5])?,
                    why_held: f[6].to_string(),
                })
            }
            "EXEC_DETAILS" => {
                need(7)?;
                Ok(BrokerEvent::ExecDetails {
                    order_id: parse("order_id", f[1])?,
                    exec_id: f[2].to_string(),
                    qty: parse("qty", f[3])?,
                    price: parse("price", f[4])?,
                    side: f[5].to_string(),
                    time: f[6].to_string(),
                })
            }
            "COMMISSION" => {
                need(3)?;
                Ok(BrokerEvent::CommissionReport {
                    exec_id: f[1].to_string(),
                    commission: parse("commission", f[2])?,
                })
            }
            "DISCONNECTED" => Ok(BrokerEvent::Disconnected),
            other => Err(BrokerError::Protocol(format!("unknown event tag {other:?}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<(), BrokerError> {
    let len = payload.len() as u32;
    if len > MAX_FRAME_BYTES {
        return Err(BrokerError::Protocol(format!("frame too large: {len}")));
    }
    writer
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| BrokerError::Io(e.to_string()))?;
    writer
        .write_all(payload)
        .await
        .map_err(|e| BrokerError::Io(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| BrokerError::Io(e.to_string()))?;
    Ok(())
}

/// Read one frame; `None` on clean EOF at a frame boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Vec<u8>>, BrokerError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(BrokerError::Io(e.to_string())),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(BrokerError::Protocol(format!("frame too large: {len}")));
    }
    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| BrokerError::Io(e.to_string()))?;
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips() {
        let reqs = [
            Request::Connect { client_id: 7 },
            Request::PlaceOrder(WireOrder {
                order_id: 101,
                symbol: "AAPL".into(),
                side: "BUY".into(),
                qty: 33,
                kind: "LMT".into(),
                limit_price: Some(101.5),
                aux_price: None,
                parent_id: 0,
                transmit: false,
            }),
            Request::CancelOrder { order_id: 101 },
            Request::ReqAllOpenOrders,
            Request::Disconnect,
        ];
        for req in reqs {
            let decoded = Request::decode(&req.encode()).unwrap();
            assert_eq!(decoded, req);
        }
    }

    #[test]
    fn event_round_trips() {
        let events = [
            BrokerEvent::Connected,
            BrokerEvent::NextValidId(500),
            BrokerEvent::Error {
                code: 201,
                message: "Order rejected - insufficient margin".into(),
                req_id: 101,
            },
            BrokerEvent::OrderStatus {
                order_id: 101,
                status: "Submitted".into(),
                filled: 0,
                remaining: 33,
                avg_fill_price: 0.0,
                why_held: String::new(),
            },
            BrokerEvent::ExecDetails {
                order_id: 101,
                exec_id: "0001.01".into(),
                qty: 10,
                price: 101.48,
                side: "BOT".into(),
                time: "20260801 10:30:00".into(),
            },
            BrokerEvent::CommissionReport {
                exec_id: "0001.01".into(),
                commission: 1.02,
            },
            BrokerEvent::Disconnected,
        ];
        for ev in events {
            let decoded = BrokerEvent::decode(&ev.encode()).unwrap();
            assert_eq!(decoded, ev);
        }
    }

    #[test]
    fn garbage_rejected() {
        assert!(BrokerEvent::decode(b"NOT_A_TAG\0x").is_err());
        assert!(Request::decode(b"PLACE_ORDER\0only").is_err());
        assert!(BrokerEvent::decode(&[0xff, 0xfe]).is_err());
    }

    #[tokio::test]
    async fn framing_round_trips() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let payload = BrokerEvent::NextValidId(42).encode();
        write_frame(&mut a, &payload).await.unwrap();
        drop(a);
        let got = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(got, payload);
        // Clean EOF after the writer is gone.
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }
}
