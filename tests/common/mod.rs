//! Shared test utilities: an in-memory connector whose transports are
//! driven from the test body.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::channel::mpsc as fmpsc;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;

use storefront_realtime::realtime::{
    Connector, RealtimeError, RealtimeResult, Transport, WireMessage,
};

/// What the next connect attempt does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    /// Open a transport and hand its server end to the test
    Accept,
    /// Fail immediately
    Refuse,
    /// Never resolve
    Hang,
}

/// Server side of one accepted transport.
///
/// Dropping it (or `inbound`) looks like the server closing the socket.
pub struct ServerEnd {
    /// Frames the client wrote
    pub outbound: fmpsc::UnboundedReceiver<String>,
    /// Frames pushed to the client
    pub inbound: fmpsc::UnboundedSender<RealtimeResult<String>>,
}

impl ServerEnd {
    /// Next frame the client wrote, parsed
    pub async fn next_message(&mut self) -> WireMessage {
        let text = self.outbound.next().await.expect("client closed the transport");
        WireMessage::parse(&text).expect("client wrote an invalid frame")
    }

    /// Push a raw text frame to the client
    pub fn push(&self, text: impl Into<String>) {
        self.inbound
            .unbounded_send(Ok(text.into()))
            .expect("client dropped the transport");
    }

    pub fn push_message(&self, message: &WireMessage) {
        self.push(message.to_json().unwrap());
    }
}

pub struct MockConnector {
    plans: Mutex<VecDeque<Plan>>,
    default_plan: Plan,
    calls: AtomicUsize,
    urls: Mutex<Vec<String>>,
    servers: mpsc::UnboundedSender<ServerEnd>,
}

impl MockConnector {
    /// Connector that follows `default_plan` once queued plans run out
    pub fn new(default_plan: Plan) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (servers, accepted) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            plans: Mutex::new(VecDeque::new()),
            default_plan,
            calls: AtomicUsize::new(0),
            urls: Mutex::new(Vec::new()),
            servers,
        });
        (connector, accepted)
    }

    pub fn push_plan(&self, plan: Plan) {
        self.plans.lock().unwrap().push_back(plan);
    }

    /// Connect attempts so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &str, _protocols: &[String]) -> RealtimeResult<Transport> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(url.to_string());

        let plan = self
            .plans
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.default_plan);

        match plan {
            Plan::Refuse => Err(RealtimeError::Transport("connection refused".into())),
            Plan::Hang => std::future::pending().await,
            Plan::Accept => {
                let (client_tx, server_rx) = fmpsc::unbounded::<String>();
                let (server_tx, client_rx) = fmpsc::unbounded::<RealtimeResult<String>>();

                let sink = client_tx.sink_map_err(|_| RealtimeError::ConnectionClosed);
                let _ = self.servers.send(ServerEnd {
                    outbound: server_rx,
                    inbound: server_tx,
                });

                Ok(Transport::new(Box::pin(sink), Box::pin(client_rx)))
            }
        }
    }
}

/// Numbered order message for ordering checks
pub fn numbered(n: u64) -> WireMessage {
    WireMessage::new("order", "order.created", serde_json::json!({"orderId": format!("o-{}", n), "n": n}))
}

pub fn number_of(message: &WireMessage) -> u64 {
    message.data.get("n").and_then(Value::as_u64).expect("numbered message")
}
