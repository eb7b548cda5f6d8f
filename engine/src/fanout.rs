//! WebSocket fan-out.
//!
//! Clients connect on a dedicated port and receive text-framed JSON. There is no
//! authentication; the feed is broadcast-only apart from ping/pong. Per-connection
//! ordering is preserved (each socket drains its own queue); cross-connection ordering is
//! not guaranteed and a live bet may be seen here before its round is committed to the
//! historical tables.

use std::{
	collections::HashMap,
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc, Mutex,
	},
};

use anyhow::Context;
use futures::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::mpsc};
use tokio_tungstenite::{accept_async, tungstenite::Message};

use crate::records::Direction;

/// Everything the engine pushes to clients.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
	#[serde(rename_all = "camelCase")]
	Welcome { message: String, timestamp: String, client_count: usize },
	NewBet {
		wallet: String,
		epoch: i64,
		direction: Direction,
		amount: Decimal,
		timestamp: String,
		suspicious: bool,
		#[serde(skip_serializing_if = "Option::is_none")]
		flags: Option<Vec<String>>,
	},
	#[serde(rename_all = "camelCase")]
	RoundUpdate {
		epoch: i64,
		status: &'static str,
		start_timestamp: u64,
		lock_timestamp: u64,
		close_timestamp: u64,
		lock_price: Decimal,
		close_price: Decimal,
		total_amount: Decimal,
		bull_amount: Decimal,
		bear_amount: Decimal,
		timestamp: String,
	},
	RoundLock { epoch: i64, timestamp: String },
	ConnectionStatus { connected: bool, timestamp: String },
	#[serde(rename_all = "camelCase")]
	SuspiciousActivity {
		wallet: String,
		epoch: i64,
		direction: Direction,
		amount: Decimal,
		flags: Vec<String>,
		total_bets: u64,
		total_amount: Decimal,
		timestamp: String,
	},
	Pong { timestamp: String },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InboundMessage {
	Ping,
}

type ClientId = u64;
type ClientMap = Arc<Mutex<HashMap<ClientId, mpsc::UnboundedSender<Message>>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
	pub delivered: usize,
	pub pruned: usize,
}

/// Cheap clonable handle the pipelines broadcast through.
#[derive(Clone)]
pub struct FanoutHandle {
	clients: ClientMap,
}

impl FanoutHandle {
	pub fn broadcast(&self, message: &OutboundMessage) -> BroadcastReport {
		let text = match serde_json::to_string(message) {
			Ok(text) => text,
			Err(error) => {
				tracing::error!("unserializable fan-out message: {error}");
				return BroadcastReport { delivered: 0, pruned: 0 };
			},
		};

		let mut clients = self.clients.lock().unwrap();
		let dead: Vec<ClientId> = clients
			.iter()
			.filter(|(_, sender)| sender.send(Message::Text(text.clone())).is_err())
			.map(|(id, _)| *id)
			.collect();
		for id in &dead {
			clients.remove(id);
		}

		let report = BroadcastReport { delivered: clients.len(), pruned: dead.len() };
		if report.pruned > 0 {
			tracing::debug!(
				"broadcast reached {} clients, pruned {} dead sockets",
				report.delivered,
				report.pruned
			);
		}
		report
	}

	pub fn client_count(&self) -> usize {
		self.clients.lock().unwrap().len()
	}
}

pub struct FanoutServer {
	listener: TcpListener,
	clients: ClientMap,
	next_client_id: Arc<AtomicU64>,
}

// Split into new/run so the listener is known to be bound (or to have failed, fatally)
// before anything else starts.
impl FanoutServer {
	pub async fn new(port: u16) -> anyhow::Result<Self> {
		let bind_address = format!("0.0.0.0:{port}");
		let listener = TcpListener::bind(&bind_address)
			.await
			.with_context(|| format!("could not bind fan-out listener to {bind_address}"))?;
		tracing::info!("fan-out listening on {bind_address}");
		Ok(FanoutServer {
			listener,
			clients: Arc::new(Mutex::new(HashMap::new())),
			next_client_id: Arc::new(AtomicU64::new(1)),
		})
	}

	pub fn handle(&self) -> FanoutHandle {
		FanoutHandle { clients: self.clients.clone() }
	}

	pub fn local_addr(&self) -> anyhow::Result<std::net::SocketAddr> {
		Ok(self.listener.local_addr()?)
	}

	pub async fn run(self) -> anyhow::Result<()> {
		loop {
			match self.listener.accept().await {
				Ok((stream, peer)) => {
					let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
					let clients = self.clients.clone();
					tokio::spawn(async move {
						if let Err(error) = handle_connection(client_id, stream, clients).await {
							tracing::debug!("fan-out client {peer} ended: {error:#}");
						}
					});
				},
				Err(error) => {
					tracing::error!("fan-out accept failed: {error}");
				},
			}
		}
	}
}

async fn handle_connection(
	client_id: ClientId,
	stream: tokio::net::TcpStream,
	clients: ClientMap,
) -> anyhow::Result<()> {
	let websocket = accept_async(stream).await.context("websocket handshake failed")?;
	let (mut sink, mut source) = websocket.split();
	let (sender, mut receiver) = mpsc::unbounded_channel::<Message>();

	let client_count = {
		let mut clients = clients.lock().unwrap();
		clients.insert(client_id, sender.clone());
		clients.len()
	};

	let welcome = OutboundMessage::Welcome {
		message: "connected to prediction feed".to_string(),
		timestamp: crate::taipei_time::canonical_now(),
		client_count,
	};
	let _ = sender.send(Message::Text(serde_json::to_string(&welcome)?));

	// Writer: drains this connection's queue so broadcasts never block on a slow socket.
	let writer = tokio::spawn(async move {
		while let Some(message) = receiver.recv().await {
			if sink.send(message).await.is_err() {
				break;
			}
		}
	});

	let result = async {
		while let Some(message) = source.next().await {
			match message? {
				Message::Text(text) => match serde_json::from_str::<InboundMessage>(&text) {
					Ok(InboundMessage::Ping) => {
						let pong =
							OutboundMessage::Pong { timestamp: crate::taipei_time::canonical_now() };
						let _ = sender.send(Message::Text(serde_json::to_string(&pong)?));
					},
					Err(_) => {
						tracing::debug!("fan-out client {client_id} sent unknown message {text:?}");
					},
				},
				Message::Ping(payload) => {
					let _ = sender.send(Message::Pong(payload));
				},
				Message::Close(_) => break,
				_ => {},
			}
		}
		anyhow::Ok(())
	}
	.await;

	clients.lock().unwrap().remove(&client_id);
	drop(sender);
	let _ = writer.await;
	result
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn new_bet_message_shape() {
		let message = OutboundMessage::NewBet {
			wallet: "0xccc".to_string(),
			epoch: 42,
			direction: Direction::Up,
			amount: Decimal::new(25, 1),
			timestamp: "2024-01-01 00:00:00".to_string(),
			suspicious: false,
			flags: None,
		};
		assert_eq!(
			serde_json::to_string(&message).unwrap(),
			r#"{"type":"new_bet","wallet":"0xccc","epoch":42,"direction":"UP","amount":"2.5","timestamp":"2024-01-01 00:00:00","suspicious":false}"#
		);
	}

	#[test]
	fn suspicious_activity_message_shape() {
		let message = OutboundMessage::SuspiciousActivity {
			wallet: "0xddd".to_string(),
			epoch: 42,
			direction: Direction::Down,
			amount: Decimal::from(12),
			flags: vec!["large_amount".to_string()],
			total_bets: 3,
			total_amount: Decimal::from(30),
			timestamp: "2024-01-01 00:00:00".to_string(),
		};
		let json: serde_json::Value =
			serde_json::from_str(&serde_json::to_string(&message).unwrap()).unwrap();
		assert_eq!(json["type"], "suspicious_activity");
		assert_eq!(json["totalBets"], 3);
		assert_eq!(json["flags"][0], "large_amount");
	}

	#[test]
	fn welcome_message_uses_camel_case_client_count() {
		let message = OutboundMessage::Welcome {
			message: "hi".to_string(),
			timestamp: "2024-01-01 00:00:00".to_string(),
			client_count: 7,
		};
		let json: serde_json::Value =
			serde_json::from_str(&serde_json::to_string(&message).unwrap()).unwrap();
		assert_eq!(json["clientCount"], 7);
	}

	#[tokio::test]
	async fn clients_receive_welcome_pong_and_broadcasts() {
		let server = FanoutServer::new(0).await.unwrap();
		let address = server.local_addr().unwrap();
		let handle = server.handle();
		tokio::spawn(server.run());

		let (mut client, _) =
			tokio_tungstenite::connect_async(format!("ws://{address}")).await.unwrap();

		let welcome = client.next().await.unwrap().unwrap();
		let welcome: serde_json::Value = serde_json::from_str(welcome.to_text().unwrap()).unwrap();
		assert_eq!(welcome["type"], "welcome");
		assert_eq!(welcome["clientCount"], 1);

		client.send(Message::Text(r#"{"type":"ping"}"#.to_string())).await.unwrap();
		let pong = client.next().await.unwrap().unwrap();
		let pong: serde_json::Value = serde_json::from_str(pong.to_text().unwrap()).unwrap();
		assert_eq!(pong["type"], "pong");

		// Wait for registration to be visible, then broadcast.
		let report = handle.broadcast(&OutboundMessage::RoundLock {
			epoch: 9,
			timestamp: "2024-01-01 00:00:00".to_string(),
		});
		assert_eq!(report, BroadcastReport { delivered: 1, pruned: 0 });

		let lock = client.next().await.unwrap().unwrap();
		let lock: serde_json::Value = serde_json::from_str(lock.to_text().unwrap()).unwrap();
		assert_eq!(lock["type"], "round_lock");
		assert_eq!(lock["epoch"], 9);
	}

	#[tokio::test]
	async fn broadcast_prunes_disconnected_clients() {
		let server = FanoutServer::new(0).await.unwrap();
		let address = server.local_addr().unwrap();
		let handle = server.handle();
		tokio::spawn(server.run());

		let (client, _) =
			tokio_tungstenite::connect_async(format!("ws://{address}")).await.unwrap();
		drop(client);

		// Connection teardown is asynchronous; poll until the set is empty.
		for _ in 0..50 {
			if handle.client_count() == 0 {
				break;
			}
			tokio::time::sleep(std::time::Duration::from_millis(10)).await;
		}
		let report = handle.broadcast(&OutboundMessage::ConnectionStatus {
			connected: true,
			timestamp: "2024-01-01 00:00:00".to_string(),
		});
		assert_eq!(report.delivered, 0);
	}
}
