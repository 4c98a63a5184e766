use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use veil_client::{ChatClient, Incoming};
use veil_proto::codec::{decode_server_event, encode};
use veil_proto::{ClientEvent, DeliveryStatus, ErrorCode, ServerEvent, UserId};
use veil_relay::{HmacTokenAuthenticator, RelayConfig, RelayServer};

const SECRET: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

struct Socket {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    client: ChatClient,
}

impl Socket {
    async fn open(addr: SocketAddr, id: &str, name: &str) -> Self {
        let (ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();
        let client = ChatClient::new(UserId::parse(id).unwrap(), name).unwrap();
        Self { ws, client }
    }

    async fn send(&mut self, event: &ClientEvent) {
        self.ws.send(Message::Text(encode(event).unwrap())).await.unwrap();
    }

    async fn recv(&mut self) -> ServerEvent {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), self.ws.next())
                .await
                .expect("timed out waiting for frame")
                .expect("socket closed")
                .unwrap();
            if let Message::Text(text) = msg {
                return decode_server_event(&text).unwrap();
            }
        }
    }

    /// Receive one event, feed it to the client and send its replies.
    async fn pump(&mut self) -> Vec<Incoming> {
        let event = self.recv().await;
        let handled = self.client.handle(event).unwrap();
        for frame in &handled.outgoing {
            self.send(frame).await;
        }
        handled.incoming
    }

    async fn login(&mut self) {
        let auth = HmacTokenAuthenticator::new(hex::decode(SECRET).unwrap());
        let token = auth.issue(self.client.user_id()).unwrap();
        let frame = self.client.authenticate(token);
        self.send(&frame).await;
        assert!(matches!(self.recv().await, ServerEvent::Authenticated { .. }));
        let frame = self.client.join();
        self.send(&frame).await;
        assert!(matches!(self.pump().await[..], [Incoming::Joined { .. }]));
    }
}

#[tokio::test]
async fn two_clients_chat_over_websocket() {
    let config = RelayConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        auth_secret: Some(SECRET.into()),
        ..RelayConfig::default()
    };
    let server = veil_relay::build(&config).unwrap();
    let listener = RelayServer::bind(config.bind_addr).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serving = tokio::spawn(server.clone().serve(listener));

    let mut alice = Socket::open(addr, "100001", "alice").await;
    alice.login().await;
    let mut bob = Socket::open(addr, "200002", "bob").await;
    bob.login().await;
    assert!(matches!(alice.pump().await[..], [Incoming::PeerOnline { .. }]));

    let hello = alice.client.start_chat(bob.client.user_id()).unwrap();
    alice.send(&hello).await;
    assert!(matches!(bob.pump().await[..], [Incoming::SecureChannelReady { .. }]));
    assert!(matches!(alice.pump().await[..], [Incoming::SecureChannelReady { .. }]));
    assert!(bob.pump().await.is_empty(), "exchange-complete is advisory");

    let frame = alice.client.compose_text(bob.client.user_id(), "hi").unwrap();
    alice.send(&frame).await;
    assert!(matches!(
        alice.pump().await[..],
        [Incoming::Status {
            status: DeliveryStatus::Delivered,
            ..
        }]
    ));
    assert!(matches!(&bob.pump().await[..], [Incoming::Message { text, .. }] if text == "hi"));

    alice.ws.send(Message::Text("nonsense".into())).await.unwrap();
    assert!(matches!(
        alice.recv().await,
        ServerEvent::Error {
            code: ErrorCode::InvalidPayload,
            ..
        }
    ));

    bob.ws.close(None).await.unwrap();
    assert!(matches!(alice.pump().await[..], [Incoming::PeerOffline { .. }]));

    serving.abort();
}
