//! Shared fixtures for the integration tests.
//!
//! Most tests run one real [`PostOffice`] against a [`Peer`]: a bare link on
//! the same simulated network whose packets the test writes and inspects by
//! hand, so every message on the wire can be scripted.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use mailnet::link::Link;
use mailnet::simulator::Network;
use mailnet::{Config, Connection, ConnectionState, Endpoint, Flags, LinkAddr, Message, PostOffice};

/// Upper bound for any single step that should complete promptly.
pub const STEP: Duration = Duration::from_secs(5);

/// Short timers so retransmission tests finish quickly.
pub fn fast_config() -> Config {
    Config {
        initial_rto: Duration::from_millis(50),
        min_rto: Duration::from_millis(20),
        max_rto: Duration::from_millis(400),
        max_retries: 3,
        tick: Duration::from_millis(10),
        ..Config::default()
    }
}

/// No retransmission: every packet on the wire is one the test caused.
pub fn quiet_config() -> Config {
    Config {
        retransmit: false,
        ..Config::default()
    }
}

/// A scripted endpoint speaking raw messages over its own link.
pub struct Peer {
    pub link: Link,
    pub me: Endpoint,
}

impl Peer {
    pub fn attach(net: &Network, me: Endpoint) -> Self {
        Self {
            link: net.attach(me.link),
            me,
        }
    }

    pub async fn send(&self, to: Endpoint, flags: Flags, seq: u32, payload: &[u8]) {
        let message = Message::new(self.me, to, flags, seq, payload.to_vec());
        let packet = message.encode(self.link.max_payload()).expect("encode");
        self.link.send(packet).await.expect("peer send");
    }

    /// Next decodable message addressed to this peer.
    pub async fn recv(&self) -> Message {
        let packet = tokio::time::timeout(STEP, self.link.receive())
            .await
            .expect("peer timed out waiting for a packet")
            .expect("peer link detached");
        Message::decode(&packet).expect("peer received malformed packet")
    }

    /// Assert nothing arrives for `window`.
    pub async fn expect_silence(&self, window: Duration) {
        if let Ok(Some(packet)) = tokio::time::timeout(window, self.link.receive()).await {
            panic!("expected silence, got {:?}", Message::decode(&packet));
        }
    }

    /// Play the passive side of a handshake: wait for SYN, answer SYN|ACK.
    pub async fn answer_syn(&self) -> Endpoint {
        let syn = self.recv().await;
        assert_eq!(syn.flags, Flags::SYN);
        self.send(syn.src, Flags::SYN | Flags::ACK, syn.seq, b"").await;
        syn.src
    }
}

/// Open a connection from `post_office` to `peer`, with the peer answering
/// the handshake.  Returns the connection and its endpoint as seen by the
/// peer.
pub async fn open_against(post_office: &Arc<PostOffice>, peer: &Peer) -> (Connection, Endpoint) {
    let opening = tokio::spawn(Connection::open(
        Arc::clone(post_office),
        peer.me.link,
        peer.me.port,
    ));
    let client = peer.answer_syn().await;
    let conn = tokio::time::timeout(STEP, opening)
        .await
        .expect("connect timed out")
        .expect("connect task panicked")
        .expect("connect failed");
    assert_eq!(conn.state(), ConnectionState::Established);
    (conn, client)
}

/// Two post offices on one network, at link addresses `a` and `b`.
pub fn pair(net: &Network, a: LinkAddr, b: LinkAddr, config: Config) -> (Arc<PostOffice>, Arc<PostOffice>) {
    (
        PostOffice::new(net.attach(a), config.clone()),
        PostOffice::new(net.attach(b), config),
    )
}

/// Poll until the connection reaches `state`.
pub async fn wait_for_state(conn: &Connection, state: ConnectionState) {
    tokio::time::timeout(STEP, async {
        while conn.state() != state {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("connection stuck in {}, wanted {state}", conn.state()));
}
