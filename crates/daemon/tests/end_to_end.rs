//! Client and server cores talking through a simulated network.

use std::collections::BTreeSet;
use std::time::Duration;

use crypto_box::aead::OsRng;
use crypto_box::{PublicKey, SecretKey};
use ed25519_dalek::SigningKey;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use nextpath::crypto::random_key;
use nextpath::{
    Address, Backend, ClientConfig, ClientCore, ClientNotify, ClientState, ClientWorker,
    MemoryNetwork, Metrics, RouteState, RouteToken, ServerConfig, ServerCore, ServerNotify,
    ServerWorker, SessionUpdateRequest, SessionUpdateResponse, StaticBackend, UpdateType,
};

const CLIENT: &str = "1.2.3.4:50000";
const SERVER: &str = "5.6.7.8:40000";
const TICK: f64 = 0.1;
const STEP: f64 = 0.01;

/// Hands out a zero-relay route: the client's hop leads straight to the server.
struct DirectHopBackend {
    backend_secret: SecretKey,
    server_public: PublicKey,
    client_address: Address,
}

impl Backend for DirectHopBackend {
    fn session_update(&mut self, request: &SessionUpdateRequest) -> Option<SessionUpdateResponse> {
        let key = random_key();
        let mut tokens = Vec::new();
        for (next_address, receiver) in [
            (request.server_address, PublicKey::from(request.client_route_public_key)),
            (self.client_address, self.server_public.clone()),
        ] {
            let token = RouteToken {
                private_key: key,
                expire_timestamp: 2_000_000_000,
                session_id: request.session_id,
                session_version: 1,
                kbps_up: 1024,
                kbps_down: 1024,
                next_address,
            };
            tokens.extend(token.seal(&self.backend_secret, &receiver)?);
        }
        Some(SessionUpdateResponse {
            update_type: UpdateType::Route,
            num_tokens: 2,
            tokens,
            committed: true,
            ..Default::default()
        })
    }
}

/// Delivers every datagram after a random delay, duplicating some of them.
struct LossyNetwork {
    rng: StdRng,
    duplicate_chance: f64,
    in_flight: Vec<(f64, Address, Address, Vec<u8>)>,
    duplicated: usize,
}

impl LossyNetwork {
    fn new(seed: u64, duplicate_chance: f64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            duplicate_chance,
            in_flight: Vec::new(),
            duplicated: 0,
        }
    }

    fn send(&mut self, now: f64, from: Address, datagrams: Vec<(Address, Vec<u8>)>) {
        for (to, data) in datagrams {
            let delay = self.rng.gen_range(0.005..0.03);
            if self.rng.gen_bool(self.duplicate_chance) {
                let delay = self.rng.gen_range(0.005..0.05);
                self.in_flight.push((now + delay, from, to, data.clone()));
                self.duplicated += 1;
            }
            self.in_flight.push((now + delay, from, to, data));
        }
    }

    fn due(&mut self, now: f64) -> Vec<(Address, Address, Vec<u8>)> {
        let (mut due, pending): (Vec<_>, Vec<_>) =
            self.in_flight.drain(..).partition(|(at, ..)| *at <= now);
        self.in_flight = pending;
        due.sort_by(|a, b| a.0.total_cmp(&b.0));
        due.into_iter().map(|(_, from, to, data)| (from, to, data)).collect()
    }
}

struct Simulation {
    client: ClientCore,
    server: ServerCore,
    network: LossyNetwork,
    client_address: Address,
    server_address: Address,
    now: f64,
    next_tick: f64,
    client_received: Vec<Vec<u8>>,
    server_received: Vec<Vec<u8>>,
}

impl Simulation {
    fn new(route: bool) -> Self {
        let backend_secret = SecretKey::generate(&mut OsRng);
        let route_secret = SecretKey::generate(&mut OsRng);
        let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
        let client_address: Address = CLIENT.parse().unwrap();
        let server_address: Address = SERVER.parse().unwrap();

        let backend: Box<dyn Backend> = if route {
            Box::new(DirectHopBackend {
                backend_secret: backend_secret.clone(),
                server_public: route_secret.public_key(),
                client_address,
            })
        } else {
            Box::new(StaticBackend::with_default(SessionUpdateResponse::direct()))
        };
        let server = ServerCore::new(
            ServerConfig::new(
                server_address,
                signing_key.clone(),
                route_secret,
                backend_secret.public_key(),
            ),
            backend,
            Metrics::new(),
        );
        let client = ClientCore::new(
            ClientConfig {
                customer_public_key: signing_key.verifying_key(),
                backend_public_key: backend_secret.public_key(),
                platform_id: 1,
                connection_type: 1,
            },
            Metrics::new(),
        );

        Self {
            client,
            server,
            network: LossyNetwork::new(42, 0.1),
            client_address,
            server_address,
            now: 0.0,
            next_tick: 0.0,
            client_received: Vec::new(),
            server_received: Vec::new(),
        }
    }

    fn step(&mut self) {
        self.now += STEP;
        let now = self.now;

        for (from, to, data) in self.network.due(now) {
            if to == self.server_address {
                self.server.process_packet(&from, &data, now);
            } else if to == self.client_address {
                self.client.process_packet(&from, &data, now);
            }
        }
        if now >= self.next_tick {
            self.next_tick += TICK;
            self.client.update(now);
            self.server.update(now);
        }

        let outgoing = self.client.drain_outgoing();
        self.network.send(now, self.client_address, outgoing);
        let outgoing = self.server.drain_outgoing();
        self.network.send(now, self.server_address, outgoing);

        for notification in self.client.drain_notifications() {
            if let ClientNotify::PacketReceived(payload) = notification {
                self.client_received.push(payload);
            }
        }
        for notification in self.server.drain_notifications() {
            if let ServerNotify::PacketReceived { payload, .. } = notification {
                self.server_received.push(payload);
            }
        }
    }

    fn run_for(&mut self, seconds: f64) {
        let end = self.now + seconds;
        while self.now < end {
            self.step();
        }
    }

    fn upgrade(&mut self) -> u64 {
        self.client.open_session(self.server_address);
        let session_id = self
            .server
            .upgrade_session(self.client_address, 7, self.now)
            .unwrap();
        for _ in 0..200 {
            if self.client.state() == ClientState::Upgraded {
                break;
            }
            self.step();
        }
        assert_eq!(self.client.state(), ClientState::Upgraded);
        self.client_received.clear();
        self.server_received.clear();
        session_id
    }

    /// Both sides send `count` numbered payloads, one per step.
    fn exchange(&mut self, count: usize) -> (BTreeSet<Vec<u8>>, BTreeSet<Vec<u8>>) {
        let mut to_server = BTreeSet::new();
        let mut to_client = BTreeSet::new();
        for i in 0..count {
            let up = format!("up {}", i).into_bytes();
            assert!(self.client.send_packet(&up, self.now));
            to_server.insert(up);

            let down = format!("down {}", i).into_bytes();
            assert!(self.server.send_packet(self.client_address, &down, self.now));
            to_client.insert(down);

            self.step();
        }
        self.run_for(0.5);
        (to_server, to_client)
    }
}

fn sorted(payloads: &[Vec<u8>]) -> Vec<Vec<u8>> {
    let mut payloads = payloads.to_vec();
    payloads.sort();
    payloads
}

#[test]
fn test_upgrade_then_payloads_delivered_once() {
    let mut sim = Simulation::new(false);
    let session_id = sim.upgrade();
    assert_eq!(sim.client.session_id(), session_id);

    let (to_server, to_client) = sim.exchange(300);
    assert!(sim.network.duplicated > 0);

    // Duplicates never reach the application on the server.
    assert_eq!(sorted(&sim.server_received), to_server.into_iter().collect::<Vec<_>>());
    let client_received: BTreeSet<_> = sim.client_received.iter().cloned().collect();
    assert_eq!(client_received, to_client);

    assert_eq!(sim.client.route_state(), RouteState::Direct);
    assert_eq!(sim.server.sessions().len(), 1);
}

#[test]
fn test_route_over_next_under_duplication() {
    let mut sim = Simulation::new(true);
    sim.upgrade();

    let (to_server, to_client) = sim.exchange(300);

    assert_eq!(sim.client.route_state(), RouteState::CurrentRoute);
    assert_eq!(sim.client.fallback_flags().bits(), 0);
    assert_eq!(sorted(&sim.server_received), to_server.into_iter().collect::<Vec<_>>());
    let client_received: BTreeSet<_> = sim.client_received.iter().cloned().collect();
    assert_eq!(client_received, to_client);
}

#[test]
fn test_session_survives_quiet_period_with_pings() {
    let mut sim = Simulation::new(false);
    let session_id = sim.upgrade();

    // Pings keep the session alive well past the idle timeout.
    sim.run_for(25.0);
    assert_eq!(sim.client.state(), ClientState::Upgraded);
    assert!(sim.server.sessions().find_by_session_id(session_id).is_some());
    assert!(sim.client.stats().direct_rtt > 0.0);
}

#[test]
fn test_server_forgets_closed_client() {
    let mut sim = Simulation::new(false);
    let session_id = sim.upgrade();

    sim.client.close_session();
    sim.run_for(11.0);
    assert!(sim.server.sessions().find_by_session_id(session_id).is_none());
}

// ============================================================================
// Workers
// ============================================================================

async fn wait_for<T>(mut poll: impl FnMut() -> Option<T>) -> T {
    for _ in 0..500 {
        if let Some(value) = poll() {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for worker");
}

#[tokio::test]
async fn test_workers_over_memory_network() {
    let network = MemoryNetwork::new();
    let client_address: Address = "10.0.0.1:50000".parse().unwrap();
    let server_address: Address = "10.0.0.2:40000".parse().unwrap();

    let backend_secret = SecretKey::generate(&mut OsRng);
    let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
    let tick = Duration::from_millis(10);

    let server = ServerWorker::spawn(
        ServerConfig::new(
            server_address,
            signing_key.clone(),
            SecretKey::generate(&mut OsRng),
            backend_secret.public_key(),
        ),
        Box::new(StaticBackend::with_default(SessionUpdateResponse::direct())),
        network.bind(server_address),
        Metrics::new(),
        tick,
    );
    let client = ClientWorker::spawn(
        ClientConfig {
            customer_public_key: signing_key.verifying_key(),
            backend_public_key: backend_secret.public_key(),
            platform_id: 0,
            connection_type: 0,
        },
        network.bind(client_address),
        Metrics::new(),
        tick,
    );

    assert!(client.open_session(server_address));
    assert!(server.upgrade_session(client_address, 3));

    let session_id = wait_for(|| match client.try_recv() {
        Some(ClientNotify::Upgraded { session_id }) => Some(session_id),
        _ => None,
    })
    .await;
    wait_for(|| match server.try_recv() {
        Some(ServerNotify::SessionUpgraded { session_id: id, user_tag, .. }) => {
            assert_eq!(id, session_id);
            assert_eq!(user_tag, 3);
            Some(())
        }
        _ => None,
    })
    .await;

    assert!(client.send_packet(b"hello server"));
    let (address, payload) = wait_for(|| match server.try_recv() {
        Some(ServerNotify::PacketReceived { address, payload }) => Some((address, payload)),
        _ => None,
    })
    .await;
    assert_eq!(address, client_address);
    assert_eq!(payload, b"hello server");

    assert!(server.send_packet(client_address, b"hello client"));
    let payload = wait_for(|| match client.try_recv() {
        Some(ClientNotify::PacketReceived(payload)) => Some(payload),
        _ => None,
    })
    .await;
    assert_eq!(payload, b"hello client");

    client.shutdown().await;
    server.shutdown().await;
}
