//! # nextpath
//!
//! Client and server halves of a UDP acceleration protocol for game traffic.
//! A game server upgrades a plain UDP client into an accelerated session;
//! afterwards a control plane can steer the session's packets across a
//! chain of relays, falling back to direct delivery whenever the route
//! misbehaves.
//!
//! ## Key Components
//!
//! ### Wire
//! - [`WriteStream`] / [`ReadStream`] - bit-packed serialization
//! - [`Packet`] - every packet type, with [`write_packet`] / [`read_packet`]
//! - [`basic_packet_filter`] / [`advanced_packet_filter`] - per-packet tags
//! - [`RouteToken`] / [`ContinueToken`] / [`UpgradeToken`] - sealed tokens
//!
//! ### Client
//! - [`ClientCore`] - session state machine, driven with explicit time
//! - [`RouteManager`] - current and pending routes, fallback
//! - [`ClientWorker`] - a core on a tokio task behind crossbeam queues
//!
//! ### Server
//! - [`ServerCore`] - upgrade handshake, sessions, backend updates
//! - [`Backend`] - control-plane route decisions
//! - [`ServerWorker`] - a core on a tokio task behind crossbeam queues
//!
//! ## Example
//!
//! ```rust,ignore
//! use nextpath::{ClientConfig, ClientWorker, Metrics, UdpTransport};
//!
//! let transport = UdpTransport::bind("0.0.0.0:0".parse()?).await?;
//! let client = ClientWorker::spawn(config, transport, Metrics::new(), tick);
//! client.open_session("5.6.7.8:40000".parse()?);
//! client.send_packet(b"hello");
//! ```

pub mod address;
pub mod backend;
pub mod client;
pub mod config;
pub mod constants;
pub mod crypto;
pub mod limiter;
pub mod metrics;
pub mod near;
pub mod packets;
pub mod quality;
pub mod replay;
pub mod route;
pub mod sender;
pub mod server;
pub mod session;
pub mod stream;
pub mod tags;
pub mod tokens;
pub mod transport;

// ============================================================================
// Configuration
// ============================================================================

pub use config::{Config, DaemonConfig, NetworkConfig, SecurityConfig, TimingConfig};

// ============================================================================
// Addressing
// ============================================================================

pub use address::Address;

// ============================================================================
// Serialization
// ============================================================================

pub use stream::{bits_required, ReadStream, Stream, WriteStream};

// ============================================================================
// Packets
// ============================================================================

pub use packets::{
    read_packet, write_packet, ClientStatsPacket, NearRelaySet, Packet, PacketType, ReadContext,
    UpdateType, WriteContext,
};
pub use tags::{advanced_packet_filter, basic_packet_filter, derive_magic, Magic, MagicSet};

// ============================================================================
// Crypto and Tokens
// ============================================================================

pub use crypto::{KxKeyPair, OpenError, SessionKeys};
pub use replay::ReplayProtection;
pub use tokens::{ContinueToken, PingToken, RouteToken, UpgradeToken};

// ============================================================================
// Quality
// ============================================================================

pub use limiter::BandwidthLimiter;
pub use quality::{JitterTracker, OutOfOrderTracker, PacketLossTracker, PathQuality, PingHistory};

// ============================================================================
// Client
// ============================================================================

pub use client::{ClientConfig, ClientCore, ClientNotify, ClientState, ClientWorker};
pub use near::NearRelayManager;
pub use route::{FallbackFlags, RouteManager, RouteState};

// ============================================================================
// Server
// ============================================================================

pub use backend::{Backend, SessionUpdateRequest, SessionUpdateResponse, StaticBackend};
pub use server::{ServerConfig, ServerCore, ServerNotify, ServerWorker};
pub use session::{PendingSessionManager, SessionManager};

// ============================================================================
// Transport and Metrics
// ============================================================================

pub use metrics::Metrics;
pub use transport::{MemoryNetwork, MemoryTransport, Transport, UdpTransport};
