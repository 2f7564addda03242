//! Control-Plane Interface
//!
//! The server never decides routes itself. Once per slice it packages the
//! session's telemetry into a [`SessionUpdateRequest`] and applies whatever
//! [`SessionUpdateResponse`] comes back.
//!
//! [`StaticBackend`] answers from a scripted queue and records every request.
//! It is cloneable so a test can keep a handle after giving one to the server.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::address::Address;
use crate::constants::KEY_BYTES;
use crate::packets::{ClientStatsPacket, NearRelaySet, UpdateType};
use crate::tags::Magic;

/// Stats the client reported plus what the server measured on its side.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ClientStats {
    pub reported: ClientStatsPacket,
    pub packets_lost_client_to_server: u64,
    pub packets_out_of_order_client_to_server: u64,
    pub jitter_client_to_server: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionUpdateRequest {
    pub session_id: u64,
    /// Client address with the last octet / segment cleared.
    pub client_address: Address,
    pub server_address: Address,
    pub slice_number: u64,
    pub client_route_public_key: [u8; KEY_BYTES],
    pub stats: ClientStats,
    /// True if the session is currently sending over next.
    pub next: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionUpdateResponse {
    pub update_type: UpdateType,
    pub num_tokens: u32,
    pub tokens: Vec<u8>,
    pub near_relays: Option<NearRelaySet>,
    pub multipath: bool,
    /// The server may send over next only once the route is committed.
    pub committed: bool,
    pub upcoming_magic: Option<Magic>,
}

impl SessionUpdateResponse {
    pub fn direct() -> Self {
        Self::default()
    }
}

pub trait Backend: Send {
    /// One session update round trip. `None` is a failed or lost exchange.
    fn session_update(&mut self, request: &SessionUpdateRequest) -> Option<SessionUpdateResponse>;
}

#[derive(Default)]
struct StaticBackendInner {
    responses: VecDeque<SessionUpdateResponse>,
    fallback: Option<SessionUpdateResponse>,
    requests: Vec<SessionUpdateRequest>,
}

#[derive(Clone, Default)]
pub struct StaticBackend {
    inner: Arc<Mutex<StaticBackendInner>>,
}

impl StaticBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every request with `response` once the scripted queue is empty.
    pub fn with_default(response: SessionUpdateResponse) -> Self {
        let backend = Self::new();
        backend.inner.lock().fallback = Some(response);
        backend
    }

    pub fn push_response(&self, response: SessionUpdateResponse) {
        self.inner.lock().responses.push_back(response);
    }

    pub fn requests(&self) -> Vec<SessionUpdateRequest> {
        self.inner.lock().requests.clone()
    }

    pub fn request_count(&self) -> usize {
        self.inner.lock().requests.len()
    }
}

impl Backend for StaticBackend {
    fn session_update(&mut self, request: &SessionUpdateRequest) -> Option<SessionUpdateResponse> {
        let mut inner = self.inner.lock();
        inner.requests.push(request.clone());
        inner
            .responses
            .pop_front()
            .or_else(|| inner.fallback.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(slice_number: u64) -> SessionUpdateRequest {
        SessionUpdateRequest {
            session_id: 7,
            client_address: "1.2.3.0:50000".parse().unwrap(),
            server_address: "5.6.7.8:40000".parse().unwrap(),
            slice_number,
            client_route_public_key: [0u8; KEY_BYTES],
            stats: ClientStats::default(),
            next: false,
        }
    }

    #[test]
    fn test_scripted_then_default() {
        let mut backend = StaticBackend::with_default(SessionUpdateResponse::direct());
        let observer = backend.clone();
        backend.push_response(SessionUpdateResponse {
            update_type: UpdateType::Route,
            committed: true,
            ..Default::default()
        });

        let first = backend.session_update(&request(0)).unwrap();
        assert_eq!(first.update_type, UpdateType::Route);
        let second = backend.session_update(&request(1)).unwrap();
        assert_eq!(second.update_type, UpdateType::Direct);

        assert_eq!(observer.request_count(), 2);
        assert_eq!(observer.requests()[1].slice_number, 1);
    }

    #[test]
    fn test_empty_backend_fails() {
        let mut backend = StaticBackend::new();
        assert!(backend.session_update(&request(0)).is_none());
        assert_eq!(backend.request_count(), 1);
    }
}
