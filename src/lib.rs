//! # liveshare-relay — WebSocket relay for collaborative editing
//!
//! The relay routes and persists CRDT updates so that every client editing a
//! shared document converges, and mediates a JSON control plane for
//! presence, file operations, session lifecycle, and host-mediated access
//! control. Document bytes are opaque to the server; only the sync framing
//! around them is interpreted.
//!
//! ## Architecture
//!
//! ```text
//!                ┌──────────────────────────────────────────┐
//!                │              one HTTP listener           │
//!                │  REST (/rooms, /healthz, /auth/github)   │
//!                │  WS upgrade (/ws/<doc>, /control/<room>) │
//!                └──────┬──────────────────┬────────────────┘
//!                       │                  │
//!                ┌──────▼──────┐   ┌───────▼───────┐
//!                │  DocEngine  │   │  ControlHub   │
//!                │  yrs::Doc + │   │  JSON router  │
//!                │  awareness  │   │  (ephemeral)  │
//!                └──────┬──────┘   └───────────────┘
//!                       │ debounced snapshots
//!                ┌──────▼──────┐
//!                │  RocksDB    │  doc:<name> / room:<id>
//!                └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — varint wire framing for the binary document channel
//! - [`awareness`] — ephemeral per-client presence state
//! - [`doc`] — per-document engine: apply, fan out, persist, idle-destroy
//! - [`control`] — per-room JSON message routing
//! - [`registry`] — room creation, lookup, token authentication
//! - [`store`] — persistence trait, RocksDB and in-memory implementations
//! - [`gateway`] — WebSocket upgrade authentication and connection driving
//! - [`rest`] — REST handlers and router assembly
//! - [`auth`] — identity token verification and the GitHub OAuth exchange
//! - [`invite`] — the out-of-band invite string format, for interop

pub mod auth;
pub mod awareness;
pub mod config;
pub mod control;
pub mod doc;
pub mod error;
pub mod gateway;
pub mod invite;
pub mod protocol;
pub mod rate_limit;
pub mod registry;
pub mod rest;
pub mod store;

pub use auth::{GithubOauth, IdentityClaims, IdentityVerifier};
pub use config::Config;
pub use control::{ControlHub, RoomPolicy};
pub use doc::{DocEngine, EngineConfig};
pub use error::ApiError;
pub use rate_limit::RateLimiter;
pub use registry::{Permission, Room, RoomRegistry};
pub use rest::{build_router, AppState};
pub use store::{MemStore, Persistence, RocksStore, StoreError};
