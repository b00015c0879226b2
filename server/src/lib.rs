//! # Realm Server Core
//!
//! The authoritative core of a persistent-world game server. It owns every
//! live entity, runs scheduled world work, reacts to calendar boundaries and
//! keeps track of connected sessions, all driven by one fixed-rate tick.
//!
//! ## Core Responsibilities
//!
//! ### Entity Identity
//! Every entity carries an identity that is never reused and an instance
//! token unique to its construction. Long-lived references go through
//! handles that check the token before every use, so a reference to a
//! destroyed entity resolves to nothing instead of to whatever took its slot.
//!
//! ### Deferred Work
//! Subsystems schedule delayed, parameterized work as processes. The tick
//! driver runs each one on the first tick at or after its due time, in
//! enqueue order among equals, and keeps going when a handler fails.
//!
//! ### Calendar Events
//! Once a minute the time system compares the wall clock with its last
//! snapshot and notifies subscribers of every year, month, day, hour and
//! minute boundary crossed, coarsest first.
//!
//! ### Sessions
//! Connections are admitted into a concurrent registry and authenticated
//! against credentials the login center deposited beforehand. Each session
//! is served by its own tasks and never touches the world directly.
//!
//! ## Architecture Design
//!
//! ### Single Tick Driver
//! One task owns the [`world::World`]. Each tick drains session events,
//! pumps due processes, advances the calendar and updates entities, in that
//! order. Ticks never overlap; a slow tick only delays the next.
//!
//! ### Per-Session Tasks
//! Each connection runs a reader that parses frames and a writer that
//! drains an outgoing queue. Both stop on the session's cancellation token,
//! which is a child of the server's network token.
//!
//! ## Module Organization
//!
//! - `entity`: identities, instance tokens, the slot arena and handles
//! - `process`: the deferred process queue and handler registry
//! - `time_system`: calendar boundary detection and subscriber dispatch
//! - `session`, `session_registry`: connected peers and the handoff mailbox
//! - `network`: accept loop, handshake and per-session tasks
//! - `world`: authoritative entity state and its per-tick update
//! - `scheduler`: the tick driver
//! - `server`: start/stop wiring
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use realm_server::config::ServerConfig;
//! use realm_server::process::ProcessKind;
//! use realm_server::server::GameServer;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut server = GameServer::new(ServerConfig::default());
//!
//!     // Embedders plug their own deferred work in before starting.
//!     server.register_handler(ProcessKind::MarketUpdate, |_world, _process| Ok(()));
//!
//!     let addr = server.start().await?;
//!     println!("listening on {}", addr);
//!
//!     server.shutdown_signal().cancelled().await;
//!     server.stop().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod entity;
pub mod error;
pub mod network;
pub mod physics;
pub mod process;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod session_registry;
pub mod time_system;
pub mod world;

pub use config::ServerConfig;
pub use error::ServerError;
pub use server::GameServer;
