//! # Registry Test Utilities
//!
//! Shared test utilities for the Room Registry.
//!
//! ## Modules
//!
//! - `mock_engine` - Media engine with switchable readiness and failure modes
//! - `test_client` - Raw signaling client over an in-memory link
//! - `fixtures` - Client capabilities, RTP parameters, DTLS parameters
//!
//! ## Usage
//!
//! ```rust,ignore
//! use registry_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let engine = MockMediaEngine::builder().build();
//!     let registry = spawn_registry(engine.clone());
//!
//!     let room = random_room();
//!     let mut alice = TestClient::connect(&registry, "alice");
//!     alice.join(&room).await.unwrap();
//!     let send = alice.create_transport(&room, TransportRole::Send).await.unwrap();
//!     alice.connect_transport(&room, &send.id).await.unwrap();
//!     alice.produce(&room, &send.id, MediaKind::Audio).await.unwrap();
//! }
//! ```

pub mod fixtures;
pub mod mock_engine;
pub mod test_client;

pub use fixtures::*;
pub use mock_engine::*;
pub use test_client::*;
