pub extern crate multiaddr;

pub mod error;
pub mod identity;
pub mod key;
pub mod message;
pub mod node;
pub mod protocol;
pub mod query;
pub mod republish;
pub mod routing;
pub mod server;
pub mod store;
pub mod transport;

pub use error::{Error, Result};
pub use identity::Identity;
pub use key::{Distance, Key};
pub use node::{KademliaConfig, KademliaNode};
pub use server::ServerHandle;

pub const K_VALUE: usize = 20;

pub const ALPHA_VALUE: usize = 3;

/// Length in bytes of node ids and content keys.
pub const KEY_LENGTH: usize = 20;

pub const NUM_BUCKETS: usize = KEY_LENGTH * 8;

pub const MAX_RECORD_SIZE: usize = 65 * 1024;

/// Upper bound for a single frame on the wire, a STORE carrying a full record
/// plus the envelope fits comfortably.
pub const MAX_MESSAGE_SIZE: usize = MAX_RECORD_SIZE + 4 * 1024;
