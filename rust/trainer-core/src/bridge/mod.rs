// rust/trainer-core/src/bridge/mod.rs

//! Transport contract between the two parties.
//!
//! A bridge ferries named values between leader and follower, one iteration
//! at a time. The runtime only issues the calls below; framing, retries and
//! security belong to the implementation.
//!
//! | Call | Contract |
//! |---|---|
//! | `connect` | establishes the session, called once |
//! | `start(i)` | barrier, both parties announce the same iteration id |
//! | `send(name, value)` | enqueues `value` under `name` for the current iteration |
//! | `receive(name, dtype)` | waits for the current iteration's value under `name` |
//! | `commit` | barrier, the party finished the iteration |
//! | `terminate` | releases the session, called once, last |

mod local;

use async_trait::async_trait;

use crate::error::Result;
use crate::tensor::{DType, Value};

pub use local::LocalBridge;

/// Reserved channel carrying the leader's example id digest.
pub const VERIFY_EXAMPLE_IDS: &str = "_verify_example_ids";

/// Suffix of the reverse channel paired with a gradient-carrying exchange.
pub const GRADIENT_SUFFIX: &str = "_grad";

/// Name of the channel that carries the gradient for `name`.
pub fn gradient_channel(name: &str) -> String {
    format!("{name}{GRADIENT_SUFFIX}")
}

/// Trait for bridge implementations.
///
/// Methods take `&self` so a session can keep several receives in flight
/// while it issues sends.
#[async_trait]
pub trait Bridge: Send + Sync {
    /// Establish the session with the peer.
    async fn connect(&self) -> Result<()>;

    /// Announce iteration `iteration` and wait for the peer to do the same.
    async fn start(&self, iteration: u64) -> Result<()>;

    /// Enqueue `value` under `name` for the current iteration.
    async fn send(&self, name: &str, value: Value) -> Result<()>;

    /// Wait for the value the peer sent under `name` this iteration.
    async fn receive(&self, name: &str, dtype: DType) -> Result<Value>;

    /// Signal that this party finished the current iteration and wait for the peer.
    async fn commit(&self) -> Result<()>;

    /// Release the session.
    async fn terminate(&self) -> Result<()>;
}
