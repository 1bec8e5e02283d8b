//! Chain-facing side of forgeshare.
//!
//! [`SyncCoordinator`] catches the ledger up with the chain, [`Engine`]
//! turns chain notifications into ledger writes, and [`ReadPool`] serves
//! heavy ledger reads off the event loop. The chain itself is reached only
//! through the [`ChainOracle`] trait.

pub mod coordinator;
pub mod engine;
pub mod errors;
pub mod mock;
pub mod oracle;
pub mod read_pool;
pub mod watch;

pub use coordinator::{DelegateIdentity, SyncCoordinator, SyncOutcome, SyncState};
pub use engine::{Engine, EngineCommand, EngineEvent, EngineHandle};
pub use errors::{OracleError, PoolError, SyncError};
pub use mock::MockChain;
pub use oracle::{ChainOracle, TxConfirmation, VoterRecord, Wallet};
pub use read_pool::{ReadJob, ReadPool, ReadReply};
pub use watch::TxWatchPool;
