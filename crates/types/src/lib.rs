pub mod amount;
pub mod ledger;
pub mod network;
pub mod plan;
pub mod settings;

pub use amount::*;
pub use ledger::*;
pub use network::*;
pub use plan::*;
pub use settings::*;
