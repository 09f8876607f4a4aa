pub mod compactor;
pub mod config;
pub mod device;
pub mod dispense;
pub mod ledger;
pub mod limits;
pub mod model;
pub mod observability;
pub mod wal;
pub mod wire;
