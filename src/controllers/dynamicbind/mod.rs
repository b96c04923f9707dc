pub mod controller;

pub use controller::{reconcile, run};

mod orphans;
pub use orphans::{run_orphan_sweep, sweep_orphans};
