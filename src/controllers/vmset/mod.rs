pub mod controller;

pub use controller::{reconcile, run};
