pub mod controller;

pub use controller::{reconcile, run};

pub(crate) mod binding;
