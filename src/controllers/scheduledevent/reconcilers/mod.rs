pub mod capacity;
pub mod children;
pub mod completion;
