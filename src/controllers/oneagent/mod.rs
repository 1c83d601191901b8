pub mod controller;

pub use controller::run;

pub mod reconciler;
pub mod reconcilers;
