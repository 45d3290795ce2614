// Kill switch, preflight gate and emergency liquidation
pub mod liquidation;
pub mod safety_controller;

pub use safety_controller::SafetyController;
