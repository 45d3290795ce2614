// Backtest inputs and outputs
pub mod backtest;

// Domain-specific error types
pub mod errors;

// Optimization job domain
pub mod optimization;

// Performance tracking domain
pub mod performance;

// Port interfaces
pub mod ports;

// Repository traits
pub mod repositories;

// Live runner state machine
pub mod runner;

// Kill switch, preflight and panic-stop reports
pub mod safety;

// Persisted strategy configuration
pub mod strategy;

// Core trading domain
pub mod trading;
