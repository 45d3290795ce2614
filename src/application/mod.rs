// Repository wiring for the binaries
pub mod bootstrap;

// Backtesting, parameter search and the optimization job scheduler
pub mod optimization;

// Live strategy scheduling loop
pub mod runner;

// Kill switch, preflight and panic stop
pub mod safety;

// Live trading strategies
pub mod strategies;

// Order submission path
pub mod trading;

// Process wiring and ordered shutdown
pub mod system;
