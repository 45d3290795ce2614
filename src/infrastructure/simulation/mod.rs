pub mod slippage_model;
