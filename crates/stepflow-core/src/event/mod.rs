//! Event distribution: the monitoring sink the engine publishes into.

pub mod bus;
