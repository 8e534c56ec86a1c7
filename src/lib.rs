//! Lambdatronic bridge
//!
//! Polls a Froeling Lambdatronic heating controller over Modbus TCP, decodes
//! its registers into named data points and writes validated setpoints back.

pub mod codec;
pub mod config;
pub mod modbus;
pub mod mqtt;
pub mod registers;
