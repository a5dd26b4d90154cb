/*!
 * Vendor adapters.
 *
 * This module contains one [`ClimateAdapter`](crate::protocol::ClimateAdapter)
 * implementation per supported vendor family.
 */

pub mod http;
pub mod register;
pub mod session_rest;
pub mod token_rest;

#[cfg(feature = "modbus")]
pub use register::ModbusTcpTransport;
pub use register::{MemoryRegisters, RegisterAdapter, RegisterTransport};
pub use session_rest::SessionRestAdapter;
pub use token_rest::TokenRestAdapter;
