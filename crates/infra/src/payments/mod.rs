//! External payment rails.
//!
//! The ledger depends only on [`PaymentProvider`]; concrete rails plug in through the
//! [`ProviderRegistry`].

mod callback;
mod mpesa;
mod provider;
mod registry;

pub use callback::{CallbackPayload, CallbackShape};
pub use mpesa::{GatewayAck, MpesaGateway, MpesaProvider, normalize_phone};
pub use provider::{Payer, PaymentProvider, ProviderError};
pub use registry::ProviderRegistry;
