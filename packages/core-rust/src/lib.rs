//! Mediator Core: message and exchange model, payloads, error taxonomy and
//! the type conversion registry.

pub mod convert;
pub mod error;
pub mod exchange;
pub mod headers;
pub mod message;
pub mod payload;
pub mod traits;
pub mod value;

pub use convert::{FallbackConverter, ToStringFallback, TypeConverterRegistry};
pub use error::{ConversionError, MediationError};
pub use exchange::{Exchange, ExchangeId, ExchangePattern, EXCEPTION_CAUGHT};
pub use headers::{names as header_names, Headers};
pub use message::Message;
pub use payload::{Payload, TypeKey};
pub use traits::Processor;
pub use value::Value;

