//! Type conversion registry.
//!
//! Converts payloads between arbitrary types on demand. Lookup order:
//!
//! 1. identity, then the exact converter for (runtime type, target type)
//! 2. converters reachable through registered promotions of the source type
//! 3. value-dependent fallback converters, in registration order

pub mod builtin;
pub mod registry;

pub use builtin::{register_defaults, ToStringFallback};
pub use registry::{FallbackConverter, TypeConverterRegistry};
