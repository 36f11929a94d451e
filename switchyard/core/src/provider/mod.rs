//! Provider Abstraction
//!
//! The router never talks to a backend directly. Concrete adapters (HTTP
//! clients, SDK wrappers, broker connections) implement [`ProviderAdapter`],
//! and synthetic health checks implement [`HealthProbe`].

mod traits;

pub use traits::{HealthProbe, ProviderAdapter, ProviderError, ProviderReply, ProviderRequest};
