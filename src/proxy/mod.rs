pub mod config;
pub mod dispatcher;
pub mod events;
pub mod host;
pub mod intent;
pub mod proxy;
pub mod security;
pub mod state;
pub mod subscriptions;

pub use config::ProxyConfig;
pub use host::{ApplicationHost, ApplicationState, AvailabilityState, DeliveredMessage};
pub use proxy::RoutingProxy;
pub use security::{PolicyManager, SecClient};
pub use state::RegistrationState;
