// Library modules
pub mod agent;
pub mod config;
pub mod constants;
pub mod device;
pub mod enclave;
pub mod env;
pub mod errors;
pub mod hostauth;
pub mod net;
pub mod notifier;
pub mod pairing;
pub mod transport;

// Re-export commonly used types
pub use config::Config;
pub use device::Device;
pub use enclave::EnclaveClient;
pub use errors::KeybridgeError;
pub use hostauth::HostAuthIntake;
pub use notifier::Notifier;
