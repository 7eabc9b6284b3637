/// Talos Linux integration: secrets, machine configs and the node API
pub mod api;
pub mod producer;
pub mod secrets;

pub use api::{TalosApi, TalosctlClient};
pub use producer::{
    endpoint_candidates, select_endpoint, EndpointCandidates, MachineConfigSource,
    TalosConfigProducer, TalosctlConfigSource,
};
pub use secrets::SecretsBundle;
