//! Event-driven maintenance of the cache.

pub mod collaborators;
pub mod controller;
pub mod events;
pub mod negotiation;
pub mod registry;

pub use collaborators::{
    ContractNegotiation, InMemoryTransferRegistry, NegotiationResolver, TransferProcess,
    TransferProcessState, TransferProcessStore,
};
pub use controller::EdrLifecycleController;
pub use events::LifecycleEvent;
pub use negotiation::{
    CallbackAddress, ContractOffer, HttpNegotiationInitiator, InitiatedNegotiation,
    NegotiateEdrRequest, NegotiationInitiator,
};
pub use registry::{EventHandlerRegistry, LifecycleEventHandler};
