//! Simulator link: template-driven SLUDP message transport and HTTP asset transfer.
//! Host-driven: the host calls `process_messages` / `update` from its frame loop; nothing blocks.

pub mod asset;
pub mod config;
pub mod connection;
pub mod manager;
pub mod message;
pub mod sequence;
pub mod template;
pub mod wire;
pub mod zerocode;

pub use asset::{
    AssetHttpClient, AssetMetadata, AssetRequest, AssetTransfer, ReqwestAssetClient,
    TransferFailure, TransferPhase,
};
pub use config::{AssetTransferConfig, ManagerConfig};
pub use connection::{ConnectError, NetworkConnection};
pub use manager::{
    ConnectionState, DeliveryFailed, ManagerError, NetMessageListener, NetMessageManager,
};
pub use message::{FieldValue, InboundMessage, OutboundMessage};
pub use template::{DictionaryError, MessageDictionary, MessageId, MessageTemplate};
pub use wire::WireError;
