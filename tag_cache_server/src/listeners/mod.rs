mod dispatch;
pub mod registry;
pub mod tag_logger;

pub use registry::{
    CacheListener, Channel, Channels, DeliveryPolicy, ListenerId, ListenerRegistry, Notification,
};
pub use tag_logger::{EquipmentLogTargets, TagUpdateLogger};
