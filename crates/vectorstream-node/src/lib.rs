pub mod buffer;
pub mod cache;
pub mod compactor;
pub mod config;
pub mod data_node;
pub mod data_sync;
pub mod dd_node;
pub mod delete_node;
pub mod error;
pub mod flow_graph;
pub mod flush_manager;
pub mod insert_node;
pub mod metrics;
pub mod replica;
pub mod retry;
pub mod stream;

pub use buffer::{DeleteBuffer, InsertBuffer};
pub use cache::FlushingCache;
pub use config::NodeConfig;
pub use data_node::DataNode;
pub use data_sync::DataSyncService;
pub use error::{NodeError, Result};
pub use flush_manager::{
    FlushNotifier, FlushPack, InjectionHandle, PostInjectionFn, RendezvousFlushManager,
};
pub use replica::SegmentReplica;
pub use stream::{MemoryMsgBus, MsgStream, MsgStreamFactory};
