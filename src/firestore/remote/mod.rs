pub mod bloom_filter;
pub mod credentials;
pub mod datastore;
pub mod network;
pub mod online_state_tracker;
pub mod remote_event;
pub mod remote_store;
pub mod remote_syncer;
pub mod rpc_error;
pub mod stream;
pub mod streams;
pub mod watch_change;
pub mod watch_change_aggregator;

pub use bloom_filter::BloomFilter;
pub use credentials::{NoopTokenProvider, StaticTokenProvider, TokenProvider, TokenProviderArc};
pub use datastore::{Datastore, StreamingDatastore, StreamingDatastoreImpl};
pub use network::{NetworkLayer, NetworkLayerBuilder, StreamCredentials};
pub use online_state_tracker::OnlineState;
pub use remote_event::{RemoteEvent, TargetChange};
pub use remote_store::RemoteStore;
pub use remote_syncer::RemoteSyncer;
pub use rpc_error::{map_grpc_status, RpcStatus};
pub use stream::{InMemoryTransport, MultiplexedConnection, MultiplexedStream, StreamTransport};
pub use watch_change::WatchChange;
pub use watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
