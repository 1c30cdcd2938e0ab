pub mod keyed_store;

pub use keyed_store::{CacheObject, KeyedStore, LockPolicy, ObjectHandle};
