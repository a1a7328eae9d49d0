#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

//! Service discovery over a lease-capable coordination store.
//!
//! - [`Registrar`] publishes one service instance and keeps its lease alive.
//! - [`EtcdResolverBuilder`] turns a target such as `etcd:///user` into a
//!   continuously updated address list pushed to a [`ClientConn`].
//! - [`connect_balanced`] wires a resolver into a tonic balance channel.

pub mod address;
pub mod backoff;
pub mod balance;
pub mod config;
pub mod error;
pub mod etcd;
pub mod memory;
pub mod record;
pub mod registrar;
pub mod registry;
pub mod resolver;
pub mod store;

pub use address::{Address, AddressList};
pub use balance::{BalanceConfig, BalancedChannel, BalancedConn, connect_balanced};
pub use config::{DomainConfig, EtcdConfig, RegisterConfig};
pub use error::{DiscoveryError, DiscoveryResult};
pub use etcd::{EtcdConnector, EtcdStore};
pub use memory::MemoryStore;
pub use record::{KeyParts, ServiceRecord};
pub use registrar::{Registrar, RegistrarOptions};
pub use registry::ResolverRegistry;
pub use resolver::{
    ClientConn, ETCD_SCHEME, EtcdResolverBuilder, Resolver, ResolverBuilder, ResolverOptions,
    ResolverState, Target,
};
pub use store::{DiscoveryStore, LeaseId, StoreConnector};
