#![doc = include_str!("../README.md")]

pub mod dispatch;
pub mod fatal;
pub mod transport;

pub use crate::dispatch::{Broadcaster, Listener, ListenerKey, WorkPool, WorkQueue, Worker};
pub use crate::fatal::{FatalSignal, FaultBoundary};
pub use crate::transport::{Channel, ChannelEvent, ChannelHandlerFactory, ChannelRole};

pub use bytes::Bytes;
