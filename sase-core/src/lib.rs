#![forbid(unsafe_code)]

pub mod app;
pub mod buffer;
pub mod config;
pub mod control;
pub mod error;
pub mod fivetuple;
pub mod inspect;
pub mod metadata;
pub mod nat;
pub mod packet;
pub mod policy;
pub mod qos;
pub mod session;
pub mod stats;
pub mod telemetry;
pub mod tenant;
pub mod tunnel;
pub mod wire;
pub mod worker;

pub use buffer::{PacketBuffer, VecPacketBuffer};
pub use control::ControlPlane;
pub use error::{CoreError, Result};
pub use fivetuple::{FiveTuple, Protocol};
pub use metadata::{PacketFlags, PacketMetadata, QosClass};
pub use worker::{Stage, WorkerConfig, WorkerState};
