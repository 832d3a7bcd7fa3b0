//! Wire protocol and shared-memory regions used between the gateway,
//! launchers, watchdogs and function workers.
pub mod protocol;
pub mod shm;

pub use protocol::{
    DecodeError, Direction, FuncCall, FuncCallMessage, HandshakeMessage, HandshakeResponse,
    HandshakeStatus, Message, MessageAccumulator, Payload, RegionKind, RegionName, Role, region_name,
    INLINE_DATA_SIZE, MESSAGE_SIZE,
};
pub use shm::{ShmProvider, ShmRegion};
