#![doc = include_str!("../README.md")]
#![cfg(unix)]

pub mod types;
pub mod error;
pub mod clock;
pub mod fixed;
pub mod sync;
pub mod shm;
pub mod unit;
pub mod dispatch;
pub mod timer;
pub mod bus;
pub mod media;

pub use bus::{ArenaStats, Bus, BusConfig, BusGuard};
pub use dispatch::{DispatchConfig, Dispatcher, TASK_FAILED};
pub use error::{Error, ErrorKind, Result};
pub use media::MediaRing;
pub use timer::Timer;
pub use types::{Handle, MsgId, UnitId};
pub use unit::{BusListener, Source, Unit};
