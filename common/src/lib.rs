pub mod conditions;
pub mod config;
pub mod controller;
pub mod error;
pub mod machine;
pub mod schedule;
pub mod state;
pub mod topics;
pub mod types;

pub use config::{
    select_device, BackoffPolicy, DeviceDescriptor, RuntimeConfig, SchedulerConfig, DEVICE_MARKER,
};
pub use controller::{Controller, ControllerSettings, DeviceEvent, DeviceTransport};
pub use error::{ConfigurationError, MalformedEventError, PriceFeedError, TransportError};
pub use machine::{ControlStateMachine, EntryAction, Trigger};
pub use schedule::{FinishWindow, PriceFeed, PriceSlot, ScheduleOptimizer, StaticPriceFeed};
pub use state::{DeviceContext, DeviceState};
pub use topics::*;
pub use types::{
    CommandPath, ControlState, ControllerStatus, ProgramOption, ProgramRequest, ScheduleDecision,
};
