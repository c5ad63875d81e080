mod common;
mod deferred;
mod deposit_monitor;
mod health_monitor;
mod maintenance;

pub use common::{CloseReason, Component, ComponentEnv, ConsumerPorts, PortsHandle};
pub use deferred::{DeferredQueue, DeferredQueueContext};
pub use deposit_monitor::{DepositMonitor, DepositMonitorContext};
pub use health_monitor::{HealthMonitor, HealthMonitorContext};
pub use maintenance::{Maintenance, MaintenanceContext};
