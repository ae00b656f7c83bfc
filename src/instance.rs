mod process;
mod supervisor;
mod types;

pub use supervisor::{ExitReport, MaintenanceHold, StopTicket, Supervisor};
pub use types::{
    InstanceId, InstanceSnapshot, LaunchSpec, LifecycleState, ManagedInstance, RconEndpoint,
    ResolvedLaunch,
};
