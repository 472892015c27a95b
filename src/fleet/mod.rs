//! Worker fleet management.
//!
//! - **FleetProvider**: launches, lists and stops workers from one launch template
//! - **DockerFleet**: provider running workers as local Docker containers
//! - **FleetScaler**: sizes the fleet to the execution queue backlog

pub mod docker_fleet;
pub mod provider;
pub mod scaler;
pub mod template;

pub use docker_fleet::DockerFleet;
pub use provider::{FleetProvider, WorkerInstance};
pub use scaler::{FleetScaler, ScalingDecision, ScalingError, ScalingPolicy, ScalingReport};
pub use template::{WorkerLimits, WorkerTemplate, TEMPLATE_LABEL};
