//! Motor execution: the actuator seam and the high-priority task that
//! drives queued events to it at their scheduled instants.

pub mod actuator;
pub mod task;

pub use actuator::{Actuator, ActuatorError, ActuatorOp, SimActuator};
pub use task::{MotorTask, SharedActuator};
