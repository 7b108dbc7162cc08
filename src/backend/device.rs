//! A tracked device that never moves.
//!
//! Useful for running the server without hardware: it reports a fixed pose,
//! publishes a configurable number of inputs and remembers the last output
//! value written to it.

use halo_ipc::shm::InputRecord;
use halo_ipc::types::{OutputValue, Pose, Quat, SpaceRelation, SpaceRelationFlags, Vec3};
use tracing::{debug, trace};

use super::{Device, DeviceError, DeviceKind};
use crate::config::DeviceConfig;

/// Distance between the eyes assumed when the client sends no offset
const DEFAULT_IPD_M: f32 = 0.063;

/// Output name accepted by controllers (haptic motor)
pub const HAPTIC_OUTPUT: u32 = 0;

/// Input name of `index` on a device of `kind`.
///
/// Input 0 of every device is its pose.
pub fn input_name(kind: DeviceKind, index: u32) -> u32 {
    ((kind as u32) << 8) | index
}

pub struct StaticDevice {
    name: String,
    kind: DeviceKind,
    pose: Pose,
    inputs: Vec<InputRecord>,
    last_output: Option<(u32, OutputValue)>,
}

impl StaticDevice {
    pub fn new(config: &DeviceConfig) -> Self {
        let inputs = (0..config.inputs)
            .map(|i| InputRecord {
                timestamp_ns: 0,
                name: input_name(config.kind, i),
                active: 0,
                value: [0.0; 4],
            })
            .collect();

        let [x, y, z] = config.position;
        Self {
            name: config.name.clone(),
            kind: config.kind,
            pose: Pose {
                orientation: Quat::IDENTITY,
                position: Vec3::new(x, y, z),
            },
            inputs,
            last_output: None,
        }
    }

    /// Last value written through `set_output`
    #[cfg(test)]
    pub fn last_output(&self) -> Option<(u32, OutputValue)> {
        self.last_output
    }
}

impl Device for StaticDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DeviceKind {
        self.kind
    }

    fn inputs(&self) -> &[InputRecord] {
        &self.inputs
    }

    fn update_inputs(&mut self, now_ns: u64) -> Result<(), DeviceError> {
        for input in &mut self.inputs {
            input.timestamp_ns = now_ns;
            input.active = 1;
        }
        Ok(())
    }

    fn get_tracked_pose(&mut self, name: u32, at_timestamp_ns: u64) -> Result<(u64, SpaceRelation), DeviceError> {
        if self.inputs.is_empty() || name != input_name(self.kind, 0) {
            return Err(DeviceError::UnknownInput(name));
        }

        let flags = SpaceRelationFlags::ORIENTATION_VALID
            | SpaceRelationFlags::POSITION_VALID
            | SpaceRelationFlags::LINEAR_VELOCITY_VALID
            | SpaceRelationFlags::ANGULAR_VELOCITY_VALID
            | SpaceRelationFlags::ORIENTATION_TRACKED
            | SpaceRelationFlags::POSITION_TRACKED;

        Ok((
            at_timestamp_ns,
            SpaceRelation {
                relation_flags: flags.bits(),
                pose: self.pose,
                linear_velocity: Vec3::ZERO,
                angular_velocity: Vec3::ZERO,
            },
        ))
    }

    fn get_view_pose(&mut self, eye_relation: Vec3, view_index: u32) -> Result<Pose, DeviceError> {
        if self.kind != DeviceKind::Hmd {
            return Err(DeviceError::InvalidView(view_index));
        }
        let side = match view_index {
            0 => -0.5,
            1 => 0.5,
            _ => return Err(DeviceError::InvalidView(view_index)),
        };

        let ipd = if eye_relation == Vec3::ZERO {
            Vec3::new(DEFAULT_IPD_M, 0.0, 0.0)
        } else {
            eye_relation
        };

        Ok(Pose {
            orientation: Quat::IDENTITY,
            position: Vec3::new(ipd.x * side, ipd.y * side, ipd.z * side),
        })
    }

    fn set_output(&mut self, name: u32, value: OutputValue) -> Result<(), DeviceError> {
        if self.kind != DeviceKind::Controller || name != HAPTIC_OUTPUT {
            return Err(DeviceError::UnknownOutput(name));
        }
        if self.last_output == Some((name, value)) {
            trace!("{}: output {} unchanged", self.name, name);
        } else {
            debug!(
                "{}: output {} amplitude {} for {} ns",
                self.name, name, value.amplitude, value.duration_ns
            );
        }
        self.last_output = Some((name, value));
        Ok(())
    }
}
