//! Bring-up: profile collection, planning and assignment distribution
//!
//! Uses only the ring links. Every worker's `Hello` relays hop by hop to
//! the head; the head plans and sends one `Assign` that circulates once.
//! The head seeing its own `Assign` return means every rank has it.

use std::collections::HashMap;

use ringlm_model::ModelConfig;
use ringlm_planner::{plan, Assignment, DeviceProfile, PlannerConfig};

use crate::error::{Result, RingError};
use crate::handshake::{read_handshake, write_handshake, HandshakeMsg};
use crate::transport::RingTransport;

/// Head-side bring-up: collect every worker profile, solve, distribute.
pub fn head_bringup(
    transport: &mut RingTransport,
    n_world: usize,
    head_profile: DeviceProfile,
    planner_config: &PlannerConfig,
    model: &ModelConfig,
    pinned: Option<Assignment>,
) -> Result<Assignment> {
    let mut profiles: HashMap<usize, DeviceProfile> = HashMap::new();
    profiles.insert(0, head_profile);

    while profiles.len() < n_world {
        match read_handshake(&mut transport.signal_in)? {
            HandshakeMsg::Hello { rank, profile } => {
                if rank == 0 || rank >= n_world {
                    return Err(RingError::BringUp(format!("bad hello rank {rank}")));
                }
                tracing::info!(rank, name = %profile.name, "worker joined");
                profiles.insert(rank, profile);
            }
            other => {
                return Err(RingError::BringUp(format!(
                    "unexpected message during profile collection: {other:?}"
                )))
            }
        }
    }

    let assignment = match pinned {
        Some(assignment) => {
            assignment
                .validate()
                .map_err(RingError::BringUp)?;
            tracing::info!(counts = ?assignment.layer_counts, "using pinned layer windows");
            assignment
        }
        None => {
            let ordered: Vec<DeviceProfile> = (0..n_world)
                .map(|rank| profiles[&rank].clone())
                .collect();
            plan(model.n_layers as u32, &ordered, planner_config)
                .map_err(|e| RingError::BringUp(e.to_string()))?
        }
    };

    let msg = HandshakeMsg::Assign {
        assignment: assignment.clone(),
        model: model.clone(),
    };
    write_handshake(&mut transport.signal_out, &msg)?;

    // wait for the assignment to circle back: every rank has it
    match read_handshake(&mut transport.signal_in)? {
        HandshakeMsg::Assign { .. } => Ok(assignment),
        other => Err(RingError::BringUp(format!(
            "expected assignment echo, got {other:?}"
        ))),
    }
}

/// Worker-side bring-up: announce, relay, wait for the plan.
pub fn worker_bringup(
    transport: &mut RingTransport,
    rank: usize,
    profile: DeviceProfile,
) -> Result<(Assignment, ModelConfig)> {
    write_handshake(
        &mut transport.signal_out,
        &HandshakeMsg::Hello { rank, profile },
    )?;

    loop {
        match read_handshake(&mut transport.signal_in)? {
            hello @ HandshakeMsg::Hello { .. } => {
                write_handshake(&mut transport.signal_out, &hello)?;
            }
            HandshakeMsg::Assign { assignment, model } => {
                write_handshake(
                    &mut transport.signal_out,
                    &HandshakeMsg::Assign {
                        assignment: assignment.clone(),
                        model: model.clone(),
                    },
                )?;
                tracing::info!(
                    rank,
                    windows = ?assignment.windows_for(rank),
                    "assignment received"
                );
                return Ok((assignment, model));
            }
        }
    }
}
