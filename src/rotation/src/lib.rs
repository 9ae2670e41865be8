// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Orchestration of whole-cluster rotations.
//!
//! A group of clusters serving one logical service is moved from its current
//! cluster onto a freshly provisioned one by a state machine that walks
//! through provisioning, bootstrapping, mesh linking, data syncing, a traffic
//! canary, a write-locked switchover and a drain of the old cluster. At every
//! point exactly one cluster may accept writes, and a set of safety rules is
//! consulted before each transition.
//!
//! The orchestrator never touches clusters itself. It issues requests to the
//! capability traits in [`collaborators`] and polls their status.

pub mod collaborators;
pub mod config;
pub mod controller;
pub mod durable;
pub mod enforcer;
pub mod error;
pub mod gateway;
pub mod id;
pub mod machine;
pub mod mem;
pub mod metrics;
pub mod now;
pub mod registry;
pub mod retry;
pub mod rollback;
pub mod state;
pub mod traffic;
pub mod write_pointer;

pub use crate::config::RotationConfig;
pub use crate::controller::RotationController;
pub use crate::error::{RotationError, SafetyRule, Violation};
pub use crate::id::{ClusterId, GroupId, RotationId};
pub use crate::machine::{RotationStatus, StartRotation, StepOutcome};
pub use crate::state::RotationPhase;
