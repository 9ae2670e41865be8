// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! End-to-end rotations against the in-memory environment.

use std::sync::Arc;
use std::time::Duration;

use mz_rotation::collaborators::Collaborators;
use mz_rotation::durable::MemStateStore;
use mz_rotation::mem::MemEnvironment;
use mz_rotation::metrics::Metrics;
use mz_rotation::now::ManualClock;
use mz_rotation::registry::{ClusterRole, ClusterSpec};
use mz_rotation::retry::Retry;
use mz_rotation::state::{RollbackReason, TransitionCause};
use mz_rotation::write_pointer::ClusterWriteConfig;
use mz_rotation::{
    ClusterId, GroupId, RotationConfig, RotationController, RotationError, RotationId,
    RotationPhase, RotationStatus, SafetyRule, StartRotation, StepOutcome,
};

const STEP: Duration = Duration::from_secs(30);

fn config() -> RotationConfig {
    RotationConfig {
        // Tests drive every group by hand.
        poll_interval: Duration::from_secs(24 * 60 * 60),
        retry: Retry::immediate(3),
        ..Default::default()
    }
}

fn spec(id: &str) -> ClusterSpec {
    ClusterSpec {
        id: id.into(),
        region: "us-east-1".into(),
        endpoints: vec![format!("{id}.internal:6875")],
        profile: "base".into(),
    }
}

struct Harness {
    env: MemEnvironment,
    clock: ManualClock,
    store: MemStateStore,
    controller: RotationController,
    group: GroupId,
}

impl Harness {
    async fn new() -> Self {
        let env = MemEnvironment::new();
        let clock = ManualClock::new(1_700_000_000_000);
        let store = MemStateStore::new();
        let controller = open(&env, &clock, &store).await;
        let group = GroupId::from("payments");
        controller
            .register_group(group.clone(), "payments-api".into(), spec("blue"))
            .await
            .unwrap();
        Harness {
            env,
            clock,
            store,
            controller,
            group,
        }
    }

    /// Simulates a crash by dropping the controller and opening a new one
    /// against the same store and environment.
    async fn restart(&mut self) {
        self.controller.shutdown().await;
        self.controller = open(&self.env, &self.clock, &self.store).await;
    }

    async fn start(&self, id: u64, target: &str) -> Result<RotationStatus, RotationError> {
        self.controller
            .start_rotation(
                &self.group,
                StartRotation {
                    rotation_id: RotationId(id),
                    target: spec(target),
                },
            )
            .await
    }

    async fn step(&self) -> Result<StepOutcome, RotationError> {
        self.controller.step_group(&self.group).await
    }

    async fn status(&self) -> RotationStatus {
        self.controller.status(&self.group).await.unwrap()
    }

    /// Steps, advancing the clock between steps, until `phase` is reached.
    async fn drive_to(&self, phase: RotationPhase) {
        for _ in 0..200 {
            if self.status().await.phase == phase {
                return;
            }
            self.step().await.unwrap();
            self.clock.advance(STEP);
        }
        panic!("never reached {phase}: {:?}", self.status().await);
    }

    fn green_weight(&self) -> Option<u32> {
        self.env
            .split(&self.group)
            .and_then(|s| s.weight_of(&"green".into()))
    }

    fn blue_weight(&self) -> Option<u32> {
        self.env
            .split(&self.group)
            .and_then(|s| s.weight_of(&"blue".into()))
    }
}

async fn open(env: &MemEnvironment, clock: &ManualClock, store: &MemStateStore) -> RotationController {
    RotationController::open(
        config(),
        Collaborators::uniform(Arc::new(env.clone())),
        Arc::new(store.clone()),
        Arc::new(Metrics::unregistered()),
        clock.now_fn(),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn sustained_low_lag_leads_to_a_clean_switchover() {
    let h = Harness::new().await;
    let green = ClusterId::from("green");
    h.env.set_lag(&green, 200);
    let mut pointer = h.controller.subscribe_pointer(&h.group).unwrap();
    let registered = pointer.borrow_and_update().clone();
    assert_eq!(registered.master, Some(ClusterId::from("blue")));
    h.start(1, "green").await.unwrap();
    h.drive_to(RotationPhase::DataSyncing).await;

    // The lag window opens on the first observation under the threshold.
    assert_eq!(h.step().await.unwrap(), StepOutcome::Waiting);
    h.clock.advance(STEP);
    assert_eq!(h.step().await.unwrap(), StepOutcome::Waiting);
    h.clock.advance(STEP);
    assert_eq!(
        h.step().await.unwrap(),
        StepOutcome::Advanced {
            from: RotationPhase::DataSyncing,
            to: RotationPhase::TrafficCanary,
        }
    );

    h.drive_to(RotationPhase::Promoted).await;
    h.step().await.unwrap();
    let status = h.status().await;
    assert_eq!(status.master, Some(green.clone()));
    // The drain waited on the replica's own view of its lag.
    assert!(h.env.calls("replication_lag") > 0);
    assert!(pointer.has_changed().unwrap());
    let flipped = pointer.borrow_and_update().clone();
    assert_eq!(flipped.master, Some(green.clone()));
    assert!(!flipped.maintenance);
    assert!(flipped.version > registered.version);
    assert!(!status.maintenance);
    assert_eq!(h.green_weight(), Some(100));
    assert_eq!(h.blue_weight(), Some(0));
    assert_eq!(h.env.replication_source(&green), None);
    let applied = h.env.write_config(&green).unwrap();
    assert!(applied.accepts_writes);
    assert!(!h.env.write_config(&"blue".into()).unwrap().is_master);

    h.controller
        .confirm_routing(&h.group, RotationId(1))
        .await
        .unwrap();
    h.drive_to(RotationPhase::IdleStable).await;

    let status = h.status().await;
    assert_eq!(status.rotation_id, None);
    assert_eq!(status.master, Some(green.clone()));
    assert_eq!(status.split, None);
    assert!(h.env.is_decommissioned(&"blue".into()));
    assert_eq!(h.env.link_count(), 0);
    let clusters = h.controller.list_clusters().await;
    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0].cluster.id, green);
    assert_eq!(clusters[0].cluster.role, ClusterRole::Active);

    let phases: Vec<_> = status.log.iter().map(|r| r.to).collect();
    assert_eq!(
        phases,
        vec![
            RotationPhase::Provisioning,
            RotationPhase::Bootstrapping,
            RotationPhase::MeshLinking,
            RotationPhase::DataSyncing,
            RotationPhase::TrafficCanary,
            RotationPhase::SwitchoverLocked,
            RotationPhase::Promoted,
            RotationPhase::Draining,
            RotationPhase::IdleStable,
        ]
    );
    assert_eq!(status.log.last().unwrap().cause, TransitionCause::Completed);
    assert_eq!(h.env.calls("provision_cluster"), 1);
    assert_eq!(h.env.calls("set_replication_source"), 1);
    assert_eq!(h.env.calls("detach_replication"), 1);
}

#[tokio::test]
async fn high_lag_vetoes_the_switchover() {
    let h = Harness::new().await;
    h.start(1, "green").await.unwrap();
    h.drive_to(RotationPhase::TrafficCanary).await;
    h.env.set_lag(&"green".into(), 5000);

    // Each promotion skips one bake; the last one attempts the switchover.
    h.controller.promote(&h.group, RotationId(1)).await.unwrap();
    h.controller.promote(&h.group, RotationId(1)).await.unwrap();
    let err = h
        .controller
        .promote(&h.group, RotationId(1))
        .await
        .expect_err("lag is above the threshold");
    assert_eq!(err.rule(), Some(SafetyRule::LagGate));
    assert!(err.to_string().starts_with("InvariantViolation: LagGate"));

    let status = h.status().await;
    assert_eq!(status.phase, RotationPhase::TrafficCanary);
    assert_eq!(status.canary_weight, Some(90));
    let veto = status.last_veto.expect("veto recorded");
    assert_eq!(veto.rule, SafetyRule::LagGate);
    assert_eq!(veto.phase, Some(RotationPhase::TrafficCanary));
    assert_eq!(h.green_weight(), Some(90));

    h.env.set_lag(&"green".into(), 200);
    h.step().await.unwrap();
    assert_eq!(h.status().await.phase, RotationPhase::SwitchoverLocked);
}

#[tokio::test]
async fn switchover_is_gated_on_the_lag_threshold() {
    for (lag, vetoed) in [
        (0, false),
        (1023, false),
        (1024, false),
        (1025, true),
        (100_000, true),
    ] {
        let h = Harness::new().await;
        h.start(1, "green").await.unwrap();
        h.drive_to(RotationPhase::TrafficCanary).await;
        h.env.set_lag(&"green".into(), lag);
        for _ in 0..2 {
            h.controller.promote(&h.group, RotationId(1)).await.unwrap();
        }
        let res = h.controller.promote(&h.group, RotationId(1)).await;
        assert_eq!(res.is_err(), vetoed, "lag {lag}");
        let expected = if vetoed {
            RotationPhase::TrafficCanary
        } else {
            RotationPhase::SwitchoverLocked
        };
        assert_eq!(h.status().await.phase, expected, "lag {lag}");
    }
}

#[tokio::test]
async fn rollback_restores_the_source_from_every_early_phase() {
    for phase in [
        RotationPhase::Provisioning,
        RotationPhase::Bootstrapping,
        RotationPhase::MeshLinking,
        RotationPhase::DataSyncing,
        RotationPhase::TrafficCanary,
    ] {
        let h = Harness::new().await;
        h.start(1, "green").await.unwrap();
        h.drive_to(phase).await;
        if matches!(
            phase,
            RotationPhase::DataSyncing | RotationPhase::TrafficCanary
        ) {
            // Let the state issue its entry instructions; both then wait.
            assert_eq!(h.step().await.unwrap(), StepOutcome::Waiting);
        }

        let status = h
            .controller
            .rollback(&h.group, RotationId(1))
            .await
            .unwrap();
        assert_eq!(status.phase, RotationPhase::IdleStable, "{phase}");
        assert_eq!(status.master, Some("blue".into()), "{phase}");
        assert!(h.env.is_decommissioned(&"green".into()), "{phase}");
        assert_eq!(h.blue_weight(), Some(100), "{phase}");
        assert_eq!(h.green_weight(), Some(0), "{phase}");
        assert_eq!(h.env.link_count(), 0, "{phase}");
        assert_eq!(
            status.log.last().unwrap().cause,
            TransitionCause::RolledBack {
                reason: RollbackReason::Operator
            }
        );
        let pointer = h.controller.pointer(&h.group).unwrap();
        assert_eq!(pointer.members.len(), 1);
        assert!(pointer.mirrors.is_empty());
        assert!(h.controller.cluster(&"green".into()).await.is_err());

        // Repeating the rollback is a no-op.
        let again = h
            .controller
            .rollback(&h.group, RotationId(1))
            .await
            .unwrap();
        assert_eq!(again.log.len(), status.log.len());
    }
}

#[tokio::test]
async fn rollback_is_a_noop_when_idle_and_refused_after_switchover() {
    let h = Harness::new().await;
    let status = h
        .controller
        .rollback(&h.group, RotationId(0))
        .await
        .unwrap();
    assert_eq!(status.phase, RotationPhase::IdleStable);
    assert!(status.log.is_empty());

    h.start(1, "green").await.unwrap();
    h.drive_to(RotationPhase::SwitchoverLocked).await;
    let err = h
        .controller
        .rollback(&h.group, RotationId(1))
        .await
        .expect_err("only the emergency path applies");
    assert_eq!(err.kind(), "InvalidState");
}

#[tokio::test]
async fn resuming_mid_sync_matches_an_uninterrupted_run() {
    async fn run(crash_after: Option<usize>) -> (RotationStatus, usize, usize) {
        let mut h = Harness::new().await;
        h.env.set_lag(&"green".into(), 300);
        h.start(1, "green").await.unwrap();
        h.drive_to(RotationPhase::DataSyncing).await;
        for i in 0..4 {
            if Some(i) == crash_after {
                h.restart().await;
            }
            h.step().await.unwrap();
            h.clock.advance(STEP);
        }
        h.drive_to(RotationPhase::Promoted).await;
        (
            h.status().await,
            h.env.calls("set_replication_source"),
            h.env.calls("apply_split"),
        )
    }

    let (uninterrupted, sources, splits) = run(None).await;
    for crash_after in [1, 2] {
        let (resumed, resumed_sources, resumed_splits) = run(Some(crash_after)).await;
        assert_eq!(resumed.log, uninterrupted.log, "crash after step {crash_after}");
        assert_eq!(resumed.master, uninterrupted.master);
        assert_eq!(resumed_sources, sources);
        assert_eq!(resumed_splits, splits);
    }
    assert_eq!(sources, 1);
}

#[tokio::test]
async fn both_clusters_accepting_writes_faults_the_group() {
    let h = Harness::new().await;
    h.start(1, "green").await.unwrap();
    h.drive_to(RotationPhase::DataSyncing).await;

    let pointer = h.controller.pointer(&h.group).unwrap();
    h.env.override_write_config(ClusterWriteConfig {
        is_master: true,
        accepts_writes: true,
        forward_writes_to: None,
        ..pointer.write_config_for(&"green".into())
    });
    let err = h.step().await.expect_err("split brain");
    assert_eq!(err.kind(), "SplitBrainFault");
    assert!(err.is_fatal());

    let status = h.status().await;
    assert_eq!(status.phase, RotationPhase::Fault);
    assert!(status.fault.is_some());
    assert_eq!(h.step().await.unwrap(), StepOutcome::Faulted);
    let err = h
        .controller
        .promote(&h.group, RotationId(1))
        .await
        .expect_err("automation cannot leave FAULT");
    assert_eq!(err.kind(), "InvalidState");
    assert_eq!(h.start(2, "red").await.unwrap_err().kind(), "RotationInProgress");

    let status = h
        .controller
        .resolve_fault(&h.group, "blue".into())
        .await
        .unwrap();
    assert_eq!(status.phase, RotationPhase::IdleStable);
    assert_eq!(status.master, Some("blue".into()));
    assert_eq!(status.fault, None);
    assert!(!h.env.write_config(&"green".into()).unwrap().is_master);
    let green = h.controller.cluster(&"green".into()).await.unwrap();
    assert_eq!(green.cluster.role, ClusterRole::Idle);

    // The idle cluster can be rotated onto again.
    h.start(2, "green").await.unwrap();
}

#[tokio::test]
async fn emergency_rollback_reports_divergent_writes() {
    let h = Harness::new().await;
    h.start(1, "green").await.unwrap();
    h.env
        .record_write(&"green".into(), "before-switchover", h.clock.now());
    h.drive_to(RotationPhase::Promoted).await;
    h.step().await.unwrap();
    h.env
        .record_write(&"green".into(), "order-17", h.clock.now());

    let err = h
        .controller
        .emergency_rollback(&h.group, RotationId(2))
        .await
        .expect_err("wrong rotation");
    assert_eq!(err.kind(), "StaleRotation");

    let report = h
        .controller
        .emergency_rollback(&h.group, RotationId(1))
        .await
        .unwrap();
    assert_eq!(report.source, ClusterId::from("blue"));
    assert_eq!(report.divergence.len(), 1);
    assert_eq!(report.divergence[0].key, "order-17");

    let status = h.status().await;
    assert_eq!(status.phase, RotationPhase::IdleStable);
    assert_eq!(status.master, Some("blue".into()));
    assert!(!status.maintenance);
    assert_eq!(h.blue_weight(), Some(100));
    assert!(h.env.write_config(&"blue".into()).unwrap().accepts_writes);
    assert!(!h.env.write_config(&"green".into()).unwrap().accepts_writes);
    assert!(!h.env.is_decommissioned(&"green".into()));
    let green = h.controller.cluster(&"green".into()).await.unwrap();
    assert_eq!(green.cluster.role, ClusterRole::Idle);
    assert_eq!(
        status.log.last().unwrap().cause,
        TransitionCause::EmergencyRolledBack {
            divergent_writes: 1
        }
    );
}

#[tokio::test]
async fn emergency_rollback_only_applies_after_switchover() {
    let h = Harness::new().await;
    h.start(1, "green").await.unwrap();
    h.drive_to(RotationPhase::TrafficCanary).await;
    let err = h
        .controller
        .emergency_rollback(&h.group, RotationId(1))
        .await
        .expect_err("normal rollback applies");
    assert_eq!(err.kind(), "InvalidState");
}

#[tokio::test]
async fn an_undemotable_master_faults_the_emergency_rollback() {
    let h = Harness::new().await;
    h.start(1, "green").await.unwrap();
    h.drive_to(RotationPhase::Promoted).await;
    h.env.set_apply_write_configs(false);

    let err = h
        .controller
        .emergency_rollback(&h.group, RotationId(1))
        .await
        .expect_err("green never leaves mastership");
    assert_eq!(err.kind(), "ConflictingMaster");
    assert_eq!(h.status().await.phase, RotationPhase::Fault);
}

#[tokio::test]
async fn early_timeouts_roll_back() {
    let h = Harness::new().await;
    h.env.set_cooperative(false);
    h.start(1, "green").await.unwrap();
    assert_eq!(h.step().await.unwrap(), StepOutcome::Waiting);
    h.clock.advance(Duration::from_secs(31 * 60));
    assert_eq!(
        h.step().await.unwrap(),
        StepOutcome::RolledBack {
            reason: RollbackReason::Timeout
        }
    );
    let status = h.status().await;
    assert_eq!(status.phase, RotationPhase::IdleStable);
    assert!(h.env.is_decommissioned(&"green".into()));
}

#[tokio::test]
async fn switchover_timeout_halts_until_an_operator_resumes() {
    let h = Harness::new().await;
    h.env.set_in_flight_writes(&"blue".into(), 3);
    h.start(1, "green").await.unwrap();
    h.drive_to(RotationPhase::SwitchoverLocked).await;
    assert_eq!(h.step().await.unwrap(), StepOutcome::Waiting);
    assert!(h.status().await.maintenance);

    h.clock.advance(Duration::from_secs(3 * 60));
    assert_eq!(h.step().await.unwrap(), StepOutcome::Halted);
    assert_eq!(h.step().await.unwrap(), StepOutcome::Halted);
    let status = h.status().await;
    assert!(status.halted.is_some());
    assert_eq!(status.phase, RotationPhase::SwitchoverLocked);
    assert_eq!(status.master, Some("blue".into()));

    h.env.set_in_flight_writes(&"blue".into(), 0);
    let status = h.controller.promote(&h.group, RotationId(1)).await.unwrap();
    assert_eq!(status.phase, RotationPhase::Promoted);
    assert_eq!(status.master, Some("green".into()));
    assert_eq!(status.halted, None);
}

#[tokio::test]
async fn failing_canary_rolls_back() {
    let h = Harness::new().await;
    h.start(1, "green").await.unwrap();
    h.drive_to(RotationPhase::TrafficCanary).await;
    h.env.set_success_rate(&"green".into(), 0.5);
    assert_eq!(
        h.step().await.unwrap(),
        StepOutcome::RolledBack {
            reason: RollbackReason::CanaryFailed
        }
    );
    assert_eq!(h.blue_weight(), Some(100));
    assert!(h.env.is_decommissioned(&"green".into()));
}

#[tokio::test]
async fn an_unknown_canary_success_rate_rolls_back() {
    let h = Harness::new().await;
    h.start(1, "green").await.unwrap();
    h.drive_to(RotationPhase::TrafficCanary).await;
    h.env.set_success_rate(&"green".into(), f64::NAN);
    h.clock.advance(STEP);
    assert_eq!(
        h.step().await.unwrap(),
        StepOutcome::RolledBack {
            reason: RollbackReason::CanaryFailed
        }
    );
    let status = h.status().await;
    assert_eq!(status.phase, RotationPhase::IdleStable);
    assert_eq!(status.master, Some(ClusterId::from("blue")));
    assert_eq!(h.blue_weight(), Some(100));
}

#[tokio::test]
async fn start_is_idempotent_per_rotation_id() {
    let h = Harness::new().await;
    h.start(1, "green").await.unwrap();
    let again = h.start(1, "green").await.unwrap();
    assert_eq!(again.phase, RotationPhase::Provisioning);
    assert_eq!(again.log.len(), 1);

    let err = h.start(2, "red").await.unwrap_err();
    assert!(matches!(
        err,
        RotationError::RotationInProgress {
            active: RotationId(1),
            ..
        }
    ));

    h.controller
        .rollback(&h.group, RotationId(1))
        .await
        .unwrap();
    let err = h.start(1, "green").await.unwrap_err();
    assert_eq!(err.kind(), "StaleRotation");
    let err = h.start(2, "blue").await.unwrap_err();
    assert_eq!(err.kind(), "InvalidRequest");

    let err = h
        .controller
        .status(&"unknown".into())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "UnknownGroup");
}

#[tokio::test]
async fn external_failures_surface_after_retries() {
    let h = Harness::new().await;
    h.start(1, "green").await.unwrap();
    h.env.fail_next("provision_cluster", 3);
    let err = h.step().await.unwrap_err();
    assert!(matches!(
        err,
        RotationError::ExternalCallFailure {
            op: "provision_cluster",
            attempts: 3,
            ..
        }
    ));
    assert!(h.status().await.last_error.is_some());
    // The next pass retries from scratch.
    h.step().await.unwrap();
    assert_eq!(h.status().await.phase, RotationPhase::Bootstrapping);
}
