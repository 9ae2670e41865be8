// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Safety properties over random operator and environment histories.

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;

use mz_rotation::collaborators::Collaborators;
use mz_rotation::durable::MemStateStore;
use mz_rotation::mem::MemEnvironment;
use mz_rotation::metrics::Metrics;
use mz_rotation::now::ManualClock;
use mz_rotation::registry::ClusterSpec;
use mz_rotation::retry::Retry;
use mz_rotation::{
    ClusterId, GroupId, RotationConfig, RotationController, RotationId, RotationPhase,
    StartRotation,
};

#[derive(Clone, Debug)]
enum Action {
    Start,
    Step,
    Advance(u64),
    Promote,
    ConfirmRouting,
    Rollback,
    EmergencyRollback,
    Lag(u64),
    InFlight(u64),
    SuccessRate(bool),
}

fn action() -> impl Strategy<Value = Action> {
    prop_oneof![
        1 => Just(Action::Start),
        8 => Just(Action::Step),
        3 => (1u64..600).prop_map(Action::Advance),
        2 => Just(Action::Promote),
        1 => Just(Action::ConfirmRouting),
        1 => Just(Action::Rollback),
        1 => Just(Action::EmergencyRollback),
        1 => prop_oneof![Just(0u64), Just(500), Just(5000)].prop_map(Action::Lag),
        1 => (0u64..3).prop_map(Action::InFlight),
        1 => any::<bool>().prop_map(Action::SuccessRate),
    ]
}

fn spec(id: &str) -> ClusterSpec {
    ClusterSpec {
        id: id.into(),
        region: "eu-west-1".into(),
        endpoints: vec![],
        profile: "base".into(),
    }
}

async fn check_history(actions: Vec<Action>) {
    let env = MemEnvironment::new();
    let clock = ManualClock::new(0);
    let config = RotationConfig {
        poll_interval: Duration::from_secs(24 * 60 * 60),
        retry: Retry::immediate(2),
        lag_window: Duration::from_secs(60),
        canary_bake: Duration::from_secs(120),
        ..Default::default()
    };
    let controller = RotationController::open(
        config,
        Collaborators::uniform(Arc::new(env.clone())),
        Arc::new(MemStateStore::new()),
        Arc::new(Metrics::unregistered()),
        clock.now_fn(),
    )
    .await
    .unwrap();
    let group = GroupId::from("ledger");
    controller
        .register_group(group.clone(), "ledger-api".into(), spec("c0"))
        .await
        .unwrap();

    let mut next_id = 0u64;
    let mut clusters = vec![ClusterId::from("c0")];
    for action in actions {
        let status = controller.status(&group).await.unwrap();
        let current = status.rotation_id.unwrap_or(RotationId(next_id));
        let target = status.target.clone();
        // Errors are expected; only the invariants below matter.
        match action {
            Action::Start => {
                next_id += 1;
                let id = ClusterId::from(format!("c{next_id}"));
                clusters.push(id.clone());
                let _ = controller
                    .start_rotation(
                        &group,
                        StartRotation {
                            rotation_id: RotationId(next_id),
                            target: spec(id.as_str()),
                        },
                    )
                    .await;
            }
            Action::Step => {
                let _ = controller.step_group(&group).await;
            }
            Action::Advance(secs) => clock.advance(Duration::from_secs(secs)),
            Action::Promote => {
                let _ = controller.promote(&group, current).await;
            }
            Action::ConfirmRouting => {
                let _ = controller.confirm_routing(&group, current).await;
            }
            Action::Rollback => {
                let _ = controller.rollback(&group, current).await;
            }
            Action::EmergencyRollback => {
                let _ = controller.emergency_rollback(&group, current).await;
            }
            Action::Lag(lag) => {
                if let Some(target) = &target {
                    env.set_lag(target, lag);
                }
            }
            Action::InFlight(writes) => {
                if let Some(source) = &status.source {
                    env.set_in_flight_writes(source, writes);
                }
            }
            Action::SuccessRate(healthy) => {
                if let Some(target) = &target {
                    env.set_success_rate(target, if healthy { 1.0 } else { 0.0 });
                }
            }
        }

        let status = controller.status(&group).await.unwrap();
        let claimers: Vec<_> = clusters
            .iter()
            .filter(|c| {
                env.write_config(c)
                    .is_some_and(|config| config.claims_mastership())
            })
            .collect();
        assert!(claimers.len() <= 1, "claimers {claimers:?} in {status:?}");
        let pointer = controller.pointer(&group).unwrap();
        let master = pointer.master.clone().expect("a group always has a master");
        assert!(pointer.members.contains(&master));
        if let Some(claimer) = claimers.first() {
            assert_eq!(**claimer, master, "{status:?}");
        }
        assert_ne!(status.phase, RotationPhase::Fault, "{status:?}");
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn at_most_one_cluster_accepts_writes(actions in proptest::collection::vec(action(), 1..80)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(check_history(actions));
    }
}
