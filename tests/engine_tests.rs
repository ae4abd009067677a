//! Engine tests: leader election, drift repair and placement against a
//! shared registry.


use std::sync::Arc;
use std::time::Duration;

use fleet_lite::engine::Engine;
use fleet_lite::job::JobState;
use fleet_lite::machine::MachineState;
use fleet_lite::registry::{MemoryRegistry, Precondition, RegistryClient};
use test_harness::{assert_eventually, job, TestCluster, TestMachine};
use tokio_util::sync::CancellationToken;

#[tokio::test(start_paused = true)]
async fn test_leadership_fails_over_on_lease_expiry() {
    let client = RegistryClient::new(Arc::new(MemoryRegistry::new()));
    let ttl = Duration::from_secs(3);
    let a = Engine::with_lease_ttl("a", client.clone(), ttl);
    let b = Engine::with_lease_ttl("b", client.clone(), ttl);

    assert!(a.maintain_leadership().await.unwrap());
    assert!(!b.maintain_leadership().await.unwrap());
    assert!(a.is_leader());
    assert!(!b.is_leader());

    // a stops renewing and its lease runs out.
    tokio::time::advance(Duration::from_secs(4)).await;
    assert!(b.maintain_leadership().await.unwrap());
    assert!(!a.maintain_leadership().await.unwrap());
    assert!(!a.is_leader());
    assert_eq!(client.leader().await.unwrap().as_deref(), Some("b"));
}

#[tokio::test]
async fn test_passive_engine_writes_nothing() {
    let cluster = TestCluster::new(&["m1", "m2"]).await;
    cluster.submit(job("web.service", &[]), JobState::Launched).await;

    let leader = &cluster.machines[0].engine;
    assert!(leader.maintain_leadership().await.unwrap());

    let passive = &cluster.machines[1].engine;
    assert!(!passive.maintain_leadership().await.unwrap());

    let index = cluster.client.registry().current_index().await.unwrap();
    assert!(passive.run_cycle().await.unwrap().is_none());
    assert_eq!(
        cluster.client.registry().current_index().await.unwrap(),
        index
    );
    assert!(cluster.assignments().await.is_empty());

    let stats = leader.run_cycle().await.unwrap().unwrap();
    assert_eq!(stats.scheduled, 1);
}

#[tokio::test]
async fn test_jobs_spread_by_load_then_machine_id() {
    let cluster = TestCluster::new(&["m2", "m1"]).await;
    for name in ["a.service", "b.service", "c.service", "d.service"] {
        cluster.submit(job(name, &[]), JobState::Launched).await;
    }

    let stats = cluster.schedule().await;
    assert_eq!(stats.scheduled, 4);

    let assignments = cluster.assignments().await;
    assert_eq!(assignments["a.service"], "m1");
    assert_eq!(assignments["b.service"], "m2");
    assert_eq!(assignments["c.service"], "m1");
    assert_eq!(assignments["d.service"], "m2");
}

#[tokio::test]
async fn test_dead_machine_jobs_are_reassigned() {
    let mut cluster = TestCluster::new(&["m1", "m2"]).await;
    cluster.submit(job("web.service", &[]), JobState::Launched).await;
    cluster.schedule().await;
    assert_eq!(cluster.assignments().await["web.service"], "m1");

    cluster.machine_mut("m1").deregister().await;
    let stats = cluster.schedule().await;
    assert_eq!(stats.unscheduled, 1);
    assert_eq!(stats.scheduled, 1);
    assert_eq!(cluster.assignments().await["web.service"], "m2");
}

#[tokio::test]
async fn test_inactive_target_unschedules() {
    let cluster = TestCluster::new(&["m1"]).await;
    cluster.submit(job("web.service", &[]), JobState::Launched).await;
    cluster.schedule().await;
    assert_eq!(cluster.assignments().await.len(), 1);

    cluster
        .client
        .set_target_state("web.service", JobState::Inactive)
        .await
        .unwrap();
    let stats = cluster.schedule().await;
    assert_eq!(stats.unscheduled, 1);
    assert!(cluster.assignments().await.is_empty());
}

#[tokio::test]
async fn test_destroyed_job_assignment_is_gone() {
    let cluster = TestCluster::new(&["m1"]).await;
    cluster.submit(job("web.service", &[]), JobState::Launched).await;
    cluster.schedule().await;

    cluster.client.destroy_job("web.service").await.unwrap();
    cluster.schedule().await;
    assert!(cluster.assignments().await.is_empty());
}

#[tokio::test]
async fn test_existing_assignment_is_never_duplicated() {
    let cluster = TestCluster::new(&["m1", "m2"]).await;
    cluster.submit(job("web.service", &[]), JobState::Launched).await;

    // Another writer got there first.
    let existing = cluster
        .client
        .schedule_job("web.service", "m2")
        .await
        .unwrap();
    let stats = cluster.schedule().await;
    assert_eq!(stats.scheduled, 0);
    assert_eq!(cluster.assignments().await["web.service"], "m2");

    // Writes against a stale version are rejected.
    assert!(cluster
        .client
        .schedule_job("web.service", "m1")
        .await
        .unwrap_err()
        .is_conflict());
    cluster.client.clear_assignment("web.service").await.unwrap();
    cluster.client.schedule_job("web.service", "m1").await.unwrap();
    assert!(cluster
        .client
        .unschedule_job(&existing)
        .await
        .unwrap_err()
        .is_conflict());
    assert_eq!(cluster.assignments().await["web.service"], "m1");
}

#[tokio::test]
async fn test_unschedulable_job_gets_condition_until_machine_appears() {
    let mut cluster = TestCluster::new(&["m1"]).await;
    cluster
        .submit(
            job("rover.service", &["MachineMetadata=region=mars"]),
            JobState::Launched,
        )
        .await;

    let stats = cluster.schedule().await;
    assert_eq!(stats.unschedulable, 1);
    let engine = cluster.machines[0].engine.clone();
    let conditions = engine.conditions().await;
    assert!(conditions["rover.service"].reason.contains("region=mars"));

    // Nothing changed, so the condition stands without re-evaluation.
    let stats = cluster.schedule().await;
    assert_eq!(stats.unschedulable, 1);
    assert_eq!(stats.scheduled, 0);

    let mut mars = TestMachine::new(
        MachineState::new("m9").with_metadata("region", "mars"),
        cluster.client.clone(),
    );
    mars.register().await;
    cluster.machines.push(mars);

    let stats = cluster.schedule().await;
    assert_eq!(stats.scheduled, 1);
    assert_eq!(cluster.assignments().await["rover.service"], "m9");
    assert!(engine.conditions().await.is_empty());
}

#[tokio::test]
async fn test_conflicting_units_land_on_different_machines() {
    let cluster = TestCluster::new(&["m1", "m2"]).await;
    cluster
        .submit(job("a.service", &["Conflicts=b.service"]), JobState::Launched)
        .await;
    cluster.submit(job("b.service", &[]), JobState::Launched).await;
    cluster.submit(job("c.service", &[]), JobState::Launched).await;

    cluster.schedule().await;
    let assignments = cluster.assignments().await;
    assert_ne!(assignments["a.service"], assignments["b.service"]);
}

#[tokio::test]
async fn test_stepping_down_clears_conditions() {
    let client = RegistryClient::new(Arc::new(MemoryRegistry::new()));
    let engine = Engine::new("a", client.clone());
    client
        .create_job(&job("lonely.service", &[]).with_target_state(JobState::Launched))
        .await
        .unwrap();

    assert!(engine.maintain_leadership().await.unwrap());
    let stats = engine.run_cycle().await.unwrap().unwrap();
    assert_eq!(stats.unschedulable, 1);
    assert_eq!(engine.conditions().await.len(), 1);

    // Someone else takes the lease.
    let key = client.keys().leader();
    client
        .registry()
        .delete(&key, fleet_lite::registry::Precondition::Any)
        .await
        .unwrap();
    client.acquire_leadership("b", Duration::from_secs(10)).await.unwrap();

    assert!(!engine.maintain_leadership().await.unwrap());
    assert!(engine.conditions().await.is_empty());
}

#[tokio::test]
async fn test_running_engine_schedules_submitted_jobs() {
    let cluster = TestCluster::new(&["m1"]).await;
    let engine = Arc::new(
        Engine::with_lease_ttl("m1", cluster.client.clone(), Duration::from_millis(300))
            .with_sweep_interval(Duration::from_millis(200)),
    );
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(engine.clone().run(cancel.clone()));

    cluster.submit(job("web.service", &[]), JobState::Launched).await;
    assert_eventually(
        || async { cluster.assignments().await.contains_key("web.service") },
        Duration::from_secs(5),
        "running engine should schedule the job",
    )
    .await;

    cancel.cancel();
    handle.await.unwrap();
    assert!(!engine.is_leader());
    assert!(cluster.client.leader().await.unwrap().is_none());
}

#[tokio::test]
async fn test_unreadable_records_do_not_stall_healthy_jobs() {
    let cluster = TestCluster::new(&["m1"]).await;
    cluster.submit(job("a.service", &[]), JobState::Launched).await;

    let keys = cluster.client.keys().clone();
    let registry = cluster.client.registry();
    for key in [
        keys.job_object("bad.service"),
        keys.machine("ghost"),
        keys.unit_state("bad.service", "ghost"),
    ] {
        registry.set(&key, "not json", Precondition::Any).await.unwrap();
    }

    let stats = cluster.schedule().await;
    assert_eq!(stats.scheduled, 1);
    assert_eq!(cluster.assignments().await["a.service"], "m1");

    cluster.converge().await;
    assert_eq!(
        cluster.machine("m1").units().await.get("a.service"),
        Some(&JobState::Launched)
    );

    let machines = cluster.client.machines().await.unwrap();
    assert_eq!(machines.len(), 1);
    let states = cluster.client.unit_states().await.unwrap();
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].name, "a.service");
    let observed = cluster.client.job_states().await.unwrap();
    assert!(observed.contains_key("a.service"));
    assert!(!observed.contains_key("bad.service"));
}
