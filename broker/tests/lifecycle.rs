//! End-to-end runs over the fake capabilities: the real pool, run
//! manager, and broker, with the IaaS, container daemons, and shell
//! scripted.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use broker::db::{Repository, RunState};
use broker::testing::{
    fast_config, helpers_with, plan, project, step, FakeCloud, FakeHosts,
};
use broker::{Broker, MemRepository};
use cloud::{tags, InstanceState};

fn init_tracing() {
    if let Ok(filter) = tracing_subscriber::EnvFilter::try_from_default_env() {
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    } else {
        let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();
    }
}

async fn start_broker(
    fake: &FakeCloud,
    hosts: &FakeHosts,
    repo: &MemRepository,
) -> Arc<Broker> {
    Broker::start(
        fast_config(),
        Arc::new(fake.clone()),
        Arc::new(repo.clone()),
        helpers_with(hosts),
    )
    .await
    .expect("broker startup")
}

async fn seed_plan(repo: &MemRepository, steps: Vec<broker::Step>) -> String {
    let created = repo
        .create_project(project("proj", vec![plan("plan", steps)]))
        .await
        .expect("seed project");
    created.plans[0].uuid.clone()
}

async fn wait_for_state(
    repo: &MemRepository,
    run_id: &str,
    state: RunState,
    budget: Duration,
) -> broker::Run {
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        if let Some(run) = repo.query_run(run_id).await.unwrap() {
            if run.state == state {
                return run;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "run {} never reached {:?}",
            run_id,
            state
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn single_step_run_completes_and_releases_everything() {
    init_tracing();
    let fake = FakeCloud::new();
    let hosts = FakeHosts::new();
    let repo = MemRepository::new();
    let mut one_second = step("img:v1", 2);
    one_second.run_max_time = 1;
    let plan_uuid = seed_plan(&repo, vec![one_second]).await;

    let broker = start_broker(&fake, &hosts, &repo).await;
    let run_id = broker
        .run_plan(&plan_uuid, BTreeMap::new(), None, None)
        .await
        .unwrap();

    let run = wait_for_state(&repo, &run_id, RunState::Completed, Duration::from_secs(10)).await;
    broker.wait_idle().await;

    // the container started exactly once per instance
    assert_eq!(hosts.started_count("img:v1"), 2);

    // every record carries both timestamps, in order
    let run_started = run.started_at.unwrap();
    let run_completed = run.completed_at.unwrap();
    for record in &run.step_records {
        let started = record.started_at.expect("record started");
        let completed = record.completed_at.expect("record completed");
        assert!(run_started <= started);
        assert!(started <= completed);
        assert!(completed <= run_completed);
        assert!(!record.failed);
        // ran its cap, plus scheduler slop
        assert!((completed - started).num_milliseconds() <= 3000);
    }
    assert!(!run.aborted);

    // both instances are back in the pool, de-tagged
    assert_eq!(broker.instances().await.len(), 2);
    assert!(fake
        .all_instances()
        .await
        .iter()
        .all(|instance| !instance.is_allocated()));
}

#[tokio::test]
async fn staggered_steps_publish_dns_before_dependents_start() {
    init_tracing();
    let fake = FakeCloud::new();
    let hosts = FakeHosts::new();
    let repo = MemRepository::new();

    let mut backend = step("backend-img:v1", 1);
    backend.dns_name = Some("backend".to_string());
    backend.run_max_time = 1;
    let mut tester = step("tester-img:v1", 1);
    tester.run_delay = 1;
    tester.run_max_time = 1;
    let plan_uuid = seed_plan(&repo, vec![backend, tester]).await;

    let broker = start_broker(&fake, &hosts, &repo).await;
    let run_id = broker
        .run_plan(&plan_uuid, BTreeMap::new(), None, None)
        .await
        .unwrap();
    let run = wait_for_state(&repo, &run_id, RunState::Completed, Duration::from_secs(15)).await;
    broker.wait_idle().await;

    let backend_record = &run.step_records[0];
    let tester_record = &run.step_records[1];
    let backend_started = backend_record.started_at.unwrap();
    let tester_started = tester_record.started_at.unwrap();

    // lower run_delay starts first, and no earlier than its delay
    assert!(backend_started <= tester_started);
    assert!(tester_started >= run.started_at.unwrap() + chrono::Duration::seconds(1));

    // the tester's host got a resolver pre-seeded with the backend
    let dns_launches = hosts.launches_of("dnsmasq");
    assert_eq!(dns_launches.len(), 1);
    let (_, dns_run) = &dns_launches[0];
    let args = dns_run.command_args.clone().unwrap();
    let backend_ips: Vec<(String, _)> = hosts.launches_of("backend-img");
    assert!(!backend_ips.is_empty());
    assert!(
        args.contains("--host-record=backend,"),
        "dnsmasq args missing host record: {}",
        args
    );

    // and the tester container points at its local resolver
    let tester_launches = hosts.launches_of("tester-img");
    assert_eq!(tester_launches.len(), 1);
    assert!(tester_launches[0].1.dns.is_some());
}

#[tokio::test]
async fn abort_exits_within_a_poll_interval() {
    init_tracing();
    let fake = FakeCloud::new();
    let hosts = FakeHosts::new();
    let repo = MemRepository::new();
    let mut long_step = step("img:v1", 1);
    long_step.run_max_time = 3600;
    let plan_uuid = seed_plan(&repo, vec![long_step]).await;

    let broker = start_broker(&fake, &hosts, &repo).await;
    let run_id = broker
        .run_plan(&plan_uuid, BTreeMap::new(), None, None)
        .await
        .unwrap();
    wait_for_state(&repo, &run_id, RunState::Running, Duration::from_secs(10)).await;

    assert!(broker.abort_run(&run_id).await);
    let run = wait_for_state(&repo, &run_id, RunState::Completed, Duration::from_secs(5)).await;
    broker.wait_idle().await;

    assert!(run.aborted);
    // the step container is gone everywhere
    assert_eq!(hosts.started_count("img:v1"), 1);
    for instance in fake.all_instances().await {
        if let Some(ip) = instance.public_ip {
            assert!(hosts
                .containers_on(&ip)
                .iter()
                .all(|image| !image.contains("img:v1")));
        }
    }
}

#[tokio::test]
async fn unresponsive_instances_are_pruned_not_fatal() {
    init_tracing();
    let fake = FakeCloud::new();
    let hosts = FakeHosts::new();
    let repo = MemRepository::new();
    let mut three = step("img:v1", 3);
    three.run_max_time = 1;
    let plan_uuid = seed_plan(&repo, vec![three]).await;

    // the second machine the fleet will hand out never answers its
    // daemon
    hosts.fail_inventory("203.0.113.2");

    let broker = start_broker(&fake, &hosts, &repo).await;
    let run_id = broker
        .run_plan(&plan_uuid, BTreeMap::new(), None, None)
        .await
        .unwrap();
    let run = wait_for_state(&repo, &run_id, RunState::Completed, Duration::from_secs(10)).await;
    broker.wait_idle().await;

    assert!(!run.step_records[0].failed);
    // only the two responsive instances ran the container
    assert_eq!(hosts.started_count("img:v1"), 2);

    // the pruned instance was terminated, the others released
    let fleet = fake.all_instances().await;
    let pruned: Vec<_> = fleet
        .iter()
        .filter(|instance| instance.state == InstanceState::Terminated)
        .collect();
    assert_eq!(pruned.len(), 1);
    assert_eq!(pruned[0].public_ip.as_deref(), Some("203.0.113.2"));
    assert_eq!(broker.instances().await.len(), 2);
}

#[tokio::test]
async fn restart_resumes_a_live_run_without_creating_instances() {
    init_tracing();
    let fake = FakeCloud::new();
    let hosts = FakeHosts::new();
    let repo = MemRepository::new();
    let mut long_step = step("img:v1", 2);
    long_step.run_max_time = 3600;
    let step_uuid = long_step.uuid.clone();
    let plan_uuid = seed_plan(&repo, vec![long_step]).await;

    // simulate the previous broker's work: a run in flight, its
    // instances tagged on the IaaS, nothing else surviving
    let plan = repo.load_plan_with_steps(&plan_uuid).await.unwrap().unwrap();
    let mut run = repo
        .new_run(&plan, None, BTreeMap::new(), None)
        .await
        .unwrap();
    {
        let pool = broker::testing::pool_with(&fake).await;
        pool.recover().await.unwrap();
        let _leased = pool
            .request_instances(
                &run.uuid,
                &step_uuid,
                2,
                "t1.micro",
                cloud::Region::UsWest2,
                None,
                true,
            )
            .await
            .unwrap();
    }
    run.state = RunState::Running;
    run.started_at = Some(chrono::Utc::now());
    run.record_mut(&step_uuid).unwrap().started_at = Some(chrono::Utc::now());
    repo.save_run(&run).await.unwrap();
    assert_eq!(fake.launch_calls().await, 1);

    // new broker process over the same fleet and repository; the
    // recovered collection has no containers running, so the step is
    // immediately done
    let broker = start_broker(&fake, &hosts, &repo).await;
    let resumed = broker.recover_runs().await.unwrap();
    assert_eq!(resumed, 1);

    let resumed_run =
        wait_for_state(&repo, &run.uuid, RunState::Completed, Duration::from_secs(10)).await;
    broker.wait_idle().await;

    assert_eq!(fake.launch_calls().await, 1, "resume must not create");
    assert!(resumed_run.completed_at.is_some());
    assert_eq!(broker.instances().await.len(), 2);
    assert!(fake
        .all_instances()
        .await
        .iter()
        .all(|instance| instance.tag(tags::RUN_ID).is_none()));
}

#[tokio::test]
async fn purge_deletes_a_completed_run_record() {
    init_tracing();
    let fake = FakeCloud::new();
    let hosts = FakeHosts::new();
    let repo = MemRepository::new();
    let mut quick = step("img:v1", 1);
    quick.run_max_time = 1;
    let plan_uuid = seed_plan(&repo, vec![quick]).await;

    let broker = start_broker(&fake, &hosts, &repo).await;
    let run_id = broker
        .run_plan(&plan_uuid, BTreeMap::new(), None, None)
        .await
        .unwrap();
    wait_for_state(&repo, &run_id, RunState::Completed, Duration::from_secs(10)).await;
    broker.wait_idle().await;
    let pool_before = broker.instances().await.len();

    broker.delete_run(&run_id, true).await.unwrap();
    assert!(broker.get_run(&run_id).await.unwrap().is_none());
    // purging a record never touches machines
    assert_eq!(broker.instances().await.len(), pool_before);

    // and purging an unknown run is a clean not-found
    assert!(broker.delete_run(&run_id, true).await.is_err());
}

#[tokio::test]
async fn purge_aborts_a_run_that_is_still_going() {
    init_tracing();
    let fake = FakeCloud::new();
    let hosts = FakeHosts::new();
    let repo = MemRepository::new();
    let mut long_step = step("img:v1", 1);
    long_step.run_max_time = 3600;
    let plan_uuid = seed_plan(&repo, vec![long_step]).await;

    let broker = start_broker(&fake, &hosts, &repo).await;
    let run_id = broker
        .run_plan(&plan_uuid, BTreeMap::new(), None, None)
        .await
        .unwrap();
    wait_for_state(&repo, &run_id, RunState::Running, Duration::from_secs(10)).await;

    broker.delete_run(&run_id, true).await.unwrap();
    broker.wait_idle().await;
    assert!(broker.get_run(&run_id).await.unwrap().is_none());
}

#[tokio::test]
async fn zero_instance_step_is_immediately_done() {
    init_tracing();
    let fake = FakeCloud::new();
    let hosts = FakeHosts::new();
    let repo = MemRepository::new();
    let mut empty = step("img:v1", 0);
    empty.run_max_time = 3600;
    let plan_uuid = seed_plan(&repo, vec![empty]).await;

    let broker = start_broker(&fake, &hosts, &repo).await;
    let run_id = broker
        .run_plan(&plan_uuid, BTreeMap::new(), None, None)
        .await
        .unwrap();
    let run = wait_for_state(&repo, &run_id, RunState::Completed, Duration::from_secs(10)).await;
    broker.wait_idle().await;

    assert_eq!(fake.launch_calls().await, 0);
    assert_eq!(hosts.started_count("img:v1"), 0);
    assert!(run.step_records[0].started_at.is_some());
}

#[tokio::test]
async fn monitor_step_feeds_the_shippers_of_later_steps() {
    init_tracing();
    let fake = FakeCloud::new();
    let hosts = FakeHosts::new();
    let repo = MemRepository::new();

    let mut monitor = step("influxdb:1.1-alpine", 1);
    monitor
        .environment_data
        .insert("RUN_MONITOR".to_string(), "true".to_string());
    monitor.run_max_time = 2;
    let mut tester = step("img:v1", 1);
    tester.run_delay = 1;
    tester.run_max_time = 1;
    tester.docker_series = Some("web-tier".to_string());
    let plan_uuid = seed_plan(&repo, vec![monitor, tester]).await;

    let broker = start_broker(&fake, &hosts, &repo).await;
    let run_id = broker
        .run_plan(&plan_uuid, BTreeMap::new(), None, None)
        .await
        .unwrap();
    wait_for_state(&repo, &run_id, RunState::Completed, Duration::from_secs(15)).await;
    broker.wait_idle().await;

    // exactly one shipper, on the tester's host, carrying its series
    let shippers = hosts.launches_of("heka");
    assert_eq!(shippers.len(), 1);
    let (shipper_host, shipper_run) = &shippers[0];
    assert_eq!(shipper_run.env.get("SERIES").map(String::as_str), Some("web-tier"));

    // the monitor host runs only its own container, no sidecars
    let monitors = hosts.launches_of("influxdb");
    assert_eq!(monitors.len(), 1);
    let monitor_host = &monitors[0].0;
    assert_ne!(monitor_host, shipper_host);
    assert!(hosts
        .launches()
        .iter()
        .filter(|(host, _)| host == monitor_host)
        .all(|(_, run)| run.name.contains("influxdb")));
}

#[tokio::test]
async fn disabled_plans_cannot_be_orchestrated() {
    init_tracing();
    let fake = FakeCloud::new();
    let hosts = FakeHosts::new();
    let repo = MemRepository::new();
    let mut disabled = plan("plan", vec![step("img:v1", 1)]);
    disabled.enabled = false;
    let created = repo
        .create_project(project("proj", vec![disabled]))
        .await
        .unwrap();

    let broker = start_broker(&fake, &hosts, &repo).await;
    let result = broker
        .run_plan(&created.plans[0].uuid, BTreeMap::new(), None, None)
        .await;
    assert!(result.is_err());
    assert_eq!(fake.launch_calls().await, 0);
}
