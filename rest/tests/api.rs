//! API surface tests over a broker wired to the fake capabilities

use std::sync::Arc;
use std::time::Duration;

use actix_web::{test, App};
use serde_json::json;

use broker::db::Repository;
use broker::testing::{fast_config, helpers_with, plan, project, step, FakeCloud, FakeHosts};
use broker::{Broker, MemRepository};

async fn broker_over_fakes() -> (FakeCloud, FakeHosts, MemRepository, Arc<Broker>) {
    let fake = FakeCloud::new();
    let hosts = FakeHosts::new();
    let repo = MemRepository::new();
    let broker = Broker::start(
        fast_config(),
        Arc::new(fake.clone()),
        Arc::new(repo.clone()),
        helpers_with(&hosts),
    )
    .await
    .expect("broker startup");
    (fake, hosts, repo, broker)
}

macro_rules! app {
    ($broker:expr) => {
        test::init_service(
            App::new()
                .app_data(rest::api::broker_data($broker.clone()))
                .configure(rest::configure),
        )
        .await
    };
}

#[actix_web::test]
async fn root_reports_version_and_runs() {
    let (_fake, _hosts, _repo, broker) = broker_over_fakes().await;
    let app = app!(broker);

    let request = test::TestRequest::get().uri("/api").to_request();
    let response = test::call_service(&app, request).await;
    assert!(response.status().is_success());
    let body: serde_json::Value = test::read_body_json(response).await;
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["status"], json!(200));
    assert_eq!(body["version"], json!(broker::VERSION));
    assert!(body["runs"].as_array().unwrap().is_empty());
}

#[actix_web::test]
async fn projects_and_plans_round_trip() {
    let (_fake, _hosts, _repo, broker) = broker_over_fakes().await;
    let app = app!(broker);

    let request = test::TestRequest::post()
        .uri("/api/project")
        .set_json(json!({
            "name": "proj",
            "plans": [{
                "name": "p1",
                "steps": [{
                    "instance_region": "us-west-2",
                    "instance_type": "t1.micro",
                    "instance_count": 2,
                    "container_name": "img:v1",
                    "run_max_time": 5
                }]
            }]
        }))
        .to_request();
    let response = test::call_service(&app, request).await;
    assert!(response.status().is_success());
    let body: serde_json::Value = test::read_body_json(response).await;
    let plan_uuid = body["project"]["plans"][0]["uuid"].as_str().unwrap().to_string();
    assert!(!plan_uuid.is_empty());

    let request = test::TestRequest::get()
        .uri(&format!("/api/plan/{}", plan_uuid))
        .to_request();
    let response = test::call_service(&app, request).await;
    assert!(response.status().is_success());
    let body: serde_json::Value = test::read_body_json(response).await;
    assert_eq!(body["plan"]["steps"][0]["instance_count"], json!(2));
    assert_eq!(body["plan"]["steps"][0]["container_name"], json!("img:v1"));

    // duplicate project name is invalid input, not an internal error
    let request = test::TestRequest::post()
        .uri("/api/project")
        .set_json(json!({ "name": "proj" }))
        .to_request();
    let response = test::call_service(&app, request).await;
    assert_eq!(response.status().as_u16(), 400);
}

#[actix_web::test]
async fn unknown_resources_are_404() {
    let (_fake, _hosts, _repo, broker) = broker_over_fakes().await;
    let app = app!(broker);

    for uri in &[
        "/api/run/nope",
        "/api/plan/nope",
        "/api/project/nope",
        "/api/instances/i-nope",
    ] {
        let request = test::TestRequest::get().uri(uri).to_request();
        let response = test::call_service(&app, request).await;
        assert_eq!(response.status().as_u16(), 404, "GET {}", uri);
        let body: serde_json::Value = test::read_body_json(response).await;
        assert_eq!(body["success"], json!(false));
        assert_eq!(body["status"], json!(404));
    }

    let request = test::TestRequest::post()
        .uri("/api/orchestrate/nope")
        .set_json(json!({}))
        .to_request();
    let response = test::call_service(&app, request).await;
    assert_eq!(response.status().as_u16(), 404);
}

#[actix_web::test]
async fn orchestrate_runs_a_plan_and_purge_removes_it() {
    let (_fake, _hosts, repo, broker) = broker_over_fakes().await;
    let app = app!(broker);

    let mut quick = step("img:v1", 1);
    quick.run_max_time = 1;
    let created = repo
        .create_project(project("proj", vec![plan("p1", vec![quick])]))
        .await
        .unwrap();
    let plan_uuid = created.plans[0].uuid.clone();

    let request = test::TestRequest::post()
        .uri(&format!("/api/orchestrate/{}", plan_uuid))
        .set_json(json!({ "owner": "alex", "TARGET": "https://example.test" }))
        .to_request();
    let response = test::call_service(&app, request).await;
    assert!(response.status().is_success());
    let body: serde_json::Value = test::read_body_json(response).await;
    let run_id = body["run_id"].as_str().unwrap().to_string();

    // the submitted variables land in the run environment
    let run = repo.query_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.environment_data["TARGET"], "https://example.test");
    assert_eq!(run.environment_data["RUN_ID"], run_id);
    assert_eq!(run.owner.as_deref(), Some("alex"));

    // wait for the manager to finish, then purge
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let run = repo.query_run(&run_id).await.unwrap().unwrap();
        if run.state == broker::RunState::Completed {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    broker.wait_idle().await;

    // completed, not purged: plain delete is a 400
    let request = test::TestRequest::delete()
        .uri(&format!("/api/run/{}", run_id))
        .to_request();
    let response = test::call_service(&app, request).await;
    assert_eq!(response.status().as_u16(), 400);

    let request = test::TestRequest::delete()
        .uri(&format!("/api/run/{}?purge=1", run_id))
        .to_request();
    let response = test::call_service(&app, request).await;
    assert!(response.status().is_success());

    let request = test::TestRequest::get()
        .uri(&format!("/api/run/{}", run_id))
        .to_request();
    let response = test::call_service(&app, request).await;
    assert_eq!(response.status().as_u16(), 404);
}

#[actix_web::test]
async fn instances_are_visible_after_release() {
    let (_fake, _hosts, repo, broker) = broker_over_fakes().await;
    let app = app!(broker);

    let mut quick = step("img:v1", 2);
    quick.run_max_time = 1;
    let created = repo
        .create_project(project("proj", vec![plan("p1", vec![quick])]))
        .await
        .unwrap();

    let request = test::TestRequest::post()
        .uri(&format!("/api/orchestrate/{}", created.plans[0].uuid))
        .set_json(json!({}))
        .to_request();
    let response = test::call_service(&app, request).await;
    let body: serde_json::Value = test::read_body_json(response).await;
    let run_id = body["run_id"].as_str().unwrap().to_string();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let run = repo.query_run(&run_id).await.unwrap().unwrap();
        if run.state == broker::RunState::Completed {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    broker.wait_idle().await;

    let request = test::TestRequest::get().uri("/api/instances").to_request();
    let response = test::call_service(&app, request).await;
    let body: serde_json::Value = test::read_body_json(response).await;
    assert_eq!(body["instances"].as_array().unwrap().len(), 2);

    // reap empties the pool
    let request = test::TestRequest::delete().uri("/api/instances").to_request();
    let response = test::call_service(&app, request).await;
    assert!(response.status().is_success());
    let request = test::TestRequest::get().uri("/api/instances").to_request();
    let response = test::call_service(&app, request).await;
    let body: serde_json::Value = test::read_body_json(response).await;
    assert!(body["instances"].as_array().unwrap().is_empty());
}
