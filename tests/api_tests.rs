use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use fleet_lite::api::{router, ApiState, PageToken};
use fleet_lite::job::{Job, JobState};
use fleet_lite::machine::MachineState;
use fleet_lite::registry::{MemoryRegistry, RegistryClient};
use fleet_lite::unit::{UnitFile, UnitState, UnitStatus};

fn create_test_app() -> (Router, RegistryClient) {
    let client = RegistryClient::new(Arc::new(MemoryRegistry::new()));
    (
        router(ApiState {
            client: client.clone(),
        }),
        client,
    )
}

async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

async fn publish(client: &RegistryClient, name: &str, machine: &str, status: UnitStatus) {
    client
        .publish_unit_state(&UnitState {
            name: name.to_string(),
            machine_id: machine.to_string(),
            status,
            hash: None,
        })
        .await
        .unwrap();
}

fn names(states: &Value) -> Vec<String> {
    states
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["name"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn test_state_listing_is_paginated() {
    let (app, client) = create_test_app();
    for i in 1..=5 {
        publish(&client, &format!("u{}.service", i), "m1", UnitStatus::Launched).await;
    }

    let first = PageToken::new(1, 2).encode();
    let (status, body) = get_json(&app, &format!("/v1/state?nextPageToken={}", first)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(names(&body["states"]), vec!["u1.service", "u2.service"]);
    let next = body["nextPageToken"].as_str().unwrap().to_string();
    assert_eq!(PageToken::decode(&next).unwrap(), PageToken::new(2, 2));

    let (_, body) = get_json(&app, &format!("/v1/state?nextPageToken={}", next)).await;
    assert_eq!(names(&body["states"]), vec!["u3.service", "u4.service"]);
    let last = body["nextPageToken"].as_str().unwrap().to_string();

    let (_, body) = get_json(&app, &format!("/v1/state?nextPageToken={}", last)).await;
    assert_eq!(names(&body["states"]), vec!["u5.service"]);
    assert!(body.get("nextPageToken").is_none());
}

#[tokio::test]
async fn test_state_listing_without_token_returns_everything() {
    let (app, client) = create_test_app();
    publish(&client, "a.service", "m1", UnitStatus::Loaded).await;

    let (status, body) = get_json(&app, "/v1/state").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["states"][0]["machineId"], "m1");
    assert_eq!(body["states"][0]["status"], "loaded");
    assert!(body.get("nextPageToken").is_none());
}

#[tokio::test]
async fn test_state_listing_filters() {
    let (app, client) = create_test_app();
    publish(&client, "a.service", "m1", UnitStatus::Launched).await;
    publish(&client, "a.service", "m2", UnitStatus::Loaded).await;
    publish(&client, "b.service", "m2", UnitStatus::Launched).await;

    let (_, body) = get_json(&app, "/v1/state?machineID=m2").await;
    assert_eq!(names(&body["states"]), vec!["a.service", "b.service"]);

    let (_, body) = get_json(&app, "/v1/state?unitName=a.service").await;
    assert_eq!(body["states"].as_array().unwrap().len(), 2);

    let (_, body) = get_json(&app, "/v1/state?machineID=m1&unitName=b.service").await;
    assert!(body["states"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_invalid_page_token_is_bad_request() {
    let (app, _) = create_test_app();

    for token in [
        "not-base64!".to_string(),
        PageToken::new(0, 10).encode(),
        PageToken::new(1, 0).encode(),
        PageToken::new(1, 101).encode(),
    ] {
        let (status, body) = get_json(&app, &format!("/v1/units?nextPageToken={}", token)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "token {:?}", token);
        assert_eq!(body["error"]["code"], 400);
    }
}

#[tokio::test]
async fn test_non_get_is_method_not_allowed() {
    let (app, _) = create_test_app();
    for uri in ["/v1/state", "/v1/units", "/v1/machines"] {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["code"], 405);
    }
}

#[tokio::test]
async fn test_units_carry_desired_and_observed_state() {
    let (app, client) = create_test_app();
    let unit = UnitFile::parse("[Service]\nExecStart=/bin/true\n").unwrap();
    client
        .create_job(
            &Job::new("web.service", unit.clone())
                .unwrap()
                .with_target_state(JobState::Launched),
        )
        .await
        .unwrap();
    client
        .create_job(&Job::new("idle.service", unit).unwrap())
        .await
        .unwrap();

    let mut machine = MachineState::new("m1");
    machine.hostname = Some("host-1".to_string());
    client
        .register_machine(&machine, Duration::from_secs(30))
        .await
        .unwrap();
    client.schedule_job("web.service", "m1").await.unwrap();
    publish(&client, "web.service", "m1", UnitStatus::Launched).await;

    let (status, body) = get_json(&app, "/v1/units").await;
    assert_eq!(status, StatusCode::OK);
    let units = body["units"].as_array().unwrap();
    assert_eq!(units.len(), 2);

    let idle = &units[0];
    assert_eq!(idle["name"], "idle.service");
    assert_eq!(idle["desiredState"], "inactive");
    assert!(idle["currentState"].is_null());
    assert!(idle["machineId"].is_null());

    let web = &units[1];
    assert_eq!(web["name"], "web.service");
    assert_eq!(web["desiredState"], "launched");
    assert_eq!(web["currentState"], "launched");
    assert_eq!(web["machineId"], "m1");
    assert_eq!(web["hostname"], "host-1");
}

#[tokio::test]
async fn test_machines_listing() {
    let (app, client) = create_test_app();
    for id in ["m1", "m2"] {
        client
            .register_machine(
                &MachineState::new(id).with_metadata("region", "us-west"),
                Duration::from_secs(30),
            )
            .await
            .unwrap();
    }

    let (status, body) = get_json(&app, "/v1/machines").await;
    assert_eq!(status, StatusCode::OK);
    let machines = body["machines"].as_array().unwrap();
    assert_eq!(machines.len(), 2);
    assert_eq!(machines[0]["id"], "m1");
    assert_eq!(machines[0]["metadata"]["region"][0], "us-west");
}
