//! Starting and aborting runs

use std::collections::BTreeMap;

use actix_web::{delete, post, web};

use crate::api::BrokerData;
use crate::{ok, RestError};

pub(crate) fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(post_orchestrate).service(del_orchestrate);
}

/// Start a run of a plan. The body may carry `run_uuid`, `owner`, and
/// arbitrary interpolation variables; everything else is handed to
/// the run environment as strings.
#[post("/api/orchestrate/{plan_id}")]
async fn post_orchestrate(
    broker: BrokerData,
    path: web::Path<String>,
    body: Option<web::Json<serde_json::Value>>,
) -> Result<actix_web::HttpResponse, RestError> {
    let plan_id = path.into_inner();
    let mut run_uuid = None;
    let mut owner = None;
    let mut environment = BTreeMap::new();

    if let Some(body) = body {
        let body = body.into_inner();
        if let Some(map) = body.as_object() {
            for (key, value) in map {
                let value = match value.as_str() {
                    Some(s) => s.to_string(),
                    None => value.to_string(),
                };
                match key.as_str() {
                    "run_uuid" => run_uuid = Some(value),
                    "owner" => owner = Some(value),
                    _ => {
                        environment.insert(key.clone(), value);
                    }
                }
            }
        }
    }

    let broker = broker.into_inner();
    let run_id = broker
        .run_plan(&plan_id, environment, owner, run_uuid)
        .await?;
    Ok(ok(serde_json::json!({ "run_id": run_id })))
}

/// Mark abort on a live run
#[delete("/api/orchestrate/{run_id}")]
async fn del_orchestrate(
    broker: BrokerData,
    path: web::Path<String>,
) -> Result<actix_web::HttpResponse, RestError> {
    let run_id = path.into_inner();
    if broker.abort_run(&run_id).await {
        Ok(ok(serde_json::json!({})))
    } else {
        Err(RestError::not_found("No such live run"))
    }
}
