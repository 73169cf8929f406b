//! Run inspection, abort, and purge

use actix_web::{delete, get, web};
use serde::Deserialize;

use crate::api::BrokerData;
use crate::{ok, RestError};

pub(crate) fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(get_run).service(del_run);
}

#[get("/api/run/{id}")]
async fn get_run(
    broker: BrokerData,
    path: web::Path<String>,
) -> Result<actix_web::HttpResponse, RestError> {
    let id = path.into_inner();
    match broker.get_run(&id).await? {
        Some(run) => Ok(ok(serde_json::json!({ "run": run }))),
        None => Err(RestError::not_found("No such run")),
    }
}

#[derive(Deserialize)]
struct DeleteQuery {
    #[serde(default)]
    purge: u8,
}

/// Abort a run; with `purge=1` also drop its record. Purging works
/// on a run in any state.
#[delete("/api/run/{id}")]
async fn del_run(
    broker: BrokerData,
    path: web::Path<String>,
    query: web::Query<DeleteQuery>,
) -> Result<actix_web::HttpResponse, RestError> {
    let id = path.into_inner();
    broker.delete_run(&id, query.purge == 1).await?;
    Ok(ok(serde_json::json!({})))
}
