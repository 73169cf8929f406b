//! Plan lookup and deletion

use actix_web::{delete, get, web};

use crate::api::BrokerData;
use crate::{ok, RestError};

pub(crate) fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(get_plan).service(del_plan);
}

#[get("/api/plan/{id}")]
async fn get_plan(
    broker: BrokerData,
    path: web::Path<String>,
) -> Result<actix_web::HttpResponse, RestError> {
    let id = path.into_inner();
    match broker
        .repository()
        .load_plan_with_steps(&id)
        .await
        .map_err(broker::BrokerError::from)
        .map_err(RestError::from)?
    {
        Some(plan) => Ok(ok(serde_json::json!({ "plan": plan }))),
        None => Err(RestError::not_found("No such plan")),
    }
}

#[delete("/api/plan/{id}")]
async fn del_plan(
    broker: BrokerData,
    path: web::Path<String>,
) -> Result<actix_web::HttpResponse, RestError> {
    let id = path.into_inner();
    if broker
        .repository()
        .delete_plan(&id)
        .await
        .map_err(broker::BrokerError::from)
        .map_err(RestError::from)?
    {
        Ok(ok(serde_json::json!({})))
    } else {
        Err(RestError::not_found("No such plan"))
    }
}
