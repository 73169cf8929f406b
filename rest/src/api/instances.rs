//! Pool instance inspection and termination

use actix_web::{delete, get, web};

use crate::api::BrokerData;
use crate::{ok, RestError};

pub(crate) fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(get_instances)
        .service(del_instances)
        .service(get_instance)
        .service(del_instance);
}

#[get("/api/instances")]
async fn get_instances(broker: BrokerData) -> Result<actix_web::HttpResponse, RestError> {
    let instances = broker.instances().await;
    Ok(ok(serde_json::json!({ "instances": instances })))
}

/// Reap: terminate every free instance across all regions
#[delete("/api/instances")]
async fn del_instances(broker: BrokerData) -> Result<actix_web::HttpResponse, RestError> {
    broker.reap_instances().await?;
    Ok(ok(serde_json::json!({})))
}

#[get("/api/instances/{id}")]
async fn get_instance(
    broker: BrokerData,
    path: web::Path<String>,
) -> Result<actix_web::HttpResponse, RestError> {
    let id = path.into_inner();
    match broker.instance(&id).await {
        Some(instance) => Ok(ok(serde_json::json!({ "instance": instance }))),
        None => Err(RestError::not_found("No such instance")),
    }
}

#[delete("/api/instances/{id}")]
async fn del_instance(
    broker: BrokerData,
    path: web::Path<String>,
) -> Result<actix_web::HttpResponse, RestError> {
    let id = path.into_inner();
    broker.terminate_instance(&id).await?;
    Ok(ok(serde_json::json!({})))
}
