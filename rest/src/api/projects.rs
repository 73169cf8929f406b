//! Project creation and listing, with nested plans and steps

use actix_web::{delete, get, post, web};

use broker::Project;

use crate::api::BrokerData;
use crate::{ok, RestError};

pub(crate) fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(get_projects)
        .service(post_project)
        .service(get_project)
        .service(del_project);
}

#[get("/api/project")]
async fn get_projects(broker: BrokerData) -> Result<actix_web::HttpResponse, RestError> {
    let projects = broker.repository().projects().await.map_err(to_broker)?;
    Ok(ok(serde_json::json!({ "projects": projects })))
}

/// Create a project with nested plans and steps; identifiers are
/// assigned server-side
#[post("/api/project")]
async fn post_project(
    broker: BrokerData,
    body: web::Json<Project>,
) -> Result<actix_web::HttpResponse, RestError> {
    let project = broker
        .repository()
        .create_project(body.into_inner())
        .await
        .map_err(to_broker)?;
    Ok(ok(serde_json::json!({ "project": project })))
}

#[get("/api/project/{id}")]
async fn get_project(
    broker: BrokerData,
    path: web::Path<String>,
) -> Result<actix_web::HttpResponse, RestError> {
    let id = path.into_inner();
    match broker.repository().project(&id).await.map_err(to_broker)? {
        Some(project) => Ok(ok(serde_json::json!({ "project": project }))),
        None => Err(RestError::not_found("No such project")),
    }
}

#[delete("/api/project/{id}")]
async fn del_project(
    broker: BrokerData,
    path: web::Path<String>,
) -> Result<actix_web::HttpResponse, RestError> {
    let id = path.into_inner();
    if broker
        .repository()
        .delete_project(&id)
        .await
        .map_err(to_broker)?
    {
        Ok(ok(serde_json::json!({})))
    } else {
        Err(RestError::not_found("No such project"))
    }
}

fn to_broker(source: broker::db::DbError) -> RestError {
    RestError::from(broker::BrokerError::from(source))
}
