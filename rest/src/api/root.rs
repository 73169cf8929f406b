//! Version and run listing

use actix_web::{get, web};
use serde::Deserialize;

use crate::api::BrokerData;
use crate::{ok, RestError};

pub(crate) fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(get_root);
}

#[derive(Deserialize)]
struct Paging {
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    offset: usize,
}

fn default_limit() -> usize {
    100
}

/// Version and current runs
#[get("/api")]
async fn get_root(
    broker: BrokerData,
    paging: web::Query<Paging>,
) -> Result<actix_web::HttpResponse, RestError> {
    let runs = broker.get_runs(paging.limit, paging.offset).await?;
    Ok(ok(serde_json::json!({
        "version": broker::VERSION,
        "runs": runs,
    })))
}
