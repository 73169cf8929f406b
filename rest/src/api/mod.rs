//! Handler modules, one per resource

pub mod instances;
pub mod orchestrate;
pub mod plans;
pub mod projects;
pub mod root;
pub mod runs;

use std::sync::Arc;

use actix_web::web;

use broker::Broker;

/// Shared application state
pub type BrokerData = web::Data<Broker>;

/// Wrap the broker for actix
pub fn broker_data(broker: Arc<Broker>) -> BrokerData {
    web::Data::from(broker)
}
