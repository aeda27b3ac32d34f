use std::sync::Arc;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use shared::protocol::API_PREFIX;
use shared::types::ServiceAddress;
use crate::node::{Membership, Role};
use crate::processor::availability::HostTable;
use crate::processor::AvailabilityProcessor;
use super::hash;

#[derive(Clone)]
pub struct AppState {
    pub availability: Arc<AvailabilityProcessor>,
    pub node: Arc<NodeInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    pub instance_id: String,
    pub role: Role,
    pub inbox: String,
    pub provides: Vec<String>,
    pub subscribes: Vec<String>,
}

impl NodeInfo {
    pub fn new(membership: &Membership, inbox: &str) -> Self {
        Self {
            instance_id: membership.identity.instance_id.clone(),
            role: membership.role(),
            inbox: inbox.to_string(),
            provides: membership.provides.clone(),
            subscribes: membership.subscribes.clone(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(&format!("{}/node", API_PREFIX), get(get_node))
        .route(&format!("{}/services", API_PREFIX), get(get_services))
        .route(&format!("{}/services/hash", API_PREFIX), get(get_hash))
        .route(&format!("{}/services/:service", API_PREFIX), get(get_service))
        .with_state(state)
}

async fn get_node(State(state): State<AppState>) -> Json<NodeInfo> {
    Json(state.node.as_ref().clone())
}

async fn get_services(State(state): State<AppState>) -> Json<HostTable> {
    Json(state.availability.all_available(false, true))
}

async fn get_hash(State(state): State<AppState>) -> Result<String, StatusCode> {
    hash::compute_hash(&state.availability.snapshot()).map_err(|e| {
        tracing::error!("Failed to hash availability view: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

async fn get_service(
    State(state): State<AppState>,
    Path(service): Path<String>,
) -> Result<Json<Vec<ServiceAddress>>, StatusCode> {
    let addresses = state.availability.available(&service);
    if addresses.is_empty() {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(addresses))
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::message::{AvailabilityMessage, Envelope};
    use crate::processor::MessageProcessor;

    fn state() -> AppState {
        let availability = Arc::new(AvailabilityProcessor::new(false));
        availability
            .process(&Envelope::new(AvailabilityMessage::available(
                vec!["web:80".to_string(), "db".to_string()],
                "1.1.1.1",
                10,
            )))
            .unwrap();

        AppState {
            availability,
            node: Arc::new(NodeInfo {
                instance_id: "i-1".to_string(),
                role: Role::Participant,
                inbox: "i-1".to_string(),
                provides: vec![],
                subscribes: vec!["web".to_string(), "db".to_string()],
            }),
        }
    }

    #[tokio::test]
    async fn test_services_view() {
        let Json(table) = get_services(State(state())).await;
        assert_eq!(table.get("1.1.1.1").unwrap(), ["web:80", "db"]);
        assert_eq!(
            serde_json::to_string(&table).unwrap(),
            r#"{"1.1.1.1":["web:80","db"]}"#
        );
    }

    #[tokio::test]
    async fn test_single_service() {
        let Json(addresses) = get_service(State(state()), Path("web".to_string())).await.unwrap();
        assert_eq!(addresses, vec![ServiceAddress::new("1.1.1.1", ":80")]);

        match get_service(State(state()), Path("cache".to_string())).await {
            Err(code) => assert_eq!(code, StatusCode::NOT_FOUND),
            Ok(_) => panic!("unknown service found"),
        }
    }

    #[tokio::test]
    async fn test_node_and_hash() {
        let Json(node) = get_node(State(state())).await;
        assert_eq!(serde_json::to_value(&node).unwrap()["role"], "participant");

        let digest = get_hash(State(state())).await.unwrap();
        assert_eq!(digest.len(), 64);
    }
}
