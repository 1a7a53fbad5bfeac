use std::collections::HashMap;
use std::sync::Arc;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get},
    Json, Router,
};
use serde::Deserialize;
use shared::regtype::ServiceType;
use shared::types::{normalize_domain, InstanceKey, ServiceInstance};
use crate::cache::SnapshotCache;
use crate::error::EngineError;
use crate::registration::RegistrationManager;

#[derive(Clone)]
pub struct AppState {
    pub cache: SnapshotCache,
    pub registrations: Arc<RegistrationManager>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub reg_type: String,
    pub port: u16,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub txt: HashMap<String, String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/types", get(get_types))
        .route("/v1/types/hash", get(get_types_hash))
        .route("/v1/services/:reg_type", get(get_services))
        .route("/v1/registrations", get(get_registrations).post(post_registration))
        .route("/v1/registrations/:name/:reg_type", delete(delete_registration))
        .with_state(state)
}

fn status_for(e: &EngineError) -> StatusCode {
    match e {
        EngineError::InvalidRegType(_) => StatusCode::BAD_REQUEST,
        EngineError::Backend(_) => StatusCode::BAD_GATEWAY,
    }
}

async fn get_types(State(state): State<AppState>) -> Result<Json<Vec<ServiceInstance>>, StatusCode> {
    state.cache.types().map(Json).map_err(|e| {
        tracing::error!("Type view unavailable: {}", e);
        status_for(&e)
    })
}

async fn get_types_hash(State(state): State<AppState>) -> String {
    state.cache.types_hash()
}

async fn get_services(
    State(state): State<AppState>,
    Path(reg_type): Path<String>,
) -> Result<Json<Vec<ServiceInstance>>, StatusCode> {
    let service_type = ServiceType::parse(&reg_type, state.cache.domain()).map_err(|e| {
        tracing::debug!("Rejected lookup of {}: {}", reg_type, e);
        StatusCode::BAD_REQUEST
    })?;

    let snapshot = state.cache.lookup(&service_type.browse_key()).await.map_err(|e| {
        tracing::error!("Failed to look up {}: {}", reg_type, e);
        status_for(&e)
    })?;
    Ok(Json(snapshot.as_ref().clone()))
}

async fn get_registrations(State(state): State<AppState>) -> Json<Vec<ServiceInstance>> {
    Json(state.registrations.registered())
}

async fn post_registration(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<ServiceInstance>), StatusCode> {
    let domain = request.domain.as_deref().unwrap_or(state.cache.domain());
    let mut instance = ServiceInstance::new(
        request.name,
        format!("{}.", request.reg_type.trim_end_matches('.')),
        normalize_domain(domain),
    );
    instance.port = request.port;
    instance.txt = request.txt;

    let advertised = state.registrations.register(instance).await.map_err(|e| {
        tracing::error!("Failed to register service: {}", e);
        status_for(&e)
    })?;
    Ok((StatusCode::CREATED, Json(advertised)))
}

async fn delete_registration(
    State(state): State<AppState>,
    Path((name, reg_type)): Path<(String, String)>,
) -> StatusCode {
    let key = InstanceKey {
        name,
        reg_type: format!("{}.", reg_type.trim_end_matches('.')),
        domain: state.cache.domain().to_string(),
    };

    match state.registrations.unregister(&key) {
        Ok(true) => StatusCode::NO_CONTENT,
        Ok(false) => StatusCode::NOT_FOUND,
        Err(e) => {
            tracing::error!("Failed to unregister {}: {}", key, e);
            status_for(&e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use crate::backend::fake::FakeBackend;
    use crate::hub::Hub;

    fn state(backend: &FakeBackend) -> AppState {
        let backend: Arc<FakeBackend> = Arc::new(backend.clone());
        let hub = Hub::new(backend.clone());
        let (cache, _) = SnapshotCache::spawn(
            hub,
            "local.",
            Vec::new(),
            Duration::from_millis(20),
            CancellationToken::new(),
        );
        AppState {
            cache,
            registrations: Arc::new(RegistrationManager::new(backend)),
        }
    }

    fn request(name: &str) -> RegisterRequest {
        RegisterRequest {
            name: name.to_string(),
            reg_type: "_http._tcp".to_string(),
            port: 8080,
            domain: None,
            txt: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_services_rejects_bad_reg_type() {
        let state = state(&FakeBackend::new());
        let status = get_services(State(state), Path("nonsense".to_string()))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_services_backend_failure_is_bad_gateway() {
        let backend = FakeBackend::new();
        backend.refuse_browse(&shared::types::BrowseKey::new("_ssh._tcp", "local."));
        let state = state(&backend);

        let status = get_services(State(state), Path("_ssh._tcp".to_string()))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_register_list_delete() {
        let state = state(&FakeBackend::new());

        let (status, Json(advertised)) = post_registration(State(state.clone()), Json(request("web")))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(advertised.reg_type, "_http._tcp.");
        assert_eq!(advertised.domain, "local.");

        let Json(listed) = get_registrations(State(state.clone())).await;
        assert_eq!(listed.len(), 1);

        let path = Path(("web".to_string(), "_http._tcp".to_string()));
        assert_eq!(delete_registration(State(state.clone()), path).await, StatusCode::NO_CONTENT);

        let path = Path(("web".to_string(), "_http._tcp".to_string()));
        assert_eq!(delete_registration(State(state), path).await, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_register_rejects_bad_reg_type() {
        let state = state(&FakeBackend::new());
        let mut bad = request("web");
        bad.reg_type = "not-a-type".to_string();

        let status = post_registration(State(state), Json(bad)).await.unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
