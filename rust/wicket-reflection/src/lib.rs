#![deny(unsafe_code)]

//! Service reflection over wicket RPC.
//!
//! One well-known unary method lets a peer enumerate what the other side
//! serves, grouped as services with their method names. The response body
//! is JSON, so any peer implementation can consume it without sharing a
//! schema.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use wicket_session::{BoxError, CallError, CallOptions, Client, Server, make_handler};

/// The well-known reflection method path.
pub const LIST_SERVICES_PATH: &str = "/grpc.reflection.v1alpha.ServerReflection/ListServices";

/// One service and its method names, as reported by reflection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub name: String,
    pub methods: Vec<String>,
}

/// The reflection response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListServicesResponse {
    pub services: Vec<ServiceEntry>,
}

/// Build the method path for `service` and `method`.
pub fn method_path(service: &str, method: &str) -> String {
    format!("/{service}/{method}")
}

/// Group registered method paths into per-service entries.
///
/// Paths that don't look like `/<service>/<method>` are skipped. Output
/// order follows the sorted input: services alphabetically, methods in
/// registration-sorted order within each.
fn group_methods(paths: &[String]) -> Vec<ServiceEntry> {
    let mut by_service: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for path in paths {
        let Some(rest) = path.strip_prefix('/') else {
            continue;
        };
        let Some((service, method)) = rest.split_once('/') else {
            continue;
        };
        if service.is_empty() || method.is_empty() {
            continue;
        }
        by_service
            .entry(service.to_string())
            .or_default()
            .push(method.to_string());
    }
    by_service
        .into_iter()
        .map(|(name, methods)| ServiceEntry { name, methods })
        .collect()
}

/// Install the reflection handler on `server`.
///
/// The handler reads the registry live on every call, so methods
/// registered later still show up. The reflection method lists itself
/// like any other registration.
pub fn register(server: &Server) {
    let reflected = server.clone();
    server.register_handler(
        LIST_SERVICES_PATH,
        make_handler(
            |_bytes: &[u8]| Ok::<(), BoxError>(()),
            |response: &ListServicesResponse| serde_json::to_vec(response).map_err(Into::into),
            move |_ctx, _request: ()| {
                let reflected = reflected.clone();
                async move {
                    Ok(ListServicesResponse {
                        services: group_methods(&reflected.registered_methods()),
                    })
                }
            },
        ),
    );
}

/// Typed client for the reflection method.
pub struct ReflectionClient {
    client: Client,
}

impl ReflectionClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Ask the peer what it serves. The request body is empty.
    pub async fn list_services(
        &self,
        options: CallOptions,
    ) -> Result<ListServicesResponse, CallError> {
        self.client
            .unary(
                LIST_SERVICES_PATH,
                &(),
                |_request: &()| Ok(Vec::new()),
                |bytes| serde_json::from_slice(bytes).map_err(Into::into),
                options,
            )
            .await
    }
}
