//! MCP proxy: per-request streaming sessions to the caller's worker.
//!
//! Front-end routes are discovered from a standby worker at boot. Each
//! incoming MCP request is bound to the caller's container, the egress
//! proxy file is refreshed in the container's mount, and the request is
//! streamed upstream with forwarded-origin headers and all custom `x-*`
//! headers intact.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{ACCEPT, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::Extension;
use engine::container::Container;
use engine::error::EngineError;
use engine::manager::ContainerManager;
use engine::settings::{ContainerSettings, CONTAINER_STARTUP_SECONDS};
use engine::user::AuthUser;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{GatewayError, GatewayResult};
use crate::proxy::location::Location;
use crate::proxy::selector::{
    parse_proxies_toml, select_and_validate, select_entry, EgressProxies,
};
use crate::proxy::validation::validate_proxy_ip;
use crate::state::AppState;

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// A backend route exposed by the worker image, mirrored by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpRoute {
    pub name: String,
    pub route: String,
}

/// Fetch the MCP route list from any standby worker. When the pool is
/// still warming up, wait out the startup window once and retry.
pub async fn discover_mcp_routes(
    manager: &Arc<ContainerManager>,
    http: &reqwest::Client,
) -> GatewayResult<Vec<McpRoute>> {
    info!("fetching MCP routes from a standby container");
    let container = match manager.get_unassigned_container().await {
        Ok(container) => container,
        Err(EngineError::NoStandby) => {
            info!(
                seconds = CONTAINER_STARTUP_SECONDS,
                "waiting for containers to start"
            );
            tokio::time::sleep(Duration::from_secs(CONTAINER_STARTUP_SECONDS as u64)).await;
            manager.get_unassigned_container().await?
        }
        Err(other) => return Err(other.into()),
    };

    let url = format!("http://{}/api/docs-mcp", container.validated_ip()?);
    let routes: Vec<McpRoute> = http
        .get(&url)
        .timeout(DISCOVERY_TIMEOUT)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    info!(count = routes.len(), "discovered MCP routes");
    Ok(routes)
}

/// Proxy one MCP request to the caller's container.
pub async fn proxy_mcp_request(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    request: Request,
) -> GatewayResult<Response> {
    let container = state.manager.get_user_container(&user).await?;
    info!(
        container = %container.name,
        user_id = %user.user_id(),
        path = request.uri().path(),
        "proxying MCP request"
    );

    let headers = request.headers();
    let location = headers
        .get("x-location-info")
        .or_else(|| headers.get("x-location"))
        .and_then(|value| value.to_str().ok())
        .and_then(Location::from_json);
    let proxy_type = headers
        .get("x-proxy-type")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    apply_egress_proxy(&state, &container, proxy_type.as_deref(), location.as_ref()).await;

    let (proto, host) = state.config.origin_parts();
    let upstream_headers = forwarded_headers(headers, &proto, &host);

    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let url = format!("http://{}{}", container.validated_ip()?, path_and_query);

    let (parts, body) = request.into_parts();
    let upstream = state
        .http
        .request(parts.method, &url)
        .headers(upstream_headers)
        .body(reqwest::Body::wrap_stream(body.into_data_stream()))
        // MCP streams are long-lived
        .timeout(Duration::from_secs(state.config.proxy_read_timeout_secs))
        .send()
        .await
        .map_err(|error| GatewayError::Upstream(error.to_string()))?;

    let status = upstream.status();
    let response_headers = proxied_response_headers(upstream.headers());
    let body = Body::from_stream(upstream.bytes_stream());
    Ok((status, response_headers, body).into_response())
}

/// Headers for the upstream hop: forwarded origin, content negotiation,
/// and every custom `x-*` header verbatim.
pub(crate) fn forwarded_headers(incoming: &HeaderMap, proto: &str, host: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(proto) {
        headers.insert("x-forwarded-proto", value);
    }
    if let Ok(value) = HeaderValue::from_str(host) {
        headers.insert("x-forwarded-host", value);
    }
    for (name, value) in incoming {
        let name_str = name.as_str();
        if name_str == "x-forwarded-proto" || name_str == "x-forwarded-host" {
            continue;
        }
        if name_str.starts_with("x-") || name == CONTENT_TYPE || name == ACCEPT {
            headers.append(name.clone(), value.clone());
        }
    }
    headers
}

/// Upstream response headers minus hop-by-hop fields.
pub(crate) fn proxied_response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in upstream {
        let name_str = name.as_str();
        if name_str == "connection" || name_str == "transfer-encoding" || name_str == "content-length"
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

/// Select, validate, and materialise the egress proxy for a container
/// before its upstream session opens. Failures never block the request:
/// a working direct connection beats a hard failure.
async fn apply_egress_proxy(
    state: &AppState,
    container: &Container,
    proxy_type: Option<&str>,
    location: Option<&Location>,
) {
    let Some(raw_config) = &state.config.proxies_config else {
        return;
    };
    let proxies = parse_proxies_toml(raw_config);
    let Some((_, entry)) = select_entry(
        &proxies,
        proxy_type,
        state.config.default_proxy_type.as_deref(),
    ) else {
        return;
    };

    let resolved =
        select_and_validate(entry, &container.hostname, location, validate_proxy_ip).await;

    if let Err(error) = write_proxies_file(
        &state.settings,
        &container.hostname,
        resolved.map(EgressProxies::from),
    )
    .await
    {
        warn!(
            hostname = %container.hostname,
            %error,
            "failed to update egress proxy file, request proceeds without proxy"
        );
    }
}

/// Write `proxies.yaml` into the container mount (mode 0644), or remove a
/// stale one when no proxy applies.
pub async fn write_proxies_file(
    settings: &ContainerSettings,
    hostname: &str,
    egress: Option<EgressProxies>,
) -> GatewayResult<()> {
    let mount_dir = settings.mount_dir(hostname);
    let path = mount_dir.join("proxies.yaml");

    match egress {
        Some(egress) => {
            tokio::fs::create_dir_all(&mount_dir).await?;
            tokio::fs::write(&path, serde_yaml::to_string(&egress)?).await?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).await?;
            }
            info!(hostname, file = %path.display(), "wrote egress proxy config");
        }
        None => match tokio::fs::remove_file(&path).await {
            Ok(()) => info!(hostname, "removed stale egress proxy config"),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => return Err(error.into()),
        },
    }
    Ok(())
}
