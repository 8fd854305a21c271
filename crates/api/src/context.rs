use axum::async_trait;
use axum::extract::{FromRequestParts, Query};
use axum::http::request::Parts;
use serde::Deserialize;

use stockline_core::TenantId;

use crate::app::errors::ApiError;

/// Header accepted in place of the `tenantId` query parameter.
pub const TENANT_HEADER: &str = "x-tenant-id";

/// Tenant a request is scoped to.
///
/// Taken from the `tenantId` query parameter, or from `X-Tenant-Id` when the
/// query does not carry one. Whether the tenant exists is checked by the
/// services, not here.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TenantContext {
    tenant_id: TenantId,
}

impl TenantContext {
    pub fn new(tenant_id: TenantId) -> Self {
        Self { tenant_id }
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}

#[derive(Debug, Deserialize)]
struct TenantParam {
    #[serde(rename = "tenantId")]
    tenant_id: Option<String>,
}

#[async_trait]
impl<S> FromRequestParts<S> for TenantContext
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let from_query = Query::<TenantParam>::try_from_uri(&parts.uri)
            .ok()
            .and_then(|Query(p)| p.tenant_id);
        let from_header = || {
            parts
                .headers
                .get(TENANT_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let raw = from_query
            .or_else(from_header)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| ApiError::Validation("tenantId is required".to_string()))?;
        let tenant_id = raw
            .trim()
            .parse::<TenantId>()
            .map_err(|_| ApiError::Validation(format!("tenantId is not a valid id: {raw}")))?;
        Ok(Self::new(tenant_id))
    }
}
