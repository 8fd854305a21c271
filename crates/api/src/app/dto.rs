//! Request DTOs and query parameter mapping.
//!
//! Response bodies are the domain/read-model types themselves; they already
//! serialize as camelCase.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockline_adapters::AdapterConfig;
use stockline_core::{
    CategoryId, LocationId, LotId, PageRequest, ProductId, TenantId, VariantId,
};
use stockline_infra::ledger::{BalanceFilter, MovementFilter, ReservationFilter};
use stockline_inventory::{
    LocationKind, MovementType, NewCategory, NewLocation, NewProduct, ProductTrackingMode,
    ReservationStatus,
};

use crate::app::errors::ApiError;
use crate::context::TenantContext;

/// Tenant named in the body, else the one from the query or header.
pub fn resolve_tenant(
    body: Option<TenantId>,
    context: Option<TenantContext>,
) -> Result<TenantId, ApiError> {
    body.or_else(|| context.map(|c| c.tenant_id()))
        .ok_or_else(|| ApiError::Validation("tenantId is required".to_string()))
}

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

impl PageQuery {
    pub fn page_request(&self) -> PageRequest {
        PageRequest::new(self.page, self.limit)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalancesQuery {
    pub product_id: Option<ProductId>,
    pub variant_id: Option<VariantId>,
    pub warehouse_id: Option<LocationId>,
    pub location_id: Option<LocationId>,
    pub lot_id: Option<LotId>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

impl BalancesQuery {
    pub fn into_filter(self, tenant_id: TenantId) -> (BalanceFilter, PageRequest) {
        let page = PageRequest::new(self.page, self.limit);
        let filter = BalanceFilter {
            product_id: self.product_id,
            variant_id: self.variant_id,
            warehouse_id: self.warehouse_id,
            location_id: self.location_id,
            lot_id: self.lot_id,
            ..BalanceFilter::tenant(tenant_id)
        };
        (filter, page)
    }
}

/// Point lookup for one product.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockLevelQuery {
    pub variant_id: Option<VariantId>,
    pub location_id: Option<LocationId>,
    pub lot_id: Option<LotId>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovementsQuery {
    pub product_id: Option<ProductId>,
    #[serde(rename = "type")]
    pub movement_type: Option<MovementType>,
    pub location_id: Option<LocationId>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

impl MovementsQuery {
    pub fn into_filter(self, tenant_id: TenantId) -> Result<(MovementFilter, PageRequest), ApiError> {
        if let (Some(from), Some(to)) = (self.from, self.to) {
            if from > to {
                return Err(ApiError::Validation("from must not be after to".to_string()));
            }
        }
        let page = PageRequest::new(self.page, self.limit);
        let filter = MovementFilter {
            product_id: self.product_id,
            movement_type: self.movement_type,
            location_id: self.location_id,
            from: self.from,
            to: self.to,
            ..MovementFilter::tenant(tenant_id)
        };
        Ok((filter, page))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationsQuery {
    pub product_id: Option<ProductId>,
    pub location_id: Option<LocationId>,
    pub status: Option<ReservationStatus>,
    pub reference: Option<String>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

impl ReservationsQuery {
    pub fn into_filter(self, tenant_id: TenantId) -> (ReservationFilter, PageRequest) {
        let page = PageRequest::new(self.page, self.limit);
        let filter = ReservationFilter {
            product_id: self.product_id,
            location_id: self.location_id,
            status: self.status,
            reference: self.reference,
            ..ReservationFilter::tenant(tenant_id)
        };
        (filter, page)
    }
}

/// Omitting the quantity releases everything still held.
#[derive(Debug, Default, Deserialize)]
pub struct ReleaseRequest {
    #[serde(default, alias = "qty")]
    pub quantity: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCategoryRequest {
    #[serde(default)]
    pub tenant_id: Option<TenantId>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parent_id: Option<CategoryId>,
}

impl CreateCategoryRequest {
    pub fn into_new(self, tenant_id: TenantId) -> NewCategory {
        NewCategory {
            tenant_id,
            name: self.name,
            description: self.description,
            parent_id: self.parent_id,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateLocationRequest {
    #[serde(default)]
    pub tenant_id: Option<TenantId>,
    pub name: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub kind: LocationKind,
    #[serde(default)]
    pub parent_id: Option<LocationId>,
}

impl CreateLocationRequest {
    pub fn into_new(self, tenant_id: TenantId) -> NewLocation {
        NewLocation {
            tenant_id,
            name: self.name,
            code: self.code,
            kind: self.kind,
            parent_id: self.parent_id,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProductRequest {
    #[serde(default)]
    pub tenant_id: Option<TenantId>,
    pub sku: String,
    pub name: String,
    #[serde(default)]
    pub uom: Option<String>,
    #[serde(default)]
    pub tracking: Option<ProductTrackingMode>,
    #[serde(default)]
    pub track_lot: bool,
    #[serde(default)]
    pub track_serial: bool,
    #[serde(default)]
    pub category_id: Option<CategoryId>,
    #[serde(default)]
    pub default_location_id: Option<LocationId>,
}

impl CreateProductRequest {
    pub fn into_new(self, tenant_id: TenantId) -> NewProduct {
        NewProduct {
            tenant_id,
            sku: self.sku,
            name: self.name,
            uom: self.uom,
            tracking: self.tracking,
            track_lot: self.track_lot,
            track_serial: self.track_serial,
            category_id: self.category_id,
            default_location_id: self.default_location_id,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindRequest {
    #[serde(default)]
    pub tenant_id: Option<TenantId>,
    pub adapter: String,
    #[serde(default)]
    pub config: AdapterConfig,
}

/// Binding as reported back; the adapter config may hold credentials and is
/// never echoed.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingResponse {
    pub tenant_id: TenantId,
    pub adapter: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub adapter: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncAccepted {
    pub status: &'static str,
    pub tenant_id: TenantId,
    pub adapter: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_tenant_wins_over_context() {
        let body = TenantId::new();
        let context = TenantContext::new(TenantId::new());
        assert_eq!(resolve_tenant(Some(body), Some(context)).unwrap(), body);
        assert_eq!(
            resolve_tenant(None, Some(context)).unwrap(),
            context.tenant_id()
        );
        assert!(matches!(
            resolve_tenant(None, None),
            Err(ApiError::Validation(_))
        ));
    }

    #[test]
    fn inverted_date_range_is_rejected() {
        let query = MovementsQuery {
            from: Some(Utc::now()),
            to: Some(Utc::now() - chrono::Duration::hours(1)),
            ..MovementsQuery::default()
        };
        assert!(query.into_filter(TenantId::new()).is_err());
    }

    #[test]
    fn page_query_is_clamped() {
        let page = PageQuery {
            page: Some(0),
            limit: Some(500),
        }
        .page_request();
        assert_eq!((page.page, page.limit), (1, 100));
    }
}
