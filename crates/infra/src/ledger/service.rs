//! Ledger use cases: referential validation in front of a [`LedgerStore`],
//! plus the read models served over HTTP.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use stockline_core::{
    LocationId, LotId, Page, PageRequest, ProductId, ReservationId, TenantId, VariantId,
};
use stockline_inventory::{
    Balance, ExternalRef, LocationKind, Movement, MovementInput, NewReservation, Product,
    ProductTrackingMode, Reservation, StockPolicy, Tenant,
};

use super::{
    BalanceQuery, LedgerError, LedgerStore, MovementFilter, RebuildReport, ReservationFilter,
};
use crate::catalog::{CatalogError, CatalogService, CatalogStore};

/// Quantity on hand for one product, at one location or summed across all.
/// `available` is on hand minus what active reservations hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockLevel {
    pub tenant_id: TenantId,
    pub product_id: ProductId,
    pub variant_id: Option<VariantId>,
    pub location_id: Option<LocationId>,
    pub lot_id: Option<LotId>,
    pub quantity: Decimal,
    pub reserved: Decimal,
    pub available: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductSummary {
    pub id: ProductId,
    pub sku: String,
    pub name: String,
    pub uom: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationSummary {
    pub id: LocationId,
    pub name: String,
    pub code: Option<String>,
    pub kind: LocationKind,
}

/// A balance row joined with the catalog entries it points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceView {
    #[serde(flatten)]
    pub balance: Balance,
    pub reserved: Decimal,
    pub available: Decimal,
    pub product: Option<ProductSummary>,
    pub location: Option<LocationSummary>,
}

/// `GET /balances` filters. `warehouse_id` expands to the location subtree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceFilter {
    pub tenant_id: TenantId,
    pub product_id: Option<ProductId>,
    pub variant_id: Option<VariantId>,
    pub warehouse_id: Option<LocationId>,
    pub location_id: Option<LocationId>,
    pub lot_id: Option<LotId>,
}

impl BalanceFilter {
    pub fn tenant(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            product_id: None,
            variant_id: None,
            warehouse_id: None,
            location_id: None,
            lot_id: None,
        }
    }
}

#[derive(Clone)]
pub struct LedgerService {
    catalog: CatalogService,
    store: Arc<dyn LedgerStore>,
}

impl LedgerService {
    pub fn new(catalog: Arc<dyn CatalogStore>, store: Arc<dyn LedgerStore>) -> Self {
        Self {
            catalog: CatalogService::new(catalog),
            store,
        }
    }

    pub fn catalog(&self) -> &CatalogService {
        &self.catalog
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    async fn require_tenant(&self, tenant_id: TenantId) -> Result<Tenant, LedgerError> {
        match self.catalog.store().tenant(tenant_id).await? {
            Some(t) => Ok(t),
            None => Err(LedgerError::TenantNotFound(tenant_id)),
        }
    }

    /// Active tenant, active product and tenant-owned locations, or the
    /// first of them that is missing.
    async fn resolve(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        locations: impl IntoIterator<Item = LocationId>,
    ) -> Result<(Tenant, Product), LedgerError> {
        let tenant = match self.catalog.store().tenant(tenant_id).await? {
            Some(t) if t.is_active => t,
            _ => return Err(LedgerError::TenantNotFound(tenant_id)),
        };
        let product = self
            .catalog
            .store()
            .product(tenant.id, product_id)
            .await?
            .ok_or(LedgerError::ProductNotFound(product_id))?;
        if !product.is_active {
            return Err(LedgerError::ValidationFailed(format!(
                "product {} is inactive",
                product.sku
            )));
        }
        for location in locations {
            if self.catalog.store().location(tenant.id, location).await?.is_none() {
                return Err(LedgerError::LocationMismatch(format!(
                    "location {location} does not belong to tenant {}",
                    tenant.id
                )));
            }
        }
        Ok((tenant, product))
    }

    /// Validate a movement against the catalog and append it.
    ///
    /// Checks run cheapest first: shape, then tenant, product and locations,
    /// then product-specific rules (uom, tracking mode). Only then is a ledger
    /// lock taken.
    #[instrument(skip(self, input), fields(tenant_id = %input.tenant_id, product_id = %input.product_id), err)]
    pub async fn append(&self, input: MovementInput) -> Result<Movement, LedgerError> {
        input.validate()?;
        let (tenant, product) = self
            .resolve(
                input.tenant_id,
                input.product_id,
                [input.from_location_id, input.to_location_id].into_iter().flatten(),
            )
            .await?;
        input.validate_for_product(&product)?;

        self.store
            .append(input, StockPolicy::for_tenant(&tenant.settings))
            .await
    }

    /// Hold stock for a caller without moving it. Strict tenants can only
    /// reserve what is available; backorder tenants may over-reserve.
    #[instrument(skip(self, input), fields(tenant_id = %input.tenant_id, product_id = %input.product_id), err)]
    pub async fn reserve(&self, input: NewReservation) -> Result<Reservation, LedgerError> {
        input.validate()?;
        let (tenant, product) = self
            .resolve(input.tenant_id, input.product_id, [input.location_id])
            .await?;
        if input.lot_id.is_some() && product.tracking == ProductTrackingMode::Simple {
            return Err(LedgerError::ValidationFailed(format!(
                "product {} does not track lots",
                product.sku
            )));
        }
        let reservation = self
            .store
            .reserve(input, StockPolicy::for_tenant(&tenant.settings))
            .await?;
        info!(
            reservation_id = %reservation.id,
            quantity = %reservation.quantity,
            reference = reservation.reference.as_deref().unwrap_or_default(),
            "stock reserved"
        );
        Ok(reservation)
    }

    /// Give back `quantity` of a hold, or all of it.
    pub async fn release(
        &self,
        tenant_id: TenantId,
        id: ReservationId,
        quantity: Option<Decimal>,
    ) -> Result<Reservation, LedgerError> {
        self.require_tenant(tenant_id).await?;
        self.store.release(tenant_id, id, quantity).await
    }

    pub async fn get_reservation(
        &self,
        tenant_id: TenantId,
        id: ReservationId,
    ) -> Result<Reservation, LedgerError> {
        self.require_tenant(tenant_id).await?;
        self.store
            .reservation(tenant_id, id)
            .await?
            .ok_or(LedgerError::ReservationNotFound(id))
    }

    pub async fn list_reservations(
        &self,
        filter: ReservationFilter,
        page: PageRequest,
    ) -> Result<Page<Reservation>, LedgerError> {
        self.require_tenant(filter.tenant_id).await?;
        self.store.reservations(&filter, page).await
    }

    /// Current quantity. With no location the quantity is summed across all
    /// locations; unset variant and lot are likewise unconstrained.
    pub async fn get_balance(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        variant_id: Option<VariantId>,
        location_id: Option<LocationId>,
        lot_id: Option<LotId>,
    ) -> Result<StockLevel, LedgerError> {
        self.require_tenant(tenant_id).await?;
        let query = BalanceQuery {
            tenant_id,
            product_id: Some(product_id),
            variant_id,
            location_ids: location_id.map(|l| vec![l]),
            lot_id,
        };
        let quantity = self.store.total_quantity(&query).await?;
        let reserved: Decimal = self.store.reserved(&query).await?.values().copied().sum();
        Ok(StockLevel {
            tenant_id,
            product_id,
            variant_id,
            location_id,
            lot_id,
            quantity,
            reserved,
            available: quantity - reserved,
        })
    }

    #[instrument(skip(self, filter), fields(tenant_id = %filter.tenant_id), err)]
    pub async fn list_balances(
        &self,
        filter: BalanceFilter,
        page: PageRequest,
    ) -> Result<Page<BalanceView>, LedgerError> {
        self.require_tenant(filter.tenant_id).await?;

        let location_ids = match (filter.warehouse_id, filter.location_id) {
            (Some(warehouse), location) => {
                let subtree = self
                    .catalog
                    .location_subtree(filter.tenant_id, warehouse)
                    .await
                    .map_err(|e| match e {
                        CatalogError::Storage(msg) => LedgerError::Storage(msg),
                        CatalogError::Domain(_) => LedgerError::LocationMismatch(format!(
                            "warehouse {warehouse} does not belong to tenant {}",
                            filter.tenant_id
                        )),
                    })?;
                Some(match location {
                    Some(l) => subtree.into_iter().filter(|id| *id == l).collect(),
                    None => subtree,
                })
            }
            (None, Some(location)) => Some(vec![location]),
            (None, None) => None,
        };

        let query = BalanceQuery {
            tenant_id: filter.tenant_id,
            product_id: filter.product_id,
            variant_id: filter.variant_id,
            location_ids,
            lot_id: filter.lot_id,
        };
        let page = self.store.balances(&query, page).await?;
        let held = self.store.reserved(&query).await?;

        let product_ids: BTreeSet<ProductId> = page.data.iter().map(|b| b.key.product_id).collect();
        let location_ids: BTreeSet<LocationId> =
            page.data.iter().map(|b| b.key.location_id).collect();
        let store = self.catalog.store();

        let mut products = HashMap::new();
        for id in product_ids {
            if let Some(p) = store.product(filter.tenant_id, id).await? {
                products.insert(
                    id,
                    ProductSummary {
                        id,
                        sku: p.sku,
                        name: p.name,
                        uom: p.uom,
                    },
                );
            }
        }
        let mut locations = HashMap::new();
        for id in location_ids {
            if let Some(l) = store.location(filter.tenant_id, id).await? {
                locations.insert(
                    id,
                    LocationSummary {
                        id,
                        name: l.name,
                        code: l.code,
                        kind: l.kind,
                    },
                );
            }
        }

        Ok(page.map(|balance| {
            let reserved = held.get(&balance.key).copied().unwrap_or_default();
            BalanceView {
                reserved,
                available: balance.quantity - reserved,
                product: products.get(&balance.key.product_id).cloned(),
                location: locations.get(&balance.key.location_id).cloned(),
                balance,
            }
        }))
    }

    pub async fn list_movements(
        &self,
        filter: MovementFilter,
        page: PageRequest,
    ) -> Result<Page<Movement>, LedgerError> {
        self.require_tenant(filter.tenant_id).await?;
        self.store.movements(&filter, page).await
    }

    pub async fn rebuild_balances(&self, tenant_id: TenantId) -> Result<RebuildReport, LedgerError> {
        self.require_tenant(tenant_id).await?;
        let report = self.store.rebuild(tenant_id).await?;
        info!(
            tenant_id = %tenant_id,
            movements = report.movements_replayed,
            balances = report.balances_written,
            drifted = report.drift.len(),
            "balances rebuilt"
        );
        Ok(report)
    }

    pub async fn contains_external_ref(
        &self,
        tenant_id: TenantId,
        external_ref: &ExternalRef,
    ) -> Result<bool, LedgerError> {
        Ok(self
            .store
            .find_by_external_ref(tenant_id, external_ref)
            .await?
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InMemoryCatalogStore;
    use crate::ledger::InMemoryLedgerStore;
    use rust_decimal_macros::dec;
    use stockline_inventory::{
        Location, MovementType, NewLocation, NewProduct, NewTenant, Product,
        ProductTrackingMode, TenantPatch, TenantSettings,
    };

    struct World {
        ledger: LedgerService,
        tenant: Tenant,
        warehouse: Location,
        shelf: Location,
        product: Product,
    }

    async fn tenant(catalog: &CatalogService, slug: &str, backorder: bool) -> Tenant {
        catalog
            .create_tenant(NewTenant {
                name: slug.to_uppercase(),
                slug: slug.into(),
                settings: TenantSettings {
                    allow_negative_stock: backorder,
                },
            })
            .await
            .unwrap()
    }

    async fn location(
        catalog: &CatalogService,
        tenant: &Tenant,
        name: &str,
        kind: LocationKind,
        parent: Option<LocationId>,
    ) -> Location {
        catalog
            .create_location(NewLocation {
                tenant_id: tenant.id,
                name: name.into(),
                code: None,
                kind,
                parent_id: parent,
            })
            .await
            .unwrap()
    }

    async fn world(backorder: bool) -> World {
        let ledger = LedgerService::new(
            Arc::new(InMemoryCatalogStore::new()),
            Arc::new(InMemoryLedgerStore::new()),
        );
        let catalog = ledger.catalog().clone();
        let tenant = tenant(&catalog, "acme", backorder).await;
        let warehouse = location(&catalog, &tenant, "Main", LocationKind::Warehouse, None).await;
        let shelf =
            location(&catalog, &tenant, "A-1", LocationKind::Shelf, Some(warehouse.id)).await;
        let product = catalog
            .create_product(NewProduct::simple(tenant.id, "SKU-1", "Widget"))
            .await
            .unwrap();
        World {
            ledger,
            tenant,
            warehouse,
            shelf,
            product,
        }
    }

    fn receive(w: &World, location: LocationId, qty: Decimal) -> MovementInput {
        MovementInput::new(w.tenant.id, MovementType::In, w.product.id, qty).to_location(location)
    }

    #[tokio::test]
    async fn inactive_tenant_is_not_found() {
        let w = world(false).await;
        w.ledger
            .catalog()
            .update_tenant(
                w.tenant.id,
                TenantPatch {
                    is_active: Some(false),
                    ..TenantPatch::default()
                },
            )
            .await
            .unwrap();
        let err = w.ledger.append(receive(&w, w.shelf.id, dec!(1))).await.unwrap_err();
        assert_eq!(err, LedgerError::TenantNotFound(w.tenant.id));
    }

    #[tokio::test]
    async fn foreign_references_are_rejected() {
        let w = world(false).await;
        let catalog = w.ledger.catalog().clone();
        let other = tenant(&catalog, "other", false).await;
        let foreign_location =
            location(&catalog, &other, "Theirs", LocationKind::Warehouse, None).await;
        let foreign_product = catalog
            .create_product(NewProduct::simple(other.id, "SKU-1", "Widget"))
            .await
            .unwrap();

        let err = w
            .ledger
            .append(receive(&w, foreign_location.id, dec!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::LocationMismatch(_)));

        let mut input = receive(&w, w.shelf.id, dec!(1));
        input.product_id = foreign_product.id;
        let err = w.ledger.append(input).await.unwrap_err();
        assert_eq!(err, LedgerError::ProductNotFound(foreign_product.id));
    }

    #[tokio::test]
    async fn uom_and_tracking_are_enforced() {
        let w = world(false).await;
        let err = w
            .ledger
            .append(receive(&w, w.shelf.id, dec!(1)).with_uom("kg"))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::ValidationFailed(_)));

        let mut serial = NewProduct::simple(w.tenant.id, "SER-1", "Scanner");
        serial.tracking = Some(ProductTrackingMode::SerialTracked);
        let serial = w.ledger.catalog().create_product(serial).await.unwrap();

        let mut input = receive(&w, w.shelf.id, dec!(2)).with_serial("SN-1");
        input.product_id = serial.id;
        assert!(matches!(
            w.ledger.append(input).await.unwrap_err(),
            LedgerError::ValidationFailed(_)
        ));

        let mut input = receive(&w, w.shelf.id, dec!(1)).with_serial("SN-1");
        input.product_id = serial.id;
        w.ledger.append(input).await.unwrap();
    }

    #[tokio::test]
    async fn backorder_tenants_may_go_negative() {
        let w = world(true).await;
        w.ledger
            .append(
                MovementInput::new(w.tenant.id, MovementType::Out, w.product.id, dec!(3))
                    .from_location(w.shelf.id),
            )
            .await
            .unwrap();
        let level = w
            .ledger
            .get_balance(w.tenant.id, w.product.id, None, Some(w.shelf.id), None)
            .await
            .unwrap();
        assert_eq!(level.quantity, dec!(-3));
    }

    #[tokio::test]
    async fn balances_sum_and_expand_warehouses() {
        let w = world(false).await;
        let elsewhere = location(
            w.ledger.catalog(),
            &w.tenant,
            "Store",
            LocationKind::Store,
            None,
        )
        .await;
        w.ledger.append(receive(&w, w.shelf.id, dec!(4))).await.unwrap();
        w.ledger.append(receive(&w, w.warehouse.id, dec!(1))).await.unwrap();
        w.ledger.append(receive(&w, elsewhere.id, dec!(10))).await.unwrap();

        let total = w
            .ledger
            .get_balance(w.tenant.id, w.product.id, None, None, None)
            .await
            .unwrap();
        assert_eq!(total.quantity, dec!(15));
        assert_eq!(total.location_id, None);

        let mut filter = BalanceFilter::tenant(w.tenant.id);
        filter.warehouse_id = Some(w.warehouse.id);
        let page = w
            .ledger
            .list_balances(filter, PageRequest::default())
            .await
            .unwrap();
        assert_eq!(page.pagination.total, 2);
        assert!(page.data.iter().all(|v| v.balance.key.location_id != elsewhere.id));
        assert_eq!(
            page.data[0].product.as_ref().map(|p| p.sku.as_str()),
            Some("SKU-1")
        );
        assert!(page.data.iter().all(|v| v.location.is_some()));
    }

    #[tokio::test]
    async fn reservations_lower_availability_not_stock() {
        let w = world(false).await;
        w.ledger.append(receive(&w, w.shelf.id, dec!(10))).await.unwrap();

        let order = w
            .ledger
            .reserve(
                NewReservation::new(w.tenant.id, w.product.id, w.shelf.id, dec!(7))
                    .with_reference("SO-1"),
            )
            .await
            .unwrap();
        let level = w
            .ledger
            .get_balance(w.tenant.id, w.product.id, None, Some(w.shelf.id), None)
            .await
            .unwrap();
        assert_eq!(
            (level.quantity, level.reserved, level.available),
            (dec!(10), dec!(7), dec!(3))
        );

        let err = w
            .ledger
            .reserve(NewReservation::new(w.tenant.id, w.product.id, w.shelf.id, dec!(4)))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientStock { current, .. } if current == dec!(3)));

        w.ledger
            .release(w.tenant.id, order.id, Some(dec!(2)))
            .await
            .unwrap();
        let page = w
            .ledger
            .list_balances(BalanceFilter::tenant(w.tenant.id), PageRequest::default())
            .await
            .unwrap();
        assert_eq!(page.data[0].reserved, dec!(5));
        assert_eq!(page.data[0].available, dec!(5));

        let mut filter = ReservationFilter::tenant(w.tenant.id);
        filter.reference = Some("SO-1".into());
        let found = w
            .ledger
            .list_reservations(filter, PageRequest::default())
            .await
            .unwrap();
        assert_eq!(found.data.len(), 1);
        assert_eq!(found.data[0].remaining, dec!(5));
    }

    #[tokio::test]
    async fn reservations_are_validated_against_the_catalog() {
        let w = world(false).await;
        let catalog = w.ledger.catalog().clone();
        let other = tenant(&catalog, "other", false).await;
        let theirs = location(&catalog, &other, "Theirs", LocationKind::Warehouse, None).await;

        let err = w
            .ledger
            .reserve(NewReservation::new(w.tenant.id, w.product.id, theirs.id, dec!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::LocationMismatch(_)));

        let err = w
            .ledger
            .reserve(NewReservation::new(w.tenant.id, w.product.id, w.shelf.id, dec!(0)))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::ValidationFailed(_)));

        let missing = ReservationId::new();
        assert_eq!(
            w.ledger.get_reservation(w.tenant.id, missing).await.unwrap_err(),
            LedgerError::ReservationNotFound(missing)
        );
    }

    #[tokio::test]
    async fn unknown_product_reads_as_zero() {
        let w = world(false).await;
        let level = w
            .ledger
            .get_balance(w.tenant.id, ProductId::new(), None, None, None)
            .await
            .unwrap();
        assert_eq!(level.quantity, Decimal::ZERO);
    }
}
