//! Tenant-scoped catalog entities: categories, locations and products.

use std::collections::HashSet;
use std::hash::Hash;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockline_core::{
    CategoryId, DomainError, DomainResult, Entity, LocationId, ProductId, TenantId, TenantOwned,
};

use crate::movement::DEFAULT_UOM;

fn required(value: &str, field: &str) -> DomainResult<String> {
    let v = value.trim();
    if v.is_empty() {
        return Err(DomainError::validation(format!("{field} cannot be empty")));
    }
    Ok(v.to_string())
}

/// Reject a parent assignment that would make `id` its own ancestor.
///
/// `parent_of` walks the existing tree; a dangling parent simply ends the walk.
pub fn ensure_acyclic<K>(id: K, new_parent: K, parent_of: impl Fn(K) -> Option<K>) -> DomainResult<()>
where
    K: Copy + Eq + Hash + core::fmt::Display,
{
    let mut seen = HashSet::new();
    let mut cursor = Some(new_parent);
    while let Some(current) = cursor {
        if current == id {
            return Err(DomainError::invariant(format!(
                "{id} cannot be its own ancestor"
            )));
        }
        if !seen.insert(current) {
            // pre-existing loop in stored data; stop walking
            break;
        }
        cursor = parent_of(current);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Category
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub id: CategoryId,
    pub tenant_id: TenantId,
    pub name: String,
    pub description: Option<String>,
    pub parent_id: Option<CategoryId>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCategory {
    pub tenant_id: TenantId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parent_id: Option<CategoryId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub parent_id: Option<CategoryId>,
    pub is_active: Option<bool>,
}

impl Category {
    pub fn create(id: CategoryId, input: NewCategory, now: DateTime<Utc>) -> DomainResult<Self> {
        if input.parent_id == Some(id) {
            return Err(DomainError::invariant("category cannot be its own parent"));
        }
        Ok(Self {
            id,
            tenant_id: input.tenant_id,
            name: required(&input.name, "category name")?,
            description: input.description,
            parent_id: input.parent_id,
            is_active: true,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn apply_patch(&mut self, patch: CategoryPatch, now: DateTime<Utc>) -> DomainResult<()> {
        if let Some(name) = patch.name {
            self.name = required(&name, "category name")?;
        }
        if patch.description.is_some() {
            self.description = patch.description;
        }
        if let Some(parent) = patch.parent_id {
            if parent == self.id {
                return Err(DomainError::invariant("category cannot be its own parent"));
            }
            self.parent_id = Some(parent);
        }
        if let Some(active) = patch.is_active {
            self.is_active = active;
        }
        self.updated_at = now;
        Ok(())
    }
}

impl Entity for Category {
    type Id = CategoryId;

    fn id(&self) -> Self::Id {
        self.id
    }
}

impl TenantOwned for Category {
    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}

// ---------------------------------------------------------------------------
// Location
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocationKind {
    #[default]
    Warehouse,
    Zone,
    Shelf,
    Store,
    Virtual,
}

/// Physical or logical storage point. Any location can act as a "warehouse"
/// for balance queries: it covers itself and all of its descendants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub id: LocationId,
    pub tenant_id: TenantId,
    pub name: String,
    pub code: Option<String>,
    pub kind: LocationKind,
    pub parent_id: Option<LocationId>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewLocation {
    pub tenant_id: TenantId,
    pub name: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub kind: LocationKind,
    #[serde(default)]
    pub parent_id: Option<LocationId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationPatch {
    pub name: Option<String>,
    pub code: Option<String>,
    pub kind: Option<LocationKind>,
    pub parent_id: Option<LocationId>,
    pub is_active: Option<bool>,
}

impl Location {
    pub fn create(id: LocationId, input: NewLocation, now: DateTime<Utc>) -> DomainResult<Self> {
        if input.parent_id == Some(id) {
            return Err(DomainError::invariant("location cannot be its own parent"));
        }
        Ok(Self {
            id,
            tenant_id: input.tenant_id,
            name: required(&input.name, "location name")?,
            code: input.code,
            kind: input.kind,
            parent_id: input.parent_id,
            is_active: true,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn apply_patch(&mut self, patch: LocationPatch, now: DateTime<Utc>) -> DomainResult<()> {
        if let Some(name) = patch.name {
            self.name = required(&name, "location name")?;
        }
        if patch.code.is_some() {
            self.code = patch.code;
        }
        if let Some(kind) = patch.kind {
            self.kind = kind;
        }
        if let Some(parent) = patch.parent_id {
            if parent == self.id {
                return Err(DomainError::invariant("location cannot be its own parent"));
            }
            self.parent_id = Some(parent);
        }
        if let Some(active) = patch.is_active {
            self.is_active = active;
        }
        self.updated_at = now;
        Ok(())
    }
}

impl Entity for Location {
    type Id = LocationId;

    fn id(&self) -> Self::Id {
        self.id
    }
}

impl TenantOwned for Location {
    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}

// ---------------------------------------------------------------------------
// Product
// ---------------------------------------------------------------------------

/// Which identifying fields a movement of this product must carry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProductTrackingMode {
    /// No lot, no serial.
    #[default]
    Simple,
    /// Every movement names a lot.
    LotTracked,
    /// Every movement names exactly one serial unit (quantity 1). Lot optional.
    SerialTracked,
}

impl ProductTrackingMode {
    /// Map legacy `trackLot` / `trackSerial` flags onto the tracking mode.
    pub fn from_flags(track_lot: bool, track_serial: bool) -> Self {
        match (track_lot, track_serial) {
            (_, true) => Self::SerialTracked,
            (true, false) => Self::LotTracked,
            (false, false) => Self::Simple,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: ProductId,
    pub tenant_id: TenantId,
    pub sku: String,
    pub name: String,
    pub uom: String,
    pub tracking: ProductTrackingMode,
    pub category_id: Option<CategoryId>,
    pub default_location_id: Option<LocationId>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProduct {
    pub tenant_id: TenantId,
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

impl NewProduct {
    pub fn simple(tenant_id: TenantId, sku: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            tenant_id,
            sku: sku.into(),
            name: name.into(),
            uom: None,
            tracking: None,
            track_lot: false,
            track_serial: false,
            category_id: None,
            default_location_id: None,
        }
    }

    pub fn tracking_mode(&self) -> ProductTrackingMode {
        self.tracking
            .unwrap_or_else(|| ProductTrackingMode::from_flags(self.track_lot, self.track_serial))
    }
}

/// Sku, uom and tracking mode are fixed once movements may reference the product.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductPatch {
    pub name: Option<String>,
    pub category_id: Option<CategoryId>,
    pub default_location_id: Option<LocationId>,
    pub is_active: Option<bool>,
}

impl Product {
    pub fn create(id: ProductId, input: NewProduct, now: DateTime<Utc>) -> DomainResult<Self> {
        let tracking = input.tracking_mode();
        let uom = match input.uom.as_deref() {
            Some(u) => required(u, "uom")?,
            None => DEFAULT_UOM.to_string(),
        };
        Ok(Self {
            id,
            tenant_id: input.tenant_id,
            sku: required(&input.sku, "sku")?,
            name: required(&input.name, "product name")?,
            uom,
            tracking,
            category_id: input.category_id,
            default_location_id: input.default_location_id,
            is_active: true,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn apply_patch(&mut self, patch: ProductPatch, now: DateTime<Utc>) -> DomainResult<()> {
        if let Some(name) = patch.name {
            self.name = required(&name, "product name")?;
        }
        if patch.category_id.is_some() {
            self.category_id = patch.category_id;
        }
        if patch.default_location_id.is_some() {
            self.default_location_id = patch.default_location_id;
        }
        if let Some(active) = patch.is_active {
            self.is_active = active;
        }
        self.updated_at = now;
        Ok(())
    }
}

impl Entity for Product {
    type Id = ProductId;

    fn id(&self) -> Self::Id {
        self.id
    }
}

impl TenantOwned for Product {
    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}
