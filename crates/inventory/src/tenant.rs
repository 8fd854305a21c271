use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockline_core::{DomainError, DomainResult, Entity, TenantId};

/// Per-tenant ledger policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantSettings {
    /// Backorder mode: decrements may drive balances below zero.
    #[serde(default)]
    pub allow_negative_stock: bool,
}

/// Isolation boundary. Tenants are soft-deactivated, never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    pub slug: String,
    pub is_active: bool,
    pub settings: TenantSettings,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTenant {
    pub name: String,
    pub slug: String,
    #[serde(default)]
    pub settings: TenantSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantPatch {
    pub name: Option<String>,
    pub is_active: Option<bool>,
    pub settings: Option<TenantSettings>,
}

/// Slugs are lowercase ASCII letters, digits and dashes.
pub fn validate_slug(slug: &str) -> DomainResult<()> {
    if slug.is_empty() {
        return Err(DomainError::validation("slug cannot be empty"));
    }
    let ok = slug
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !ok {
        return Err(DomainError::validation(format!(
            "slug '{slug}' may only contain lowercase letters, digits and dashes"
        )));
    }
    Ok(())
}

impl Tenant {
    pub fn create(id: TenantId, input: NewTenant, now: DateTime<Utc>) -> DomainResult<Self> {
        let name = input.name.trim();
        if name.is_empty() {
            return Err(DomainError::validation("tenant name cannot be empty"));
        }
        validate_slug(&input.slug)?;
        Ok(Self {
            id,
            name: name.to_string(),
            slug: input.slug,
            is_active: true,
            settings: input.settings,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn apply_patch(&mut self, patch: TenantPatch, now: DateTime<Utc>) -> DomainResult<()> {
        if let Some(name) = patch.name {
            let name = name.trim();
            if name.is_empty() {
                return Err(DomainError::validation("tenant name cannot be empty"));
            }
            self.name = name.to_string();
        }
        if let Some(active) = patch.is_active {
            self.is_active = active;
        }
        if let Some(settings) = patch.settings {
            self.settings = settings;
        }
        self.updated_at = now;
        Ok(())
    }
}

impl Entity for Tenant {
    type Id = TenantId;

    fn id(&self) -> Self::Id {
        self.id
    }
}
