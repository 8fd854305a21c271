//! Primavera ERP connector (REST, basic auth, page-numbered `DataSet` tables).

use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use stockline_inventory::{LocationKind, ProductTrackingMode};

use crate::contract::{
    AdapterConfig, AdapterError, AdapterInfo, EntityKind, ExternalCategory, ExternalLocation,
    ExternalMovement, ExternalProduct,
};
use crate::http::{
    AuthScheme, PageContext, RemotePage, RestAdapter, RestDialect, classify, decode, loose, place,
};

pub const NAME: &str = "primavera";

pub fn adapter(config: AdapterConfig) -> RestAdapter<PrimaveraDialect> {
    RestAdapter::new(PrimaveraDialect, config)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PrimaveraDialect;

/// `{ "DataSet": { "Table": [...] } }`
#[derive(Debug, Deserialize)]
struct DataSet<T> {
    #[serde(rename = "DataSet")]
    data_set: Option<Table<T>>,
}

#[derive(Debug, Deserialize)]
struct Table<T> {
    #[serde(rename = "Table", default = "Vec::new")]
    rows: Vec<T>,
}

impl<T> DataSet<T> {
    fn rows(self) -> Vec<T> {
        self.data_set.map(|d| d.rows).unwrap_or_default()
    }
}

fn current_page(page: &PageContext) -> u32 {
    page.cursor
        .as_deref()
        .and_then(|c| c.parse().ok())
        .filter(|p| *p >= 1)
        .unwrap_or(1)
}

/// The cursor names the page to read next. A partial page is read again next
/// time, since rows appended later land on it. `fetched` is the raw row count,
/// so an unmappable row does not end paging early.
fn numbered_page<T>(page: &PageContext, fetched: usize, items: Vec<T>) -> RemotePage<T> {
    let current = current_page(page);
    let full = fetched > 0 && fetched >= page.limit;
    let next = if full { current + 1 } else { current };
    RemotePage {
        cursor: Some(next.to_string()),
        has_more: full,
        items,
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Familia {
    familia: String,
    #[serde(default)]
    descricao: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Armazem {
    armazem: String,
    #[serde(default)]
    descricao: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Artigo {
    artigo: String,
    #[serde(default)]
    descricao: Option<String>,
    #[serde(default)]
    descricao_abreviada: Option<String>,
    #[serde(default)]
    unidade: Option<String>,
    #[serde(default)]
    familia: Option<String>,
    #[serde(default)]
    inactivo: bool,
    #[serde(default)]
    trata_lotes: bool,
    #[serde(default)]
    trata_numeros_serie: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LinhaDocumento {
    #[serde(deserialize_with = "loose::id")]
    id: String,
    artigo: String,
    tipo_movimento: String,
    #[serde(deserialize_with = "loose::decimal")]
    quantidade: Decimal,
    #[serde(default)]
    armazem: Option<String>,
    #[serde(default)]
    armazem_origem: Option<String>,
    #[serde(default)]
    armazem_destino: Option<String>,
    #[serde(default)]
    unidade: Option<String>,
    #[serde(default)]
    lote: Option<String>,
    #[serde(default)]
    num_serie: Option<String>,
    #[serde(default)]
    documento: Option<String>,
    #[serde(default)]
    observacoes: Option<String>,
    #[serde(default)]
    data: Option<String>,
}

/// Primavera timestamps come without an offset and are read as UTC.
fn parse_data(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
                .ok()
                .map(|n| n.and_utc())
        })
}

impl LinhaDocumento {
    fn into_external(self) -> Option<ExternalMovement> {
        let (movement_type, reason) = classify(&self.tipo_movimento)?;
        let (from, to, quantity) = if self.armazem_origem.is_some() || self.armazem_destino.is_some()
        {
            (self.armazem_origem, self.armazem_destino, self.quantidade.abs())
        } else {
            place(movement_type, reason, self.armazem, self.quantidade)
        };
        Some(ExternalMovement {
            external_id: self.id,
            movement_type,
            product_external_id: None,
            sku: Some(self.artigo),
            from_location_external_id: from,
            to_location_external_id: to,
            quantity,
            uom: self.unidade,
            lot: self.lote,
            serial: self.num_serie,
            reference: self.documento,
            note: self.observacoes,
            reason,
            occurred_at: self.data.as_deref().and_then(parse_data),
        })
    }
}

impl RestDialect for PrimaveraDialect {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            name: NAME.to_string(),
            version: "1.0.0".to_string(),
            description: "Primavera ERP via REST API".to_string(),
        }
    }

    fn auth(&self) -> AuthScheme {
        AuthScheme::Basic
    }

    fn health_path(&self) -> &'static str {
        "/api/engine/status"
    }

    fn validate(&self, config: &AdapterConfig) -> Vec<String> {
        let mut errors = config.validate_http_url("Primavera");
        if config.username.is_none() || config.password.is_none() {
            errors.push("Primavera username and password are required".to_string());
        }
        errors
    }

    fn path(&self, kind: EntityKind) -> Option<&'static str> {
        match kind {
            EntityKind::Tenants => None,
            EntityKind::Categories => Some("/api/base/familias"),
            EntityKind::Locations => Some("/api/base/armazens"),
            EntityKind::Products => Some("/api/base/artigos"),
            EntityKind::Movements => Some("/api/inventario/documentos"),
        }
    }

    fn query(&self, page: &PageContext) -> Vec<(&'static str, String)> {
        vec![
            ("page", current_page(page).to_string()),
            ("pageSize", page.limit.to_string()),
        ]
    }

    fn decode_categories(
        &self,
        body: JsonValue,
        page: &PageContext,
    ) -> Result<RemotePage<ExternalCategory>, AdapterError> {
        let rows = decode::<DataSet<Familia>>(body)?.rows();
        let fetched = rows.len();
        let items = rows
            .into_iter()
            .map(|f| ExternalCategory {
                name: f.descricao.clone().unwrap_or_else(|| f.familia.clone()),
                external_id: f.familia,
                description: f.descricao,
                parent_external_id: None,
            })
            .collect();
        Ok(numbered_page(page, fetched, items))
    }

    fn decode_locations(
        &self,
        body: JsonValue,
        page: &PageContext,
    ) -> Result<RemotePage<ExternalLocation>, AdapterError> {
        let rows = decode::<DataSet<Armazem>>(body)?.rows();
        let fetched = rows.len();
        let items = rows
            .into_iter()
            .map(|a| ExternalLocation {
                name: a.descricao.unwrap_or_else(|| a.armazem.clone()),
                code: Some(a.armazem.clone()),
                external_id: a.armazem,
                kind: LocationKind::Warehouse,
                parent_external_id: None,
            })
            .collect();
        Ok(numbered_page(page, fetched, items))
    }

    fn decode_products(
        &self,
        body: JsonValue,
        page: &PageContext,
    ) -> Result<RemotePage<ExternalProduct>, AdapterError> {
        let rows = decode::<DataSet<Artigo>>(body)?.rows();
        let fetched = rows.len();
        let items = rows
            .into_iter()
            .map(|a| ExternalProduct {
                name: a
                    .descricao
                    .or(a.descricao_abreviada)
                    .unwrap_or_else(|| a.artigo.clone()),
                sku: a.artigo.clone(),
                external_id: a.artigo,
                uom: Some(a.unidade.unwrap_or_else(|| "UN".to_string())),
                category_external_id: a.familia,
                tracking: ProductTrackingMode::from_flags(a.trata_lotes, a.trata_numeros_serie),
                active: !a.inactivo,
            })
            .collect();
        Ok(numbered_page(page, fetched, items))
    }

    fn decode_movements(
        &self,
        body: JsonValue,
        page: &PageContext,
    ) -> Result<RemotePage<ExternalMovement>, AdapterError> {
        let rows = decode::<DataSet<LinhaDocumento>>(body)?.rows();
        let fetched = rows.len();
        let items = rows
            .into_iter()
            .filter_map(LinhaDocumento::into_external)
            .collect();
        Ok(numbered_page(page, fetched, items))
    }
}
