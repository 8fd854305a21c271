//! SAF-T (PT) audit file connector.
//!
//! The file is parsed once on `connect`. Company data becomes the tenant,
//! `MasterFiles/Product` the catalog, and every line of
//! `SourceDocuments/MovementOfGoods/StockMovement` one movement. The movement
//! cursor is the number of lines already delivered.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use stockline_core::TenantId;
use stockline_inventory::{DEFAULT_UOM, LocationKind, MovementType, ProductTrackingMode};

use crate::contract::{
    AdapterConfig, AdapterError, AdapterInfo, ConfigValidation, ConnectionCell, ConnectionStatus,
    ErpAdapter, ExternalCategory, ExternalLocation, ExternalMovement, ExternalProduct,
    ExternalTenant, HealthReport, HealthStatus, SupportedFeatures, SyncResult,
};

pub const NAME: &str = "saft";

/// Settings key holding the path of the audit file.
pub const FILE_PATH_SETTING: &str = "saftFilePath";

/// Warehouse used when a document names none.
pub const DEFAULT_WAREHOUSE: &str = "DEFAULT";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AuditFile {
    header: Header,
    #[serde(default)]
    master_files: MasterFiles,
    #[serde(default)]
    source_documents: SourceDocuments,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Header {
    tax_registration_number: String,
    company_name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MasterFiles {
    #[serde(default)]
    product: Vec<SaftProduct>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SaftProduct {
    #[serde(default)]
    product_type: Option<String>,
    product_code: String,
    #[serde(default)]
    product_group: Option<String>,
    product_description: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SourceDocuments {
    #[serde(default)]
    movement_of_goods: Option<MovementOfGoods>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MovementOfGoods {
    #[serde(default)]
    stock_movement: Vec<StockMovement>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StockMovement {
    document_number: String,
    #[serde(default)]
    document_status: Option<DocumentStatus>,
    #[serde(default)]
    movement_date: Option<String>,
    #[serde(default)]
    movement_start_time: Option<String>,
    movement_type: String,
    #[serde(default)]
    ship_to: Option<ShipPoint>,
    #[serde(default)]
    ship_from: Option<ShipPoint>,
    #[serde(default)]
    line: Vec<Line>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DocumentStatus {
    #[serde(default)]
    movement_status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ShipPoint {
    #[serde(rename = "WarehouseID", default)]
    warehouse_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Line {
    line_number: String,
    product_code: String,
    quantity: String,
    #[serde(default)]
    unit_of_measure: Option<String>,
    #[serde(default)]
    ship_to: Option<ShipPoint>,
    #[serde(default)]
    ship_from: Option<ShipPoint>,
}

fn warehouse(point: &Option<ShipPoint>) -> Option<String> {
    point
        .as_ref()
        .and_then(|p| p.warehouse_id.clone())
        .filter(|w| !w.trim().is_empty())
}

fn movement_time(doc: &StockMovement) -> Option<DateTime<Utc>> {
    doc.movement_start_time
        .as_deref()
        .and_then(|t| NaiveDateTime::parse_from_str(t, "%Y-%m-%dT%H:%M:%S").ok())
        .or_else(|| {
            doc.movement_date
                .as_deref()
                .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
        .map(|n| n.and_utc())
}

fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    slug.trim_end_matches('-').to_string()
}

/// Audit file content flattened into source-neutral records.
#[derive(Debug, Clone, Default, PartialEq)]
struct SaftData {
    tenant: Option<ExternalTenant>,
    categories: Vec<ExternalCategory>,
    locations: Vec<ExternalLocation>,
    products: Vec<ExternalProduct>,
    movements: Vec<ExternalMovement>,
}

impl SaftData {
    fn parse(xml: &str) -> Result<Self, AdapterError> {
        let file: AuditFile =
            quick_xml::de::from_str(xml).map_err(|e| AdapterError::Parse(e.to_string()))?;
        Ok(Self::from_audit_file(file))
    }

    fn from_audit_file(file: AuditFile) -> Self {
        let header = file.header;
        let tenant = ExternalTenant {
            external_id: header.tax_registration_number.clone(),
            slug: Some(slugify(&header.company_name)).filter(|s| !s.is_empty()),
            name: header.company_name,
        };

        let docs = file
            .source_documents
            .movement_of_goods
            .map(|m| m.stock_movement)
            .unwrap_or_default();

        let mut uoms: BTreeMap<String, String> = BTreeMap::new();
        let mut warehouses = BTreeSet::new();
        let mut movements = Vec::new();
        for doc in &docs {
            let cancelled = doc
                .document_status
                .as_ref()
                .and_then(|s| s.movement_status.as_deref())
                == Some("A");
            if cancelled {
                debug!(document = %doc.document_number, "skipping cancelled document");
                continue;
            }
            for line in &doc.line {
                if let Some(uom) = &line.unit_of_measure {
                    uoms.entry(line.product_code.clone()).or_insert_with(|| uom.clone());
                }
                let Some(movement) = line_movement(doc, line) else {
                    continue;
                };
                for w in [
                    &movement.from_location_external_id,
                    &movement.to_location_external_id,
                ]
                .into_iter()
                .flatten()
                {
                    warehouses.insert(w.clone());
                }
                movements.push(movement);
            }
        }

        let mut groups = BTreeSet::new();
        let products = file
            .master_files
            .product
            .into_iter()
            .filter(|p| p.product_type.as_deref().is_none_or(|t| t == "P"))
            .map(|p| {
                if let Some(g) = &p.product_group {
                    groups.insert(g.clone());
                }
                ExternalProduct {
                    external_id: p.product_code.clone(),
                    uom: Some(
                        uoms.get(&p.product_code)
                            .cloned()
                            .unwrap_or_else(|| DEFAULT_UOM.to_string()),
                    ),
                    sku: p.product_code,
                    name: p.product_description,
                    category_external_id: p.product_group,
                    tracking: ProductTrackingMode::Simple,
                    active: true,
                }
            })
            .collect();

        Self {
            tenant: Some(tenant),
            categories: groups
                .into_iter()
                .map(|g| ExternalCategory {
                    name: g.clone(),
                    external_id: g,
                    description: None,
                    parent_external_id: None,
                })
                .collect(),
            locations: warehouses
                .into_iter()
                .map(|w| ExternalLocation {
                    name: w.clone(),
                    code: Some(w.clone()),
                    external_id: w,
                    kind: LocationKind::Warehouse,
                    parent_external_id: None,
                })
                .collect(),
            products,
            movements,
        }
    }
}

/// GR/GC ship out, GD comes back in, GT/GA move between warehouses (or out,
/// when only the origin is known).
fn line_movement(doc: &StockMovement, line: &Line) -> Option<ExternalMovement> {
    let quantity = match Decimal::from_str(line.quantity.trim()) {
        Ok(q) => q.abs(),
        Err(err) => {
            warn!(
                document = %doc.document_number,
                line = %line.line_number,
                error = %err,
                "unparseable quantity"
            );
            return None;
        }
    };
    let from = warehouse(&line.ship_from).or_else(|| warehouse(&doc.ship_from));
    let to = warehouse(&line.ship_to).or_else(|| warehouse(&doc.ship_to));

    let (movement_type, from, to) = match doc.movement_type.as_str() {
        "GD" => (
            MovementType::In,
            None,
            Some(to.or(from).unwrap_or_else(|| DEFAULT_WAREHOUSE.to_string())),
        ),
        "GT" | "GA" if from.is_some() && to.is_some() && from != to => {
            (MovementType::Transfer, from, to)
        }
        "GR" | "GC" | "GT" | "GA" => (
            MovementType::Out,
            Some(from.unwrap_or_else(|| DEFAULT_WAREHOUSE.to_string())),
            None,
        ),
        other => {
            warn!(document = %doc.document_number, movement_type = other, "unknown movement type");
            return None;
        }
    };

    Some(ExternalMovement {
        external_id: format!("{}#{}", doc.document_number, line.line_number),
        movement_type,
        product_external_id: Some(line.product_code.clone()),
        sku: Some(line.product_code.clone()),
        from_location_external_id: from,
        to_location_external_id: to,
        quantity,
        uom: line.unit_of_measure.clone(),
        lot: None,
        serial: None,
        reference: Some(doc.document_number.clone()),
        note: None,
        reason: None,
        occurred_at: movement_time(doc),
    })
}

enum Source {
    File(String),
    Inline(Arc<str>),
    Missing,
}

/// SAF-T XML adapter.
pub struct SaftAdapter {
    config: AdapterConfig,
    inline: Option<Arc<str>>,
    data: RwLock<Option<Arc<SaftData>>>,
    status: ConnectionCell,
}

impl SaftAdapter {
    /// Reads the file named by `settings.saftFilePath` (or `database`) on connect.
    pub fn new(config: AdapterConfig) -> Self {
        Self {
            config,
            inline: None,
            data: RwLock::new(None),
            status: ConnectionCell::default(),
        }
    }

    /// Serves an audit file already held in memory.
    pub fn from_xml(config: AdapterConfig, xml: impl Into<Arc<str>>) -> Self {
        Self {
            inline: Some(xml.into()),
            ..Self::new(config)
        }
    }

    fn source(&self) -> Source {
        if let Some(xml) = &self.inline {
            return Source::Inline(Arc::clone(xml));
        }
        match self
            .config
            .setting_str(FILE_PATH_SETTING)
            .or(self.config.database.as_deref())
        {
            Some(path) => Source::File(path.to_string()),
            None => Source::Missing,
        }
    }

    fn loaded(&self) -> Result<Arc<SaftData>, AdapterError> {
        if !self.is_connected() {
            return Err(AdapterError::NotConnected);
        }
        let guard = match self.data.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.clone().ok_or(AdapterError::NotConnected)
    }

    fn store(&self, data: Option<Arc<SaftData>>) {
        match self.data.write() {
            Ok(mut g) => *g = data,
            Err(poisoned) => *poisoned.into_inner() = data,
        }
    }

    async fn load(&self) -> Result<SaftData, AdapterError> {
        match self.source() {
            Source::Inline(xml) => SaftData::parse(&xml),
            Source::File(path) => {
                let xml = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| AdapterError::Io(format!("{path}: {e}")))?;
                SaftData::parse(&xml)
            }
            Source::Missing => Err(AdapterError::InvalidConfig(vec![
                "SAF-T file path is required".to_string(),
            ])),
        }
    }

    fn catalog<T: Clone>(&self, pick: impl FnOnce(&SaftData) -> Vec<T>) -> SyncResult<T> {
        SyncResult::from_result(self.loaded().map(|d| SyncResult::ok(pick(&d))))
    }
}

#[async_trait]
impl ErpAdapter for SaftAdapter {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            name: NAME.to_string(),
            version: "1.0.0".to_string(),
            description: "SAF-T (Standard Audit File for Tax) import".to_string(),
        }
    }

    fn supported_features(&self) -> SupportedFeatures {
        SupportedFeatures {
            tenants: true,
            categories: true,
            locations: true,
            products: true,
            movements: true,
            real_time_sync: false,
            batch_operations: true,
        }
    }

    fn validate_config(&self) -> ConfigValidation {
        let errors = match self.source() {
            Source::Missing => vec![format!(
                "SAF-T file path is required (settings.{FILE_PATH_SETTING} or database)"
            )],
            _ => Vec::new(),
        };
        ConfigValidation::from_errors(errors)
    }

    fn connection_status(&self) -> ConnectionStatus {
        self.status.get()
    }

    async fn connect(&self) -> Result<(), AdapterError> {
        self.status.set(ConnectionStatus::Connecting);
        match self.load().await {
            Ok(data) => {
                info!(
                    products = data.products.len(),
                    movements = data.movements.len(),
                    "SAF-T file loaded"
                );
                self.store(Some(Arc::new(data)));
                self.status.set(ConnectionStatus::Connected);
                Ok(())
            }
            Err(err) => {
                self.status.set(ConnectionStatus::Error);
                Err(err)
            }
        }
    }

    async fn disconnect(&self) -> Result<(), AdapterError> {
        self.store(None);
        self.status.set(ConnectionStatus::Disconnected);
        Ok(())
    }

    async fn test_connection(&self) -> bool {
        match self.source() {
            Source::Inline(_) => true,
            Source::File(path) => tokio::fs::metadata(&path)
                .await
                .map(|m| m.is_file())
                .unwrap_or(false),
            Source::Missing => false,
        }
    }

    async fn sync_tenants(&self) -> SyncResult<ExternalTenant> {
        self.catalog(|d| d.tenant.clone().into_iter().collect())
    }

    async fn sync_categories(&self, _tenant_id: TenantId) -> SyncResult<ExternalCategory> {
        self.catalog(|d| d.categories.clone())
    }

    async fn sync_locations(&self, _tenant_id: TenantId) -> SyncResult<ExternalLocation> {
        self.catalog(|d| d.locations.clone())
    }

    async fn sync_products(&self, _tenant_id: TenantId) -> SyncResult<ExternalProduct> {
        self.catalog(|d| d.products.clone())
    }

    async fn sync_movements(
        &self,
        _tenant_id: TenantId,
        since: Option<&str>,
    ) -> SyncResult<ExternalMovement> {
        let data = match self.loaded() {
            Ok(d) => d,
            Err(err) => return SyncResult::failed(err),
        };
        let total = data.movements.len();
        let start = match since {
            None => 0,
            Some(c) => match c.parse::<usize>() {
                Ok(n) => n.min(total),
                Err(_) => {
                    return SyncResult::failed(AdapterError::Parse(format!(
                        "invalid SAF-T cursor: {c}"
                    )));
                }
            },
        };
        let end = (start + self.config.page_size()).min(total);
        SyncResult::page(
            data.movements[start..end].to_vec(),
            Some(end.to_string()),
            end < total,
        )
    }

    async fn health_check(&self) -> HealthReport {
        let ok = self.test_connection().await;
        let mut details = BTreeMap::new();
        if let Source::File(path) = self.source() {
            details.insert("file".to_string(), JsonValue::String(path));
        }
        if let Ok(data) = self.loaded() {
            details.insert(
                "movementLines".to_string(),
                JsonValue::from(data.movements.len()),
            );
        }
        HealthReport {
            status: if ok {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unhealthy
            },
            connection_status: self.connection_status(),
            last_check: Utc::now(),
            details,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::SyncOutcome;
    use rust_decimal_macros::dec;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<AuditFile xmlns="urn:OECD:StandardAuditFile-Tax:PT_1.04_01">
  <Header>
    <AuditFileVersion>1.04_01</AuditFileVersion>
    <CompanyID>500100200</CompanyID>
    <TaxRegistrationNumber>500100200</TaxRegistrationNumber>
    <CompanyName>Armazens do Norte, Lda</CompanyName>
  </Header>
  <MasterFiles>
    <Product>
      <ProductType>P</ProductType>
      <ProductCode>P001</ProductCode>
      <ProductGroup>Ferragens</ProductGroup>
      <ProductDescription>Parafuso M6</ProductDescription>
      <ProductNumberCode>P001</ProductNumberCode>
    </Product>
    <Product>
      <ProductType>S</ProductType>
      <ProductCode>SRV1</ProductCode>
      <ProductDescription>Transporte</ProductDescription>
      <ProductNumberCode>SRV1</ProductNumberCode>
    </Product>
  </MasterFiles>
  <SourceDocuments>
    <MovementOfGoods>
      <NumberOfMovementLines>4</NumberOfMovementLines>
      <StockMovement>
        <DocumentNumber>GD A/1</DocumentNumber>
        <DocumentStatus><MovementStatus>N</MovementStatus></DocumentStatus>
        <MovementDate>2024-02-01</MovementDate>
        <MovementType>GD</MovementType>
        <ShipTo><WarehouseID>W1</WarehouseID></ShipTo>
        <Line>
          <LineNumber>1</LineNumber>
          <ProductCode>P001</ProductCode>
          <Quantity>100</Quantity>
          <UnitOfMeasure>UN</UnitOfMeasure>
        </Line>
      </StockMovement>
      <StockMovement>
        <DocumentNumber>GT A/7</DocumentNumber>
        <DocumentStatus><MovementStatus>N</MovementStatus></DocumentStatus>
        <MovementDate>2024-02-02</MovementDate>
        <MovementType>GT</MovementType>
        <ShipTo><WarehouseID>W2</WarehouseID></ShipTo>
        <ShipFrom><WarehouseID>W1</WarehouseID></ShipFrom>
        <Line>
          <LineNumber>1</LineNumber>
          <ProductCode>P001</ProductCode>
          <Quantity>30</Quantity>
        </Line>
        <Line>
          <LineNumber>2</LineNumber>
          <ProductCode>P001</ProductCode>
          <Quantity>5.5</Quantity>
        </Line>
      </StockMovement>
      <StockMovement>
        <DocumentNumber>GR A/3</DocumentNumber>
        <DocumentStatus><MovementStatus>A</MovementStatus></DocumentStatus>
        <MovementDate>2024-02-03</MovementDate>
        <MovementType>GR</MovementType>
        <ShipFrom><WarehouseID>W1</WarehouseID></ShipFrom>
        <Line>
          <LineNumber>1</LineNumber>
          <ProductCode>P001</ProductCode>
          <Quantity>10</Quantity>
        </Line>
      </StockMovement>
    </MovementOfGoods>
  </SourceDocuments>
</AuditFile>"#;

    fn adapter(page_size: usize) -> SaftAdapter {
        SaftAdapter::from_xml(
            AdapterConfig {
                page_size: Some(page_size),
                ..AdapterConfig::default()
            },
            SAMPLE,
        )
    }

    #[test]
    fn parses_company_catalog_and_lines() {
        let data = SaftData::parse(SAMPLE).unwrap();
        let tenant = data.tenant.unwrap();
        assert_eq!(tenant.external_id, "500100200");
        assert_eq!(tenant.slug.as_deref(), Some("armazens-do-norte-lda"));

        assert_eq!(data.products.len(), 1, "services are not stock items");
        assert_eq!(data.products[0].uom.as_deref(), Some("UN"));
        assert_eq!(data.categories[0].external_id, "Ferragens");
        let warehouses: Vec<_> = data.locations.iter().map(|l| l.external_id.as_str()).collect();
        assert_eq!(warehouses, vec!["W1", "W2"]);

        assert_eq!(data.movements.len(), 3, "cancelled documents are skipped");
        let receipt = &data.movements[0];
        assert_eq!(receipt.external_id, "GD A/1#1");
        assert_eq!(receipt.movement_type, MovementType::In);
        assert_eq!(receipt.to_location_external_id.as_deref(), Some("W1"));

        let transfer = &data.movements[2];
        assert_eq!(transfer.movement_type, MovementType::Transfer);
        assert_eq!(transfer.quantity, dec!(5.5));
        assert_eq!(transfer.from_location_external_id.as_deref(), Some("W1"));
        assert_eq!(transfer.to_location_external_id.as_deref(), Some("W2"));
    }

    #[tokio::test]
    async fn movements_page_by_line_count() {
        let saft = adapter(2);
        saft.connect().await.unwrap();
        let tenant = TenantId::new();

        let first = saft.sync_movements(tenant, None).await;
        assert_eq!(first.records_processed, 2);
        assert_eq!(first.cursor.as_deref(), Some("2"));
        assert!(first.has_more);

        let second = saft.sync_movements(tenant, first.cursor.as_deref()).await;
        assert_eq!(second.records_processed, 1);
        assert_eq!(second.cursor.as_deref(), Some("3"));
        assert!(!second.has_more);

        let caught_up = saft.sync_movements(tenant, Some("3")).await;
        assert!(caught_up.data.is_empty());
        assert_eq!(caught_up.cursor.as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn sync_needs_a_loaded_file() {
        let saft = adapter(10);
        let res = saft.sync_products(TenantId::new()).await;
        assert_eq!(res.outcome, SyncOutcome::Failed);
        assert!(res.unavailable);

        saft.connect().await.unwrap();
        assert!(saft.sync_products(TenantId::new()).await.is_success());
        saft.disconnect().await.unwrap();
        assert!(!saft.sync_tenants().await.is_success());
    }

    #[tokio::test]
    async fn missing_file_fails_connect() {
        let mut settings = BTreeMap::new();
        settings.insert(
            FILE_PATH_SETTING.to_string(),
            JsonValue::String("/nonexistent/saft.xml".into()),
        );
        let saft = SaftAdapter::new(AdapterConfig {
            settings,
            ..AdapterConfig::default()
        });
        assert!(saft.validate_config().valid);
        assert!(matches!(saft.connect().await, Err(AdapterError::Io(_))));
        assert_eq!(saft.connection_status(), ConnectionStatus::Error);
    }

    #[tokio::test]
    async fn inline_documents_are_shared_not_copied() {
        let saft = adapter(10);
        let (Source::Inline(first), Source::Inline(second)) = (saft.source(), saft.source()) else {
            panic!("inline document expected");
        };
        assert!(Arc::ptr_eq(&first, &second));

        saft.connect().await.unwrap();
        saft.disconnect().await.unwrap();
        saft.connect().await.unwrap();
        assert_eq!(saft.sync_products(TenantId::new()).await.records_processed, 1);
    }

    #[test]
    fn config_needs_a_file() {
        let v = SaftAdapter::new(AdapterConfig::default()).validate_config();
        assert!(!v.valid);
    }

    #[test]
    fn malformed_xml_is_a_parse_error() {
        assert!(matches!(
            SaftData::parse("<AuditFile><Header>"),
            Err(AdapterError::Parse(_))
        ));
    }
}
