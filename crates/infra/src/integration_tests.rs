//! Integration tests across catalog, ledger, sync and webhook ingress.
//!
//! Verifies:
//! - Receipts, transfers and guarded issues keep balances consistent
//! - Redelivered source movements are recorded once
//! - An interrupted cycle resumes without duplicating committed movements
//! - Tenants never see each other's stock, and one tenant's failing source
//!   does not affect another
//! - Webhook deliveries land in the ledger through the shared ingest path

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    use stockline_adapters::{
        AdapterConfig, AdapterError, AdapterRegistry, EntityKind, ExternalLocation,
        ExternalMovement, ExternalProduct, MemoryAdapter, MemorySource, SaftAdapter,
    };
    use stockline_core::{LocationId, Page, PageRequest, ReservationId, TenantId};
    use stockline_inventory::{
        Balance, BalanceKey, ExternalRef, Location, LocationKind, Movement, MovementInput,
        MovementType, NewLocation, NewProduct, NewReservation, NewTenant, Product,
        ProductTrackingMode, Reservation, StockPolicy, Tenant, TenantSettings,
    };

    use crate::catalog::InMemoryCatalogStore;
    use crate::ledger::{
        BalanceQuery, InMemoryLedgerStore, LedgerError, LedgerService, LedgerStore,
        MovementFilter, RebuildReport, ReservationFilter,
    };
    use crate::sync::{
        CancelToken, InMemoryWatermarkStore, PendingMovement, SyncConfig, SyncError,
        SyncOrchestrator, SyncState, WatermarkStore,
    };
    use crate::webhooks::{WebhookHeaders, WebhookIngress, WebhookWorker};

    // -- fixtures -------------------------------------------------------------

    fn ledger_with(store: Arc<dyn LedgerStore>) -> LedgerService {
        LedgerService::new(Arc::new(InMemoryCatalogStore::new()), store)
    }

    fn ledger() -> LedgerService {
        ledger_with(Arc::new(InMemoryLedgerStore::new()))
    }

    async fn tenant(ledger: &LedgerService, slug: &str) -> Tenant {
        ledger
            .catalog()
            .create_tenant(NewTenant {
                name: slug.to_uppercase(),
                slug: slug.into(),
                settings: TenantSettings::default(),
            })
            .await
            .unwrap()
    }

    async fn location(ledger: &LedgerService, tenant: &Tenant, name: &str, code: &str) -> Location {
        ledger
            .catalog()
            .create_location(NewLocation {
                tenant_id: tenant.id,
                name: name.into(),
                code: Some(code.into()),
                kind: LocationKind::Warehouse,
                parent_id: None,
            })
            .await
            .unwrap()
    }

    async fn product(ledger: &LedgerService, tenant: &Tenant, sku: &str) -> Product {
        ledger
            .catalog()
            .create_product(NewProduct::simple(tenant.id, sku, "Widget"))
            .await
            .unwrap()
    }

    async fn on_hand(
        ledger: &LedgerService,
        tenant: TenantId,
        product: &Product,
        location: Option<LocationId>,
    ) -> Decimal {
        ledger
            .get_balance(tenant, product.id, None, location, None)
            .await
            .unwrap()
            .quantity
    }

    async fn movement_count(ledger: &LedgerService, tenant: TenantId) -> u64 {
        ledger
            .list_movements(MovementFilter::tenant(tenant), PageRequest::default())
            .await
            .unwrap()
            .pagination
            .total
    }

    async fn synced_product(ledger: &LedgerService, tenant: TenantId, sku: &str) -> Product {
        ledger
            .catalog()
            .store()
            .product_by_sku(tenant, sku)
            .await
            .unwrap()
            .expect("product synced")
    }

    /// One warehouse `WH1` and one product `SKU-1`.
    fn stocked_source() -> Arc<MemorySource> {
        let source = MemorySource::new();
        source.add_location(ExternalLocation {
            external_id: "WH1".into(),
            name: "Main".into(),
            code: Some("MAIN".into()),
            kind: LocationKind::Warehouse,
            parent_external_id: None,
        });
        source.add_product(ExternalProduct {
            external_id: "P1".into(),
            sku: "SKU-1".into(),
            name: "Widget".into(),
            uom: None,
            category_external_id: None,
            tracking: ProductTrackingMode::Simple,
            active: true,
        });
        source
    }

    fn receipts(range: std::ops::Range<usize>) -> Vec<ExternalMovement> {
        range
            .map(|i| {
                ExternalMovement::new(format!("rcpt-{i}"), MovementType::In, dec!(1))
                    .sku("SKU-1")
                    .to("WH1")
            })
            .collect()
    }

    fn registry(adapters: Vec<(&'static str, Arc<MemorySource>)>) -> AdapterRegistry {
        adapters
            .into_iter()
            .fold(AdapterRegistry::builder(), |builder, (name, source)| {
                builder.register(name, move |config| {
                    Arc::new(MemoryAdapter::with_source(config, source.clone()))
                })
            })
            .build()
            .unwrap()
    }

    fn orchestrator(
        registry: AdapterRegistry,
        ledger: LedgerService,
        watermarks: Arc<dyn WatermarkStore>,
    ) -> Arc<SyncOrchestrator> {
        Arc::new(SyncOrchestrator::new(
            registry,
            ledger,
            watermarks,
            SyncConfig::default().with_step_timeout(Duration::from_secs(5)),
        ))
    }

    // -- ledger scenarios -----------------------------------------------------

    #[tokio::test]
    async fn receipt_transfer_and_guarded_issue() {
        let ledger = ledger();
        let acme = tenant(&ledger, "acme").await;
        let l1 = location(&ledger, &acme, "Main", "L1").await;
        let l2 = location(&ledger, &acme, "Overflow", "L2").await;
        let widget = product(&ledger, &acme, "SKU-1").await;

        ledger
            .append(
                MovementInput::new(acme.id, MovementType::In, widget.id, dec!(100))
                    .to_location(l1.id),
            )
            .await
            .unwrap();
        assert_eq!(on_hand(&ledger, acme.id, &widget, Some(l1.id)).await, dec!(100));

        ledger
            .append(
                MovementInput::new(acme.id, MovementType::Transfer, widget.id, dec!(30))
                    .from_location(l1.id)
                    .to_location(l2.id),
            )
            .await
            .unwrap();
        assert_eq!(on_hand(&ledger, acme.id, &widget, Some(l1.id)).await, dec!(70));
        assert_eq!(on_hand(&ledger, acme.id, &widget, Some(l2.id)).await, dec!(30));
        assert_eq!(on_hand(&ledger, acme.id, &widget, None).await, dec!(100));

        let err = ledger
            .append(
                MovementInput::new(acme.id, MovementType::Out, widget.id, dec!(80))
                    .from_location(l1.id),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientStock { .. }), "{err:?}");
        assert_eq!(on_hand(&ledger, acme.id, &widget, Some(l1.id)).await, dec!(70));
        assert_eq!(movement_count(&ledger, acme.id).await, 2);

        let report = ledger.rebuild_balances(acme.id).await.unwrap();
        assert_eq!(report.movements_replayed, 2);
        assert!(report.drift.is_empty());
    }

    #[tokio::test]
    async fn tenants_do_not_see_each_other() {
        let ledger = ledger();
        let acme = tenant(&ledger, "acme").await;
        let globex = tenant(&ledger, "globex").await;
        let acme_wh = location(&ledger, &acme, "Main", "MAIN").await;
        let globex_wh = location(&ledger, &globex, "Main", "MAIN").await;
        let acme_widget = product(&ledger, &acme, "SKU-1").await;
        let globex_widget = product(&ledger, &globex, "SKU-1").await;

        ledger
            .append(
                MovementInput::new(acme.id, MovementType::In, acme_widget.id, dec!(5))
                    .to_location(acme_wh.id),
            )
            .await
            .unwrap();

        // another tenant's product and location are invisible
        let err = ledger
            .append(
                MovementInput::new(acme.id, MovementType::In, globex_widget.id, dec!(1))
                    .to_location(acme_wh.id),
            )
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::ProductNotFound(globex_widget.id));
        let err = ledger
            .append(
                MovementInput::new(acme.id, MovementType::In, acme_widget.id, dec!(1))
                    .to_location(globex_wh.id),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::LocationMismatch(_)));

        assert_eq!(on_hand(&ledger, globex.id, &globex_widget, None).await, Decimal::ZERO);
        assert_eq!(movement_count(&ledger, globex.id).await, 0);
        assert_eq!(movement_count(&ledger, acme.id).await, 1);
    }

    // -- sync scenarios -------------------------------------------------------

    /// Never remembers a cursor, so every cycle re-reads the whole source.
    struct Forgetful;

    #[async_trait]
    impl WatermarkStore for Forgetful {
        async fn load(&self, _: TenantId, _: &str) -> Result<Option<String>, SyncError> {
            Ok(None)
        }

        async fn save(&self, _: TenantId, _: &str, _: &str) -> Result<(), SyncError> {
            Ok(())
        }

        async fn load_pending(
            &self,
            _: TenantId,
            _: &str,
        ) -> Result<Vec<PendingMovement>, SyncError> {
            Ok(Vec::new())
        }

        async fn save_pending(
            &self,
            _: TenantId,
            _: &str,
            _: &[PendingMovement],
        ) -> Result<(), SyncError> {
            Ok(())
        }
    }

    const AUDIT_FILE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
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
      <ProductDescription>Parafuso M6</ProductDescription>
      <ProductNumberCode>P001</ProductNumberCode>
    </Product>
  </MasterFiles>
  <SourceDocuments>
    <MovementOfGoods>
      <NumberOfMovementLines>1</NumberOfMovementLines>
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
    </MovementOfGoods>
  </SourceDocuments>
</AuditFile>"#;

    #[tokio::test]
    async fn redelivered_movements_are_recorded_once() {
        let ledger = ledger();
        let acme = tenant(&ledger, "acme").await;
        let registry = AdapterRegistry::builder()
            .register("saft", |config| Arc::new(SaftAdapter::from_xml(config, AUDIT_FILE)))
            .build()
            .unwrap();
        let sync = orchestrator(registry, ledger.clone(), Arc::new(Forgetful));
        sync.bind(acme.id, "saft", AdapterConfig::default()).await.unwrap();

        let first = sync.run(acme.id, "saft").await.unwrap();
        let movements = first.step(EntityKind::Movements).unwrap();
        assert_eq!(movements.applied, 1);

        let second = sync.run(acme.id, "saft").await.unwrap();
        let movements = second.step(EntityKind::Movements).unwrap();
        assert_eq!(movements.records_processed, 1);
        assert_eq!(movements.applied, 0);
        assert_eq!(movements.duplicates, 1);

        let screw = synced_product(&ledger, acme.id, "P001").await;
        assert_eq!(movement_count(&ledger, acme.id).await, 1);
        assert_eq!(on_hand(&ledger, acme.id, &screw, None).await, dec!(100));
    }

    /// Cancels `token` once `limit` movements have been committed.
    struct CancelAfter {
        inner: InMemoryLedgerStore,
        limit: usize,
        appended: AtomicUsize,
        token: CancelToken,
    }

    #[async_trait]
    impl LedgerStore for CancelAfter {
        async fn append(
            &self,
            input: MovementInput,
            policy: StockPolicy,
        ) -> Result<Movement, LedgerError> {
            let movement = self.inner.append(input, policy).await?;
            if self.appended.fetch_add(1, Ordering::SeqCst) + 1 == self.limit {
                self.token.cancel();
            }
            Ok(movement)
        }

        async fn balance(&self, key: &BalanceKey) -> Result<Option<Balance>, LedgerError> {
            self.inner.balance(key).await
        }

        async fn balances(
            &self,
            query: &BalanceQuery,
            page: PageRequest,
        ) -> Result<Page<Balance>, LedgerError> {
            self.inner.balances(query, page).await
        }

        async fn total_quantity(&self, query: &BalanceQuery) -> Result<Decimal, LedgerError> {
            self.inner.total_quantity(query).await
        }

        async fn movements(
            &self,
            filter: &MovementFilter,
            page: PageRequest,
        ) -> Result<Page<Movement>, LedgerError> {
            self.inner.movements(filter, page).await
        }

        async fn find_by_external_ref(
            &self,
            tenant_id: TenantId,
            external_ref: &ExternalRef,
        ) -> Result<Option<Movement>, LedgerError> {
            self.inner.find_by_external_ref(tenant_id, external_ref).await
        }

        async fn rebuild(&self, tenant_id: TenantId) -> Result<RebuildReport, LedgerError> {
            self.inner.rebuild(tenant_id).await
        }

        async fn reserve(
            &self,
            input: NewReservation,
            policy: StockPolicy,
        ) -> Result<Reservation, LedgerError> {
            self.inner.reserve(input, policy).await
        }

        async fn release(
            &self,
            tenant_id: TenantId,
            id: ReservationId,
            quantity: Option<Decimal>,
        ) -> Result<Reservation, LedgerError> {
            self.inner.release(tenant_id, id, quantity).await
        }

        async fn reservation(
            &self,
            tenant_id: TenantId,
            id: ReservationId,
        ) -> Result<Option<Reservation>, LedgerError> {
            self.inner.reservation(tenant_id, id).await
        }

        async fn reservations(
            &self,
            filter: &ReservationFilter,
            page: PageRequest,
        ) -> Result<Page<Reservation>, LedgerError> {
            self.inner.reservations(filter, page).await
        }

        async fn reserved(
            &self,
            query: &BalanceQuery,
        ) -> Result<BTreeMap<BalanceKey, Decimal>, LedgerError> {
            self.inner.reserved(query).await
        }
    }

    #[tokio::test]
    async fn interrupted_cycle_resumes_without_duplicates() {
        let token = CancelToken::new();
        let ledger = ledger_with(Arc::new(CancelAfter {
            inner: InMemoryLedgerStore::new(),
            limit: 5,
            appended: AtomicUsize::new(0),
            token: token.clone(),
        }));
        let acme = tenant(&ledger, "acme").await;
        let source = stocked_source();
        source.extend_movements(receipts(0..10));
        let watermarks = Arc::new(InMemoryWatermarkStore::new());
        let sync = orchestrator(
            registry(vec![("memory", source)]),
            ledger.clone(),
            watermarks.clone(),
        );
        sync.bind(acme.id, "memory", AdapterConfig::default()).await.unwrap();

        let err = sync.run_with(acme.id, "memory", token).await.unwrap_err();
        assert_eq!(err, SyncError::Cancelled);
        assert_eq!(movement_count(&ledger, acme.id).await, 5);
        assert_eq!(watermarks.load(acme.id, "memory").await.unwrap(), None);

        let status = sync.history().status(acme.id, "memory");
        assert_eq!(status.state, SyncState::Failed);
        assert_eq!(status.consecutive_failures, 0);
        assert!(status.next_retry_at.is_none());

        let report = sync.run(acme.id, "memory").await.unwrap();
        let movements = report.step(EntityKind::Movements).unwrap();
        assert_eq!(movements.records_processed, 10);
        assert_eq!(movements.duplicates, 5);
        assert_eq!(movements.applied, 5);

        let widget = synced_product(&ledger, acme.id, "SKU-1").await;
        assert_eq!(movement_count(&ledger, acme.id).await, 10);
        assert_eq!(on_hand(&ledger, acme.id, &widget, None).await, dec!(10));
        assert_eq!(
            watermarks.load(acme.id, "memory").await.unwrap().as_deref(),
            Some("10")
        );
        assert_eq!(sync.history().status(acme.id, "memory").state, SyncState::Idle);
    }

    #[tokio::test]
    async fn later_cycles_only_fetch_new_movements() {
        let ledger = ledger();
        let acme = tenant(&ledger, "acme").await;
        let source = stocked_source();
        source.extend_movements(receipts(0..3));
        let sync = orchestrator(
            registry(vec![("memory", source.clone())]),
            ledger.clone(),
            Arc::new(InMemoryWatermarkStore::new()),
        );
        sync.bind(acme.id, "memory", AdapterConfig::default()).await.unwrap();
        sync.run(acme.id, "memory").await.unwrap();

        source.extend_movements(receipts(3..5));
        let report = sync.run(acme.id, "memory").await.unwrap();
        let movements = report.step(EntityKind::Movements).unwrap();
        assert_eq!(movements.records_processed, 2);
        assert_eq!(movements.applied, 2);
        assert_eq!(movements.duplicates, 0);

        let widget = synced_product(&ledger, acme.id, "SKU-1").await;
        assert_eq!(on_hand(&ledger, acme.id, &widget, None).await, dec!(5));
    }

    #[tokio::test]
    async fn out_of_order_pages_never_lose_an_issue() {
        let ledger = ledger();
        let acme = tenant(&ledger, "acme").await;
        let source = stocked_source();
        source.extend_movements([
            ExternalMovement::new("iss-1", MovementType::Out, dec!(5))
                .sku("SKU-1")
                .from("WH1"),
            ExternalMovement::new("rcpt-1", MovementType::In, dec!(10))
                .sku("SKU-1")
                .to("WH1"),
        ]);
        let watermarks = Arc::new(InMemoryWatermarkStore::new());
        let sync = orchestrator(
            registry(vec![("memory", source)]),
            ledger.clone(),
            watermarks.clone(),
        );
        sync.bind(acme.id, "memory", AdapterConfig::default()).await.unwrap();

        let first = sync.run(acme.id, "memory").await.unwrap();
        let movements = first.step(EntityKind::Movements).unwrap();
        assert_eq!(movements.applied, 2);
        assert!(movements.failures.is_empty(), "{:?}", movements.failures);
        assert_eq!(movements.cursor.as_deref(), Some("2"));

        let second = sync.run(acme.id, "memory").await.unwrap();
        assert_eq!(second.step(EntityKind::Movements).unwrap().records_processed, 0);

        let widget = synced_product(&ledger, acme.id, "SKU-1").await;
        assert_eq!(on_hand(&ledger, acme.id, &widget, None).await, dec!(5));
        assert_eq!(movement_count(&ledger, acme.id).await, 2);
        assert!(watermarks.load_pending(acme.id, "memory").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn a_failing_source_only_stops_its_own_tenant() {
        let ledger = ledger();
        let acme = tenant(&ledger, "acme").await;
        let globex = tenant(&ledger, "globex").await;

        let healthy = stocked_source();
        healthy.extend_movements(receipts(0..2));
        let broken = stocked_source();
        broken.extend_movements(receipts(0..2));
        broken.fail(EntityKind::Products, AdapterError::Parse("bad product row".into()));

        let sync = orchestrator(
            registry(vec![("memory", healthy), ("legacy", broken)]),
            ledger.clone(),
            Arc::new(InMemoryWatermarkStore::new()),
        );
        sync.bind(acme.id, "memory", AdapterConfig::default()).await.unwrap();
        sync.bind(globex.id, "legacy", AdapterConfig::default()).await.unwrap();

        let err = sync.run(globex.id, "legacy").await.unwrap_err();
        assert!(
            matches!(err, SyncError::StepFailed { step: EntityKind::Products, .. }),
            "{err:?}"
        );
        let status = sync.history().status(globex.id, "legacy");
        assert_eq!(status.state, SyncState::Failed);
        assert_eq!(status.consecutive_failures, 1);
        assert!(status.next_retry_at.is_none(), "only unreachable sources back off");
        // steps before the failure were applied
        let locations = ledger.catalog().store().locations(globex.id).await.unwrap();
        assert_eq!(locations.len(), 1);
        assert_eq!(movement_count(&ledger, globex.id).await, 0);

        sync.run(acme.id, "memory").await.unwrap();
        assert_eq!(movement_count(&ledger, acme.id).await, 2);
        assert_eq!(sync.history().status(acme.id, "memory").state, SyncState::Idle);
    }

    #[tokio::test]
    async fn unreachable_sources_schedule_a_retry() {
        let ledger = ledger();
        let acme = tenant(&ledger, "acme").await;
        let source = stocked_source();
        source.set_unavailable(true);
        let sync = orchestrator(
            registry(vec![("memory", source.clone())]),
            ledger.clone(),
            Arc::new(InMemoryWatermarkStore::new()),
        );
        sync.bind(acme.id, "memory", AdapterConfig::default()).await.unwrap();

        let err = sync.run(acme.id, "memory").await.unwrap_err();
        assert!(matches!(err, SyncError::AdapterUnavailable(_)), "{err:?}");
        let status = sync.history().status(acme.id, "memory");
        assert_eq!(status.consecutive_failures, 1);
        assert!(status.next_retry_at.is_some());
        assert!(status.last_error.is_some());

        source.set_unavailable(false);
        sync.run(acme.id, "memory").await.unwrap();
        let status = sync.history().status(acme.id, "memory");
        assert_eq!(status.consecutive_failures, 0);
        assert!(status.next_retry_at.is_none());
        assert!(status.last_success_at.is_some());
    }

    #[tokio::test]
    async fn concurrent_triggers_for_one_binding_are_rejected() {
        let ledger = ledger();
        let acme = tenant(&ledger, "acme").await;
        let source = stocked_source();
        source.extend_movements(receipts(0..3));
        let sync = orchestrator(
            registry(vec![("memory", source)]),
            ledger.clone(),
            Arc::new(InMemoryWatermarkStore::new()),
        );
        sync.bind(acme.id, "memory", AdapterConfig::default()).await.unwrap();

        let handle = sync.start(acme.id, "memory").unwrap();
        assert!(sync.is_running(acme.id, "memory"));
        let err = sync.start(acme.id, "memory").unwrap_err();
        assert!(matches!(err, SyncError::AlreadyRunning { .. }));

        handle.wait().await.unwrap();
        assert!(!sync.is_running(acme.id, "memory"));
        assert_eq!(movement_count(&ledger, acme.id).await, 3);
    }

    #[tokio::test]
    async fn unbound_and_unknown_targets_are_errors() {
        let ledger = ledger();
        let acme = tenant(&ledger, "acme").await;
        let sync = orchestrator(
            registry(vec![("memory", stocked_source())]),
            ledger,
            Arc::new(InMemoryWatermarkStore::new()),
        );

        assert!(matches!(
            sync.run(acme.id, "memory").await,
            Err(SyncError::NotBound { .. })
        ));
        assert!(matches!(
            sync.bind(acme.id, "netsuite", AdapterConfig::default()).await,
            Err(SyncError::Registry(_))
        ));
        let stranger = TenantId::new();
        assert_eq!(
            sync.bind(stranger, "memory", AdapterConfig::default())
                .await
                .unwrap_err(),
            SyncError::TenantNotFound(stranger)
        );
    }

    // -- webhooks -------------------------------------------------------------

    #[tokio::test]
    async fn webhook_orders_flow_into_the_ledger() {
        let ledger = ledger();
        let acme = tenant(&ledger, "acme").await;
        let shop = location(&ledger, &acme, "Shop floor", "default").await;
        let widget = product(&ledger, &acme, "SKU-1").await;
        ledger
            .append(
                MovementInput::new(acme.id, MovementType::In, widget.id, dec!(10))
                    .to_location(shop.id),
            )
            .await
            .unwrap();

        let sync = orchestrator(
            registry(Vec::new()),
            ledger.clone(),
            Arc::new(InMemoryWatermarkStore::new()),
        );
        let (ingress, deliveries) = WebhookIngress::with_defaults(Default::default(), 8);
        let worker = WebhookWorker::spawn(sync.clone(), deliveries);

        let order = br##"{"id": 1001, "name": "#1001",
            "line_items": [{"id": 1, "sku": "SKU-1", "quantity": 2}]}"##;
        let headers: WebhookHeaders =
            [("x-shopify-topic".to_string(), "orders/create".to_string())].into();
        // the second delivery is a redelivery of the first
        for _ in 0..2 {
            let ack = ingress.accept("shopify", acme.id, &headers, order).await.unwrap();
            assert_eq!(ack.queued, 1);
        }

        let mut ingested = 0;
        for _ in 0..200 {
            ingested = sync.history().records(acme.id, Some("shopify")).len();
            if ingested == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(ingested, 2);
        worker.shutdown().await;

        assert_eq!(on_hand(&ledger, acme.id, &widget, Some(shop.id)).await, dec!(8));
        let out = ledger
            .store()
            .find_by_external_ref(acme.id, &ExternalRef::new("shopify", "order:1001:1"))
            .await
            .unwrap()
            .expect("order line recorded");
        assert_eq!(out.movement_type, MovementType::Out);
        assert_eq!(out.from_location_id, Some(shop.id));

        let records = sync.history().records(acme.id, Some("shopify"));
        assert_eq!(records.iter().map(|r| r.applied).sum::<usize>(), 1);
        assert_eq!(records.iter().map(|r| r.duplicates).sum::<usize>(), 1);
    }
}
