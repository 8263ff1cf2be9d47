use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use rust_decimal_macros::dec;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Notify;

use super::*;
use crate::auth::{AccessToken, StoreBackedAuthenticator};
use crate::clock::ManualClock;
use crate::connections::{
    AccountActivity, AccountType, ConnectCredentials, ProviderAccount, ProviderLink,
    RawTransaction,
};
use crate::persistence::SecureStoreRepository;
use crate::queue::{QueueItemStatus, QueueItemType, QueueOperation};
use crate::reconciliation::{
    ConflictKind, ConflictResolution, ExpenseQuery, ExpenseRecord, InMemoryExpenseLedger,
    NewExpense,
};
use crate::secrets::InMemorySecureStore;
use crate::sync::{SyncCycleStatus, SyncConfigUpdate};

fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

fn txn_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
}

fn starbucks() -> RawTransaction {
    RawTransaction {
        provider_transaction_id: "txn-starbucks".into(),
        amount: dec!(-25.99),
        description: "STARBUCKS #123".into(),
        original_description: None,
        merchant_name: None,
        categories: vec!["Food and Drink".into()],
        date: txn_date(),
        pending: false,
        payment_channel: Some("in_store".into()),
    }
}

enum Fetch {
    Unavailable,
    AuthFailed,
}

/// Provider whose answers are scripted by the test.
struct ScriptedProvider {
    connect_failures: StdMutex<VecDeque<Fetch>>,
    fetch_failures: StdMutex<VecDeque<Fetch>>,
    activity: StdMutex<AccountActivity>,
    gate: StdMutex<Option<(Arc<Notify>, Arc<Notify>)>>,
    connect_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
    revoke_calls: AtomicUsize,
}

impl ScriptedProvider {
    fn new() -> Self {
        Self {
            connect_failures: StdMutex::new(VecDeque::new()),
            fetch_failures: StdMutex::new(VecDeque::new()),
            activity: StdMutex::new(AccountActivity {
                balance: Some(dec!(2500.00)),
                transactions: vec![starbucks()],
            }),
            gate: StdMutex::new(None),
            connect_calls: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
            revoke_calls: AtomicUsize::new(0),
        }
    }

    fn fail_connect(&self, failure: Fetch) {
        self.connect_failures.lock().unwrap().push_back(failure);
    }

    fn fail_fetches(&self, failure: fn() -> Fetch, times: usize) {
        let mut queue = self.fetch_failures.lock().unwrap();
        for _ in 0..times {
            queue.push_back(failure());
        }
    }

    /// Makes the next fetch signal `entered` and wait for `release`.
    fn hold_next_fetch(&self) -> (Arc<Notify>, Arc<Notify>) {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some((entered.clone(), release.clone()));
        (entered, release)
    }

    fn fetches(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    fn as_error(failure: Fetch) -> Error {
        match failure {
            Fetch::Unavailable => Error::provider_unavailable("503 Service Unavailable"),
            Fetch::AuthFailed => Error::auth_failed("consent revoked"),
        }
    }
}

#[async_trait]
impl BankProvider for ScriptedProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Sandbox
    }

    async fn connect(&self, credentials: &ConnectCredentials) -> Result<ProviderLink> {
        let call = self.connect_calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        if let Some(failure) = self.connect_failures.lock().unwrap().pop_front() {
            return Err(Self::as_error(failure));
        }
        Ok(ProviderLink {
            institution_id: credentials.institution_id.clone(),
            institution_name: credentials.institution_name.clone(),
            token: AccessToken::new(format!("token-{}", call)),
            accounts: vec![ProviderAccount {
                provider_account_id: "prov-checking".into(),
                name: "Everyday Checking".into(),
                account_type: AccountType::Checking,
                masked_number: "****1234".into(),
                balance: dec!(2500.00),
                currency: "USD".into(),
            }],
        })
    }

    async fn fetch_transactions(
        &self,
        _token: &AccessToken,
        _provider_account_id: &str,
        _since: Option<DateTime<Utc>>,
    ) -> Result<AccountActivity> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().unwrap().take();
        if let Some((entered, release)) = gate {
            entered.notify_one();
            release.notified().await;
        }
        if let Some(failure) = self.fetch_failures.lock().unwrap().pop_front() {
            return Err(Self::as_error(failure));
        }
        Ok(self.activity.lock().unwrap().clone())
    }

    async fn revoke(&self, _token: &AccessToken) -> Result<()> {
        self.revoke_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Ledger that can be switched off to simulate an unreachable expense service.
struct FlakyLedger {
    inner: InMemoryExpenseLedger,
    down: AtomicBool,
}

impl FlakyLedger {
    fn check(&self) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(Error::ledger("expense service unreachable"));
        }
        Ok(())
    }
}

#[async_trait]
impl ExpenseLedger for FlakyLedger {
    async fn find_candidates(&self, query: &ExpenseQuery) -> Result<Vec<ExpenseRecord>> {
        self.check()?;
        self.inner.find_candidates(query).await
    }

    async fn get_expense(&self, expense_id: &str) -> Result<Option<ExpenseRecord>> {
        self.check()?;
        self.inner.get_expense(expense_id).await
    }

    async fn record_expense(&self, expense: NewExpense) -> Result<ExpenseRecord> {
        self.check()?;
        self.inner.record_expense(expense).await
    }
}

/// Repository whose next save can be held open by the test.
struct GatedRepository {
    inner: SecureStoreRepository,
    saved_intervals: StdMutex<Vec<u32>>,
    gate: StdMutex<Option<(Arc<Notify>, Arc<Notify>)>>,
}

impl GatedRepository {
    fn new(store: Arc<InMemorySecureStore>) -> Self {
        Self {
            inner: SecureStoreRepository::new(store),
            saved_intervals: StdMutex::new(Vec::new()),
            gate: StdMutex::new(None),
        }
    }

    fn hold_next_save(&self) -> (Arc<Notify>, Arc<Notify>) {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some((entered.clone(), release.clone()));
        (entered, release)
    }
}

#[async_trait]
impl EngineRepository for GatedRepository {
    async fn load(&self) -> Result<EngineSnapshot> {
        self.inner.load().await
    }

    async fn save(&self, snapshot: &EngineSnapshot) -> Result<()> {
        let gate = self.gate.lock().unwrap().take();
        if let Some((entered, release)) = gate {
            entered.notify_one();
            release.notified().await;
        }
        self.saved_intervals
            .lock()
            .unwrap()
            .push(snapshot.sync_config.sync_interval_minutes);
        self.inner.save(snapshot).await
    }
}

struct Harness {
    engine: Arc<BankingEngine>,
    provider: Arc<ScriptedProvider>,
    ledger: Arc<FlakyLedger>,
    auth: Arc<StoreBackedAuthenticator>,
    store: Arc<InMemorySecureStore>,
    clock: Arc<ManualClock>,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(InMemorySecureStore::new());
        Self::with_store(store)
    }

    fn with_store(store: Arc<InMemorySecureStore>) -> Self {
        let provider = Arc::new(ScriptedProvider::new());
        let ledger = Arc::new(FlakyLedger {
            inner: InMemoryExpenseLedger::new(),
            down: AtomicBool::new(false),
        });
        let auth = Arc::new(StoreBackedAuthenticator::new(store.clone()));
        auth.sign_in();
        let clock = Arc::new(ManualClock::new(start_time()));
        let engine = BankingEngine::new(
            provider.clone(),
            auth.clone(),
            ledger.clone(),
            Arc::new(SecureStoreRepository::new(store.clone())),
        )
        .with_clock(clock.clone());
        Self {
            engine: Arc::new(engine),
            provider,
            ledger,
            auth,
            store,
            clock,
        }
    }

    fn expense(&self, id: &str, description: &str, amount: rust_decimal::Decimal, date: NaiveDate) {
        self.ledger
            .inner
            .insert(ExpenseRecord {
                id: id.into(),
                amount,
                date,
                description: description.into(),
                merchant: None,
                category: None,
            })
            .unwrap();
    }

    /// Makes the provider report a pending copy of the Starbucks row.
    fn add_pending_copy(&self) {
        let mut activity = self.provider.activity.lock().unwrap();
        let mut pending_copy = starbucks();
        pending_copy.provider_transaction_id = "txn-starbucks-pending".into();
        pending_copy.description = "STARBUCKS PENDING".into();
        activity.transactions.push(pending_copy);
    }

    async fn connect(&self) -> (BankConnection, Vec<BankAccount>) {
        self.engine.connect_account(credentials()).await.unwrap()
    }

    async fn only_transaction(&self) -> BankTransaction {
        let transactions = self.engine.transactions().await;
        assert_eq!(transactions.len(), 1);
        transactions[0].clone()
    }

    async fn completed_sync(&self) -> crate::sync::SyncCycleResult {
        match self.engine.sync_all_accounts().await {
            SyncOutcome::Completed(result) => result,
            SyncOutcome::Skipped(reason) => panic!("sync skipped: {:?}", reason),
        }
    }
}

async fn unread_auth_alerts(engine: &BankingEngine) -> usize {
    engine
        .get_unread_alerts()
        .await
        .into_iter()
        .filter(|a| a.alert_type == AlertType::AuthRequired)
        .count()
}

fn credentials() -> ConnectCredentials {
    ConnectCredentials {
        institution_id: "demo-bank".into(),
        institution_name: "Demo Bank".into(),
        provider: ProviderKind::Sandbox,
        username: "demo".into(),
        secret: "demo-password".into(),
    }
}

#[tokio::test]
async fn connect_links_accounts_and_runs_initial_ingestion() {
    let h = Harness::new();
    let (connection, accounts) = h.connect().await;

    assert_eq!(connection.status, ConnectionStatus::Connected);
    assert_eq!(connection.institution_name, "Demo Bank");
    assert_eq!(accounts.len(), 1);
    assert_eq!(accounts[0].account_type, AccountType::Checking);
    assert_eq!(accounts[0].balance, dec!(2500.00));
    assert!(accounts[0].is_active);
    assert!(accounts[0].last_sync_at.is_some());
    assert!(h.store.contains_key(&format!("bank_token_{}", connection.id)));

    let txn = h.only_transaction().await;
    assert_eq!(txn.amount, dec!(-25.99));
    assert_eq!(txn.reconciliation_status, ReconciliationStatus::Unmatched);
    assert_eq!(h.engine.sync_stats().await.new_transactions, 1);
}

#[tokio::test]
async fn concurrent_connects_for_one_institution_share_a_connection() {
    let h = Harness::new();
    let (first, second) = tokio::join!(
        h.engine.connect_account(credentials()),
        h.engine.connect_account(credentials())
    );
    let (first, _) = first.unwrap();
    let (second, _) = second.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(h.engine.connections().await.len(), 1);
    assert_eq!(h.engine.accounts().await.len(), 1);
    assert_eq!(h.provider.connect_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_handshake_stores_nothing() {
    let h = Harness::new();
    h.provider.fail_connect(Fetch::AuthFailed);
    h.provider.fail_connect(Fetch::Unavailable);

    let auth_err = h.engine.connect_account(credentials()).await.unwrap_err();
    assert!(matches!(auth_err, Error::AuthFailed(_)));
    let outage_err = h.engine.connect_account(credentials()).await.unwrap_err();
    assert!(matches!(outage_err, Error::ProviderUnavailable(_)));

    assert!(h.engine.connections().await.is_empty());
    assert!(h.engine.accounts().await.is_empty());
}

#[tokio::test]
async fn repeated_syncs_do_not_duplicate_transactions() {
    let h = Harness::new();
    h.connect().await;

    let first = h.completed_sync().await;
    h.clock.advance(Duration::minutes(30));
    let second = h.completed_sync().await;

    assert_eq!(first.new_transactions, 0);
    assert_eq!(second.duplicates_skipped, 1);
    assert_eq!(h.engine.transactions().await.len(), 1);
}

#[tokio::test]
async fn overlapping_trigger_is_a_no_op_and_mutations_are_queued() {
    let h = Harness::new();
    h.connect().await;
    let txn = h.only_transaction().await;
    let (entered, release) = h.provider.hold_next_fetch();

    let engine = h.engine.clone();
    let running = tokio::spawn(async move { engine.sync_all_accounts().await });
    entered.notified().await;

    assert!(h.engine.is_syncing());
    assert_eq!(
        h.engine.trigger_sync(SyncTrigger::Manual).await,
        SyncOutcome::Skipped(SkipReason::AlreadySyncing)
    );
    let ignored = h.engine.mark_transaction_as_ignored(&txn.id).await.unwrap();
    assert!(matches!(ignored, OperationOutcome::Queued { .. }));

    release.notify_one();
    let outcome = running.await.unwrap();
    let result = outcome.result().unwrap();
    assert_eq!(result.queue.completed, 1);
    assert!(!h.engine.is_syncing());
    assert_eq!(
        h.engine.transaction(&txn.id).await.unwrap().reconciliation_status,
        ReconciliationStatus::Ignored
    );
    assert_eq!(h.provider.fetches(), 2);
}

#[tokio::test]
async fn periodic_trigger_respects_minimum_interval() {
    let h = Harness::new();
    h.connect().await;
    h.completed_sync().await;

    h.clock.advance(Duration::minutes(2));
    assert_eq!(
        h.engine.trigger_sync(SyncTrigger::Periodic).await,
        SyncOutcome::Skipped(SkipReason::TooSoon)
    );
    assert!(!h.engine.trigger_sync(SyncTrigger::Manual).await.is_skipped());

    h.clock.advance(Duration::minutes(6));
    assert!(!h.engine.trigger_sync(SyncTrigger::Periodic).await.is_skipped());

    h.engine
        .update_sync_config(SyncConfigUpdate {
            auto_sync: Some(false),
            ..Default::default()
        })
        .await
        .unwrap();
    h.clock.advance(Duration::hours(2));
    assert_eq!(
        h.engine.trigger_sync(SyncTrigger::Periodic).await,
        SyncOutcome::Skipped(SkipReason::AutoSyncDisabled)
    );
}

#[tokio::test]
async fn returning_to_foreground_syncs_only_after_long_absence() {
    let h = Harness::new();
    h.connect().await;

    h.engine.handle_app_state_change(AppLifecycle::Background).await;
    h.clock.advance(Duration::minutes(5));
    assert!(h
        .engine
        .handle_app_state_change(AppLifecycle::Active)
        .await
        .is_none());

    h.engine.handle_app_state_change(AppLifecycle::Background).await;
    h.clock.advance(Duration::minutes(11));
    let outcome = h
        .engine
        .handle_app_state_change(AppLifecycle::Active)
        .await
        .unwrap();
    assert_eq!(outcome.result().unwrap().trigger, SyncTrigger::Foreground);
}

#[tokio::test]
async fn provider_outage_ends_in_one_sync_failed_alert() {
    let h = Harness::new();
    h.connect().await;
    h.provider.fail_fetches(|| Fetch::Unavailable, 4);

    // Attempt 1: the cycle itself.
    let result = h.completed_sync().await;
    assert_eq!(result.status, SyncCycleStatus::Partial);
    assert_eq!(result.accounts_failed, 1);
    assert_eq!(result.queue.processed, 0);
    assert_eq!(h.engine.sync_config().await.failed_attempts, 1);

    let items = h.engine.queue_items().await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].item_type, QueueItemType::Sync);
    let item_id = items[0].id.clone();

    // Attempt 2: first queued retry, rescheduled by delay * multiplier^1.
    let now = h.clock.now();
    assert_eq!(h.engine.drain_queue().await.rescheduled, 1);
    let item = h.engine.queue_items().await[0].clone();
    assert_eq!(item.retry_count, 1);
    assert_eq!(item.next_attempt_at, now + Duration::seconds(60));
    assert_eq!(h.engine.drain_queue().await.processed, 0);

    // Attempt 3: rescheduled by delay * multiplier^2.
    h.clock.advance(Duration::seconds(60));
    let now = h.clock.now();
    h.engine.drain_queue().await;
    let item = h.engine.queue_items().await[0].clone();
    assert_eq!(item.retry_count, 2);
    assert_eq!(item.next_attempt_at, now + Duration::seconds(120));

    // Attempt 4: retry budget spent.
    h.clock.advance(Duration::seconds(120));
    assert_eq!(h.engine.drain_queue().await.failed, 1);
    h.clock.advance(Duration::hours(1));
    h.engine.drain_queue().await;

    let item = h
        .engine
        .queue_items()
        .await
        .into_iter()
        .find(|i| i.id == item_id)
        .unwrap();
    assert_eq!(item.status, QueueItemStatus::Failed);
    assert_eq!(item.retry_count, 3);
    let sync_failed = h
        .engine
        .alerts()
        .await
        .into_iter()
        .filter(|a| a.alert_type == AlertType::SyncFailed)
        .count();
    assert_eq!(sync_failed, 1);
    assert_eq!(h.provider.fetches(), 5);

    // Finished items are purged once the retention window has passed.
    h.clock.advance(Duration::days(8));
    assert_eq!(h.engine.drain_queue().await.purged, 1);
    assert!(h.engine.queue_items().await.is_empty());
}

#[tokio::test]
async fn disconnect_deactivates_accounts_and_clears_the_token() {
    let h = Harness::new();
    let (connection, accounts) = h.connect().await;
    let fetches_before = h.provider.fetches();

    h.engine.disconnect_account(&accounts[0].id).await.unwrap();

    let conn = h.engine.connection(&connection.id).await.unwrap();
    assert_eq!(conn.status, ConnectionStatus::Disconnected);
    assert!(h.engine.accounts().await.iter().all(|a| !a.is_active));
    assert!(!h.store.contains_key(&format!("bank_token_{}", connection.id)));
    assert_eq!(h.provider.revoke_calls.load(Ordering::SeqCst), 1);

    let result = h.completed_sync().await;
    assert_eq!(result.accounts_synced, 0);
    assert_eq!(h.provider.fetches(), fetches_before);

    let summary = h.engine.get_account_summary().await;
    assert_eq!(summary.active_accounts, 0);
    assert!(summary.balances_by_currency.is_empty());
    assert_eq!(summary.unmatched_transactions, 0);

    h.engine.disconnect_account(&accounts[0].id).await.unwrap();
    assert_eq!(h.provider.revoke_calls.load(Ordering::SeqCst), 1);
    assert!(matches!(
        h.engine.disconnect_account("nope").await,
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        h.engine.sync_account(&accounts[0].id).await,
        Err(Error::InvalidState(_))
    ));
}

#[tokio::test]
async fn exact_same_day_expense_is_matched_automatically() {
    let h = Harness::new();
    h.connect().await;
    h.expense("exp-coffee", "Coffee", dec!(25.99), txn_date());

    let result = h.completed_sync().await;
    assert_eq!(result.auto_matched, 1);

    let txn = h.only_transaction().await;
    assert_eq!(txn.reconciliation_status, ReconciliationStatus::Matched);
    assert_eq!(txn.expense_id.as_deref(), Some("exp-coffee"));
    assert!(txn.confidence.unwrap() >= dec!(0.8));
    assert!(txn.is_consistent());
    assert_eq!(h.engine.sync_stats().await.matched_transactions, 1);
}

#[tokio::test]
async fn weaker_candidate_is_kept_as_a_suggestion() {
    let h = Harness::new();
    h.connect().await;
    h.expense(
        "exp-coffee",
        "Coffee",
        dec!(25.99),
        txn_date() + Duration::days(1),
    );

    h.completed_sync().await;

    let txn = h.only_transaction().await;
    assert!(txn.is_unmatched());
    let state = h.engine.reconciliation_state().await;
    let suggestions = &state.pending_matches[&txn.id];
    assert_eq!(suggestions[0].expense_id, "exp-coffee");
    assert_eq!(suggestions[0].confidence, dec!(0.725));
    assert_eq!(h.engine.get_account_summary().await.pending_matches, 1);

    let fresh = h.engine.suggest_matches(&txn.id).await.unwrap();
    assert_eq!(fresh, *suggestions);

    h.ledger.down.store(true, Ordering::SeqCst);
    let cached = h.engine.suggest_matches(&txn.id).await.unwrap();
    assert_eq!(cached, *suggestions);
}

#[tokio::test]
async fn reconciling_without_an_expense_records_one() {
    let h = Harness::new();
    h.connect().await;
    let txn = h.only_transaction().await;

    let outcome = h.engine.reconcile_transaction(&txn.id, None).await.unwrap();
    assert_eq!(outcome, OperationOutcome::Applied);
    let updated = h.engine.transaction(&txn.id).await.unwrap();
    assert_eq!(updated.reconciliation_status, ReconciliationStatus::Manual);
    assert!(updated.expense_id.is_some());
    assert!(updated.is_consistent());
    assert_eq!(h.ledger.inner.len(), 1);

    h.engine.reconcile_transaction(&txn.id, None).await.unwrap();
    assert_eq!(h.ledger.inner.len(), 1);

    assert!(matches!(
        h.engine.reconcile_transaction("missing", None).await,
        Err(Error::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn reconcile_is_queued_while_the_ledger_is_down() {
    let h = Harness::new();
    h.connect().await;
    let txn = h.only_transaction().await;
    h.expense("exp-coffee", "Coffee", dec!(25.99), txn_date());
    h.ledger.down.store(true, Ordering::SeqCst);

    let outcome = h
        .engine
        .reconcile_transaction(&txn.id, Some("exp-coffee"))
        .await
        .unwrap();
    assert!(matches!(outcome, OperationOutcome::Queued { .. }));
    assert!(h.only_transaction().await.is_unmatched());

    h.ledger.down.store(false, Ordering::SeqCst);
    assert_eq!(h.engine.drain_queue().await.completed, 1);
    let updated = h.only_transaction().await;
    assert_eq!(updated.reconciliation_status, ReconciliationStatus::Matched);
    assert_eq!(updated.confidence, None);
}

#[tokio::test]
async fn mismatched_manual_link_raises_conflicts_until_unlinked() {
    let h = Harness::new();
    h.connect().await;
    let txn = h.only_transaction().await;
    h.expense(
        "exp-far",
        "Coffee beans",
        dec!(30.00),
        txn_date() + Duration::days(5),
    );

    h.engine
        .reconcile_transaction(&txn.id, Some("exp-far"))
        .await
        .unwrap();
    let linked = h.only_transaction().await;
    assert_eq!(linked.reconciliation_status, ReconciliationStatus::Matched);
    assert_eq!(linked.confidence, None);

    let conflicts = h.engine.reconciliation_state().await.conflicts_to_resolve;
    let kinds: Vec<_> = conflicts.iter().map(|c| c.kind).collect();
    assert_eq!(
        kinds,
        vec![ConflictKind::AmountMismatch, ConflictKind::DateMismatch]
    );

    h.engine
        .resolve_conflict(&conflicts[0].id, ConflictResolution::Unlink)
        .await
        .unwrap();
    let unlinked = h.only_transaction().await;
    assert!(unlinked.is_unmatched());
    assert_eq!(unlinked.expense_id, None);
    assert_eq!(
        h.engine
            .reconciliation_state()
            .await
            .conflicts_to_resolve
            .len(),
        1
    );
    assert!(matches!(
        h.engine
            .resolve_conflict("missing", ConflictResolution::Dismiss)
            .await,
        Err(Error::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn duplicates_are_flagged_once_and_stay_dismissed() {
    let h = Harness::new();
    h.add_pending_copy();
    h.connect().await;

    let conflicts = h.engine.reconciliation_state().await.conflicts_to_resolve;
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].kind, ConflictKind::Duplicate);
    assert!(h
        .engine
        .get_unread_alerts()
        .await
        .iter()
        .any(|a| a.alert_type == AlertType::DuplicateDetected && a.action_required));

    h.clock.advance(Duration::minutes(30));
    h.completed_sync().await;
    assert_eq!(
        h.engine.reconciliation_state().await.conflicts_to_resolve.len(),
        1
    );

    h.engine
        .resolve_conflict(&conflicts[0].id, ConflictResolution::Dismiss)
        .await
        .unwrap();
    h.clock.advance(Duration::minutes(30));
    h.completed_sync().await;
    assert!(h
        .engine
        .reconciliation_state()
        .await
        .conflicts_to_resolve
        .is_empty());
}

#[tokio::test]
async fn ignored_transactions_are_never_matched() {
    let h = Harness::new();
    h.connect().await;
    let txn = h.only_transaction().await;

    assert_eq!(
        h.engine.mark_transaction_as_ignored(&txn.id).await.unwrap(),
        OperationOutcome::Applied
    );
    h.expense("exp-coffee", "Coffee", dec!(25.99), txn_date());
    h.completed_sync().await;

    let after = h.only_transaction().await;
    assert_eq!(after.reconciliation_status, ReconciliationStatus::Ignored);
    assert_eq!(after.expense_id, None);
    assert_eq!(h.engine.get_account_summary().await.unmatched_transactions, 0);
}

#[tokio::test]
async fn auth_failure_moves_connection_to_reauth_required() {
    let h = Harness::new();
    let (connection, _) = h.connect().await;
    h.provider.fail_fetches(|| Fetch::AuthFailed, 1);

    let result = h.completed_sync().await;
    assert_eq!(result.status, SyncCycleStatus::Partial);
    let conn = h.engine.connection(&connection.id).await.unwrap();
    assert_eq!(conn.status, ConnectionStatus::ReauthRequired);
    assert!(h.engine.queue_items().await.is_empty());

    assert_eq!(unread_auth_alerts(&h.engine).await, 1);

    let fetches = h.provider.fetches();
    h.clock.advance(Duration::minutes(30));
    h.completed_sync().await;
    assert_eq!(h.provider.fetches(), fetches);
    assert_eq!(unread_auth_alerts(&h.engine).await, 1);
    assert_eq!(
        h.engine
            .get_account_summary()
            .await
            .connections_needing_attention,
        1
    );

    let reconnected = h
        .engine
        .reauthenticate_connection(&connection.id, credentials())
        .await
        .unwrap();
    assert_eq!(reconnected.status, ConnectionStatus::Connected);
    assert_eq!(unread_auth_alerts(&h.engine).await, 0);
    assert_eq!(h.provider.fetches(), fetches + 1);

    assert!(matches!(
        h.engine
            .reauthenticate_connection(&connection.id, credentials())
            .await,
        Err(Error::InvalidState(_))
    ));
}

#[tokio::test]
async fn failed_reauthentication_leaves_connection_in_error() {
    let h = Harness::new();
    let (connection, _) = h.connect().await;
    h.auth.clear_token(&connection.id).await.unwrap();
    assert!(!h.engine.validate_connection(&connection.id).await.unwrap());

    h.provider.fail_connect(Fetch::AuthFailed);
    let err = h
        .engine
        .reauthenticate_connection(&connection.id, credentials())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AuthFailed(_)));
    let conn = h.engine.connection(&connection.id).await.unwrap();
    assert_eq!(conn.status, ConnectionStatus::Error);
    assert!(conn.last_error.is_some());
}

#[tokio::test]
async fn missing_token_moves_connection_to_error() {
    let h = Harness::new();
    let (connection, _) = h.connect().await;
    h.auth.clear_token(&connection.id).await.unwrap();

    assert!(!h.engine.validate_connection(&connection.id).await.unwrap());
    let conn = h.engine.connection(&connection.id).await.unwrap();
    assert_eq!(conn.status, ConnectionStatus::Error);
    assert!(matches!(
        h.engine.validate_connection("unknown").await,
        Err(Error::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn expired_token_requires_reauth_with_one_alert() {
    let h = Harness::new();
    let (connection, _) = h.connect().await;
    h.auth
        .set_token(
            &connection.id,
            AccessToken::new("old").with_expiry(h.clock.now() - Duration::minutes(1)),
        )
        .await
        .unwrap();

    assert!(!h.engine.validate_connection(&connection.id).await.unwrap());
    assert!(!h.engine.validate_connection(&connection.id).await.unwrap());
    let conn = h.engine.connection(&connection.id).await.unwrap();
    assert_eq!(conn.status, ConnectionStatus::ReauthRequired);
    let alerts: Vec<_> = h
        .engine
        .get_unread_alerts()
        .await
        .into_iter()
        .filter(|a| a.alert_type == AlertType::AuthRequired)
        .collect();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].title, "Reconnect Demo Bank");
}

#[tokio::test]
async fn signed_out_session_stops_the_cycle() {
    let h = Harness::new();
    h.connect().await;
    h.auth.sign_out();
    let fetches = h.provider.fetches();

    let result = h.completed_sync().await;
    assert_eq!(result.status, SyncCycleStatus::NotAuthenticated);
    assert_eq!(h.provider.fetches(), fetches);
    assert!(h
        .engine
        .get_unread_alerts()
        .await
        .iter()
        .any(|a| a.title == "Sign in required"));
}

#[tokio::test]
async fn cycle_failure_is_queued_and_retried() {
    let h = Harness::new();
    h.connect().await;
    h.ledger.down.store(true, Ordering::SeqCst);

    let result = h.completed_sync().await;
    assert_eq!(result.status, SyncCycleStatus::Failed);
    assert!(result.error.is_some());
    let items = h.engine.queue_items().await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].item_type, QueueItemType::Sync);
    assert_eq!(items[0].payload["accountId"], serde_json::Value::Null);
    assert_eq!(items[0].status, QueueItemStatus::Pending);

    h.ledger.down.store(false, Ordering::SeqCst);
    assert_eq!(h.engine.drain_queue().await.completed, 1);
    assert_eq!(h.engine.sync_stats().await.successful_syncs, 0);
}

#[tokio::test]
async fn restore_keeps_persisted_subset() {
    let store = Arc::new(InMemorySecureStore::new());
    let h = Harness::with_store(store.clone());
    h.connect().await;
    {
        let mut state = h.engine.state.lock().await;
        for i in 0..12 {
            state
                .alerts
                .add_alert(AlertType::NewTransactions, format!("batch {}", i), "", start_time());
        }
        let item = state
            .queue
            .enqueue(
                &QueueOperation::Sync {
                    account_id: Some("acc".into()),
                },
                start_time(),
            )
            .unwrap();
        state.queue.begin(&item);
    }
    h.engine.persist().await.unwrap();

    let restored = Harness::with_store(store);
    restored.engine.restore().await.unwrap();
    assert_eq!(restored.engine.connections().await.len(), 1);
    assert_eq!(restored.engine.transactions().await.len(), 1);
    let alerts = restored.engine.alerts().await;
    assert_eq!(alerts.len(), 10);
    assert_eq!(alerts[0].title, "batch 11");
    let queue = restored.engine.queue_items().await;
    assert_eq!(queue[0].status, QueueItemStatus::Pending);
    assert!(!restored.engine.is_syncing());
}

#[tokio::test]
async fn sync_config_updates_are_validated() {
    let h = Harness::new();
    assert!(matches!(
        h.engine
            .update_sync_config(SyncConfigUpdate {
                sync_interval_minutes: Some(1),
                ..Default::default()
            })
            .await,
        Err(Error::InvalidArgument(_))
    ));
    let config = h
        .engine
        .update_sync_config(SyncConfigUpdate {
            max_retries: Some(5),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(config.max_retries, 5);
    assert_eq!(h.engine.sync_config().await.max_retries, 5);
}

#[tokio::test]
async fn summary_sums_balances_per_currency() {
    let h = Harness::new();
    h.connect().await;
    let summary = h.engine.get_account_summary().await;
    assert_eq!(summary.active_accounts, 1);
    assert_eq!(summary.connected_institutions, 1);
    assert_eq!(summary.balances_by_currency["USD"], dec!(2500.00));
    assert_eq!(summary.unmatched_transactions, 1);
}

#[tokio::test]
async fn account_sync_is_scoped_to_one_account() {
    let h = Harness::new();
    let (_, accounts) = h.connect().await;
    h.clock.advance(Duration::minutes(1));

    let outcome = h.engine.sync_account(&accounts[0].id).await.unwrap();
    let result = outcome.result().expect("account sync runs");
    assert_eq!(result.trigger, SyncTrigger::Manual);
    assert_eq!(result.accounts_synced, 1);
    assert_eq!(result.new_transactions, 0);
    assert_eq!(result.duplicates_skipped, 1);

    assert!(matches!(
        h.engine.sync_account("missing").await,
        Err(Error::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn alerts_can_be_read_and_cleared() {
    let h = Harness::new();
    h.auth.sign_out();
    h.completed_sync().await;

    let unread = h.engine.get_unread_alerts().await;
    assert_eq!(unread.len(), 1);
    h.engine.mark_alert_as_read(&unread[0].id).await.unwrap();
    assert!(h.engine.get_unread_alerts().await.is_empty());
    assert_eq!(h.engine.alerts().await.len(), 1);
    assert!(matches!(
        h.engine.mark_alert_as_read("missing").await,
        Err(Error::InvalidArgument(_))
    ));

    h.engine.clear_alerts().await;
    assert!(h.engine.alerts().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn scheduler_runs_periodic_cycles_until_stopped() {
    let h = Harness::new();
    h.connect().await;
    let syncs_before = h.engine.sync_stats().await.total_syncs;
    h.clock.advance(Duration::minutes(61));

    let scheduler = crate::sync::SyncScheduler::new();
    scheduler.start(h.engine.clone()).await;
    scheduler.start(h.engine.clone()).await;
    assert!(scheduler.is_running().await);

    tokio::time::sleep(std::time::Duration::from_secs(61 * 60)).await;
    assert_eq!(h.engine.sync_stats().await.total_syncs, syncs_before + 1);

    scheduler.stop().await;
    assert!(!scheduler.is_running().await);
}

fn interval_update(minutes: u32) -> SyncConfigUpdate {
    SyncConfigUpdate {
        sync_interval_minutes: Some(minutes),
        ..Default::default()
    }
}

#[tokio::test]
async fn concurrent_saves_land_in_mutation_order() {
    let store = Arc::new(InMemorySecureStore::new());
    let repo = Arc::new(GatedRepository::new(store.clone()));
    let engine = Arc::new(BankingEngine::new(
        Arc::new(ScriptedProvider::new()),
        Arc::new(StoreBackedAuthenticator::new(store)),
        Arc::new(InMemoryExpenseLedger::new()),
        repo.clone(),
    ));

    let (entered, release) = repo.hold_next_save();
    let first = tokio::spawn({
        let engine = engine.clone();
        async move { engine.update_sync_config(interval_update(30)).await }
    });
    entered.notified().await;

    let second = tokio::spawn({
        let engine = engine.clone();
        async move { engine.update_sync_config(interval_update(45)).await }
    });
    while engine.sync_config().await.sync_interval_minutes != 45 {
        tokio::task::yield_now().await;
    }

    release.notify_one();
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    assert_eq!(*repo.saved_intervals.lock().unwrap(), vec![30, 45]);
    let saved = repo.inner.load().await.unwrap();
    assert_eq!(saved.sync_config.sync_interval_minutes, 45);
}

#[tokio::test]
async fn draining_a_queued_cycle_holds_off_other_syncs() {
    let h = Harness::new();
    h.connect().await;
    h.ledger.down.store(true, Ordering::SeqCst);
    assert_eq!(h.completed_sync().await.status, SyncCycleStatus::Failed);
    h.ledger.down.store(false, Ordering::SeqCst);
    let fetches = h.provider.fetches();
    let (entered, release) = h.provider.hold_next_fetch();

    let engine = h.engine.clone();
    let draining = tokio::spawn(async move { engine.drain_queue().await });
    entered.notified().await;

    assert!(h.engine.is_syncing());
    assert_eq!(
        h.engine.trigger_sync(SyncTrigger::Manual).await,
        SyncOutcome::Skipped(SkipReason::AlreadySyncing)
    );
    assert_eq!(h.engine.drain_queue().await.processed, 0);

    release.notify_one();
    assert_eq!(draining.await.unwrap().completed, 1);
    assert!(!h.engine.is_syncing());
    assert_eq!(h.provider.fetches(), fetches + 1);
}

#[tokio::test]
async fn candidate_just_under_the_threshold_is_only_suggested() {
    let h = Harness::new();
    h.connect().await;
    // 0.5 * (1 - 0.05 / 2.599) + 0.3
    h.expense("exp-close", "Coffee", dec!(25.94), txn_date());

    let result = h.completed_sync().await;
    assert_eq!(result.auto_matched, 0);

    let txn = h.only_transaction().await;
    assert!(txn.is_unmatched());
    assert_eq!(txn.expense_id, None);
    let state = h.engine.reconciliation_state().await;
    let best = &state.pending_matches[&txn.id][0];
    assert_eq!(best.expense_id, "exp-close");
    assert_eq!(best.confidence, dec!(0.7904));
    assert!(best.confidence < state.auto_match_threshold);
}

#[tokio::test]
async fn manual_sync_counts_accounts_fetched_by_queued_retries() {
    let h = Harness::new();
    h.connect().await;
    h.provider.fail_fetches(|| Fetch::Unavailable, 1);
    assert_eq!(h.completed_sync().await.accounts_failed, 1);
    let fetches = h.provider.fetches();

    let result = h.completed_sync().await;
    assert_eq!(result.status, SyncCycleStatus::Ok);
    assert_eq!(result.queue.completed, 1);
    assert_eq!(result.queue.accounts_synced, 1);
    assert_eq!(result.accounts_synced, 1);
    assert_eq!(h.provider.fetches(), fetches + 1);
}

#[tokio::test(start_paused = true)]
async fn stopping_the_scheduler_lets_a_running_cycle_finish() {
    let h = Harness::new();
    h.connect().await;
    let syncs_before = h.engine.sync_stats().await.total_syncs;
    h.clock.advance(Duration::minutes(61));
    let (entered, release) = h.provider.hold_next_fetch();

    let scheduler = Arc::new(crate::sync::SyncScheduler::new());
    scheduler.start(h.engine.clone()).await;
    entered.notified().await;

    let stopping = tokio::spawn({
        let scheduler = scheduler.clone();
        async move { scheduler.stop().await }
    });
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(!stopping.is_finished());
    assert!(h.engine.is_syncing());

    release.notify_one();
    stopping.await.unwrap();
    assert!(!h.engine.is_syncing());
    assert_eq!(h.engine.sync_stats().await.total_syncs, syncs_before + 1);
    assert!(!scheduler.is_running().await);
}

#[tokio::test]
async fn dismissals_are_dropped_once_the_account_is_disconnected() {
    let h = Harness::new();
    h.add_pending_copy();
    let (_, accounts) = h.connect().await;
    let conflicts = h.engine.reconciliation_state().await.conflicts_to_resolve;
    h.engine
        .resolve_conflict(&conflicts[0].id, ConflictResolution::Dismiss)
        .await
        .unwrap();
    assert_eq!(h.engine.reconciliation_state().await.acknowledged.len(), 1);

    h.clock.advance(Duration::minutes(30));
    h.completed_sync().await;
    assert_eq!(h.engine.reconciliation_state().await.acknowledged.len(), 1);

    h.engine.disconnect_account(&accounts[0].id).await.unwrap();
    h.completed_sync().await;
    let state = h.engine.reconciliation_state().await;
    assert!(state.acknowledged.is_empty());
    assert!(state.conflicts_to_resolve.is_empty());
}

#[tokio::test]
async fn ignoring_a_flagged_duplicate_settles_its_conflict() {
    let h = Harness::new();
    h.add_pending_copy();
    h.connect().await;
    let conflict = h.engine.reconciliation_state().await.conflicts_to_resolve[0].clone();

    h.engine
        .mark_transaction_as_ignored(&conflict.transaction_id)
        .await
        .unwrap();

    let state = h.engine.reconciliation_state().await;
    assert!(state.conflicts_to_resolve.is_empty());
    assert!(state.acknowledged.is_empty());
    assert_eq!(
        h.engine
            .transaction(&conflict.transaction_id)
            .await
            .unwrap()
            .reconciliation_status,
        ReconciliationStatus::Ignored
    );
    assert!(matches!(
        h.engine.resolve_conflict(&conflict.id, ConflictResolution::Dismiss).await,
        Err(Error::InvalidArgument(_))
    ));

    h.clock.advance(Duration::minutes(30));
    h.completed_sync().await;
    assert!(h
        .engine
        .reconciliation_state()
        .await
        .conflicts_to_resolve
        .is_empty());
}
