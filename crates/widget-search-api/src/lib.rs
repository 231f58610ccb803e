use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use widget_search_core::{FilterPolicy, NewWidget, Widget, WidgetFilter};
use widget_search_store_sqlite::{SchemaStatus, SeedSummary, SqliteStore};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchRequest {
    pub term: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FilterSearchRequest {
    pub term: String,
    pub filter: String,
}

/// Bounds stay raw text until [`WidgetFilter::price_range`] validates them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PriceRangeSearchRequest {
    pub term: String,
    #[serde(rename = "min-price")]
    pub min_price: String,
    #[serde(rename = "max-price")]
    pub max_price: String,
}

#[derive(Debug, Clone)]
pub struct WidgetSearchApi {
    db_path: PathBuf,
    filter: WidgetFilter,
}

impl WidgetSearchApi {
    /// # Errors
    /// Returns an error when the built-in filter patterns fail to compile.
    pub fn new(db_path: PathBuf) -> Result<Self> {
        let filter = WidgetFilter::new().context("failed to compile widget filter patterns")?;
        Ok(Self { db_path, filter })
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn open_migrated_store(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Seed the demo catalogue into an empty database.
    ///
    /// # Errors
    /// Returns an error when migration or seeding fails.
    pub fn seed_fixtures(&self) -> Result<SeedSummary> {
        let mut store = self.open_migrated_store()?;
        store.seed_fixtures()
    }

    /// Add one widget.
    ///
    /// # Errors
    /// Returns an error when the widget is invalid or persistence fails.
    pub fn add_widget(&self, widget: NewWidget) -> Result<Widget> {
        let mut store = self.open_migrated_store()?;
        store.insert_widget(widget)
    }

    /// # Errors
    /// Returns an error when the widgets cannot be read.
    pub fn list_widgets(&self) -> Result<Vec<Widget>> {
        self.open_migrated_store()?.list_widgets()
    }

    /// Plain lookup by name substring. No caller-supplied expression is involved.
    ///
    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn search(&self, request: &SearchRequest) -> Result<Vec<Widget>> {
        self.open_migrated_store()?.find_by_name_containing(&request.term)
    }

    /// Filter with full evaluation capability. Process execution is reachable from the filter.
    ///
    /// # Errors
    /// See [`Self::filtered_search`].
    pub fn unsafe_search(&self, request: &FilterSearchRequest) -> Result<Vec<Widget>> {
        self.filtered_search(FilterPolicy::Unsafe, request)
    }

    /// Filter with read-only property access. The fragment can still escape its predicate.
    ///
    /// # Errors
    /// See [`Self::filtered_search`].
    pub fn safer_search(&self, request: &FilterSearchRequest) -> Result<Vec<Widget>> {
        self.filtered_search(FilterPolicy::Safer, request)
    }

    /// Filter with read-only property access behind the character allow-list.
    ///
    /// # Errors
    /// See [`Self::filtered_search`].
    pub fn safest_search(&self, request: &FilterSearchRequest) -> Result<Vec<Widget>> {
        self.filtered_search(FilterPolicy::Safest, request)
    }

    /// Look up candidates by `term` and keep those the filter fragment selects under `policy`.
    ///
    /// # Errors
    /// Returns a [`widget_search_core::FilterError`] (recoverable with `downcast_ref`) when
    /// the fragment is rejected or fails evaluation, or a storage error when the lookup fails.
    pub fn filtered_search(
        &self,
        policy: FilterPolicy,
        request: &FilterSearchRequest,
    ) -> Result<Vec<Widget>> {
        let candidates = self.open_migrated_store()?.find_by_name_containing(&request.term)?;
        tracing::debug!(
            policy = policy.as_str(),
            candidates = candidates.len(),
            capabilities = ?policy.evaluation_context().capabilities(),
            "evaluating filter"
        );

        match self.filter.apply(policy, &candidates, &request.filter) {
            Ok(widgets) => Ok(widgets),
            Err(err) => {
                tracing::warn!(
                    policy = policy.as_str(),
                    kind = err.kind(),
                    "filter rejected: {err}"
                );
                Err(err.into())
            }
        }
    }

    /// Parameterized price search: both bounds are validated as plain numbers before lookup.
    ///
    /// # Errors
    /// Returns a [`widget_search_core::FilterError::Validation`] for a non-numeric bound, or a
    /// storage error when the lookup fails.
    pub fn impermeable_search(&self, request: &PriceRangeSearchRequest) -> Result<Vec<Widget>> {
        let range = match self.filter.price_range(&request.min_price, &request.max_price) {
            Ok(range) => range,
            Err(err) => {
                tracing::warn!(
                    policy = "impermeable",
                    kind = err.kind(),
                    "price bounds rejected: {err}"
                );
                return Err(err.into());
            }
        };
        let candidates = self.open_migrated_store()?.find_by_name_containing(&request.term)?;
        Ok(range.apply(&candidates))
    }
}
