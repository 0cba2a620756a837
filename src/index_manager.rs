use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::cache::format_bytes;
use crate::database::{quote_identifier, DatabaseService, QueryOptions};
use crate::error::{DataError, DataResult};

const INDEX_USAGE_QUERY: &str = "\
SELECT i.indexrelname AS name,
       i.relname AS table_name,
       pg_relation_size(i.indexrelid) AS size_bytes,
       i.idx_scan AS index_scans,
       t.seq_scan AS sequential_scans,
       i.idx_tup_read AS tuples_read,
       i.idx_tup_fetch AS tuples_fetched,
       i.last_idx_scan AS last_used
FROM pg_stat_user_indexes i
JOIN pg_stat_user_tables t ON t.relid = i.relid";

/// Access method of an index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexType {
    Btree,
    Gin,
    Gist,
    Hash,
}

impl IndexType {
    pub fn as_sql(&self) -> &'static str {
        match self {
            IndexType::Btree => "btree",
            IndexType::Gin => "gin",
            IndexType::Gist => "gist",
            IndexType::Hash => "hash",
        }
    }
}

impl fmt::Display for IndexType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Descriptor of a named index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: String,
    pub table: String,
    /// Column names or expressions, in index order
    pub columns: Vec<String>,
    pub index_type: IndexType,
    pub is_unique: bool,
    /// Predicate of a partial index
    pub condition: Option<String>,
    pub comment: Option<String>,
}

impl IndexInfo {
    pub fn new<I, S>(name: impl Into<String>, table: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            table: table.into(),
            columns: columns.into_iter().map(Into::into).collect(),
            index_type: IndexType::Btree,
            is_unique: false,
            condition: None,
            comment: None,
        }
    }

    pub fn with_type(mut self, index_type: IndexType) -> Self {
        self.index_type = index_type;
        self
    }

    pub fn unique(mut self) -> Self {
        self.is_unique = true;
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn is_partial(&self) -> bool {
        self.condition.is_some()
    }

    /// `CREATE [UNIQUE] INDEX IF NOT EXISTS ...` for this descriptor
    pub fn create_statement(&self) -> DataResult<String> {
        if self.columns.is_empty() {
            return Err(DataError::database(format!("index {} has no columns", self.name)));
        }

        let mut statement = format!(
            "CREATE {}INDEX IF NOT EXISTS {} ON {} USING {} ({})",
            if self.is_unique { "UNIQUE " } else { "" },
            quote_identifier(&self.name)?,
            quote_identifier(&self.table)?,
            self.index_type.as_sql(),
            self.columns.join(", ")
        );
        if let Some(condition) = &self.condition {
            statement.push_str(" WHERE ");
            statement.push_str(condition);
        }
        Ok(statement)
    }
}

/// Derived usage figures for one index
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStats {
    pub name: String,
    pub table: String,
    /// Human readable size, e.g. `2.5 MB`
    pub size: String,
    pub size_bytes: u64,
    /// Share of scans on the table served by this index, 0-100
    pub usage: f64,
    pub last_used: Option<DateTime<Utc>>,
    /// Tuples fetched per tuple read, 0-1
    pub efficiency: f64,
}

/// Raw counters for one index as reported by the store
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct IndexUsageSample {
    pub name: String,
    pub table_name: String,
    pub size_bytes: u64,
    pub index_scans: u64,
    pub sequential_scans: u64,
    pub tuples_read: u64,
    pub tuples_fetched: u64,
    pub last_used: Option<DateTime<Utc>>,
}

impl IndexUsageSample {
    pub fn to_stats(&self) -> IndexStats {
        let scans = self.index_scans + self.sequential_scans;
        let usage = if scans == 0 {
            0.0
        } else {
            self.index_scans as f64 / scans as f64 * 100.0
        };
        let efficiency = if self.tuples_read == 0 {
            1.0
        } else {
            (self.tuples_fetched as f64 / self.tuples_read as f64).clamp(0.0, 1.0)
        };

        IndexStats {
            name: self.name.clone(),
            table: self.table_name.clone(),
            size: format_bytes(self.size_bytes),
            size_bytes: self.size_bytes,
            usage,
            last_used: self.last_used,
            efficiency,
        }
    }
}

/// A query shape the application is known to run, used to spot missing indexes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessPattern {
    /// Name the covering index should get
    pub suggested_index: String,
    pub table: String,
    /// Leading columns an index needs to serve the pattern
    pub columns: Vec<String>,
}

impl AccessPattern {
    pub fn new<I, S>(suggested_index: impl Into<String>, table: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            suggested_index: suggested_index.into(),
            table: table.into(),
            columns: columns.into_iter().map(Into::into).collect(),
        }
    }

    fn is_covered_by(&self, index: &IndexInfo) -> bool {
        if index.name == self.suggested_index {
            return true;
        }
        index.table == self.table
            && index.columns.len() >= self.columns.len()
            && self
                .columns
                .iter()
                .zip(&index.columns)
                .all(|(wanted, have)| wanted.eq_ignore_ascii_case(have))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizationRecommendations {
    pub unused: Vec<IndexStats>,
    pub inefficient: Vec<IndexStats>,
    pub missing: Vec<String>,
}

/// Result of the most recent analysis
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexAnalysis {
    pub analyzed_at: DateTime<Utc>,
    pub stats: Vec<IndexStats>,
}

/// Configuration for IndexManager
#[derive(Debug, Clone, PartialEq)]
pub struct IndexManagerConfig {
    /// Indexes below this usage percentage are reported unused
    pub unused_usage_threshold: f64,
    /// Indexes below this efficiency are reported inefficient
    pub inefficient_threshold: f64,
    /// Period of the background analysis; None disables it
    pub analysis_interval: Option<Duration>,
}

impl Default for IndexManagerConfig {
    fn default() -> Self {
        Self {
            unused_usage_threshold: 10.0,
            inefficient_threshold: 0.8,
            analysis_interval: None,
        }
    }
}

/// Registry of index descriptors plus usage analysis against the store.
pub struct IndexManager {
    db: Arc<DatabaseService>,
    indexes: RwLock<HashMap<String, IndexInfo>>,
    access_patterns: RwLock<Vec<AccessPattern>>,
    latest: RwLock<Option<IndexAnalysis>>,
    config: IndexManagerConfig,
}

impl IndexManager {
    pub fn new(db: Arc<DatabaseService>, config: IndexManagerConfig) -> Self {
        Self {
            db,
            indexes: RwLock::new(HashMap::new()),
            access_patterns: RwLock::new(Vec::new()),
            latest: RwLock::new(None),
            config,
        }
    }

    /// Seeds the registry without issuing DDL
    pub fn with_indexes(self, indexes: impl IntoIterator<Item = IndexInfo>) -> Self {
        self.indexes
            .write()
            .extend(indexes.into_iter().map(|index| (index.name.clone(), index)));
        self
    }

    pub fn with_access_patterns(self, patterns: impl IntoIterator<Item = AccessPattern>) -> Self {
        self.access_patterns.write().extend(patterns);
        self
    }

    pub fn get_all_indexes(&self) -> Vec<IndexInfo> {
        let mut indexes: Vec<IndexInfo> = self.indexes.read().values().cloned().collect();
        indexes.sort_by(|a, b| a.name.cmp(&b.name));
        indexes
    }

    pub fn get_index(&self, name: &str) -> Option<IndexInfo> {
        self.indexes.read().get(name).cloned()
    }

    pub fn get_indexes_for_table(&self, table: &str) -> Vec<IndexInfo> {
        let mut indexes: Vec<IndexInfo> = self
            .indexes
            .read()
            .values()
            .filter(|index| index.table == table)
            .cloned()
            .collect();
        indexes.sort_by(|a, b| a.name.cmp(&b.name));
        indexes
    }

    pub fn record_access_pattern(&self, pattern: AccessPattern) {
        self.access_patterns.write().push(pattern);
    }

    /// Reads index counters from the store and derives usage, efficiency and size
    pub async fn analyze_index_performance(&self) -> DataResult<Vec<IndexStats>> {
        info!("Analyzing index performance");

        let result = self
            .db
            .execute_query(INDEX_USAGE_QUERY, &[], QueryOptions::default())
            .await
            .map_err(|e| {
                error!("Failed to analyze index performance: {}", e);
                e
            })?;
        let samples: Vec<IndexUsageSample> = result.rows_as()?;

        let mut stats: Vec<IndexStats> = samples.iter().map(IndexUsageSample::to_stats).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));

        *self.latest.write() = Some(IndexAnalysis {
            analyzed_at: Utc::now(),
            stats: stats.clone(),
        });
        Ok(stats)
    }

    pub fn latest_analysis(&self) -> Option<IndexAnalysis> {
        self.latest.read().clone()
    }

    pub async fn get_unused_indexes(&self) -> DataResult<Vec<IndexStats>> {
        let stats = self.analyze_index_performance().await?;
        Ok(self.unused(&stats))
    }

    pub async fn get_inefficient_indexes(&self) -> DataResult<Vec<IndexStats>> {
        let stats = self.analyze_index_performance().await?;
        Ok(self.inefficient(&stats))
    }

    /// Unused and inefficient indexes from one analysis, plus suggested indexes
    pub async fn get_optimization_recommendations(&self) -> DataResult<OptimizationRecommendations> {
        let stats = self.analyze_index_performance().await?;
        Ok(OptimizationRecommendations {
            unused: self.unused(&stats),
            inefficient: self.inefficient(&stats),
            missing: self.missing_indexes(),
        })
    }

    /// Suggested index names for access patterns no registered index covers
    pub fn missing_indexes(&self) -> Vec<String> {
        let indexes = self.indexes.read();
        self.access_patterns
            .read()
            .iter()
            .filter(|pattern| !indexes.values().any(|index| pattern.is_covered_by(index)))
            .map(|pattern| pattern.suggested_index.clone())
            .collect()
    }

    pub async fn create_index(&self, index: IndexInfo) -> DataResult<()> {
        info!("Creating index: {}", index.name);
        let statement = index.create_statement()?;

        self.run_ddl(&statement, "create", &index.name).await?;
        info!("Index created successfully: {}", index.name);
        self.indexes.write().insert(index.name.clone(), index);
        Ok(())
    }

    pub async fn drop_index(&self, name: &str) -> DataResult<()> {
        info!("Dropping index: {}", name);
        let statement = format!("DROP INDEX IF EXISTS {}", quote_identifier(name)?);

        self.run_ddl(&statement, "drop", name).await?;
        self.indexes.write().remove(name);
        info!("Index dropped successfully: {}", name);
        Ok(())
    }

    pub async fn rebuild_index(&self, name: &str) -> DataResult<()> {
        if !self.indexes.read().contains_key(name) {
            return Err(DataError::database(format!(
                "Failed to rebuild index: {name}: not registered"
            )));
        }
        info!("Rebuilding index: {}", name);
        let statement = format!("REINDEX INDEX {}", quote_identifier(name)?);

        self.run_ddl(&statement, "rebuild", name).await?;
        info!("Index rebuilt successfully: {}", name);
        Ok(())
    }

    pub fn config(&self) -> &IndexManagerConfig {
        &self.config
    }

    /// Spawns periodic analysis if `analysis_interval` is set
    pub fn start_periodic_analysis(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let period = self.config.analysis_interval?;
        let manager = Arc::downgrade(self);

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                if let Err(e) = manager.analyze_index_performance().await {
                    warn!("Periodic index analysis failed: {}", e);
                }
            }
        }))
    }

    fn unused(&self, stats: &[IndexStats]) -> Vec<IndexStats> {
        stats
            .iter()
            .filter(|stat| stat.usage < self.config.unused_usage_threshold)
            .cloned()
            .collect()
    }

    fn inefficient(&self, stats: &[IndexStats]) -> Vec<IndexStats> {
        stats
            .iter()
            .filter(|stat| stat.efficiency < self.config.inefficient_threshold)
            .cloned()
            .collect()
    }

    async fn run_ddl(&self, statement: &str, action: &str, name: &str) -> DataResult<()> {
        self.db
            .execute_query(statement, &[], QueryOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| {
                error!("Failed to {} index {}: {}", action, name, e);
                match e {
                    DataError::Database { message } => {
                        DataError::database(format!("Failed to {action} index {name}: {message}"))
                    }
                    timeout => timeout,
                }
            })
    }
}

/// Indexes the word and quiz services rely on
pub fn default_indexes() -> Vec<IndexInfo> {
    vec![
        IndexInfo::new("idx_words_search", "words", ["LOWER(word)", "category", "difficulty"])
            .with_comment("Composite index for word search queries"),
        IndexInfo::new("idx_knowledge_items_approved", "knowledge_items", ["status", "created_at"])
            .with_condition("status = 'approved'")
            .with_comment("Partial index for approved content queries"),
        IndexInfo::new("idx_quiz_questions_active_difficulty", "quiz_questions", ["active", "difficulty"])
            .with_condition("active = true")
            .with_comment("Partial index for active quiz questions by difficulty"),
        IndexInfo::new(
            "idx_user_profiles_leaderboard",
            "user_profiles",
            ["total_points DESC", "level DESC", "current_streak DESC"],
        )
        .with_comment("Leaderboard ordering by points, level and streak"),
        IndexInfo::new(
            "idx_words_fulltext",
            "words",
            ["to_tsvector('dutch', word || ' ' || COALESCE(definition, '') || ' ' || COALESCE(example, ''))"],
        )
        .with_type(IndexType::Gin)
        .with_comment("Full-text search over Dutch words"),
    ]
}

/// Query shapes the word and quiz services run without a dedicated index
pub fn default_access_patterns() -> Vec<AccessPattern> {
    vec![
        AccessPattern::new("idx_user_activity_recent", "user_activity", ["user_id", "created_at"]),
        AccessPattern::new("idx_quiz_results_user_date", "quiz_results", ["user_id", "completed_at"]),
        AccessPattern::new("idx_notifications_user_unread", "notifications", ["user_id", "read"]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_and_efficiency() {
        let sample = IndexUsageSample {
            name: "idx_words_search".to_string(),
            table_name: "words".to_string(),
            size_bytes: 2_621_440,
            index_scans: 95,
            sequential_scans: 5,
            tuples_read: 1000,
            tuples_fetched: 980,
            last_used: None,
        };

        let stats = sample.to_stats();
        assert_eq!(stats.usage, 95.0);
        assert!((stats.efficiency - 0.98).abs() < 1e-9);
        assert_eq!(stats.size, "2.5 MB");
    }

    #[test]
    fn test_idle_index_stats() {
        let stats = IndexUsageSample {
            name: "idx_idle".to_string(),
            ..Default::default()
        }
        .to_stats();

        assert_eq!(stats.usage, 0.0);
        assert_eq!(stats.efficiency, 1.0);
        assert_eq!(stats.size, "0 B");
    }

    #[test]
    fn test_create_statement() {
        let index = IndexInfo::new("idx_quiz_active", "quiz_questions", ["active", "difficulty"])
            .unique()
            .with_condition("active = true");

        assert!(index.is_partial());
        assert_eq!(
            index.create_statement().unwrap(),
            "CREATE UNIQUE INDEX IF NOT EXISTS \"idx_quiz_active\" ON \"quiz_questions\" \
             USING btree (active, difficulty) WHERE active = true"
        );

        let fulltext = &default_indexes()[4];
        assert!(fulltext
            .create_statement()
            .unwrap()
            .contains("USING gin (to_tsvector('dutch'"));

        assert!(IndexInfo::new("bad name", "words", ["word"]).create_statement().is_err());
        assert!(IndexInfo::new("idx_empty", "words", Vec::<String>::new())
            .create_statement()
            .is_err());
    }

    #[test]
    fn test_access_pattern_coverage() {
        let pattern = AccessPattern::new("idx_quiz_results_user_date", "quiz_results", ["user_id", "completed_at"]);

        let covering = IndexInfo::new("idx_qr", "quiz_results", ["USER_ID", "completed_at", "score"]);
        let wrong_order = IndexInfo::new("idx_qr2", "quiz_results", ["completed_at", "user_id"]);
        let other_table = IndexInfo::new("idx_other", "quiz_answers", ["user_id", "completed_at"]);

        assert!(pattern.is_covered_by(&covering));
        assert!(!pattern.is_covered_by(&wrong_order));
        assert!(!pattern.is_covered_by(&other_table));
    }
}
