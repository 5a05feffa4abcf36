use crate::db::executor::Row;
use crate::db::schema::DatabaseSchema;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::LazyLock;
use tracing::debug;

static TABLE_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(?:from|join)\s+"?([a-z_][\w$]*)"?(?:\."?([a-z_][\w$]*)"?)?"#)
        .expect("valid table regex")
});

static JOIN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bjoin\b").expect("valid join regex"));

static FILTER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:where|and|or)\s+(?:[a-z_]\w*\.)?([a-z_]\w*)\s*(?:=|<>|!=|<=|>=|<|>|\bnot\b|\bi?like\b|\bin\b|\bbetween\b|\bis\b)",
    )
    .expect("valid filter regex")
});

static AGGREGATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(count|sum|avg|min|max)\s*\(\s*(?:distinct\s+)?(?:[a-z_]\w*\.)?([\w*]+)\s*\)")
        .expect("valid aggregation regex")
});

/// Prior query whose score must exceed this to be offered as context.
const MIN_RELEVANCE: f64 = 1.0;
const DECAY_WINDOW_SECS: f64 = 3600.0;
const PATTERN_LIMIT: usize = 3;

/// One recorded attempt at answering a question.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryContext {
    pub natural_query: String,
    pub generated_sql: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub referenced_tables: Vec<String>,
    pub success: bool,
    pub result_sample: Option<Vec<Row>>,
    pub error: Option<String>,
    pub intent: Option<String>,
    pub entities: Vec<String>,
}

impl QueryContext {
    pub fn success(natural_query: &str, sql: &str, sample: Vec<Row>) -> Self {
        Self {
            natural_query: natural_query.to_string(),
            generated_sql: Some(sql.to_string()),
            timestamp: Utc::now(),
            referenced_tables: extract_tables(sql),
            success: true,
            result_sample: Some(sample),
            error: None,
            intent: None,
            entities: Vec::new(),
        }
    }

    pub fn failure(natural_query: &str, sql: Option<&str>, error: &str) -> Self {
        Self {
            natural_query: natural_query.to_string(),
            generated_sql: sql.map(str::to_string),
            timestamp: Utc::now(),
            referenced_tables: sql.map(extract_tables).unwrap_or_default(),
            success: false,
            result_sample: None,
            error: Some(error.to_string()),
            intent: None,
            entities: Vec::new(),
        }
    }

    pub fn with_intent(mut self, intent: impl Into<String>) -> Self {
        self.intent = Some(intent.into());
        self
    }

    pub fn with_entities(mut self, entities: Vec<String>) -> Self {
        self.entities = entities;
        self
    }
}

/// Counts of how a table has been used by successful queries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TablePatterns {
    pub joins: BTreeMap<String, usize>,
    pub filters: BTreeMap<String, usize>,
    pub aggregations: BTreeMap<String, usize>,
}

impl TablePatterns {
    fn is_empty(&self) -> bool {
        self.joins.is_empty() && self.filters.is_empty() && self.aggregations.is_empty()
    }

    fn summary(&self, table: &str) -> String {
        let mut parts = Vec::new();
        if !self.joins.is_empty() {
            parts.push(format!("often joined with {}", top(&self.joins)));
        }
        if !self.filters.is_empty() {
            parts.push(format!("filtered on {}", top(&self.filters)));
        }
        if !self.aggregations.is_empty() {
            parts.push(format!("aggregated as {}", top(&self.aggregations)));
        }
        format!("Table {table}: {}", parts.join("; "))
    }
}

fn top(counts: &BTreeMap<String, usize>) -> String {
    let mut entries: Vec<(&String, &usize)> = counts.iter().collect();
    // stable sort keeps alphabetical order among equal counts
    entries.sort_by(|a, b| b.1.cmp(a.1));
    entries
        .into_iter()
        .take(PATTERN_LIMIT)
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Schema tables and columns a question mentions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetectedReferences {
    pub tables: BTreeSet<String>,
    pub columns: BTreeSet<String>,
}

/// Bounded, most-recent-first history for one session.
#[derive(Debug, Clone)]
pub struct ConversationContext {
    queries: VecDeque<QueryContext>,
    max_queries: usize,
    related_tables: BTreeSet<String>,
    related_columns: BTreeSet<String>,
    patterns: BTreeMap<String, TablePatterns>,
}

impl ConversationContext {
    pub fn new(max_queries: usize) -> Self {
        Self {
            queries: VecDeque::with_capacity(max_queries),
            max_queries: max_queries.max(1),
            related_tables: BTreeSet::new(),
            related_columns: BTreeSet::new(),
            patterns: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    /// Most recent first.
    pub fn queries(&self) -> impl Iterator<Item = &QueryContext> {
        self.queries.iter()
    }

    pub fn related_tables(&self) -> &BTreeSet<String> {
        &self.related_tables
    }

    pub fn related_columns(&self) -> &BTreeSet<String> {
        &self.related_columns
    }

    pub fn patterns(&self, table: &str) -> Option<&TablePatterns> {
        self.patterns.get(table)
    }

    pub fn clear(&mut self) {
        self.queries.clear();
        self.related_tables.clear();
        self.related_columns.clear();
        self.patterns.clear();
    }

    /// Records an attempt at the head; successful SQL also feeds the usage patterns.
    pub fn add_query(&mut self, query: QueryContext) {
        if query.success {
            if let Some(sql) = query.generated_sql.as_deref() {
                self.learn_patterns(sql, &query.referenced_tables);
            }
        }

        self.queries.push_front(query);
        while self.queries.len() > self.max_queries {
            self.queries.pop_back();
        }
    }

    fn learn_patterns(&mut self, sql: &str, tables: &[String]) {
        self.related_tables.extend(tables.iter().cloned());

        let filters: Vec<String> = FILTER
            .captures_iter(sql)
            .map(|c| c[1].to_lowercase())
            .collect();
        let aggregations: Vec<String> = AGGREGATION
            .captures_iter(sql)
            .map(|c| format!("{}({})", c[1].to_lowercase(), c[2].to_lowercase()))
            .collect();
        let joined = JOIN.is_match(sql) && tables.len() > 1;

        self.related_columns.extend(filters.iter().cloned());
        self.related_columns.extend(
            AGGREGATION
                .captures_iter(sql)
                .map(|c| c[2].to_lowercase())
                .filter(|c| c != "*"),
        );

        for table in tables {
            let patterns = self.patterns.entry(table.clone()).or_default();
            if joined {
                for other in tables.iter().filter(|t| *t != table) {
                    *patterns.joins.entry(other.clone()).or_default() += 1;
                }
            }
            for filter in &filters {
                *patterns.filters.entry(filter.clone()).or_default() += 1;
            }
            for aggregation in &aggregations {
                *patterns.aggregations.entry(aggregation.clone()).or_default() += 1;
            }
        }
    }

    pub fn get_query_context(
        &self,
        query: &str,
        detected: &DetectedReferences,
        entities: &[String],
    ) -> Option<String> {
        self.get_query_context_at(query, detected, entities, Utc::now())
    }

    /// Summary text for the prompts: the most relevant prior query followed
    /// by usage patterns of the tables this query touches.
    pub fn get_query_context_at(
        &self,
        query: &str,
        detected: &DetectedReferences,
        entities: &[String],
        now: DateTime<Utc>,
    ) -> Option<String> {
        let mut sections = Vec::new();

        let words = word_tokens(query);
        let tables: HashSet<String> = detected.tables.iter().cloned().collect();
        let mut best: Option<(&QueryContext, f64)> = None;
        for prior in &self.queries {
            let score = relevance_score(prior, &words, &tables, now);
            if best.is_none_or(|(_, best_score)| score > best_score) {
                best = Some((prior, score));
            }
        }

        if let Some((prior, score)) = best.filter(|(_, score)| *score > MIN_RELEVANCE) {
            debug!("Most relevant prior query scored {:.2}", score);
            sections.push(describe_prior(prior));
        }

        let summaries: Vec<String> = self
            .relevant_tables(detected, entities)
            .into_iter()
            .filter_map(|table| {
                self.patterns
                    .get(&table)
                    .filter(|p| !p.is_empty())
                    .map(|p| p.summary(&table))
            })
            .collect();
        if !summaries.is_empty() {
            sections.push(format!("Usage patterns:\n{}", summaries.join("\n")));
        }

        if sections.is_empty() {
            None
        } else {
            Some(sections.join("\n\n"))
        }
    }

    fn relevant_tables(&self, detected: &DetectedReferences, entities: &[String]) -> BTreeSet<String> {
        let mut tables = detected.tables.clone();
        for table in self.patterns.keys() {
            let by_entity = entities.iter().any(|e| name_forms(table).contains(&e.to_lowercase()));
            let by_column = self.patterns[table]
                .filters
                .keys()
                .any(|column| detected.columns.contains(column));
            if by_entity || by_column {
                tables.insert(table.clone());
            }
        }
        tables
    }
}

fn describe_prior(prior: &QueryContext) -> String {
    let mut text = format!("Previous related question: {}", prior.natural_query);
    if let Some(sql) = &prior.generated_sql {
        text.push_str(&format!("\nSQL used: {sql}"));
    }
    match (&prior.error, prior.success) {
        (_, true) => text.push_str("\nOutcome: succeeded"),
        (Some(error), false) => text.push_str(&format!("\nOutcome: failed ({error})")),
        (None, false) => text.push_str("\nOutcome: failed"),
    }
    text
}

/// +1 per shared word, +2 per shared table, x1.5 for success and
/// x(1 + decay) where decay falls linearly to zero over an hour.
pub fn relevance_score(
    prior: &QueryContext,
    words: &HashSet<String>,
    tables: &HashSet<String>,
    now: DateTime<Utc>,
) -> f64 {
    let shared_words = word_tokens(&prior.natural_query).intersection(words).count();
    let shared_tables = prior
        .referenced_tables
        .iter()
        .filter(|t| tables.contains(t.as_str()))
        .count();

    let mut score = shared_words as f64 + 2.0 * shared_tables as f64;
    if prior.success {
        score *= 1.5;
    }
    let age_secs = (now - prior.timestamp).num_milliseconds().max(0) as f64 / 1000.0;
    let decay = (1.0 - age_secs / DECAY_WINDOW_SECS).max(0.0);
    score * (1.0 + decay)
}

pub fn word_tokens(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

/// Tables named after FROM or JOIN, lowercased, without schema qualifier.
pub fn extract_tables(sql: &str) -> Vec<String> {
    let mut tables = Vec::new();
    for caps in TABLE_REF.captures_iter(sql) {
        let name = caps.get(2).or_else(|| caps.get(1)).map(|m| m.as_str().to_lowercase());
        if let Some(name) = name {
            if !tables.contains(&name) {
                tables.push(name);
            }
        }
    }
    tables
}

fn name_forms(name: &str) -> Vec<String> {
    let lower = name.to_lowercase();
    let mut forms = vec![lower.clone()];
    if lower.contains('_') {
        forms.push(lower.replace('_', " "));
    }
    if let Some(stem) = lower.strip_suffix("ies") {
        forms.push(format!("{stem}y"));
    } else if let Some(stem) = lower.strip_suffix('s') {
        forms.push(stem.to_string());
    } else if let Some(stem) = lower.strip_suffix('y') {
        forms.push(format!("{stem}ies"));
    } else {
        forms.push(format!("{lower}s"));
    }
    let spaced: Vec<String> = forms
        .iter()
        .filter(|f| f.contains('_'))
        .map(|f| f.replace('_', " "))
        .collect();
    forms.extend(spaced);
    forms.sort();
    forms.dedup();
    forms
}

/// Schema tables and columns named in the question, including simple plural
/// and underscore-to-space variants.
pub fn detect_references(query: &str, schema: &DatabaseSchema) -> DetectedReferences {
    let normalized: String = query
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { ' ' })
        .collect();
    let haystack = format!(" {} ", normalized.split_whitespace().collect::<Vec<_>>().join(" "));
    let mentions = |name: &str| {
        name_forms(name)
            .iter()
            .any(|form| haystack.contains(&format!(" {form} ")))
    };

    let mut detected = DetectedReferences::default();
    for table in &schema.tables {
        if mentions(&table.name) {
            detected.tables.insert(table.name.to_lowercase());
        }
        for column in &table.columns {
            if mentions(&column.name) {
                detected.columns.insert(column.name.to_lowercase());
            }
        }
    }
    detected
}
