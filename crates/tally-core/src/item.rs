//! Tracked items and the pieces providers contribute to them.
//!
//! An [`Item`] is the unit every queue selects and every worker mutates. Queue
//! membership is derived purely from item state: `needs_aliases` drives the
//! alias queue and `metrics_runs` drives the per-provider metrics queues.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Bibliographic field map (field name → value).
pub type Biblio = BTreeMap<String, serde_json::Value>;

/// Metrics reported by one provider for one item, keyed by the provider-local
/// metric name (e.g. `"mentions"`).
pub type MetricsUpdate = BTreeMap<String, MetricValue>;

/// A (namespace, external-id) pair identifying an object across systems.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Alias {
    pub namespace: String,
    pub id: String,
}

impl Alias {
    pub fn new(namespace: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            id: id.into(),
        }
    }

    /// Clean up the identifier so equal ids from different providers collapse.
    ///
    /// Strips surrounding whitespace and non-printing characters. DOIs are
    /// lower-cased and lose any `doi:` or resolver prefix. The `biblio`
    /// namespace is left untouched.
    pub fn normalized(&self) -> Alias {
        if self.namespace == "biblio" {
            return self.clone();
        }

        let cleaned: String = self.id.chars().filter(|c| !c.is_control()).collect();
        let mut id = cleaned.trim().to_string();

        let namespace = self.namespace.trim().to_lowercase();
        if namespace == "doi" {
            id = clean_doi(&id);
        }

        Alias { namespace, id }
    }
}

impl std::fmt::Display for Alias {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.namespace, self.id)
    }
}

fn clean_doi(id: &str) -> String {
    let lower = id.to_lowercase();
    let stripped = match lower.find("doi.org/") {
        Some(pos) => &lower[pos + "doi.org/".len()..],
        None => lower.strip_prefix("doi:").unwrap_or(&lower),
    };
    stripped.trim().to_string()
}

/// Namespace → ordered-unique list of identifiers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Aliases(BTreeMap<String, Vec<String>>);

impl Aliases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one alias. Returns `false` if it was already present.
    pub fn add(&mut self, alias: Alias) -> bool {
        let ids = self.0.entry(alias.namespace).or_default();
        if ids.contains(&alias.id) {
            return false;
        }
        ids.push(alias.id);
        true
    }

    /// Add many aliases, returning how many were new.
    pub fn extend<I: IntoIterator<Item = Alias>>(&mut self, aliases: I) -> usize {
        aliases
            .into_iter()
            .map(|alias| self.add(alias))
            .filter(|added| *added)
            .count()
    }

    pub fn get(&self, namespace: &str) -> &[String] {
        self.0.get(namespace).map(Vec::as_slice).unwrap_or_default()
    }

    /// First identifier in a namespace, the one providers should prefer.
    pub fn first(&self, namespace: &str) -> Option<&str> {
        self.get(namespace).first().map(String::as_str)
    }

    pub fn contains(&self, namespace: &str, id: &str) -> bool {
        self.get(namespace).iter().any(|existing| existing == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = Alias> + '_ {
        self.0
            .iter()
            .flat_map(|(ns, ids)| ids.iter().map(move |id| Alias::new(ns.clone(), id.clone())))
    }

    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FromIterator<Alias> for Aliases {
    fn from_iter<I: IntoIterator<Item = Alias>>(iter: I) -> Self {
        let mut aliases = Aliases::new();
        aliases.extend(iter);
        aliases
    }
}

/// A value reported by a provider, with where it can be verified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricValue {
    pub value: serde_json::Value,
    pub provenance_url: Option<String>,
}

impl MetricValue {
    pub fn new(value: impl Into<serde_json::Value>, provenance_url: Option<String>) -> Self {
        Self {
            value: value.into(),
            provenance_url,
        }
    }
}

/// A point-in-time metric value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub value: serde_json::Value,
    pub collected_at: DateTime<Utc>,
    pub provenance_url: Option<String>,
}

/// A tracked object and everything gathered about it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub tiid: String,
    #[serde(default)]
    pub aliases: Aliases,
    #[serde(default)]
    pub biblio: Biblio,
    /// `"<provider>:<metric>"` → snapshots, oldest first.
    #[serde(default)]
    pub metrics: BTreeMap<String, Vec<Snapshot>>,
    pub created: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub last_requested: DateTime<Utc>,
    /// Set while the item waits for alias discovery; the value orders the queue.
    #[serde(default)]
    pub needs_aliases: Option<DateTime<Utc>>,
    /// Provider → when its last metrics cycle for this item finished.
    #[serde(default)]
    pub metrics_runs: BTreeMap<String, DateTime<Utc>>,
    /// Optimistic-concurrency revision, owned by the store.
    #[serde(default)]
    pub version: i64,
}

impl Item {
    /// A fresh item, already waiting for alias discovery.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            tiid: Self::generate_tiid(),
            aliases: Aliases::new(),
            biblio: Biblio::new(),
            metrics: BTreeMap::new(),
            created: now,
            last_modified: now,
            last_requested: now,
            needs_aliases: Some(now),
            metrics_runs: BTreeMap::new(),
            version: 0,
        }
    }

    pub fn with_aliases<I: IntoIterator<Item = Alias>>(mut self, aliases: I) -> Self {
        self.add_aliases(aliases);
        self
    }

    /// 32 lower-case hex characters.
    pub fn generate_tiid() -> String {
        Uuid::new_v4().simple().to_string()
    }

    /// Normalise and add aliases, returning how many were new.
    pub fn add_aliases<I: IntoIterator<Item = Alias>>(&mut self, aliases: I) -> usize {
        self.aliases
            .extend(aliases.into_iter().map(|alias| alias.normalized()))
    }

    /// Fill bibliographic fields that are not set yet. Returns how many were added.
    pub fn add_biblio(&mut self, biblio: Biblio) -> usize {
        let mut added = 0;
        for (field, value) in biblio {
            if value.is_null() || self.biblio.contains_key(&field) {
                continue;
            }
            self.biblio.insert(field, value);
            added += 1;
        }
        added
    }

    /// Append one snapshot per reported metric under `"<provider>:<metric>"`.
    pub fn add_metrics(&mut self, provider: &str, update: MetricsUpdate, now: DateTime<Utc>) -> usize {
        let count = update.len();
        for (name, metric) in update {
            let series = self.metrics.entry(format!("{provider}:{name}")).or_default();
            series.push(Snapshot {
                value: metric.value,
                collected_at: now,
                provenance_url: metric.provenance_url,
            });
            series.sort_by_key(|snapshot| snapshot.collected_at);
        }
        count
    }

    pub fn latest_metric(&self, metric_name: &str) -> Option<&Snapshot> {
        self.metrics.get(metric_name).and_then(|series| series.last())
    }

    pub fn needs_aliases(&self) -> bool {
        self.needs_aliases.is_some()
    }

    /// On the alias queue and past its not-before stamp.
    pub fn aliases_due(&self, now: DateTime<Utc>) -> bool {
        self.needs_aliases.is_some_and(|not_before| not_before <= now)
    }

    /// Metrics queues only pick up items whose alias discovery has finished.
    pub fn needs_metrics_from(&self, provider: &str) -> bool {
        !self.needs_aliases() && !self.metrics_runs.contains_key(provider)
    }

    pub fn mark_aliases_resolved(&mut self) {
        self.needs_aliases = None;
    }

    /// Keep the item in the alias queue, but not before `not_before`.
    pub fn requeue_aliases(&mut self, not_before: DateTime<Utc>) {
        self.needs_aliases = Some(not_before);
    }

    pub fn mark_metrics_run(&mut self, provider: &str, now: DateTime<Utc>) {
        self.metrics_runs.insert(provider.to_string(), now);
    }

    /// Re-arm every queue for this item.
    pub fn request_refresh(&mut self, now: DateTime<Utc>) {
        self.last_requested = now;
        self.needs_aliases = Some(now);
        self.metrics_runs.clear();
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_modified = now;
    }

    /// Fold the currently persisted version into this in-memory copy after a
    /// lost compare-and-swap.
    ///
    /// Aliases and snapshots are unioned, biblio fields missing locally are
    /// taken from `stored`, and queue markers follow whichever side saw the
    /// most recent refresh request. The revision is taken from `stored`.
    pub fn merge_from(&mut self, stored: &Item) {
        let mut aliases = stored.aliases.clone();
        aliases.extend(self.aliases.iter());
        self.aliases = aliases;

        for (field, value) in &stored.biblio {
            self.biblio
                .entry(field.clone())
                .or_insert_with(|| value.clone());
        }

        for (name, stored_series) in &stored.metrics {
            let series = self.metrics.entry(name.clone()).or_default();
            for snapshot in stored_series {
                if !series.contains(snapshot) {
                    series.push(snapshot.clone());
                }
            }
            series.sort_by_key(|snapshot| snapshot.collected_at);
        }

        if stored.last_requested > self.last_requested {
            self.last_requested = stored.last_requested;
            self.needs_aliases = stored.needs_aliases;
            self.metrics_runs = stored.metrics_runs.clone();
        } else {
            for (provider, at) in &stored.metrics_runs {
                let entry = self.metrics_runs.entry(provider.clone()).or_insert(*at);
                if *at > *entry {
                    *entry = *at;
                }
            }
        }

        self.created = stored.created;
        self.last_modified = self.last_modified.max(stored.last_modified);
        self.version = stored.version;
    }
}
