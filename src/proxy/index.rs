//! Tool index: exact lookup and keyword search across loaded workers.
//!
//! The index is derived state: the registry rebuilds a worker's contribution
//! whenever that worker loads, reloads, or unloads, inside the same critical
//! section that changes the registry map. It never holds tools of a worker
//! that is not loaded.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Serialize;

use super::types::ToolManifestEntry;

// ─── Scoring ─────────────────────────────────────────────────────────────────

const NAME_TOKEN_HIT: u32 = 10;
const DESCRIPTION_TOKEN_HIT: u32 = 5;
const WHOLE_QUERY_IN_NAME: u32 = 20;

/// Query tokens shorter than this only match field tokens exactly.
const MIN_PREFIX_LEN: usize = 3;

/// Suggestions below this similarity are not worth showing.
const MIN_SUGGESTION_SIMILARITY: f64 = 0.3;

/// A ranked search result.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    #[serde(flatten)]
    pub tool: ToolManifestEntry,
    pub score: u32,
}

struct IndexedTool {
    entry: ToolManifestEntry,
    name_tokens: Vec<String>,
    description_tokens: Vec<String>,
    normalized_name: String,
}

impl IndexedTool {
    fn new(entry: ToolManifestEntry) -> Self {
        let name_tokens = tokenize(&entry.name);
        let description_tokens = tokenize(&entry.description);
        let normalized_name = name_tokens.join("_");
        Self {
            entry,
            name_tokens,
            description_tokens,
            normalized_name,
        }
    }

    fn score(&self, query_tokens: &[String], normalized_query: &str) -> u32 {
        let mut score = 0;
        for token in query_tokens {
            if self.name_tokens.iter().any(|t| token_matches(token, t)) {
                score += NAME_TOKEN_HIT;
            }
            if self.description_tokens.iter().any(|t| token_matches(token, t)) {
                score += DESCRIPTION_TOKEN_HIT;
            }
        }
        if !normalized_query.is_empty() && self.normalized_name.contains(normalized_query) {
            score += WHOLE_QUERY_IN_NAME;
        }
        score
    }
}

struct WorkerTools {
    load_seq: u64,
    tools: BTreeMap<String, IndexedTool>,
}

// ─── ToolIndex ───────────────────────────────────────────────────────────────

/// Index over the manifests of every loaded worker.
#[derive(Default)]
pub struct ToolIndex {
    workers: HashMap<String, WorkerTools>,
}

impl ToolIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a worker's contribution with a fresh manifest.
    pub fn upsert_worker(&mut self, worker: &str, load_seq: u64, tools: &[ToolManifestEntry]) {
        let tools = tools
            .iter()
            .map(|entry| (entry.name.clone(), IndexedTool::new(entry.clone())))
            .collect();
        self.workers
            .insert(worker.to_string(), WorkerTools { load_seq, tools });
    }

    /// Drop every tool of a worker. Returns whether it was indexed.
    pub fn remove_worker(&mut self, worker: &str) -> bool {
        self.workers.remove(worker).is_some()
    }

    pub fn lookup(&self, worker: &str, tool: &str) -> Option<&ToolManifestEntry> {
        self.workers
            .get(worker)
            .and_then(|w| w.tools.get(tool))
            .map(|t| &t.entry)
    }

    /// Every loaded tool with this name, in worker load order.
    pub fn find_by_name(&self, tool: &str) -> Vec<&ToolManifestEntry> {
        self.ordered_workers()
            .into_iter()
            .filter_map(|(_, w)| w.tools.get(tool).map(|t| &t.entry))
            .collect()
    }

    /// All tools, ordered by worker load order then tool name.
    pub fn all_tools(&self) -> Vec<&ToolManifestEntry> {
        self.ordered_workers()
            .into_iter()
            .flat_map(|(_, w)| w.tools.values().map(|t| &t.entry))
            .collect()
    }

    /// Rank tools by token overlap with `query`.
    ///
    /// Zero-score tools are excluded. Ties are broken by worker load order,
    /// then tool name, so identical inputs always produce identical output.
    pub fn search(&self, query: &str, limit: usize) -> Vec<SearchHit> {
        let query_tokens = dedup(tokenize(query));
        if query_tokens.is_empty() || limit == 0 {
            return Vec::new();
        }
        let normalized_query = query_tokens.join("_");

        let mut hits: Vec<(u64, SearchHit)> = self
            .workers
            .values()
            .flat_map(|w| {
                w.tools
                    .values()
                    .map(move |t| (w.load_seq, t))
            })
            .filter_map(|(seq, t)| {
                let score = t.score(&query_tokens, &normalized_query);
                (score > 0).then(|| {
                    (
                        seq,
                        SearchHit {
                            tool: t.entry.clone(),
                            score,
                        },
                    )
                })
            })
            .collect();

        hits.sort_by(|(seq_a, a), (seq_b, b)| {
            b.score
                .cmp(&a.score)
                .then(seq_a.cmp(seq_b))
                .then_with(|| a.tool.name.cmp(&b.tool.name))
        });
        hits.truncate(limit);
        hits.into_iter().map(|(_, hit)| hit).collect()
    }

    /// Names close to `tool` by edit distance, best first.
    ///
    /// Restricted to one worker's manifest when `worker` is given.
    pub fn suggest(&self, worker: Option<&str>, tool: &str, max_results: usize) -> Vec<String> {
        let candidates: Vec<&str> = match worker {
            Some(name) => self
                .workers
                .get(name)
                .map(|w| w.tools.keys().map(String::as_str).collect())
                .unwrap_or_default(),
            None => self
                .workers
                .values()
                .flat_map(|w| w.tools.keys().map(String::as_str))
                .collect(),
        };

        let query = tool.to_lowercase();
        let mut scored: Vec<(&str, f64)> = candidates
            .into_iter()
            .collect::<HashSet<_>>()
            .into_iter()
            .map(|name| (name, similarity(&query, &name.to_lowercase())))
            .filter(|(_, score)| *score > MIN_SUGGESTION_SIMILARITY)
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.0.cmp(b.0))
        });
        scored.truncate(max_results);
        scored.into_iter().map(|(name, _)| name.to_string()).collect()
    }

    pub fn tool_count(&self) -> usize {
        self.workers.values().map(|w| w.tools.len()).sum()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    fn ordered_workers(&self) -> Vec<(&String, &WorkerTools)> {
        let mut workers: Vec<_> = self.workers.iter().collect();
        workers.sort_by_key(|(_, w)| w.load_seq);
        workers
    }
}

// ─── Tokenizing ──────────────────────────────────────────────────────────────

/// Split text into lowercase alphanumeric tokens, breaking camelCase words.
fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;

    for ch in text.chars() {
        if !ch.is_alphanumeric() {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
            prev_lower = false;
            continue;
        }
        if ch.is_uppercase() && prev_lower && !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
        prev_lower = ch.is_lowercase() || ch.is_ascii_digit();
        current.extend(ch.to_lowercase());
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn dedup(tokens: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    tokens.into_iter().filter(|t| seen.insert(t.clone())).collect()
}

fn token_matches(query: &str, field: &str) -> bool {
    query == field || (query.chars().count() >= MIN_PREFIX_LEN && field.starts_with(query))
}

// ─── Edit Distance ──────────────────────────────────────────────────────────

/// Compute the Levenshtein edit distance between two strings.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let n = b.len();

    // Use single-row DP for O(n) space
    let mut prev: Vec<usize> = (0..=n).collect();
    let mut curr = vec![0usize; n + 1];

    for i in 1..=a.len() {
        curr[0] = i;
        for j in 1..=n {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            curr[j] = (prev[j] + 1) // deletion
                .min(curr[j - 1] + 1) // insertion
                .min(prev[j - 1] + cost); // substitution
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[n]
}

/// Normalized similarity between two strings (0.0 = completely different, 1.0 = identical).
fn similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    let dist = levenshtein(a, b);
    1.0 - (dist as f64 / max_len as f64)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
