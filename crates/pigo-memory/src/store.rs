use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::RwLock;

use tracing::debug;

use crate::error::{MemoryError, Result};
use crate::types::{Memory, MemoryCategory, CATEGORY_ORDER};

/// In-process memory store backed by a single JSONL file.
///
/// Reads take the shared lock, mutations the exclusive one. Mutations only
/// mark the store dirty; nothing touches disk until `save()`.
#[derive(Debug)]
pub struct MemoryStore {
    path: PathBuf,
    inner: RwLock<Inner>,
}

#[derive(Debug)]
struct Inner {
    entries: HashMap<String, Memory>,
    dirty: bool,
}

impl MemoryStore {
    /// Create an empty store bound to `path` without reading it.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            inner: RwLock::new(Inner {
                entries: HashMap::new(),
                dirty: false,
            }),
        }
    }

    /// Load the store from `path`. A missing file yields an empty store; a
    /// malformed line aborts the load with its 1-based line number.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut entries = HashMap::new();

        if path.is_file() {
            let file = std::fs::File::open(&path)?;
            for (idx, line) in BufReader::new(file).lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let mem: Memory = serde_json::from_str(&line)
                    .map_err(|source| MemoryError::Malformed { line: idx + 1, source })?;
                entries.insert(mem.id.clone(), mem);
            }
            debug!(count = entries.len(), path = %path.display(), "memory store loaded");
        }

        Ok(Self {
            path,
            inner: RwLock::new(Inner { entries, dirty: false }),
        })
    }

    /// Persist all entries if anything changed since the last save.
    ///
    /// Writes to a sibling temp file and renames it into place so a crash
    /// mid-write never corrupts the store. Returns whether a write happened.
    pub fn save(&self) -> Result<bool> {
        let mut inner = self.inner.write().expect("memory store poisoned");
        if !inner.dirty {
            return Ok(false);
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        // Stable output order keeps the file diffable.
        let mut entries: Vec<&Memory> = inner.entries.values().collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let tmp_path = self.path.with_extension("jsonl.tmp");
        {
            let mut tmp = std::fs::File::create(&tmp_path)?;
            for mem in &entries {
                serde_json::to_writer(&mut tmp, mem)?;
                tmp.write_all(b"\n")?;
            }
            tmp.flush()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;

        inner.dirty = false;
        debug!(count = inner.entries.len(), path = %self.path.display(), "memory store saved");
        Ok(true)
    }

    pub fn get(&self, id: &str) -> Option<Memory> {
        self.inner
            .read()
            .expect("memory store poisoned")
            .entries
            .get(id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("memory store poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert a new memory. Does not persist.
    pub fn add(&self, mem: Memory) {
        let mut inner = self.inner.write().expect("memory store poisoned");
        inner.entries.insert(mem.id.clone(), mem);
        inner.dirty = true;
    }

    /// Replace an existing memory in place.
    pub fn update(&self, mem: Memory) -> Result<()> {
        let mut inner = self.inner.write().expect("memory store poisoned");
        if !inner.entries.contains_key(&mem.id) {
            return Err(MemoryError::NotFound { id: mem.id });
        }
        inner.entries.insert(mem.id.clone(), mem);
        inner.dirty = true;
        Ok(())
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.write().expect("memory store poisoned");
        if inner.entries.remove(id).is_none() {
            return Err(MemoryError::NotFound { id: id.to_string() });
        }
        inner.dirty = true;
        Ok(())
    }

    /// Record that a memory was surfaced to the model: bump `active_count`
    /// and `updated_at`.
    pub fn touch(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.write().expect("memory store poisoned");
        let mem = inner
            .entries
            .get_mut(id)
            .ok_or_else(|| MemoryError::NotFound { id: id.to_string() })?;
        mem.active_count = mem.active_count.saturating_add(1);
        mem.updated_at = chrono::Utc::now().to_rfc3339();
        inner.dirty = true;
        Ok(())
    }

    /// Top-`k` memories by cosine similarity to `query`, optionally filtered
    /// by category. Memories without a vector are excluded.
    pub fn search_by_vector(
        &self,
        query: &[f32],
        k: usize,
        category: Option<MemoryCategory>,
    ) -> Vec<Memory> {
        let mut scored = self.scored_by_similarity(query, category);
        scored.truncate(k);
        scored.into_iter().map(|(mem, _)| mem).collect()
    }

    /// All memories whose similarity to `query` is at least `threshold`,
    /// sorted most-similar first, with their scores.
    pub fn find_similar(
        &self,
        query: &[f32],
        threshold: f64,
        category: Option<MemoryCategory>,
    ) -> Vec<(Memory, f64)> {
        self.scored_by_similarity(query, category)
            .into_iter()
            .filter(|(_, score)| *score >= threshold)
            .collect()
    }

    fn scored_by_similarity(
        &self,
        query: &[f32],
        category: Option<MemoryCategory>,
    ) -> Vec<(Memory, f64)> {
        let inner = self.inner.read().expect("memory store poisoned");
        let mut scored: Vec<(Memory, f64)> = inner
            .entries
            .values()
            .filter(|m| category.map_or(true, |c| m.category == c))
            .filter(|m| !m.vector.is_empty())
            .map(|m| (m.clone(), cosine_similarity(query, &m.vector)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored
    }

    /// Case-insensitive substring search across all three layers, sorted by
    /// `active_count` descending, top `k`.
    pub fn search_by_keyword(&self, query: &str, k: usize) -> Vec<Memory> {
        let needle = query.to_lowercase();
        let inner = self.inner.read().expect("memory store poisoned");
        let mut hits: Vec<Memory> = inner
            .entries
            .values()
            .filter(|m| {
                m.abstract_.to_lowercase().contains(&needle)
                    || m.overview.to_lowercase().contains(&needle)
                    || m.content.to_lowercase().contains(&needle)
            })
            .cloned()
            .collect();
        hits.sort_by(|a, b| b.active_count.cmp(&a.active_count).then(a.id.cmp(&b.id)));
        hits.truncate(k);
        hits
    }

    /// Render the top-`max` memories (by `active_count`) as markdown sections
    /// in fixed category order, listing only the L0 abstracts. Empty string
    /// when the store is empty.
    pub fn format_for_prompt(&self, max: usize) -> String {
        let inner = self.inner.read().expect("memory store poisoned");
        let mut top: Vec<&Memory> = inner.entries.values().collect();
        top.sort_by(|a, b| b.active_count.cmp(&a.active_count).then(a.id.cmp(&b.id)));
        top.truncate(max);

        let mut out = String::new();
        for cat in CATEGORY_ORDER {
            let in_cat: Vec<&&Memory> = top.iter().filter(|m| m.category == cat).collect();
            if in_cat.is_empty() {
                continue;
            }
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&format!("## {}\n", capitalize(&cat.to_string())));
            for mem in in_cat {
                out.push_str(&format!("- {}\n", mem.abstract_));
            }
        }
        out
    }
}

/// Cosine similarity over f32 vectors. Returns 0.0 when either vector is
/// empty, the lengths differ, or either norm is zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

fn capitalize(s: &str) -> String {
    let mut c = s.chars();
    match c.next() {
        None => String::new(),
        Some(f) => f.to_uppercase().to_string() + c.as_str(),
    }
}
