//! Per-organization knowledge base.
//!
//! Each organization owns one namespace. Entries are chunked into word
//! windows, embedded, and indexed twice: pgvector for semantic similarity
//! and `tsvector` for lexical match. Search fuses both rankings.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgRow, PgPool, Row};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app::{now_iso, AppState};
use crate::error::ApiResult;
use crate::types::{Page, PageRequest};

pub const CHUNK_WORDS: usize = 400;
pub const CHUNK_OVERLAP_WORDS: usize = 60;
const EMBEDDING_BATCH: usize = 32;
const RRF_K: f64 = 60.0;
/// Candidates pulled from each index per requested result.
const CANDIDATES_PER_RESULT: i64 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Pending,
    Ready,
    Error,
}

impl EntryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "ready" => Self::Ready,
            "pending" => Self::Pending,
            _ => Self::Error,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryMetadata {
    #[serde(default)]
    pub storage_id: Option<String>,
    #[serde(default)]
    pub uploaded_by: String,
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub entry_id: String,
    pub namespace_id: String,
    pub key: String,
    pub title: String,
    pub content_hash: String,
    pub metadata: EntryMetadata,
    pub status: EntryStatus,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct Namespace {
    pub namespace_id: String,
    pub namespace: String,
}

pub struct NewEntry<'a> {
    pub namespace: &'a str,
    pub key: &'a str,
    pub title: &'a str,
    pub text: &'a str,
    pub metadata: EntryMetadata,
    pub content_hash: &'a str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddResult {
    pub entry_id: String,
    pub created: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub entries: Vec<Entry>,
    pub text: String,
}

/// Word windows of `size` words, consecutive windows sharing `overlap` words.
pub fn chunk_text(text: &str, size: usize, overlap: usize) -> Vec<String> {
    let words = text.split_whitespace().collect::<Vec<_>>();
    if words.is_empty() || size == 0 {
        return vec![];
    }
    let step = size.saturating_sub(overlap).max(1);
    let mut chunks = Vec::new();
    let mut start = 0usize;
    while start < words.len() {
        let end = (start + size).min(words.len());
        chunks.push(words[start..end].join(" "));
        if end == words.len() {
            break;
        }
        start += step;
    }
    chunks
}

pub fn embedding_to_pgvector(embedding: &[f64]) -> String {
    let items = embedding
        .iter()
        .map(|v| format!("{v:.8}"))
        .collect::<Vec<_>>()
        .join(",");
    format!("[{items}]")
}

/// Reciprocal-rank fusion of two ranked id lists, best first.
pub fn fuse_rankings(vector_ids: &[String], lexical_ids: &[String]) -> Vec<(String, f64)> {
    let mut scores = HashMap::<&str, f64>::new();
    let mut first_seen = HashMap::<&str, usize>::new();
    for ranking in [vector_ids, lexical_ids] {
        for (rank, id) in ranking.iter().enumerate() {
            *scores.entry(id.as_str()).or_default() += 1.0 / (RRF_K + rank as f64 + 1.0);
            let order = first_seen.len();
            first_seen.entry(id.as_str()).or_insert(order);
        }
    }
    let mut fused = scores
        .into_iter()
        .map(|(id, score)| (id.to_string(), score))
        .collect::<Vec<_>>();
    fused.sort_by(|a, b| {
        b.1.total_cmp(&a.1)
            .then_with(|| first_seen[a.0.as_str()].cmp(&first_seen[b.0.as_str()]))
    });
    fused
}

fn parse_entry_row(row: &PgRow) -> Entry {
    Entry {
        entry_id: row.get("id"),
        namespace_id: row.get("namespace_id"),
        key: row.get("key"),
        title: row.get("title"),
        content_hash: row.get("content_hash"),
        metadata: serde_json::from_str(&row.get::<String, _>("metadata")).unwrap_or_default(),
        status: EntryStatus::parse(&row.get::<String, _>("status")),
        created_at: row.get("created_at"),
    }
}

const ENTRY_COLUMNS: &str = "id, seq, namespace_id, key, title, content_hash, metadata, status, created_at";

pub async fn get_namespace(db: &PgPool, namespace: &str) -> ApiResult<Option<Namespace>> {
    let row = sqlx::query("SELECT id, namespace FROM rag_namespaces WHERE namespace = $1")
        .bind(namespace)
        .fetch_optional(db)
        .await?;
    Ok(row.map(|row| Namespace {
        namespace_id: row.get("id"),
        namespace: row.get("namespace"),
    }))
}

async fn get_or_create_namespace(db: &PgPool, namespace: &str) -> ApiResult<Namespace> {
    sqlx::query(
        "INSERT INTO rag_namespaces (id, namespace, created_at) VALUES ($1,$2,$3) ON CONFLICT (namespace) DO NOTHING",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(namespace)
    .bind(now_iso())
    .execute(db)
    .await?;
    let row = sqlx::query("SELECT id, namespace FROM rag_namespaces WHERE namespace = $1")
        .bind(namespace)
        .fetch_one(db)
        .await?;
    Ok(Namespace {
        namespace_id: row.get("id"),
        namespace: row.get("namespace"),
    })
}

async fn embed_chunks(state: &AppState, chunks: &[String]) -> Option<Vec<Vec<f64>>> {
    let mut embeddings = Vec::with_capacity(chunks.len());
    for batch in chunks.chunks(EMBEDDING_BATCH) {
        match state.ai.embed(batch).await {
            Ok(mut vectors) => embeddings.append(&mut vectors),
            Err(err) => {
                warn!(error = %err, "embedding failed, entry indexed for lexical search only");
                return None;
            }
        }
    }
    Some(embeddings)
}

/// An entry already stored under the key being added.
#[derive(Debug, Clone)]
pub struct ExistingEntry {
    pub entry_id: String,
    pub content_hash: String,
    pub status: EntryStatus,
    pub storage_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AddPlan {
    Unchanged {
        entry_id: String,
    },
    Insert {
        replaced_entry_ids: Vec<String>,
        /// Blobs owned by the replaced entries, freed once the insert commits.
        replaced_storage_ids: Vec<String>,
    },
}

/// Same content with a usable status is kept; anything else under the key is replaced.
pub fn plan_add(existing: &[ExistingEntry], content_hash: &str, new_storage_id: Option<&str>) -> AddPlan {
    if let Some(same) = existing
        .iter()
        .find(|e| e.content_hash == content_hash && e.status != EntryStatus::Error)
    {
        return AddPlan::Unchanged {
            entry_id: same.entry_id.clone(),
        };
    }
    let mut replaced_storage_ids = existing
        .iter()
        .filter_map(|e| e.storage_id.clone())
        .filter(|id| Some(id.as_str()) != new_storage_id)
        .collect::<Vec<_>>();
    replaced_storage_ids.sort();
    replaced_storage_ids.dedup();
    AddPlan::Insert {
        replaced_entry_ids: existing.iter().map(|e| e.entry_id.clone()).collect(),
        replaced_storage_ids,
    }
}

async fn existing_entries(db: &PgPool, namespace_id: &str, key: &str) -> ApiResult<Vec<ExistingEntry>> {
    let rows = sqlx::query(
        "SELECT id, content_hash, status, metadata FROM rag_entries WHERE namespace_id = $1 AND key = $2",
    )
    .bind(namespace_id)
    .bind(key)
    .fetch_all(db)
    .await?;
    Ok(rows
        .iter()
        .map(|row| ExistingEntry {
            entry_id: row.get("id"),
            content_hash: row.get("content_hash"),
            status: EntryStatus::parse(&row.get::<String, _>("status")),
            storage_id: serde_json::from_str::<EntryMetadata>(&row.get::<String, _>("metadata"))
                .ok()
                .and_then(|m| m.storage_id),
        })
        .collect())
}

/// Adds `text` under `key`. Re-adding identical content is a no-op; new
/// content replaces whatever the key held before, including its blob.
pub async fn add(state: &AppState, entry: NewEntry<'_>) -> ApiResult<AddResult> {
    let namespace = get_or_create_namespace(&state.db, entry.namespace).await?;

    let existing = existing_entries(&state.db, &namespace.namespace_id, entry.key).await?;
    let (replaced, replaced_storage_ids) = match plan_add(
        &existing,
        entry.content_hash,
        entry.metadata.storage_id.as_deref(),
    ) {
        AddPlan::Unchanged { entry_id } => {
            debug!(entry_id = %entry_id, key = entry.key, "entry unchanged");
            return Ok(AddResult {
                entry_id,
                created: false,
            });
        }
        AddPlan::Insert {
            replaced_entry_ids,
            replaced_storage_ids,
        } => (replaced_entry_ids, replaced_storage_ids),
    };

    let chunks = chunk_text(entry.text, CHUNK_WORDS, CHUNK_OVERLAP_WORDS);
    let embeddings = embed_chunks(state, &chunks).await;
    let status = if embeddings.is_some() {
        EntryStatus::Ready
    } else {
        EntryStatus::Error
    };

    let entry_id = Uuid::new_v4().to_string();
    let created_at = now_iso();
    let title = if entry.title.trim().is_empty() {
        entry.key
    } else {
        entry.title
    };

    let mut tx = state.db.begin().await?;
    sqlx::query(
        "INSERT INTO rag_entries (id, namespace_id, key, title, content_hash, metadata, status, created_at) \
         VALUES ($1,$2,$3,$4,$5,$6,$7,$8)",
    )
    .bind(&entry_id)
    .bind(&namespace.namespace_id)
    .bind(entry.key)
    .bind(title)
    .bind(entry.content_hash)
    .bind(serde_json::to_string(&entry.metadata)?)
    .bind(status.as_str())
    .bind(&created_at)
    .execute(&mut *tx)
    .await?;

    for (idx, chunk) in chunks.iter().enumerate() {
        let vector = embeddings
            .as_ref()
            .and_then(|all| all.get(idx))
            .map(|e| embedding_to_pgvector(e));
        sqlx::query(
            "INSERT INTO rag_chunks (id, entry_id, namespace_id, chunk_index, content_text, embedding, tsv, created_at) \
             VALUES ($1,$2,$3,$4,$5,$6::vector,to_tsvector('english', $5),$7)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&entry_id)
        .bind(&namespace.namespace_id)
        .bind(idx as i32)
        .bind(chunk)
        .bind(vector)
        .bind(&created_at)
        .execute(&mut *tx)
        .await?;
    }

    if !replaced.is_empty() {
        sqlx::query("DELETE FROM rag_entries WHERE id = ANY($1)")
            .bind(&replaced)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;

    for storage_id in &replaced_storage_ids {
        state.storage.discard(&state.db, storage_id).await;
    }

    info!(
        entry_id = %entry_id,
        namespace = %namespace.namespace,
        chunks = chunks.len(),
        status = status.as_str(),
        replaced = replaced.len(),
        "knowledge entry added"
    );
    Ok(AddResult {
        entry_id,
        created: true,
    })
}

struct ChunkHit {
    entry_id: String,
    content_text: String,
}

pub async fn search(state: &AppState, namespace: &str, query: &str, limit: i64) -> ApiResult<SearchResult> {
    let empty = SearchResult {
        entries: vec![],
        text: String::new(),
    };
    let Some(namespace) = get_namespace(&state.db, namespace).await? else {
        return Ok(empty);
    };
    if query.trim().is_empty() {
        return Ok(empty);
    }
    let candidate_limit = limit.max(1) * CANDIDATES_PER_RESULT;
    let mut hits = HashMap::<String, ChunkHit>::new();

    let mut vector_ids = vec![];
    match state.ai.embed(&[query.to_string()]).await {
        Ok(embeddings) => {
            if let Some(embedding) = embeddings.first() {
                let rows = sqlx::query(
                    "SELECT ch.id, ch.entry_id, ch.content_text FROM rag_chunks ch \
                     WHERE ch.namespace_id = $1 AND ch.embedding IS NOT NULL \
                     ORDER BY ch.embedding <=> $2::vector LIMIT $3",
                )
                .bind(&namespace.namespace_id)
                .bind(embedding_to_pgvector(embedding))
                .bind(candidate_limit)
                .fetch_all(&state.db)
                .await?;
                for row in rows {
                    let id: String = row.get("id");
                    vector_ids.push(id.clone());
                    hits.entry(id).or_insert(ChunkHit {
                        entry_id: row.get("entry_id"),
                        content_text: row.get("content_text"),
                    });
                }
            }
        }
        Err(err) => warn!(error = %err, "query embedding failed, using lexical search only"),
    }

    let rows = sqlx::query(
        "SELECT ch.id, ch.entry_id, ch.content_text, \
                (ts_rank_cd(ch.tsv, plainto_tsquery('english', $2))::double precision) AS score \
         FROM rag_chunks ch \
         WHERE ch.namespace_id = $1 AND ch.tsv @@ plainto_tsquery('english', $2) \
         ORDER BY score DESC LIMIT $3",
    )
    .bind(&namespace.namespace_id)
    .bind(query)
    .bind(candidate_limit)
    .fetch_all(&state.db)
    .await?;
    let mut lexical_ids = vec![];
    for row in rows {
        let id: String = row.get("id");
        lexical_ids.push(id.clone());
        hits.entry(id).or_insert(ChunkHit {
            entry_id: row.get("entry_id"),
            content_text: row.get("content_text"),
        });
    }

    let fused = fuse_rankings(&vector_ids, &lexical_ids);
    let top = fused
        .iter()
        .take(limit.max(1) as usize)
        .filter_map(|(id, _)| hits.get(id))
        .collect::<Vec<_>>();

    let mut entry_order = Vec::<String>::new();
    for hit in &top {
        if !entry_order.contains(&hit.entry_id) {
            entry_order.push(hit.entry_id.clone());
        }
    }
    let mut entries = Vec::with_capacity(entry_order.len());
    for entry_id in &entry_order {
        if let Some(entry) = get_entry(&state.db, entry_id).await? {
            entries.push(entry);
        }
    }
    let text = top
        .iter()
        .map(|hit| hit.content_text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    debug!(namespace = %namespace.namespace, results = top.len(), "knowledge search");
    Ok(SearchResult { entries, text })
}

pub async fn list(db: &PgPool, namespace_id: &str, request: &PageRequest) -> ApiResult<Page<Entry>> {
    let rows = sqlx::query(&format!(
        "SELECT {ENTRY_COLUMNS} FROM rag_entries WHERE namespace_id = $1 AND seq < $2 ORDER BY seq DESC LIMIT $3"
    ))
    .bind(namespace_id)
    .bind(request.seq_bound())
    .bind(request.fetch_limit())
    .fetch_all(db)
    .await?;
    let items = rows
        .iter()
        .map(|row| (row.get::<i64, _>("seq"), parse_entry_row(row)))
        .collect();
    Ok(request.finish(items))
}

pub async fn get_entry(db: &PgPool, entry_id: &str) -> ApiResult<Option<Entry>> {
    let row = sqlx::query(&format!("SELECT {ENTRY_COLUMNS} FROM rag_entries WHERE id = $1"))
        .bind(entry_id)
        .fetch_optional(db)
        .await?;
    Ok(row.as_ref().map(parse_entry_row))
}

/// Removes an entry; its chunks cascade.
pub async fn delete_entry(db: &PgPool, entry_id: &str) -> ApiResult<()> {
    sqlx::query("DELETE FROM rag_entries WHERE id = $1")
        .bind(entry_id)
        .execute(db)
        .await?;
    info!(entry_id = %entry_id, "knowledge entry deleted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(n: usize) -> String {
        (0..n).map(|i| format!("w{i}")).collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn chunks_overlap_by_configured_words() {
        let chunks = chunk_text(&words(900), CHUNK_WORDS, CHUNK_OVERLAP_WORDS);
        assert_eq!(chunks.len(), 3);
        assert!(chunks[0].starts_with("w0 "));
        assert!(chunks[0].ends_with(" w399"));
        assert!(chunks[1].starts_with("w340 "));
        assert!(chunks[2].starts_with("w680 "));
        assert!(chunks[2].ends_with(" w899"));
    }

    #[test]
    fn short_and_empty_texts() {
        assert!(chunk_text("   \n ", 400, 60).is_empty());
        assert_eq!(chunk_text("one  two\nthree", 400, 60), vec!["one two three"]);
    }

    fn existing(id: &str, hash: &str, status: EntryStatus, storage_id: Option<&str>) -> ExistingEntry {
        ExistingEntry {
            entry_id: id.into(),
            content_hash: hash.into(),
            status,
            storage_id: storage_id.map(str::to_string),
        }
    }

    #[test]
    fn first_upload_inserts_without_replacing() {
        assert_eq!(
            plan_add(&[], "h1", Some("s1")),
            AddPlan::Insert {
                replaced_entry_ids: vec![],
                replaced_storage_ids: vec![],
            }
        );
    }

    #[test]
    fn same_key_and_hash_is_unchanged() {
        let current = [existing("e1", "h1", EntryStatus::Ready, Some("s1"))];
        assert_eq!(
            plan_add(&current, "h1", Some("s2")),
            AddPlan::Unchanged {
                entry_id: "e1".into()
            }
        );
        let pending = [existing("e1", "h1", EntryStatus::Pending, Some("s1"))];
        assert!(matches!(
            plan_add(&pending, "h1", Some("s2")),
            AddPlan::Unchanged { .. }
        ));
    }

    #[test]
    fn new_hash_replaces_entry_and_frees_its_blob() {
        let current = [existing("e1", "h1", EntryStatus::Ready, Some("s1"))];
        assert_eq!(
            plan_add(&current, "h2", Some("s2")),
            AddPlan::Insert {
                replaced_entry_ids: vec!["e1".into()],
                replaced_storage_ids: vec!["s1".into()],
            }
        );
    }

    #[test]
    fn failed_entry_with_same_hash_is_re_added() {
        let current = [existing("e1", "h1", EntryStatus::Error, Some("s1"))];
        assert_eq!(
            plan_add(&current, "h1", Some("s2")),
            AddPlan::Insert {
                replaced_entry_ids: vec!["e1".into()],
                replaced_storage_ids: vec!["s1".into()],
            }
        );
    }

    #[test]
    fn replaced_blobs_skip_missing_shared_and_new_ids() {
        let current = [
            existing("e1", "h1", EntryStatus::Error, Some("s1")),
            existing("e2", "h2", EntryStatus::Ready, Some("s1")),
            existing("e3", "h3", EntryStatus::Ready, None),
            existing("e4", "h4", EntryStatus::Ready, Some("s9")),
        ];
        let AddPlan::Insert {
            replaced_entry_ids,
            replaced_storage_ids,
        } = plan_add(&current, "h5", Some("s9"))
        else {
            panic!("expected insert");
        };
        assert_eq!(replaced_entry_ids, vec!["e1", "e2", "e3", "e4"]);
        assert_eq!(replaced_storage_ids, vec!["s1"]);
    }

    #[test]
    fn fusion_rewards_agreement() {
        let ids = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        let fused = fuse_rankings(&ids(&["a", "b", "c"]), &ids(&["c", "d"]));
        assert_eq!(fused[0].0, "c");
        assert_eq!(fused[1].0, "a");
        let score_c = 1.0 / 63.0 + 1.0 / 61.0;
        assert!((fused[0].1 - score_c).abs() < 1e-12);
        assert_eq!(fused.len(), 4);
    }

    #[test]
    fn fusion_ties_keep_first_seen_order() {
        let ids = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        let fused = fuse_rankings(&ids(&["x"]), &ids(&["y"]));
        assert_eq!(fused[0].0, "x");
        assert_eq!(fused[1].0, "y");
    }

    #[test]
    fn pgvector_literal() {
        assert_eq!(embedding_to_pgvector(&[0.5, -1.0]), "[0.50000000,-1.00000000]");
    }

    #[test]
    fn entry_status_parsing() {
        assert_eq!(EntryStatus::parse("ready"), EntryStatus::Ready);
        assert_eq!(EntryStatus::parse("pending"), EntryStatus::Pending);
        assert_eq!(EntryStatus::parse("weird"), EntryStatus::Error);
    }

    #[test]
    fn metadata_tolerates_missing_fields() {
        let meta: EntryMetadata = serde_json::from_str(r#"{"uploadedBy":"org_1"}"#).unwrap();
        assert_eq!(meta.uploaded_by, "org_1");
        assert!(meta.storage_id.is_none());
        assert!(meta.category.is_none());
    }
}
