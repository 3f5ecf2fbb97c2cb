//! Note relationship graph.
//!
//! Nodes are indexed files. Explicit edges come from `[[wiki links]]`,
//! implicit edges from embedding similarity between the first chunks of
//! files. Results are cached per repository revision and config
//! fingerprint, so repeated UI fetches are free until something changes.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;

use once_cell::sync::Lazy;
use petgraph::graph::DiGraph;
use petgraph::graph::NodeIndex;
use regex::Regex;
use serde::Serialize;

use crate::config::GraphConfig;
use crate::error::Result;
use crate::storage::NoteRepository;

/// Top-K used when probing for implicit neighbors.
const IMPLICIT_SEARCH_K: usize = 10;

/// `[[Target]]` or `[[Target|alias]]`.
static WIKI_LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[\[([^\[\]]+)\]\]").expect("valid wiki-link regex"));

/// Graph node: one per indexed file.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct GraphNode {
    pub id: i64,
    pub label: String,
    pub path: String,
    #[serde(rename = "type")]
    pub node_type: String,
    /// Node weight, proportional to chunk count.
    pub val: f64,
}

/// Graph edge.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct GraphLink {
    pub source_id: i64,
    pub target_id: i64,
    #[serde(rename = "type")]
    pub link_type: String,
    pub strength: f32,
}

/// Complete graph payload for the UI.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct GraphData {
    pub nodes: Vec<GraphNode>,
    pub links: Vec<GraphLink>,
}

/// Extract wiki-link targets from note content, alias part stripped.
pub fn extract_wiki_links(content: &str) -> Vec<String> {
    WIKI_LINK
        .captures_iter(content)
        .filter_map(|cap| {
            let target = cap.get(1)?.as_str();
            let target = target.split('|').next().unwrap_or(target).trim();
            (!target.is_empty()).then(|| target.to_string())
        })
        .collect()
}

struct CacheEntry {
    revision: i64,
    fingerprint: String,
    data: Arc<GraphData>,
}

/// Builds and caches the note graph.
pub struct GraphBuilder {
    repository: Arc<NoteRepository>,
    config: RwLock<GraphConfig>,
    cache: Mutex<Option<CacheEntry>>,
}

impl GraphBuilder {
    pub fn new(repository: Arc<NoteRepository>, config: GraphConfig) -> Self {
        Self {
            repository,
            config: RwLock::new(config),
            cache: Mutex::new(None),
        }
    }

    pub fn config(&self) -> GraphConfig {
        self.config.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn set_config(&self, config: GraphConfig) {
        *self.config.write().unwrap_or_else(|p| p.into_inner()) = config;
    }

    /// Build the graph, or return the cached result when neither the
    /// repository revision nor the configuration changed.
    pub async fn build(&self) -> Result<Arc<GraphData>> {
        let revision = self.repository.revision();
        let config = self.config();
        let fingerprint = config.fingerprint();

        {
            let cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(entry) = cache.as_ref() {
                if entry.revision == revision && entry.fingerprint == fingerprint {
                    return Ok(Arc::clone(&entry.data));
                }
            }
        }

        let data = Arc::new(self.compute(&config).await?);

        // The revision captured before computing keys the cache; a write
        // racing the build just forces the next call to recompute.
        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        *cache = Some(CacheEntry {
            revision,
            fingerprint,
            data: Arc::clone(&data),
        });
        Ok(data)
    }

    async fn compute(&self, config: &GraphConfig) -> Result<GraphData> {
        let files = self.repository.list_files().await?;
        let chunked: HashMap<i64, i64> = self
            .repository
            .list_files_with_chunks()
            .await?
            .into_iter()
            .map(|(file, count)| (file.id, count))
            .collect();

        // Graph assembly: petgraph nodes keyed by file id, with a side
        // map for lookup.
        let mut graph: DiGraph<i64, (String, f32)> = DiGraph::new();
        let mut node_indices: HashMap<i64, NodeIndex> = HashMap::new();
        let mut nodes = Vec::with_capacity(files.len());

        // Case-insensitive resolution against titles and basenames.
        let mut resolution: HashMap<String, i64> = HashMap::new();
        for file in &files {
            let idx = graph.add_node(file.id);
            node_indices.insert(file.id, idx);
            nodes.push(GraphNode {
                id: file.id,
                label: file.title.clone(),
                path: file.path.clone(),
                node_type: "note".to_string(),
                val: chunked.get(&file.id).copied().unwrap_or(0) as f64,
            });
            resolution.insert(file.title.to_lowercase(), file.id);
            if let Some(stem) = std::path::Path::new(&file.path)
                .file_stem()
                .and_then(|s| s.to_str())
            {
                resolution.insert(stem.to_lowercase(), file.id);
            }
        }

        self.add_explicit_edges(&files, &resolution, &mut graph, &node_indices)
            .await?;

        if config.show_implicit_links {
            // A vector-engine failure degrades to explicit edges only.
            if let Err(e) = self
                .add_implicit_edges(config, &mut graph, &node_indices)
                .await
            {
                tracing::warn!(error = %e, "implicit edges unavailable, returning explicit only");
            }
        }

        let links = graph
            .edge_indices()
            .filter_map(|edge| {
                let (a, b) = graph.edge_endpoints(edge)?;
                let (link_type, strength) = graph.edge_weight(edge)?.clone();
                Some(GraphLink {
                    source_id: *graph.node_weight(a)?,
                    target_id: *graph.node_weight(b)?,
                    link_type,
                    strength,
                })
            })
            .collect();

        Ok(GraphData { nodes, links })
    }

    /// Wiki-link edges, resolved case-insensitively against titles and
    /// basenames; unresolved and self links are dropped.
    async fn add_explicit_edges(
        &self,
        files: &[crate::types::NoteFile],
        resolution: &HashMap<String, i64>,
        graph: &mut DiGraph<i64, (String, f32)>,
        node_indices: &HashMap<i64, NodeIndex>,
    ) -> Result<()> {
        let mut seen: HashSet<(i64, i64)> = HashSet::new();

        for file in files {
            let chunks = self.repository.get_chunks_by_file_id(file.id).await?;
            if chunks.is_empty() {
                continue;
            }
            let content: String = chunks
                .iter()
                .map(|c| c.content.as_str())
                .collect::<Vec<_>>()
                .join("\n");

            for target in extract_wiki_links(&content) {
                let Some(&target_id) = resolution.get(&target.to_lowercase()) else {
                    continue;
                };
                if target_id == file.id || !seen.insert((file.id, target_id)) {
                    continue;
                }
                if let (Some(&a), Some(&b)) =
                    (node_indices.get(&file.id), node_indices.get(&target_id))
                {
                    graph.add_edge(a, b, ("explicit".to_string(), 1.0));
                }
            }
        }
        Ok(())
    }

    /// Similarity edges between first chunks, one record per unordered
    /// pair with `source < target` by id.
    async fn add_implicit_edges(
        &self,
        config: &GraphConfig,
        graph: &mut DiGraph<i64, (String, f32)>,
        node_indices: &HashMap<i64, NodeIndex>,
    ) -> Result<()> {
        let firsts = self
            .repository
            .first_chunks(config.max_nodes.max(1) as usize)
            .await?;

        let chunk_owner: HashMap<i64, i64> = firsts
            .iter()
            .map(|(file_id, chunk)| (chunk.id, *file_id))
            .collect();

        let embedded: Vec<(i64, Vec<f32>)> = firsts
            .into_iter()
            .filter_map(|(file_id, chunk)| chunk.embedding.map(|v| (file_id, v)))
            .collect();
        if embedded.is_empty() {
            return Ok(());
        }

        let queries: Vec<Vec<f32>> = embedded.iter().map(|(_, v)| v.clone()).collect();
        let results = self
            .repository
            .batch_search_raw(&queries, IMPLICIT_SEARCH_K)
            .await?;

        let mut seen: HashSet<(i64, i64)> = HashSet::new();
        for ((source_file, _), hits) in embedded.iter().zip(results) {
            for hit in hits {
                if hit.similarity < config.min_similarity_threshold {
                    continue;
                }
                // Only first chunks of other files count.
                let Some(&target_file) = chunk_owner.get(&hit.chunk_id) else {
                    continue;
                };
                if target_file == *source_file {
                    continue;
                }
                let pair = (
                    (*source_file).min(target_file),
                    (*source_file).max(target_file),
                );
                if !seen.insert(pair) {
                    continue;
                }
                if let (Some(&a), Some(&b)) = (node_indices.get(&pair.0), node_indices.get(&pair.1))
                {
                    graph.add_edge(a, b, ("implicit".to_string(), hit.similarity));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::testing::test_service;
    use crate::ai::testing::TEST_DIMENSION;
    use crate::config::IndexingConfig;
    use crate::indexing::IndexOptions;
    use crate::indexing::IndexPipeline;
    use crate::storage::SqliteStore;
    use tempfile::TempDir;

    #[test]
    fn test_extract_wiki_links() {
        let content = "See [[Alpha]] and [[Beta|the beta note]].\nBroken [[ ]] ignored.";
        assert_eq!(extract_wiki_links(content), ["Alpha", "Beta"]);
        assert!(extract_wiki_links("no links here").is_empty());
    }

    struct Fixture {
        _dir: TempDir,
        repository: Arc<NoteRepository>,
        pipeline: Arc<IndexPipeline>,
        builder: GraphBuilder,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(
            SqliteStore::open(&dir.path().join("data/notebit.sqlite"), TEST_DIMENSION as i32)
                .unwrap(),
        );
        let repository = Arc::new(NoteRepository::new(store, "sqlite-vec").unwrap());
        let ai = Arc::new(test_service("ok"));
        let pipeline = Arc::new(IndexPipeline::new(
            repository.clone(),
            ai,
            &IndexingConfig::default(),
        ));
        pipeline.start_workers();
        let builder = GraphBuilder::new(repository.clone(), GraphConfig::default());
        Fixture {
            _dir: dir,
            repository,
            pipeline,
            builder,
        }
    }

    async fn save(fx: &Fixture, path: &str, content: &str) {
        fx.pipeline
            .enqueue_save(
                path,
                content.to_string(),
                1,
                content.len() as i64,
                IndexOptions::default(),
            )
            .await;
        fx.pipeline.wait_idle().await;
    }

    #[tokio::test]
    async fn test_nodes_and_explicit_edges() {
        let fx = fixture().await;
        save(&fx, "alpha.md", "# Alpha\n\nlinks to [[beta]] by basename").await;
        save(&fx, "beta.md", "# Beta Note\n\nlinks to [[ALPHA]] by title").await;
        save(&fx, "loner.md", "# Loner\n\nlinks to [[Nowhere]]").await;

        let graph = fx.builder.build().await.unwrap();
        assert_eq!(graph.nodes.len(), 3);
        assert!(graph.nodes.iter().all(|n| n.val > 0.0));

        let explicit: Vec<&GraphLink> = graph
            .links
            .iter()
            .filter(|l| l.link_type == "explicit")
            .collect();
        assert_eq!(explicit.len(), 2);
        assert!(explicit.iter().all(|l| (l.strength - 1.0).abs() < f32::EPSILON));

        let alpha = graph.nodes.iter().find(|n| n.label == "Alpha").unwrap();
        let beta = graph.nodes.iter().find(|n| n.label == "Beta Note").unwrap();
        assert!(explicit
            .iter()
            .any(|l| l.source_id == alpha.id && l.target_id == beta.id));
        assert!(explicit
            .iter()
            .any(|l| l.source_id == beta.id && l.target_id == alpha.id));
    }

    #[tokio::test]
    async fn test_implicit_edges_above_threshold() {
        let fx = fixture().await;
        // Shared vocabulary gives the first chunks high cosine similarity.
        save(&fx, "a.md", "# A\n\nrust async tokio runtime scheduler").await;
        save(&fx, "b.md", "# B\n\nrust async tokio runtime executor").await;
        save(&fx, "c.md", "# C\n\ngardening compost tomatoes watering").await;

        let mut config = GraphConfig::default();
        config.min_similarity_threshold = 0.4;
        fx.builder.set_config(config);

        let graph = fx.builder.build().await.unwrap();
        let implicit: Vec<&GraphLink> = graph
            .links
            .iter()
            .filter(|l| l.link_type == "implicit")
            .collect();
        assert!(!implicit.is_empty());
        for link in &implicit {
            assert!(link.source_id < link.target_id);
            assert!(link.strength >= 0.4);
        }

        let a = graph.nodes.iter().find(|n| n.label == "A").unwrap();
        let b = graph.nodes.iter().find(|n| n.label == "B").unwrap();
        assert!(implicit
            .iter()
            .any(|l| l.source_id == a.id.min(b.id) && l.target_id == a.id.max(b.id)));
    }

    #[tokio::test]
    async fn test_implicit_edges_can_be_disabled() {
        let fx = fixture().await;
        save(&fx, "a.md", "# A\n\nrust async tokio").await;
        save(&fx, "b.md", "# B\n\nrust async tokio").await;

        let mut config = GraphConfig::default();
        config.show_implicit_links = false;
        fx.builder.set_config(config);

        let graph = fx.builder.build().await.unwrap();
        assert!(graph.links.iter().all(|l| l.link_type != "implicit"));
    }

    #[tokio::test]
    async fn test_cache_hit_and_invalidation() {
        let fx = fixture().await;
        save(&fx, "a.md", "# A\n\ncontent one").await;

        let first = fx.builder.build().await.unwrap();
        let second = fx.builder.build().await.unwrap();
        // Same revision and config: the cached Arc is returned.
        assert!(Arc::ptr_eq(&first, &second));

        save(&fx, "b.md", "# B\n\ncontent two").await;
        let third = fx.builder.build().await.unwrap();
        assert!(!Arc::ptr_eq(&second, &third));
        assert_eq!(third.nodes.len(), 2);

        // Config change invalidates too.
        let mut config = GraphConfig::default();
        config.max_nodes = 7;
        fx.builder.set_config(config);
        let fourth = fx.builder.build().await.unwrap();
        assert!(!Arc::ptr_eq(&third, &fourth));
    }

    #[tokio::test]
    async fn test_engine_failure_keeps_explicit_edges() {
        use crate::error::NotebitErr;
        use crate::types::ChunkHit;
        use async_trait::async_trait;

        struct FailingEngine;

        #[async_trait]
        impl crate::storage::VectorEngine for FailingEngine {
            fn name(&self) -> &'static str {
                // Pretends to be brute force so there is no fallback left.
                "brute-force"
            }
            async fn insert(&self, _: i64, _: &[f32]) -> crate::error::Result<()> {
                Ok(())
            }
            async fn delete(&self, _: &[i64]) -> crate::error::Result<()> {
                Ok(())
            }
            async fn search(&self, _: &[f32], _: usize) -> crate::error::Result<Vec<ChunkHit>> {
                Err(NotebitErr::db("search", "engine down"))
            }
        }

        let fx = fixture().await;
        save(&fx, "alpha.md", "# Alpha\n\nsee [[Beta]]").await;
        save(&fx, "beta.md", "# Beta\n\nsee [[Alpha]]").await;

        fx.repository
            .install_engine("brute-force", Arc::new(FailingEngine));

        let graph = fx.builder.build().await.unwrap();
        assert_eq!(graph.nodes.len(), 2);
        assert!(graph.links.iter().any(|l| l.link_type == "explicit"));
        assert!(graph.links.iter().all(|l| l.link_type != "implicit"));
    }
}
