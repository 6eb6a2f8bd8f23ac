use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use futures::TryStreamExt;
use glob::Pattern;
use tokio::sync::Semaphore;

use common::cancel::CancelToken;
use common::identifier::ContentIdentifier;
use common::manifest::{Manifest, ManifestItem, ManifestItemType, EMPTY_DIRECTORY_SUFFIX};
use common::node::{build_tree, MerkleNode, NodeError};
use common::receipt::KeepUntil;

use crate::api::DedupStore;
use crate::chunker::{Chunker, FileDescriptor, FixedChunker};
use crate::config::ClientConfig;
use crate::download::{DownloadEngine, DownloadOutcome, DownloadStatistics};
use crate::error::{ClientError, Result};
use crate::upload::{chunk_sources, ProofIndex, UploadSession};

/**
 * Artifact client
 * ===============
 * The top-level orchestration: `publish` walks a source path into a
 *  manifest plus content tree under a single root and uploads it;
 *  `download` walks a manifest back into files on disk. The manifest
 *  itself is hashed and uploaded as one more file, so the returned
 *  root covers content and metadata together.
 */

#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Retention deadline to request. Defaults to the configured
    /// keep-until window from now.
    pub keep_until: Option<KeepUntil>,
}

#[derive(Debug, Clone)]
pub struct PublishResult {
    pub manifest_id: ContentIdentifier,
    pub root_id: ContentIdentifier,
    /// Hex-serialized nodes proving the manifest is covered by the
    /// root, nearest parent first.
    pub proof_nodes: Vec<String>,
    pub file_count: usize,
    pub content_size: u64,
}

#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    /// Single-artifact download: the manifest to materialize.
    pub manifest_id: Option<ContentIdentifier>,
    /// Multi-artifact download: artifact name to manifest identifier.
    /// Each artifact lands under `target_dir/{name}`.
    pub artifacts: HashMap<String, ContentIdentifier>,
    pub target_dir: PathBuf,
    /// Glob patterns selecting item paths; empty means everything.
    pub include_patterns: Vec<String>,
}

pub struct ArtifactClient {
    store: Arc<dyn DedupStore>,
    config: ClientConfig,
    chunker: Arc<dyn Chunker>,
    network: Arc<Semaphore>,
    cancel: CancelToken,
}

impl ArtifactClient {
    pub fn new(store: Arc<dyn DedupStore>, config: ClientConfig) -> Self {
        let chunker: Arc<dyn Chunker> = Arc::new(FixedChunker::new(config.chunk_size));
        let network = Arc::new(Semaphore::new(config.max_parallelism));
        Self {
            store,
            config,
            chunker,
            network,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_chunker(mut self, chunker: Arc<dyn Chunker>) -> Self {
        self.chunker = chunker;
        self
    }

    /// A clone of the client's cancellation token; cancelling it aborts
    /// in-flight publishes and downloads.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Publish a file or directory tree as one artifact.
    pub async fn publish(&self, source: &Path, options: PublishOptions) -> Result<PublishResult> {
        let descriptors = self.collect_descriptors(source)?;
        let manifest = manifest_from_descriptors(&descriptors);
        let file_count = manifest
            .items
            .iter()
            .filter(|i| i.item_type == ManifestItemType::File)
            .count();
        let content_size = manifest.content_size();

        // The manifest travels as one more hashed file under the root.
        let mut temp = tempfile::NamedTempFile::new()?;
        temp.write_all(manifest.to_json()?.as_bytes())?;
        temp.flush()?;
        let manifest_descriptor = FileDescriptor::hash_file(
            self.chunker.as_ref(),
            temp.path().to_path_buf(),
            "manifest".into(),
        )?;
        let manifest_id = manifest_descriptor.node.identifier();

        let mut all = descriptors;
        all.push(manifest_descriptor);
        let sources = chunk_sources(&all);
        let root = build_tree(all.iter().map(|d| d.node.clone()).collect())
            .ok_or_else(|| ClientError::Usage("nothing to publish".into()))?;
        let root_id = root.identifier();
        tracing::info!(
            root = %root_id,
            manifest = %manifest_id,
            files = file_count,
            bytes = content_size,
            "publishing artifact"
        );

        let keep_until = options
            .keep_until
            .unwrap_or_else(|| KeepUntil::after(self.config.keep_until_duration));
        let session = Arc::new(UploadSession::new(
            self.store.clone(),
            self.config.clone(),
            self.network.clone(),
            keep_until,
            sources,
            self.cancel.clone(),
        ));

        let progress = {
            let session = session.clone();
            let interval = self.config.stats_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let stats = session.statistics();
                    tracing::info!(
                        uploaded_mb = stats.content_bytes_uploaded / (1024 * 1024),
                        chunks = stats.chunks_uploaded,
                        dedup_saved_mb = stats.dedup_bytes_saved / (1024 * 1024),
                        "upload progress"
                    );
                }
            })
        };
        let upload_result = session.upload(&root).await;
        progress.abort();
        let _ = progress.await;

        if let Err(e) = temp.close() {
            tracing::warn!(error = %e, "failed to remove temporary manifest file");
        }
        upload_result?;

        let stats = session.statistics();
        tracing::info!(
            chunks = stats.chunks_uploaded,
            uploaded_mb = stats.content_bytes_uploaded / (1024 * 1024),
            dedup_saved_mb = stats.dedup_bytes_saved / (1024 * 1024),
            compression_saved_mb = stats.compression_bytes_saved / (1024 * 1024),
            "publish finished"
        );

        let index = match Arc::try_unwrap(session) {
            Ok(session) => session.into_proof_index(),
            Err(_) => ProofIndex::from_nodes(root.inner_nodes().cloned()),
        };
        let proof_nodes = index
            .proof_nodes(manifest_id)
            .into_iter()
            .map(|n| n.serialize().map(hex::encode))
            .collect::<std::result::Result<Vec<_>, NodeError>>()?;

        Ok(PublishResult {
            manifest_id,
            root_id,
            proof_nodes,
            file_count,
            content_size,
        })
    }

    /// Materialize one or more published artifacts under the target
    /// directory.
    pub async fn download(&self, options: DownloadOptions) -> Result<DownloadStatistics> {
        let multi = !options.artifacts.is_empty();
        if options.manifest_id.is_some() == multi {
            return Err(ClientError::Usage(
                "specify exactly one of manifest_id or artifacts".into(),
            ));
        }
        let patterns = options
            .include_patterns
            .iter()
            .map(|p| {
                Pattern::new(p).map_err(|e| ClientError::Usage(format!("bad pattern {p}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        let engine = DownloadEngine::new(
            self.store.clone(),
            self.config.clone(),
            self.network.clone(),
            self.cancel.clone(),
        );

        let mut excluded = HashSet::new();
        let result = {
            let run = async {
                if let Some(manifest_id) = options.manifest_id {
                    self.download_artifact(
                        &engine,
                        None,
                        manifest_id,
                        &options.target_dir,
                        &patterns,
                        &mut excluded,
                        0,
                    )
                    .await?;
                } else {
                    for (name, manifest_id) in &options.artifacts {
                        let target = options.target_dir.join(name);
                        self.download_artifact(
                            &engine,
                            Some(name),
                            *manifest_id,
                            &target,
                            &patterns,
                            &mut excluded,
                            0,
                        )
                        .await?;
                    }
                }
                Ok::<(), ClientError>(())
            };
            run.await
        };

        // logged even when the download failed partway
        let stats = engine.statistics();
        tracing::info!(
            chunks = stats.chunks_downloaded,
            downloaded_mb = stats.content_bytes_downloaded / (1024 * 1024),
            dedup_saved_mb = stats.dedup_bytes_saved / (1024 * 1024),
            "download finished"
        );
        result?;
        Ok(stats)
    }

    #[allow(clippy::too_many_arguments)]
    fn download_artifact<'a>(
        &'a self,
        engine: &'a DownloadEngine,
        artifact_name: Option<&'a str>,
        manifest_id: ContentIdentifier,
        target: &'a Path,
        patterns: &'a [Pattern],
        excluded: &'a mut HashSet<PathBuf>,
        depth: u8,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            let bytes = engine
                .read_blob(manifest_id)
                .await?
                .ok_or(ClientError::IncompleteTree {
                    root: manifest_id,
                    missing: manifest_id,
                })?;
            let text = std::str::from_utf8(&bytes)
                .map_err(|e| anyhow::anyhow!("manifest {manifest_id} is not utf-8: {e}"))?;
            let manifest = Manifest::from_json(text)?;
            let manifest = if patterns.is_empty() {
                manifest
            } else {
                manifest.filter(patterns, artifact_name)
            };
            tracing::info!(
                manifest = %manifest_id,
                artifact = artifact_name.unwrap_or_default(),
                items = manifest.items.len(),
                "downloading artifact"
            );

            for item in &manifest.items {
                if item.item_type == ManifestItemType::EmptyDirectory {
                    tokio::fs::create_dir_all(item_target(target, &item.path)).await?;
                }
            }

            let mut jobs = Vec::new();
            for item in &manifest.items {
                if item.item_type != ManifestItemType::File {
                    continue;
                }
                let blob = item.blob.as_ref().ok_or_else(|| {
                    ClientError::ProtocolViolation(format!(
                        "manifest {manifest_id} file item {} has no blob",
                        item.path
                    ))
                })?;
                let path = item_target(target, &item.path);
                // a path an earlier manifest already materialized wins
                if !excluded.insert(path.clone()) {
                    continue;
                }
                jobs.push((path, blob.id, blob.size));
            }

            futures::stream::iter(jobs.into_iter().map(Ok::<_, ClientError>))
                .try_for_each_concurrent(self.config.max_parallelism, |(path, id, size)| {
                    async move {
                        if let Some(parent) = path.parent() {
                            tokio::fs::create_dir_all(parent).await?;
                        }
                        if size == 0 {
                            tokio::fs::write(&path, &[]).await?;
                            return Ok(());
                        }
                        match engine.download_to_file(id, &path, size).await? {
                            DownloadOutcome::Completed => Ok(()),
                            // a blob the manifest declares must exist
                            DownloadOutcome::Absent => Err(ClientError::IncompleteTree {
                                root: id,
                                missing: id,
                            }),
                        }
                    }
                })
                .await?;

            if depth == 0 {
                for reference in &manifest.manifest_references {
                    self.download_artifact(
                        engine,
                        artifact_name,
                        reference.manifest_id,
                        target,
                        patterns,
                        excluded,
                        depth + 1,
                    )
                    .await?;
                }
            } else if !manifest.manifest_references.is_empty() {
                tracing::warn!(manifest = %manifest_id, "ignoring nested manifest references");
            }
            Ok(())
        }
        .boxed()
    }

    fn collect_descriptors(&self, source: &Path) -> Result<Vec<FileDescriptor>> {
        let mut descriptors = Vec::new();
        if source.is_file() {
            let name = source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| ClientError::Usage(format!("bad source path {source:?}")))?;
            descriptors.push(FileDescriptor::hash_file(
                self.chunker.as_ref(),
                source.to_path_buf(),
                format!("/{name}"),
            )?);
        } else if source.is_dir() {
            self.walk(source, source, &mut descriptors)?;
        } else {
            return Err(ClientError::Usage(format!(
                "source path {source:?} does not exist"
            )));
        }
        descriptors.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        Ok(descriptors)
    }

    fn walk(&self, root: &Path, dir: &Path, out: &mut Vec<FileDescriptor>) -> Result<()> {
        let entries = std::fs::read_dir(dir)?.collect::<std::io::Result<Vec<_>>>()?;
        if entries.is_empty() && dir != root {
            out.push(FileDescriptor {
                relative_path: format!("{}{EMPTY_DIRECTORY_SUFFIX}", relative_path(root, dir)?),
                absolute_path: dir.to_path_buf(),
                node: MerkleNode::chunk_of(&[]),
            });
            return Ok(());
        }
        for entry in entries {
            let path = entry.path();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                self.walk(root, &path, out)?;
            } else if file_type.is_file() {
                out.push(FileDescriptor::hash_file(
                    self.chunker.as_ref(),
                    path.clone(),
                    relative_path(root, &path)?,
                )?);
            } else {
                tracing::warn!(path = %path.display(), "skipping non-regular file");
            }
        }
        Ok(())
    }
}

fn manifest_from_descriptors(descriptors: &[FileDescriptor]) -> Manifest {
    let items = descriptors
        .iter()
        .map(|d| {
            if let Some(dir) = d.relative_path.strip_suffix(EMPTY_DIRECTORY_SUFFIX) {
                ManifestItem::empty_directory(dir.to_string())
            } else {
                ManifestItem::file(
                    d.relative_path.clone(),
                    d.node.identifier(),
                    d.node.transitive_size(),
                )
            }
        })
        .collect();
    Manifest::new(items)
}

/// Manifest item paths use forward slashes and a leading slash.
fn relative_path(root: &Path, path: &Path) -> Result<String> {
    let rel = path
        .strip_prefix(root)
        .map_err(|_| ClientError::Usage(format!("{path:?} is not under {root:?}")))?;
    let mut out = String::new();
    for component in rel.components() {
        out.push('/');
        out.push_str(&component.as_os_str().to_string_lossy());
    }
    Ok(out)
}

/// Map a manifest item path onto the target directory, refusing path
/// escapes.
fn item_target(target: &Path, item_path: &str) -> PathBuf {
    let mut out = target.to_path_buf();
    for part in item_path
        .split('/')
        .filter(|p| !p.is_empty() && *p != "." && *p != "..")
    {
        out.push(part);
    }
    out
}
