//! Catalogue loading, atomic reload, and applicability queries.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::error::CatalogError;
use crate::mitigation::{Mitigation, MitigationFile};
use crate::technique::{Technique, TechniqueSpec};
use crate::Result;

/// Rule name whose presence makes a technique path-argument dependent.
const PATH_RULE: &str = "path_traversal";

/// Which direction of traffic is being inspected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InspectionScope {
    /// Client request before forwarding.
    Request,
    /// Upstream response before delivery.
    Response,
}

/// What the dispatcher knows about a request when selecting techniques.
///
/// Applicability is a pure function of this probe: a path-traversal
/// technique is only applicable when the request actually carries a
/// path-like argument, and response inspection narrows to text-oriented
/// techniques.
#[derive(Debug, Clone, Default)]
pub struct ApplicabilityProbe {
    /// JSON-RPC method of the request being inspected.
    pub method: String,
    /// Routed tool name, when the method is a tool call.
    pub tool_name: Option<String>,
    /// True if any argument looks like a filesystem path.
    pub has_path_argument: bool,
    /// True if any argument looks like a URL or host.
    pub has_url_argument: bool,
}

/// Loading options.
#[derive(Debug, Clone, Default)]
pub struct CatalogOptions {
    /// Fail loading entirely when any descriptor is rejected.
    pub strict: bool,
    /// Explicit mitigations file. Defaults to `<root>/mitigations.json`.
    pub mitigations_path: Option<PathBuf>,
}

/// A descriptor that failed validation, kept for diagnostics.
#[derive(Debug, Clone)]
pub struct RejectedDescriptor {
    /// File that failed.
    pub path: PathBuf,
    /// Human-readable reason.
    pub reason: String,
}

/// Outcome of a `reload()` call.
#[derive(Debug, Clone)]
pub struct ReloadReport {
    /// Techniques in the new snapshot.
    pub loaded: usize,
    /// Descriptors rejected during the reload.
    pub rejected: usize,
}

/// An immutable view of the catalogue.
///
/// Snapshots are shared via `Arc`; a reload swaps the catalogue's current
/// snapshot while existing holders keep theirs.
#[derive(Debug)]
pub struct CatalogSnapshot {
    techniques: BTreeMap<String, Arc<Technique>>,
    mitigations: BTreeMap<String, Arc<Mitigation>>,
    rejected: Vec<RejectedDescriptor>,
}

impl CatalogSnapshot {
    /// Looks up a technique by id.
    pub fn lookup(&self, id: &str) -> Option<Arc<Technique>> {
        self.techniques.get(id).cloned()
    }

    /// All techniques in id order.
    pub fn list(&self) -> impl Iterator<Item = &Arc<Technique>> {
        self.techniques.values()
    }

    /// Number of loaded techniques.
    pub fn len(&self) -> usize {
        self.techniques.len()
    }

    /// True when no techniques loaded.
    pub fn is_empty(&self) -> bool {
        self.techniques.is_empty()
    }

    /// Descriptors rejected during the load that produced this snapshot.
    pub fn rejected(&self) -> &[RejectedDescriptor] {
        &self.rejected
    }

    /// Looks up a mitigation by id.
    pub fn mitigation(&self, id: &str) -> Option<Arc<Mitigation>> {
        self.mitigations.get(id).cloned()
    }

    /// The enabled techniques applicable to one request or response.
    ///
    /// Selection rules:
    /// - disabled techniques never participate;
    /// - techniques carrying the path-traversal rule require a path-like
    ///   argument to be present;
    /// - response inspection narrows to text-oriented techniques (pattern
    ///   matchers or the prompt-injection rule) since responses carry no
    ///   arguments to gate on.
    pub fn enabled_for(
        &self,
        scope: InspectionScope,
        probe: &ApplicabilityProbe,
    ) -> Vec<Arc<Technique>> {
        self.techniques
            .values()
            .filter(|technique| technique.spec.enabled)
            .filter(|technique| !technique.spec.detection.is_empty())
            .filter(|technique| {
                let needs_path = technique.has_rule(PATH_RULE);
                match scope {
                    InspectionScope::Request => !needs_path || probe.has_path_argument,
                    InspectionScope::Response => {
                        !needs_path
                            && (!technique.matchers.is_empty()
                                || technique.has_rule("prompt_injection"))
                    }
                }
            })
            .cloned()
            .collect()
    }
}

/// The technique catalogue: an atomically swappable snapshot plus the
/// descriptor root it was loaded from.
#[derive(Debug)]
pub struct Catalog {
    root: PathBuf,
    options: CatalogOptions,
    snapshot: RwLock<Arc<CatalogSnapshot>>,
}

impl Catalog {
    /// Loads every `SAFE-T*.json` descriptor under `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory is missing, or — in strict mode —
    /// if any descriptor fails validation. In non-strict mode rejected
    /// descriptors are recorded in the snapshot and loading continues.
    pub fn load(root: impl AsRef<Path>, options: CatalogOptions) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let snapshot = Self::build_snapshot(&root, &options)?;

        info!(
            techniques = snapshot.len(),
            rejected = snapshot.rejected().len(),
            root = %root.display(),
            "technique catalogue loaded"
        );

        Ok(Self {
            root,
            options,
            snapshot: RwLock::new(Arc::new(snapshot)),
        })
    }

    /// Re-reads descriptors and swaps the snapshot atomically.
    ///
    /// In-flight inspections continue against the snapshot they already
    /// hold; new inspections see the new one.
    pub fn reload(&self) -> Result<ReloadReport> {
        let snapshot = Self::build_snapshot(&self.root, &self.options)?;
        let report = ReloadReport {
            loaded: snapshot.len(),
            rejected: snapshot.rejected().len(),
        };
        *self.snapshot.write() = Arc::new(snapshot);
        info!(loaded = report.loaded, rejected = report.rejected, "catalogue reloaded");
        Ok(report)
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        self.snapshot.read().clone()
    }

    fn build_snapshot(root: &Path, options: &CatalogOptions) -> Result<CatalogSnapshot> {
        if !root.is_dir() {
            return Err(CatalogError::MissingDirectory(root.to_path_buf()));
        }

        let mut techniques: BTreeMap<String, Arc<Technique>> = BTreeMap::new();
        let mut rejected = Vec::new();

        let mut paths: Vec<PathBuf> = fs::read_dir(root)
            .map_err(|source| CatalogError::Io {
                path: root.to_path_buf(),
                source,
            })?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension().map(|ext| ext == "json").unwrap_or(false)
                    && path
                        .file_name()
                        .and_then(|name| name.to_str())
                        .map(|name| name.starts_with("SAFE-T"))
                        .unwrap_or(false)
            })
            .collect();
        paths.sort();

        for path in paths {
            match Self::load_descriptor(&path) {
                Ok(technique) => {
                    let id = technique.id().to_string();
                    if techniques.contains_key(&id) {
                        let err = CatalogError::DuplicateId {
                            technique_id: id,
                            path: path.clone(),
                        };
                        warn!(path = %path.display(), "{}", err);
                        rejected.push(RejectedDescriptor {
                            path,
                            reason: err.to_string(),
                        });
                        continue;
                    }
                    debug!(id = %id, path = %path.display(), "loaded technique descriptor");
                    techniques.insert(id, Arc::new(technique));
                }
                Err(err) => {
                    warn!(path = %path.display(), "rejected technique descriptor: {}", err);
                    rejected.push(RejectedDescriptor {
                        path,
                        reason: err.to_string(),
                    });
                }
            }
        }

        if options.strict && !rejected.is_empty() {
            return Err(CatalogError::StrictValidation {
                rejected: rejected.len(),
            });
        }

        let mitigations = Self::load_mitigations(root, options)?;

        Ok(CatalogSnapshot {
            techniques,
            mitigations,
            rejected,
        })
    }

    fn load_descriptor(path: &Path) -> Result<Technique> {
        let raw = fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let spec: TechniqueSpec =
            serde_json::from_str(&raw).map_err(|source| CatalogError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        Technique::compile(spec)
    }

    fn load_mitigations(
        root: &Path,
        options: &CatalogOptions,
    ) -> Result<BTreeMap<String, Arc<Mitigation>>> {
        let path = options
            .mitigations_path
            .clone()
            .unwrap_or_else(|| root.join("mitigations.json"));

        if !path.is_file() {
            debug!(path = %path.display(), "no mitigations file; continuing without");
            return Ok(BTreeMap::new());
        }

        let raw = fs::read_to_string(&path).map_err(|err| CatalogError::Mitigations {
            path: path.clone(),
            reason: err.to_string(),
        })?;
        let file: MitigationFile =
            serde_json::from_str(&raw).map_err(|err| CatalogError::Mitigations {
                path: path.clone(),
                reason: err.to_string(),
            })?;

        Ok(file
            .into_iter()
            .map(|(id, mitigation)| (id, Arc::new(mitigation)))
            .collect())
    }
}
