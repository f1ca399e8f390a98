/// Hot-reload component registry using ArcSwap
///
/// Resolves `(namespace, name)` to a cached `{manifest, code}` pair and runs it in
/// the process sandbox. The whole cache is one immutable snapshot: `refresh`
/// builds a new map and swaps the pointer, so an `execute` in flight always sees
/// a manifest and code from the same epoch.

use crate::{
    component::manifest::{is_safe_name, ComponentManifest, InputSpec, Namespace},
    error::EngineError,
    sandbox::{CallContext, ProcessRequest, ProcessSandbox},
    store::DocumentStore,
};
use arc_swap::ArcSwap;
use serde::Serialize;
use serde_json::{Map, Value};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::sync::Mutex;

/// Document store directory holding user components
pub const USER_COMPONENT_ROOT: &str = "components/user";

const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ComponentKey {
    namespace: Namespace,
    name: String,
}

impl ComponentKey {
    fn new(namespace: Namespace, name: &str) -> Self {
        Self {
            namespace,
            name: name.to_string(),
        }
    }
}

/// Manifest and code cached together as one entry
#[derive(Debug)]
pub struct CachedComponent {
    pub namespace: Namespace,
    pub manifest: ComponentManifest,
    pub code: String,
}

/// Listing view of a component
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSummary {
    pub namespace: Namespace,
    pub name: String,
    pub version: String,
    pub description: String,
    pub inputs: Vec<InputSpec>,
}

type ComponentCache = HashMap<ComponentKey, Arc<CachedComponent>>;

/// Lock-free component registry
pub struct ComponentRegistry {
    local_dir: PathBuf,
    store: Arc<dyn DocumentStore>,
    sandbox: Arc<ProcessSandbox>,
    /// Atomic pointer to the current cache snapshot
    cache: ArcSwap<ComponentCache>,
    /// Bumped on every rebuild; lazy loads from an older epoch are not memoized
    epoch: AtomicU64,
    /// Serializes snapshot writers (rebuilds and lazy inserts)
    write_lock: Mutex<()>,
}

impl ComponentRegistry {
    pub fn new(
        local_dir: impl Into<PathBuf>,
        store: Arc<dyn DocumentStore>,
        sandbox: Arc<ProcessSandbox>,
    ) -> Self {
        Self {
            local_dir: local_dir.into(),
            store,
            sandbox,
            cache: ArcSwap::new(Arc::new(HashMap::new())),
            epoch: AtomicU64::new(0),
            write_lock: Mutex::new(()),
        }
    }

    pub fn sandbox(&self) -> &Arc<ProcessSandbox> {
        &self.sandbox
    }

    /// Eagerly load every `local` component and reset the user cache
    ///
    /// Returns the number of local components loaded.
    pub async fn initialize(&self) -> Result<usize, EngineError> {
        let _guard = self.write_lock.lock().await;

        let fresh = load_local_components(&self.local_dir).await?;
        let count = fresh.len();

        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.cache.store(Arc::new(fresh));

        tracing::info!(
            "📦 Initialized component registry with {} local components from {}",
            count,
            self.local_dir.display()
        );
        Ok(count)
    }

    /// Drop every cached component and reload
    ///
    /// Executions that start after this returns see the new code.
    pub async fn refresh(&self) -> Result<usize, EngineError> {
        tracing::info!("🔄 Refreshing component registry");
        self.initialize().await
    }

    /// Resolve a component, lazily loading user components
    pub async fn resolve(
        &self,
        namespace: Namespace,
        name: &str,
    ) -> Result<Arc<CachedComponent>, EngineError> {
        let key = ComponentKey::new(namespace, name);
        if let Some(component) = self.cache.load().get(&key) {
            return Ok(Arc::clone(component));
        }

        match namespace {
            Namespace::Local => Err(not_found(namespace, name)),
            Namespace::User => self.load_user_component(key).await,
        }
    }

    /// Check call inputs against a schema
    ///
    /// Required entries must be present and non-null. Absent optional entries take
    /// their declared default. Keys the schema does not mention pass through.
    pub fn validate_inputs(
        schema: &[InputSpec],
        inputs: &Map<String, Value>,
    ) -> Result<Map<String, Value>, EngineError> {
        let mut resolved = inputs.clone();
        for spec in schema {
            let present = resolved.get(&spec.id).is_some_and(|v| !v.is_null());
            if present {
                continue;
            }
            if spec.required {
                return Err(EngineError::MissingRequiredInput(spec.id.clone()));
            }
            if let Some(default) = &spec.default {
                resolved.insert(spec.id.clone(), default.clone());
            }
        }
        Ok(resolved)
    }

    /// Resolve, validate and run a component in the process sandbox
    pub async fn execute(
        &self,
        namespace: &str,
        name: &str,
        inputs: Map<String, Value>,
        call_context: &CallContext,
    ) -> Result<Value, EngineError> {
        let namespace: Namespace = namespace.parse().map_err(|_| EngineError::ComponentNotFound {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })?;
        let component = self.resolve(namespace, name).await?;
        let inputs = Self::validate_inputs(&component.manifest.inputs, &inputs)?;

        let label = format!("{}/{}", namespace, name);
        tracing::info!(
            "🚀 Executing component {} v{} (call {})",
            label,
            component.manifest.version,
            call_context.call_id
        );

        self.sandbox
            .run(ProcessRequest {
                label: &label,
                runtime: &component.manifest.runtime,
                code: &component.code,
                inputs: &inputs,
                context: call_context,
            })
            .await
    }

    /// All local components plus every user component in the store
    pub async fn list(&self) -> Result<Vec<ComponentSummary>, EngineError> {
        let mut summaries: Vec<ComponentSummary> = self
            .cache
            .load()
            .values()
            .filter(|c| c.namespace == Namespace::Local)
            .map(|c| summarize(c))
            .collect();

        let user_names = self
            .store
            .list_directory(USER_COMPONENT_ROOT)
            .await
            .map_err(EngineError::store)?;
        for name in user_names {
            match self.resolve(Namespace::User, &name).await {
                Ok(component) => summaries.push(summarize(&component)),
                Err(e) => tracing::warn!("⚠️ Skipping user component '{}': {}", name, e),
            }
        }

        summaries.sort_by(|a, b| (a.namespace.as_str(), &a.name).cmp(&(b.namespace.as_str(), &b.name)));
        Ok(summaries)
    }

    /// Create or replace a user component, then refresh
    pub async fn save_user_component(
        &self,
        manifest: &ComponentManifest,
        code: &str,
    ) -> Result<(), EngineError> {
        if !is_safe_name(&manifest.name) {
            return Err(EngineError::InvalidInput(format!(
                "component name '{}' is not a plain identifier",
                manifest.name
            )));
        }
        let raw = serde_json::to_string_pretty(manifest)
            .map_err(|e| EngineError::InvalidInput(e.to_string()))?;
        // Round-trip through the loader's validation so nothing unloadable gets stored
        ComponentManifest::parse(&raw, &manifest.name)?;

        let dir = format!("{}/{}", USER_COMPONENT_ROOT, manifest.name);
        self.store.create_directory(&dir).await.map_err(EngineError::store)?;
        self.store
            .write_file(&format!("{}/{}", dir, MANIFEST_FILE), &raw)
            .await
            .map_err(EngineError::store)?;
        self.store
            .write_file(&format!("{}/{}", dir, manifest.entry), code)
            .await
            .map_err(EngineError::store)?;

        tracing::info!("💾 Saved user component {} v{}", manifest.name, manifest.version);
        self.refresh().await?;
        Ok(())
    }

    /// Delete a user component, then refresh. Returns whether it existed.
    pub async fn delete_user_component(&self, name: &str) -> Result<bool, EngineError> {
        if !is_safe_name(name) {
            return Ok(false);
        }
        let dir = format!("{}/{}", USER_COMPONENT_ROOT, name);
        let existed = self
            .store
            .read_file(&format!("{}/{}", dir, MANIFEST_FILE))
            .await
            .map_err(EngineError::store)?
            .is_some();
        if existed {
            self.store.delete_file(&dir).await.map_err(EngineError::store)?;
            tracing::info!("🗑️ Deleted user component {}", name);
            self.refresh().await?;
        }
        Ok(existed)
    }

    async fn load_user_component(
        &self,
        key: ComponentKey,
    ) -> Result<Arc<CachedComponent>, EngineError> {
        let name = key.name.as_str();
        if !is_safe_name(name) {
            return Err(not_found(key.namespace, name));
        }
        let epoch = self.epoch.load(Ordering::SeqCst);
        let dir = format!("{}/{}", USER_COMPONENT_ROOT, name);

        tracing::debug!("📥 Lazily loading user component {}", name);
        let raw = self
            .store
            .read_file(&format!("{}/{}", dir, MANIFEST_FILE))
            .await
            .map_err(EngineError::store)?
            .ok_or_else(|| not_found(key.namespace, name))?;

        let manifest = ComponentManifest::parse(&raw, &dir).inspect_err(|e| {
            tracing::warn!("⚠️ Rejecting user component {}: {}", name, e);
        })?;
        if manifest.name != name {
            tracing::warn!(
                "⚠️ User component directory '{}' declares name '{}'",
                name,
                manifest.name
            );
        }

        let code = self
            .store
            .read_file(&format!("{}/{}", dir, manifest.entry))
            .await
            .map_err(EngineError::store)?
            .ok_or_else(|| EngineError::InvalidManifest {
                component: dir.clone(),
                reason: format!("code file '{}' is missing", manifest.entry),
            })?;

        let component = Arc::new(CachedComponent {
            namespace: Namespace::User,
            manifest,
            code,
        });

        let _guard = self.write_lock.lock().await;
        if self.epoch.load(Ordering::SeqCst) == epoch {
            self.cache.rcu(|cache| {
                let mut next = ComponentCache::clone(cache);
                next.insert(key.clone(), Arc::clone(&component));
                next
            });
        } else {
            tracing::debug!("⏭️ Registry refreshed while loading {}, not memoizing", name);
        }

        Ok(component)
    }
}

fn not_found(namespace: Namespace, name: &str) -> EngineError {
    EngineError::ComponentNotFound {
        namespace: namespace.to_string(),
        name: name.to_string(),
    }
}

fn summarize(component: &CachedComponent) -> ComponentSummary {
    ComponentSummary {
        namespace: component.namespace,
        name: component.manifest.name.clone(),
        version: component.manifest.version.clone(),
        description: component.manifest.description.clone(),
        inputs: component.manifest.inputs.clone(),
    }
}

/// Scan `dir` for component subdirectories; broken ones are skipped with a warning
async fn load_local_components(dir: &Path) -> Result<ComponentCache, EngineError> {
    let mut cache = ComponentCache::new();

    if !tokio::fs::try_exists(dir).await? {
        tracing::warn!("⚠️ Local component directory does not exist: {}", dir.display());
        return Ok(cache);
    }

    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }

        match load_local_component(&path).await {
            Ok(component) => {
                let key = ComponentKey::new(Namespace::Local, &component.manifest.name);
                tracing::debug!(
                    "  ➕ Loaded local component {} v{}",
                    component.manifest.name,
                    component.manifest.version
                );
                if cache.insert(key, Arc::new(component)).is_some() {
                    tracing::warn!(
                        "⚠️ Duplicate local component name in {}, keeping the last one read",
                        path.display()
                    );
                }
            }
            Err(e) => tracing::warn!("⚠️ Skipping component at {}: {}", path.display(), e),
        }
    }

    Ok(cache)
}

async fn load_local_component(dir: &Path) -> Result<CachedComponent, EngineError> {
    let origin = dir.display().to_string();
    let raw = tokio::fs::read_to_string(dir.join(MANIFEST_FILE))
        .await
        .map_err(|e| EngineError::InvalidManifest {
            component: origin.clone(),
            reason: format!("unreadable {}: {}", MANIFEST_FILE, e),
        })?;
    let manifest = ComponentManifest::parse(&raw, &origin)?;

    let code = tokio::fs::read_to_string(dir.join(&manifest.entry))
        .await
        .map_err(|e| EngineError::InvalidManifest {
            component: origin.clone(),
            reason: format!("unreadable code file '{}': {}", manifest.entry, e),
        })?;

    Ok(CachedComponent {
        namespace: Namespace::Local,
        manifest,
        code,
    })
}
