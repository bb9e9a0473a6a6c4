//! In-memory object store.
//!
//! All three collections live behind one lock so a write and the watch event
//! it produces are ordered consistently. Not durable.

use crate::types::{App, AppFilter, BindingFilter, BindingScope, MultiClusterApp, RoleBinding};
use crate::{Object, ObjectStore, StoreError, StoreResult, WatchEvent};
use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::RwLock;
use tokio::sync::broadcast;

const WATCH_CAPACITY: usize = 1024;

#[derive(Default)]
struct State {
    mcapps: IndexMap<String, MultiClusterApp>,
    apps: IndexMap<String, App>,
    bindings: IndexMap<String, RoleBinding>,
    next_binding_id: u64,
}

pub struct InMemoryStore {
    state: RwLock<State>,
    events: broadcast::Sender<WatchEvent>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        InMemoryStore {
            state: RwLock::new(State::default()),
            events,
        }
    }

    fn emit(&self, event: WatchEvent) {
        // No receivers is fine; the controller may not be running yet.
        let _ = self.events.send(event);
    }
}

fn check_version(kind: &'static str, id: &str, expected: u64, actual: u64) -> StoreResult<()> {
    if expected != actual {
        return Err(StoreError::Conflict {
            kind,
            id: id.to_string(),
            expected,
            actual,
        });
    }
    Ok(())
}

fn binding_prefix(scope: &BindingScope) -> &'static str {
    match scope {
        BindingScope::Cluster(_) => "crtb",
        BindingScope::Project(_) => "prtb",
    }
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn get_mcapp(&self, id: &str) -> StoreResult<MultiClusterApp> {
        self.state
            .read()
            .mcapps
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: "multiclusterapp",
                id: id.to_string(),
            })
    }

    async fn list_mcapps(&self) -> StoreResult<Vec<MultiClusterApp>> {
        Ok(self.state.read().mcapps.values().cloned().collect())
    }

    async fn create_mcapp(&self, mut mcapp: MultiClusterApp) -> StoreResult<MultiClusterApp> {
        let id = mcapp.id();
        {
            let mut state = self.state.write();
            if state.mcapps.contains_key(&id) {
                return Err(StoreError::AlreadyExists {
                    kind: "multiclusterapp",
                    id,
                });
            }
            mcapp.metadata.resource_version = 1;
            mcapp.metadata.generation = 1;
            state.mcapps.insert(id.clone(), mcapp.clone());
            self.emit(WatchEvent::Added(Object::MultiClusterApp(mcapp.clone())));
        }
        tracing::debug!(mcapp = %id, "stored multiclusterapp");
        Ok(mcapp)
    }

    async fn update_mcapp(&self, mut mcapp: MultiClusterApp) -> StoreResult<MultiClusterApp> {
        let id = mcapp.id();
        let mut state = self.state.write();
        let stored = state
            .mcapps
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound {
                kind: "multiclusterapp",
                id: id.clone(),
            })?;
        check_version(
            "multiclusterapp",
            &id,
            mcapp.metadata.resource_version,
            stored.metadata.resource_version,
        )?;

        mcapp.metadata.resource_version = stored.metadata.resource_version + 1;
        mcapp.metadata.generation = if mcapp.spec != stored.spec {
            stored.metadata.generation + 1
        } else {
            stored.metadata.generation
        };
        // Identity and provenance are not writable through updates.
        mcapp.metadata.creator_id = stored.metadata.creator_id.clone();

        let old = std::mem::replace(stored, mcapp.clone());
        self.emit(WatchEvent::Modified {
            old: Object::MultiClusterApp(old),
            new: Object::MultiClusterApp(mcapp.clone()),
        });
        Ok(mcapp)
    }

    async fn delete_mcapp(&self, id: &str) -> StoreResult<MultiClusterApp> {
        let mut state = self.state.write();
        let removed = state
            .mcapps
            .shift_remove(id)
            .ok_or_else(|| StoreError::NotFound {
                kind: "multiclusterapp",
                id: id.to_string(),
            })?;
        self.emit(WatchEvent::Deleted(Object::MultiClusterApp(removed.clone())));
        Ok(removed)
    }

    async fn get_app(&self, name: &str) -> StoreResult<App> {
        self.state
            .read()
            .apps
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: "app",
                id: name.to_string(),
            })
    }

    async fn list_apps(&self, filter: &AppFilter) -> StoreResult<Vec<App>> {
        Ok(self
            .state
            .read()
            .apps
            .values()
            .filter(|app| filter.matches(app))
            .cloned()
            .collect())
    }

    async fn create_app(&self, mut app: App) -> StoreResult<App> {
        let mut state = self.state.write();
        if state.apps.contains_key(&app.name) {
            return Err(StoreError::AlreadyExists {
                kind: "app",
                id: app.name,
            });
        }
        app.resource_version = 1;
        state.apps.insert(app.name.clone(), app.clone());
        self.emit(WatchEvent::Added(Object::App(app.clone())));
        Ok(app)
    }

    async fn update_app(&self, mut app: App) -> StoreResult<App> {
        let mut state = self.state.write();
        let stored = state
            .apps
            .get_mut(&app.name)
            .ok_or_else(|| StoreError::NotFound {
                kind: "app",
                id: app.name.clone(),
            })?;
        check_version("app", &app.name, app.resource_version, stored.resource_version)?;

        app.resource_version = stored.resource_version + 1;
        let old = std::mem::replace(stored, app.clone());
        self.emit(WatchEvent::Modified {
            old: Object::App(old),
            new: Object::App(app.clone()),
        });
        Ok(app)
    }

    async fn delete_app(&self, name: &str) -> StoreResult<App> {
        let mut state = self.state.write();
        let removed = state
            .apps
            .shift_remove(name)
            .ok_or_else(|| StoreError::NotFound {
                kind: "app",
                id: name.to_string(),
            })?;
        self.emit(WatchEvent::Deleted(Object::App(removed.clone())));
        Ok(removed)
    }

    async fn get_binding(&self, id: &str) -> StoreResult<RoleBinding> {
        self.state
            .read()
            .bindings
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: "rolebinding",
                id: id.to_string(),
            })
    }

    async fn list_bindings(&self, filter: &BindingFilter) -> StoreResult<Vec<RoleBinding>> {
        Ok(self
            .state
            .read()
            .bindings
            .values()
            .filter(|binding| filter.matches(binding))
            .cloned()
            .collect())
    }

    async fn create_binding(&self, mut binding: RoleBinding) -> StoreResult<RoleBinding> {
        let mut state = self.state.write();
        if let Some(existing) = state.bindings.values().find(|b| b.is_equivalent(&binding)) {
            return Err(StoreError::AlreadyExists {
                kind: "rolebinding",
                id: existing.id.clone(),
            });
        }

        state.next_binding_id += 1;
        binding.id = format!(
            "{}-{}",
            binding_prefix(&binding.scope),
            state.next_binding_id
        );
        binding.resource_version = 1;
        state.bindings.insert(binding.id.clone(), binding.clone());
        self.emit(WatchEvent::Added(Object::RoleBinding(binding.clone())));
        Ok(binding)
    }

    async fn update_binding(&self, mut binding: RoleBinding) -> StoreResult<RoleBinding> {
        let mut state = self.state.write();
        let stored = state
            .bindings
            .get_mut(&binding.id)
            .ok_or_else(|| StoreError::NotFound {
                kind: "rolebinding",
                id: binding.id.clone(),
            })?;
        check_version(
            "rolebinding",
            &binding.id,
            binding.resource_version,
            stored.resource_version,
        )?;
        if !stored.is_equivalent(&binding) {
            return Err(StoreError::Invalid {
                kind: "rolebinding",
                id: binding.id.clone(),
                reason: "scope, role and user are immutable",
            });
        }

        binding.resource_version = stored.resource_version + 1;
        let old = std::mem::replace(stored, binding.clone());
        self.emit(WatchEvent::Modified {
            old: Object::RoleBinding(old),
            new: Object::RoleBinding(binding.clone()),
        });
        Ok(binding)
    }

    async fn delete_binding(&self, id: &str) -> StoreResult<RoleBinding> {
        let mut state = self.state.write();
        let removed = state
            .bindings
            .shift_remove(id)
            .ok_or_else(|| StoreError::NotFound {
                kind: "rolebinding",
                id: id.to_string(),
            })?;
        self.emit(WatchEvent::Deleted(Object::RoleBinding(removed.clone())));
        Ok(removed)
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }
}
