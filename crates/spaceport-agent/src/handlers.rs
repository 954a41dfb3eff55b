//! Domain event handlers
//!
//! Handlers turn backend events into desired-state writes: they upsert or
//! delete `Project` resources and Crossplane `Configuration` packages. They
//! never touch status; convergence is left to the reconcilers.

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, PostParams};
use kube::{Client, ResourceExt};
#[cfg(test)]
use mockall::automock;
use spaceport_common::crd::Project;
use spaceport_common::registry::{ResourceKind, ResourceRegistry};
use spaceport_common::Error;
use tracing::{debug, info};

use crate::error::StreamError;
use crate::events::{
    AddonPayload, AddonRef, ProjectPayload, ProjectRef, ADDON_CREATED, ADDON_DELETED,
    ADDON_EVENTS, ADDON_UPDATED, PROJECT_CREATED, PROJECT_DELETED, PROJECT_EVENTS,
    PROJECT_PAUSED, PROJECT_RESUMED, PROJECT_UPDATED,
};
use crate::protocol::InboundEvent;
use crate::router::{EventHandler, Router};

/// Desired-state store written by the handlers
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SpecStore: Send + Sync {
    /// Get a project by name, `None` if absent
    async fn get_project(&self, name: &str) -> Result<Option<Project>, Error>;
    /// Create a project
    async fn create_project(&self, project: &Project) -> Result<(), Error>;
    /// Replace a project (the object carries its resourceVersion)
    async fn replace_project(&self, project: &Project) -> Result<(), Error>;
    /// Delete a project
    async fn delete_project(&self, name: &str) -> Result<(), Error>;
    /// Get a Configuration package by name, `None` if absent
    async fn get_configuration(&self, name: &str) -> Result<Option<DynamicObject>, Error>;
    /// Create a Configuration package
    async fn create_configuration(&self, obj: &DynamicObject) -> Result<(), Error>;
    /// Replace a Configuration package
    async fn replace_configuration(&self, obj: &DynamicObject) -> Result<(), Error>;
    /// Delete a Configuration package
    async fn delete_configuration(&self, name: &str) -> Result<(), Error>;
}

/// [`SpecStore`] backed by the Kubernetes API
pub struct KubeSpecStore {
    client: Client,
    registry: Arc<ResourceRegistry>,
}

impl KubeSpecStore {
    /// Create a store using the given client and registration table
    pub fn new(client: Client, registry: Arc<ResourceRegistry>) -> Self {
        Self { client, registry }
    }

    fn projects(&self) -> Api<Project> {
        Api::all(self.client.clone())
    }

    fn configurations(&self) -> Api<DynamicObject> {
        let ar = self.registry.get(ResourceKind::CrossplaneConfiguration);
        Api::all_with(self.client.clone(), &ar)
    }
}

#[async_trait]
impl SpecStore for KubeSpecStore {
    async fn get_project(&self, name: &str) -> Result<Option<Project>, Error> {
        Ok(self.projects().get_opt(name).await?)
    }

    async fn create_project(&self, project: &Project) -> Result<(), Error> {
        self.projects()
            .create(&PostParams::default(), project)
            .await?;
        Ok(())
    }

    async fn replace_project(&self, project: &Project) -> Result<(), Error> {
        self.projects()
            .replace(&project.name_any(), &PostParams::default(), project)
            .await?;
        Ok(())
    }

    async fn delete_project(&self, name: &str) -> Result<(), Error> {
        self.projects()
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn get_configuration(&self, name: &str) -> Result<Option<DynamicObject>, Error> {
        Ok(self.configurations().get_opt(name).await?)
    }

    async fn create_configuration(&self, obj: &DynamicObject) -> Result<(), Error> {
        self.configurations()
            .create(&PostParams::default(), obj)
            .await?;
        Ok(())
    }

    async fn replace_configuration(&self, obj: &DynamicObject) -> Result<(), Error> {
        self.configurations()
            .replace(&obj.name_any(), &PostParams::default(), obj)
            .await?;
        Ok(())
    }

    async fn delete_configuration(&self, name: &str) -> Result<(), Error> {
        self.configurations()
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }
}

/// Handles `projects.*` events
pub struct ProjectHandler {
    store: Arc<dyn SpecStore>,
}

impl ProjectHandler {
    /// Create a handler writing through `store`
    pub fn new(store: Arc<dyn SpecStore>) -> Self {
        Self { store }
    }

    async fn upsert(&self, event: &InboundEvent) -> Result<(), StreamError> {
        let payload: ProjectPayload = event.decode_payload()?;
        let wrap = |e: Error| StreamError::handler(&event.event_type, e);

        match self.store.get_project(&payload.slug).await.map_err(wrap)? {
            None => {
                info!(project = %payload.slug, "creating project");
                let project = Project::new(&payload.slug, payload.to_spec());
                self.store.create_project(&project).await.map_err(wrap)
            }
            Some(mut existing) => {
                let spec = payload.merge_into(&existing.spec);
                if spec == existing.spec {
                    debug!(project = %payload.slug, "project unchanged");
                    return Ok(());
                }
                info!(project = %payload.slug, "updating project");
                existing.spec = spec;
                self.store.replace_project(&existing).await.map_err(wrap)
            }
        }
    }

    async fn set_paused(&self, event: &InboundEvent, paused: bool) -> Result<(), StreamError> {
        let target: ProjectRef = event.decode_payload()?;
        let wrap = |e: Error| StreamError::handler(&event.event_type, e);

        let Some(mut project) = self.store.get_project(&target.slug).await.map_err(wrap)? else {
            return Err(wrap(Error::internal_with_context(
                "project_handler",
                format!("project {} not found", target.slug),
            )));
        };
        if project.spec.paused == paused {
            debug!(project = %target.slug, paused, "pause state unchanged");
            return Ok(());
        }
        info!(project = %target.slug, paused, "setting pause state");
        project.spec.paused = paused;
        self.store.replace_project(&project).await.map_err(wrap)
    }

    async fn delete(&self, event: &InboundEvent) -> Result<(), StreamError> {
        let target: ProjectRef = event.decode_payload()?;
        match self.store.delete_project(&target.slug).await {
            Ok(()) => {
                info!(project = %target.slug, "project deleted");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(project = %target.slug, "project already absent");
                Ok(())
            }
            Err(e) => Err(StreamError::handler(&event.event_type, e)),
        }
    }
}

#[async_trait]
impl EventHandler for ProjectHandler {
    async fn handle(&self, event: &InboundEvent) -> Result<(), StreamError> {
        match event.event_type.as_str() {
            PROJECT_CREATED | PROJECT_UPDATED => self.upsert(event).await,
            PROJECT_PAUSED => self.set_paused(event, true).await,
            PROJECT_RESUMED => self.set_paused(event, false).await,
            PROJECT_DELETED => self.delete(event).await,
            other => Err(StreamError::NoHandler(other.to_string())),
        }
    }
}

/// Handles `addons.*` events by managing Crossplane Configuration packages
pub struct AddonHandler {
    store: Arc<dyn SpecStore>,
    registry: Arc<ResourceRegistry>,
}

impl AddonHandler {
    /// Create a handler writing through `store`
    pub fn new(store: Arc<dyn SpecStore>, registry: Arc<ResourceRegistry>) -> Self {
        Self { store, registry }
    }

    fn desired(&self, payload: &AddonPayload) -> DynamicObject {
        let ar = self.registry.get(ResourceKind::CrossplaneConfiguration);
        let mut obj = DynamicObject::new(&payload.name, &ar);
        obj.metadata.labels = Some(payload.labels());
        obj.data = serde_json::json!({ "spec": payload.configuration_spec() });
        obj
    }

    async fn upsert(&self, event: &InboundEvent) -> Result<(), StreamError> {
        let payload: AddonPayload = event.decode_payload()?;
        let wrap = |e: Error| StreamError::handler(&event.event_type, e);
        let mut desired = self.desired(&payload);

        match self
            .store
            .get_configuration(&payload.name)
            .await
            .map_err(wrap)?
        {
            None => {
                info!(addon = %payload.name, package = %payload.package(), "creating configuration");
                self.store.create_configuration(&desired).await.map_err(wrap)
            }
            Some(existing) => {
                if existing.data.get("spec") == desired.data.get("spec")
                    && existing.metadata.labels == desired.metadata.labels
                {
                    debug!(addon = %payload.name, "configuration unchanged");
                    return Ok(());
                }
                info!(addon = %payload.name, package = %payload.package(), "updating configuration");
                desired.metadata.resource_version = existing.metadata.resource_version.clone();
                self.store
                    .replace_configuration(&desired)
                    .await
                    .map_err(wrap)
            }
        }
    }

    async fn delete(&self, event: &InboundEvent) -> Result<(), StreamError> {
        let target: AddonRef = event.decode_payload()?;
        match self.store.delete_configuration(&target.name).await {
            Ok(()) => {
                info!(addon = %target.name, "configuration deleted");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(StreamError::handler(&event.event_type, e)),
        }
    }
}

#[async_trait]
impl EventHandler for AddonHandler {
    async fn handle(&self, event: &InboundEvent) -> Result<(), StreamError> {
        match event.event_type.as_str() {
            ADDON_CREATED | ADDON_UPDATED => self.upsert(event).await,
            ADDON_DELETED => self.delete(event).await,
            other => Err(StreamError::NoHandler(other.to_string())),
        }
    }
}

/// Build the dispatch table for every domain event
pub fn build_router(store: Arc<dyn SpecStore>, registry: Arc<ResourceRegistry>) -> Router {
    let projects = Arc::new(ProjectHandler::new(store.clone()));
    let addons = Arc::new(AddonHandler::new(store, registry));
    Router::builder()
        .routes(PROJECT_EVENTS, projects)
        .routes(ADDON_EVENTS, addons)
        .build()
}
