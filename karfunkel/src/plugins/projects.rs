//! The `projects` plugin: opening and closing the shared project.
//!
//! Opening is long-running. The request is answered `processing` right away,
//! every load step is broadcast as `LoadingProject`, and the opener finally
//! gets `finished` (followed by a `ProjectOpened` broadcast) or `failed`.

use std::path::Path;
use std::sync::Arc;

use log::info;
use protocol::{Parameters, Status};

use crate::plugin::{
    DeferredContext, DeferredTask, HandlerError, Plugin, PluginRegistry, RegistryError,
    RequestContext, RequestHandler, TaskState,
};
use crate::project::{progress_fraction, DirectoryProjectLoader, LoadProgress, ProjectLoad, ProjectLoader};

pub const OPEN_PROJECT: &str = "OpenProject";
pub const CLOSE_PROJECT: &str = "CloseProject";
pub const LOADING_PROJECT: &str = "LoadingProject";
pub const PROJECT_OPENED: &str = "ProjectOpened";
pub const PROJECT_CLOSED: &str = "ProjectClosed";

pub struct ProjectsPlugin {
    loader: Arc<dyn ProjectLoader>,
}

impl ProjectsPlugin {
    pub fn with_loader(loader: impl ProjectLoader + 'static) -> Self {
        Self {
            loader: Arc::new(loader),
        }
    }
}

impl Default for ProjectsPlugin {
    fn default() -> Self {
        Self::with_loader(DirectoryProjectLoader)
    }
}

impl Plugin for ProjectsPlugin {
    fn name(&self) -> &str {
        super::PROJECTS
    }

    fn register(&self, registry: &mut PluginRegistry) -> Result<(), RegistryError> {
        let loader = Arc::clone(&self.loader);
        registry.register_request(
            RequestHandler::new(OPEN_PROJECT)
                .required("file")
                .handle(move |ctx| open_project(ctx, loader.as_ref())),
        )?;
        registry.register_request(RequestHandler::new(CLOSE_PROJECT).handle(close_project))
    }
}

fn open_project(ctx: &mut RequestContext<'_>, loader: &dyn ProjectLoader) -> Result<(), HandlerError> {
    let file = ctx.require("file")?;
    let load = loader.begin(Path::new(file))?;
    info!("Opening project {} from {}", load.name(), file);

    ctx.answer(Status::Processing, Parameters::new());
    let interval = ctx.server().config().projects_poll_interval;
    ctx.defer(interval, Loading { load });
    Ok(())
}

fn close_project(ctx: &mut RequestContext<'_>) -> Result<(), HandlerError> {
    let project = ctx
        .server()
        .take_project()
        .ok_or_else(|| HandlerError::Rejected("no project is open".to_string()))?;
    info!("Closed project {}", project.name);

    ctx.answer(Status::Ok, named(&project.name));
    ctx.broadcast(PROJECT_CLOSED, named(&project.name));
    Ok(())
}

struct Loading {
    load: Box<dyn ProjectLoad>,
}

impl DeferredTask for Loading {
    fn poll(&mut self, ctx: &mut DeferredContext) -> TaskState {
        match self.load.step() {
            LoadProgress::Loading {
                completed_steps,
                total_steps,
            } => {
                let percent = progress_fraction(completed_steps, total_steps) * 100.0;
                let mut parameters = named(self.load.name());
                parameters.insert("percent_done".to_string(), format!("{percent:.1}"));
                ctx.broadcast(LOADING_PROJECT, parameters);
                TaskState::Pending
            }
            LoadProgress::Loaded(project) => {
                let name = project.name.clone();
                ctx.server().set_project(project);
                ctx.answer(Status::Finished, named(&name));
                ctx.broadcast(PROJECT_OPENED, named(&name));
                TaskState::Done
            }
            LoadProgress::Failed(reason) => {
                info!("Loading project {} failed: {}", self.load.name(), reason);
                ctx.fail(reason);
                TaskState::Done
            }
        }
    }
}

fn named(name: &str) -> Parameters {
    Parameters::from([("name".to_string(), name.to_string())])
}
