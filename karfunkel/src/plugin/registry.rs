use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};

use log::{debug, error, info, warn};
use protocol::{kinds, SchemaTable, Status};

use super::context::{reason_param, RequestContext, ResponseContext};
use super::handler::{RequestHandler, ResponseHandler};
use super::{Direction, Plugin, RegistryError};

const BUILTIN: &str = "builtin";

struct Entry<H> {
    plugin: String,
    handler: H,
}

/// The dispatch table: one handler per `(direction, type)`.
pub struct PluginRegistry {
    requests: HashMap<String, Entry<RequestHandler>>,
    responses: HashMap<String, Entry<ResponseHandler>>,
    /// Plugins in load order.
    loaded: Vec<String>,
    /// Plugin currently registering, credited as owner of new entries.
    loading: Option<String>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            requests: HashMap::new(),
            responses: HashMap::new(),
            loaded: Vec::new(),
            loading: None,
        }
    }

    /// Lets `plugin` register its handlers. Stops at the first conflict.
    pub fn load(&mut self, plugin: &dyn Plugin) -> Result<(), RegistryError> {
        self.loading = Some(plugin.name().to_string());
        let result = plugin.register(self);
        self.loading = None;
        result?;

        info!("Loaded plugin {}", plugin.name());
        self.loaded.push(plugin.name().to_string());
        Ok(())
    }

    pub fn register_request(&mut self, handler: RequestHandler) -> Result<(), RegistryError> {
        let kind = handler.kind().to_string();
        if kind == kinds::HELLO {
            return Err(RegistryError::Reserved(kind));
        }
        if let Some(existing) = self.requests.get(&kind) {
            return Err(self.duplicate(Direction::Request, kind, &existing.plugin));
        }

        debug!("Registered request handler for {kind}");
        let plugin = self.owner();
        self.requests.insert(kind, Entry { plugin, handler });
        Ok(())
    }

    pub fn register_response(&mut self, handler: ResponseHandler) -> Result<(), RegistryError> {
        let kind = handler.kind().to_string();
        if kind == kinds::HELLO {
            return Err(RegistryError::Reserved(kind));
        }
        if let Some(existing) = self.responses.get(&kind) {
            return Err(self.duplicate(Direction::Response, kind, &existing.plugin));
        }

        debug!("Registered response handler for {kind}");
        let plugin = self.owner();
        self.responses.insert(kind, Entry { plugin, handler });
        Ok(())
    }

    pub fn handles(&self, direction: Direction, kind: &str) -> bool {
        self.owner_of(direction, kind).is_some()
    }

    /// Name of the plugin that registered the handler for `kind`.
    pub fn owner_of(&self, direction: Direction, kind: &str) -> Option<&str> {
        match direction {
            Direction::Request => self.requests.get(kind).map(|entry| entry.plugin.as_str()),
            Direction::Response => self.responses.get(kind).map(|entry| entry.plugin.as_str()),
        }
    }

    pub fn loaded(&self) -> &[String] {
        &self.loaded
    }

    /// The core schemas plus those of every registered request type.
    pub fn schemas(&self) -> SchemaTable {
        let mut table = SchemaTable::core();
        for entry in self.requests.values() {
            table.insert(entry.handler.schema().clone());
        }
        table
    }

    /// Runs the handler for the context's request.
    ///
    /// Handler failures and panics become responses on the context; only a
    /// request type nobody registered is reported back as an error.
    pub fn dispatch_request(&self, ctx: &mut RequestContext<'_>) -> Result<(), RegistryError> {
        let request = ctx.request();
        let entry = self
            .requests
            .get(&request.kind)
            .ok_or_else(|| RegistryError::UnknownType {
                direction: Direction::Request,
                kind: request.kind.clone(),
            })?;

        if let Err(error) = entry.handler.schema().validate(request) {
            debug!("Rejecting {} request {}: {}", request.kind, request.id, error);
            ctx.reject(error.to_string());
            return Ok(());
        }

        match panic::catch_unwind(AssertUnwindSafe(|| entry.handler.call(ctx))) {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                debug!("{} request {} failed: {}", request.kind, request.id, error);
                ctx.answer(error.status(), reason_param(error.to_string()));
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!("Handler for {} panicked: {}", request.kind, message);
                ctx.answer(
                    Status::Error,
                    reason_param(format!("handler panicked: {message}")),
                );
            }
        }
        Ok(())
    }

    /// Runs the handler for the context's response. Failures are only logged:
    /// responses are never answered.
    pub fn dispatch_response(&self, ctx: &mut ResponseContext<'_>) -> Result<(), RegistryError> {
        let response = ctx.response();
        let entry = self
            .responses
            .get(&response.kind)
            .ok_or_else(|| RegistryError::UnknownType {
                direction: Direction::Response,
                kind: response.kind.clone(),
            })?;

        match panic::catch_unwind(AssertUnwindSafe(|| entry.handler.call(ctx))) {
            Ok(Ok(())) => {}
            Ok(Err(error)) => warn!(
                "Handling {} response {} failed: {}",
                response.kind, response.id, error
            ),
            Err(payload) => error!(
                "Handler for {} responses panicked: {}",
                response.kind,
                panic_message(payload.as_ref())
            ),
        }
        Ok(())
    }

    fn owner(&self) -> String {
        self.loading.clone().unwrap_or_else(|| BUILTIN.to_string())
    }

    fn duplicate(&self, direction: Direction, kind: String, owner: &str) -> RegistryError {
        RegistryError::Duplicate {
            direction,
            kind,
            owner: owner.to_string(),
            plugin: self.owner(),
        }
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
