//! Plugins shipped with the server, selectable by name.

use log::debug;

use crate::plugin::{Plugin, RegistryError};

pub mod builtin;
pub mod projects;

pub use builtin::BuiltinPlugin;
pub use projects::ProjectsPlugin;

/// Name of the built-in plugin. Always loaded, and always first.
pub const CORE: &str = "core";
pub const PROJECTS: &str = "projects";

pub fn is_known(name: &str) -> bool {
    matches!(name, CORE | PROJECTS)
}

/// Instantiates the plugins named in the configuration, in order.
pub fn resolve(names: &[String]) -> Result<Vec<Box<dyn Plugin>>, RegistryError> {
    let mut plugins: Vec<Box<dyn Plugin>> = Vec::new();
    for name in names {
        match name.as_str() {
            CORE => debug!("Plugin {CORE} is always loaded first, ignoring its listing"),
            PROJECTS => plugins.push(Box::new(ProjectsPlugin::default())),
            other => return Err(RegistryError::UnknownPlugin(other.to_string())),
        }
    }
    Ok(plugins)
}
