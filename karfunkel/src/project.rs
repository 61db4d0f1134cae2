//! The project shared by every connected editor.
//!
//! Loading a project is incremental: a [`ProjectLoad`] advances one step per
//! poll so that clients can be told how far along it is. What a step actually
//! does is up to the [`ProjectLoader`]; the default one walks a directory.

use std::fs;
use std::path::{Path, PathBuf};

use crate::plugin::HandlerError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    pub name: String,
    pub root: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoadProgress {
    /// Step `completed_steps` (zero based) of `total_steps` is done.
    Loading {
        completed_steps: usize,
        total_steps: usize,
    },
    Loaded(Project),
    Failed(String),
}

pub trait ProjectLoader: Send + Sync {
    /// Starts loading the project at `path`.
    fn begin(&self, path: &Path) -> Result<Box<dyn ProjectLoad>, HandlerError>;
}

pub trait ProjectLoad: Send {
    fn name(&self) -> &str;

    /// Performs the next step.
    fn step(&mut self) -> LoadProgress;
}

/// Fraction of the load that is done after step `completed_steps`.
pub fn progress_fraction(completed_steps: usize, total_steps: usize) -> f64 {
    if total_steps == 0 {
        return 1.0;
    }
    ((completed_steps + 1) as f64 / total_steps as f64).clamp(0.0, 1.0)
}

/// Treats a project as a directory and visits one top-level entry per step.
///
/// Pointing it at a file inside the directory (e.g. the project manifest)
/// loads the file's parent directory, named after the file's stem.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectoryProjectLoader;

impl ProjectLoader for DirectoryProjectLoader {
    fn begin(&self, path: &Path) -> Result<Box<dyn ProjectLoad>, HandlerError> {
        let metadata = fs::metadata(path).map_err(|_| {
            HandlerError::invalid_parameter("file", format!("{} does not exist", path.display()))
        })?;

        let (root, name) = if metadata.is_dir() {
            (path.to_path_buf(), path.file_name())
        } else {
            let root = path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            (root, path.file_stem())
        };
        let name = name
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| root.display().to_string());

        Ok(Box::new(DirectoryLoad {
            project: Project { name, root },
            entries: None,
            next: 0,
        }))
    }
}

struct DirectoryLoad {
    project: Project,
    /// Listed on the first step, so `begin` never walks the directory.
    entries: Option<Vec<PathBuf>>,
    next: usize,
}

fn list_entries(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(root)?
        .map(|entry| entry.map(|entry| entry.path()))
        .collect::<Result<Vec<_>, _>>()?;
    entries.sort();
    Ok(entries)
}

impl ProjectLoad for DirectoryLoad {
    fn name(&self) -> &str {
        &self.project.name
    }

    fn step(&mut self) -> LoadProgress {
        if self.entries.is_none() {
            match list_entries(&self.project.root) {
                Ok(entries) => self.entries = Some(entries),
                Err(error) => {
                    return LoadProgress::Failed(format!(
                        "cannot list {}: {error}",
                        self.project.root.display()
                    ))
                }
            }
        }
        let entries = self.entries.as_deref().unwrap_or_default();

        let Some(entry) = entries.get(self.next) else {
            return LoadProgress::Loaded(self.project.clone());
        };

        if let Err(error) = fs::symlink_metadata(entry) {
            return LoadProgress::Failed(format!("cannot read {}: {error}", entry.display()));
        }

        let total_steps = entries.len();
        let completed_steps = self.next;
        self.next += 1;
        LoadProgress::Loading {
            completed_steps,
            total_steps,
        }
    }
}
