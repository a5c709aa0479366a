//! Per-execution context shared by every fetch of one operation.

use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::hooks::FetchHooks;
use crate::hooks::HookContext;

/// A path into the response, made of response keys.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct Path(pub Vec<String>);

impl Path {
    pub fn empty() -> Self {
        Path(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn join(&self, key: impl Into<String>) -> Self {
        let mut elements = self.0.clone();
        elements.push(key.into());
        Path(elements)
    }
}

impl From<&str> for Path {
    fn from(s: &str) -> Self {
        Path(
            s.split('/')
                .filter(|segment| !segment.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for element in &self.0 {
            write!(f, "/{element}")?;
        }
        Ok(())
    }
}

/// Carries cancellation, the current response path and the optional fetch hooks.
///
/// Cloning is cheap. [`Context::at`] derives a context for a nested path that
/// shares cancellation and hooks with its parent.
#[derive(Clone, Default)]
pub struct Context {
    cancellation: CancellationToken,
    path: Path,
    hooks: Option<Arc<dyn FetchHooks>>,
}

#[buildstructor::buildstructor]
impl Context {
    #[builder]
    pub fn new(
        cancellation: Option<CancellationToken>,
        path: Option<Path>,
        hooks: Option<Arc<dyn FetchHooks>>,
    ) -> Self {
        Self {
            cancellation: cancellation.unwrap_or_default(),
            path: path.unwrap_or_default(),
            hooks,
        }
    }
}

impl Context {
    pub fn at(&self, key: impl Into<String>) -> Self {
        Self {
            cancellation: self.cancellation.clone(),
            path: self.path.join(key),
            hooks: self.hooks.clone(),
        }
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn hooks(&self) -> Option<&Arc<dyn FetchHooks>> {
        self.hooks.as_ref()
    }

    pub(crate) fn hook_context(&self) -> HookContext {
        HookContext {
            current_path: self.path.to_string(),
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("cancelled", &self.cancellation.is_cancelled())
            .field("path", &self.path)
            .field("hooks", &self.hooks.is_some())
            .finish()
    }
}
