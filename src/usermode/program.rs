/*!
 * User Programs
 * Code an execution context runs, looked up by entry-point name
 */

use super::context::UserContext;
use ahash::RandomState;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;

/// A program's `main`
///
/// The returned code becomes the process exit code; an error is reported to
/// the kernel as a crash.
pub trait UserProgram: Send + Sync {
    fn main(&self, ctx: UserContext) -> BoxFuture<'static, anyhow::Result<i32>>;
}

impl<F, Fut> UserProgram for F
where
    F: Fn(UserContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<i32>> + Send + 'static,
{
    fn main(&self, ctx: UserContext) -> BoxFuture<'static, anyhow::Result<i32>> {
        self(ctx).boxed()
    }
}

/// Programs by entry-point name (case-insensitive)
#[derive(Clone, Default)]
pub struct ProgramRegistry {
    programs: Arc<DashMap<String, Arc<dyn UserProgram>, RandomState>>,
}

impl ProgramRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P>(&self, entry_point: &str, program: P) -> &Self
    where
        P: UserProgram + 'static,
    {
        self.programs
            .insert(entry_point.to_lowercase(), Arc::new(program));
        self
    }

    pub fn get(&self, entry_point: &str) -> Option<Arc<dyn UserProgram>> {
        self.programs
            .get(&entry_point.to_lowercase())
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, entry_point: &str) -> bool {
        self.programs.contains_key(&entry_point.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }
}
