use allocative::{Allocative, Key, Visitor};
use parking_lot::RwLock;
use serde::Serialize;
use starlark::any::ProvidesStaticType;
use starlark::values::{AllocValue, Heap, StarlarkValue, Value, starlark_value};
use std::fmt::{self, Display};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::models::build::PackageBuild;
use crate::models::config::Config;
use crate::models::types::{Arch, Os};

/// One `(pattern, handler)` dispatch entry declared by a recipe. The pattern
/// is stored in its anchored form.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Registration {
    pub pattern: String,
    pub handler: String,
}

/// Bridge between the Rust host and one Starlark recipe evaluation.
///
/// It is embedded in the module as the extra value so builtins can reach the
/// host config, accumulate `register()` entries during top-level evaluation
/// and `add_version()` emissions during handler execution. Values crossing
/// the boundary are converted to owned host structures; nothing retains
/// references into the interpreter heap.
#[derive(Debug, ProvidesStaticType, Serialize)]
pub struct RecipeContext {
    pub os: Os,
    pub arch: Arch,
    pub recipe_name: String,
    pub registrations: RwLock<Vec<Registration>>,
    pub builds: RwLock<Vec<PackageBuild>>,
    /// Set once top-level evaluation finishes; `register()` refuses to run
    /// afterwards.
    pub sealed: AtomicBool,
    #[serde(skip)]
    pub config: Config,
}

impl RecipeContext {
    pub fn new(recipe_name: String, config: Config) -> Self {
        Self {
            os: config.host.os,
            arch: config.host.arch,
            recipe_name,
            registrations: RwLock::new(Vec::new()),
            builds: RwLock::new(Vec::new()),
            sealed: AtomicBool::new(false),
            config,
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }
}

impl Allocative for RecipeContext {
    fn visit<'a, 'b: 'a>(&self, visitor: &'a mut Visitor<'b>) {
        let mut visitor = visitor.enter_self_sized::<Self>();
        visitor.visit_field::<String>(Key::new("os"), &self.os.to_string());
        visitor.visit_field::<String>(Key::new("arch"), &self.arch.to_string());
        visitor.visit_field::<String>(Key::new("recipe_name"), &self.recipe_name);
        visitor.exit();
    }
}

impl Display for RecipeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RecipeContext(recipe={}, os={}, arch={}, registrations={}, builds={})",
            self.recipe_name,
            self.os,
            self.arch,
            self.registrations.read().len(),
            self.builds.read().len()
        )
    }
}

#[starlark_value(type = "RecipeContext")]
impl<'v> StarlarkValue<'v> for RecipeContext {}

impl<'v> AllocValue<'v> for RecipeContext {
    fn alloc_value(self, heap: &'v Heap) -> Value<'v> {
        heap.alloc_simple(self)
    }
}
