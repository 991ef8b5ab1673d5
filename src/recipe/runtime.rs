use anyhow::{Context as _, Result};
use starlark::environment::{Globals, GlobalsBuilder, LibraryExtension, Module};
use starlark::eval::Evaluator;
use starlark::syntax::{AstModule, Dialect};
use starlark::values::ValueLike;
use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::PiError;
use crate::models::build::PackageBuild;
use crate::models::config::Config;
use crate::recipe::api::{register_api, register_html, register_jq};
use crate::recipe::context::{RecipeContext, Registration};
use crate::services::fetch::DISCOVERY_TTL;
use crate::services::lock::is_fresh;
use crate::utils::crypto::sha256_hex;
use crate::utils::fs::write_atomic;

/// Adds `^…$` anchors unless already present.
pub fn anchor_pattern(pattern: &str) -> String {
    let mut anchored = String::with_capacity(pattern.len() + 2);
    if !pattern.starts_with('^') {
        anchored.push('^');
    }
    anchored.push_str(pattern);
    if !pattern.ends_with('$') {
        anchored.push('$');
    }
    anchored
}

/// One recipe: a name and its Starlark source. Evaluation is deterministic
/// and sandboxed; the only reachable side effect is the host-mediated
/// `download` builtin.
#[derive(Debug, Clone)]
pub struct Recipe {
    pub name: String,
    pub source: String,
}

impl Recipe {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let source = fs::read_to_string(path)
            .with_context(|| format!("Failed to read recipe {}", path.display()))?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        Ok(Self { name, source })
    }

    /// All `(pattern, handler)` entries this recipe registers, sorted by
    /// pattern.
    pub fn registry(&self, config: &Config) -> Result<Vec<Registration>> {
        let module = self.eval_top_level(config)?;
        let context = context_of(&module)?;
        let mut registrations = context.registrations.read().clone();
        registrations.sort_by(|a, b| a.pattern.cmp(&b.pattern));
        Ok(registrations)
    }

    /// Runs the handler for `name` and returns the emitted builds, serving
    /// from the discovery cache when fresh. `pattern` short-circuits
    /// dispatch for callers that already matched (the repository index).
    pub fn execute(
        &self,
        config: &Config,
        name: &str,
        version: &str,
        pattern: Option<&str>,
    ) -> Result<Vec<PackageBuild>> {
        self.execute_inner(config, name, version, pattern, false)
    }

    /// Like [`execute`](Self::execute) but bypasses the handler cache;
    /// `pkg sync` forces re-discovery through this.
    pub fn execute_refresh(
        &self,
        config: &Config,
        name: &str,
        version: &str,
        pattern: Option<&str>,
    ) -> Result<Vec<PackageBuild>> {
        self.execute_inner(config, name, version, pattern, true)
    }

    fn execute_inner(
        &self,
        config: &Config,
        name: &str,
        version: &str,
        pattern: Option<&str>,
        refresh: bool,
    ) -> Result<Vec<PackageBuild>> {
        let module = self.eval_top_level(config)?;
        let context = context_of(&module)?;
        let registration = self.dispatch(&module, name, pattern)?;

        let cache_path = self.handler_cache_path(config, &registration.pattern, name, version);
        if !refresh && is_fresh(&cache_path, DISCOVERY_TTL) {
            if let Ok(content) = fs::read_to_string(&cache_path) {
                match serde_json::from_str::<Vec<PackageBuild>>(&content) {
                    Ok(builds) => {
                        log::debug!("[{}] handler cache hit for {}", self.name, name);
                        return Ok(builds);
                    }
                    Err(e) => log::warn!(
                        "[{}] discarding corrupt handler cache {}: {}",
                        self.name,
                        cache_path.display(),
                        e
                    ),
                }
            }
        }

        let function = module.get(&registration.handler).with_context(|| {
            format!(
                "Handler '{}' not found in recipe '{}'",
                registration.handler, self.name
            )
        })?;
        context.seal();
        {
            let mut eval = Evaluator::new(&module);
            let arg = eval.heap().alloc(name);
            eval.eval_function(function, &[arg], &[])
                .map_err(|e| self.eval_error(e))?;
        }

        let builds = context.builds.read().clone();
        let encoded = serde_json::to_vec_pretty(&builds)
            .context("Failed to serialize handler results")?;
        write_atomic(&cache_path, &encoded)?;
        Ok(builds)
    }

    fn dispatch(&self, module: &Module, name: &str, pattern: Option<&str>) -> Result<Registration> {
        let context = context_of(module)?;
        let mut registrations = context.registrations.read().clone();
        if registrations.is_empty() {
            return Err(PiError::validation(
                format!("recipe '{}'", self.name),
                "registers no patterns",
            )
            .into());
        }
        registrations.sort_by(|a, b| a.pattern.cmp(&b.pattern));

        if let Some(p) = pattern {
            let anchored = anchor_pattern(p);
            return registrations
                .into_iter()
                .find(|r| r.pattern == anchored)
                .ok_or_else(|| {
                    PiError::validation(
                        format!("recipe '{}'", self.name),
                        format!("no registration for pattern '{}'", p),
                    )
                    .into()
                });
        }

        for registration in registrations {
            // Patterns are validated at registration time.
            let re = regex::Regex::new(&registration.pattern)
                .map_err(|e| PiError::validation(&registration.pattern, e.to_string()))?;
            if re.is_match(name) {
                return Ok(registration);
            }
        }
        Err(PiError::NoRecipe(name.to_string()).into())
    }

    fn handler_cache_path(
        &self,
        config: &Config,
        pattern: &str,
        name: &str,
        version: &str,
    ) -> PathBuf {
        let key = format!(
            "{}|{}|{}|{}|{}|{}",
            self.name, pattern, name, version, config.host.os, config.host.arch
        );
        config
            .discovery_dir
            .join(format!("handler_{}.json", sha256_hex(key.as_bytes())))
    }

    /// Evaluates the recipe top level, collecting `register()` entries.
    fn eval_top_level(&self, config: &Config) -> Result<Module> {
        let ast = AstModule::parse(&self.name, self.source.clone(), &Dialect::Extended)
            .map_err(|e| self.eval_error(e))?;
        let globals = create_globals();
        let module = Module::new();
        let context = RecipeContext::new(self.name.clone(), config.clone());
        let context_value = module.heap().alloc_simple(context);
        module.set_extra_value(context_value);
        {
            let mut eval = Evaluator::new(&module);
            eval.eval_module(ast, &globals).map_err(|e| self.eval_error(e))?;
        }
        Ok(module)
    }

    fn eval_error(&self, e: impl std::fmt::Display) -> anyhow::Error {
        PiError::RecipeEval {
            recipe: self.name.clone(),
            backtrace: e.to_string(),
        }
        .into()
    }
}

fn create_globals() -> Globals {
    let mut builder = GlobalsBuilder::extended_by(&[LibraryExtension::Print, LibraryExtension::Json]);
    register_api(&mut builder);
    builder.namespace("jq", register_jq);
    builder.namespace("html", register_html);
    builder.build()
}

fn context_of(module: &Module) -> Result<&RecipeContext> {
    module
        .extra_value()
        .context("RecipeContext missing after evaluation")?
        .downcast_ref::<RecipeContext>()
        .context("Extra value is not a RecipeContext")
}
