use anyhow::Context as _;
use serde_json_path::JsonPath;
use starlark::collections::SmallMap;
use starlark::environment::GlobalsBuilder;
use starlark::eval::Evaluator;
use starlark::starlark_module;
use starlark::values::dict::{Dict, DictRef};
use starlark::values::list::ListRef;
use starlark::values::none::NoneType;
use starlark::values::{Heap, Value, ValueLike};
use std::collections::BTreeMap;

use crate::errors::PiError;
use crate::models::build::PackageBuild;
use crate::recipe::context::{RecipeContext, Registration};
use crate::recipe::html::{HtmlDocument, to_json_tree};
use crate::recipe::runtime::anchor_pattern;
use crate::services::fetch::fetch_text_cached;

/// The hosted builtins callable from recipes. Everything with a side effect
/// goes through the host: `download` uses the discovery cache and its lock
/// protocol, and results leave the interpreter as owned host values.
#[starlark_module]
pub fn register_api(builder: &mut GlobalsBuilder) {
    fn get_os(eval: &mut Evaluator<'_, '_, '_>) -> anyhow::Result<String> {
        Ok(get_context(eval)?.os.to_string())
    }

    fn get_arch(eval: &mut Evaluator<'_, '_, '_>) -> anyhow::Result<String> {
        Ok(get_context(eval)?.arch.to_string())
    }

    fn register<'v>(
        pattern: String,
        handler: Value<'v>,
        eval: &mut Evaluator<'v, '_, '_>,
    ) -> anyhow::Result<NoneType> {
        let context = get_context(eval)?;
        if context.is_sealed() {
            anyhow::bail!("register() must be called at recipe top level");
        }
        let anchored = anchor_pattern(&pattern);
        regex::Regex::new(&anchored).map_err(|e| {
            PiError::validation(format!("pattern '{}'", pattern), e.to_string())
        })?;

        let mut registrations = context.registrations.write();
        if registrations.iter().any(|r| r.pattern == anchored) {
            anyhow::bail!(
                "duplicate pattern '{}' in recipe '{}'",
                pattern,
                context.recipe_name
            );
        }
        registrations.push(Registration {
            pattern: anchored,
            handler: extract_function_name(handler),
        });
        Ok(NoneType)
    }

    fn add_version(
        #[starlark(require = named)] name: String,
        #[starlark(require = named)] version: String,
        #[starlark(require = named)] release_status: String,
        #[starlark(require = named)] release_date: String,
        #[starlark(require = named)] os: String,
        #[starlark(require = named)] arch: String,
        #[starlark(require = named)] url: String,
        #[starlark(require = named)] filename: String,
        #[starlark(require = named)] checksum: String,
        #[starlark(require = named)] env: Value,
        #[starlark(require = named)] symlinks: Value,
        eval: &mut Evaluator<'_, '_, '_>,
    ) -> anyhow::Result<NoneType> {
        let context = get_context(eval)?;
        let build = PackageBuild {
            repo_uuid: uuid::Uuid::nil(),
            name,
            version,
            release_status: release_status.to_lowercase(),
            release_date,
            os: os.parse()?,
            arch: arch.parse()?,
            url,
            filename,
            checksum,
            env: dict_to_map(env, "env")?,
            symlinks: dict_to_map(symlinks, "symlinks")?,
        };
        context.builds.write().push(build);
        Ok(NoneType)
    }

    fn download(url: String, eval: &mut Evaluator<'_, '_, '_>) -> anyhow::Result<String> {
        let context = get_context(eval)?;
        fetch_text_cached(&context.config, &url)
    }

    fn download_github_releases<'v>(
        owner: String,
        repo: String,
        eval: &mut Evaluator<'v, '_, '_>,
    ) -> anyhow::Result<Value<'v>> {
        let context = get_context(eval)?;
        let url = format!("https://api.github.com/repos/{}/{}/releases", owner, repo);
        let body = fetch_text_cached(&context.config, &url)?;
        let json: serde_json::Value = serde_json::from_str(&body)
            .with_context(|| format!("Failed to parse releases of {}/{}", owner, repo))?;
        Ok(serde_to_starlark(json, eval.heap()))
    }
}

#[starlark_module]
pub fn register_jq(builder: &mut GlobalsBuilder) {
    /// JSONPath query over a decoded value. A unary result collapses to the
    /// value itself; anything else comes back as a list.
    fn query<'v>(
        query: String,
        value: Value<'v>,
        eval: &mut Evaluator<'v, '_, '_>,
    ) -> anyhow::Result<Value<'v>> {
        let path = JsonPath::parse(&query)
            .map_err(|e| PiError::validation(format!("jq query '{}'", query), e.to_string()))?;
        let json = starlark_to_serde(value)?;
        let nodes: Vec<serde_json::Value> =
            path.query(&json).all().into_iter().cloned().collect();
        let heap = eval.heap();
        if nodes.len() == 1 {
            Ok(serde_to_starlark(nodes.into_iter().next().unwrap(), heap))
        } else {
            let values: Vec<Value> = nodes
                .into_iter()
                .map(|n| serde_to_starlark(n, heap))
                .collect();
            Ok(heap.alloc(values))
        }
    }
}

#[starlark_module]
pub fn register_html(builder: &mut GlobalsBuilder) {
    fn parse(data: String) -> anyhow::Result<HtmlDocument> {
        Ok(HtmlDocument::parse(&data))
    }

    fn to_json<'v>(data: String, eval: &mut Evaluator<'v, '_, '_>) -> anyhow::Result<Value<'v>> {
        Ok(serde_to_starlark(to_json_tree(&data), eval.heap()))
    }
}

pub fn get_context<'v>(eval: &Evaluator<'v, '_, '_>) -> anyhow::Result<&'v RecipeContext> {
    eval.module()
        .extra_value()
        .context("RecipeContext not found in module extra")?
        .downcast_ref::<RecipeContext>()
        .context("Extra value is not a RecipeContext")
}

fn extract_function_name(function: Value) -> String {
    let repr = function.to_value().to_str();
    let name = if let Some(s) = repr.strip_prefix("<function ") {
        s.strip_suffix(">").unwrap_or(s)
    } else {
        &repr
    };
    name.rfind('.')
        .map(|idx| &name[idx + 1..])
        .unwrap_or(name)
        .to_string()
}

fn dict_to_map(value: Value, what: &str) -> anyhow::Result<BTreeMap<String, String>> {
    let dict =
        DictRef::from_value(value).with_context(|| format!("{} must be a dictionary", what))?;
    let mut map = BTreeMap::new();
    for (k, v) in dict.iter_hashed() {
        let key = k
            .key()
            .unpack_str()
            .with_context(|| format!("{} key must be a string", what))?;
        let val = v
            .unpack_str()
            .with_context(|| format!("{} value must be a string", what))?;
        map.insert(key.to_string(), val.to_string());
    }
    Ok(map)
}

pub fn starlark_to_serde(val: Value) -> anyhow::Result<serde_json::Value> {
    if val.is_none() {
        Ok(serde_json::Value::Null)
    } else if let Some(b) = val.unpack_bool() {
        Ok(serde_json::Value::Bool(b))
    } else if let Some(i) = val.unpack_i32() {
        Ok(serde_json::Value::Number(i.into()))
    } else if let Some(s) = val.unpack_str() {
        Ok(serde_json::Value::String(s.to_string()))
    } else if let Some(list) = ListRef::from_value(val) {
        let mut arr = Vec::new();
        for v in list.content() {
            arr.push(starlark_to_serde(*v)?);
        }
        Ok(serde_json::Value::Array(arr))
    } else if let Some(dict) = DictRef::from_value(val) {
        let mut obj = serde_json::Map::new();
        for (k, v) in dict.iter_hashed() {
            obj.insert(k.key().to_str(), starlark_to_serde(v)?);
        }
        Ok(serde_json::Value::Object(obj))
    } else {
        Ok(serde_json::Value::String(val.to_str()))
    }
}

pub fn serde_to_starlark<'v>(val: serde_json::Value, heap: &'v Heap) -> Value<'v> {
    match val {
        serde_json::Value::Null => Value::new_none(),
        serde_json::Value::Bool(b) => Value::new_bool(b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                heap.alloc(i as i32)
            } else if let Some(f) = n.as_f64() {
                heap.alloc(f)
            } else {
                heap.alloc(n.to_string())
            }
        }
        serde_json::Value::String(s) => heap.alloc(s),
        serde_json::Value::Array(arr) => {
            let list: Vec<Value> = arr.into_iter().map(|v| serde_to_starlark(v, heap)).collect();
            heap.alloc(list)
        }
        serde_json::Value::Object(obj) => {
            let mut dict = SmallMap::with_capacity(obj.len());
            for (k, v) in obj {
                dict.insert_hashed(
                    heap.alloc(k).get_hashed().unwrap(),
                    serde_to_starlark(v, heap),
                );
            }
            heap.alloc(Dict::new(dict))
        }
    }
}
