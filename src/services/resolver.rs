use anyhow::Result;

use crate::errors::PiError;
use crate::models::build::PackageBuild;
use crate::models::config::Config;
use crate::recipe::Recipe;
use crate::services::unarchiver::allowed_extensions;

/// All builds a recipe discovers for `name`, in the recipe's emission order.
pub fn list(
    config: &Config,
    recipe: &Recipe,
    pattern: &str,
    name: &str,
    version: &str,
) -> Result<Vec<PackageBuild>> {
    recipe.execute(config, name, version, Some(pattern))
}

/// Picks the single best build for the host.
///
/// Candidates are filtered in emission order: host os/arch, the release
/// channel (`stable` admits lts, `lts` is exact) or a literal version
/// prefix, and an archive format the host can extract. The first survivor
/// wins; recipes emit their preferred build first, so ordering ties are the
/// recipe author's contract.
pub fn resolve(
    config: &Config,
    recipe: &Recipe,
    pattern: &str,
    name: &str,
    version: &str,
) -> Result<PackageBuild> {
    let candidates = list(config, recipe, pattern, name, version)?;
    pick(config, name, version, candidates)
}

pub fn pick(
    config: &Config,
    name: &str,
    version: &str,
    candidates: Vec<PackageBuild>,
) -> Result<PackageBuild> {
    let host = config.host;
    let exts = allowed_extensions(host.os);

    candidates
        .into_iter()
        .find(|p| {
            if p.os != host.os || p.arch != host.arch {
                return false;
            }
            let channel_ok = match version {
                "stable" => matches!(p.release_status.as_str(), "stable" | "lts"),
                "lts" => p.release_status == "lts",
                "latest" | "" => true,
                prefix => p.version.starts_with(prefix),
            };
            channel_ok && exts.iter().any(|ext| p.filename.ends_with(ext))
        })
        .ok_or_else(|| {
            PiError::NoMatch {
                name: name.to_string(),
                version: version.to_string(),
                os: host.os,
                arch: host.arch,
            }
            .into()
        })
}
