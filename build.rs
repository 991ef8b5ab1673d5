use std::fs;
use std::path::Path;
use std::process::Command;

fn main() {
    let version = Command::new("git")
        .args(&["describe", "--always", "--dirty", "--tags"])
        .output()
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    let date = Command::new("date")
        .output()
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    println!("cargo:rustc-env=BUILD_VERSION={}", version);
    println!("cargo:rustc-env=BUILD_DATE={}", date);

    embed_builtin_recipes();

    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=recipes");
    println!("cargo:rerun-if-changed=.git/HEAD");
}

/// Generates the static table of bundled `recipes/*.star` sources backing the
/// `builtin://` repository.
fn embed_builtin_recipes() {
    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").unwrap();
    let recipe_dir = Path::new(&manifest_dir).join("recipes");

    let mut names = Vec::new();
    if let Ok(entries) = fs::read_dir(&recipe_dir) {
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().map_or(false, |ext| ext == "star") {
                names.push(path.file_name().unwrap().to_string_lossy().into_owned());
            }
        }
    }
    names.sort();

    let mut code = String::new();
    code.push_str("pub static BUILTIN_RECIPES: &[(&str, &str)] = &[\n");
    for name in &names {
        code.push_str(&format!(
            "    ({:?}, include_str!(concat!(env!(\"CARGO_MANIFEST_DIR\"), \"/recipes/{}\"))),\n",
            name, name
        ));
    }
    code.push_str("];\n");

    let out_dir = std::env::var("OUT_DIR").unwrap();
    fs::write(Path::new(&out_dir).join("builtin_recipes.rs"), code)
        .expect("Failed to write builtin recipe table");
}
