use crate::errors::PiError;

/// A user-entered package reference: `[repo/]name[=version]`.
///
/// The name is opaque and may contain `:` (e.g. `pip:numpy`). Whether a
/// leading `first/` segment is a repo scope is only decidable against the
/// registered repo names, so parsing keeps the name whole and the repository
/// index splits it during resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRef {
    pub name: String,
    pub version: String,
}

impl PackageRef {
    pub fn parse(s: &str) -> Result<Self, PiError> {
        let (name, version) = match s.split_once('=') {
            Some((n, v)) => (n, v),
            None => (s, "latest"),
        };
        if name.is_empty() {
            return Err(PiError::validation("package ref", s));
        }
        Ok(Self {
            name: name.to_string(),
            version: if version.is_empty() {
                "latest".to_string()
            } else {
                version.to_string()
            },
        })
    }

    /// Splits off a `repo/` scope if the first segment names a known repo.
    pub fn scoped<'a>(&'a self, repo_names: &[String]) -> (Option<&'a str>, &'a str) {
        if let Some((first, rest)) = self.name.split_once('/') {
            if repo_names.iter().any(|n| n == first) {
                return (Some(first), rest);
            }
        }
        (None, &self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain() {
        let r = PackageRef::parse("nodejs").unwrap();
        assert_eq!(r.name, "nodejs");
        assert_eq!(r.version, "latest");
    }

    #[test]
    fn test_parse_with_version() {
        let r = PackageRef::parse("nodejs=20.11").unwrap();
        assert_eq!(r.name, "nodejs");
        assert_eq!(r.version, "20.11");
    }

    #[test]
    fn test_parse_manager_style_name() {
        let r = PackageRef::parse("pip:numpy=1.26").unwrap();
        assert_eq!(r.name, "pip:numpy");
        assert_eq!(r.version, "1.26");
    }

    #[test]
    fn test_parse_empty_is_error() {
        assert!(PackageRef::parse("").is_err());
        assert!(PackageRef::parse("=1.0").is_err());
    }

    #[test]
    fn test_scoped_requires_known_repo() {
        let r = PackageRef::parse("extra/go").unwrap();
        let known = vec!["builtin".to_string(), "extra".to_string()];
        assert_eq!(r.scoped(&known), (Some("extra"), "go"));
        let unknown = vec!["builtin".to_string()];
        assert_eq!(r.scoped(&unknown), (None, "extra/go"));
    }
}
