//! Table-name resolution for declared types.
//!
//! The first match wins:
//! 1. an explicit registration (`[naming] tables` in `pgshift.toml`, or
//!    [`TableNameResolver::register`]);
//! 2. the `table` directive carried by the declaration itself;
//! 3. the default convention: the last path segment of the type name in
//!    `snake_case` (`HTTPRequest` -> `http_request`).
//!
//! The registry is owned by the caller; there is no process-wide state.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::config::NamingConfig;
use crate::db::validate_identifier;
use crate::error::Result;

/// Which rule produced a table name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NameSource {
    Registry,
    Directive,
    Convention,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedName {
    pub table: String,
    pub source: NameSource,
}

#[derive(Debug, Clone, Default)]
pub struct TableNameResolver {
    registry: BTreeMap<String, String>,
}

impl TableNameResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(naming: &NamingConfig) -> Self {
        TableNameResolver {
            registry: naming.tables.clone(),
        }
    }

    /// Register an explicit table name for a type. Later registrations replace earlier ones.
    pub fn register(&mut self, type_name: impl Into<String>, table: impl Into<String>) {
        self.registry.insert(type_name.into(), table.into());
    }

    /// Resolve the table name for `type_name`, validating the result as an identifier.
    pub fn resolve(&self, type_name: &str, directive: Option<&str>) -> Result<ResolvedName> {
        let resolved = if let Some(table) = self.registry.get(type_name) {
            ResolvedName {
                table: table.clone(),
                source: NameSource::Registry,
            }
        } else if let Some(table) = directive.map(str::trim).filter(|t| !t.is_empty()) {
            ResolvedName {
                table: table.to_string(),
                source: NameSource::Directive,
            }
        } else {
            ResolvedName {
                table: snake_case(type_name),
                source: NameSource::Convention,
            }
        };

        validate_identifier(&resolved.table)?;
        log::debug!(
            "Resolved table name; type={}, table={}, source={:?}",
            type_name,
            resolved.table,
            resolved.source
        );
        Ok(resolved)
    }
}

/// `app::models::UserAccount` -> `user_account`, `HTTPRequest` -> `http_request`.
pub fn snake_case(type_name: &str) -> String {
    let last = type_name
        .rsplit(|c| c == ':' || c == '.')
        .next()
        .unwrap_or(type_name);
    let chars: Vec<char> = last.chars().collect();

    let mut out = String::with_capacity(last.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if c.is_uppercase() {
            let prev = i.checked_sub(1).map(|p| chars[p]);
            let next = chars.get(i + 1).copied();
            let boundary = match prev {
                None | Some('_') => false,
                Some(p) if p.is_lowercase() || p.is_ascii_digit() => true,
                Some(p) if p.is_uppercase() => next.is_some_and(|n| n.is_lowercase()),
                _ => false,
            };
            if boundary {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snake_case() {
        assert_eq!(snake_case("User"), "user");
        assert_eq!(snake_case("UserAccount"), "user_account");
        assert_eq!(snake_case("HTTPRequest"), "http_request");
        assert_eq!(snake_case("OAuth2Token"), "o_auth2_token");
        assert_eq!(snake_case("app::models::LineItem"), "line_item");
        assert_eq!(snake_case("shop.Order"), "order");
        assert_eq!(snake_case("already_snake"), "already_snake");
    }

    #[test]
    fn test_registry_beats_directive_beats_convention() {
        let mut resolver = TableNameResolver::new();
        resolver.register("User", "accounts");

        let r = resolver.resolve("User", Some("people")).unwrap();
        assert_eq!(r.table, "accounts");
        assert_eq!(r.source, NameSource::Registry);

        let r = resolver.resolve("Post", Some("articles")).unwrap();
        assert_eq!(r.table, "articles");
        assert_eq!(r.source, NameSource::Directive);

        let r = resolver.resolve("BlogPost", None).unwrap();
        assert_eq!(r.table, "blog_post");
        assert_eq!(r.source, NameSource::Convention);
    }

    #[test]
    fn test_empty_directive_falls_through() {
        let resolver = TableNameResolver::new();
        let r = resolver.resolve("Comment", Some("  ")).unwrap();
        assert_eq!(r.table, "comment");
        assert_eq!(r.source, NameSource::Convention);
    }

    #[test]
    fn test_from_config() {
        let mut naming = NamingConfig::default();
        naming.tables.insert("Person".to_string(), "people".to_string());
        let resolver = TableNameResolver::from_config(&naming);
        assert_eq!(resolver.resolve("Person", None).unwrap().table, "people");
    }

    #[test]
    fn test_invalid_table_name_rejected() {
        let resolver = TableNameResolver::new();
        assert!(resolver.resolve("X", Some("bad name; drop")).is_err());
    }
}
