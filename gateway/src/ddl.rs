//! The precompiled DDL bundle and the feature-aware seeder.
//!
//! The bundle is a single immutable SQL blob loaded once at startup; it
//! creates every table any feature module needs. Seeding is selective:
//! only tables belonging to the session's selected feature modules get
//! rows.

use std::path::Path;

use anyhow::Context;

/// Built-in bundle used unless a path override is configured.
const EMBEDDED_BUNDLE: &str = include_str!("../sql/preview_schema.sql");

pub struct DdlBundle {
    sql: String,
}

impl DdlBundle {
    pub fn load(path_override: Option<&Path>) -> anyhow::Result<DdlBundle> {
        let sql = match path_override {
            Some(path) => std::fs::read_to_string(path)
                .with_context(|| format!("reading DDL bundle from {}", path.display()))?,
            None => EMBEDDED_BUNDLE.to_owned(),
        };
        if sql.trim().is_empty() {
            anyhow::bail!("DDL bundle is empty");
        }
        Ok(DdlBundle { sql })
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }
}

/// Seed rows per feature module. Statements run with the session schema
/// as search path, after the bundle has been replayed.
static MODULE_SEEDS: &[(&str, &[&str])] = &[
    (
        "core",
        &[
            "INSERT INTO app_users (email, display_name) VALUES \
             ('ada@preview.invalid', 'Ada Lovelace'), \
             ('grace@preview.invalid', 'Grace Hopper')",
            "INSERT INTO app_settings (key, value) VALUES \
             ('locale', '\"en-US\"'), ('currency', '\"USD\"')",
        ],
    ),
    (
        "ecommerce",
        &[
            "INSERT INTO products (sku, name, description, price_cents) VALUES \
             ('SKU-0001', 'Field Notebook', 'Dot-grid, 96 pages', 1250), \
             ('SKU-0002', 'Travel Mug', 'Vacuum insulated, 350ml', 2450), \
             ('SKU-0003', 'Desk Mat', 'Felt, 80x30cm', 3900)",
            "INSERT INTO carts (status) VALUES ('open')",
        ],
    ),
    (
        "booking",
        &[
            "INSERT INTO services (name, duration_min, price_cents) VALUES \
             ('Consultation', 30, 0), \
             ('Full assessment', 90, 12000)",
        ],
    ),
];

/// The seed statements for a feature selection. Core rows are always
/// seeded; module rows only when at least one selected feature belongs
/// to the module.
pub fn seed_statements_for(selected_features: &[String]) -> Vec<&'static str> {
    let mut statements = Vec::new();
    for (module, seeds) in MODULE_SEEDS {
        let wanted = *module == "core"
            || selected_features.iter().any(|feature| {
                feature == module
                    || feature
                        .strip_prefix(module)
                        .is_some_and(|rest| rest.starts_with('.'))
            });
        if wanted {
            statements.extend_from_slice(seeds);
        }
    }
    statements
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_bundle_loads() {
        let bundle = DdlBundle::load(None).unwrap();
        assert!(bundle.sql().contains("CREATE TABLE IF NOT EXISTS products"));
        assert!(bundle.sql().contains("CREATE TABLE IF NOT EXISTS services"));
    }

    #[test]
    fn seeder_is_feature_aware() {
        let seeds = seed_statements_for(&["ecommerce.products".to_owned()]);
        assert!(seeds.iter().any(|s| s.contains("INSERT INTO products")));
        assert!(!seeds.iter().any(|s| s.contains("INSERT INTO services")));
        // Core data always lands.
        assert!(seeds.iter().any(|s| s.contains("INSERT INTO app_users")));
    }

    #[test]
    fn module_level_feature_seeds_whole_module() {
        let seeds = seed_statements_for(&["booking".to_owned()]);
        assert!(seeds.iter().any(|s| s.contains("INSERT INTO services")));
    }

    #[test]
    fn unrelated_prefixes_do_not_match() {
        // "book" is not the booking module.
        let seeds = seed_statements_for(&["bookkeeping.ledgers".to_owned()]);
        assert!(!seeds.iter().any(|s| s.contains("INSERT INTO services")));
    }
}
