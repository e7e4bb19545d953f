//! Feature gating: a static table mapping tenant URL prefixes to the
//! feature identifier a session must hold, and the admission rule.
//!
//! Paths missing from the table are core routes and always admitted.
//! The table is deliberately explicit configuration; prefixes are never
//! derived from the URL shape.

use preview_api::models::ResolvedSession;

/// `(url prefix, required feature)`, longest prefix wins.
static ROUTE_FEATURES: &[(&str, &str)] = &[
    ("/api/v1/ecommerce/products", "ecommerce.products"),
    ("/api/v1/ecommerce/cart", "ecommerce.cart"),
    ("/api/v1/ecommerce/checkout", "ecommerce.cart"),
    ("/api/v1/booking/services", "booking.services"),
];

/// The feature a request path requires, or `None` for core routes.
pub fn required_feature(path: &str) -> Option<&'static str> {
    ROUTE_FEATURES
        .iter()
        .filter(|(prefix, _)| {
            path == *prefix
                || path
                    .strip_prefix(prefix)
                    .is_some_and(|rest| rest.starts_with('/'))
        })
        .max_by_key(|(prefix, _)| prefix.len())
        .map(|(_, feature)| *feature)
}

/// Module portion of a dotted feature identifier.
fn module_of(feature: &str) -> &str {
    feature.split_once('.').map_or(feature, |(module, _)| module)
}

/// Whether a session holding `selected` may use routes requiring
/// `required`.
///
/// Admission: the exact feature; or the bare module when the
/// requirement is `module.sub` (a whole-module grant); or, when the
/// requirement is a bare module, any selected feature inside it.
/// Holding a sibling capability (`ecommerce.cart` against
/// `ecommerce.products`) grants nothing.
pub fn admits(selected: &[String], required: &str) -> bool {
    let module = module_of(required);
    selected.iter().any(|feature| {
        if feature == required {
            return true;
        }
        if required.contains('.') && feature == module {
            return true;
        }
        !required.contains('.')
            && feature
                .strip_prefix(module)
                .is_some_and(|rest| rest.starts_with('.'))
    })
}

/// Pipeline-facing check: `Ok(())` admits, `Err(feature)` carries the
/// refused requirement for logging. Callers must surface refusals as a
/// plain 404.
pub fn check_access(session: &ResolvedSession, path: &str) -> Result<(), &'static str> {
    match required_feature(path) {
        None => Ok(()),
        Some(required) => {
            if admits(&session.selected_features, required) {
                Ok(())
            } else {
                Err(required)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn unmapped_paths_are_core() {
        assert_eq!(required_feature("/api/v1/session"), None);
        assert_eq!(required_feature("/api/v1/ecommerce"), None);
        assert_eq!(required_feature("/health"), None);
    }

    #[test]
    fn prefix_matching_requires_a_segment_boundary() {
        assert_eq!(
            required_feature("/api/v1/ecommerce/products/42"),
            Some("ecommerce.products")
        );
        // No accidental match on a shared string prefix.
        assert_eq!(required_feature("/api/v1/ecommerce/productions"), None);
    }

    #[test]
    fn exact_feature_admits() {
        assert!(admits(&features(&["ecommerce.products"]), "ecommerce.products"));
    }

    #[test]
    fn module_grant_admits_submodule_requirement() {
        assert!(admits(&features(&["ecommerce"]), "ecommerce.products"));
    }

    #[test]
    fn sibling_feature_does_not_admit() {
        assert!(!admits(&features(&["ecommerce.cart"]), "ecommerce.products"));
        assert!(!admits(&features(&["booking.services"]), "ecommerce.products"));
    }

    #[test]
    fn bare_module_requirement_admits_any_member_feature() {
        assert!(admits(&features(&["ecommerce.cart"]), "ecommerce"));
        assert!(!admits(&features(&["bookkeeping.ledgers"]), "booking"));
    }

    #[test]
    fn empty_selection_admits_nothing_mapped() {
        assert!(!admits(&[], "ecommerce.products"));
    }
}
