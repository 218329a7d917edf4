//! Variant fan-out: one server definition into concrete runtime variants

use crate::error::SupervisorError;
use crate::store::ServerConfig;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::warn;

/// One concrete, environment-specialized instance of a server
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Variant {
    /// Variant label (the env value); `None` for the implicit variant
    pub value: Option<String>,
    /// Environment overrides contributed by this variant
    pub env_overrides: BTreeMap<String, String>,
}

impl Variant {
    /// The single unlabeled variant of a server without env subdomains
    pub fn implicit() -> Self {
        Self {
            value: None,
            env_overrides: BTreeMap::new(),
        }
    }
}

/// Expand a definition into its variants.
///
/// Only the first declared axis is honored. No declared axes, an empty axis list,
/// or an axis with no values all yield the one implicit variant. Repeated
/// values are collapsed to their first occurrence.
pub fn resolve_variants(config: &ServerConfig) -> Vec<Variant> {
    let Some((var, values)) = config
        .env_subdomains
        .as_ref()
        .and_then(|axes| axes.first())
        .filter(|(_, values)| !values.is_empty())
    else {
        return vec![Variant::implicit()];
    };

    if config.env_subdomains.as_ref().is_some_and(|a| a.len() > 1) {
        warn!(
            server = %config.name,
            var,
            "Multiple env subdomain variables declared, only the first is used"
        );
    }

    let mut variants: Vec<Variant> = Vec::with_capacity(values.len());
    for value in values {
        if variants.iter().any(|v| v.value.as_deref() == Some(value.as_str())) {
            continue;
        }
        variants.push(Variant {
            value: Some(value.clone()),
            env_overrides: BTreeMap::from([(var.to_string(), value.clone())]),
        });
    }
    variants
}

/// Find the variant selected by `requested`.
///
/// `None` selects the implicit variant, which only exists when the server
/// declares no env subdomains.
pub fn find_variant(config: &ServerConfig, requested: Option<&str>) -> Result<Variant, SupervisorError> {
    let variants = resolve_variants(config);
    match requested {
        Some(value) => variants
            .into_iter()
            .find(|v| v.value.as_deref() == Some(value))
            .ok_or_else(|| SupervisorError::VariantNotFound {
                server: config.name.clone(),
                variant: value.to_string(),
            }),
        None => variants
            .into_iter()
            .find(|v| v.value.is_none())
            .ok_or_else(|| SupervisorError::VariantRequired(config.name.clone())),
    }
}
