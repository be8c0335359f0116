use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use core_types::SymbolConfig;
use execution_perp::AccountGateway;

use crate::state::SymbolState;

/// Load the symbols file, canonicalise instrument names against the
/// gateway's alias map and build per-instrument state. Any invalid entry is
/// fatal; unknown instruments include near-miss suggestions.
pub fn load_symbol_states(
    path: &Path,
    gateway: &AccountGateway,
) -> Result<BTreeMap<String, SymbolState>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read symbols file {}", path.display()))?;
    let entries: Vec<SymbolConfig> = serde_json::from_str(&raw)
        .with_context(|| format!("invalid symbols file json {}", path.display()))?;
    if entries.is_empty() {
        bail!("symbols file must be a non-empty json array: {}", path.display());
    }
    let mut states = BTreeMap::new();
    for mut config in entries {
        let raw_instrument = config.instrument.clone();
        let Some(resolved) = gateway.resolve_instrument(&raw_instrument) else {
            let suggestions = gateway.suggest_instruments(&raw_instrument, 6);
            if suggestions.is_empty() {
                bail!("unknown instrument '{raw_instrument}'");
            }
            bail!(
                "unknown instrument '{raw_instrument}', maybe: {}",
                suggestions.join(", ")
            );
        };
        if resolved != raw_instrument {
            tracing::info!(from = %raw_instrument, to = %resolved, "normalized instrument");
        }
        config.instrument = resolved.clone();
        config.validate().map_err(anyhow::Error::msg)?;
        states.insert(resolved, SymbolState::new(config));
    }
    Ok(states)
}
